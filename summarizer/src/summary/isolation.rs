use crate::metadata::{has_isolated_channels, ContainerRuntimeMetadata};
use crate::path::validate_component;
use crate::Error;

use super::{
    SummaryObject, SummaryStats, SummaryTreeBuilder, CHANNELS_TREE_NAME, METADATA_BLOB_NAME,
    RESERVED_ROOT_NAMES,
};

/// Checks an id for use as a data store (a direct child of the root).
pub fn validate_data_store_id(id: &str) -> Result<(), Error> {
    validate_component(id)?;
    if RESERVED_ROOT_NAMES.contains(&id) {
        return Err(Error::ReservedNameConflict(id.to_string()));
    }
    Ok(())
}

/// How the children of isolating nodes are laid out in a document's summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentLayout {
    metadata: Option<ContainerRuntimeMetadata>,
}

impl DocumentLayout {
    /// The layout of a document created by this runtime.
    pub fn for_new_document(disable_isolated_channels: bool) -> Self {
        if disable_isolated_channels {
            // Legacy documents carry no metadata blob at all.
            Self { metadata: None }
        } else {
            Self {
                metadata: Some(ContainerRuntimeMetadata::current()),
            }
        }
    }

    /// The layout of a document loaded with the given `.metadata` contents.
    pub fn from_metadata(metadata: Option<ContainerRuntimeMetadata>) -> Self {
        Self { metadata }
    }

    pub fn metadata(&self) -> Option<&ContainerRuntimeMetadata> {
        self.metadata.as_ref()
    }

    pub fn isolated_channels(&self) -> bool {
        has_isolated_channels(self.metadata.as_ref())
    }

    /// Writes the `.metadata` blob, if the layout has any.
    pub fn add_metadata(&self, builder: &mut SummaryTreeBuilder) -> Result<(), Error> {
        if let Some(metadata) = &self.metadata {
            builder.add_blob(METADATA_BLOB_NAME, metadata.to_blob()?)?;
        }
        Ok(())
    }
}

/// Adds child summaries to `builder`, nested under `.channels` if `isolated`.
pub fn add_children(
    builder: &mut SummaryTreeBuilder,
    isolated: bool,
    children: impl IntoIterator<Item = (String, SummaryObject, SummaryStats)>,
) -> Result<(), Error> {
    if !isolated {
        for (id, object, stats) in children {
            builder.add_with_stats(id, object, stats)?;
        }
        return Ok(());
    }

    let mut channels = SummaryTreeBuilder::new();
    for (id, object, stats) in children {
        channels.add_with_stats(id, object, stats)?;
    }
    builder.add_tree(CHANNELS_TREE_NAME, channels.summary())
}

/// The location of a child's summary, given the location of its parent.
/// The root's summary lives at the empty path.
pub fn child_summary_path(parent_summary_path: &str, isolated: bool, id: &str) -> String {
    if isolated {
        format!("{parent_summary_path}/{CHANNELS_TREE_NAME}/{id}")
    } else {
        format!("{parent_summary_path}/{id}")
    }
}
