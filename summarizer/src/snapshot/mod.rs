//! The read side: snapshots of previously written summaries, and the storage
//! they are read from.
use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::metadata::ContainerRuntimeMetadata;
use crate::summary::{SummaryTree, CHANNELS_TREE_NAME, METADATA_BLOB_NAME, NON_DATA_STORE_PATHS};
use crate::Error;

mod memory;

pub use self::memory::MemorySnapshotStorage;

/// A stored summary tree. Blobs are referenced by their content id, and need
/// to be fetched from a [SnapshotStorage].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTree {
    #[serde(default)]
    pub blobs: BTreeMap<String, String>,

    #[serde(default)]
    pub trees: BTreeMap<String, SnapshotTree>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unreferenced: bool,
}

impl SnapshotTree {
    pub fn subtree(&self, name: &str) -> Option<&SnapshotTree> {
        self.trees.get(name)
    }

    /// Walks down a `/`-separated summary path. The empty path is `self`.
    pub fn descend(&self, summary_path: &str) -> Option<&SnapshotTree> {
        summary_path
            .split('/')
            .filter(|c| !c.is_empty())
            .try_fold(self, |tree, name| tree.subtree(name))
    }
}

/// Persists summaries and hands out their blobs.
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Reads a blob by its content id. Returns Ok(None) if it does not exist.
    async fn read_blob(&self, id: &str) -> Result<Option<Bytes>, Error>;

    /// Writes a summary, resolving its handles against `previous`, and returns
    /// the resulting snapshot.
    async fn write_summary(
        &self,
        summary: &SummaryTree,
        previous: Option<&SnapshotTree>,
    ) -> Result<SnapshotTree, Error>;
}

/// Reads a named blob of `tree`. Returns Ok(None) if the tree has no such entry.
pub async fn read_named_blob(
    storage: &dyn SnapshotStorage,
    tree: &SnapshotTree,
    name: &str,
) -> Result<Option<Bytes>, Error> {
    let Some(id) = tree.blobs.get(name) else {
        return Ok(None);
    };
    match storage.read_blob(id).await? {
        Some(contents) => Ok(Some(contents)),
        None => Err(Error::StorageError(format!(
            "blob {name} ({id}) is referenced but missing"
        ))),
    }
}

/// Reads the `.metadata` blob at the root of a document snapshot.
pub async fn read_container_metadata(
    storage: &dyn SnapshotStorage,
    snapshot: &SnapshotTree,
) -> Result<Option<ContainerRuntimeMetadata>, Error> {
    read_named_blob(storage, snapshot, METADATA_BLOB_NAME)
        .await?
        .map(|contents| ContainerRuntimeMetadata::from_blob(&contents))
        .transpose()
}

/// The subtree holding the children of `tree`.
fn children_tree(tree: &SnapshotTree, isolated: bool) -> Option<&SnapshotTree> {
    if isolated {
        tree.subtree(CHANNELS_TREE_NAME)
    } else {
        Some(tree)
    }
}

/// Lists the data stores of a document snapshot.
pub fn data_store_ids(snapshot: &SnapshotTree, isolated: bool) -> Vec<String> {
    let Some(children) = children_tree(snapshot, isolated) else {
        return Vec::new();
    };
    children
        .trees
        .keys()
        .filter(|id| isolated || !NON_DATA_STORE_PATHS.contains(&id.as_str()))
        .cloned()
        .collect()
}

/// Lists the channels of a data store snapshot.
pub fn channel_ids(data_store: &SnapshotTree, isolated: bool) -> Vec<String> {
    children_tree(data_store, isolated)
        .map(|children| children.trees.keys().cloned().collect())
        .unwrap_or_default()
}

/// The snapshot subtree of a child node.
pub fn child_subtree<'a>(
    parent: &'a SnapshotTree,
    isolated: bool,
    id: &str,
) -> Option<&'a SnapshotTree> {
    children_tree(parent, isolated)?.subtree(id)
}

#[cfg(test)]
mod tests {
    use super::{channel_ids, child_subtree, data_store_ids, SnapshotTree};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn tree(trees: &[(&str, SnapshotTree)]) -> SnapshotTree {
        SnapshotTree {
            blobs: BTreeMap::new(),
            trees: trees
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            unreferenced: false,
        }
    }

    #[test]
    fn isolated_discovery() {
        let ds = tree(&[(".channels", tree(&[("root", tree(&[]))]))]);
        let snapshot = tree(&[
            (".channels", tree(&[("default", ds.clone())])),
            (".protocol", tree(&[])),
        ]);

        assert_eq!(vec!["default"], data_store_ids(&snapshot, true));
        assert_eq!(vec!["root"], channel_ids(&ds, true));
        assert_eq!(Some(&ds), child_subtree(&snapshot, true, "default"));
        assert_eq!(Some(&tree(&[])), snapshot.descend("/.channels/default/.channels/root"));
    }

    #[test]
    fn legacy_discovery() {
        let ds = tree(&[("root", tree(&[]))]);
        let snapshot = tree(&[
            ("default", ds.clone()),
            (".protocol", tree(&[])),
            (".logTail", tree(&[])),
            (".serviceProtocol", tree(&[])),
            (".blobs", tree(&[])),
        ]);

        assert_eq!(vec!["default"], data_store_ids(&snapshot, false));
        assert_eq!(vec!["root"], channel_ids(&ds, false));
        assert_eq!(Some(&ds), snapshot.descend("/default"));
        assert_eq!(None, snapshot.descend("/missing"));
        assert!(data_store_ids(&tree(&[]), true).is_empty());
    }
}
