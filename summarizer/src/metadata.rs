//! The reserved metadata blobs of a summary and their format versions.
//!
//! Format versions were historically written as absent, the strings `"0.1"` /
//! `"0.2"` or integers. [FormatVersionTag::normalized] maps all of them onto a
//! single integer scale, and feature checks compare against that scale only.
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// The summary format version written into the `.metadata` blob of new documents.
pub const CURRENT_CONTAINER_SUMMARY_FORMAT_VERSION: u32 = 1;

/// The summary format version written into the attributes of new data stores.
pub const CURRENT_DATA_STORE_SUMMARY_FORMAT_VERSION: u32 = 2;

/// From this (normalized) data store version on, `pkg` holds a JSON array.
pub const PACKAGE_PATH_AS_JSON_ARRAY_VERSION: u32 = 1;

/// From this (normalized) container version on, data stores live under `.channels`.
pub const ISOLATED_CHANNELS_CONTAINER_VERSION: u32 = 1;

/// From this (normalized) data store version on, channels live under `.channels`.
pub const ISOLATED_CHANNELS_DATA_STORE_VERSION: u32 = 2;

/// A format version tag as found in metadata and attribute blobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FormatVersionTag {
    /// No version was recorded.
    #[default]
    Absent,
    /// The snapshot-era `"0.1"` string.
    Snapshot01,
    /// The snapshot-era `"0.2"` string.
    Snapshot02,
    /// A summary-era integer version.
    Numbered(u32),
}

impl FormatVersionTag {
    /// Maps the tag onto the monotonic integer scale.
    pub const fn normalized(self) -> u32 {
        match self {
            FormatVersionTag::Absent => 0,
            FormatVersionTag::Snapshot01 => 1,
            FormatVersionTag::Snapshot02 => 2,
            FormatVersionTag::Numbered(n) => n,
        }
    }

    /// Whether a feature introduced at `threshold` is available.
    pub const fn at_least(self, threshold: u32) -> bool {
        self.normalized() >= threshold
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, FormatVersionTag::Absent)
    }
}

impl TryFrom<&str> for FormatVersionTag {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "0.1" => Ok(FormatVersionTag::Snapshot01),
            "0.2" => Ok(FormatVersionTag::Snapshot02),
            other => Err(Error::UnknownFormatVersion(other.to_string())),
        }
    }
}

impl Serialize for FormatVersionTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FormatVersionTag::Absent => serializer.serialize_none(),
            FormatVersionTag::Snapshot01 => serializer.serialize_str("0.1"),
            FormatVersionTag::Snapshot02 => serializer.serialize_str("0.2"),
            FormatVersionTag::Numbered(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for FormatVersionTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Numbered(u32),
            Tag(String),
        }

        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(FormatVersionTag::Absent),
            Some(Raw::Numbered(n)) => Ok(FormatVersionTag::Numbered(n)),
            Some(Raw::Tag(s)) => FormatVersionTag::try_from(s.as_str()).map_err(de::Error::custom),
        }
    }
}

fn is_false(b: &bool) -> bool {
    !b
}

/// The contents of the `.metadata` blob at the root of a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRuntimeMetadata {
    #[serde(default, skip_serializing_if = "FormatVersionTag::is_absent")]
    pub summary_format_version: FormatVersionTag,

    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_isolated_channels: bool,
}

impl ContainerRuntimeMetadata {
    /// The metadata written for a new document using isolated channels.
    pub fn current() -> Self {
        Self {
            summary_format_version: FormatVersionTag::Numbered(
                CURRENT_CONTAINER_SUMMARY_FORMAT_VERSION,
            ),
            disable_isolated_channels: false,
        }
    }

    pub fn from_blob(contents: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(contents)?)
    }

    pub fn to_blob(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Whether a document with the given metadata nests its data stores under
/// `.channels`. Documents without metadata predate isolation.
pub fn has_isolated_channels(metadata: Option<&ContainerRuntimeMetadata>) -> bool {
    metadata.is_some_and(|m| {
        m.summary_format_version
            .at_least(ISOLATED_CHANNELS_CONTAINER_VERSION)
            && !m.disable_isolated_channels
    })
}

/// The contents of a data store's `.component` blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreAttributes {
    /// The package path, encoded according to the format version.
    pub pkg: String,

    #[serde(default, skip_serializing_if = "FormatVersionTag::is_absent")]
    pub snapshot_format_version: FormatVersionTag,

    #[serde(default, skip_serializing_if = "FormatVersionTag::is_absent")]
    pub summary_format_version: FormatVersionTag,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_root_data_store: Option<bool>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_isolated_channels: bool,
}

impl DataStoreAttributes {
    /// Attributes for a data store written in the current format, or the
    /// legacy one if `isolated_channels` is false.
    pub fn new(
        package_path: &[String],
        is_root_data_store: bool,
        isolated_channels: bool,
    ) -> Result<Self, Error> {
        let pkg = serde_json::to_string(package_path)?;
        Ok(if isolated_channels {
            Self {
                pkg,
                snapshot_format_version: FormatVersionTag::Absent,
                summary_format_version: FormatVersionTag::Numbered(
                    CURRENT_DATA_STORE_SUMMARY_FORMAT_VERSION,
                ),
                is_root_data_store: Some(is_root_data_store),
                disable_isolated_channels: false,
            }
        } else {
            Self {
                pkg,
                snapshot_format_version: FormatVersionTag::Snapshot01,
                summary_format_version: FormatVersionTag::Absent,
                is_root_data_store: Some(is_root_data_store),
                disable_isolated_channels: false,
            }
        })
    }

    pub fn from_blob(contents: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(contents)?)
    }

    pub fn to_blob(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// The normalized format version. The summary-era tag wins over the
    /// snapshot-era one.
    pub fn format_version(&self) -> u32 {
        if !self.summary_format_version.is_absent() {
            self.summary_format_version.normalized()
        } else {
            self.snapshot_format_version.normalized()
        }
    }

    /// Decodes the package path.
    ///
    /// Before [PACKAGE_PATH_AS_JSON_ARRAY_VERSION], `pkg` usually holds a
    /// single plain package name, but some writers already stored a JSON array.
    pub fn package_path(&self) -> Result<Vec<String>, Error> {
        if self.format_version() >= PACKAGE_PATH_AS_JSON_ARRAY_VERSION
            || self.pkg.starts_with("[\"")
        {
            Ok(serde_json::from_str(&self.pkg)?)
        } else {
            Ok(vec![self.pkg.clone()])
        }
    }

    /// Data stores created before the root data store flag was tracked are
    /// considered root data stores.
    pub fn is_root_data_store(&self) -> bool {
        self.is_root_data_store.unwrap_or(true)
    }

    pub fn has_isolated_channels(&self) -> bool {
        self.format_version() >= ISOLATED_CHANNELS_DATA_STORE_VERSION
            && !self.disable_isolated_channels
    }
}

/// The contents of a channel's `.attributes` blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAttributes {
    #[serde(rename = "type")]
    pub channel_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_format_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_version: Option<String>,
}

impl ChannelAttributes {
    pub fn new(channel_type: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            snapshot_format_version: Some("0.1".to_string()),
            package_version: None,
        }
    }

    pub fn from_blob(contents: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(contents)?)
    }

    pub fn to_blob(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}
