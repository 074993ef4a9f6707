//! The write-side summary tree, its aggregate statistics and the builder used
//! to assemble it.
use std::collections::BTreeMap;

use bytes::Bytes;
use data_encoding::BASE64;
use serde::{Deserialize, Serialize};

use crate::Error;

mod isolation;

pub use self::isolation::{add_children, child_summary_path, validate_data_store_id, DocumentLayout};

/// Children of an isolating node are nested under this tree.
pub const CHANNELS_TREE_NAME: &str = ".channels";
/// Root blob holding [crate::metadata::ContainerRuntimeMetadata].
pub const METADATA_BLOB_NAME: &str = ".metadata";
/// Root blob reserved for op chunks.
pub const CHUNKS_BLOB_NAME: &str = ".chunks";
/// Root tree reserved for attachment blobs.
pub const BLOBS_TREE_NAME: &str = ".blobs";
/// Root tree of the protocol state.
pub const PROTOCOL_TREE_NAME: &str = ".protocol";
/// A data store's attributes blob.
pub const DATA_STORE_ATTRIBUTES_BLOB_NAME: &str = ".component";
/// A channel's attributes blob.
pub const CHANNEL_ATTRIBUTES_BLOB_NAME: &str = ".attributes";

/// Top-level names which never denote a data store, used to tell data stores
/// apart in layouts without a `.channels` tree.
pub const NON_DATA_STORE_PATHS: [&str; 4] = [PROTOCOL_TREE_NAME, ".logTail", ".serviceProtocol", BLOBS_TREE_NAME];

/// Names carved out of the root namespace.
pub const RESERVED_ROOT_NAMES: [&str; 7] = [
    METADATA_BLOB_NAME,
    CHUNKS_BLOB_NAME,
    BLOBS_TREE_NAME,
    CHANNELS_TREE_NAME,
    PROTOCOL_TREE_NAME,
    ".logTail",
    ".serviceProtocol",
];

/// A node of a summary tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SummaryObject {
    Blob(SummaryBlob),
    Tree(SummaryTree),
    /// Points at an unchanged object of the previous summary.
    Handle(SummaryHandle),
}

/// Opaque serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireBlob", into = "WireBlob")]
pub struct SummaryBlob {
    pub content: Bytes,
}

impl SummaryBlob {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

#[derive(Serialize, Deserialize)]
enum BlobEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

/// Blobs go over the wire as text where possible.
#[derive(Serialize, Deserialize)]
struct WireBlob {
    content: String,
    encoding: BlobEncoding,
}

impl From<SummaryBlob> for WireBlob {
    fn from(value: SummaryBlob) -> Self {
        match std::str::from_utf8(&value.content) {
            Ok(s) => WireBlob {
                content: s.to_string(),
                encoding: BlobEncoding::Utf8,
            },
            Err(_) => WireBlob {
                content: BASE64.encode(&value.content),
                encoding: BlobEncoding::Base64,
            },
        }
    }
}

impl TryFrom<WireBlob> for SummaryBlob {
    type Error = data_encoding::DecodeError;

    fn try_from(value: WireBlob) -> Result<Self, Self::Error> {
        Ok(match value.encoding {
            BlobEncoding::Utf8 => SummaryBlob::new(value.content),
            BlobEncoding::Base64 => SummaryBlob::new(BASE64.decode(value.content.as_bytes())?),
        })
    }
}

/// A mapping from name to [SummaryObject].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryTree {
    pub tree: BTreeMap<String, SummaryObject>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unreferenced: bool,
}

impl SummaryTree {
    pub fn get(&self, name: &str) -> Option<&SummaryObject> {
        self.tree.get(name)
    }

    /// Returns the subtree with the given name, if it is a tree.
    pub fn subtree(&self, name: &str) -> Option<&SummaryTree> {
        match self.tree.get(name) {
            Some(SummaryObject::Tree(tree)) => Some(tree),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleType {
    Blob,
    Tree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryHandle {
    /// Path of the referenced object in the previous summary.
    pub handle: String,
    pub handle_type: HandleType,
}

/// Aggregate statistics of a summary (sub)tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    pub tree_node_count: u64,
    pub blob_node_count: u64,
    pub handle_node_count: u64,
    pub total_blob_size: u64,
    pub unreferenced_node_count: u64,
}

impl SummaryStats {
    /// Calculates the statistics of an object and everything below it.
    pub fn calculate(object: &SummaryObject) -> Self {
        let mut stats = SummaryStats::default();
        stats.add_object(object);
        stats
    }

    fn add_object(&mut self, object: &SummaryObject) {
        match object {
            SummaryObject::Blob(blob) => {
                self.blob_node_count += 1;
                self.total_blob_size += blob.content.len() as u64;
            }
            SummaryObject::Handle(_) => self.handle_node_count += 1,
            SummaryObject::Tree(tree) => {
                self.tree_node_count += 1;
                if tree.unreferenced {
                    self.unreferenced_node_count += 1;
                }
                for child in tree.tree.values() {
                    self.add_object(child);
                }
            }
        }
    }
}

impl std::ops::AddAssign for SummaryStats {
    fn add_assign(&mut self, rhs: Self) {
        self.tree_node_count += rhs.tree_node_count;
        self.blob_node_count += rhs.blob_node_count;
        self.handle_node_count += rhs.handle_node_count;
        self.total_blob_size += rhs.total_blob_size;
        self.unreferenced_node_count += rhs.unreferenced_node_count;
    }
}

/// A summary tree together with its statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryTreeWithStats {
    pub summary: SummaryTree,
    pub stats: SummaryStats,
}

impl From<SummaryTree> for SummaryTreeWithStats {
    fn from(summary: SummaryTree) -> Self {
        let mut stats = SummaryStats::default();
        for child in summary.tree.values() {
            stats += SummaryStats::calculate(child);
        }
        stats.tree_node_count += 1;
        if summary.unreferenced {
            stats.unreferenced_node_count += 1;
        }
        Self { summary, stats }
    }
}

/// Assembles a [SummaryTree], keeping the statistics up to date.
#[derive(Debug, Default)]
pub struct SummaryTreeBuilder {
    tree: BTreeMap<String, SummaryObject>,
    stats: SummaryStats,
    unreferenced: bool,
}

impl SummaryTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the entries of an existing tree. Statistics are recomputed
    /// from the contents.
    pub fn from_tree(tree: SummaryTree) -> Self {
        let mut builder = Self {
            unreferenced: tree.unreferenced,
            ..Default::default()
        };
        for (key, object) in tree.tree {
            builder.stats += SummaryStats::calculate(&object);
            builder.tree.insert(key, object);
        }
        builder
    }

    fn insert(&mut self, key: String, object: SummaryObject, stats: SummaryStats) -> Result<(), Error> {
        if self.tree.contains_key(&key) {
            return Err(Error::DuplicateSummaryEntry(key));
        }
        self.tree.insert(key, object);
        self.stats += stats;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tree.contains_key(key)
    }

    pub fn add_blob(&mut self, key: impl Into<String>, content: impl Into<Bytes>) -> Result<(), Error> {
        let object = SummaryObject::Blob(SummaryBlob::new(content));
        let stats = SummaryStats::calculate(&object);
        self.insert(key.into(), object, stats)
    }

    pub fn add_handle(
        &mut self,
        key: impl Into<String>,
        handle_type: HandleType,
        handle: impl Into<String>,
    ) -> Result<(), Error> {
        let object = SummaryObject::Handle(SummaryHandle {
            handle: handle.into(),
            handle_type,
        });
        let stats = SummaryStats::calculate(&object);
        self.insert(key.into(), object, stats)
    }

    pub fn add_tree(&mut self, key: impl Into<String>, tree: SummaryTreeWithStats) -> Result<(), Error> {
        self.insert(key.into(), SummaryObject::Tree(tree.summary), tree.stats)
    }

    /// Adds an object whose statistics were already computed.
    pub fn add_with_stats(
        &mut self,
        key: impl Into<String>,
        object: SummaryObject,
        stats: SummaryStats,
    ) -> Result<(), Error> {
        self.insert(key.into(), object, stats)
    }

    /// Flags the tree being built as unreferenced.
    pub fn mark_unreferenced(&mut self, unreferenced: bool) {
        self.unreferenced = unreferenced;
    }

    /// Finishes the tree. The tree itself counts as one tree node.
    pub fn summary(self) -> SummaryTreeWithStats {
        let mut stats = self.stats;
        stats.tree_node_count += 1;
        if self.unreferenced {
            stats.unreferenced_node_count += 1;
        }
        SummaryTreeWithStats {
            summary: SummaryTree {
                tree: self.tree,
                unreferenced: self.unreferenced,
            },
            stats,
        }
    }
}
