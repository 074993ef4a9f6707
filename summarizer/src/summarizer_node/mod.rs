//! The summarizer node tree.
//!
//! Every collaborative object (the container runtime, its data stores and
//! their channels) owns one node. A node decides whether its cached summary
//! and GC data can be reused, or whether it needs to ask its providers to
//! recompute them. Nodes live in an arena owned by [SummarizerNodeTree]; they
//! are addressed through [SummarizerNodeHandle]s.
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::gc::GCData;
use crate::snapshot::SnapshotTree;
use crate::summary::{SummaryObject, SummaryStats, SummaryTreeWithStats};
use crate::Error;

mod arena;
mod handle;
mod tree;

pub use self::handle::SummarizerNodeHandle;
pub use self::tree::{SummarizeOptions, SummarizerNodeTree, SummarizerNodeTreeBuilder, TreeSummary};

/// The role of a node, derived from its depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    ContainerRuntime,
    DataStore,
    /// A channel, or a node nested inside one.
    Channel,
}

impl NodeKind {
    pub fn child_kind(self) -> NodeKind {
        match self {
            NodeKind::ContainerRuntime => NodeKind::DataStore,
            NodeKind::DataStore | NodeKind::Channel => NodeKind::Channel,
        }
    }

    /// Whether children of this kind of node are nested under `.channels`
    /// in documents using isolated channels.
    pub fn isolates_children(self) -> bool {
        matches!(self, NodeKind::ContainerRuntime | NodeKind::DataStore)
    }
}

/// Where a node's initial state comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationSource {
    /// Loaded from the summary the parent was loaded from. The parent's
    /// snapshot must contain a subtree for the node.
    FromExistingSummary,
    /// Created by a remote attach operation, carrying the attached snapshot.
    FromAttachOperation {
        sequence_number: u64,
        snapshot: SnapshotTree,
    },
    CreatedLocally,
}

/// The last summary of a node acknowledged by [SummarizerNodeTree::complete_summary].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestSummary {
    pub reference_sequence_number: u64,
    /// Path of the node's tree inside that summary.
    pub handle: String,
}

/// What a node's summarize provider returns for the node's own state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarizeInternalResult {
    pub id: String,
    pub summary: SummaryTreeWithStats,
}

/// Serializes the state owned by a single node, not including its children.
#[async_trait]
pub trait SummarizeInternal: Send + Sync {
    async fn summarize_internal(
        &self,
        full_tree: bool,
        track_state: bool,
    ) -> Result<SummarizeInternalResult, Error>;
}

/// Computes the outbound references of a node's own state.
///
/// Node ids are relative to the node, so `/` is the node itself.
#[async_trait]
pub trait GCDataProvider: Send + Sync {
    async fn gc_data(&self, full_gc: bool) -> Result<GCData, Error>;
}

/// Hands out the GC data a node was loaded with, if any.
#[async_trait]
pub trait InitialGCDataProvider: Send + Sync {
    async fn initial_gc_data(&self) -> Result<Option<GCData>, Error>;
}

/// The capabilities a node is created with. All of them are optional, a node
/// lacking one fails only once it actually needs it.
#[derive(Clone, Default)]
pub struct NodeProviders {
    pub summarize: Option<Arc<dyn SummarizeInternal>>,
    pub gc_data: Option<Arc<dyn GCDataProvider>>,
    pub initial_gc_data: Option<Arc<dyn InitialGCDataProvider>>,
}

impl NodeProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_summarize(mut self, summarize: Arc<dyn SummarizeInternal>) -> Self {
        self.summarize = Some(summarize);
        self
    }

    pub fn with_gc_data(mut self, gc_data: Arc<dyn GCDataProvider>) -> Self {
        self.gc_data = Some(gc_data);
        self
    }

    pub fn with_initial_gc_data(mut self, initial_gc_data: Arc<dyn InitialGCDataProvider>) -> Self {
        self.initial_gc_data = Some(initial_gc_data);
        self
    }
}

impl std::fmt::Debug for NodeProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeProviders")
            .field("summarize", &self.summarize.is_some())
            .field("gc_data", &self.gc_data.is_some())
            .field("initial_gc_data", &self.initial_gc_data.is_some())
            .finish()
    }
}

/// The summary of a node and its subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeResult {
    pub id: String,
    pub summary: SummaryObject,
    pub stats: SummaryStats,
    pub gc_data: GCData,
}
