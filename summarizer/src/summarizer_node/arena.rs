use std::collections::BTreeMap;

use tracing::trace;

use super::{CreationSource, LatestSummary, NodeKind, NodeProviders};
use crate::config::GcConfig;
use crate::gc::{GCData, GarbageCollector, UnreferencedState};
use crate::path::NodePath;
use crate::snapshot::SnapshotTree;
use crate::summary::{child_summary_path, DocumentLayout};
use crate::Error;

/// Index of a node in the arena. Slots are never reused, so an index of a
/// removed node stays dangling instead of pointing to another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct NodeIndex(usize);

#[derive(Debug, Clone, Default)]
pub(crate) enum InitialGCData {
    #[default]
    NotLoaded,
    Loaded(Option<GCData>),
}

#[derive(Debug, Default)]
pub(crate) struct GCCache {
    /// The combined GC data of the node and its subtree.
    pub cached: Option<GCData>,
    pub initial: InitialGCData,
    /// Bumped on every invalidation. A computation started before an
    /// invalidation must not populate the cache.
    pub epoch: u64,
}

impl GCCache {
    pub fn invalidate(&mut self) {
        self.cached = None;
        self.epoch += 1;
    }

    /// Initial data describes the graph as loaded. Once the node's references
    /// were computed again, or its structure changed, it must not be used.
    pub fn retire_initial(&mut self) {
        self.initial = InitialGCData::Loaded(None);
    }
}

#[derive(Debug)]
pub(crate) struct NodeEntry {
    pub id: String,
    pub path: NodePath,
    /// Location of the node's tree in the summary being written.
    pub summary_path: String,
    pub kind: NodeKind,
    pub parent: Option<NodeIndex>,
    pub children: BTreeMap<String, NodeIndex>,

    pub change_sequence_number: u64,
    pub gc_change_sequence_number: u64,
    pub latest_summary: Option<LatestSummary>,
    pub gc: GCCache,

    pub creation_source: CreationSource,
    pub base_snapshot: Option<SnapshotTree>,

    pub unreferenced_state: UnreferencedState,
    /// Set when the summary needs to be rewritten even though no op changed
    /// the node (different unreferenced flag, detached or renamed children).
    pub summary_stale: bool,
    /// Bumped whenever `summary_stale` is set.
    pub stale_generation: u64,

    pub providers: NodeProviders,
}

impl NodeEntry {
    pub fn mark_summary_stale(&mut self) {
        self.summary_stale = true;
        self.stale_generation += 1;
    }

    /// Whether the node's own summary is out of date.
    fn summary_changed(&self) -> bool {
        match &self.latest_summary {
            None => true,
            Some(latest) => {
                self.summary_stale || self.change_sequence_number > latest.reference_sequence_number
            }
        }
    }
}

/// A node's state in the pass in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WipSummary {
    /// The node was summarized, with `summary_stale` as of `stale_generation`.
    Summarized { stale_generation: u64 },
    /// The node was unchanged and summarized as a handle, together with its subtree.
    Skipped,
}

#[derive(Debug)]
pub(crate) struct Pass {
    pub reference_sequence_number: u64,
    pub wip: BTreeMap<NodeIndex, WipSummary>,
}

pub(crate) struct TreeState {
    nodes: Vec<Option<NodeEntry>>,
    pub root: NodeIndex,
    pub layout: DocumentLayout,
    pub pass: Option<Pass>,
    pub collector: GarbageCollector,
    pub gc_config: GcConfig,
}

impl TreeState {
    pub fn new(
        root: NodeEntry,
        layout: DocumentLayout,
        collector: GarbageCollector,
        gc_config: GcConfig,
    ) -> Self {
        Self {
            nodes: vec![Some(root)],
            root: NodeIndex(0),
            layout,
            pass: None,
            collector,
            gc_config,
        }
    }

    pub fn entry(&self, ix: NodeIndex) -> Result<&NodeEntry, Error> {
        self.nodes
            .get(ix.0)
            .and_then(Option::as_ref)
            .ok_or(Error::UnknownNode)
    }

    pub fn entry_mut(&mut self, ix: NodeIndex) -> Result<&mut NodeEntry, Error> {
        self.nodes
            .get_mut(ix.0)
            .and_then(Option::as_mut)
            .ok_or(Error::UnknownNode)
    }

    pub fn insert(&mut self, entry: NodeEntry) -> NodeIndex {
        self.nodes.push(Some(entry));
        NodeIndex(self.nodes.len() - 1)
    }

    pub fn entries(&self) -> impl Iterator<Item = (NodeIndex, &NodeEntry)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (NodeIndex(i), e)))
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut NodeEntry> {
        self.nodes.iter_mut().flatten()
    }

    /// The node and all of its descendants, parents before children.
    pub fn subtree(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        let mut out = vec![ix];
        let mut i = 0;
        while i < out.len() {
            if let Ok(entry) = self.entry(out[i]) {
                out.extend(entry.children.values().copied());
            }
            i += 1;
        }
        out
    }

    /// Whether children of a node of this kind are nested under `.channels`.
    pub fn isolates_children(&self, kind: NodeKind) -> bool {
        kind.isolates_children() && self.layout.isolated_channels()
    }

    /// Whether the summary of the node or any of its descendants is out of date.
    pub fn has_changed(&self, ix: NodeIndex) -> bool {
        self.subtree(ix)
            .into_iter()
            .filter_map(|ix| self.entry(ix).ok())
            .any(NodeEntry::summary_changed)
    }

    /// Whether the references of the node or any of its descendants changed
    /// since the node's last summary.
    pub fn gc_changed(&self, ix: NodeIndex) -> bool {
        let Some(base) = self
            .entry(ix)
            .ok()
            .and_then(|e| e.latest_summary.as_ref())
            .map(|l| l.reference_sequence_number)
        else {
            return true;
        };
        self.subtree(ix)
            .into_iter()
            .filter_map(|ix| self.entry(ix).ok())
            .any(|e| e.latest_summary.is_none() || e.gc_change_sequence_number > base)
    }

    /// Drops the cached GC data of the node and all its ancestors, which
    /// contain the node's data.
    pub fn invalidate_gc_upward(&mut self, ix: NodeIndex) {
        let mut next = Some(ix);
        while let Some(ix) = next {
            let Ok(entry) = self.entry_mut(ix) else {
                return;
            };
            trace!(node.path = %entry.path, "invalidating cached gc data");
            entry.gc.invalidate();
            next = entry.parent;
        }
    }

    /// Retires the initial GC data of the node and all its ancestors.
    pub fn retire_initial_gc_upward(&mut self, ix: NodeIndex) {
        let mut next = Some(ix);
        while let Some(ix) = next {
            let Ok(entry) = self.entry_mut(ix) else {
                return;
            };
            entry.gc.retire_initial();
            next = entry.parent;
        }
    }

    /// Removes a node and its subtree from the arena.
    pub fn remove_subtree(&mut self, ix: NodeIndex) {
        for ix in self.subtree(ix) {
            if let Some(slot) = self.nodes.get_mut(ix.0) {
                *slot = None;
            }
        }
    }

    /// Recomputes the paths of all descendants of a node from its own.
    pub fn rederive_paths(&mut self, ix: NodeIndex) -> Result<(), Error> {
        for ix in self.subtree(ix) {
            let (path, summary_path, isolated, children) = {
                let entry = self.entry(ix)?;
                (
                    entry.path.clone(),
                    entry.summary_path.clone(),
                    self.isolates_children(entry.kind),
                    entry.children.clone(),
                )
            };
            for (id, child_ix) in children {
                let child = self.entry_mut(child_ix)?;
                child.path = path.join(&id)?;
                child.summary_path = child_summary_path(&summary_path, isolated, &id);
            }
        }
        Ok(())
    }

    pub fn node_paths(&self) -> Vec<String> {
        self.entries().map(|(_, e)| e.path.to_string()).collect()
    }

    /// Commits the pass in flight as the latest summary of every node it touched.
    ///
    /// A node marked stale after it was summarized keeps its flag, the next
    /// pass rewrites it.
    pub fn commit(&mut self, pass: Pass) {
        let reference_sequence_number = pass.reference_sequence_number;
        for (ix, wip) in pass.wip {
            let targets = match wip {
                WipSummary::Summarized { .. } => vec![ix],
                WipSummary::Skipped => self.subtree(ix),
            };
            for ix in targets {
                if let Ok(entry) = self.entry_mut(ix) {
                    entry.latest_summary = Some(LatestSummary {
                        reference_sequence_number,
                        handle: entry.summary_path.clone(),
                    });
                    if let WipSummary::Summarized { stale_generation } = wip {
                        if entry.stale_generation == stale_generation {
                            entry.summary_stale = false;
                        }
                        entry.gc.retire_initial();
                    }
                }
            }
        }
    }
}
