use std::collections::BTreeMap;

use tracing::{debug, instrument};

use super::arena::{GCCache, NodeEntry, NodeIndex};
use super::{
    CreationSource, LatestSummary, NodeKind, NodeProviders, SummarizeResult, SummarizerNodeTree,
};
use crate::gc::{GCData, UnreferencedState};
use crate::path::{validate_component, NodePath};
use crate::snapshot::{channel_ids, child_subtree, data_store_ids, SnapshotTree};
use crate::summary::{child_summary_path, validate_data_store_id};
use crate::Error;

/// Addresses a single node of a [SummarizerNodeTree].
///
/// Handles stay valid across renames of the node or its ancestors. Once the
/// node is detached, all operations fail with [Error::UnknownNode].
#[derive(Clone)]
pub struct SummarizerNodeHandle {
    tree: SummarizerNodeTree,
    ix: NodeIndex,
}

impl std::fmt::Debug for SummarizerNodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummarizerNodeHandle")
            .field("ix", &self.ix)
            .field("path", &self.path().ok())
            .finish()
    }
}

impl SummarizerNodeHandle {
    pub(super) fn new(tree: SummarizerNodeTree, ix: NodeIndex) -> Self {
        Self { tree, ix }
    }

    fn read<T>(&self, f: impl FnOnce(&NodeEntry) -> T) -> Result<T, Error> {
        let state = self.tree.state.read();
        state.entry(self.ix).map(f)
    }

    pub fn tree(&self) -> &SummarizerNodeTree {
        &self.tree
    }

    pub fn id(&self) -> Result<String, Error> {
        self.read(|e| e.id.clone())
    }

    pub fn path(&self) -> Result<NodePath, Error> {
        self.read(|e| e.path.clone())
    }

    pub fn kind(&self) -> Result<NodeKind, Error> {
        self.read(|e| e.kind)
    }

    pub fn child(&self, id: &str) -> Option<SummarizerNodeHandle> {
        let ix = self.read(|e| e.children.get(id).copied()).ok()??;
        Some(Self::new(self.tree.clone(), ix))
    }

    pub fn child_ids(&self) -> Result<Vec<String>, Error> {
        self.read(|e| e.children.keys().cloned().collect())
    }

    pub fn parent(&self) -> Option<SummarizerNodeHandle> {
        let ix = self.read(|e| e.parent).ok()??;
        Some(Self::new(self.tree.clone(), ix))
    }

    pub fn change_sequence_number(&self) -> Result<u64, Error> {
        self.read(|e| e.change_sequence_number)
    }

    pub fn latest_summary(&self) -> Result<Option<LatestSummary>, Error> {
        self.read(|e| e.latest_summary.clone())
    }

    pub fn unreferenced_state(&self) -> Result<UnreferencedState, Error> {
        self.read(|e| e.unreferenced_state)
    }

    pub fn creation_source(&self) -> Result<CreationSource, Error> {
        self.read(|e| e.creation_source.clone())
    }

    /// The snapshot subtree the node was loaded or attached from.
    pub fn base_snapshot(&self) -> Result<Option<SnapshotTree>, Error> {
        self.read(|e| e.base_snapshot.clone())
    }

    /// Whether the summary of the node or any of its descendants is out of date.
    pub fn has_changed(&self) -> Result<bool, Error> {
        let state = self.tree.state.read();
        state.entry(self.ix)?;
        Ok(state.has_changed(self.ix))
    }

    /// Ids of the children present in the node's base snapshot, which can be
    /// created with [CreationSource::FromExistingSummary].
    pub fn snapshot_child_ids(&self) -> Result<Vec<String>, Error> {
        let state = self.tree.state.read();
        let entry = state.entry(self.ix)?;
        let Some(snapshot) = &entry.base_snapshot else {
            return Ok(Vec::new());
        };
        let isolated = state.isolates_children(entry.kind);
        Ok(match entry.kind {
            NodeKind::ContainerRuntime => data_store_ids(snapshot, isolated),
            NodeKind::DataStore | NodeKind::Channel => channel_ids(snapshot, isolated),
        })
    }

    /// Registers a new child.
    pub fn create_child(
        &self,
        id: &str,
        creation_source: CreationSource,
        providers: NodeProviders,
    ) -> Result<SummarizerNodeHandle, Error> {
        let mut state = self.tree.state.write();
        if state.pass.is_some() {
            return Err(Error::TreeLockedBySummary);
        }

        let entry = {
            let parent = state.entry(self.ix)?;
            if parent.parent.is_none() {
                validate_data_store_id(id)?;
            } else {
                validate_component(id)?;
            }
            if parent.children.contains_key(id) {
                return Err(Error::DuplicateChild {
                    parent: parent.path.to_string(),
                    id: id.to_string(),
                });
            }

            let isolated = state.isolates_children(parent.kind);
            let path = parent.path.join(id)?;
            let summary_path = child_summary_path(&parent.summary_path, isolated, id);

            let (change_sequence_number, latest_summary, base_snapshot, unreferenced_state) =
                match &creation_source {
                    CreationSource::FromExistingSummary => {
                        let subtree = parent
                            .base_snapshot
                            .as_ref()
                            .and_then(|snapshot| child_subtree(snapshot, isolated, id))
                            .ok_or_else(|| Error::MissingSnapshotSubtree(path.to_string()))?;
                        let latest = parent.latest_summary.as_ref().map(|l| LatestSummary {
                            reference_sequence_number: l.reference_sequence_number,
                            handle: summary_path.clone(),
                        });
                        let unreferenced_state = match (&latest, subtree.unreferenced) {
                            (Some(l), true) => {
                                UnreferencedState::UnreferencedSince(l.reference_sequence_number)
                            }
                            _ => UnreferencedState::Referenced,
                        };
                        let change_sequence_number = latest
                            .as_ref()
                            .map(|l| l.reference_sequence_number)
                            .unwrap_or(parent.change_sequence_number);
                        (
                            change_sequence_number,
                            latest,
                            Some(subtree.clone()),
                            unreferenced_state,
                        )
                    }
                    CreationSource::FromAttachOperation {
                        sequence_number,
                        snapshot,
                    } => (
                        *sequence_number,
                        None,
                        Some(snapshot.clone()),
                        UnreferencedState::Referenced,
                    ),
                    CreationSource::CreatedLocally => (
                        parent.change_sequence_number,
                        None,
                        None,
                        UnreferencedState::Referenced,
                    ),
                };

            NodeEntry {
                id: id.to_string(),
                path,
                summary_path,
                kind: parent.kind.child_kind(),
                parent: Some(self.ix),
                children: BTreeMap::new(),
                change_sequence_number,
                gc_change_sequence_number: change_sequence_number,
                latest_summary,
                gc: GCCache::default(),
                creation_source,
                base_snapshot,
                unreferenced_state,
                summary_stale: false,
                stale_generation: 0,
                providers,
            }
        };

        debug!(node.path = %entry.path, "creating child");
        if entry.unreferenced_state.is_unreferenced() {
            state
                .collector
                .tracker_mut()
                .seed(entry.path.to_string(), entry.unreferenced_state);
        }

        let child_ix = state.insert(entry);
        state
            .entry_mut(self.ix)?
            .children
            .insert(id.to_string(), child_ix);
        state.invalidate_gc_upward(self.ix);

        drop(state);
        Ok(Self::new(self.tree.clone(), child_ix))
    }

    /// Removes a child and its subtree from the tree.
    pub fn detach_child(&self, id: &str) -> Result<(), Error> {
        let mut state = self.tree.state.write();
        if state.pass.is_some() {
            return Err(Error::TreeLockedBySummary);
        }
        let parent = state.entry_mut(self.ix)?;
        let child_ix = parent.children.remove(id).ok_or(Error::UnknownNode)?;
        parent.mark_summary_stale();
        debug!(node.path = %parent.path, id, "detaching child");

        state.remove_subtree(child_ix);
        state.invalidate_gc_upward(self.ix);
        state.retire_initial_gc_upward(self.ix);
        Ok(())
    }

    /// Moves a child to a new id, updating the paths of its whole subtree.
    pub fn rename_child(&self, old_id: &str, new_id: &str) -> Result<(), Error> {
        let mut state = self.tree.state.write();
        if state.pass.is_some() {
            return Err(Error::TreeLockedBySummary);
        }

        let (child_ix, path, summary_path) = {
            let parent = state.entry(self.ix)?;
            if parent.parent.is_none() {
                validate_data_store_id(new_id)?;
            } else {
                validate_component(new_id)?;
            }
            if parent.children.contains_key(new_id) {
                return Err(Error::DuplicateChild {
                    parent: parent.path.to_string(),
                    id: new_id.to_string(),
                });
            }
            let child_ix = *parent.children.get(old_id).ok_or(Error::UnknownNode)?;
            let isolated = state.isolates_children(parent.kind);
            (
                child_ix,
                parent.path.join(new_id)?,
                child_summary_path(&parent.summary_path, isolated, new_id),
            )
        };

        let parent = state.entry_mut(self.ix)?;
        parent.children.remove(old_id);
        parent.children.insert(new_id.to_string(), child_ix);
        parent.mark_summary_stale();

        let child = state.entry_mut(child_ix)?;
        debug!(from = %child.path, to = %path, "renaming child");
        child.id = new_id.to_string();
        child.path = path;
        child.summary_path = summary_path;
        state.rederive_paths(child_ix)?;

        // Data stores route to their channels by absolute path.
        for ix in state.subtree(child_ix) {
            let gc = &mut state.entry_mut(ix)?.gc;
            gc.invalidate();
            gc.retire_initial();
        }
        state.invalidate_gc_upward(self.ix);
        state.retire_initial_gc_upward(self.ix);
        Ok(())
    }

    /// Marks the node's own state as changed by the op at `sequence_number`.
    /// Older sequence numbers are ignored.
    pub fn invalidate(&self, sequence_number: u64) -> Result<(), Error> {
        let mut state = self.tree.state.write();
        let entry = state.entry_mut(self.ix)?;
        let content_changed = sequence_number > entry.change_sequence_number;
        let references_changed = sequence_number > entry.gc_change_sequence_number;
        if !content_changed && !references_changed {
            debug!(
                node.path = %entry.path,
                sequence_number,
                change_sequence_number = entry.change_sequence_number,
                "ignoring stale invalidation"
            );
            return Ok(());
        }
        if content_changed {
            entry.change_sequence_number = sequence_number;
        }
        if references_changed {
            entry.gc_change_sequence_number = sequence_number;
        }
        state.invalidate_gc_upward(self.ix);
        Ok(())
    }

    /// Marks only the node's references as changed, its summary stays valid.
    pub fn invalidate_references(&self, sequence_number: u64) -> Result<(), Error> {
        let mut state = self.tree.state.write();
        let entry = state.entry_mut(self.ix)?;
        if sequence_number <= entry.gc_change_sequence_number {
            return Ok(());
        }
        entry.gc_change_sequence_number = sequence_number;
        state.invalidate_gc_upward(self.ix);
        Ok(())
    }

    pub fn start_summary(&self, reference_sequence_number: u64) -> Result<(), Error> {
        self.tree.start_summary(reference_sequence_number)
    }

    pub fn complete_summary(&self, acked_sequence_number: u64) -> Result<(), Error> {
        self.tree.complete_summary(acked_sequence_number)
    }

    pub fn clear_cache(&self) {
        self.tree.clear_cache()
    }

    /// Summarizes the node and its subtree as part of the pass in flight.
    #[instrument(skip(self), fields(node.path = ?self.path().ok()))]
    pub async fn summarize(&self, full_tree: bool) -> Result<SummarizeResult, Error> {
        self.tree.summarize_node(self.ix, full_tree, true).await
    }

    /// Produces a full summary of the subtree, without a pass and without
    /// affecting what the next pass reuses.
    #[instrument(skip(self), fields(node.path = ?self.path().ok()))]
    pub async fn attach_summary(&self) -> Result<SummarizeResult, Error> {
        self.tree.summarize_node(self.ix, true, false).await
    }

    /// Returns the GC data of the node and its subtree.
    #[instrument(skip(self), fields(node.path = ?self.path().ok()))]
    pub async fn get_gc_data(&self, full_gc: bool) -> Result<GCData, Error> {
        self.tree.get_gc_data_at(self.ix, full_gc).await
    }
}
