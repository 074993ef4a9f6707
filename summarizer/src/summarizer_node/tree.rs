use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, instrument, trace, warn};

use super::arena::{GCCache, InitialGCData, NodeEntry, NodeIndex, Pass, TreeState, WipSummary};
use super::{
    CreationSource, LatestSummary, NodeKind, NodeProviders, SummarizeResult, SummarizerNodeHandle,
};
use crate::config::SummarizerConfig;
use crate::gc::{GCData, GCDataBuilder, GarbageCollector, GcRunResult, UnreferencedState};
use crate::path::{prefix_node_id, NodePath};
use crate::snapshot::{read_container_metadata, SnapshotStorage, SnapshotTree};
use crate::summary::{
    add_children, DocumentLayout, HandleType, SummaryHandle, SummaryObject, SummaryStats,
    SummaryTreeBuilder, SummaryTreeWithStats,
};
use crate::Error;

/// Parameters of an orchestrated summary pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummarizeOptions {
    pub reference_sequence_number: u64,
    /// Summarize every node, ignoring all caches.
    pub full_tree: bool,
    /// Recompute all GC data from the providers before collecting garbage.
    pub full_gc: bool,
}

/// The outcome of [SummarizerNodeTree::summarize].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSummary {
    pub result: SummarizeResult,
    /// The GC run of the pass, if GC is enabled.
    pub gc: Option<GcRunResult>,
}

/// A tree of summarizer nodes, rooted at the container runtime.
///
/// Cloning is cheap, clones share the same nodes.
#[derive(Clone)]
pub struct SummarizerNodeTree {
    pub(super) state: Arc<RwLock<TreeState>>,
    config: Arc<SummarizerConfig>,
}

pub struct SummarizerNodeTreeBuilder {
    config: SummarizerConfig,
    providers: NodeProviders,
    change_sequence_number: u64,
}

impl SummarizerNodeTreeBuilder {
    /// Sets the providers of the root node.
    pub fn providers(mut self, providers: NodeProviders) -> Self {
        self.providers = providers;
        self
    }

    /// Sets the sequence number of the last op known to have changed the root.
    pub fn change_sequence_number(mut self, change_sequence_number: u64) -> Self {
        self.change_sequence_number = change_sequence_number;
        self
    }

    /// Builds the tree of a new document, which was never summarized.
    pub fn build(self) -> Result<SummarizerNodeTree, Error> {
        let layout = DocumentLayout::for_new_document(self.config.disable_isolated_channels);
        self.finish(layout, None, CreationSource::CreatedLocally, None)
    }

    /// Builds the tree of a document whose last summary was acknowledged at
    /// `reference_sequence_number`, without access to that summary's contents.
    pub fn from_summary(self, reference_sequence_number: u64) -> Result<SummarizerNodeTree, Error> {
        let layout = DocumentLayout::for_new_document(self.config.disable_isolated_channels);
        let latest = LatestSummary {
            reference_sequence_number,
            handle: String::new(),
        };
        self.finish(layout, Some(latest), CreationSource::FromExistingSummary, None)
    }

    /// Builds the tree of a document loaded from `snapshot`. The channel
    /// layout is taken from the snapshot's `.metadata` blob.
    pub async fn load(
        self,
        storage: &dyn SnapshotStorage,
        snapshot: SnapshotTree,
        reference_sequence_number: u64,
    ) -> Result<SummarizerNodeTree, Error> {
        let metadata = read_container_metadata(storage, &snapshot).await?;
        let layout = DocumentLayout::from_metadata(metadata);
        debug!(
            isolated_channels = layout.isolated_channels(),
            reference_sequence_number, "loading document"
        );
        let latest = LatestSummary {
            reference_sequence_number,
            handle: String::new(),
        };
        self.finish(
            layout,
            Some(latest),
            CreationSource::FromExistingSummary,
            Some(snapshot),
        )
    }

    fn finish(
        self,
        layout: DocumentLayout,
        latest_summary: Option<LatestSummary>,
        creation_source: CreationSource,
        base_snapshot: Option<SnapshotTree>,
    ) -> Result<SummarizerNodeTree, Error> {
        let pinned_paths = self.config.gc.pinned_node_paths()?;
        let collector = GarbageCollector::new(pinned_paths.iter().map(NodePath::to_string));

        let root = NodeEntry {
            id: String::new(),
            path: NodePath::root(),
            summary_path: String::new(),
            kind: NodeKind::ContainerRuntime,
            parent: None,
            children: BTreeMap::new(),
            change_sequence_number: self.change_sequence_number,
            gc_change_sequence_number: self.change_sequence_number,
            latest_summary,
            gc: GCCache::default(),
            creation_source,
            base_snapshot,
            unreferenced_state: UnreferencedState::Referenced,
            summary_stale: false,
            stale_generation: 0,
            providers: self.providers,
        };

        let state = TreeState::new(root, layout, collector, self.config.gc.clone());
        Ok(SummarizerNodeTree {
            state: Arc::new(RwLock::new(state)),
            config: Arc::new(self.config),
        })
    }
}

/// What summarizing a node needs to know about it, read under the lock.
struct NodeForSummary {
    changed: bool,
    epoch: u64,
    stale_generation: u64,
    id: String,
    path: NodePath,
    kind: NodeKind,
    latest: Option<LatestSummary>,
    providers: NodeProviders,
    children: BTreeMap<String, NodeIndex>,
    unreferenced: bool,
    /// Only set for the root, which writes the `.metadata` blob.
    layout: Option<DocumentLayout>,
    isolated: bool,
    cached_gc: Option<GCData>,
    gc_enabled: bool,
}

/// Combines the GC data of a node's own state with the data of its children.
///
/// A data store routes to all of its channels, and every channel routes back
/// to its data store, so they are only ever collected together. A node
/// without children reports its provider's data unchanged. A node with
/// children always has a `/` entry.
fn combine_gc_data(
    kind: NodeKind,
    path: &NodePath,
    own: GCData,
    children: Vec<(String, GCData)>,
) -> Result<GCData, Error> {
    let mut builder = GCDataBuilder::new();
    let mut child_paths = Vec::with_capacity(children.len());
    for (id, gc_data) in children {
        child_paths.push(path.join(&id)?.to_string());
        if kind == NodeKind::DataStore {
            builder.add_node(prefix_node_id(&id, "/"), Vec::<String>::new());
        }
        builder.prefix_and_add_nodes(&id, gc_data);
    }

    if kind == NodeKind::DataStore {
        builder.add_route_to_all_nodes(path.as_str());
    }

    builder.add_nodes(own);
    if !child_paths.is_empty() {
        builder.add_node("/", Vec::<String>::new());
    }
    if kind == NodeKind::DataStore {
        builder.add_node("/", child_paths);
    }

    Ok(builder.build())
}

impl SummarizerNodeTree {
    pub fn builder(config: SummarizerConfig) -> SummarizerNodeTreeBuilder {
        SummarizerNodeTreeBuilder {
            config,
            providers: NodeProviders::default(),
            change_sequence_number: 0,
        }
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    pub fn root(&self) -> SummarizerNodeHandle {
        let root = self.state.read().root;
        SummarizerNodeHandle::new(self.clone(), root)
    }

    /// Looks up a node by its path.
    pub fn node(&self, path: &NodePath) -> Option<SummarizerNodeHandle> {
        let ix = {
            let state = self.state.read();
            let mut ix = state.root;
            for component in path.components() {
                ix = *state.entry(ix).ok()?.children.get(component)?;
            }
            ix
        };
        Some(SummarizerNodeHandle::new(self.clone(), ix))
    }

    /// The paths of all nodes currently in the tree.
    pub fn node_paths(&self) -> Vec<String> {
        self.state.read().node_paths()
    }

    pub fn layout(&self) -> DocumentLayout {
        self.state.read().layout.clone()
    }

    pub fn isolated_channels(&self) -> bool {
        self.state.read().layout.isolated_channels()
    }

    /// Opens a summary pass at `reference_sequence_number`. Only one pass can
    /// be in flight at a time.
    pub fn start_summary(&self, reference_sequence_number: u64) -> Result<(), Error> {
        let mut state = self.state.write();
        if let Some(pass) = &state.pass {
            return Err(Error::SummaryInProgress(pass.reference_sequence_number));
        }
        debug!(reference_sequence_number, "starting summary");
        state.pass = Some(Pass {
            reference_sequence_number,
            wip: BTreeMap::new(),
        });
        Ok(())
    }

    /// The reference sequence number of the pass in flight.
    pub fn summary_in_progress(&self) -> Option<u64> {
        self.state
            .read()
            .pass
            .as_ref()
            .map(|p| p.reference_sequence_number)
    }

    /// Commits the pass in flight after the summary was acknowledged.
    pub fn complete_summary(&self, acked_sequence_number: u64) -> Result<(), Error> {
        let mut state = self.state.write();
        let pass = match state.pass.take() {
            None => return Err(Error::NoSummaryInProgress),
            Some(pass) if pass.reference_sequence_number != acked_sequence_number => {
                let expected = pass.reference_sequence_number;
                state.pass = Some(pass);
                warn!(expected, acked = acked_sequence_number, "ack does not match summary");
                return Err(Error::AckMismatch {
                    expected,
                    acked: acked_sequence_number,
                });
            }
            Some(pass) => pass,
        };
        debug!(
            reference_sequence_number = pass.reference_sequence_number,
            nodes = pass.wip.len(),
            "completing summary"
        );
        state.commit(pass);
        Ok(())
    }

    /// Discards the pass in flight. Nodes keep their last acknowledged summary.
    pub fn clear_cache(&self) {
        if let Some(pass) = self.state.write().pass.take() {
            warn!(
                reference_sequence_number = pass.reference_sequence_number,
                "discarding summary in progress"
            );
        }
    }

    /// Runs the garbage collector over the GC data of the whole tree, and
    /// updates the unreferenced state of every node.
    #[instrument(skip(self))]
    pub async fn collect_garbage(
        &self,
        current_sequence_number: u64,
        full_gc: bool,
    ) -> Result<GcRunResult, Error> {
        let root = self.state.read().root;
        let gc_data = self.get_gc_data_at(root, full_gc).await?;

        let mut state = self.state.write();
        let node_paths = state.node_paths();
        let result = state.collector.collect(
            &gc_data,
            node_paths.iter().map(String::as_str),
            current_sequence_number,
        );

        let updates: Vec<(NodeIndex, UnreferencedState)> = state
            .entries()
            .map(|(ix, e)| (ix, state.collector.tracker().state_of(e.path.as_str())))
            .collect();
        for (ix, unreferenced_state) in updates {
            let entry = state.entry_mut(ix)?;
            if entry.unreferenced_state != unreferenced_state {
                trace!(node.path = %entry.path, ?unreferenced_state, "unreferenced state changed");
                entry.unreferenced_state = unreferenced_state;
                entry.mark_summary_stale();
            }
        }

        Ok(result)
    }

    /// Runs a complete pass: opens it, collects garbage if enabled, and
    /// summarizes the root. The pass stays open until
    /// [SummarizerNodeTree::complete_summary] or [SummarizerNodeTree::clear_cache].
    /// A failing pass is discarded.
    #[instrument(skip(self))]
    pub async fn summarize(&self, options: SummarizeOptions) -> Result<TreeSummary, Error> {
        self.start_summary(options.reference_sequence_number)?;
        match self.run_pass(options).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                warn!(err = %e, "summary pass failed");
                self.clear_cache();
                Err(e)
            }
        }
    }

    async fn run_pass(&self, options: SummarizeOptions) -> Result<TreeSummary, Error> {
        let gc = if self.config.gc.enabled {
            let full_gc = options.full_gc || self.config.gc.full_gc;
            Some(
                self.collect_garbage(options.reference_sequence_number, full_gc)
                    .await?,
            )
        } else {
            None
        };
        let result = self.root().summarize(options.full_tree).await?;
        Ok(TreeSummary { result, gc })
    }

    /// Caches GC data computed from the providers, unless the node was
    /// invalidated since `epoch`.
    fn store_gc_data(&self, ix: NodeIndex, epoch: u64, gc_data: &GCData) {
        let mut state = self.state.write();
        let Ok(entry) = state.entry_mut(ix) else {
            return;
        };
        entry.gc.retire_initial();
        if entry.gc.epoch == epoch {
            entry.gc.cached = Some(gc_data.clone());
        } else {
            debug!(node.path = %entry.path, "gc data invalidated while computing, not caching");
        }
    }

    /// Returns the GC data of a node and its subtree, recomputing it only if
    /// neither cached nor initial data can be used.
    pub(super) fn get_gc_data_at(
        &self,
        ix: NodeIndex,
        full_gc: bool,
    ) -> BoxFuture<'_, Result<GCData, Error>> {
        async move {
            let (cached, gc_changed, initial, initial_provider, epoch) = {
                let state = self.state.read();
                let entry = state.entry(ix)?;
                (
                    entry.gc.cached.clone(),
                    state.gc_changed(ix),
                    entry.gc.initial.clone(),
                    entry.providers.initial_gc_data.clone(),
                    entry.gc.epoch,
                )
            };

            if !full_gc {
                if let Some(cached) = cached {
                    trace!("gc data cache hit");
                    return Ok(cached);
                }

                if !gc_changed {
                    let initial = match initial {
                        InitialGCData::Loaded(initial) => initial,
                        InitialGCData::NotLoaded => {
                            let initial = match initial_provider {
                                Some(provider) => provider.initial_gc_data().await?,
                                None => None,
                            };
                            let mut state = self.state.write();
                            let gc = &mut state.entry_mut(ix)?.gc;
                            if let InitialGCData::NotLoaded = gc.initial {
                                gc.initial = InitialGCData::Loaded(initial.clone());
                                initial
                            } else {
                                // Retired while loading.
                                None
                            }
                        }
                    };
                    if let Some(initial) = initial {
                        trace!("using initial gc data");
                        let mut state = self.state.write();
                        let entry = state.entry_mut(ix)?;
                        if entry.gc.epoch == epoch {
                            entry.gc.cached = Some(initial.clone());
                        }
                        return Ok(initial);
                    }
                }
            }

            let (provider, children, kind, path) = {
                let state = self.state.read();
                let entry = state.entry(ix)?;
                (
                    entry.providers.gc_data.clone(),
                    entry.children.clone(),
                    entry.kind,
                    entry.path.clone(),
                )
            };
            let provider = provider.ok_or_else(|| Error::MissingGCProvider(path.to_string()))?;

            trace!(node.path = %path, "computing gc data");
            let own = provider.gc_data(full_gc).await?;
            let child_data = try_join_all(
                children
                    .values()
                    .map(|&child_ix| self.get_gc_data_at(child_ix, full_gc)),
            )
            .await?;

            let gc_data = combine_gc_data(
                kind,
                &path,
                own,
                children.into_keys().zip(child_data).collect(),
            )?;
            self.store_gc_data(ix, epoch, &gc_data);
            Ok(gc_data)
        }
        .boxed()
    }

    fn record_wip(&self, ix: NodeIndex, wip: WipSummary) -> Result<(), Error> {
        let mut state = self.state.write();
        let pass = state.pass.as_mut().ok_or(Error::NoSummaryInProgress)?;
        pass.wip.insert(ix, wip);
        Ok(())
    }

    /// Summarizes a node and its subtree. Unchanged nodes are summarized as
    /// a handle to their last summary, unless `full_tree` is set.
    ///
    /// With `track_state`, a pass needs to be in flight and the result is
    /// recorded in it.
    pub(super) fn summarize_node(
        &self,
        ix: NodeIndex,
        full_tree: bool,
        track_state: bool,
    ) -> BoxFuture<'_, Result<SummarizeResult, Error>> {
        async move {
            let node = {
                let state = self.state.read();
                if track_state && state.pass.is_none() {
                    return Err(Error::NoSummaryInProgress);
                }
                let entry = state.entry(ix)?;
                NodeForSummary {
                    changed: state.has_changed(ix),
                    epoch: entry.gc.epoch,
                    stale_generation: entry.stale_generation,
                    id: entry.id.clone(),
                    path: entry.path.clone(),
                    kind: entry.kind,
                    latest: entry.latest_summary.clone(),
                    providers: entry.providers.clone(),
                    children: entry.children.clone(),
                    unreferenced: entry.unreferenced_state.is_unreferenced(),
                    layout: entry.parent.is_none().then(|| state.layout.clone()),
                    isolated: state.isolates_children(entry.kind),
                    cached_gc: entry.gc.cached.clone(),
                    gc_enabled: state.gc_config.enabled,
                }
            };
            let NodeForSummary {
                changed,
                epoch,
                stale_generation,
                id,
                path,
                kind,
                latest,
                providers,
                children,
                unreferenced,
                layout,
                isolated,
                cached_gc,
                gc_enabled,
            } = node;

            if let (false, false, Some(latest)) = (full_tree, changed, &latest) {
                trace!(node.path = %path, handle = %latest.handle, "unchanged, summarizing as handle");
                let summary = SummaryObject::Handle(SummaryHandle {
                    handle: latest.handle.clone(),
                    handle_type: HandleType::Tree,
                });
                let stats = SummaryStats::calculate(&summary);
                if track_state {
                    self.record_wip(ix, WipSummary::Skipped)?;
                }
                // GC data is only reused from the cache here, it is never
                // computed for an unchanged node.
                return Ok(SummarizeResult {
                    id,
                    summary,
                    stats,
                    gc_data: cached_gc.unwrap_or_default(),
                });
            }

            let summarize = providers
                .summarize
                .clone()
                .ok_or_else(|| Error::MissingSummarizeProvider(path.to_string()))?;
            let own = summarize.summarize_internal(full_tree, track_state).await?;

            let child_results = try_join_all(
                children
                    .values()
                    .map(|&child_ix| self.summarize_node(child_ix, full_tree, track_state)),
            )
            .await?;

            let mut builder = SummaryTreeBuilder::from_tree(own.summary.summary);
            if let Some(layout) = layout {
                layout.add_metadata(&mut builder)?;
            }
            let mut child_summaries = Vec::with_capacity(child_results.len());
            let mut child_gc_data = Vec::with_capacity(child_results.len());
            for (child_id, result) in children.into_keys().zip(child_results) {
                child_gc_data.push((child_id.clone(), result.gc_data));
                child_summaries.push((child_id, result.summary, result.stats));
            }
            add_children(&mut builder, isolated, child_summaries)?;
            builder.mark_unreferenced(unreferenced);
            let SummaryTreeWithStats { summary, stats } = builder.summary();

            let gc_data = if !gc_enabled {
                GCData::default()
            } else if full_tree {
                let provider = providers
                    .gc_data
                    .ok_or_else(|| Error::MissingGCProvider(path.to_string()))?;
                let own_gc_data = provider.gc_data(true).await?;
                let gc_data = combine_gc_data(kind, &path, own_gc_data, child_gc_data)?;
                self.store_gc_data(ix, epoch, &gc_data);
                gc_data
            } else {
                self.get_gc_data_at(ix, false).await?
            };

            if track_state {
                self.record_wip(ix, WipSummary::Summarized { stale_generation })?;
            }
            debug!(
                node.path = %path,
                stats.tree_node_count = stats.tree_node_count,
                stats.blob_node_count = stats.blob_node_count,
                stats.handle_node_count = stats.handle_node_count,
                "summarized node"
            );

            Ok(SummarizeResult {
                id: own.id,
                summary: SummaryObject::Tree(summary),
                stats,
                gc_data,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::combine_gc_data;
    use crate::gc::GCData;
    use crate::path::NodePath;
    use crate::summarizer_node::NodeKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn data_store_routes() {
        let path: NodePath = "/default".parse().unwrap();
        let own = GCData::from_iter([("/", vec!["/other"])]);
        let channel = GCData::from_iter([("/", vec!["/default/other-channel"])]);

        assert_eq!(
            GCData::from_iter([
                ("/", vec!["/other", "/default/root"]),
                ("/root", vec!["/default/other-channel", "/default"]),
            ]),
            combine_gc_data(NodeKind::DataStore, &path, own, vec![("root".into(), channel)])
                .unwrap()
        );
    }

    #[test]
    fn channel_without_routes_routes_back() {
        let path: NodePath = "/default".parse().unwrap();

        assert_eq!(
            GCData::from_iter([("/", vec!["/default/root"]), ("/root", vec!["/default"])]),
            combine_gc_data(
                NodeKind::DataStore,
                &path,
                GCData::default(),
                vec![("root".into(), GCData::default())],
            )
            .unwrap()
        );
    }

    #[test]
    fn leaf_is_unchanged() {
        let path: NodePath = "/default/root".parse().unwrap();
        let own = GCData::from_iter([("/sub", vec!["/other"])]);

        assert_eq!(
            own.clone(),
            combine_gc_data(NodeKind::Channel, &path, own, vec![]).unwrap()
        );
        assert_eq!(
            GCData::default(),
            combine_gc_data(NodeKind::Channel, &path, GCData::default(), vec![]).unwrap()
        );
    }

    #[test]
    fn parent_has_root_entry() {
        let child = GCData::from_iter([("/", vec!["/x"])]);

        assert_eq!(
            GCData::from_iter([("/", vec![]), ("/a", vec!["/x"])]),
            combine_gc_data(
                NodeKind::ContainerRuntime,
                &NodePath::root(),
                GCData::default(),
                vec![("a".into(), child)],
            )
            .unwrap()
        );
    }

    #[test]
    fn container_prefixes_only() {
        let data_store = GCData::from_iter([("/", vec!["/default/root"]), ("/root", vec!["/default"])]);

        assert_eq!(
            GCData::from_iter([
                ("/", vec!["/default"]),
                ("/default", vec!["/default/root"]),
                ("/default/root", vec!["/default"]),
            ]),
            combine_gc_data(
                NodeKind::ContainerRuntime,
                &NodePath::root(),
                GCData::from_iter([("/", vec!["/default"])]),
                vec![("default".into(), data_store)],
            )
            .unwrap()
        );
    }
}
