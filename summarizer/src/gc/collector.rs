use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::{
    graph::{DiGraph, NodeIndex},
    visit::{Bfs, Walker},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::GCData;

/// Whether a node is reachable from the GC roots, and if not, since when.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnreferencedState {
    #[default]
    Referenced,
    /// Unreachable since the pass at the given sequence number.
    UnreferencedSince(u64),
}

impl UnreferencedState {
    pub fn is_unreferenced(&self) -> bool {
        matches!(self, UnreferencedState::UnreferencedSince(_))
    }

    /// The sequence number at which the node first became unreferenced.
    pub fn since(&self) -> Option<u64> {
        match self {
            UnreferencedState::Referenced => None,
            UnreferencedState::UnreferencedSince(seq) => Some(*seq),
        }
    }
}

/// The referenced / unreferenced partition of all known node ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkResult {
    pub referenced: BTreeSet<String>,
    pub unreferenced: BTreeSet<String>,
}

/// Marks every node reachable from `roots` over the routes in `gc_data`.
///
/// Nodes only known through a route (forward references) or only passed in
/// `extra_node_ids` take part in the partition like any other node. Roots
/// which are not known at all are ignored.
#[instrument(level = "trace", skip_all, fields(gc.nodes = gc_data.gc_nodes.len()))]
pub fn run_mark_phase<'r, 'e>(
    gc_data: &GCData,
    roots: impl IntoIterator<Item = &'r str>,
    extra_node_ids: impl IntoIterator<Item = &'e str>,
) -> MarkResult {
    // Edges point from the referencing node to the referenced one.
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut id_to_node_ix: HashMap<String, NodeIndex> = HashMap::new();

    let mut node_ix = |graph: &mut DiGraph<String, ()>, id: &str| -> NodeIndex {
        *id_to_node_ix
            .entry(id.to_string())
            .or_insert_with(|| graph.add_node(id.to_string()))
    };

    for (id, routes) in &gc_data.gc_nodes {
        let ix = node_ix(&mut graph, id);
        for route in routes {
            let route_ix = node_ix(&mut graph, route);
            graph.add_edge(ix, route_ix, ());
        }
    }
    for id in extra_node_ids {
        node_ix(&mut graph, id);
    }

    // A sentinel node pointing to all roots, so a single traversal visits
    // everything reachable from any of them.
    let known_roots: Vec<NodeIndex> = roots
        .into_iter()
        .filter_map(|root| id_to_node_ix.get(root).copied())
        .collect();
    let sentinel = graph.add_node(String::new());
    for root_ix in known_roots {
        graph.add_edge(sentinel, root_ix, ());
    }

    let mut visited = vec![false; graph.node_count()];
    for ix in Bfs::new(&graph, sentinel).iter(&graph) {
        visited[ix.index()] = true;
    }

    let mut result = MarkResult::default();
    for (id, ix) in id_to_node_ix {
        if visited[ix.index()] {
            result.referenced.insert(id);
        } else {
            result.unreferenced.insert(id);
        }
    }
    result
}

/// The state changes produced by one GC run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcRunResult {
    pub reference_sequence_number: u64,
    pub referenced: BTreeSet<String>,
    /// Unreferenced node ids, with the sequence number they became unreferenced at.
    pub unreferenced: BTreeMap<String, u64>,
    pub newly_unreferenced: BTreeSet<String>,
    pub revived: BTreeSet<String>,
}

/// Keeps the "unreferenced since" bookkeeping across GC runs.
#[derive(Debug, Default)]
pub struct UnreferencedTracker {
    states: BTreeMap<String, UnreferencedState>,
}

impl UnreferencedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the state of a node, e.g. from a loaded snapshot.
    /// Existing entries are left untouched.
    pub fn seed(&mut self, id: impl Into<String>, state: UnreferencedState) {
        self.states.entry(id.into()).or_insert(state);
    }

    /// The state of a node id. Ids never seen are referenced.
    pub fn state_of(&self, id: &str) -> UnreferencedState {
        self.states.get(id).copied().unwrap_or_default()
    }

    /// Applies a mark result, keeping the timestamp of nodes which already were
    /// unreferenced. Ids no longer present in the partition are forgotten.
    pub fn apply(&mut self, mark: MarkResult, current_sequence_number: u64) -> GcRunResult {
        let mut result = GcRunResult {
            reference_sequence_number: current_sequence_number,
            ..Default::default()
        };

        let mut states = BTreeMap::new();
        for id in mark.referenced {
            if self.state_of(&id).is_unreferenced() {
                result.revived.insert(id.clone());
            }
            states.insert(id.clone(), UnreferencedState::Referenced);
            result.referenced.insert(id);
        }
        for id in mark.unreferenced {
            let since = match self.states.get(&id) {
                Some(UnreferencedState::UnreferencedSince(since)) => *since,
                _ => {
                    result.newly_unreferenced.insert(id.clone());
                    current_sequence_number
                }
            };
            states.insert(id.clone(), UnreferencedState::UnreferencedSince(since));
            result.unreferenced.insert(id, since);
        }

        self.states = states;
        result
    }
}

/// Mark-and-sweep style classification of the reference graph. Nothing is
/// deleted, nodes only move between referenced and unreferenced.
#[derive(Debug)]
pub struct GarbageCollector {
    roots: Vec<String>,
    tracker: UnreferencedTracker,
}

impl GarbageCollector {
    /// Creates a collector with the tree root and the passed pinned paths as roots.
    pub fn new(pinned_paths: impl IntoIterator<Item = String>) -> Self {
        let mut roots = vec!["/".to_string()];
        roots.extend(pinned_paths);
        Self {
            roots,
            tracker: UnreferencedTracker::new(),
        }
    }

    pub fn tracker(&self) -> &UnreferencedTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut UnreferencedTracker {
        &mut self.tracker
    }

    /// Runs the mark phase over `gc_data` and updates the unreferenced state
    /// of every known node id.
    #[instrument(level = "debug", skip_all, fields(gc.reference_sequence_number = current_sequence_number))]
    pub fn collect<'a>(
        &mut self,
        gc_data: &GCData,
        extra_node_ids: impl IntoIterator<Item = &'a str>,
        current_sequence_number: u64,
    ) -> GcRunResult {
        let mark = run_mark_phase(gc_data, self.roots.iter().map(String::as_str), extra_node_ids);
        let result = self.tracker.apply(mark, current_sequence_number);
        debug!(
            gc.referenced = result.referenced.len(),
            gc.unreferenced = result.unreferenced.len(),
            gc.newly_unreferenced = result.newly_unreferenced.len(),
            gc.revived = result.revived.len(),
            "gc run complete"
        );
        result
    }
}
