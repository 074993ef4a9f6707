//! Reference-graph data and the garbage collector running over it.
//!
//! Every node of the summarizer tree reports a [GCData]: a mapping from node
//! id to the ids it references. Node ids are relative to the reporting node
//! (`/` is the node itself) until a parent prefixes them, outbound routes are
//! always absolute.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::path::prefix_node_id;

mod collector;

pub use self::collector::{
    run_mark_phase, GarbageCollector, GcRunResult, MarkResult, UnreferencedState,
    UnreferencedTracker,
};

/// The reference graph of a (sub)tree.
///
/// Routes keep their insertion order and may contain duplicates. Ids may point
/// to nodes which are not (yet) part of the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GCData {
    pub gc_nodes: BTreeMap<String, Vec<String>>,
}

impl GCData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.gc_nodes.is_empty()
    }

    /// Iterates over all node ids which have an entry.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.gc_nodes.keys().map(String::as_str)
    }

    /// Outbound routes of the given node id, if it has an entry.
    pub fn routes(&self, id: &str) -> Option<&[String]> {
        self.gc_nodes.get(id).map(Vec::as_slice)
    }
}

impl<K, R, I> FromIterator<(K, I)> for GCData
where
    K: Into<String>,
    R: Into<String>,
    I: IntoIterator<Item = R>,
{
    fn from_iter<T: IntoIterator<Item = (K, I)>>(iter: T) -> Self {
        let mut builder = GCDataBuilder::default();
        for (id, routes) in iter {
            builder.add_node(id, routes);
        }
        builder.build()
    }
}

/// Combines the [GCData] of a node with the data of its children.
#[derive(Debug, Default)]
pub struct GCDataBuilder {
    gc_nodes: BTreeMap<String, Vec<String>>,
}

impl GCDataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds routes to a node id, creating the entry if needed.
    pub fn add_node<R: Into<String>>(
        &mut self,
        id: impl Into<String>,
        routes: impl IntoIterator<Item = R>,
    ) {
        self.gc_nodes
            .entry(id.into())
            .or_default()
            .extend(routes.into_iter().map(Into::into));
    }

    /// Adds all nodes of the passed [GCData] with their ids unchanged.
    pub fn add_nodes(&mut self, gc_data: GCData) {
        for (id, routes) in gc_data.gc_nodes {
            self.add_node(id, routes);
        }
    }

    /// Adds all nodes of a child's [GCData], rewriting their ids so they are
    /// relative to this node.
    pub fn prefix_and_add_nodes(&mut self, prefix: &str, gc_data: GCData) {
        for (id, routes) in gc_data.gc_nodes {
            self.add_node(prefix_node_id(prefix, &id), routes);
        }
    }

    /// Adds the route to every node currently in the builder.
    pub fn add_route_to_all_nodes(&mut self, route: &str) {
        for routes in self.gc_nodes.values_mut() {
            routes.push(route.to_string());
        }
    }

    pub fn build(self) -> GCData {
        GCData {
            gc_nodes: self.gc_nodes,
        }
    }
}
