use std::sync::Arc;

use crate::config::SummarizerConfig;
use crate::fixtures::{gc_data, MutableGCData, StaticSummarizer};
use crate::summarizer_node::{
    CreationSource, NodeProviders, SummarizerNodeHandle, SummarizerNodeTree,
};

mod load;
mod summarize;

/// Providers of a node, kept around to inspect and modify them.
pub(crate) struct TestProviders {
    pub summarizer: Arc<StaticSummarizer>,
    pub gc: Arc<MutableGCData>,
}

impl TestProviders {
    pub fn new(summarizer: StaticSummarizer, routes: &[&str]) -> Self {
        Self {
            summarizer: Arc::new(summarizer),
            gc: Arc::new(MutableGCData::new(gc_data(&[("/", routes)]))),
        }
    }

    pub fn node_providers(&self) -> NodeProviders {
        NodeProviders::new()
            .with_summarize(self.summarizer.clone())
            .with_gc_data(self.gc.clone())
    }
}

/// A container runtime with a `default` data store holding a `root` channel.
pub(crate) struct TwoLevelTree {
    pub tree: SummarizerNodeTree,
    pub root: TestProviders,
    pub data_store: TestProviders,
    pub channel: TestProviders,
}

impl TwoLevelTree {
    pub fn root_node(&self) -> SummarizerNodeHandle {
        self.tree.root()
    }

    pub fn data_store_node(&self) -> SummarizerNodeHandle {
        self.tree.root().child("default").expect("default must exist")
    }

    pub fn channel_node(&self) -> SummarizerNodeHandle {
        self.data_store_node()
            .child("root")
            .expect("root channel must exist")
    }
}

pub(crate) fn test_providers(isolated: bool, root_routes: &[&str]) -> [TestProviders; 3] {
    [
        TestProviders::new(StaticSummarizer::empty(""), root_routes),
        TestProviders::new(
            StaticSummarizer::data_store("default", &["@fluid-example/pkg".to_string()], isolated)
                .unwrap(),
            &[],
        ),
        TestProviders::new(
            StaticSummarizer::channel("root", "https://graph.microsoft.com/types/map").unwrap(),
            &[],
        ),
    ]
}

/// Builds a new document with a [TwoLevelTree] layout. The root references
/// the data store through `root_routes`.
pub(crate) fn two_level_tree(config: SummarizerConfig, root_routes: &[&str]) -> TwoLevelTree {
    let isolated = !config.disable_isolated_channels;
    let [root, data_store, channel] = test_providers(isolated, root_routes);

    let tree = SummarizerNodeTree::builder(config)
        .providers(root.node_providers())
        .build()
        .expect("must build");
    tree.root()
        .create_child(
            "default",
            CreationSource::CreatedLocally,
            data_store.node_providers(),
        )
        .expect("must create data store")
        .create_child(
            "root",
            CreationSource::CreatedLocally,
            channel.node_providers(),
        )
        .expect("must create channel");

    TwoLevelTree {
        tree,
        root,
        data_store,
        channel,
    }
}

pub(crate) fn legacy_config() -> SummarizerConfig {
    SummarizerConfig {
        disable_isolated_channels: true,
        ..Default::default()
    }
}
