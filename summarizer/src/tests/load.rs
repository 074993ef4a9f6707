use pretty_assertions::assert_eq;

use super::{legacy_config, test_providers, two_level_tree, TestProviders};
use crate::config::SummarizerConfig;
use crate::gc::UnreferencedState;
use crate::snapshot::{MemorySnapshotStorage, SnapshotStorage, SnapshotTree};
use crate::summarizer_node::{
    CreationSource, NodeProviders, SummarizeOptions, SummarizerNodeHandle, SummarizerNodeTree,
};
use crate::summary::SummaryObject;
use crate::Error;

/// Summarizes a fresh [super::TwoLevelTree] at sequence number 10 and writes
/// the acknowledged summary to `storage`.
async fn write_document(
    storage: &MemorySnapshotStorage,
    config: SummarizerConfig,
    root_routes: &[&str],
) -> SnapshotTree {
    let tree = two_level_tree(config, root_routes);
    let summary = tree
        .tree
        .summarize(SummarizeOptions {
            reference_sequence_number: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    tree.tree.complete_summary(10).unwrap();

    let SummaryObject::Tree(root) = &summary.result.summary else {
        panic!("root must be summarized as a tree");
    };
    storage.write_summary(root, None).await.unwrap()
}

struct Loaded {
    tree: SummarizerNodeTree,
    data_store: SummarizerNodeHandle,
    channel: SummarizerNodeHandle,
    providers: [TestProviders; 3],
}

/// Loads a document and realizes its data store and channel from the snapshot.
async fn load_document(
    storage: &MemorySnapshotStorage,
    snapshot: SnapshotTree,
    config: SummarizerConfig,
) -> Loaded {
    let isolated = !config.disable_isolated_channels;
    let providers = test_providers(isolated, &["/default"]);
    let [root, data_store, channel] = &providers;

    let tree = SummarizerNodeTree::builder(config)
        .providers(root.node_providers())
        .load(storage, snapshot, 10)
        .await
        .unwrap();

    let root_node = tree.root();
    assert_eq!(vec!["default"], root_node.snapshot_child_ids().unwrap());
    let data_store = root_node
        .create_child(
            "default",
            CreationSource::FromExistingSummary,
            data_store.node_providers(),
        )
        .unwrap();
    assert_eq!(vec!["root"], data_store.snapshot_child_ids().unwrap());
    let channel = data_store
        .create_child(
            "root",
            CreationSource::FromExistingSummary,
            channel.node_providers(),
        )
        .unwrap();

    Loaded {
        tree,
        data_store,
        channel,
        providers,
    }
}

#[tokio::test]
async fn loaded_tree_is_unchanged() {
    let storage = MemorySnapshotStorage::default();
    let snapshot = write_document(&storage, SummarizerConfig::default(), &["/default"]).await;
    let loaded = load_document(&storage, snapshot.clone(), SummarizerConfig::default()).await;

    assert!(loaded.tree.isolated_channels());
    assert!(!loaded.tree.root().has_changed().unwrap());
    assert_eq!(10, loaded.channel.change_sequence_number().unwrap());
    assert_eq!(
        "/.channels/default/.channels/root",
        loaded.channel.latest_summary().unwrap().unwrap().handle
    );
    assert_eq!(
        Some(snapshot.descend("/.channels/default").unwrap().clone()),
        loaded.data_store.base_snapshot().unwrap()
    );

    // Only the root changed, everything below it is written as a handle.
    loaded.tree.root().invalidate(11).unwrap();
    let summary = loaded
        .tree
        .summarize(SummarizeOptions {
            reference_sequence_number: 12,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(1, summary.result.stats.handle_node_count);

    let SummaryObject::Tree(root) = &summary.result.summary else {
        panic!("root must be summarized as a tree");
    };
    let incremental = storage.write_summary(root, Some(&snapshot)).await.unwrap();
    assert_eq!(snapshot, incremental);
}

#[tokio::test]
async fn unreferenced_flags_are_loaded() {
    let storage = MemorySnapshotStorage::default();
    let snapshot = write_document(&storage, SummarizerConfig::default(), &[]).await;
    assert!(snapshot.descend("/.channels/default").unwrap().unreferenced);

    let loaded = load_document(&storage, snapshot, SummarizerConfig::default()).await;
    assert_eq!(
        UnreferencedState::UnreferencedSince(10),
        loaded.data_store.unreferenced_state().unwrap()
    );

    // The root references nothing, the loaded nodes stay unreferenced since
    // the original run.
    loaded.tree.root().invalidate_references(15).unwrap();
    let root_providers = &loaded.providers[0];
    root_providers.gc.set(crate::fixtures::gc_data(&[("/", &[])]));

    let gc = loaded.tree.collect_garbage(20, false).await.unwrap();
    assert_eq!(Some(&10), gc.unreferenced.get("/default"));
    assert_eq!(Some(&10), gc.unreferenced.get("/default/root"));
    assert!(gc.newly_unreferenced.is_empty());
}

#[tokio::test]
async fn legacy_document() {
    let storage = MemorySnapshotStorage::default();
    let mut snapshot = write_document(&storage, legacy_config(), &["/default"]).await;
    assert!(!snapshot.blobs.contains_key(".metadata"));
    snapshot
        .trees
        .insert(".protocol".to_string(), SnapshotTree::default());

    // The layout follows the snapshot, not the configuration.
    let loaded = load_document(&storage, snapshot, legacy_config()).await;
    assert!(!loaded.tree.isolated_channels());
    assert_eq!(
        "/default/root",
        loaded.channel.latest_summary().unwrap().unwrap().handle
    );
}

#[tokio::test]
async fn missing_snapshot_subtree() {
    let storage = MemorySnapshotStorage::default();
    let snapshot = write_document(&storage, SummarizerConfig::default(), &["/default"]).await;
    let loaded = load_document(&storage, snapshot, SummarizerConfig::default()).await;

    assert_eq!(
        Err(Error::MissingSnapshotSubtree("/missing".into())),
        loaded
            .tree
            .root()
            .create_child(
                "missing",
                CreationSource::FromExistingSummary,
                NodeProviders::default()
            )
            .map(|_| ())
    );
}

#[tokio::test]
async fn corrupt_metadata() {
    let storage = MemorySnapshotStorage::default();
    let mut snapshot = write_document(&storage, SummarizerConfig::default(), &["/default"]).await;
    let id = storage.put_blob("not json".into());
    snapshot.blobs.insert(".metadata".to_string(), id);

    let result = SummarizerNodeTree::builder(SummarizerConfig::default())
        .load(&storage, snapshot, 10)
        .await;
    assert!(matches!(result, Err(Error::InvalidMetadata(_))));
}
