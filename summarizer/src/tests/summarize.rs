use std::collections::BTreeSet;

use pretty_assertions::assert_eq;
use rstest::rstest;

use super::{legacy_config, two_level_tree};
use crate::config::SummarizerConfig;
use crate::metadata::{ChannelAttributes, ContainerRuntimeMetadata, DataStoreAttributes};
use crate::summarizer_node::SummarizeOptions;
use crate::summary::{SummaryObject, SummaryTree};

fn as_tree(object: &SummaryObject) -> &SummaryTree {
    match object {
        SummaryObject::Tree(tree) => tree,
        other => panic!("expected a tree, got {other:?}"),
    }
}

fn blob<'a>(tree: &'a SummaryTree, name: &str) -> &'a [u8] {
    match tree.get(name) {
        Some(SummaryObject::Blob(blob)) => &blob.content,
        other => panic!("expected blob {name}, got {other:?}"),
    }
}

fn gc_node_ids(gc_data: &crate::gc::GCData) -> BTreeSet<&str> {
    gc_data.node_ids().collect()
}

#[tokio::test]
async fn isolated_channels() {
    let tree = two_level_tree(SummarizerConfig::default(), &["/default"]);
    tree.tree.start_summary(10).unwrap();

    let result = tree.root_node().summarize(false).await.unwrap();
    let root = as_tree(&result.summary);

    let metadata = ContainerRuntimeMetadata::from_blob(blob(root, ".metadata")).unwrap();
    assert_eq!(ContainerRuntimeMetadata::current(), metadata);

    let data_store = root
        .subtree(".channels")
        .and_then(|channels| channels.subtree("default"))
        .expect("data store under .channels");
    let attributes = DataStoreAttributes::from_blob(blob(data_store, ".component")).unwrap();
    assert!(attributes.has_isolated_channels());
    assert_eq!(
        vec!["@fluid-example/pkg".to_string()],
        attributes.package_path().unwrap()
    );

    let channel = data_store
        .subtree(".channels")
        .and_then(|channels| channels.subtree("root"))
        .expect("channel under .channels");
    assert_eq!(
        "https://graph.microsoft.com/types/map",
        ChannelAttributes::from_blob(blob(channel, ".attributes"))
            .unwrap()
            .channel_type
    );

    assert!(result.stats.tree_node_count >= 5);
    assert!(result.stats.blob_node_count >= 3);
    assert_eq!(5, result.stats.tree_node_count);
    assert_eq!(3, result.stats.blob_node_count);
    assert_eq!(
        BTreeSet::from(["/", "/default", "/default/root"]),
        gc_node_ids(&result.gc_data)
    );
}

#[tokio::test]
async fn legacy_layout() {
    let tree = two_level_tree(legacy_config(), &["/default"]);
    tree.tree.start_summary(10).unwrap();

    let result = tree.root_node().summarize(false).await.unwrap();
    let root = as_tree(&result.summary);

    assert!(root.get(".metadata").is_none());
    assert!(root.get(".channels").is_none());
    let data_store = root.subtree("default").expect("data store at the root");
    assert!(data_store.get(".channels").is_none());
    let attributes = DataStoreAttributes::from_blob(blob(data_store, ".component")).unwrap();
    assert!(!attributes.has_isolated_channels());
    let channel = data_store.subtree("root").expect("channel next to .component");
    blob(channel, ".attributes");

    assert!(result.stats.tree_node_count >= 3);
    assert!(result.stats.blob_node_count >= 2);
    assert_eq!(3, result.stats.tree_node_count);
    assert_eq!(2, result.stats.blob_node_count);
    assert_eq!(
        BTreeSet::from(["/", "/default", "/default/root"]),
        gc_node_ids(&result.gc_data)
    );
}

/// Once committed, unchanged subtrees are written as handles to their
/// location in the previous summary.
#[rstest]
#[case::isolated(SummarizerConfig::default(), "/.channels/default/.channels/root")]
#[case::legacy(legacy_config(), "/default/root")]
#[tokio::test]
async fn unchanged_children_become_handles(
    #[case] config: SummarizerConfig,
    #[case] expected_handle: &str,
) {
    let tree = two_level_tree(config, &["/default"]);
    tree.tree.start_summary(10).unwrap();
    tree.root_node().summarize(false).await.unwrap();
    tree.tree.complete_summary(10).unwrap();

    tree.data_store_node().invalidate(11).unwrap();
    tree.tree.start_summary(12).unwrap();
    let result = tree.root_node().summarize(false).await.unwrap();

    let channel = find(&result.summary, expected_handle).expect("channel entry");
    assert_eq!(
        &SummaryObject::Handle(crate::summary::SummaryHandle {
            handle: expected_handle.to_string(),
            handle_type: crate::summary::HandleType::Tree,
        }),
        channel
    );
    assert_eq!(1, result.stats.handle_node_count);
    assert_eq!(1, tree.channel.summarizer.calls());
    assert_eq!(2, tree.data_store.summarizer.calls());
}

fn find<'a>(object: &'a SummaryObject, path: &str) -> Option<&'a SummaryObject> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .try_fold(object, |object, name| as_tree(object).get(name))
}

#[tokio::test]
async fn orchestrated_pass_marks_unreferenced() {
    // The root references nothing, so the data store and its channel are
    // unreferenced.
    let tree = two_level_tree(SummarizerConfig::default(), &[]);

    let summary = tree
        .tree
        .summarize(SummarizeOptions {
            reference_sequence_number: 10,
            ..Default::default()
        })
        .await
        .unwrap();

    let gc = summary.gc.expect("gc is enabled");
    assert_eq!(
        vec!["/default", "/default/root"],
        gc.unreferenced.keys().map(String::as_str).collect::<Vec<_>>()
    );
    assert!(gc.unreferenced.values().all(|since| *since == 10));

    let data_store = find(&summary.result.summary, "/.channels/default").unwrap();
    assert!(as_tree(data_store).unreferenced);
    assert!(as_tree(find(data_store, "/.channels/root").unwrap()).unreferenced);
    assert!(!as_tree(&summary.result.summary).unreferenced);
    assert_eq!(2, summary.result.stats.unreferenced_node_count);
}

#[tokio::test]
async fn revived_node_is_resummarized() {
    let tree = two_level_tree(SummarizerConfig::default(), &[]);
    let options = |reference_sequence_number| SummarizeOptions {
        reference_sequence_number,
        ..Default::default()
    };

    tree.tree.summarize(options(10)).await.unwrap();
    tree.tree.complete_summary(10).unwrap();

    // the root now references the data store again.
    tree.root
        .gc
        .set(crate::fixtures::gc_data(&[("/", &["/default"])]));
    tree.root_node().invalidate_references(11).unwrap();

    let summary = tree.tree.summarize(options(12)).await.unwrap();
    let gc = summary.gc.unwrap();
    assert_eq!(
        BTreeSet::from(["/default".to_string(), "/default/root".to_string()]),
        gc.revived
    );
    let data_store = find(&summary.result.summary, "/.channels/default").unwrap();
    assert!(!as_tree(data_store).unreferenced);
    assert_eq!(0, summary.result.stats.unreferenced_node_count);
}

#[tokio::test]
async fn gc_disabled() {
    let mut config = SummarizerConfig::default();
    config.gc.enabled = false;
    let tree = two_level_tree(config, &[]);

    let summary = tree
        .tree
        .summarize(SummarizeOptions {
            reference_sequence_number: 10,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(None, summary.gc);
    assert!(summary.result.gc_data.is_empty());
    assert_eq!(0, tree.root.gc.calls());
}

#[tokio::test]
async fn attach_summary_is_untracked() {
    let tree = two_level_tree(SummarizerConfig::default(), &["/default"]);

    let result = tree.data_store_node().attach_summary().await.unwrap();
    assert_eq!("default", result.id);
    assert_eq!(3, result.stats.tree_node_count);
    assert_eq!(None, tree.tree.summary_in_progress());
    assert_eq!(None, tree.data_store_node().latest_summary().unwrap());
}
