use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, Level};
use tree_summarizer::config::SummarizerConfig;
use tree_summarizer::fixtures::{MutableGCData, StaticSummarizer};
use tree_summarizer::gc::GCData;
use tree_summarizer::metadata::ChannelAttributes;
use tree_summarizer::summarizer_node::{
    CreationSource, NodeProviders, SummarizeOptions, SummarizerNodeTree,
};
use tree_summarizer::summary::CHANNEL_ATTRIBUTES_BLOB_NAME;
use tree_summarizer_tracing::TracingBuilder;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Whether to log in JSON
    #[arg(long)]
    json: bool,

    #[arg(long)]
    log_level: Option<Level>,

    /// Summarizer configuration, as a `summarizer://?…` URL.
    #[arg(long, env, default_value = "summarizer://")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarizes a document and prints the summary with its GC run.
    Summarize {
        /// Path to the JSON description of the document.
        #[arg(long)]
        document: PathBuf,

        #[arg(long, default_value_t = 1)]
        reference_sequence_number: u64,

        /// Summarize every node, ignoring caches.
        #[arg(long)]
        full_tree: bool,

        /// Recompute all GC data before collecting garbage.
        #[arg(long)]
        full_gc: bool,
    },
    /// Only collects garbage and prints which nodes are unreferenced.
    Gc {
        #[arg(long)]
        document: PathBuf,

        #[arg(long, default_value_t = 1)]
        reference_sequence_number: u64,
    },
}

/// A document as read from the `--document` file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Document {
    /// Outbound routes of the container runtime.
    #[serde(default)]
    routes: Vec<String>,
    #[serde(default)]
    data_stores: BTreeMap<String, DataStore>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct DataStore {
    package_path: Vec<String>,
    #[serde(default)]
    routes: Vec<String>,
    #[serde(default)]
    channels: BTreeMap<String, Channel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Channel {
    #[serde(rename = "type")]
    channel_type: String,
    /// Written as the channel's `content` blob.
    content: Option<String>,
    #[serde(default)]
    routes: Vec<String>,
}

fn static_providers(summarizer: StaticSummarizer, routes: Vec<String>) -> NodeProviders {
    NodeProviders::new()
        .with_summarize(Arc::new(summarizer))
        .with_gc_data(Arc::new(MutableGCData::new(GCData::from_iter([(
            "/", routes,
        )]))))
}

/// Builds a tree for a new document, with static providers for every node.
fn build_tree(
    config: SummarizerConfig,
    document: Document,
) -> Result<SummarizerNodeTree, Box<dyn std::error::Error>> {
    let isolated = !config.disable_isolated_channels;
    let tree = SummarizerNodeTree::builder(config)
        .providers(static_providers(
            StaticSummarizer::empty(""),
            document.routes,
        ))
        .build()?;

    for (id, data_store) in document.data_stores {
        let summarizer = StaticSummarizer::data_store(id.as_str(), &data_store.package_path, isolated)?;
        let node = tree.root().create_child(
            &id,
            CreationSource::CreatedLocally,
            static_providers(summarizer, data_store.routes),
        )?;

        for (channel_id, channel) in data_store.channels {
            let mut blobs = vec![(
                CHANNEL_ATTRIBUTES_BLOB_NAME.to_string(),
                ChannelAttributes::new(channel.channel_type).to_blob()?,
            )];
            if let Some(content) = channel.content {
                blobs.push(("content".to_string(), content));
            }
            node.create_child(
                &channel_id,
                CreationSource::CreatedLocally,
                static_providers(
                    StaticSummarizer::new(channel_id.as_str(), blobs),
                    channel.routes,
                ),
            )?;
        }
    }

    Ok(tree)
}

fn read_document(path: &Path) -> Result<Document, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    TracingBuilder::default()
        .level(cli.log_level.unwrap_or(Level::INFO))
        .json(cli.json)
        .build()?;

    let config: SummarizerConfig = cli.config.parse()?;

    match cli.command {
        Commands::Summarize {
            document,
            reference_sequence_number,
            full_tree,
            full_gc,
        } => {
            let tree = build_tree(config, read_document(&document)?)?;
            let summary = tree
                .summarize(SummarizeOptions {
                    reference_sequence_number,
                    full_tree,
                    full_gc,
                })
                .await?;
            info!(
                stats.tree_node_count = summary.result.stats.tree_node_count,
                stats.blob_node_count = summary.result.stats.blob_node_count,
                "summarized document"
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Gc {
            document,
            reference_sequence_number,
        } => {
            let tree = build_tree(config, read_document(&document)?)?;
            let gc = tree
                .collect_garbage(reference_sequence_number, true)
                .await?;
            info!(
                unreferenced = gc.unreferenced.len(),
                "collected garbage"
            );
            println!("{}", serde_json::to_string_pretty(&gc)?);
        }
    }

    Ok(())
}
