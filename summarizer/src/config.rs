use serde::{Deserialize, Serialize};
use url::Url;

use crate::path::NodePath;
use crate::Error;

/// Configuration of a [crate::summarizer_node::SummarizerNodeTree].
///
/// Can be constructed from an URL of the form
/// `summarizer://?disable_isolated_channels=true&gc[enabled]=false`, see
/// [SummarizerConfig::from_url].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SummarizerConfig {
    /// Write new documents in the legacy layout, without `.channels` trees
    /// and without a `.metadata` blob.
    #[serde(default)]
    pub disable_isolated_channels: bool,

    #[serde(default)]
    pub gc: GcConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GcConfig {
    /// When disabled, summarizing the tree does not run the collector.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Always recompute GC data from the providers, ignoring all caches.
    #[serde(default)]
    pub full_gc: bool,

    /// Node paths which are treated as GC roots next to `/`.
    #[serde(default)]
    pub pinned_paths: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            full_gc: false,
            pinned_paths: Vec::new(),
        }
    }
}

impl GcConfig {
    /// Parses the pinned paths.
    pub fn pinned_node_paths(&self) -> Result<Vec<NodePath>, Error> {
        self.pinned_paths
            .iter()
            .map(|p| {
                p.parse()
                    .map_err(|_| Error::InvalidConfig(format!("invalid pinned path: {p:?}")))
            })
            .collect()
    }
}

impl SummarizerConfig {
    pub fn from_url(url: &Url) -> Result<Self, Error> {
        if url.scheme() != "summarizer" {
            return Err(Error::InvalidConfig(format!(
                "unknown scheme: {}",
                url.scheme()
            )));
        }
        // summarizer doesn't support host or path in the URL.
        if url.host_str().is_some_and(|h| !h.is_empty()) || !url.path().is_empty() {
            return Err(Error::InvalidConfig("invalid url".to_string()));
        }

        let config: SummarizerConfig = serde_qs::from_str(url.query().unwrap_or_default())
            .map_err(|e| Error::InvalidConfig(format!("failed to parse parameters: {}", e)))?;
        config.gc.pinned_node_paths()?;
        Ok(config)
    }
}

impl std::str::FromStr for SummarizerConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url =
            Url::parse(s).map_err(|e| Error::InvalidConfig(format!("unable to parse url: {}", e)))?;
        Self::from_url(&url)
    }
}
