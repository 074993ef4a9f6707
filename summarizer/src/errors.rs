use thiserror::Error;

/// Errors surfaced by the summarizer node tree, the garbage collector and the
/// summary/snapshot layers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no GC data provider registered for {0}, and no cached or initial GC data available")]
    MissingGCProvider(String),

    #[error("no summarize provider registered for {0}")]
    MissingSummarizeProvider(String),

    #[error("{parent} already has a child named {id:?}")]
    DuplicateChild { parent: String, id: String },

    #[error("{0:?} is a reserved name and can not be used as a data store id")]
    ReservedNameConflict(String),

    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),

    #[error("{0} has no matching subtree in the base snapshot")]
    MissingSnapshotSubtree(String),

    #[error("a summary is already in progress at reference sequence number {0}")]
    SummaryInProgress(u64),

    #[error("no summary in progress")]
    NoSummaryInProgress,

    #[error("the node tree can not be modified while a summary is in progress")]
    TreeLockedBySummary,

    #[error("ack for reference sequence number {acked} does not match the summary in progress at {expected}")]
    AckMismatch { expected: u64, acked: u64 },

    #[error("node is no longer part of the tree")]
    UnknownNode,

    #[error("summary entry {0:?} is already present")]
    DuplicateSummaryEntry(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("unknown format version: {0}")]
    UnknownFormatVersion(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("storage error: {0}")]
    StorageError(String),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::InvalidMetadata(value.to_string())
    }
}

impl From<crate::digests::Error> for Error {
    fn from(value: crate::digests::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}
