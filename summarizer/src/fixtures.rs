//! Canned GC data and static providers, used by the tests and the
//! `tree-summarizer` binary.
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use lazy_static::lazy_static;
use parking_lot::RwLock;

use crate::gc::GCData;
use crate::metadata::{ChannelAttributes, DataStoreAttributes};
use crate::summarizer_node::{
    GCDataProvider, InitialGCDataProvider, SummarizeInternal, SummarizeInternalResult,
};
use crate::summary::{
    SummaryTreeBuilder, CHANNEL_ATTRIBUTES_BLOB_NAME, DATA_STORE_ATTRIBUTES_BLOB_NAME,
};
use crate::Error;

pub fn gc_data(nodes: &[(&str, &[&str])]) -> GCData {
    nodes
        .iter()
        .map(|(id, routes)| (*id, routes.iter().copied()))
        .collect()
}

lazy_static! {
    pub static ref GC_DATA_A: GCData = gc_data(&[("/", &["/a", "/b"]), ("/a", &["/a/x"])]);
    pub static ref GC_DATA_B: GCData = gc_data(&[("/", &["/c"])]);

    /// Initial GC data as loaded from an old snapshot, with ids not yet
    /// rooted at `/`.
    pub static ref INITIAL_GC_DATA: GCData = gc_data(&[
        ("/", &["/a"]),
        ("a", &["/"]),
        ("b", &["/a/x", "/b/x"]),
    ]);
}

/// Summarizes to a fixed set of blobs, counting its invocations.
#[derive(Debug)]
pub struct StaticSummarizer {
    id: String,
    blobs: Vec<(String, Bytes)>,
    calls: AtomicUsize,
}

impl StaticSummarizer {
    pub fn new<K: Into<String>, V: Into<Bytes>>(
        id: impl Into<String>,
        blobs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            id: id.into(),
            blobs: blobs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Summarizes to an empty tree.
    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, Vec::<(String, Bytes)>::new())
    }

    /// A data store writing its `.component` blob.
    pub fn data_store(
        id: impl Into<String>,
        package_path: &[String],
        isolated_channels: bool,
    ) -> Result<Self, Error> {
        let attributes = DataStoreAttributes::new(package_path, true, isolated_channels)?;
        Ok(Self::new(
            id,
            [(DATA_STORE_ATTRIBUTES_BLOB_NAME, attributes.to_blob()?)],
        ))
    }

    /// A channel writing its `.attributes` blob.
    pub fn channel(id: impl Into<String>, channel_type: &str) -> Result<Self, Error> {
        let attributes = ChannelAttributes::new(channel_type);
        Ok(Self::new(
            id,
            [(CHANNEL_ATTRIBUTES_BLOB_NAME, attributes.to_blob()?)],
        ))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SummarizeInternal for StaticSummarizer {
    async fn summarize_internal(
        &self,
        _full_tree: bool,
        _track_state: bool,
    ) -> Result<SummarizeInternalResult, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut builder = SummaryTreeBuilder::new();
        for (name, contents) in &self.blobs {
            builder.add_blob(name.clone(), contents.clone())?;
        }
        Ok(SummarizeInternalResult {
            id: self.id.clone(),
            summary: builder.summary(),
        })
    }
}

/// Always fails to summarize.
#[derive(Debug, Default)]
pub struct FailingSummarizer;

#[async_trait]
impl SummarizeInternal for FailingSummarizer {
    async fn summarize_internal(
        &self,
        _full_tree: bool,
        _track_state: bool,
    ) -> Result<SummarizeInternalResult, Error> {
        Err(Error::Provider("summarizer failed".into()))
    }
}

/// Hands out GC data which can be swapped from the outside.
#[derive(Debug, Default)]
pub struct MutableGCData {
    data: RwLock<GCData>,
    calls: AtomicUsize,
}

impl MutableGCData {
    pub fn new(data: GCData) -> Self {
        Self {
            data: RwLock::new(data),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, data: GCData) {
        *self.data.write() = data;
    }

    /// Changes the backing data in place.
    pub fn update(&self, f: impl FnOnce(&mut GCData)) {
        f(&mut self.data.write())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GCDataProvider for MutableGCData {
    async fn gc_data(&self, _full_gc: bool) -> Result<GCData, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.data.read().clone())
    }
}

#[derive(Debug, Default)]
pub struct StaticInitialGCData {
    data: Option<GCData>,
    calls: AtomicUsize,
}

impl StaticInitialGCData {
    pub fn new(data: Option<GCData>) -> Self {
        Self {
            data,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InitialGCDataProvider for StaticInitialGCData {
    async fn initial_gc_data(&self) -> Result<Option<GCData>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.data.clone())
    }
}
