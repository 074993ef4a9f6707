use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{instrument, warn};

use super::{SnapshotStorage, SnapshotTree};
use crate::summary::{HandleType, SummaryHandle, SummaryObject, SummaryTree};
use crate::{B3Digest, Error};

/// Keeps blobs in memory, keyed by their BLAKE3 digest.
#[derive(Clone, Default)]
pub struct MemorySnapshotStorage {
    db: Arc<RwLock<HashMap<B3Digest, Bytes>>>,
}

impl MemorySnapshotStorage {
    /// Stores a blob and returns its content id.
    pub fn put_blob(&self, contents: Bytes) -> String {
        let digest = B3Digest::of(&contents);
        let id = digest.to_string();
        self.db.write().insert(digest, contents);
        id
    }

    fn write_tree(
        &self,
        summary: &SummaryTree,
        previous: Option<&SnapshotTree>,
    ) -> Result<SnapshotTree, Error> {
        let mut snapshot = SnapshotTree {
            unreferenced: summary.unreferenced,
            ..Default::default()
        };

        for (name, object) in &summary.tree {
            match object {
                SummaryObject::Blob(blob) => {
                    let id = self.put_blob(blob.content.clone());
                    snapshot.blobs.insert(name.clone(), id);
                }
                SummaryObject::Tree(tree) => {
                    let subtree = self.write_tree(tree, previous)?;
                    snapshot.trees.insert(name.clone(), subtree);
                }
                SummaryObject::Handle(handle) => {
                    let previous = previous
                        .ok_or_else(|| Error::MissingSnapshotSubtree(handle.handle.clone()))?;
                    resolve_handle(previous, handle, name, &mut snapshot)?;
                }
            }
        }

        Ok(snapshot)
    }
}

/// Copies the object a handle points to from the previous snapshot.
fn resolve_handle(
    previous: &SnapshotTree,
    handle: &SummaryHandle,
    name: &str,
    snapshot: &mut SnapshotTree,
) -> Result<(), Error> {
    let missing = || Error::MissingSnapshotSubtree(handle.handle.clone());
    match handle.handle_type {
        HandleType::Tree => {
            let tree = previous.descend(&handle.handle).ok_or_else(missing)?;
            snapshot.trees.insert(name.to_string(), tree.clone());
        }
        HandleType::Blob => {
            let (parent, blob_name) = handle.handle.rsplit_once('/').ok_or_else(missing)?;
            let id = previous
                .descend(parent)
                .and_then(|tree| tree.blobs.get(blob_name))
                .ok_or_else(missing)?;
            snapshot.blobs.insert(name.to_string(), id.clone());
        }
    }
    Ok(())
}

#[async_trait]
impl SnapshotStorage for MemorySnapshotStorage {
    #[instrument(skip(self))]
    async fn read_blob(&self, id: &str) -> Result<Option<Bytes>, Error> {
        let digest: B3Digest = id.parse()?;
        let db = self.db.read();

        match db.get(&digest) {
            None => Ok(None),
            Some(contents) => {
                // Validate the stored contents still match their id, to detect
                // corruptions.
                let actual_digest = B3Digest::of(contents);
                if actual_digest != digest {
                    warn!(blob.digest = %digest, "blob content mismatch");
                    return Err(Error::StorageError(format!(
                        "requested blob {}, but got {}",
                        digest, actual_digest
                    )));
                }
                Ok(Some(contents.clone()))
            }
        }
    }

    #[instrument(skip_all)]
    async fn write_summary(
        &self,
        summary: &SummaryTree,
        previous: Option<&SnapshotTree>,
    ) -> Result<SnapshotTree, Error> {
        self.write_tree(summary, previous)
    }
}
