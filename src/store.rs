//! Chunk store: staging area for in-progress upload sessions.
//!
//! Layout inside the object store, one prefix per upload id:
//!
//! ```text
//! <upload_id>/session.json        UploadSession descriptor
//! <upload_id>/chunk-000000.part   chunk 0
//! <upload_id>/chunk-000001.part   chunk 1
//! ```
//!
//! All state lives here, none in process memory, so any server instance can
//! serve any request of a session. Backends follow the usual object_store
//! providers (local directory, S3-compatible, in-memory for tests).

use crate::config::ChunkBackend;
use crate::error::StoreError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path as ObjectPath,
    ObjectStore, PutPayload,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DESCRIPTOR_NAME: &str = "session.json";
const CHUNK_PREFIX: &str = "chunk-";
const CHUNK_SUFFIX: &str = ".part";

/// Persisted record of one chunked upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub original_filename: String,
    pub size_bytes: u64,
    pub temp_identifier: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    /// Indices in `[0, total_chunks)` not present in `uploaded`.
    pub fn missing_chunks(&self, uploaded: &[u64]) -> Vec<u64> {
        let present: BTreeSet<u64> = uploaded.iter().copied().collect();
        (0..self.total_chunks).filter(|i| !present.contains(i)).collect()
    }
}

/// Object name for chunk `index`.
pub fn chunk_object_name(index: u64) -> String {
    format!("{CHUNK_PREFIX}{index:06}{CHUNK_SUFFIX}")
}

/// Inverse of [`chunk_object_name`].
pub fn parse_chunk_index(name: &str) -> Option<u64> {
    name.strip_prefix(CHUNK_PREFIX)?
        .strip_suffix(CHUNK_SUFFIX)?
        .parse()
        .ok()
}

#[derive(Clone)]
pub struct ChunkStore {
    store: Arc<dyn ObjectStore>,
    /// Root directory of the local backend, whose session directories
    /// outlive their objects
    local_root: Option<PathBuf>,
}

impl ChunkStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store, local_root: None }
    }

    /// Local directory backend rooted at `path`.
    pub fn local(path: &Path) -> Result<Self, StoreError> {
        info!("Chunk store: local directory {:?}", path);
        std::fs::create_dir_all(path)?;
        let store = LocalFileSystem::new_with_prefix(path)?.with_automatic_cleanup(true);
        Ok(Self {
            store: Arc::new(store),
            local_root: Some(path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Open the configured backend.
    pub fn from_backend(backend: &ChunkBackend) -> Result<Self, StoreError> {
        let store: Arc<dyn ObjectStore> = match backend {
            ChunkBackend::Local { path } => return Self::local(path),
            ChunkBackend::S3 {
                bucket,
                region,
                endpoint,
            } => {
                info!("Chunk store: S3 bucket={}, region={}", bucket, region);
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region(region);
                if let Some(ep) = endpoint {
                    info!("Using custom S3 endpoint: {}", ep);
                    builder = builder.with_endpoint(ep).with_virtual_hosted_style_request(false);
                }
                Arc::new(builder.build()?)
            }
            ChunkBackend::Memory => {
                warn!("Chunk store: in-memory, sessions will not survive a restart");
                Arc::new(InMemory::new())
            }
        };
        Ok(Self::new(store))
    }

    fn descriptor_path(upload_id: &str) -> ObjectPath {
        ObjectPath::from(format!("{upload_id}/{DESCRIPTOR_NAME}"))
    }

    fn chunk_path(upload_id: &str, index: u64) -> ObjectPath {
        ObjectPath::from(format!("{upload_id}/{}", chunk_object_name(index)))
    }

    fn session_prefix(upload_id: &str) -> ObjectPath {
        ObjectPath::from(upload_id)
    }

    /// Persist the descriptor, which is what makes the session exist.
    pub async fn create_session(&self, session: &UploadSession) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(session)?;
        self.store
            .put(&Self::descriptor_path(&session.upload_id), PutPayload::from(data))
            .await?;
        debug!(
            "Created chunk session {} ({} chunks of {} bytes)",
            session.upload_id, session.total_chunks, session.chunk_size
        );
        Ok(())
    }

    /// `None` when no descriptor exists.
    pub async fn load_session(&self, upload_id: &str) -> Result<Option<UploadSession>, StoreError> {
        match self.store.get(&Self::descriptor_path(upload_id)).await {
            Ok(result) => {
                let data = result.bytes().await?;
                Ok(Some(serde_json::from_slice(&data)?))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write (or overwrite) one chunk.
    pub async fn put_chunk(&self, upload_id: &str, index: u64, data: Bytes) -> Result<(), StoreError> {
        let size = data.len();
        self.store
            .put(&Self::chunk_path(upload_id, index), PutPayload::from_bytes(data))
            .await?;
        debug!("Stored chunk {} of {} ({} bytes)", index, upload_id, size);
        Ok(())
    }

    /// Byte stream of one chunk; `None` when the chunk is absent.
    pub async fn open_chunk(
        &self,
        upload_id: &str,
        index: u64,
    ) -> Result<Option<BoxStream<'static, Result<Bytes, StoreError>>>, StoreError> {
        match self.store.get(&Self::chunk_path(upload_id, index)).await {
            Ok(result) => Ok(Some(result.into_stream().map_err(StoreError::from).boxed())),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Sorted indices of the chunks present for a session.
    pub async fn list_chunks(&self, upload_id: &str) -> Result<Vec<u64>, StoreError> {
        let prefix = Self::session_prefix(upload_id);
        let mut listing = self.store.list(Some(&prefix));
        let mut indices = BTreeSet::new();

        while let Some(meta) = listing.try_next().await? {
            if let Some(index) = meta.location.filename().and_then(parse_chunk_index) {
                indices.insert(index);
            }
        }

        Ok(indices.into_iter().collect())
    }

    /// Remove the descriptor and every chunk of a session, plus its
    /// directory on the local backend. Returns the number of objects removed.
    pub async fn delete_session(&self, upload_id: &str) -> Result<usize, StoreError> {
        let prefix = Self::session_prefix(upload_id);
        let locations: Vec<ObjectPath> = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;

        let mut removed = 0;
        for location in locations {
            match self.store.delete(&location).await {
                Ok(()) => removed += 1,
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.remove_local_dir(upload_id).await?;
        debug!("Deleted chunk session {} ({} objects)", upload_id, removed);
        Ok(removed)
    }

    async fn remove_local_dir(&self, upload_id: &str) -> Result<(), StoreError> {
        let Some(root) = &self.local_root else {
            return Ok(());
        };
        match tokio::fs::remove_dir_all(root.join(upload_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Upload ids with anything stored under them.
    pub async fn list_session_ids(&self) -> Result<Vec<String>, StoreError> {
        let listing = self.store.list_with_delimiter(None).await?;
        Ok(listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.parts().last().map(|part| part.as_ref().to_string()))
            .collect())
    }
}
