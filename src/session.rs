//! Resumable upload protocol: init, status, chunk, complete.
//!
//! Every operation is stateless in-process; the session lives entirely in the
//! [`ChunkStore`], so requests for one upload may land on any instance.

use crate::assembler::{assemble, AssemblyError};
use crate::config::Limits;
use crate::error::UploadError;
use crate::ids::{is_safe_id, new_upload_id};
use crate::metrics::UploadMetrics;
use crate::store::{ChunkStore, UploadSession};
use crate::temp_area::{SidecarMeta, TempArea};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub filename: String,
    pub size: i64,
    pub temp_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitResponse {
    pub upload_id: String,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub upload_id: String,
    pub uploaded_chunks: Vec<u64>,
    pub total_chunks: u64,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub upload_id: String,
    /// Hex SHA-256 of the whole file, checked when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Where a finished file ended up. Shared by the chunked and single-shot paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentResponse {
    pub original_filename: String,
    /// `<temp_identifier>/<filename>`
    pub path: String,
    pub url: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Clone)]
pub struct UploadService {
    chunks: ChunkStore,
    temp: TempArea,
    limits: Limits,
    public_base_url: String,
    metrics: Arc<UploadMetrics>,
}

impl UploadService {
    pub fn new(chunks: ChunkStore, temp: TempArea, limits: Limits, public_base_url: impl Into<String>) -> Self {
        Self {
            chunks,
            temp,
            limits,
            public_base_url: public_base_url.into(),
            metrics: Arc::new(UploadMetrics::new()),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn temp_area(&self) -> &TempArea {
        &self.temp
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn metrics(&self) -> &UploadMetrics {
        &self.metrics
    }

    /// Public URL of a temp file.
    pub fn temp_url(&self, temp_identifier: &str, filename: &str) -> String {
        format!("{}/attachments/temp/{}/{}", self.public_base_url, temp_identifier, filename)
    }

    fn check_size(&self, size: i64) -> Result<u64, UploadError> {
        if size <= 0 {
            return Err(UploadError::validation("invalid_size", "size must be a positive integer"));
        }
        let size = size as u64;
        if size > self.limits.max_upload_bytes() {
            return Err(UploadError::validation(
                "file_too_large",
                format!("file is {} bytes, limit is {}", size, self.limits.max_upload_bytes()),
            ));
        }
        Ok(size)
    }

    fn check_common(filename: &str, temp_identifier: &str) -> Result<(), UploadError> {
        if filename.trim().is_empty() {
            return Err(UploadError::validation("invalid_filename", "filename is required"));
        }
        if !is_safe_id(temp_identifier) {
            return Err(UploadError::validation(
                "invalid_temp_identifier",
                "temp_identifier may only contain letters, digits, '-' and '_'",
            ));
        }
        Ok(())
    }

    /// Looks a session up, treating unsafe ids exactly like unknown ones.
    async fn find(&self, upload_id: &str) -> Result<UploadSession, UploadError> {
        if !is_safe_id(upload_id) {
            debug!("Rejected unsafe upload id {:?}", upload_id);
            return Err(UploadError::NotFound);
        }
        self.chunks.load_session(upload_id).await?.ok_or(UploadError::NotFound)
    }

    pub async fn init(&self, req: InitRequest) -> Result<InitResponse, UploadError> {
        let size = self.check_size(req.size)?;
        Self::check_common(&req.filename, &req.temp_identifier)?;

        let session = UploadSession {
            upload_id: new_upload_id(),
            original_filename: req.filename.trim().to_string(),
            size_bytes: size,
            temp_identifier: req.temp_identifier,
            mime_type: req.mime_type.filter(|m| !m.is_empty()),
            chunk_size: self.limits.chunk_size(),
            total_chunks: self.limits.total_chunks(size),
            created_at: Utc::now(),
        };
        self.chunks.create_session(&session).await?;
        self.metrics.sessions_started.fetch_add(1, Ordering::Relaxed);

        info!(
            "Upload {} started: {:?} ({} bytes, {} chunks)",
            session.upload_id, session.original_filename, size, session.total_chunks
        );

        Ok(InitResponse {
            upload_id: session.upload_id,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            max_bytes: self.limits.max_upload_bytes(),
        })
    }

    pub async fn status(&self, upload_id: &str) -> Result<StatusResponse, UploadError> {
        let session = self.find(upload_id).await?;
        let uploaded_chunks = self.chunks.list_chunks(upload_id).await?;

        Ok(StatusResponse {
            upload_id: session.upload_id,
            uploaded_chunks,
            total_chunks: session.total_chunks,
            chunk_size: session.chunk_size,
        })
    }

    /// Stores one chunk. Re-sending an index overwrites it.
    pub async fn put_chunk(&self, upload_id: &str, chunk_index: i64, data: Bytes) -> Result<(), UploadError> {
        let session = self.find(upload_id).await?;

        if chunk_index < 0 || chunk_index as u64 >= session.total_chunks {
            return Err(UploadError::validation(
                "chunk_index_out_of_range",
                format!("chunk_index must be in [0, {})", session.total_chunks),
            ));
        }
        if data.len() as u64 > session.chunk_size {
            return Err(UploadError::validation(
                "chunk_too_large",
                format!("chunk is {} bytes, chunk size is {}", data.len(), session.chunk_size),
            ));
        }

        let size = data.len();
        self.chunks.put_chunk(upload_id, chunk_index as u64, data).await?;
        self.metrics.record_chunk(size);
        Ok(())
    }

    pub async fn complete(&self, req: CompleteRequest) -> Result<AttachmentResponse, UploadError> {
        let started = Instant::now();
        let session = self.find(&req.upload_id).await?;

        let uploaded = self.chunks.list_chunks(&session.upload_id).await?;
        let missing = session.missing_chunks(&uploaded);
        if !missing.is_empty() {
            self.metrics.completes_conflicted.fetch_add(1, Ordering::Relaxed);
            debug!("Upload {} completed early, missing {:?}", session.upload_id, missing);
            return Err(UploadError::MissingChunks { missing });
        }

        let assembled = match assemble(&self.chunks, &self.temp, &session).await {
            Ok(a) => a,
            Err(AssemblyError::SizeMismatch { expected, actual }) => {
                self.metrics.assemblies_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(UploadError::validation(
                    "size_mismatch",
                    format!("received {} bytes, expected {}", actual, expected),
                ));
            }
            // The chunk vanished between listing and reading: report it like
            // any other missing chunk so the client re-sends it.
            Err(AssemblyError::MissingChunk(index)) => {
                self.metrics.completes_conflicted.fetch_add(1, Ordering::Relaxed);
                return Err(UploadError::MissingChunks { missing: vec![index] });
            }
            Err(AssemblyError::Store(e)) => return Err(e.into()),
        };

        if let Some(expected) = req.sha256.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            if !expected.eq_ignore_ascii_case(&assembled.sha256) {
                warn!("Upload {} digest mismatch", session.upload_id);
                TempArea::remove_output(&assembled.path).await;
                self.metrics.assemblies_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(UploadError::validation(
                    "digest_mismatch",
                    "assembled file does not match the supplied sha256",
                ));
            }
        }

        let meta = SidecarMeta {
            original_filename: session.original_filename.clone(),
            size_bytes: assembled.size_bytes,
            sha256: Some(assembled.sha256.clone()),
            mime_type: session.mime_type.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.temp.write_sidecar(&assembled.path, &meta).await {
            TempArea::remove_output(&assembled.path).await;
            return Err(e.into());
        }

        // Leftovers are picked up by the stale-session sweep
        if let Err(e) = self.chunks.delete_session(&session.upload_id).await {
            warn!("Failed to delete chunk session {}: {}", session.upload_id, e);
        }

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record_completed(latency_ms);
        info!(
            "Upload {} assembled into {}/{} ({} bytes, {:.1}ms)",
            session.upload_id, session.temp_identifier, assembled.filename, assembled.size_bytes, latency_ms
        );

        Ok(AttachmentResponse {
            original_filename: session.original_filename,
            path: format!("{}/{}", session.temp_identifier, assembled.filename),
            url: self.temp_url(&session.temp_identifier, &assembled.filename),
            size_bytes: assembled.size_bytes,
            sha256: Some(assembled.sha256),
        })
    }

    /// Drops an unfinished session and its chunks.
    pub async fn abort(&self, upload_id: &str) -> Result<(), UploadError> {
        let session = self.find(upload_id).await?;
        self.chunks.delete_session(&session.upload_id).await?;
        info!("Upload {} aborted", session.upload_id);
        Ok(())
    }

    /// Non-chunked upload straight into the temp area.
    pub async fn upload_single(
        &self,
        temp_identifier: &str,
        filename: &str,
        data: &[u8],
        mime_type: Option<String>,
    ) -> Result<AttachmentResponse, UploadError> {
        self.check_size(data.len() as i64)?;
        Self::check_common(filename, temp_identifier)?;

        let stored = self.temp.store(temp_identifier, filename.trim(), data, mime_type).await?;
        self.metrics.single_uploads.fetch_add(1, Ordering::Relaxed);

        Ok(AttachmentResponse {
            original_filename: filename.trim().to_string(),
            path: format!("{}/{}", temp_identifier, stored.filename),
            url: self.temp_url(temp_identifier, &stored.filename),
            size_bytes: stored.size_bytes,
            sha256: Some(stored.sha256),
        })
    }

    /// Deletes chunk sessions created more than `ttl` ago, plus prefixes whose
    /// descriptor is gone or unreadable.
    pub async fn sweep_stale_sessions(&self, ttl: Duration) -> Result<usize, UploadError> {
        let cutoff = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let mut removed = 0;

        for upload_id in self.chunks.list_session_ids().await? {
            let stale = match self.chunks.load_session(&upload_id).await {
                Ok(Some(session)) => cutoff.is_some_and(|c| session.created_at < c),
                Ok(None) => true,
                Err(e) => {
                    warn!("Unreadable chunk session {}: {}", upload_id, e);
                    true
                }
            };
            if stale {
                self.chunks.delete_session(&upload_id).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            self.metrics.sessions_swept.fetch_add(removed as u64, Ordering::Relaxed);
            info!("Removed {} abandoned chunk sessions", removed);
        }
        Ok(removed)
    }

    /// Deletes temp files older than `retention`.
    pub async fn sweep_temp_area(&self, retention: Duration) -> Result<usize, UploadError> {
        let removed = self.temp.sweep(retention).await?;
        self.metrics.temp_files_swept.fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    /// Spawns the periodic sweep of abandoned sessions and expired temp files.
    pub fn start_periodic_sweeps(&self, interval: Duration, session_ttl: Duration, temp_retention: Duration) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = service.sweep_stale_sessions(session_ttl).await {
                    warn!("Chunk session sweep failed: {}", e);
                }
                if let Err(e) = service.sweep_temp_area(temp_retention).await {
                    warn!("Temp area sweep failed: {}", e);
                }
            }
        });
    }
}
