//! Client upload engine: drives one file at a time through
//! `pending → initializing → uploading → completing → done`, with `failed`
//! reachable from the three middle states.
//!
//! Chunks of a file are sent one after another. Each chunk gets
//! `retry_limit` extra attempts with a linear backoff, and the server is
//! asked for the session status between attempts in case an earlier attempt
//! landed after all.

use super::source::{chunk_range, UploadFile};
use super::transport::{ByteProgress, UploadTransport};
use crate::config::{Limits, CHUNK_RETRY_BACKOFF_MS, CHUNK_RETRY_LIMIT};
use crate::error::ClientError;
use crate::session::{AttachmentResponse, CompleteRequest, InitRequest};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receives the overall percentage (0-100) of a file.
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Initializing,
    Uploading,
    Completing,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub limits: Limits,
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    /// Upper bound on one whole file upload; `None` means unbounded
    pub deadline: Option<Duration>,
    /// Send the file's SHA-256 with `complete`
    pub verify_digest: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            retry_limit: CHUNK_RETRY_LIMIT,
            retry_backoff: Duration::from_millis(CHUNK_RETRY_BACKOFF_MS),
            deadline: None,
            verify_digest: true,
        }
    }
}

/// One file tracked by the engine.
#[derive(Debug, Clone)]
pub struct ClientUploadTask {
    pub id: TaskId,
    pub file: UploadFile,
    pub temp_identifier: String,
    pub upload_id: Option<String>,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub uploaded_chunks: BTreeSet<u64>,
    pub status: UploadStatus,
    pub progress_percent: u8,
    /// Opaque handle of the document node standing in for this upload
    pub placeholder: Option<String>,
    cancelled: Arc<AtomicBool>,
}

impl ClientUploadTask {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

pub struct UploadEngine {
    transport: Arc<dyn UploadTransport>,
    options: EngineOptions,
    tasks: DashMap<TaskId, ClientUploadTask>,
    next_id: AtomicU64,
}

/// Turns byte counts into de-duplicated percentage callbacks.
struct ProgressReporter {
    total: u64,
    last: AtomicI16,
    callback: ProgressCallback,
}

impl ProgressReporter {
    fn percent(done: u64, total: u64) -> u8 {
        if total == 0 {
            return 100;
        }
        ((done.min(total) as f64 * 100.0 / total as f64).round()) as u8
    }

    /// Reports only increases; a retried chunk restarting its byte count
    /// never moves the percentage back.
    fn report(&self, done: u64) -> u8 {
        let percent = Self::percent(done, self.total);
        let prev = self.last.fetch_max(percent as i16, Ordering::Relaxed);
        if prev < percent as i16 {
            (self.callback)(percent);
            return percent;
        }
        prev.max(0) as u8
    }
}

impl UploadEngine {
    pub fn new(transport: Arc<dyn UploadTransport>, options: EngineOptions) -> Self {
        Self {
            transport,
            options,
            tasks: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Admits a file into the working set. Oversized or empty files are
    /// rejected here, before any request is made.
    pub fn add(&self, file: UploadFile, temp_identifier: &str) -> Result<TaskId, ClientError> {
        let size = file.source.len();
        if size == 0 {
            return Err(ClientError::Empty);
        }
        if size > self.options.limits.max_upload_bytes() {
            return Err(ClientError::TooLarge {
                size,
                max: self.options.limits.max_upload_bytes(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.insert(
            id,
            ClientUploadTask {
                id,
                file,
                temp_identifier: temp_identifier.to_string(),
                upload_id: None,
                chunk_size: self.options.limits.chunk_size(),
                total_chunks: self.options.limits.total_chunks(size),
                uploaded_chunks: BTreeSet::new(),
                status: UploadStatus::Pending,
                progress_percent: 0,
                placeholder: None,
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(id)
    }

    pub fn set_placeholder(&self, id: TaskId, placeholder: impl Into<String>) {
        if let Some(mut task) = self.tasks.get_mut(&id) {
            task.placeholder = Some(placeholder.into());
        }
    }

    /// Copy of a task's current state.
    pub fn task(&self, id: TaskId) -> Option<ClientUploadTask> {
        self.tasks.get(&id).map(|t| t.clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drops a task from the working set. A running upload stops scheduling
    /// further chunks; requests already in flight are left to finish.
    pub fn remove(&self, id: TaskId) -> bool {
        match self.tasks.remove(&id) {
            Some((_, task)) => {
                task.cancelled.store(true, Ordering::Relaxed);
                debug!("Removed upload task {}", id);
                true
            }
            None => false,
        }
    }

    fn update(&self, id: TaskId, f: impl FnOnce(&mut ClientUploadTask)) {
        if let Some(mut task) = self.tasks.get_mut(&id) {
            f(&mut task);
        }
    }

    /// Uploads a task from scratch (init, then chunks, then complete).
    pub async fn upload(&self, id: TaskId, on_progress: ProgressCallback) -> Result<AttachmentResponse, ClientError> {
        self.drive(id, None, on_progress).await
    }

    /// Continues an existing server session instead of calling init.
    pub async fn resume(
        &self,
        id: TaskId,
        upload_id: &str,
        on_progress: ProgressCallback,
    ) -> Result<AttachmentResponse, ClientError> {
        self.drive(id, Some(upload_id.to_string()), on_progress).await
    }

    async fn drive(
        &self,
        id: TaskId,
        resume_id: Option<String>,
        on_progress: ProgressCallback,
    ) -> Result<AttachmentResponse, ClientError> {
        let run = self.run(id, resume_id, on_progress);
        let result = match self.options.deadline {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .unwrap_or(Err(ClientError::DeadlineExceeded(limit))),
            None => run.await,
        };

        match &result {
            Ok(done) => {
                self.update(id, |t| {
                    t.status = UploadStatus::Done;
                    t.progress_percent = 100;
                });
                info!("Upload task {} finished: {}", id, done.path);
            }
            Err(e) => {
                self.update(id, |t| t.status = UploadStatus::Failed);
                warn!("Upload task {} failed: {}", id, e);
            }
        }
        result
    }

    async fn run(
        &self,
        id: TaskId,
        resume_id: Option<String>,
        on_progress: ProgressCallback,
    ) -> Result<AttachmentResponse, ClientError> {
        let task = self.task(id).ok_or(ClientError::Cancelled)?;
        let cancelled = task.cancelled.clone();
        let size = task.file.source.len();
        let transport = self.transport.as_ref();

        self.update(id, |t| t.status = UploadStatus::Initializing);

        // Init, or pick up a known session
        let (upload_id, chunk_size, total_chunks, uploaded) = match resume_id {
            None => {
                let init = transport
                    .init(&InitRequest {
                        filename: task.file.name.clone(),
                        size: size as i64,
                        temp_identifier: task.temp_identifier.clone(),
                        mime_type: task.file.mime_type.clone(),
                    })
                    .await?;

                let uploaded: BTreeSet<u64> = match transport.status(&init.upload_id).await {
                    Ok(status) => status.uploaded_chunks.into_iter().collect(),
                    Err(e) => {
                        debug!("Status after init failed, assuming nothing uploaded: {}", e);
                        BTreeSet::new()
                    }
                };
                (init.upload_id, init.chunk_size, init.total_chunks, uploaded)
            }
            Some(upload_id) => {
                let status = transport.status(&upload_id).await?;
                (
                    upload_id,
                    status.chunk_size,
                    status.total_chunks,
                    status.uploaded_chunks.into_iter().collect(),
                )
            }
        };

        if chunk_size == 0 || size.div_ceil(chunk_size) != total_chunks {
            return Err(ClientError::Server {
                status: 422,
                reason: "session_mismatch".into(),
                message: format!(
                    "session expects {} chunks of {} bytes, file is {} bytes",
                    total_chunks, chunk_size, size
                ),
                missing: Vec::new(),
            });
        }

        let reporter = Arc::new(ProgressReporter {
            total: size,
            last: AtomicI16::new(-1),
            callback: on_progress,
        });

        // Already-landed chunks count toward progress straight away
        let mut accounted: u64 = uploaded
            .iter()
            .map(|&i| {
                let r = chunk_range(i, chunk_size, size);
                r.end - r.start
            })
            .sum();
        let percent = reporter.report(accounted);
        {
            let upload_id = upload_id.clone();
            let uploaded = uploaded.clone();
            self.update(id, move |t| {
                t.upload_id = Some(upload_id);
                t.chunk_size = chunk_size;
                t.total_chunks = total_chunks;
                t.uploaded_chunks = uploaded;
                t.progress_percent = percent;
                t.status = UploadStatus::Uploading;
            });
        }

        for index in 0..total_chunks {
            if cancelled.load(Ordering::Relaxed) {
                return Err(ClientError::Cancelled);
            }
            if uploaded.contains(&index) {
                continue;
            }

            let range = chunk_range(index, chunk_size, size);
            let len = range.end - range.start;
            let data = task.file.source.slice(range).await?;

            let byte_progress: ByteProgress = {
                let reporter = reporter.clone();
                let base = accounted;
                Arc::new(move |sent| {
                    reporter.report(base + sent.min(len));
                })
            };
            self.upload_chunk_with_retry(&upload_id, index, data, byte_progress).await?;

            accounted += len;
            let percent = reporter.report(accounted);
            self.update(id, |t| {
                t.uploaded_chunks.insert(index);
                t.progress_percent = percent;
            });
        }

        if cancelled.load(Ordering::Relaxed) {
            return Err(ClientError::Cancelled);
        }

        self.update(id, |t| t.status = UploadStatus::Completing);
        let sha256 = if self.options.verify_digest {
            Some(task.file.source.sha256().await?)
        } else {
            None
        };
        let done = transport
            .complete(&CompleteRequest {
                upload_id: upload_id.clone(),
                sha256,
            })
            .await?;

        reporter.report(size);
        Ok(done)
    }

    async fn upload_chunk_with_retry(
        &self,
        upload_id: &str,
        index: u64,
        data: bytes::Bytes,
        progress: ByteProgress,
    ) -> Result<(), ClientError> {
        let mut attempt: u32 = 0;

        loop {
            match self
                .transport
                .upload_chunk(upload_id, index, data.clone(), progress.clone())
                .await
            {
                Ok(()) => return Ok(()),
                // Session is gone, retrying the chunk can't help
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) if attempt < self.options.retry_limit => {
                    attempt += 1;
                    warn!(
                        "Chunk {} of {} failed (attempt {}): {}, retrying",
                        index, upload_id, attempt, e
                    );
                    tokio::time::sleep(self.options.retry_backoff * attempt).await;

                    if let Ok(status) = self.transport.status(upload_id).await {
                        if status.uploaded_chunks.contains(&index) {
                            debug!("Chunk {} of {} landed after all", index, upload_id);
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    return Err(ClientError::ChunkFailed {
                        index,
                        attempts: attempt + 1,
                        source: Box::new(e),
                    })
                }
            }
        }
    }
}
