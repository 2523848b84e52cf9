//! Glue between dropped/pasted files and the upload engine.
//!
//! Images get a placeholder node inserted at the cursor straight away; the
//! placeholder's `title` carries a local correlation id so later progress,
//! final and failure swaps can find it again. Everything else goes to the
//! caller's attachment handler.

use super::document::{ImageAttrs, Transaction};
use super::placeholder::{progress_label, PlaceholderRenderer};
use super::preload::ImagePreloader;
use super::queue::MutationQueue;
use crate::client::{ProgressCallback, UploadEngine, UploadFile};
use crate::config::PRELOAD_TIMEOUT_MS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Receives files that are not images.
pub type AttachmentHandler = Arc<dyn Fn(UploadFile) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    /// Placeholder now points at the uploaded file
    Inserted { url: String },
    /// Placeholder shows the failure image
    Failed { reason: String },
}

/// An image upload started by [`EditorUploads::handle_files`].
pub struct PendingImage {
    pub placeholder_id: String,
    pub filename: String,
    pub handle: JoinHandle<ImageOutcome>,
}

/// Swaps a placeholder to its final URL at most once.
#[derive(Clone)]
struct FinalSwap {
    done: Arc<AtomicBool>,
    queue: MutationQueue,
    title: String,
    url: String,
}

impl FinalSwap {
    fn fire(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.queue.schedule(Transaction::FinalizeImage {
            title: self.title.clone(),
            src: self.url.clone(),
        });
        true
    }
}

#[derive(Clone)]
pub struct EditorUploads {
    engine: Arc<UploadEngine>,
    queue: MutationQueue,
    renderer: Arc<dyn PlaceholderRenderer>,
    preloader: Arc<dyn ImagePreloader>,
    temp_identifier: String,
    on_attachment: Option<AttachmentHandler>,
    preload_timeout: Duration,
}

impl EditorUploads {
    pub fn new(
        engine: Arc<UploadEngine>,
        queue: MutationQueue,
        renderer: Arc<dyn PlaceholderRenderer>,
        preloader: Arc<dyn ImagePreloader>,
        temp_identifier: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            queue,
            renderer,
            preloader,
            temp_identifier: temp_identifier.into(),
            on_attachment: None,
            preload_timeout: Duration::from_millis(PRELOAD_TIMEOUT_MS),
        }
    }

    pub fn with_attachment_handler(mut self, handler: AttachmentHandler) -> Self {
        self.on_attachment = Some(handler);
        self
    }

    pub fn with_preload_timeout(mut self, timeout: Duration) -> Self {
        self.preload_timeout = timeout;
        self
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Inserts placeholders for every image in `files` and starts their
    /// uploads. Non-images go to the attachment handler. Must be called
    /// inside a tokio runtime.
    pub fn handle_files(&self, files: Vec<UploadFile>) -> Vec<PendingImage> {
        let mut pending = Vec::new();

        for file in files {
            if !file.is_image() {
                match &self.on_attachment {
                    Some(handler) => handler(file),
                    None => warn!("No attachment handler, ignoring {}", file.name),
                }
                continue;
            }
            pending.push(self.start_image(file));
        }
        pending
    }

    fn start_image(&self, file: UploadFile) -> PendingImage {
        let placeholder_id = format!("upload-{}", Uuid::new_v4().simple());
        let filename = file.name.clone();

        self.queue.apply_now(Transaction::InsertImage(ImageAttrs {
            src: self.renderer.render(0, &progress_label(0)),
            title: Some(placeholder_id.clone()),
            alt: Some(filename.clone()),
        }));

        let admitted = self.engine.add(file, &self.temp_identifier);
        let this = self.clone();
        let id = placeholder_id.clone();

        let handle = tokio::spawn(async move {
            let task_id = match admitted {
                Ok(task_id) => task_id,
                Err(e) => {
                    warn!("Upload of placeholder {} rejected: {}", id, e);
                    this.show_failure(&id);
                    return ImageOutcome::Failed { reason: e.to_string() };
                }
            };
            this.engine.set_placeholder(task_id, id.clone());

            let on_progress: ProgressCallback = {
                let queue = this.queue.clone();
                let renderer = this.renderer.clone();
                let title = id.clone();
                Arc::new(move |percent| {
                    queue.schedule(Transaction::SetImageSrc {
                        title: title.clone(),
                        src: renderer.render(percent, &progress_label(percent)),
                    });
                })
            };

            let outcome = match this.engine.upload(task_id, on_progress).await {
                Ok(done) => {
                    this.finalize(&id, &done.url).await;
                    info!("Placeholder {} swapped to {}", id, done.url);
                    ImageOutcome::Inserted { url: done.url }
                }
                Err(e) => {
                    this.show_failure(&id);
                    ImageOutcome::Failed { reason: e.to_string() }
                }
            };
            this.engine.remove(task_id);
            outcome
        });

        PendingImage {
            placeholder_id,
            filename,
            handle,
        }
    }

    fn show_failure(&self, placeholder_id: &str) {
        self.queue.schedule(Transaction::SetImageSrc {
            title: placeholder_id.to_string(),
            src: self.renderer.render_failed(),
        });
    }

    /// Preloads `url`, then swaps the placeholder to it. Gives up waiting
    /// after the preload timeout; a late preload can no longer swap again.
    async fn finalize(&self, placeholder_id: &str, url: &str) -> bool {
        let swap = FinalSwap {
            done: Arc::new(AtomicBool::new(false)),
            queue: self.queue.clone(),
            title: placeholder_id.to_string(),
            url: url.to_string(),
        };

        let preload = {
            let swap = swap.clone();
            let preloader = self.preloader.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                preloader.preload(&url).await;
                swap.fire()
            })
        };

        match tokio::time::timeout(self.preload_timeout, preload).await {
            Ok(Ok(swapped)) => swapped,
            _ => swap.fire(),
        }
    }
}
