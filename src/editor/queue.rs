use super::document::{SharedDocument, Transaction};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

enum Command {
    Apply(Transaction),
    Flush(oneshot::Sender<()>),
}

/// Serializes document mutations coming from upload tasks.
///
/// Scheduled transactions are applied one at a time on a dispatcher task,
/// each after yielding once so they never land inside an edit the caller is
/// still making on the document.
#[derive(Clone)]
pub struct MutationQueue {
    sender: mpsc::UnboundedSender<Command>,
    document: SharedDocument,
}

impl MutationQueue {
    /// Starts the dispatcher. Must be called inside a tokio runtime.
    pub fn new(document: SharedDocument) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let doc = document.clone();

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Apply(tx) => {
                        tokio::task::yield_now().await;
                        if !doc.lock().apply(tx) {
                            debug!("Skipped transaction for an image no longer in the document");
                        }
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { sender: tx, document }
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    /// Queues a transaction for the next dispatcher turn.
    pub fn schedule(&self, tx: Transaction) {
        if self.sender.send(Command::Apply(tx)).is_err() {
            warn!("Mutation dispatcher stopped, dropping transaction");
        }
    }

    /// Applies a transaction right away, bypassing the queue.
    pub fn apply_now(&self, tx: Transaction) -> bool {
        self.document.lock().apply(tx)
    }

    /// Waits until everything scheduled so far has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.sender.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
