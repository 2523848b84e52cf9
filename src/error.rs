//! Error taxonomy for the upload protocol and the client engine.
//!
//! Server-side failures are [`UploadError`]; each variant maps onto one HTTP
//! status and a machine-readable `error` reason in the JSON body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures of the backing storage (chunk store or temp area).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt session descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum UploadError {
    /// Malformed or oversized request, out-of-range chunk, size or digest
    /// mismatch after assembly.
    #[error("{message}")]
    Validation { reason: &'static str, message: String },

    /// Unknown, already completed, or unsafe upload id.
    #[error("upload not found")]
    NotFound,

    /// `complete` arrived before every chunk landed.
    #[error("upload is missing chunks {missing:?}")]
    MissingChunks { missing: Vec<u64> },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UploadError {
    pub fn validation(reason: &'static str, message: impl Into<String>) -> Self {
        UploadError::Validation {
            reason,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            UploadError::NotFound => StatusCode::NOT_FOUND,
            UploadError::MissingChunks { .. } => StatusCode::CONFLICT,
            UploadError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            UploadError::Validation { reason, .. } => reason,
            UploadError::NotFound => "not_found",
            UploadError::MissingChunks { .. } => "missing_chunks",
            UploadError::Store(_) => "storage_error",
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Store(StoreError::Io(e))
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            UploadError::MissingChunks { missing } => json!({
                "error": self.reason(),
                "message": self.to_string(),
                "missing": missing,
            }),
            UploadError::Store(e) => {
                tracing::error!("Storage failure while serving upload request: {}", e);
                json!({
                    "error": self.reason(),
                    "message": "internal storage error",
                })
            }
            _ => json!({
                "error": self.reason(),
                "message": self.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

/// Failures seen by the client upload engine.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Rejected before any network call.
    #[error("file is {size} bytes, larger than the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error("file is empty")]
    Empty,

    /// The server answered with a non-success status.
    #[error("server rejected request ({status}): {reason}: {message}")]
    Server {
        status: u16,
        reason: String,
        message: String,
        missing: Vec<u64>,
    },

    /// Connection failure, timeout, unreadable response.
    #[error("network error: {0}")]
    Network(String),

    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    ChunkFailed {
        index: u64,
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    #[error("upload was cancelled")]
    Cancelled,

    #[error("upload did not finish within {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("reading source file: {0}")]
    Source(#[from] std::io::Error),
}

impl ClientError {
    /// 404 from the server: the session is gone and must be restarted via init.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Server { status: 404, .. })
    }

    /// Indices the server reported missing on `complete`, if that is what this is.
    pub fn missing_chunks(&self) -> Option<&[u64]> {
        match self {
            ClientError::Server { status: 409, missing, .. } => Some(missing),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Network(e.to_string())
    }
}
