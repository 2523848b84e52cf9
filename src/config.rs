//! Limits and runtime configuration shared by the server and the client engine.
//!
//! The two size limits must agree between client and server, otherwise a
//! resumed upload computes different chunk boundaries than the session it
//! resumes.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// Upload limits
pub const MAX_UPLOAD_BYTES: u64 = 40 * 1024 * 1024;
pub const CHUNK_SIZE_BYTES: u64 = 5 * 1024 * 1024;

// Longest upload id / temp identifier accepted from callers
pub const MAX_ID_LEN: usize = 128;

// Retention of finished files in the temp area and of abandoned chunk sessions
pub const TEMP_RETENTION_SECS: u64 = 24 * 60 * 60;
pub const CHUNK_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const SWEEP_INTERVAL_SECS: u64 = 60 * 60;

// Client retry policy: retries after the first attempt, linear backoff step
pub const CHUNK_RETRY_LIMIT: u32 = 2;
pub const CHUNK_RETRY_BACKOFF_MS: u64 = 300;

// Editor finalization falls back to swapping the URL after this long
pub const PRELOAD_TIMEOUT_MS: u64 = 2000;

// Extra room on request bodies for multipart framing
pub const BODY_LIMIT_SLACK: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--chunk-bucket is required for the {0} backend")]
    MissingBucket(&'static str),
    #[error("chunk size must be between 1 byte and the max upload size ({max} bytes), got {got}")]
    InvalidChunkSize { got: u64, max: u64 },
    #[error("invalid public base url {0:?}: {1}")]
    InvalidBaseUrl(String, url::ParseError),
}

/// Size limits for one deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    max_upload_bytes: u64,
    chunk_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_upload_bytes: MAX_UPLOAD_BYTES,
            chunk_size: CHUNK_SIZE_BYTES,
        }
    }
}

impl Limits {
    pub fn new(max_upload_bytes: u64, chunk_size: u64) -> Result<Self, ConfigError> {
        if chunk_size == 0 || chunk_size > max_upload_bytes {
            return Err(ConfigError::InvalidChunkSize {
                got: chunk_size,
                max: max_upload_bytes,
            });
        }
        Ok(Self {
            max_upload_bytes,
            chunk_size,
        })
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Always at least 1 and at most `max_upload_bytes`.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks needed for a file of `size_bytes`.
    pub fn total_chunks(&self, size_bytes: u64) -> u64 {
        size_bytes.div_ceil(self.chunk_size)
    }
}

#[derive(Clone, Debug, Default, PartialEq, clap::ValueEnum)]
pub enum ChunkBackendKind {
    #[default]
    Local,
    S3,
    Memory,
}

/// Where chunk sessions are staged.
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkBackend {
    /// Directory on the local filesystem
    Local { path: PathBuf },
    /// AWS S3 or an S3-compatible service (MinIO etc.)
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
    },
    /// Process memory, lost on restart
    Memory,
}

impl ChunkBackend {
    /// Build the backend description from CLI arguments.
    pub fn from_args(
        kind: &ChunkBackendKind,
        data_dir: &Path,
        bucket: Option<&str>,
        region: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<Self, ConfigError> {
        match kind {
            ChunkBackendKind::Local => Ok(ChunkBackend::Local {
                path: data_dir.join("chunks"),
            }),
            ChunkBackendKind::S3 => Ok(ChunkBackend::S3 {
                bucket: bucket.ok_or(ConfigError::MissingBucket("s3"))?.to_string(),
                region: region.unwrap_or("us-east-1").to_string(),
                endpoint: endpoint.map(|s| s.to_string()),
            }),
            ChunkBackendKind::Memory => Ok(ChunkBackend::Memory),
        }
    }
}

/// Everything the upload server needs at startup.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub limits: Limits,
    pub chunk_backend: ChunkBackend,
    /// Root of the temp attachment area
    pub temp_dir: PathBuf,
    /// Prefix for URLs handed back to clients, without trailing slash
    pub public_base_url: String,
    pub temp_retention: Duration,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
}

impl ServerConfig {
    /// Defaults rooted at `data_dir`, with chunks on the local filesystem.
    pub fn with_data_dir(data_dir: impl AsRef<Path>, public_base_url: &str) -> Result<Self, ConfigError> {
        let data_dir = data_dir.as_ref();
        Ok(Self {
            limits: Limits::default(),
            chunk_backend: ChunkBackend::Local {
                path: data_dir.join("chunks"),
            },
            temp_dir: data_dir.join("temp"),
            public_base_url: normalize_base_url(public_base_url)?,
            temp_retention: Duration::from_secs(TEMP_RETENTION_SECS),
            session_ttl: Duration::from_secs(CHUNK_SESSION_TTL_SECS),
            sweep_interval: Duration::from_secs(SWEEP_INTERVAL_SECS),
        })
    }
}

/// Validates a base URL and strips the trailing slash. An empty string keeps
/// URLs host-relative.
pub fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    url::Url::parse(trimmed).map_err(|e| ConfigError::InvalidBaseUrl(raw.to_string(), e))?;
    Ok(trimmed.to_string())
}
