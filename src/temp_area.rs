//! Temp attachment area: where finished uploads wait until something attaches
//! them to a durable record.
//!
//! Files live at `<root>/<temp_identifier>/<stem>-<suffix>.<ext>` with a
//! `<name>.meta.json` sidecar next to each one. The area only offers the
//! primitives (store, read, list, delete, sweep); moving files to permanent
//! storage is someone else's job.

use crate::ids::{is_safe_filename, is_safe_id, unique_filename};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const SIDECAR_SUFFIX: &str = ".meta.json";
const CREATE_ATTEMPTS: usize = 8;

/// Sidecar record written next to every stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarMeta {
    pub original_filename: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A file sitting in the temp area.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TempEntry {
    pub temp_identifier: String,
    pub filename: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

impl TempEntry {
    /// `<temp_identifier>/<filename>`, the path reported to clients.
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.temp_identifier, self.filename)
    }
}

/// A freshly created output file.
pub struct TempOutput {
    pub filename: String,
    pub path: PathBuf,
    pub file: File,
}

/// Result of storing a whole file in one go.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Clone, Debug)]
pub struct TempArea {
    root: PathBuf,
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(SIDECAR_SUFFIX);
    path.with_file_name(name)
}

fn is_sidecar(name: &str) -> bool {
    name.ends_with(SIDECAR_SUFFIX)
}

impl TempArea {
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a stored file, `None` if either segment is unsafe.
    pub fn resolve(&self, temp_identifier: &str, filename: &str) -> Option<PathBuf> {
        if !is_safe_id(temp_identifier) || !is_safe_filename(filename) || is_sidecar(filename) {
            return None;
        }
        Some(self.root.join(temp_identifier).join(filename))
    }

    /// Creates a new, uniquely named, empty file for `original_filename`.
    pub async fn create_output(&self, temp_identifier: &str, original_filename: &str) -> io::Result<TempOutput> {
        if !is_safe_id(temp_identifier) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "unsafe temp identifier"));
        }
        let dir = self.root.join(temp_identifier);
        fs::create_dir_all(&dir).await?;

        for _ in 0..CREATE_ATTEMPTS {
            let filename = unique_filename(original_filename);
            let path = dir.join(&filename);
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => return Ok(TempOutput { filename, path, file }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not pick an unused filename",
        ))
    }

    /// Writes `bytes` as a new file plus its sidecar.
    pub async fn store(
        &self,
        temp_identifier: &str,
        original_filename: &str,
        bytes: &[u8],
        mime_type: Option<String>,
    ) -> io::Result<StoredFile> {
        let TempOutput { filename, path, mut file } = self.create_output(temp_identifier, original_filename).await?;

        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            Self::remove_output(&path).await;
            return Err(e);
        }

        let sha256 = hex::encode(Sha256::digest(bytes));
        let meta = SidecarMeta {
            original_filename: original_filename.to_string(),
            size_bytes: bytes.len() as u64,
            sha256: Some(sha256.clone()),
            mime_type,
            created_at: Utc::now(),
        };
        if let Err(e) = self.write_sidecar(&path, &meta).await {
            Self::remove_output(&path).await;
            return Err(e);
        }

        info!("Stored {} in temp area as {}/{}", original_filename, temp_identifier, filename);
        Ok(StoredFile {
            filename,
            path,
            size_bytes: bytes.len() as u64,
            sha256,
        })
    }

    pub async fn write_sidecar(&self, path: &Path, meta: &SidecarMeta) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(meta)?;
        fs::write(sidecar_path(path), data).await
    }

    pub async fn read_sidecar(&self, temp_identifier: &str, filename: &str) -> io::Result<Option<SidecarMeta>> {
        let Some(path) = self.resolve(temp_identifier, filename) else {
            return Ok(None);
        };
        match fs::read(sidecar_path(&path)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Best-effort removal of an output file and its sidecar.
    pub async fn remove_output(path: &Path) {
        for p in [path.to_path_buf(), sidecar_path(path)] {
            if let Err(e) = fs::remove_file(&p).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove {:?}: {}", p, e);
                }
            }
        }
    }

    pub async fn exists(&self, temp_identifier: &str, filename: &str) -> bool {
        match self.resolve(temp_identifier, filename) {
            Some(path) => fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false),
            None => false,
        }
    }

    pub async fn read(&self, temp_identifier: &str, filename: &str) -> io::Result<Option<Vec<u8>>> {
        let Some(path) = self.resolve(temp_identifier, filename) else {
            return Ok(None);
        };
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Files in one temp scope, sorted by name. Sidecars are not listed.
    pub async fn list(&self, temp_identifier: &str) -> io::Result<Vec<TempEntry>> {
        if !is_safe_id(temp_identifier) {
            return Ok(Vec::new());
        }
        let dir = self.root.join(temp_identifier);
        let mut entries = Vec::new();

        let mut reader = match fs::read_dir(&dir).await {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e),
        };

        while let Some(entry) = reader.next_entry().await? {
            let Some(filename) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            if is_sidecar(&filename) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            entries.push(TempEntry {
                temp_identifier: temp_identifier.to_string(),
                filename,
                size_bytes: meta.len(),
                modified: DateTime::<Utc>::from(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
            });
        }

        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(entries)
    }

    /// Every file across all temp scopes.
    pub async fn list_all(&self) -> io::Result<Vec<TempEntry>> {
        let mut all = Vec::new();
        let mut reader = fs::read_dir(&self.root).await?;
        while let Some(entry) = reader.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(scope) = entry.file_name().to_str() {
                all.extend(self.list(scope).await?);
            }
        }
        Ok(all)
    }

    /// Deletes a file and its sidecar; drops the scope directory once empty.
    pub async fn delete(&self, temp_identifier: &str, filename: &str) -> io::Result<bool> {
        let Some(path) = self.resolve(temp_identifier, filename) else {
            return Ok(false);
        };
        if !fs::try_exists(&path).await? {
            return Ok(false);
        }
        Self::remove_output(&path).await;

        // remove_dir only succeeds on an empty directory
        let _ = fs::remove_dir(self.root.join(temp_identifier)).await;
        debug!("Deleted temp file {}/{}", temp_identifier, filename);
        Ok(true)
    }

    /// Deletes files last modified more than `older_than` ago.
    pub async fn sweep(&self, older_than: Duration) -> io::Result<usize> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let mut removed = 0;

        for entry in self.list_all().await? {
            if entry.modified < cutoff && self.delete(&entry.temp_identifier, &entry.filename).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Temp area sweep removed {} files older than {:?}", removed, older_than);
        }
        Ok(removed)
    }
}
