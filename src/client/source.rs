//! Byte sources the engine can slice chunks out of.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::{self, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const HASH_BUFFER: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub enum FileSource {
    Memory(Bytes),
    Disk { path: PathBuf, len: u64 },
}

impl FileSource {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        FileSource::Memory(data.into())
    }

    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("{:?} is not a file", path)));
        }
        Ok(FileSource::Disk { path, len: meta.len() })
    }

    pub fn len(&self) -> u64 {
        match self {
            FileSource::Memory(b) => b.len() as u64,
            FileSource::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact bytes of `range`; errors if the file is shorter than that.
    pub async fn slice(&self, range: Range<u64>) -> io::Result<Bytes> {
        if range.end > self.len() || range.start > range.end {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {:?} outside a {} byte source", range, self.len()),
            ));
        }
        match self {
            FileSource::Memory(b) => Ok(b.slice(range.start as usize..range.end as usize)),
            FileSource::Disk { path, .. } => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(range.start)).await?;
                let mut buf = vec![0u8; (range.end - range.start) as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Hex SHA-256 of the whole source.
    pub async fn sha256(&self) -> io::Result<String> {
        match self {
            FileSource::Memory(b) => Ok(hex::encode(Sha256::digest(b))),
            FileSource::Disk { path, .. } => {
                let mut file = tokio::fs::File::open(path).await?;
                let mut hasher = Sha256::new();
                let mut buf = vec![0u8; HASH_BUFFER];
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(hex::encode(hasher.finalize()))
            }
        }
    }
}

/// Byte range of chunk `index` in a file of `total_size` bytes.
pub fn chunk_range(index: u64, chunk_size: u64, total_size: u64) -> Range<u64> {
    let start = index.saturating_mul(chunk_size).min(total_size);
    let end = start.saturating_add(chunk_size).min(total_size);
    start..end
}

/// A file handed to the engine.
#[derive(Clone, Debug)]
pub struct UploadFile {
    pub name: String,
    pub mime_type: Option<String>,
    pub source: FileSource,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, mime_type: Option<String>, source: FileSource) -> Self {
        Self {
            name: name.into(),
            mime_type,
            source,
        }
    }

    /// Reads a file from disk, guessing its MIME type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin")
            .to_string();
        let mime_type = mime_guess::from_path(path).first().map(|m| m.to_string());
        Ok(Self::new(name, mime_type, FileSource::open(path).await?))
    }

    pub fn is_image(&self) -> bool {
        self.mime_type
            .as_deref()
            .is_some_and(|m| m.to_ascii_lowercase().starts_with("image/"))
    }
}
