//! Stitches the chunks of a completed session into one file in the temp area.
//!
//! Chunks are read strictly by index, so the order they arrived in (or the
//! order the store lists them in) never matters. The byte length of the
//! output must equal the declared size; a SHA-256 is computed on the way so
//! callers can also compare content.

use crate::error::StoreError;
use crate::store::{ChunkStore, UploadSession};
use crate::temp_area::{TempArea, TempOutput};
use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("chunk {0} disappeared before it could be assembled")]
    MissingChunk(u64),
    #[error("assembled {actual} bytes but the upload declared {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<std::io::Error> for AssemblyError {
    fn from(e: std::io::Error) -> Self {
        AssemblyError::Store(StoreError::Io(e))
    }
}

/// A verified output file.
#[derive(Debug, Clone)]
pub struct AssembledFile {
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Concatenates chunks `0..total_chunks` of `session` into a new temp file.
///
/// On any failure the partial output is removed; the chunk session itself is
/// never touched here.
pub async fn assemble(
    chunks: &ChunkStore,
    temp: &TempArea,
    session: &UploadSession,
) -> Result<AssembledFile, AssemblyError> {
    let TempOutput { filename, path, file } = temp
        .create_output(&session.temp_identifier, &session.original_filename)
        .await?;

    match write_chunks(chunks, session, file).await {
        Ok((written, sha256)) => {
            let on_disk = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(written);
            if on_disk != session.size_bytes {
                warn!(
                    "Upload {} assembled to {} bytes, expected {}",
                    session.upload_id, on_disk, session.size_bytes
                );
                TempArea::remove_output(&path).await;
                return Err(AssemblyError::SizeMismatch {
                    expected: session.size_bytes,
                    actual: on_disk,
                });
            }

            debug!(
                "Assembled {} chunks of upload {} into {:?}",
                session.total_chunks, session.upload_id, path
            );
            Ok(AssembledFile {
                filename,
                path,
                size_bytes: on_disk,
                sha256,
            })
        }
        Err(e) => {
            TempArea::remove_output(&path).await;
            Err(e)
        }
    }
}

async fn write_chunks(
    chunks: &ChunkStore,
    session: &UploadSession,
    mut file: tokio::fs::File,
) -> Result<(u64, String), AssemblyError> {
    let mut hasher = Sha256::new();
    let mut written = 0u64;

    for index in 0..session.total_chunks {
        let mut stream = chunks
            .open_chunk(&session.upload_id, index)
            .await?
            .ok_or(AssemblyError::MissingChunk(index))?;

        while let Some(part) = stream.try_next().await? {
            hasher.update(&part);
            file.write_all(&part).await?;
            written += part.len() as u64;
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok((written, hex::encode(hasher.finalize())))
}
