//! Transport that calls an [`UploadService`] in the same process.

use super::transport::{ByteProgress, UploadTransport};
use crate::error::{ClientError, UploadError};
use crate::session::{AttachmentResponse, CompleteRequest, InitRequest, InitResponse, StatusResponse, UploadService};
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Clone)]
pub struct LocalTransport {
    service: UploadService,
}

impl LocalTransport {
    pub fn new(service: UploadService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &UploadService {
        &self.service
    }
}

impl From<UploadError> for ClientError {
    fn from(e: UploadError) -> Self {
        let missing = match &e {
            UploadError::MissingChunks { missing } => missing.clone(),
            _ => Vec::new(),
        };
        ClientError::Server {
            status: e.status().as_u16(),
            reason: e.reason().to_string(),
            message: e.to_string(),
            missing,
        }
    }
}

#[async_trait]
impl UploadTransport for LocalTransport {
    async fn init(&self, req: &InitRequest) -> Result<InitResponse, ClientError> {
        Ok(self.service.init(req.clone()).await?)
    }

    async fn status(&self, upload_id: &str) -> Result<StatusResponse, ClientError> {
        Ok(self.service.status(upload_id).await?)
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: u64,
        data: Bytes,
        progress: ByteProgress,
    ) -> Result<(), ClientError> {
        let len = data.len() as u64;
        let index = i64::try_from(chunk_index).unwrap_or(i64::MAX);
        self.service.put_chunk(upload_id, index, data).await?;
        progress(len);
        Ok(())
    }

    async fn complete(&self, req: &CompleteRequest) -> Result<AttachmentResponse, ClientError> {
        Ok(self.service.complete(req.clone()).await?)
    }
}
