//! The four protocol calls as seen from the client.

use crate::error::ClientError;
use crate::session::{AttachmentResponse, CompleteRequest, InitRequest, InitResponse, StatusResponse};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Called with the number of bytes of the current chunk sent so far.
pub type ByteProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Slice size used to surface sub-chunk progress
pub const PROGRESS_SLICE: usize = 64 * 1024;

#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn init(&self, req: &InitRequest) -> Result<InitResponse, ClientError>;

    async fn status(&self, upload_id: &str) -> Result<StatusResponse, ClientError>;

    async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: u64,
        data: Bytes,
        progress: ByteProgress,
    ) -> Result<(), ClientError>;

    async fn complete(&self, req: &CompleteRequest) -> Result<AttachmentResponse, ClientError>;
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    missing: Vec<u64>,
}

/// Talks to a chunkport server over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or_else(|_| ErrorBody {
            message: text,
            ..Default::default()
        });
        Err(ClientError::Server {
            status: status.as_u16(),
            reason: body.error,
            message: body.message,
            missing: body.missing,
        })
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn init(&self, req: &InitRequest) -> Result<InitResponse, ClientError> {
        let response = self
            .client
            .post(self.url("/attachments/upload-init"))
            .json(req)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn status(&self, upload_id: &str) -> Result<StatusResponse, ClientError> {
        let response = self
            .client
            .get(self.url("/attachments/upload-status"))
            .query(&[("upload_id", upload_id)])
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: u64,
        data: Bytes,
        progress: ByteProgress,
    ) -> Result<(), ClientError> {
        let len = data.len() as u64;
        let slices: Vec<Bytes> = (0..data.len())
            .step_by(PROGRESS_SLICE)
            .map(|start| data.slice(start..(start + PROGRESS_SLICE).min(data.len())))
            .collect();

        let mut sent = 0u64;
        let stream = futures::stream::iter(slices.into_iter().map(move |slice| {
            sent += slice.len() as u64;
            progress(sent);
            Ok::<Bytes, std::io::Error>(slice)
        }));

        let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), len)
            .file_name(format!("chunk-{chunk_index}"))
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .text("upload_id", upload_id.to_string())
            .text("chunk_index", chunk_index.to_string())
            .part("chunk", part);

        debug!("Sending chunk {} of {} ({} bytes)", chunk_index, upload_id, len);
        let response = self
            .client
            .post(self.url("/attachments/upload-chunk"))
            .multipart(form)
            .send()
            .await?;
        let _: serde_json::Value = Self::parse(response).await?;
        Ok(())
    }

    async fn complete(&self, req: &CompleteRequest) -> Result<AttachmentResponse, ClientError> {
        let response = self
            .client
            .post(self.url("/attachments/upload-complete"))
            .json(req)
            .send()
            .await?;
        Self::parse(response).await
    }
}
