use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

/// Warms up a final image URL before the placeholder is swapped to it.
///
/// Resolves once the load either succeeded or failed; callers race it
/// against a timeout.
#[async_trait]
pub trait ImagePreloader: Send + Sync {
    async fn preload(&self, url: &str);
}

pub struct HttpPreloader {
    client: reqwest::Client,
}

impl HttpPreloader {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Downloads the whole body, failing on non-success statuses.
    pub async fn fetch(&self, url: &str) -> Result<Bytes, reqwest::Error> {
        self.client.get(url).send().await?.error_for_status()?.bytes().await
    }
}

#[async_trait]
impl ImagePreloader for HttpPreloader {
    async fn preload(&self, url: &str) {
        match self.fetch(url).await {
            Ok(body) => debug!("Preloaded {} ({} bytes)", url, body.len()),
            Err(e) => debug!("Preloading {} failed: {}", url, e),
        }
    }
}

/// Preloader that resolves immediately.
pub struct NoopPreloader;

#[async_trait]
impl ImagePreloader for NoopPreloader {
    async fn preload(&self, _url: &str) {}
}
