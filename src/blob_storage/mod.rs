//! Blob storage for uploaded videos
//!
//! Uploads go to a caller-chosen path and come back as a public URI.
//! No retries here; a failed upload is final for the request.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

/// Blob storage
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `bytes` under `path`; returns the public URI
    async fn upload(&self, path: &str, content_type: &str, bytes: Vec<u8>) -> Result<String>;
}

/// Object storage reached over HTTP
///
/// PUT `{base}/storage/v1/object/{bucket}/{path}`, public URI
/// `{base}/storage/v1/object/public/{bucket}/{path}`.
pub struct HttpBlobStorage {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    api_key: Option<String>,
}

impl HttpBlobStorage {
    pub fn new(
        base_url: impl Into<String>,
        bucket: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            api_key,
        })
    }

    pub fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path)
    }

    pub fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, path
        )
    }
}

#[async_trait]
impl BlobStorage for HttpBlobStorage {
    async fn upload(&self, path: &str, content_type: &str, bytes: Vec<u8>) -> Result<String> {
        let size = bytes.len();
        let mut request = self
            .client
            .put(self.object_url(path))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| Error::UploadFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::UploadFailed(format!("storage returned {}: {}", status, body)));
        }

        tracing::info!(path = %path, size = size, "Video uploaded");
        Ok(self.public_url(path))
    }
}

/// Blob storage kept in process memory
#[derive(Default)]
pub struct MemoryBlobStorage {
    objects: Mutex<HashMap<String, (String, Vec<u8>)>>,
    failing: AtomicBool,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent upload fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn upload(&self, path: &str, content_type: &str, bytes: Vec<u8>) -> Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::UploadFailed("storage unavailable".to_string()));
        }
        self.objects
            .lock()
            .map_err(|_| Error::Internal("blob map poisoned".to_string()))?
            .insert(path.to_string(), (content_type.to_string(), bytes));
        Ok(format!("memory://videos/{}", path))
    }
}
