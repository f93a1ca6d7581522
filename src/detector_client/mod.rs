//! DetectorClient - External Detector Service Adapter
//!
//! ## Responsibilities
//!
//! - Register / deregister devices with the detector
//! - Hand uploaded videos to the detector
//! - Forward detection status flips
//!
//! Every call is best-effort. Failures come back as `DetectorUnreachable`
//! and callers only log them; the store stays authoritative.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::DetectionStatus;

/// Detector service
#[async_trait]
pub trait DetectorClient: Send + Sync {
    async fn register_device(&self, owner_id: &str, device_id: &str, address: &str) -> Result<()>;

    async fn deregister_device(&self, address: &str) -> Result<()>;

    async fn register_job(&self, video_uri: &str) -> Result<()>;

    async fn set_detection_status(&self, device_id: &str, status: DetectionStatus) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct RegisterCameraRequest<'a> {
    user_id: &'a str,
    camera_id: &'a str,
    camera_url: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteCameraRequest<'a> {
    camera_url: &'a str,
}

#[derive(Debug, Serialize)]
struct RegisterVideoRequest<'a> {
    video_url: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DetectionStatusRequest<'a> {
    camera_id: &'a str,
    detection_status: &'a str,
}

/// HTTP detector client
pub struct HttpDetectorClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDetectorClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::DetectorUnreachable(format!("{}: {}", path, e)))?;

        if !resp.status().is_success() {
            return Err(Error::DetectorUnreachable(format!(
                "{} returned {}",
                path,
                resp.status()
            )));
        }

        tracing::debug!(path = %path, "Detector call succeeded");
        Ok(())
    }
}

#[async_trait]
impl DetectorClient for HttpDetectorClient {
    async fn register_device(&self, owner_id: &str, device_id: &str, address: &str) -> Result<()> {
        self.post(
            "/registerCamera",
            &RegisterCameraRequest {
                user_id: owner_id,
                camera_id: device_id,
                camera_url: address,
            },
        )
        .await
    }

    async fn deregister_device(&self, address: &str) -> Result<()> {
        self.post("/deleteCamera", &DeleteCameraRequest { camera_url: address })
            .await
    }

    async fn register_job(&self, video_uri: &str) -> Result<()> {
        self.post("/registerVideo", &RegisterVideoRequest { video_url: video_uri })
            .await
    }

    async fn set_detection_status(&self, device_id: &str, status: DetectionStatus) -> Result<()> {
        self.post(
            "/update_detection_status",
            &DetectionStatusRequest {
                camera_id: device_id,
                detection_status: status.as_str(),
            },
        )
        .await
    }
}
