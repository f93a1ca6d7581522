//! JobTracker - Video Analysis Jobs
//!
//! ## Responsibilities
//!
//! - Validate and upload a video, then create its `pending` job
//! - Hand the video to the detector (best-effort)
//! - Read job state from the cache, falling back to the store on a miss
//! - Wait for completion
//!
//! Status transitions arrive through the Reconciler, which applies the
//! admission rule in [`state`]. Without a live subscription the cache is
//! refreshed by the Subscription Manager's polling fallback.

pub mod state;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use crate::blob_storage::BlobStorage;
use crate::detector_client::DetectorClient;
use crate::error::{Error, Result};
use crate::models::{AnalysisJob, EntityRecord};
use crate::reconciler::Reconciler;
use crate::session::SessionContext;
use crate::store::{NewJob, StoreClient};

/// Default upload limit: 100 MiB
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Upload acceptance rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPolicy {
    pub max_bytes: usize,
    /// Required content type prefix
    pub content_type_prefix: String,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            content_type_prefix: "video/".to_string(),
        }
    }
}

impl UploadPolicy {
    pub fn validate(&self, upload: &VideoUpload) -> Result<()> {
        if upload.bytes.is_empty() {
            return Err(Error::Validation("video file is empty".to_string()));
        }
        if upload.bytes.len() > self.max_bytes {
            return Err(Error::Validation(format!(
                "video is {} bytes, limit is {} bytes",
                upload.bytes.len(),
                self.max_bytes
            )));
        }
        if !upload.content_type.starts_with(&self.content_type_prefix) {
            return Err(Error::Validation(format!(
                "content type {} is not a video",
                upload.content_type
            )));
        }
        Ok(())
    }
}

/// Video submitted for analysis
#[derive(Debug, Clone)]
pub struct VideoUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl VideoUpload {
    /// File extension from the name, else from the content subtype
    pub fn extension(&self) -> String {
        let from_name = self
            .file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));

        match from_name {
            Some(ext) => ext.to_ascii_lowercase(),
            None => self
                .content_type
                .split_once('/')
                .map(|(_, sub)| sub.to_ascii_lowercase())
                .filter(|sub| !sub.is_empty())
                .unwrap_or_else(|| "bin".to_string()),
        }
    }
}

/// Storage path for an upload: `{user_id}/{unix_millis}.{ext}`
pub fn upload_path(user_id: &str, unix_millis: i64, extension: &str) -> String {
    format!("{}/{}.{}", user_id, unix_millis, extension)
}

/// Job tracker
pub struct JobTracker {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn StoreClient>,
    blob: Arc<dyn BlobStorage>,
    detector: Arc<dyn DetectorClient>,
    policy: UploadPolicy,
}

impl JobTracker {
    pub fn new(
        reconciler: Arc<Reconciler>,
        store: Arc<dyn StoreClient>,
        blob: Arc<dyn BlobStorage>,
        detector: Arc<dyn DetectorClient>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            reconciler,
            store,
            blob,
            detector,
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Upload a video and create its analysis job
    ///
    /// The job is cached as `pending` as soon as the store returns it. An
    /// upload failure creates nothing.
    pub async fn submit_video(&self, ctx: &SessionContext, upload: VideoUpload) -> Result<AnalysisJob> {
        self.policy.validate(&upload)?;

        let path = upload_path(
            &ctx.user_id,
            chrono::Utc::now().timestamp_millis(),
            &upload.extension(),
        );
        let size = upload.bytes.len();

        let video_uri = self
            .blob
            .upload(&path, &upload.content_type, upload.bytes)
            .await
            .map_err(|e| match e {
                Error::UploadFailed(msg) => Error::UploadFailed(msg),
                other => Error::UploadFailed(other.to_string()),
            })?;

        let job = self
            .store
            .insert_job(NewJob {
                user_id: ctx.user_id.clone(),
                video_uri: video_uri.clone(),
            })
            .await?;
        self.reconciler.apply_rest_result(job.clone().into()).await;

        tracing::info!(
            job_id = %job.id,
            user_id = %ctx.user_id,
            size = size,
            "Analysis job created"
        );

        if let Err(e) = self.detector.register_job(&video_uri).await {
            tracing::warn!(
                job_id = %job.id,
                error = %e,
                "Detector not notified of new video"
            );
        }

        Ok(job)
    }

    /// Cached job, if owned by the session user
    ///
    /// A job missing from the cache is read from the store and merged, so
    /// a job created before any subscription was opened is still found.
    pub async fn status(&self, ctx: &SessionContext, job_id: &str) -> Result<Option<AnalysisJob>> {
        if let Some(job) = self.reconciler.cache().job(job_id) {
            return Ok(ctx.owns(&job.user_id).then_some(job));
        }

        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(None);
        };
        if !ctx.owns(&job.user_id) {
            return Ok(None);
        }

        self.reconciler.apply_rest_result(job.clone().into()).await;
        tracing::debug!(job_id = %job_id, status = %job.status, "Job loaded from store");
        Ok(Some(self.reconciler.cache().job(job_id).unwrap_or(job)))
    }

    /// Cached jobs of the session user, newest first
    pub fn list(&self, ctx: &SessionContext) -> Vec<AnalysisJob> {
        self.reconciler.cache().jobs_owned_by(&ctx.user_id)
    }

    /// Wait until the cache shows `job_id` completed; `None` on timeout
    pub async fn wait_for_completion(&self, job_id: &str, timeout: Duration) -> Option<AnalysisJob> {
        let mut changes = self.reconciler.subscribe_changes();

        let completed = |job: Option<AnalysisJob>| job.filter(|j| j.status.is_terminal());
        if let Some(job) = completed(self.reconciler.cache().job(job_id)) {
            return Some(job);
        }

        let wait = async {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if let EntityRecord::AnalysisJob(job) = change.record {
                            if job.id == job_id && job.status.is_terminal() {
                                return Some(job);
                            }
                        }
                    }
                    Err(RecvError::Lagged(_)) => {
                        if let Some(job) = completed(self.reconciler.cache().job(job_id)) {
                            return Some(job);
                        }
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }
}
