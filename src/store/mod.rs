//! Authoritative Store Client
//!
//! ## Responsibilities
//!
//! - CRUD over `devices`, `notifications`, `analysis_jobs`
//! - Scope snapshots for refetch (`fetch_scope`)
//!
//! Every mutation returns the row as the store wrote it, including the
//! store-maintained `updated_at`. Write failures surface as
//! `StoreWriteFailed`.

mod memory;
mod repository;

pub use memory::MemoryStore;
pub use repository::PgStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::change_feed::{ScopeFilter, SubscriptionKey};
use crate::error::Result;
use crate::models::{AnalysisJob, DetectionStatus, Device, EntityRecord, EntityType, Notification};

/// Device insert request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDevice {
    pub owner_id: String,
    pub name: String,
    pub address: String,
}

/// Analysis job insert request (always starts `pending`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub user_id: String,
    pub video_uri: String,
}

/// Authoritative store
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn list_devices(&self, owner_id: &str) -> Result<Vec<Device>>;

    async fn get_device(&self, id: &str) -> Result<Option<Device>>;

    async fn insert_device(&self, new: NewDevice) -> Result<Device>;

    async fn update_device_name(&self, id: &str, name: &str) -> Result<Device>;

    async fn update_device_status(&self, id: &str, status: DetectionStatus) -> Result<Device>;

    /// Deletes the device; the store cascades its notifications
    async fn delete_device(&self, id: &str) -> Result<()>;

    /// Notifications under an owner or device filter, newest first
    async fn list_notifications(&self, filter: &ScopeFilter) -> Result<Vec<Notification>>;

    async fn list_jobs(&self, owner_id: &str) -> Result<Vec<AnalysisJob>>;

    async fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>>;

    async fn insert_job(&self, new: NewJob) -> Result<AnalysisJob>;

    /// Backend name for logs and health
    fn backend(&self) -> &'static str;

    /// Every row visible under a subscription key, newest first
    async fn fetch_scope(&self, key: &SubscriptionKey) -> Result<Vec<EntityRecord>> {
        let rows = match (key.entity_type, &key.filter) {
            (EntityType::Device, ScopeFilter::Owner(owner_id)) => self
                .list_devices(owner_id)
                .await?
                .into_iter()
                .map(EntityRecord::from)
                .collect(),
            (EntityType::Device, ScopeFilter::Device(device_id)) => self
                .get_device(device_id)
                .await?
                .into_iter()
                .map(EntityRecord::from)
                .collect(),
            (EntityType::Notification, filter) => self
                .list_notifications(filter)
                .await?
                .into_iter()
                .map(EntityRecord::from)
                .collect(),
            (EntityType::AnalysisJob, ScopeFilter::Owner(owner_id)) => self
                .list_jobs(owner_id)
                .await?
                .into_iter()
                .map(EntityRecord::from)
                .collect(),
            // Jobs are not attached to devices
            (EntityType::AnalysisJob, ScopeFilter::Device(_)) => Vec::new(),
        };
        Ok(rows)
    }
}
