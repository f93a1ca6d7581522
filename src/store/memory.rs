//! In-memory store
//!
//! Stands in for Postgres with `STORE_BACKEND=memory` and in tests. Every
//! write is mirrored onto an attached `MemoryFeedTransport`, the way the
//! table triggers feed LISTEN/NOTIFY. Also plays the detector's part
//! (`record_detection`, `advance_job`) so the full flow can run locally.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{NewDevice, NewJob, StoreClient};
use crate::change_feed::{ChangeEvent, MemoryFeedTransport, ScopeFilter};
use crate::error::{Error, Result};
use crate::models::{AnalysisJob, DetectionStatus, Device, JobStatus, Notification, Verdict};

#[derive(Default)]
struct Tables {
    devices: Vec<Device>,
    notifications: Vec<Notification>,
    jobs: Vec<AnalysisJob>,
    last_stamp: Option<DateTime<Utc>>,
}

impl Tables {
    /// Strictly increasing store clock
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

/// Newest first; ties keep insertion order
fn newest_first<T: Clone>(rows: &[T], at: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    let mut out: Vec<T> = rows.to_vec();
    out.sort_by(|a, b| at(b).cmp(&at(a)));
    out
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    feed: Option<Arc<MemoryFeedTransport>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose writes are published on `feed`
    pub fn with_feed(feed: Arc<MemoryFeedTransport>) -> Self {
        Self {
            feed: Some(feed),
            ..Self::default()
        }
    }

    /// Make every subsequent mutation fail with `StoreWriteFailed`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::StoreWriteFailed("store rejected the write".to_string()));
        }
        Ok(())
    }

    fn emit(&self, event: ChangeEvent) {
        if let Some(feed) = &self.feed {
            feed.publish(event);
        }
    }

    // ========================================
    // Detector side
    // ========================================

    /// Append a notification, as the detector does when it fires
    pub fn record_detection(&self, device_id: &str, message: &str) -> Result<Notification> {
        let notification = {
            let mut tables = self.tables();
            let owner = tables
                .devices
                .iter()
                .find(|d| d.id == device_id)
                .map(|d| d.owner_id.clone())
                .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?;
            let notification = Notification {
                id: Uuid::new_v4().to_string(),
                device_id: device_id.to_string(),
                user_id: owner,
                message: message.to_string(),
                timestamp: tables.stamp(),
            };
            tables.notifications.push(notification.clone());
            notification
        };
        self.emit(ChangeEvent::insert(notification.clone()));
        Ok(notification)
    }

    /// Move a job forward, as the detector does while analysing
    pub fn advance_job(&self, id: &str, status: JobStatus, result: Option<Verdict>) -> Result<AnalysisJob> {
        let job = {
            let mut tables = self.tables();
            let stamp = tables.stamp();
            let job = tables
                .jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
            job.status = status;
            job.result = result;
            job.updated_at = stamp;
            job.clone()
        };
        self.emit(ChangeEvent::update(job.clone()));
        Ok(job)
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn list_devices(&self, owner_id: &str) -> Result<Vec<Device>> {
        let tables = self.tables();
        let owned: Vec<Device> = tables
            .devices
            .iter()
            .filter(|d| d.owner_id == owner_id)
            .cloned()
            .collect();
        Ok(newest_first(&owned, |d| d.created_at))
    }

    async fn get_device(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.tables().devices.iter().find(|d| d.id == id).cloned())
    }

    async fn insert_device(&self, new: NewDevice) -> Result<Device> {
        self.check_writable()?;
        let device = {
            let mut tables = self.tables();
            let now = tables.stamp();
            let device = Device {
                id: Uuid::new_v4().to_string(),
                owner_id: new.owner_id,
                name: new.name,
                address: new.address,
                status: DetectionStatus::Stopped,
                created_at: now,
                updated_at: now,
            };
            tables.devices.push(device.clone());
            device
        };
        self.emit(ChangeEvent::insert(device.clone()));
        Ok(device)
    }

    async fn update_device_name(&self, id: &str, name: &str) -> Result<Device> {
        self.check_writable()?;
        let device = {
            let mut tables = self.tables();
            let stamp = tables.stamp();
            let device = tables
                .devices
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| Error::NotFound(format!("device {}", id)))?;
            device.name = name.to_string();
            device.updated_at = stamp;
            device.clone()
        };
        self.emit(ChangeEvent::update(device.clone()));
        Ok(device)
    }

    async fn update_device_status(&self, id: &str, status: DetectionStatus) -> Result<Device> {
        self.check_writable()?;
        let device = {
            let mut tables = self.tables();
            let stamp = tables.stamp();
            let device = tables
                .devices
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| Error::NotFound(format!("device {}", id)))?;
            device.status = status;
            device.updated_at = stamp;
            device.clone()
        };
        self.emit(ChangeEvent::update(device.clone()));
        Ok(device)
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        let (device, cascaded) = {
            let mut tables = self.tables();
            let index = tables
                .devices
                .iter()
                .position(|d| d.id == id)
                .ok_or_else(|| Error::NotFound(format!("device {}", id)))?;
            let device = tables.devices.remove(index);
            let (cascaded, kept): (Vec<Notification>, Vec<Notification>) = tables
                .notifications
                .drain(..)
                .partition(|n| n.device_id == id);
            tables.notifications = kept;
            (device, cascaded)
        };

        for notification in cascaded {
            self.emit(ChangeEvent::delete(notification));
        }
        self.emit(ChangeEvent::delete(device));
        Ok(())
    }

    async fn list_notifications(&self, filter: &ScopeFilter) -> Result<Vec<Notification>> {
        let tables = self.tables();
        let matched: Vec<Notification> = tables
            .notifications
            .iter()
            .filter(|n| match filter {
                ScopeFilter::Owner(user_id) => &n.user_id == user_id,
                ScopeFilter::Device(device_id) => &n.device_id == device_id,
            })
            .cloned()
            .collect();
        Ok(newest_first(&matched, |n| n.timestamp))
    }

    async fn list_jobs(&self, owner_id: &str) -> Result<Vec<AnalysisJob>> {
        let tables = self.tables();
        let owned: Vec<AnalysisJob> = tables
            .jobs
            .iter()
            .filter(|j| j.user_id == owner_id)
            .cloned()
            .collect();
        Ok(newest_first(&owned, |j| j.created_at))
    }

    async fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>> {
        Ok(self.tables().jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn insert_job(&self, new: NewJob) -> Result<AnalysisJob> {
        self.check_writable()?;
        let job = {
            let mut tables = self.tables();
            let now = tables.stamp();
            let job = AnalysisJob {
                id: Uuid::new_v4().to_string(),
                user_id: new.user_id,
                video_uri: new.video_uri,
                status: JobStatus::Pending,
                result: None,
                created_at: now,
                updated_at: now,
            };
            tables.jobs.push(job.clone());
            job
        };
        self.emit(ChangeEvent::insert(job.clone()));
        Ok(job)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_feed::{FeedTransport, SubscriptionKey};
    use crate::models::EntityType;

    fn new_device(name: &str) -> NewDevice {
        NewDevice {
            owner_id: "u1".to_string(),
            name: name.to_string(),
            address: format!("rtsp://{}/stream", name),
        }
    }

    #[tokio::test]
    async fn test_device_lifecycle_and_cascade() {
        let store = MemoryStore::new();
        let device = store.insert_device(new_device("lobby")).await.unwrap();
        assert_eq!(device.status, DetectionStatus::Stopped);

        let updated = store
            .update_device_status(&device.id, DetectionStatus::Started)
            .await
            .unwrap();
        assert!(updated.updated_at > device.updated_at);

        store.record_detection(&device.id, "Violence detected!").unwrap();
        store.delete_device(&device.id).await.unwrap();

        let remaining = store
            .list_notifications(&ScopeFilter::Device(device.id.clone()))
            .await
            .unwrap();
        assert!(remaining.is_empty());
        assert!(store.get_device(&device.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store.insert_device(new_device("lobby")).await.unwrap_err();
        assert!(matches!(err, Error::StoreWriteFailed(_)));
    }

    #[tokio::test]
    async fn test_fetch_scope_newest_first() {
        let store = MemoryStore::new();
        let first = store.insert_device(new_device("a")).await.unwrap();
        let second = store.insert_device(new_device("b")).await.unwrap();

        let rows = store
            .fetch_scope(&SubscriptionKey::owned_by(EntityType::Device, "u1"))
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
    }

    #[tokio::test]
    async fn test_writes_are_published() {
        let feed = Arc::new(MemoryFeedTransport::default());
        let store = MemoryStore::with_feed(feed.clone());
        let key = SubscriptionKey::owned_by(EntityType::Device, "u1");

        let mut conn = feed.connect(&key).await.unwrap();
        let device = store.insert_device(new_device("lobby")).await.unwrap();

        let event = conn.next_event().await.unwrap().unwrap();
        assert_eq!(event, ChangeEvent::insert(device));
    }
}
