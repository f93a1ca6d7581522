//! DeviceRegistry - Device CRUD
//!
//! ## Responsibilities
//!
//! - Add / rename / delete devices through the store
//! - Merge each store acknowledgment into the cache
//! - Keep the detector's device list in step (best-effort)
//! - Notification listings enriched with device names
//! - Ownership checks for device-scoped views

use serde::Serialize;
use std::sync::Arc;

use crate::detector_client::DetectorClient;
use crate::error::{Error, Result};
use crate::models::{Device, EntityType, Notification};
use crate::reconciler::Reconciler;
use crate::session::SessionContext;
use crate::store::{NewDevice, StoreClient};
use crate::subscription_manager::ViewKind;

/// Notification with its device's display name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationView {
    #[serde(flatten)]
    pub notification: Notification,
    pub device_name: Option<String>,
}

/// Device registry
pub struct DeviceRegistry {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn StoreClient>,
    detector: Arc<dyn DetectorClient>,
}

impl DeviceRegistry {
    pub fn new(
        reconciler: Arc<Reconciler>,
        store: Arc<dyn StoreClient>,
        detector: Arc<dyn DetectorClient>,
    ) -> Self {
        Self {
            reconciler,
            store,
            detector,
        }
    }

    /// Register a new device (starts `stopped`)
    pub async fn add_device(&self, ctx: &SessionContext, name: &str, address: &str) -> Result<Device> {
        let name = name.trim();
        let address = address.trim();
        if name.is_empty() {
            return Err(Error::Validation("device name is required".to_string()));
        }
        if address.is_empty() {
            return Err(Error::Validation("device address is required".to_string()));
        }

        let device = self
            .store
            .insert_device(NewDevice {
                owner_id: ctx.user_id.clone(),
                name: name.to_string(),
                address: address.to_string(),
            })
            .await?;
        self.reconciler.apply_rest_result(device.clone().into()).await;

        tracing::info!(device_id = %device.id, user_id = %ctx.user_id, "Device added");

        if let Err(e) = self
            .detector
            .register_device(&device.owner_id, &device.id, &device.address)
            .await
        {
            tracing::warn!(device_id = %device.id, error = %e, "Detector not told about new device");
        }

        Ok(device)
    }

    pub async fn rename_device(&self, ctx: &SessionContext, device_id: &str, name: &str) -> Result<Device> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("device name is required".to_string()));
        }
        self.owned_device(ctx, device_id).await?;

        let device = self.store.update_device_name(device_id, name).await?;
        self.reconciler.apply_rest_result(device.clone().into()).await;

        tracing::info!(device_id = %device_id, name = %name, "Device renamed");
        Ok(device)
    }

    /// Delete a device
    ///
    /// Only the device leaves the cache here; its notifications go when the
    /// store's cascade deletes arrive on the feed or on the next refetch.
    pub async fn delete_device(&self, ctx: &SessionContext, device_id: &str) -> Result<()> {
        let device = self.owned_device(ctx, device_id).await?;

        if let Err(e) = self.detector.deregister_device(&device.address).await {
            tracing::warn!(device_id = %device_id, error = %e, "Detector not told about removed device");
        }

        self.store.delete_device(device_id).await?;
        self.reconciler
            .apply_rest_delete(EntityType::Device, device_id)
            .await;

        tracing::info!(device_id = %device_id, "Device deleted");
        Ok(())
    }

    /// Cached devices of the session user, newest first
    pub fn list(&self, ctx: &SessionContext) -> Vec<Device> {
        self.reconciler.cache().devices_owned_by(&ctx.user_id)
    }

    /// Cached notifications, optionally for one device, with device names
    pub fn notifications(&self, ctx: &SessionContext, device_id: Option<&str>) -> Vec<NotificationView> {
        let cache = self.reconciler.cache();
        cache
            .notifications(|n| ctx.owns(&n.user_id) && device_id.map_or(true, |d| n.device_id == d))
            .into_iter()
            .map(|notification| NotificationView {
                device_name: cache.device(&notification.device_id).map(|d| d.name),
                notification,
            })
            .collect()
    }

    /// Reject views of devices the session user does not own
    pub async fn authorize_view(&self, ctx: &SessionContext, view: &ViewKind) -> Result<()> {
        match view {
            ViewKind::DeviceDetail { device_id } => {
                self.owned_device(ctx, device_id).await?;
                Ok(())
            }
            ViewKind::DeviceList | ViewKind::NotificationList | ViewKind::JobList => Ok(()),
        }
    }

    async fn owned_device(&self, ctx: &SessionContext, device_id: &str) -> Result<Device> {
        let device = match self.reconciler.cache().device(device_id) {
            Some(device) => device,
            None => self
                .store
                .get_device(device_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?,
        };
        if !ctx.owns(&device.owner_id) {
            return Err(Error::NotFound(format!("device {}", device_id)));
        }
        Ok(device)
    }
}
