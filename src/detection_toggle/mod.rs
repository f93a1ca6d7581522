//! DetectionToggleController - User-Initiated Detection Flips
//!
//! ## Responsibilities
//!
//! - At most one toggle in flight per device (`Busy` otherwise)
//! - Optimistic cache write, rolled back if the store rejects the update
//! - Best-effort detector notification after the store confirms
//!
//! ## Sequence
//!
//! 1. Claim the in-flight flag
//! 2. Read the last confirmed status and compute its inverse
//! 3. Optimistic write of the new status
//! 4. Store update; on failure roll back and surface `StoreWriteFailed`
//! 5. Merge the store's row as the REST result
//! 6. Release the flag
//! 7. Notify the detector (failure only logged)

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::detector_client::DetectorClient;
use crate::error::{Error, Result};
use crate::models::{DetectionStatus, Device, EntityType};
use crate::reconciler::Reconciler;
use crate::session::SessionContext;
use crate::store::StoreClient;

type InFlightSet = Arc<Mutex<HashSet<String>>>;

/// Releases a device's in-flight flag on drop
struct InFlightGuard {
    set: InFlightSet,
    device_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.device_id);
    }
}

/// Detection toggle controller
pub struct DetectionToggleController {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn StoreClient>,
    detector: Arc<dyn DetectorClient>,
    in_flight: InFlightSet,
}

impl DetectionToggleController {
    pub fn new(
        reconciler: Arc<Reconciler>,
        store: Arc<dyn StoreClient>,
        detector: Arc<dyn DetectorClient>,
    ) -> Self {
        Self {
            reconciler,
            store,
            detector,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_in_flight(&self, device_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(device_id))
            .unwrap_or(false)
    }

    fn claim(&self, device_id: &str) -> Result<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(device_id.to_string()) {
            return Err(Error::Busy(device_id.to_string()));
        }
        Ok(InFlightGuard {
            set: self.in_flight.clone(),
            device_id: device_id.to_string(),
        })
    }

    /// Last confirmed device row, loading it from the store if not cached
    async fn confirmed_device(&self, device_id: &str) -> Result<Device> {
        let cached = self
            .reconciler
            .cache()
            .get(EntityType::Device, device_id)
            .and_then(|entry| entry.confirmed().and_then(|r| r.as_device().cloned()));
        if let Some(device) = cached {
            return Ok(device);
        }

        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?;
        self.reconciler.apply_rest_result(device.clone().into()).await;
        Ok(device)
    }

    /// Flip a device's detection status
    ///
    /// Returns the row confirmed by the store.
    pub async fn request_toggle(&self, ctx: &SessionContext, device_id: &str) -> Result<Device> {
        let guard = self.claim(device_id)?;

        let current = self.confirmed_device(device_id).await?;
        if !ctx.owns(&current.owner_id) {
            return Err(Error::NotFound(format!("device {}", device_id)));
        }

        let target = current.status.inverse();
        tracing::info!(
            device_id = %device_id,
            from = %current.status,
            to = %target,
            "Detection toggle requested"
        );

        let mut optimistic = current.clone();
        optimistic.status = target;
        let version = self.reconciler.apply_optimistic(optimistic.into()).await;

        let confirmed = match self.store.update_device_status(device_id, target).await {
            Ok(device) => device,
            Err(e) => {
                self.reconciler
                    .rollback_optimistic(EntityType::Device, device_id, version)
                    .await;
                drop(guard);
                tracing::error!(
                    device_id = %device_id,
                    error = %e,
                    "Detection toggle rejected by store, rolled back"
                );
                return Err(match e {
                    Error::StoreWriteFailed(msg) => Error::StoreWriteFailed(msg),
                    Error::NotFound(msg) => Error::NotFound(msg),
                    other => Error::StoreWriteFailed(other.to_string()),
                });
            }
        };

        self.reconciler
            .apply_rest_result(confirmed.clone().into())
            .await;
        drop(guard);

        self.notify_detector(device_id, target).await;

        Ok(confirmed)
    }

    async fn notify_detector(&self, device_id: &str, status: DetectionStatus) {
        if let Err(e) = self.detector.set_detection_status(device_id, status).await {
            tracing::warn!(
                device_id = %device_id,
                status = %status,
                error = %e,
                "Detector not notified of detection status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_feed::ScopeFilter;
    use crate::entity_cache::EntityCache;
    use crate::models::{AnalysisJob, Notification};
    use crate::store::{MemoryStore, NewDevice, NewJob};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    /// Detector that can fail, or hang on its first call until released
    #[derive(Default)]
    struct StubDetector {
        fail: bool,
        gate: Option<Arc<Notify>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DetectorClient for StubDetector {
        async fn register_device(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn deregister_device(&self, _: &str) -> Result<()> {
            Ok(())
        }

        async fn register_job(&self, _: &str) -> Result<()> {
            Ok(())
        }

        async fn set_detection_status(&self, _: &str, _: DetectionStatus) -> Result<()> {
            let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
            if let (true, Some(gate)) = (first, &self.gate) {
                gate.notified().await;
            }
            if self.fail {
                return Err(Error::DetectorUnreachable("connection refused".to_string()));
            }
            Ok(())
        }
    }

    /// Store whose first status update hangs until released
    struct GatedStore {
        inner: MemoryStore,
        gate: Notify,
        entered: AtomicUsize,
    }

    #[async_trait]
    impl StoreClient for GatedStore {
        async fn list_devices(&self, owner_id: &str) -> Result<Vec<Device>> {
            self.inner.list_devices(owner_id).await
        }

        async fn get_device(&self, id: &str) -> Result<Option<Device>> {
            self.inner.get_device(id).await
        }

        async fn insert_device(&self, new: NewDevice) -> Result<Device> {
            self.inner.insert_device(new).await
        }

        async fn update_device_name(&self, id: &str, name: &str) -> Result<Device> {
            self.inner.update_device_name(id, name).await
        }

        async fn update_device_status(&self, id: &str, status: DetectionStatus) -> Result<Device> {
            if self.entered.fetch_add(1, Ordering::SeqCst) == 0 {
                self.gate.notified().await;
            }
            self.inner.update_device_status(id, status).await
        }

        async fn delete_device(&self, id: &str) -> Result<()> {
            self.inner.delete_device(id).await
        }

        async fn list_notifications(&self, filter: &ScopeFilter) -> Result<Vec<Notification>> {
            self.inner.list_notifications(filter).await
        }

        async fn list_jobs(&self, owner_id: &str) -> Result<Vec<AnalysisJob>> {
            self.inner.list_jobs(owner_id).await
        }

        async fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>> {
            self.inner.get_job(id).await
        }

        async fn insert_job(&self, new: NewJob) -> Result<AnalysisJob> {
            self.inner.insert_job(new).await
        }

        fn backend(&self) -> &'static str {
            "gated"
        }
    }

    fn lobby() -> NewDevice {
        NewDevice {
            owner_id: "u1".to_string(),
            name: "Lobby".to_string(),
            address: "rtsp://10.0.0.5/stream".to_string(),
        }
    }

    struct Fixture {
        controller: Arc<DetectionToggleController>,
        reconciler: Arc<Reconciler>,
        store: Arc<MemoryStore>,
        detector: Arc<StubDetector>,
        device: Device,
    }

    async fn fixture(detector: StubDetector) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Arc::new(Reconciler::new(Arc::new(EntityCache::new())));
        let device = store.insert_device(lobby()).await.unwrap();
        reconciler.apply_rest_result(device.clone().into()).await;

        let detector = Arc::new(detector);
        let controller = Arc::new(DetectionToggleController::new(
            reconciler.clone(),
            store.clone(),
            detector.clone(),
        ));
        Fixture {
            controller,
            reconciler,
            store,
            detector,
            device,
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        timeout(TEST_TIMEOUT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_toggle_survives_detector_failure() {
        let fx = fixture(StubDetector {
            fail: true,
            ..Default::default()
        })
        .await;
        let ctx = SessionContext::new("u1");

        let device = fx.controller.request_toggle(&ctx, &fx.device.id).await.unwrap();
        assert_eq!(device.status, DetectionStatus::Started);
        assert_eq!(fx.detector.calls.load(Ordering::SeqCst), 1);

        let entry = fx.reconciler.cache().get(EntityType::Device, &fx.device.id).unwrap();
        assert!(!entry.is_provisional());
        assert_eq!(
            entry.record.as_device().unwrap().status,
            DetectionStatus::Started
        );
        assert!(!fx.controller.is_in_flight(&fx.device.id));
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back() {
        let fx = fixture(StubDetector::default()).await;
        fx.store.set_fail_writes(true);
        let ctx = SessionContext::new("u1");

        let err = fx.controller.request_toggle(&ctx, &fx.device.id).await.unwrap_err();
        assert!(matches!(err, Error::StoreWriteFailed(_)));

        let entry = fx.reconciler.cache().get(EntityType::Device, &fx.device.id).unwrap();
        assert!(!entry.is_provisional());
        assert_eq!(entry.record, fx.device.clone().into());
        assert!(!fx.controller.is_in_flight(&fx.device.id));
        assert_eq!(fx.detector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flag_clears_before_detector_answers() {
        let gate = Arc::new(Notify::new());
        let fx = fixture(StubDetector {
            gate: Some(gate.clone()),
            ..Default::default()
        })
        .await;

        let controller = fx.controller.clone();
        let device_id = fx.device.id.clone();
        let first = tokio::spawn(async move {
            controller
                .request_toggle(&SessionContext::new("u1"), &device_id)
                .await
        });

        let detector = fx.detector.clone();
        wait_until(move || detector.calls.load(Ordering::SeqCst) == 1).await;
        assert!(!fx.controller.is_in_flight(&fx.device.id));

        // Detector still hanging on the first call; a second toggle proceeds
        let second = fx
            .controller
            .request_toggle(&SessionContext::new("u1"), &fx.device.id)
            .await
            .unwrap();
        assert_eq!(second.status, DetectionStatus::Stopped);

        gate.notify_one();
        let first = timeout(TEST_TIMEOUT, first).await.unwrap().unwrap().unwrap();
        assert_eq!(first.status, DetectionStatus::Started);
    }

    #[tokio::test]
    async fn test_concurrent_toggles_one_accepted_one_busy() {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            gate: Notify::new(),
            entered: AtomicUsize::new(0),
        });
        let reconciler = Arc::new(Reconciler::new(Arc::new(EntityCache::new())));
        let device = store.insert_device(lobby()).await.unwrap();
        reconciler.apply_rest_result(device.clone().into()).await;
        let controller = Arc::new(DetectionToggleController::new(
            reconciler.clone(),
            store.clone(),
            Arc::new(StubDetector::default()),
        ));

        let first = {
            let controller = controller.clone();
            let device_id = device.id.clone();
            tokio::spawn(async move {
                controller
                    .request_toggle(&SessionContext::new("u1"), &device_id)
                    .await
            })
        };

        let gated = store.clone();
        wait_until(move || gated.entered.load(Ordering::SeqCst) == 1).await;
        assert!(controller.is_in_flight(&device.id));
        assert!(reconciler.cache().get(EntityType::Device, &device.id).unwrap().is_provisional());

        let second = controller
            .request_toggle(&SessionContext::new("u1"), &device.id)
            .await;
        assert!(matches!(second, Err(Error::Busy(_))));

        store.gate.notify_one();
        let first = timeout(TEST_TIMEOUT, first).await.unwrap().unwrap().unwrap();
        assert_eq!(first.status, DetectionStatus::Started);
        assert!(!controller.is_in_flight(&device.id));
    }

    #[tokio::test]
    async fn test_foreign_device_is_not_found() {
        let fx = fixture(StubDetector::default()).await;
        let err = fx
            .controller
            .request_toggle(&SessionContext::new("intruder"), &fx.device.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!fx.controller.is_in_flight(&fx.device.id));
    }
}
