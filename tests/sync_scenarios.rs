//! End-to-end sync scenarios over the in-memory store and push channel

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

use camwatch_sync::blob_storage::MemoryBlobStorage;
use camwatch_sync::change_feed::{
    ChangeEvent, FeedConfig, MemoryFeedTransport, ScopeFilter, SubscriptionKey,
};
use camwatch_sync::detector_client::DetectorClient;
use camwatch_sync::job_tracker::VideoUpload;
use camwatch_sync::models::{
    AnalysisJob, DetectionStatus, Device, EntityRecord, EntityType, JobStatus, Notification, Verdict,
};
use camwatch_sync::reconciler::MergeOutcome;
use camwatch_sync::session::SessionContext;
use camwatch_sync::state::{AppConfig, AppState, Backends};
use camwatch_sync::store::{MemoryStore, NewDevice, NewJob, StoreClient};
use camwatch_sync::subscription_manager::{SubscriptionState, ViewKind};
use camwatch_sync::{Error, Result};

const TEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct RecordingDetector {
    status_calls: AtomicUsize,
    jobs: AtomicUsize,
}

#[async_trait]
impl DetectorClient for RecordingDetector {
    async fn register_device(&self, _: &str, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn deregister_device(&self, _: &str) -> Result<()> {
        Ok(())
    }

    async fn register_job(&self, _: &str) -> Result<()> {
        self.jobs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_detection_status(&self, _: &str, _: DetectionStatus) -> Result<()> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// MemoryStore wrapper that counts scope reads, can slow status writes
/// and can hold one device listing after its snapshot was taken
struct InstrumentedStore {
    inner: Arc<MemoryStore>,
    status_delay: Duration,
    scope_reads: AtomicUsize,
    hold_device_read: AtomicBool,
    snapshot_taken: Notify,
    release: Notify,
}

impl InstrumentedStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            status_delay: Duration::ZERO,
            scope_reads: AtomicUsize::new(0),
            hold_device_read: AtomicBool::new(false),
            snapshot_taken: Notify::new(),
            release: Notify::new(),
        }
    }

    fn scope_reads(&self) -> usize {
        self.scope_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreClient for InstrumentedStore {
    async fn list_devices(&self, owner_id: &str) -> Result<Vec<Device>> {
        self.scope_reads.fetch_add(1, Ordering::SeqCst);
        let rows = self.inner.list_devices(owner_id).await?;
        if self.hold_device_read.swap(false, Ordering::SeqCst) {
            self.snapshot_taken.notify_one();
            self.release.notified().await;
        }
        Ok(rows)
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
        sleep(self.status_delay).await;
        self.inner.update_device_status(id, status).await
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        self.inner.delete_device(id).await
    }

    async fn list_notifications(&self, filter: &ScopeFilter) -> Result<Vec<Notification>> {
        self.scope_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.list_notifications(filter).await
    }

    async fn list_jobs(&self, owner_id: &str) -> Result<Vec<AnalysisJob>> {
        self.scope_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.list_jobs(owner_id).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>> {
        self.inner.get_job(id).await
    }

    async fn insert_job(&self, new: NewJob) -> Result<AnalysisJob> {
        self.inner.insert_job(new).await
    }

    fn backend(&self) -> &'static str {
        "instrumented-memory"
    }
}

struct Harness {
    state: AppState,
    store: Arc<MemoryStore>,
    transport: Arc<MemoryFeedTransport>,
    detector: Arc<RecordingDetector>,
}

fn test_config() -> AppConfig {
    AppConfig {
        feed: FeedConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            degraded_after: 2,
            queue_capacity: 64,
        },
        poll_interval: Duration::from_millis(20),
        ..AppConfig::default()
    }
}

fn harness_with(wrap: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn StoreClient>) -> Harness {
    let transport = Arc::new(MemoryFeedTransport::new(256));
    let store = Arc::new(MemoryStore::with_feed(transport.clone()));
    let detector = Arc::new(RecordingDetector::default());

    let state = AppState::assemble(
        test_config(),
        Backends {
            store: wrap(store.clone()),
            transport: transport.clone(),
            detector: detector.clone(),
            blob: Arc::new(MemoryBlobStorage::new()),
        },
    );

    Harness {
        state,
        store,
        transport,
        detector,
    }
}

fn harness() -> Harness {
    harness_with(|store| store)
}

async fn wait_for_state(state: &AppState, key: &SubscriptionKey, want: SubscriptionState) {
    let mut rx = state
        .subscriptions
        .watch_state(key)
        .expect("key should be active");
    timeout(TEST_TIMEOUT, rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {} to become {}", key, want))
        .expect("state channel closed");
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = timeout(TEST_TIMEOUT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_toggle_then_feed_echo_is_a_duplicate() {
    let h = harness();
    let ctx = SessionContext::new("u1");

    let keys = h.state.subscriptions.activate_view(&ctx, &ViewKind::DeviceList);
    wait_for_state(&h.state, &keys[0], SubscriptionState::Live).await;

    let device = h
        .state
        .devices
        .add_device(&ctx, "Lobby", "rtsp://10.0.0.5/stream")
        .await
        .unwrap();

    let toggled = h.state.toggles.request_toggle(&ctx, &device.id).await.unwrap();
    assert_eq!(toggled.status, DetectionStatus::Started);
    assert!(!h.state.toggles.is_in_flight(&device.id));

    // The store's own event for the write arrives through the pump
    let cache = h.state.reconciler.cache().clone();
    let device_id = device.id.clone();
    eventually("confirmed started device", || {
        cache
            .get(EntityType::Device, &device_id)
            .map(|e| !e.is_provisional() && e.record == EntityRecord::Device(toggled.clone()))
            .unwrap_or(false)
    })
    .await;

    let outcome = h
        .state
        .reconciler
        .apply_feed_event(ChangeEvent::update(toggled.clone()))
        .await;
    assert_eq!(outcome, MergeOutcome::Duplicate);
    assert_eq!(h.state.reconciler.cache().device(&device.id), Some(toggled));
    assert_eq!(h.detector.status_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_outage_is_healed_by_refetch() {
    let h = harness();
    let ctx = SessionContext::new("u1");

    let device = h
        .state
        .devices
        .add_device(&ctx, "Lobby", "rtsp://10.0.0.5/stream")
        .await
        .unwrap();

    let keys = h
        .state
        .subscriptions
        .activate_view(&ctx, &ViewKind::NotificationList);
    let key = keys[0].clone();
    wait_for_state(&h.state, &key, SubscriptionState::Live).await;

    h.transport.set_refusing(true);
    h.transport.drop_connections();
    wait_for_state(&h.state, &key, SubscriptionState::Retrying).await;

    // Written while nobody is listening; the push is lost
    let alert = h.store.record_detection(&device.id, "Violence detected!").unwrap();
    assert!(h.state.devices.notifications(&ctx, None).is_empty());

    h.transport.set_refusing(false);
    wait_for_state(&h.state, &key, SubscriptionState::Live).await;

    let views = h.state.devices.notifications(&ctx, None);
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].notification, alert);
    assert_eq!(views[0].device_name.as_deref(), Some("Lobby"));

    // Late redelivery of the lost event changes nothing
    let outcome = h
        .state
        .reconciler
        .apply_feed_event(ChangeEvent::insert(alert))
        .await;
    assert_eq!(outcome, MergeOutcome::Duplicate);
    assert_eq!(h.state.devices.notifications(&ctx, None).len(), 1);
}

#[tokio::test]
async fn test_reconnect_refetches_exactly_once() {
    let mut installed = None;
    let h = harness_with(|store| {
        let store = Arc::new(InstrumentedStore::new(store));
        installed = Some(store.clone());
        store
    });
    let store = installed.expect("store installed");
    let ctx = SessionContext::new("u1");

    let keys = h.state.subscriptions.activate_view(&ctx, &ViewKind::DeviceList);
    let key = keys[0].clone();
    wait_for_state(&h.state, &key, SubscriptionState::Live).await;
    assert_eq!(store.scope_reads(), 1);

    h.transport.set_refusing(true);
    h.transport.drop_connections();
    wait_for_state(&h.state, &key, SubscriptionState::Retrying).await;
    sleep(Duration::from_millis(60)).await;
    assert_eq!(store.scope_reads(), 1);

    h.transport.set_refusing(false);
    wait_for_state(&h.state, &key, SubscriptionState::Live).await;
    assert_eq!(store.scope_reads(), 2);

    sleep(Duration::from_millis(60)).await;
    assert_eq!(store.scope_reads(), 2);
    assert_eq!(h.state.subscriptions.state(&key), SubscriptionState::Live);
}

#[tokio::test]
async fn test_device_added_during_refetch_survives() {
    let mut installed = None;
    let h = harness_with(|store| {
        let store = Arc::new(InstrumentedStore::new(store));
        store.hold_device_read.store(true, Ordering::SeqCst);
        installed = Some(store.clone());
        store
    });
    let store = installed.expect("store installed");
    let ctx = SessionContext::new("u1");

    let keys = h.state.subscriptions.activate_view(&ctx, &ViewKind::DeviceList);
    let key = keys[0].clone();

    // The refetch has read an empty listing and is not merged yet
    timeout(TEST_TIMEOUT, store.snapshot_taken.notified())
        .await
        .expect("refetch should start");
    let device = h
        .state
        .devices
        .add_device(&ctx, "Lobby", "rtsp://10.0.0.5/stream")
        .await
        .unwrap();
    store.release.notify_one();

    wait_for_state(&h.state, &key, SubscriptionState::Live).await;
    assert_eq!(h.state.devices.list(&ctx), vec![device.clone()]);

    // The queued insert event lands after the refetch and is a duplicate
    sleep(Duration::from_millis(30)).await;
    assert_eq!(h.state.devices.list(&ctx), vec![device.clone()]);
    assert_eq!(
        h.state
            .reconciler
            .apply_feed_event(ChangeEvent::insert(device))
            .await,
        MergeOutcome::Duplicate
    );
}

#[tokio::test]
async fn test_views_share_one_subscription() {
    let h = harness();
    let ctx = SessionContext::new("u1");

    let first = h.state.subscriptions.activate_view(&ctx, &ViewKind::DeviceList);
    let second = h.state.subscriptions.activate_view(&ctx, &ViewKind::DeviceList);
    assert_eq!(first, second);
    let key = first[0].clone();

    assert_eq!(h.state.subscriptions.ref_count(&key), 2);
    wait_for_state(&h.state, &key, SubscriptionState::Live).await;
    assert_eq!(h.transport.connect_count(), 1);

    h.state.subscriptions.deactivate_view(&ctx, &ViewKind::DeviceList);
    assert_eq!(h.state.subscriptions.ref_count(&key), 1);
    assert_eq!(h.state.subscriptions.state(&key), SubscriptionState::Live);

    h.state.subscriptions.deactivate_view(&ctx, &ViewKind::DeviceList);
    assert_eq!(h.state.subscriptions.state(&key), SubscriptionState::Idle);
    assert_eq!(h.state.subscriptions.active_count(), 0);

    let transport = h.transport.clone();
    eventually("feed connection closed", || transport.open_connections() == 0).await;
}

#[tokio::test]
async fn test_job_status_never_regresses() {
    let h = harness();
    let ctx = SessionContext::new("u1");

    let keys = h.state.subscriptions.activate_view(&ctx, &ViewKind::JobList);
    wait_for_state(&h.state, &keys[0], SubscriptionState::Live).await;

    let mut changes = h.state.reconciler.subscribe_changes();

    let job = h
        .state
        .jobs
        .submit_video(
            &ctx,
            VideoUpload {
                file_name: "clip.mp4".to_string(),
                content_type: "video/mp4".to_string(),
                bytes: vec![0u8; 128],
            },
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(h.detector.jobs.load(Ordering::SeqCst), 1);

    let processing = h
        .store
        .advance_job(&job.id, JobStatus::Processing, None)
        .unwrap();
    h.store
        .advance_job(&job.id, JobStatus::Completed, Some(Verdict::ViolenceDetected))
        .unwrap();

    let done = h
        .state
        .jobs
        .wait_for_completion(&job.id, TEST_TIMEOUT)
        .await
        .expect("job should complete");
    assert_eq!(done.result, Some(Verdict::ViolenceDetected));

    let mut seen = Vec::new();
    while let Ok(change) = changes.try_recv() {
        if let EntityRecord::AnalysisJob(j) = change.record {
            if j.id == job.id {
                seen.push(j.status);
            }
        }
    }
    assert_eq!(seen.first(), Some(&JobStatus::Pending));
    assert_eq!(seen.last(), Some(&JobStatus::Completed));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "statuses: {:?}", seen);

    // A stale `processing` row after completion is ignored
    let outcome = h
        .state
        .reconciler
        .apply_feed_event(ChangeEvent::update(processing))
        .await;
    assert_eq!(outcome, MergeOutcome::Ignored);
    assert_eq!(h.state.jobs.status(&ctx, &job.id).await.unwrap(), Some(done));
}

#[tokio::test]
async fn test_concurrent_toggles_are_exclusive() {
    let h = harness_with(|store| {
        Arc::new(InstrumentedStore {
            status_delay: Duration::from_millis(50),
            ..InstrumentedStore::new(store)
        })
    });
    let ctx = SessionContext::new("u1");

    let device = h
        .state
        .devices
        .add_device(&ctx, "Lobby", "rtsp://10.0.0.5/stream")
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        h.state.toggles.request_toggle(&ctx, &device.id),
        h.state.toggles.request_toggle(&ctx, &device.id),
    );

    let results = [a, b];
    let accepted: Vec<&Device> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].status, DetectionStatus::Started);
    assert!(results.iter().any(|r| matches!(r, Err(Error::Busy(_)))));

    assert_eq!(
        h.store.get_device(&device.id).await.unwrap().map(|d| d.status),
        Some(DetectionStatus::Started)
    );
    assert!(!h.state.toggles.is_in_flight(&device.id));
}
