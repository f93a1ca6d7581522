//! ChangeFeedClient - Push Channel Subscriptions
//!
//! ## Responsibilities
//!
//! - Open one push-channel subscription per key
//! - Reconnect with capped exponential backoff after transport loss. The
//!   backoff only resets once a connection delivered an event or stayed up
//!   for `max_delay`.
//! - Report `Connected { resumed }` so consumers can schedule a refetch
//! - Report `Degraded` when a subscription never comes up
//!
//! Events delivered while disconnected are not replayed.

pub mod memory;
pub mod pg_listener;
pub mod transport;
pub mod types;

pub use memory::MemoryFeedTransport;
pub use pg_listener::PgFeedTransport;
pub use transport::{FeedConnection, FeedConnectionBox, FeedTransport};
pub use types::*;

use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Subscription identifier
pub type SubscriptionId = Uuid;

struct SubscriptionSlot {
    key: SubscriptionKey,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Consumer end of one subscription
///
/// Yields feed signals until unsubscribed. Once closed, queued signals
/// are discarded.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    key: SubscriptionKey,
    rx: mpsc::Receiver<FeedSignal>,
    closed: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next signal, or `None` once the subscription is closed
    pub async fn next(&mut self) -> Option<FeedSignal> {
        if self.is_closed() {
            return None;
        }
        let signal = self.rx.recv().await?;
        if self.is_closed() {
            return None;
        }
        Some(signal)
    }
}

impl Stream for SubscriptionHandle {
    type Item = FeedSignal;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.is_closed() {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(_)) if this.is_closed() => Poll::Ready(None),
            other => other,
        }
    }
}

/// Change feed client
pub struct ChangeFeedClient {
    transport: Arc<dyn FeedTransport>,
    config: FeedConfig,
    subscriptions: Mutex<HashMap<SubscriptionId, SubscriptionSlot>>,
}

impl ChangeFeedClient {
    pub fn new(transport: Arc<dyn FeedTransport>, config: FeedConfig) -> Self {
        Self {
            transport,
            config,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Open a subscription for `key`
    ///
    /// Returns immediately; connection progress arrives as signals.
    pub fn subscribe(&self, key: SubscriptionKey) -> SubscriptionHandle {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));

        let listener = FeedListener {
            id,
            key: key.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            tx,
            closed: closed.clone(),
        };
        let task = tokio::spawn(listener.run());

        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.insert(
                id,
                SubscriptionSlot {
                    key: key.clone(),
                    closed: closed.clone(),
                    task,
                },
            );
        }

        tracing::info!(
            subscription_id = %id,
            key = %key,
            transport = self.transport.name(),
            "Subscription opened"
        );

        SubscriptionHandle {
            id,
            key,
            rx,
            closed,
        }
    }

    /// Close a subscription. Idempotent.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.unsubscribe_id(handle.id());
    }

    /// Close a subscription by id. Idempotent.
    pub fn unsubscribe_id(&self, id: SubscriptionId) {
        let slot = match self.subscriptions.lock() {
            Ok(mut subs) => subs.remove(&id),
            Err(_) => None,
        };

        if let Some(slot) = slot {
            slot.closed.store(true, Ordering::SeqCst);
            slot.task.abort();
            tracing::info!(subscription_id = %id, key = %slot.key, "Subscription closed");
        }
    }

    /// Subscriptions currently open
    pub fn active_count(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Drop for ChangeFeedClient {
    fn drop(&mut self) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            for (_, slot) in subs.drain() {
                slot.closed.store(true, Ordering::SeqCst);
                slot.task.abort();
            }
        }
    }
}

/// Background task owning the transport connection of one subscription
struct FeedListener {
    id: SubscriptionId,
    key: SubscriptionKey,
    transport: Arc<dyn FeedTransport>,
    config: FeedConfig,
    tx: mpsc::Sender<FeedSignal>,
    closed: Arc<AtomicBool>,
}

impl FeedListener {
    async fn run(self) {
        let mut attempt: u32 = 0;
        let mut ever_connected = false;
        let mut degraded_reported = false;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            match self.transport.connect(&self.key).await {
                Ok(mut conn) => {
                    let connected_at = Instant::now();
                    let mut delivered = false;
                    let resumed = ever_connected;
                    ever_connected = true;

                    tracing::info!(
                        subscription_id = %self.id,
                        key = %self.key,
                        resumed = resumed,
                        "Change feed connected"
                    );
                    if !self.emit(FeedSignal::Connected { resumed }).await {
                        return;
                    }

                    let reason = loop {
                        match conn.next_event().await {
                            Ok(Some(event)) => {
                                delivered = true;
                                if !self.key.matches(&event) {
                                    continue;
                                }
                                if !self.emit(FeedSignal::Event(event)).await {
                                    return;
                                }
                            }
                            Ok(None) => break "connection closed by server".to_string(),
                            Err(e) => break e.to_string(),
                        }
                    };
                    drop(conn);

                    if delivered || connected_at.elapsed() >= self.config.max_delay {
                        attempt = 0;
                    } else {
                        attempt = attempt.saturating_add(1);
                    }

                    tracing::warn!(
                        subscription_id = %self.id,
                        key = %self.key,
                        reason = %reason,
                        attempt = attempt,
                        "Change feed transport lost"
                    );
                    if !self.emit(FeedSignal::Disconnected { reason }).await {
                        return;
                    }
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        subscription_id = %self.id,
                        key = %self.key,
                        attempt = attempt,
                        error = %e,
                        "Change feed connect failed"
                    );

                    if !ever_connected && !degraded_reported && attempt >= self.config.degraded_after {
                        degraded_reported = true;
                        tracing::warn!(
                            subscription_id = %self.id,
                            key = %self.key,
                            attempts = attempt,
                            "Change feed degraded, consumer should poll"
                        );
                        let signal = FeedSignal::Degraded {
                            attempts: attempt,
                            reason: e.to_string(),
                        };
                        if !self.emit(signal).await {
                            return;
                        }
                    }
                }
            }

            tokio::time::sleep(self.config.retry_delay(attempt)).await;
        }
    }

    /// Deliver a signal; false when the consumer is gone
    async fn emit(&self, signal: FeedSignal) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.send(signal).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, Notification};
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    fn fast_config() -> FeedConfig {
        FeedConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            degraded_after: 2,
            queue_capacity: 16,
        }
    }

    fn notification(id: &str, device_id: &str) -> Notification {
        Notification {
            id: id.to_string(),
            device_id: device_id.to_string(),
            user_id: "u1".to_string(),
            message: "Violence detected!".to_string(),
            timestamp: Utc::now(),
        }
    }

    async fn next_signal(handle: &mut SubscriptionHandle) -> FeedSignal {
        timeout(TEST_TIMEOUT, handle.next())
            .await
            .expect("timed out waiting for signal")
            .expect("subscription ended")
    }

    #[tokio::test]
    async fn test_delivers_only_matching_events() {
        let transport = Arc::new(MemoryFeedTransport::default());
        let client = ChangeFeedClient::new(transport.clone(), fast_config());
        let mut handle = client.subscribe(SubscriptionKey::for_device(EntityType::Notification, "d1"));

        assert_eq!(next_signal(&mut handle).await, FeedSignal::Connected { resumed: false });

        transport.publish(ChangeEvent::insert(notification("n0", "d2")));
        transport.publish(ChangeEvent::insert(notification("n1", "d1")));

        match next_signal(&mut handle).await {
            FeedSignal::Event(event) => assert_eq!(event.payload.id(), "n1"),
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_transport_loss() {
        let transport = Arc::new(MemoryFeedTransport::default());
        let client = ChangeFeedClient::new(transport.clone(), fast_config());
        let mut handle = client.subscribe(SubscriptionKey::owned_by(EntityType::Notification, "u1"));

        assert_eq!(next_signal(&mut handle).await, FeedSignal::Connected { resumed: false });

        transport.drop_connections();
        assert!(matches!(
            next_signal(&mut handle).await,
            FeedSignal::Disconnected { .. }
        ));
        assert_eq!(next_signal(&mut handle).await, FeedSignal::Connected { resumed: true });
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_reports_degraded_then_recovers() {
        let transport = Arc::new(MemoryFeedTransport::default());
        transport.refuse_next(3);
        let client = ChangeFeedClient::new(transport.clone(), fast_config());
        let mut handle = client.subscribe(SubscriptionKey::owned_by(EntityType::AnalysisJob, "u1"));

        match next_signal(&mut handle).await {
            FeedSignal::Degraded { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected signal: {:?}", other),
        }
        assert_eq!(next_signal(&mut handle).await, FeedSignal::Connected { resumed: false });
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_connection_keeps_backing_off() {
        let transport = Arc::new(MemoryFeedTransport::default());
        transport.set_flapping(true);
        let config = FeedConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(5),
            degraded_after: 2,
            queue_capacity: 16,
        };
        let client = ChangeFeedClient::new(transport.clone(), config);
        let mut handle = client.subscribe(SubscriptionKey::owned_by(EntityType::Device, "u1"));

        let mut connected_at = Vec::new();
        while connected_at.len() < 5 {
            if let FeedSignal::Connected { .. } = next_signal(&mut handle).await {
                connected_at.push(Instant::now());
            }
        }

        let gaps: Vec<Duration> = connected_at.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|w| w[1] > w[0]), "gaps: {:?}", gaps);
        assert!(gaps[3] >= Duration::from_millis(160));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_delivery() {
        let transport = Arc::new(MemoryFeedTransport::default());
        let config = FeedConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(5),
            degraded_after: 2,
            queue_capacity: 16,
        };
        let client = ChangeFeedClient::new(transport.clone(), config);
        let mut handle = client.subscribe(SubscriptionKey::for_device(EntityType::Notification, "d1"));

        assert_eq!(next_signal(&mut handle).await, FeedSignal::Connected { resumed: false });
        transport.publish(ChangeEvent::insert(notification("n1", "d1")));
        assert!(matches!(next_signal(&mut handle).await, FeedSignal::Event(_)));

        transport.drop_connections();
        assert!(matches!(
            next_signal(&mut handle).await,
            FeedSignal::Disconnected { .. }
        ));
        let lost_at = Instant::now();
        assert_eq!(next_signal(&mut handle).await, FeedSignal::Connected { resumed: true });
        assert_eq!(Instant::now() - lost_at, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_drops_queue() {
        let transport = Arc::new(MemoryFeedTransport::default());
        let client = ChangeFeedClient::new(transport.clone(), fast_config());
        let mut handle = client.subscribe(SubscriptionKey::for_device(EntityType::Notification, "d1"));

        assert_eq!(next_signal(&mut handle).await, FeedSignal::Connected { resumed: false });
        transport.publish(ChangeEvent::insert(notification("n1", "d1")));

        client.unsubscribe(&handle);
        client.unsubscribe(&handle);

        assert_eq!(client.active_count(), 0);
        assert!(handle.is_closed());
        assert_eq!(timeout(TEST_TIMEOUT, handle.next()).await.unwrap(), None);
    }
}
