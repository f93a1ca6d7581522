//! Per-subscription pump task
//!
//! Drains one subscription handle into the Reconciler and drives the
//! key's lifecycle state. Every (re)connect is followed by a full scope
//! refetch before the key is marked live.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::types::{StateChange, SubscriptionState};
use crate::change_feed::{FeedConfig, FeedSignal, SubscriptionHandle, SubscriptionKey};
use crate::error::Result;
use crate::reconciler::{Reconciler, RefetchSummary};
use crate::store::StoreClient;

/// Shared state sender for one key
pub(crate) struct StateCell {
    pub key: SubscriptionKey,
    pub tx: watch::Sender<SubscriptionState>,
    pub events: broadcast::Sender<StateChange>,
}

impl StateCell {
    pub fn set(&self, state: SubscriptionState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            tracing::info!(key = %self.key, state = %state, "Subscription state changed");
            let _ = self.events.send(StateChange {
                key: self.key.clone(),
                state,
            });
        }
    }
}

/// Refetch everything under `key` and merge it
pub(crate) async fn refetch(
    store: &dyn StoreClient,
    reconciler: &Reconciler,
    key: &SubscriptionKey,
) -> Result<RefetchSummary> {
    let mark = reconciler.refetch_mark();
    let rows = store.fetch_scope(key).await?;
    Ok(reconciler.replace_scope(key, rows, mark).await)
}

/// Aborts the polling task on drop
struct Poller(Option<JoinHandle<()>>);

impl Poller {
    fn running(&self) -> bool {
        self.0.is_some()
    }

    fn stop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) struct Pump {
    pub cell: Arc<StateCell>,
    pub store: Arc<dyn StoreClient>,
    pub reconciler: Arc<Reconciler>,
    pub feed_config: FeedConfig,
    pub poll_interval: Duration,
}

impl Pump {
    pub async fn run(self, mut handle: SubscriptionHandle) {
        let mut poller = Poller(None);

        while let Some(signal) = handle.next().await {
            match signal {
                FeedSignal::Connected { resumed } => {
                    poller.stop();
                    if resumed {
                        tracing::info!(key = %self.cell.key, "Feed resumed, refetching scope");
                    }
                    self.refetch_until_done().await;
                    self.cell.set(SubscriptionState::Live);
                }
                FeedSignal::Event(event) => {
                    self.reconciler.apply_feed_event(event).await;
                }
                FeedSignal::Disconnected { .. } => {
                    self.cell.set(SubscriptionState::Retrying);
                }
                FeedSignal::Degraded { attempts, reason } => {
                    self.cell.set(SubscriptionState::Retrying);
                    if !poller.running() {
                        tracing::warn!(
                            key = %self.cell.key,
                            attempts = attempts,
                            reason = %reason,
                            interval_secs = self.poll_interval.as_secs(),
                            "Feed unavailable, polling store"
                        );
                        poller.0 = Some(self.spawn_poller());
                    }
                }
            }
        }
    }

    /// Refetch with backoff until it succeeds; the key stays untrusted meanwhile
    async fn refetch_until_done(&self) {
        let mut attempt: u32 = 0;
        loop {
            match refetch(self.store.as_ref(), &self.reconciler, &self.cell.key).await {
                Ok(_) => return,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        key = %self.cell.key,
                        attempt = attempt,
                        error = %e,
                        "Scope refetch failed"
                    );
                    tokio::time::sleep(self.feed_config.retry_delay(attempt)).await;
                }
            }
        }
    }

    fn spawn_poller(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let reconciler = self.reconciler.clone();
        let key = self.cell.key.clone();
        let period = self.poll_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = refetch(store.as_ref(), &reconciler, &key).await {
                    tracing::warn!(key = %key, error = %e, "Polling refetch failed");
                }
            }
        })
    }
}
