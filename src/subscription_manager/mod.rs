//! SubscriptionManager - View-Driven Subscription Lifecycle
//!
//! ## Responsibilities
//!
//! - Reference-count subscription keys across active views
//! - Open exactly one feed subscription per key; close it exactly once
//! - Refetch on every (re)connect before marking a key live
//! - Poll the store while the feed cannot be established
//!
//! ## State machine
//!
//! ```text
//! Idle -> Opening -> Live <-> Retrying -> Closing -> Idle
//! ```

mod pump;
mod types;

pub use types::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::change_feed::{ChangeFeedClient, SubscriptionId, SubscriptionKey};
use crate::reconciler::Reconciler;
use crate::session::SessionContext;
use crate::store::StoreClient;
use pump::{Pump, StateCell};

/// Default polling period while degraded
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

struct Entry {
    ref_count: usize,
    subscription_id: SubscriptionId,
    cell: Arc<StateCell>,
    pump: JoinHandle<()>,
}

/// Subscription lifecycle manager
pub struct SubscriptionManager {
    feed: Arc<ChangeFeedClient>,
    reconciler: Arc<Reconciler>,
    store: Arc<dyn StoreClient>,
    poll_interval: Duration,
    entries: Mutex<HashMap<SubscriptionKey, Entry>>,
    events: broadcast::Sender<StateChange>,
}

impl SubscriptionManager {
    pub fn new(
        feed: Arc<ChangeFeedClient>,
        reconciler: Arc<Reconciler>,
        store: Arc<dyn StoreClient>,
        poll_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            feed,
            reconciler,
            store,
            poll_interval,
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Receive every state transition from now on
    pub fn subscribe_states(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Add one reference to `key`, opening its subscription if needed
    ///
    /// Returns the new reference count.
    pub fn activate(&self, key: &SubscriptionKey) -> usize {
        let mut entries = self.entries();

        if let Some(entry) = entries.get_mut(key) {
            entry.ref_count += 1;
            tracing::debug!(key = %key, ref_count = entry.ref_count, "Subscription attached");
            return entry.ref_count;
        }

        let (tx, _) = watch::channel(SubscriptionState::Idle);
        let cell = Arc::new(StateCell {
            key: key.clone(),
            tx,
            events: self.events.clone(),
        });
        cell.set(SubscriptionState::Opening);

        let handle = self.feed.subscribe(key.clone());
        let subscription_id = handle.id();
        let pump = Pump {
            cell: cell.clone(),
            store: self.store.clone(),
            reconciler: self.reconciler.clone(),
            feed_config: self.feed.config().clone(),
            poll_interval: self.poll_interval,
        };
        let pump = tokio::spawn(pump.run(handle));

        entries.insert(
            key.clone(),
            Entry {
                ref_count: 1,
                subscription_id,
                cell,
                pump,
            },
        );
        1
    }

    /// Drop one reference to `key`, closing its subscription at zero
    ///
    /// Returns the remaining reference count.
    pub fn deactivate(&self, key: &SubscriptionKey) -> usize {
        let mut entries = self.entries();

        let Some(entry) = entries.get_mut(key) else {
            tracing::warn!(key = %key, "Deactivate for inactive subscription ignored");
            return 0;
        };

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            tracing::debug!(key = %key, ref_count = entry.ref_count, "Subscription detached");
            return entry.ref_count;
        }

        if let Some(entry) = entries.remove(key) {
            entry.cell.set(SubscriptionState::Closing);
            self.feed.unsubscribe_id(entry.subscription_id);
            entry.pump.abort();
            entry.cell.set(SubscriptionState::Idle);
        }
        0
    }

    /// Activate every key a view depends on
    pub fn activate_view(&self, ctx: &SessionContext, view: &ViewKind) -> Vec<SubscriptionKey> {
        let keys = view.keys(ctx);
        for key in &keys {
            self.activate(key);
        }
        keys
    }

    pub fn deactivate_view(&self, ctx: &SessionContext, view: &ViewKind) {
        for key in view.keys(ctx) {
            self.deactivate(&key);
        }
    }

    pub fn state(&self, key: &SubscriptionKey) -> SubscriptionState {
        self.entries()
            .get(key)
            .map(|e| *e.cell.tx.borrow())
            .unwrap_or(SubscriptionState::Idle)
    }

    pub fn ref_count(&self, key: &SubscriptionKey) -> usize {
        self.entries().get(key).map(|e| e.ref_count).unwrap_or(0)
    }

    /// State receiver for an active key
    pub fn watch_state(&self, key: &SubscriptionKey) -> Option<watch::Receiver<SubscriptionState>> {
        self.entries().get(key).map(|e| e.cell.tx.subscribe())
    }

    /// Keys currently held open
    pub fn active_count(&self) -> usize {
        self.entries().len()
    }

    /// (key, ref count, state) for every active key
    pub fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .entries()
            .iter()
            .map(|(key, entry)| SubscriptionInfo {
                key: key.clone(),
                ref_count: entry.ref_count,
                state: *entry.cell.tx.borrow(),
            })
            .collect();
        infos.sort_by_key(|info| info.key.to_string());
        infos
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        let mut entries = self.entries();
        for (_, entry) in entries.drain() {
            self.feed.unsubscribe_id(entry.subscription_id);
            entry.pump.abort();
        }
    }
}
