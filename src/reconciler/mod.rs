//! Reconciler - Single Write Path into the EntityCache
//!
//! ## Responsibilities
//!
//! - Serialize every write to one entity id behind a per-entity async lock
//! - Merge REST results, feed events and optimistic writes
//! - Publish each cache mutation as a `CacheChange`
//!
//! ## Merge rules
//!
//! 1. A provisional (optimistic) value is replaced by the next confirmed
//!    write regardless of timestamps.
//! 2. A confirmed write identical to the cached value is a duplicate.
//! 3. Notifications are append-only: a differing write to a cached one is
//!    ignored.
//! 4. Job rows follow the job admission rule (no regression, `completed`
//!    is terminal).
//! 5. Otherwise the incoming row wins unless its revision timestamp is older.
//! 6. Deletes remove only the named entity and leave a tombstone so late
//!    feed upserts cannot resurrect it. Tombstones are capped; the oldest
//!    is evicted first.
//! 7. A refetch only removes rows last written before its fetch began and
//!    never leaves tombstones.

mod types;

pub use types::*;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, OwnedMutexGuard};

use crate::change_feed::{ChangeEvent, Operation, SubscriptionKey};
use crate::entity_cache::{EntityCache, Provenance};
use crate::job_tracker::state::{admit, Admission};
use crate::models::{EntityRecord, EntityType};

type EntityKey = (EntityType, String);
type LockMap = HashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>;

/// Broadcast capacity for cache changes
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Deleted entities remembered for late feed upserts
const TOMBSTONE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    /// Revision at which the entity was deleted
    deleted_at: DateTime<Utc>,
    /// Cache write stamp of the delete
    stamp: u64,
}

/// Reconciler
pub struct Reconciler {
    cache: Arc<EntityCache>,
    locks: Mutex<LockMap>,
    tombstones: Mutex<HashMap<EntityKey, Tombstone>>,
    tombstone_capacity: usize,
    versions: AtomicU64,
    changes: broadcast::Sender<CacheChange>,
}

impl Reconciler {
    pub fn new(cache: Arc<EntityCache>) -> Self {
        Self::with_tombstone_capacity(cache, TOMBSTONE_CAPACITY)
    }

    pub fn with_tombstone_capacity(cache: Arc<EntityCache>, tombstone_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            cache,
            locks: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashMap::new()),
            tombstone_capacity: tombstone_capacity.max(1),
            versions: AtomicU64::new(0),
            changes,
        }
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// Receive every cache mutation from now on
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }

    /// Take before fetching a scope snapshot; pass to `replace_scope`
    pub fn refetch_mark(&self) -> RefetchMark {
        RefetchMark(self.cache.write_mark())
    }

    /// Entities with a live or waiting writer
    pub fn locked_entities(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    // ========================================
    // Inputs
    // ========================================

    /// Merge the row returned by a REST mutation
    pub async fn apply_rest_result(&self, record: EntityRecord) -> MergeOutcome {
        self.apply_confirmed(record, MergeSource::Rest).await
    }

    /// Remove an entity after a successful REST delete
    pub async fn apply_rest_delete(&self, entity_type: EntityType, id: &str) -> MergeOutcome {
        self.remove_entity(entity_type, id, None, MergeSource::Rest).await
    }

    /// Merge a change feed event
    pub async fn apply_feed_event(&self, event: ChangeEvent) -> MergeOutcome {
        match event.operation {
            Operation::Insert | Operation::Update => {
                self.apply_confirmed(event.payload, MergeSource::Feed).await
            }
            Operation::Delete => {
                let revision = event.payload.revision_at();
                self.remove_entity(
                    event.entity_type,
                    event.payload.id(),
                    Some(revision),
                    MergeSource::Feed,
                )
                .await
            }
        }
    }

    /// Apply a provisional write; returns its version for rollback
    pub async fn apply_optimistic(&self, record: EntityRecord) -> u64 {
        let entity_type = record.entity_type();
        let id = record.id().to_string();
        let _guard = self.lock_entity(entity_type, &id).await;

        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;

        // Stacked optimistic writes keep the original confirmed value as prior
        let prior = self.cache.get(entity_type, &id).and_then(|entry| match entry.provenance {
            Provenance::Provisional { prior, .. } => prior,
            Provenance::Confirmed => Some(Box::new(entry)),
        });

        self.cache.upsert(
            record.clone(),
            Provenance::Provisional { version, prior },
        );
        self.publish(CacheChange::upserted(record, true));

        tracing::debug!(
            entity_type = %entity_type,
            entity_id = %id,
            version = version,
            "Optimistic write applied"
        );

        version
    }

    /// Undo an optimistic write if it is still the cached value
    ///
    /// Returns false when a confirmed write already superseded it.
    pub async fn rollback_optimistic(&self, entity_type: EntityType, id: &str, version: u64) -> bool {
        let _guard = self.lock_entity(entity_type, id).await;

        let Some(entry) = self.cache.get(entity_type, id) else {
            return false;
        };
        if entry.provisional_version() != Some(version) {
            return false;
        }

        match entry.provenance {
            Provenance::Provisional {
                prior: Some(prior), ..
            } => {
                let record = prior.record.clone();
                self.cache.restore(*prior);
                self.publish(CacheChange::upserted(record, false));
            }
            _ => {
                self.cache.remove(entity_type, id);
                self.publish(CacheChange::removed(entry.record));
            }
        }

        tracing::info!(
            entity_type = %entity_type,
            entity_id = %id,
            version = version,
            "Optimistic write rolled back"
        );
        true
    }

    /// Merge an authoritative snapshot of everything visible under `key`
    ///
    /// Every row is merged as a confirmed write. Cached rows in the scope
    /// that the snapshot no longer contains are removed, unless they were
    /// written after `mark`. Rows deleted after `mark` are not restored.
    pub async fn replace_scope(
        &self,
        key: &SubscriptionKey,
        rows: Vec<EntityRecord>,
        mark: RefetchMark,
    ) -> RefetchSummary {
        let mut summary = RefetchSummary::default();
        let mut present: HashSet<String> = HashSet::with_capacity(rows.len());

        for row in rows {
            if !key.covers(&row) {
                continue;
            }
            present.insert(row.id().to_string());
            match self.apply_confirmed(row, MergeSource::Refetch(mark)).await {
                MergeOutcome::Applied => summary.applied += 1,
                _ => summary.unchanged += 1,
            }
        }

        let missing = self.cache.ids_written_by(key.entity_type, mark.0, |r| {
            key.filter.matches(r) && !present.contains(r.id())
        });
        for id in missing {
            if self
                .remove_entity(key.entity_type, &id, None, MergeSource::Refetch(mark))
                .await
                .is_applied()
            {
                summary.removed += 1;
            }
        }

        tracing::info!(
            key = %key,
            applied = summary.applied,
            unchanged = summary.unchanged,
            removed = summary.removed,
            "Scope refetch merged"
        );

        summary
    }

    // ========================================
    // Merge core
    // ========================================

    async fn apply_confirmed(&self, record: EntityRecord, source: MergeSource) -> MergeOutcome {
        let entity_type = record.entity_type();
        let id = record.id().to_string();
        let _guard = self.lock_entity(entity_type, &id).await;

        if let Some(stone) = self.tombstone(entity_type, &id) {
            let deleted = match source {
                MergeSource::Feed => record.revision_at() <= stone.deleted_at,
                MergeSource::Refetch(mark) => stone.stamp > mark.0,
                MergeSource::Rest => false,
            };
            if deleted {
                tracing::warn!(
                    entity_type = %entity_type,
                    entity_id = %id,
                    source = source.as_str(),
                    "Dropping upsert for deleted entity"
                );
                return MergeOutcome::Stale;
            }
        }

        let outcome = match self.cache.get(entity_type, &id) {
            None => MergeOutcome::Applied,
            Some(entry) if entry.is_provisional() => MergeOutcome::Applied,
            Some(entry) => decide(&entry.record, &record),
        };

        match outcome {
            MergeOutcome::Applied => {
                self.clear_tombstone(entity_type, &id);
                self.cache.upsert(record.clone(), Provenance::Confirmed);
                self.publish(CacheChange::upserted(record, false));
                tracing::debug!(
                    entity_type = %entity_type,
                    entity_id = %id,
                    source = source.as_str(),
                    "Confirmed write applied"
                );
            }
            MergeOutcome::Duplicate => {
                tracing::debug!(
                    entity_type = %entity_type,
                    entity_id = %id,
                    source = source.as_str(),
                    "Duplicate write dropped"
                );
            }
            MergeOutcome::Stale => {
                tracing::warn!(
                    entity_type = %entity_type,
                    entity_id = %id,
                    source = source.as_str(),
                    "Stale write dropped"
                );
            }
            MergeOutcome::Ignored => {
                tracing::debug!(
                    entity_type = %entity_type,
                    entity_id = %id,
                    source = source.as_str(),
                    "Write to immutable entity ignored"
                );
            }
        }

        outcome
    }

    async fn remove_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        revision: Option<DateTime<Utc>>,
        source: MergeSource,
    ) -> MergeOutcome {
        let _guard = self.lock_entity(entity_type, id).await;

        // A refetch may race a re-insert, so it leaves no tombstone
        let removed = if let MergeSource::Refetch(mark) = source {
            match self.cache.get(entity_type, id) {
                Some(entry) if entry.written() <= mark.0 => self.cache.remove(entity_type, id),
                _ => None,
            }
        } else {
            let removed = self.cache.remove(entity_type, id);
            let deleted_at = match (&removed, revision) {
                (Some(entry), Some(at)) => Some(entry.record.revision_at().max(at)),
                (Some(entry), None) => Some(entry.record.revision_at()),
                (None, at) => at,
            };
            if let Some(at) = deleted_at {
                self.set_tombstone(entity_type, id, at);
            }
            removed
        };

        match removed {
            Some(entry) => {
                self.publish(CacheChange::removed(entry.record));
                tracing::debug!(
                    entity_type = %entity_type,
                    entity_id = %id,
                    source = source.as_str(),
                    "Entity removed"
                );
                MergeOutcome::Applied
            }
            None => MergeOutcome::Duplicate,
        }
    }

    // ========================================
    // Helpers
    // ========================================

    async fn lock_entity(&self, entity_type: EntityType, id: &str) -> EntityGuard<'_> {
        let key = (entity_type, id.to_string());
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        EntityGuard {
            locks: &self.locks,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    fn tombstone(&self, entity_type: EntityType, id: &str) -> Option<Tombstone> {
        self.tombstones
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(entity_type, id.to_string()))
            .copied()
    }

    fn set_tombstone(&self, entity_type: EntityType, id: &str, at: DateTime<Utc>) {
        let stamp = self.cache.reserve_stamp();
        let mut tombstones = self.tombstones.lock().unwrap_or_else(|p| p.into_inner());
        let slot = tombstones
            .entry((entity_type, id.to_string()))
            .or_insert(Tombstone { deleted_at: at, stamp });
        slot.deleted_at = slot.deleted_at.max(at);
        slot.stamp = stamp;

        while tombstones.len() > self.tombstone_capacity {
            let oldest = tombstones
                .iter()
                .min_by_key(|(_, stone)| stone.stamp)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    tombstones.remove(&key);
                }
                None => break,
            }
        }
    }

    fn clear_tombstone(&self, entity_type: EntityType, id: &str) {
        self.tombstones
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(entity_type, id.to_string()));
    }

    fn publish(&self, change: CacheChange) {
        // No receivers is fine
        let _ = self.changes.send(change);
    }
}

/// Holds one entity's lock; removes the map entry when no other writer
/// holds or waits for it
struct EntityGuard<'a> {
    locks: &'a Mutex<LockMap>,
    key: EntityKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Decide a confirmed write against a confirmed cached value
fn decide(current: &EntityRecord, incoming: &EntityRecord) -> MergeOutcome {
    if current == incoming {
        return MergeOutcome::Duplicate;
    }

    if current.as_notification().is_some() {
        return MergeOutcome::Ignored;
    }

    if let (Some(cur), Some(inc)) = (current.as_job(), incoming.as_job()) {
        match admit(cur, inc) {
            Admission::Terminal => return MergeOutcome::Ignored,
            Admission::Regression => return MergeOutcome::Stale,
            Admission::Advance => return MergeOutcome::Applied,
            Admission::Same => {}
        }
    }

    if incoming.revision_at() < current.revision_at() {
        MergeOutcome::Stale
    } else {
        MergeOutcome::Applied
    }
}
