//! EntityCache - In-Memory Last-Known State
//!
//! ## Responsibilities
//!
//! - Map (entity type, id) to the last-known row
//! - Tag each row as confirmed or provisional (optimistic)
//! - Ordered listing: newest natural timestamp first, insertion order on ties
//! - Stamp every write so a refetch can tell rows written after it began
//!
//! Purely synchronous. Only the Reconciler writes to it.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::{AnalysisJob, Device, EntityRecord, EntityType, Notification};

/// Where a cached value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// Written by a REST result, feed event or refetch
    Confirmed,
    /// Optimistic local write awaiting confirmation
    Provisional {
        version: u64,
        /// Value to restore on rollback
        prior: Option<Box<CacheEntry>>,
    },
}

/// One cached row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub record: EntityRecord,
    pub provenance: Provenance,
    seq: u64,
    written: u64,
}

impl CacheEntry {
    pub fn is_provisional(&self) -> bool {
        matches!(self.provenance, Provenance::Provisional { .. })
    }

    /// Last confirmed value: the row itself, or the value an optimistic
    /// write replaced
    pub fn confirmed(&self) -> Option<&EntityRecord> {
        match &self.provenance {
            Provenance::Confirmed => Some(&self.record),
            Provenance::Provisional { prior, .. } => prior.as_ref().and_then(|p| p.confirmed()),
        }
    }

    /// Version of the optimistic write, if provisional
    pub fn provisional_version(&self) -> Option<u64> {
        match self.provenance {
            Provenance::Provisional { version, .. } => Some(version),
            Provenance::Confirmed => None,
        }
    }

    /// Write stamp of the last upsert or restore
    pub fn written(&self) -> u64 {
        self.written
    }
}

type CacheKey = (EntityType, String);

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    next_seq: u64,
    stamp: u64,
}

/// Entity cache
#[derive(Default)]
pub struct EntityCache {
    inner: RwLock<CacheInner>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<CacheEntry> {
        self.read().entries.get(&(entity_type, id.to_string())).cloned()
    }

    pub fn contains(&self, entity_type: EntityType, id: &str) -> bool {
        self.read().entries.contains_key(&(entity_type, id.to_string()))
    }

    /// Stamp of the most recent write
    pub fn write_mark(&self) -> u64 {
        self.read().stamp
    }

    /// Take a fresh stamp for a write that leaves no entry (a delete)
    pub fn reserve_stamp(&self) -> u64 {
        let mut inner = self.write();
        inner.stamp += 1;
        inner.stamp
    }

    /// Insert or replace a row. A replaced row keeps its insertion slot.
    pub fn upsert(&self, record: EntityRecord, provenance: Provenance) {
        let mut inner = self.write();
        let key = (record.entity_type(), record.id().to_string());

        let seq = match inner.entries.get(&key) {
            Some(existing) => existing.seq,
            None => {
                inner.next_seq += 1;
                inner.next_seq
            }
        };

        inner.stamp += 1;
        let written = inner.stamp;
        inner.entries.insert(
            key,
            CacheEntry {
                record,
                provenance,
                seq,
                written,
            },
        );
    }

    /// Put back an entry as it was (rollback). Only the write stamp changes.
    pub fn restore(&self, mut entry: CacheEntry) {
        let mut inner = self.write();
        let key = (entry.record.entity_type(), entry.record.id().to_string());
        inner.stamp += 1;
        entry.written = inner.stamp;
        inner.entries.insert(key, entry);
    }

    pub fn remove(&self, entity_type: EntityType, id: &str) -> Option<CacheEntry> {
        self.write().entries.remove(&(entity_type, id.to_string()))
    }

    /// Rows of one type matching `predicate`, newest first
    pub fn list<F>(&self, entity_type: EntityType, predicate: F) -> Vec<EntityRecord>
    where
        F: Fn(&EntityRecord) -> bool,
    {
        let inner = self.read();
        let mut matched: Vec<&CacheEntry> = inner
            .entries
            .iter()
            .filter(|((ty, _), entry)| *ty == entity_type && predicate(&entry.record))
            .map(|(_, entry)| entry)
            .collect();

        matched.sort_by(|a, b| {
            b.record
                .natural_at()
                .cmp(&a.record.natural_at())
                .then(a.seq.cmp(&b.seq))
        });

        matched.into_iter().map(|e| e.record.clone()).collect()
    }

    /// Ids of one type matching `predicate` whose last write is not newer
    /// than `mark`, unordered
    pub fn ids_written_by<F>(&self, entity_type: EntityType, mark: u64, predicate: F) -> Vec<String>
    where
        F: Fn(&EntityRecord) -> bool,
    {
        self.read()
            .entries
            .iter()
            .filter(|((ty, _), entry)| {
                *ty == entity_type && entry.written <= mark && predicate(&entry.record)
            })
            .map(|((_, id), _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    // ========================================
    // Typed views
    // ========================================

    pub fn device(&self, id: &str) -> Option<Device> {
        self.get(EntityType::Device, id)
            .and_then(|e| e.record.as_device().cloned())
    }

    pub fn devices_owned_by(&self, user_id: &str) -> Vec<Device> {
        self.list(EntityType::Device, |r| r.owner_id() == user_id)
            .into_iter()
            .filter_map(|r| r.as_device().cloned())
            .collect()
    }

    pub fn notifications<F>(&self, predicate: F) -> Vec<Notification>
    where
        F: Fn(&Notification) -> bool,
    {
        self.list(EntityType::Notification, |r| {
            r.as_notification().map(&predicate).unwrap_or(false)
        })
        .into_iter()
        .filter_map(|r| r.as_notification().cloned())
        .collect()
    }

    pub fn job(&self, id: &str) -> Option<AnalysisJob> {
        self.get(EntityType::AnalysisJob, id)
            .and_then(|e| e.record.as_job().cloned())
    }

    pub fn jobs_owned_by(&self, user_id: &str) -> Vec<AnalysisJob> {
        self.list(EntityType::AnalysisJob, |r| r.owner_id() == user_id)
            .into_iter()
            .filter_map(|r| r.as_job().cloned())
            .collect()
    }
}
