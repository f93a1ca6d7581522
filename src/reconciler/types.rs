//! Reconciler types

use serde::Serialize;

use crate::models::{EntityRecord, EntityType};

/// Result of merging one confirmed write into the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Cache changed
    Applied,
    /// Identical to what the cache holds (idempotent no-op)
    Duplicate,
    /// Older than what the cache holds, or a status regression
    Stale,
    /// Entity is immutable: a completed job or a notification
    Ignored,
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Which input produced a confirmed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// REST acknowledgment of a user action
    Rest,
    /// Change feed event
    Feed,
    /// Full refetch of a subscription scope fetched after the mark
    Refetch(RefetchMark),
}

impl MergeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Feed => "feed",
            Self::Refetch(_) => "refetch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Upserted,
    Removed,
}

/// Cache mutation published to observers (realtime hub, waiters)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheChange {
    pub change: ChangeKind,
    pub entity_type: EntityType,
    pub record: EntityRecord,
    /// True for optimistic writes
    pub provisional: bool,
}

impl CacheChange {
    pub fn upserted(record: EntityRecord, provisional: bool) -> Self {
        Self {
            change: ChangeKind::Upserted,
            entity_type: record.entity_type(),
            record,
            provisional,
        }
    }

    pub fn removed(record: EntityRecord) -> Self {
        Self {
            change: ChangeKind::Removed,
            entity_type: record.entity_type(),
            record,
            provisional: false,
        }
    }
}

/// Counts from a scope refetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefetchSummary {
    pub applied: usize,
    pub unchanged: usize,
    pub removed: usize,
}

/// Cache write position taken before a scope fetch starts
///
/// Rows written after the mark are newer than the fetched snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefetchMark(pub(crate) u64);
