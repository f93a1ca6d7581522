//! Change feed types

use crate::models::{EntityRecord, EntityType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Row filter scoping a subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", content = "id", rename_all = "snake_case")]
pub enum ScopeFilter {
    /// Rows owned by a user
    Owner(String),
    /// Rows belonging to one device (the device row itself, or its notifications)
    Device(String),
}

impl ScopeFilter {
    pub fn matches(&self, record: &EntityRecord) -> bool {
        match self {
            Self::Owner(user_id) => record.owner_id() == user_id,
            Self::Device(device_id) => record.device_id() == Some(device_id.as_str()),
        }
    }
}

impl fmt::Display for ScopeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner(id) => write!(f, "owner={}", id),
            Self::Device(id) => write!(f, "device={}", id),
        }
    }
}

/// Logical subscription key: (entity type, scoping filter)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub entity_type: EntityType,
    pub filter: ScopeFilter,
}

impl SubscriptionKey {
    pub fn new(entity_type: EntityType, filter: ScopeFilter) -> Self {
        Self {
            entity_type,
            filter,
        }
    }

    pub fn owned_by(entity_type: EntityType, user_id: impl Into<String>) -> Self {
        Self::new(entity_type, ScopeFilter::Owner(user_id.into()))
    }

    pub fn for_device(entity_type: EntityType, device_id: impl Into<String>) -> Self {
        Self::new(entity_type, ScopeFilter::Device(device_id.into()))
    }

    /// Whether a cached row falls inside this key's scope
    pub fn covers(&self, record: &EntityRecord) -> bool {
        record.entity_type() == self.entity_type && self.filter.matches(record)
    }

    /// Whether a feed event belongs to this subscription
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.entity_type == self.entity_type && self.filter.matches(&event.payload)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.filter)
    }
}

/// Row-level operation reported by the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn parse(op: &str) -> Option<Self> {
        match op.to_ascii_lowercase().as_str() {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One change delivered by the push channel
///
/// For `Delete` the payload is the last row image, so scope filters still
/// apply to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_type: EntityType,
    pub operation: Operation,
    pub payload: EntityRecord,
}

impl ChangeEvent {
    pub fn new(operation: Operation, payload: impl Into<EntityRecord>) -> Self {
        let payload = payload.into();
        Self {
            entity_type: payload.entity_type(),
            operation,
            payload,
        }
    }

    pub fn insert(payload: impl Into<EntityRecord>) -> Self {
        Self::new(Operation::Insert, payload)
    }

    pub fn update(payload: impl Into<EntityRecord>) -> Self {
        Self::new(Operation::Update, payload)
    }

    pub fn delete(payload: impl Into<EntityRecord>) -> Self {
        Self::new(Operation::Delete, payload)
    }
}

/// Item produced by a subscription handle
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    /// Transport established; `resumed` is set after an earlier drop
    Connected { resumed: bool },
    /// Change event, in transport delivery order
    Event(ChangeEvent),
    /// Transport dropped; events until the next `Connected` are lost
    Disconnected { reason: String },
    /// The subscription could not be established; caller should poll
    Degraded { attempts: u32, reason: String },
}

/// Feed connection tuning
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Failed initial connects before `Degraded` is reported
    pub degraded_after: u32,
    /// Bounded queue between listener task and consumer
    pub queue_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            degraded_after: 3,
            queue_capacity: 256,
        }
    }
}

impl FeedConfig {
    /// Capped exponential backoff for the given failed attempt count
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
