//! Subscription lifecycle types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::change_feed::SubscriptionKey;
use crate::models::EntityType;
use crate::session::SessionContext;

/// Lifecycle state of one subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Idle,
    Opening,
    /// Connected and refetched; cache trusted for this scope
    Live,
    /// Transport down or not yet established; cache may be stale
    Retrying,
    Closing,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Opening => "opening",
            Self::Live => "live",
            Self::Retrying => "retrying",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Published on every state transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub key: SubscriptionKey,
    pub state: SubscriptionState,
}

/// Diagnostic row for one subscription
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionInfo {
    pub key: SubscriptionKey,
    pub ref_count: usize,
    pub state: SubscriptionState,
}

/// Dashboard view that depends on live data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewKind {
    DeviceList,
    DeviceDetail { device_id: String },
    NotificationList,
    JobList,
}

impl ViewKind {
    /// Subscription keys the view needs for the session user
    pub fn keys(&self, ctx: &SessionContext) -> Vec<SubscriptionKey> {
        let user_id = ctx.user_id.as_str();
        match self {
            Self::DeviceList => vec![SubscriptionKey::owned_by(EntityType::Device, user_id)],
            Self::DeviceDetail { device_id } => vec![
                SubscriptionKey::owned_by(EntityType::Device, user_id),
                SubscriptionKey::for_device(EntityType::Notification, device_id.as_str()),
            ],
            Self::NotificationList => {
                vec![SubscriptionKey::owned_by(EntityType::Notification, user_id)]
            }
            Self::JobList => vec![SubscriptionKey::owned_by(EntityType::AnalysisJob, user_id)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_wire_format() {
        let view: ViewKind =
            serde_json::from_str(r#"{"kind":"device_detail","device_id":"d1"}"#).unwrap();
        assert_eq!(
            view,
            ViewKind::DeviceDetail {
                device_id: "d1".to_string()
            }
        );

        let keys = view.keys(&SessionContext::new("u1"));
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1].to_string(), "notification:device=d1");
    }
}
