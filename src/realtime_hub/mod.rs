//! RealtimeHub - WebSocket Distribution
//!
//! ## Responsibilities
//!
//! - WebSocket connection registry (connection id, user id)
//! - Forward Reconciler cache changes to the owning user's connections
//! - Per-connection replies (view acks, subscription state)
//!
//! Only row changes travel over the socket; listings are fetched via HTTP.
//! When the hub falls behind the cache it drops changes and tells every
//! connection to reload its listings (`resync`).

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::change_feed::SubscriptionKey;
use crate::reconciler::{CacheChange, ChangeKind};
use crate::subscription_manager::{StateChange, SubscriptionState, ViewKind};

/// Hub message types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubMessage {
    /// A cached row changed
    EntityChanged(EntityChangedMessage),
    /// A subscription this connection depends on changed state
    SubscriptionState(SubscriptionStateMessage),
    /// Reply to an activate/deactivate request
    ViewAck(ViewAckMessage),
    /// Changes were dropped; reload listings over HTTP
    Resync(ResyncMessage),
    /// Rejected client message
    Error(ErrorMessage),
}

impl HubMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::EntityChanged(_) => "entity_changed",
            Self::SubscriptionState(_) => "subscription_state",
            Self::ViewAck(_) => "view_ack",
            Self::Resync(_) => "resync",
            Self::Error(_) => "error",
        }
    }
}

/// Cache change as sent to clients
#[derive(Debug, Clone, Serialize)]
pub struct EntityChangedMessage {
    pub change: ChangeKind,
    pub entity_type: crate::models::EntityType,
    pub entity_id: String,
    pub record: serde_json::Value,
    pub provisional: bool,
}

impl From<&CacheChange> for EntityChangedMessage {
    fn from(change: &CacheChange) -> Self {
        let record = match &change.record {
            crate::models::EntityRecord::Device(d) => serde_json::to_value(d),
            crate::models::EntityRecord::Notification(n) => serde_json::to_value(n),
            crate::models::EntityRecord::AnalysisJob(j) => serde_json::to_value(j),
        }
        .unwrap_or(serde_json::Value::Null);

        Self {
            change: change.change,
            entity_type: change.entity_type,
            entity_id: change.record.id().to_string(),
            record,
            provisional: change.provisional,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStateMessage {
    pub key: SubscriptionKey,
    pub state: SubscriptionState,
}

impl From<StateChange> for SubscriptionStateMessage {
    fn from(change: StateChange) -> Self {
        Self {
            key: change.key,
            state: change.state,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewAckMessage {
    pub action: String,
    pub view: ViewKind,
    pub keys: Vec<SubscriptionKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResyncMessage {
    /// Cache changes the hub missed
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    pub message: String,
}

/// Client connection
struct ClientConnection {
    id: Uuid,
    user_id: String,
    tx: mpsc::UnboundedSender<String>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
}

impl RealtimeHub {
    /// Create new RealtimeHub
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
        }
    }

    /// Register a new client
    pub async fn register(&self, user_id: String) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections.insert(
                id,
                ClientConnection {
                    id,
                    user_id: user_id.clone(),
                    tx,
                },
            );
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection_id = %id, user_id = %user_id, "Client connected");

        (id, rx)
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, "Client disconnected");
        }
    }

    fn encode(message: &HubMessage) -> Option<String> {
        match serde_json::to_string(message) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                None
            }
        }
    }

    /// Send message to every connection of a user
    pub async fn send_to_user(&self, user_id: &str, message: HubMessage) -> usize {
        let Some(json) = Self::encode(&message) else {
            return 0;
        };

        let connections = self.connections.read().await;
        let mut delivered = 0;
        for conn in connections.values().filter(|c| c.user_id == user_id) {
            match conn.tx.send(json.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(connection_id = %conn.id, error = %e, "Failed to send message")
                }
            }
        }
        tracing::debug!(
            message_type = message.type_name(),
            user_id = %user_id,
            delivered = delivered,
            "Message sent to user"
        );
        delivered
    }

    /// Send message to every connection
    pub async fn broadcast(&self, message: HubMessage) -> usize {
        let Some(json) = Self::encode(&message) else {
            return 0;
        };
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|conn| conn.tx.send(json.clone()).is_ok())
            .count()
    }

    /// Send message to one connection
    pub async fn send_to_connection(&self, id: &Uuid, message: HubMessage) -> bool {
        let Some(json) = Self::encode(&message) else {
            return false;
        };
        let connections = self.connections.read().await;
        connections
            .get(id)
            .map(|conn| conn.tx.send(json).is_ok())
            .unwrap_or(false)
    }

    /// Forward cache changes to their owners until the channel closes
    pub fn forward_changes(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<CacheChange>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let owner = change.record.owner_id().to_string();
                        let message = HubMessage::EntityChanged(EntityChangedMessage::from(&change));
                        self.send_to_user(&owner, message).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // The owners of the lost changes are unknown
                        let notified = self
                            .broadcast(HubMessage::Resync(ResyncMessage { skipped }))
                            .await;
                        tracing::warn!(
                            skipped = skipped,
                            notified = notified,
                            "Hub lagged behind cache changes, clients told to resync"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Get connection count
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_cache::EntityCache;
    use crate::models::Notification;
    use crate::reconciler::Reconciler;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_changes_reach_only_the_owner() {
        let hub = Arc::new(RealtimeHub::new());
        let reconciler = Reconciler::new(Arc::new(EntityCache::new()));
        let _forwarder = hub.clone().forward_changes(reconciler.subscribe_changes());

        let (_, mut owner_rx) = hub.register("u1".to_string()).await;
        let (_, mut other_rx) = hub.register("u2".to_string()).await;
        assert_eq!(hub.connection_count(), 2);

        reconciler
            .apply_rest_result(
                Notification {
                    id: "n1".to_string(),
                    device_id: "d1".to_string(),
                    user_id: "u1".to_string(),
                    message: "Violence detected!".to_string(),
                    timestamp: Utc::now(),
                }
                .into(),
            )
            .await;

        let json = timeout(Duration::from_secs(2), owner_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "entity_changed");
        assert_eq!(value["data"]["entity_type"], "notification");
        assert_eq!(value["data"]["entity_id"], "n1");
        assert_eq!(value["data"]["change"], "upserted");

        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lagging_hub_asks_clients_to_resync() {
        let hub = Arc::new(RealtimeHub::new());
        let (_, mut owner_rx) = hub.register("u1".to_string()).await;
        let (_, mut other_rx) = hub.register("u2".to_string()).await;

        let (changes, rx) = broadcast::channel(2);
        for i in 0..5 {
            let record = Notification {
                id: format!("n{}", i),
                device_id: "d1".to_string(),
                user_id: "u1".to_string(),
                message: "Violence detected!".to_string(),
                timestamp: Utc::now(),
            };
            changes.send(CacheChange::upserted(record.into(), false)).unwrap();
        }
        let _forwarder = hub.clone().forward_changes(rx);

        for rx in [&mut owner_rx, &mut other_rx] {
            let json = timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let value: serde_json::Value = serde_json::from_str(&json).unwrap();
            assert_eq!(value["type"], "resync");
            assert_eq!(value["data"]["skipped"], 3);
        }

        // The changes still buffered are delivered after the hint
        for expected in ["n3", "n4"] {
            let json = timeout(Duration::from_secs(2), owner_rx.recv())
                .await
                .unwrap()
                .unwrap();
            let value: serde_json::Value = serde_json::from_str(&json).unwrap();
            assert_eq!(value["data"]["entity_id"], expected);
        }
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister() {
        let hub = RealtimeHub::new();
        let (id, _rx) = hub.register("u1".to_string()).await;
        hub.unregister(&id).await;
        hub.unregister(&id).await;
        assert_eq!(hub.connection_count(), 0);
        let message = HubMessage::Error(ErrorMessage {
            message: "gone".to_string(),
        });
        assert!(!hub.send_to_connection(&id, message).await);
    }
}
