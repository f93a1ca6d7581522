//! Postgres LISTEN/NOTIFY push channel
//!
//! Each table has a trigger (see `migrations/`) that emits
//! `pg_notify('<table>_changes', json_build_object('table', .., 'op', .., 'row', ..))`.
//! The channel carries every row of the table; scope filtering happens in
//! the ChangeFeedClient. One listener serves every subscription.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::transport::{FeedConnection, FeedConnectionBox, FeedTransport};
use super::types::{ChangeEvent, Operation, SubscriptionKey};
use crate::error::{Error, Result};
use crate::models::{AnalysisJob, Device, EntityRecord, EntityType, Notification};

/// NOTIFY channel for an entity type
pub fn channel_name(entity_type: EntityType) -> String {
    format!("{}_changes", entity_type.table_name())
}

/// Trigger payload
#[derive(Debug, Deserialize)]
pub struct FeedWireMessage {
    pub table: String,
    pub op: String,
    pub row: serde_json::Value,
}

impl FeedWireMessage {
    pub fn into_event(self) -> Result<ChangeEvent> {
        let entity_type = EntityType::from_table(&self.table)
            .ok_or_else(|| Error::Validation(format!("unknown table: {}", self.table)))?;
        let operation = Operation::parse(&self.op)
            .ok_or_else(|| Error::Validation(format!("unknown operation: {}", self.op)))?;

        let payload = match entity_type {
            EntityType::Device => EntityRecord::Device(serde_json::from_value::<Device>(self.row)?),
            EntityType::Notification => {
                EntityRecord::Notification(serde_json::from_value::<Notification>(self.row)?)
            }
            EntityType::AnalysisJob => {
                EntityRecord::AnalysisJob(serde_json::from_value::<AnalysisJob>(self.row)?)
            }
        };

        Ok(ChangeEvent::new(operation, payload))
    }
}

/// Broadcast capacity of the shared listener
const SHARED_FEED_CAPACITY: usize = 1024;

/// FeedTransport over one process-wide sqlx PgListener
///
/// The listener owns a dedicated connection outside the store pool and
/// LISTENs on every table channel. Subscriptions attach to it; when it
/// dies every attached connection ends and the next connect opens a new one.
pub struct PgFeedTransport {
    database_url: String,
    shared: tokio::sync::Mutex<Option<SharedFeed>>,
}

impl PgFeedTransport {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            shared: tokio::sync::Mutex::new(None),
        }
    }

    async fn open_listener(&self) -> Result<SharedFeed> {
        let mut listener = PgListener::connect(&self.database_url)
            .await
            .map_err(|e| Error::TransportLost(format!("listener connect failed: {}", e)))?;

        let channels: Vec<String> = EntityType::ALL.iter().map(|t| channel_name(*t)).collect();
        listener
            .listen_all(channels.iter().map(String::as_str))
            .await
            .map_err(|e| Error::TransportLost(format!("LISTEN failed: {}", e)))?;

        tracing::info!(channels = ?channels, "Postgres listener attached");

        // try_recv surfaces a dropped connection instead of silently
        // reconnecting; reconnect policy belongs to the client.
        let payloads = stream::unfold(listener, |mut listener| async move {
            match listener.try_recv().await {
                Ok(Some(notification)) => Some((notification.payload().to_string(), listener)),
                Ok(None) => {
                    tracing::warn!("Postgres listener lost its connection");
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Postgres listener failed");
                    None
                }
            }
        });

        Ok(SharedFeed::fan_out(payloads, SHARED_FEED_CAPACITY))
    }
}

#[async_trait]
impl FeedTransport for PgFeedTransport {
    async fn connect(&self, key: &SubscriptionKey) -> Result<FeedConnectionBox> {
        let mut shared = self.shared.lock().await;
        let feed = match shared.take() {
            Some(feed) if feed.is_alive() => feed,
            _ => self.open_listener().await?,
        };
        let connection = feed.attach();
        *shared = Some(feed);

        tracing::debug!(key = %key, "Subscription attached to Postgres listener");
        Ok(Box::new(connection))
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

/// One upstream notification stream fanned out to every subscription
struct SharedFeed {
    /// Template for new receivers; the pump task holds the only sender
    receiver: broadcast::Receiver<ChangeEvent>,
    task: JoinHandle<()>,
}

impl SharedFeed {
    fn fan_out<S>(payloads: S, capacity: usize) -> Self
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        let task = tokio::spawn(async move {
            let mut payloads = Box::pin(payloads);
            while let Some(payload) = payloads.next().await {
                match decode(&payload) {
                    Ok(event) => {
                        let _ = sender.send(event);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping malformed change notification");
                    }
                }
            }
        });
        Self { receiver, task }
    }

    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    fn attach(&self) -> PgFeedConnection {
        PgFeedConnection {
            events: self.receiver.resubscribe(),
        }
    }
}

impl Drop for SharedFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn decode(payload: &str) -> Result<ChangeEvent> {
    serde_json::from_str::<FeedWireMessage>(payload)
        .map_err(Error::from)
        .and_then(FeedWireMessage::into_event)
}

struct PgFeedConnection {
    events: broadcast::Receiver<ChangeEvent>,
}

#[async_trait]
impl FeedConnection for PgFeedConnection {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        match self.events.recv().await {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(Error::TransportLost(
                format!("listener lagged by {} notifications", skipped),
            )),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
        }
    }
}
