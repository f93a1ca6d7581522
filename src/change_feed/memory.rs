//! In-process push channel
//!
//! Backs `STORE_BACKEND=memory` and the integration tests. Events published
//! while no connection is open are lost, same as the real channel.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use super::transport::{FeedConnection, FeedConnectionBox, FeedTransport};
use super::types::{ChangeEvent, SubscriptionKey};
use crate::error::{Error, Result};

/// In-memory FeedTransport
pub struct MemoryFeedTransport {
    sender: broadcast::Sender<ChangeEvent>,
    /// Bumped to reset every open connection
    generation: watch::Sender<u64>,
    refusing: AtomicBool,
    flapping: AtomicBool,
    refuse_next: AtomicU32,
    connects: AtomicUsize,
    open: Arc<AtomicUsize>,
}

impl MemoryFeedTransport {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (generation, _) = watch::channel(0);
        Self {
            sender,
            generation,
            refusing: AtomicBool::new(false),
            flapping: AtomicBool::new(false),
            refuse_next: AtomicU32::new(0),
            connects: AtomicUsize::new(0),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publish an event to every open connection; returns receiver count
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Reset every open connection with a transport error
    pub fn drop_connections(&self) {
        self.generation.send_modify(|g| *g += 1);
        tracing::debug!("Memory feed connections reset");
    }

    /// Refuse all connects until cleared
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Accept connects but close each connection at once
    pub fn set_flapping(&self, flapping: bool) {
        self.flapping.store(flapping, Ordering::SeqCst);
    }

    /// Refuse the next `n` connect attempts
    pub fn refuse_next(&self, n: u32) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }

    /// Successful connects so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    fn should_refuse(&self) -> bool {
        if self.refusing.load(Ordering::SeqCst) {
            return true;
        }
        self.refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryFeedTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl FeedTransport for MemoryFeedTransport {
    async fn connect(&self, key: &SubscriptionKey) -> Result<FeedConnectionBox> {
        if self.should_refuse() {
            return Err(Error::TransportLost(format!(
                "memory feed refused connection for {}",
                key
            )));
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        self.open.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryConnection {
            events: self.sender.subscribe(),
            generation: self.generation.subscribe(),
            open: self.open.clone(),
            closing: self.flapping.load(Ordering::SeqCst),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryConnection {
    events: broadcast::Receiver<ChangeEvent>,
    generation: watch::Receiver<u64>,
    open: Arc<AtomicUsize>,
    closing: bool,
}

#[async_trait]
impl FeedConnection for MemoryConnection {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        if self.closing {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = self.generation.changed() => {
                Err(Error::TransportLost("connection reset".to_string()))
            }
            received = self.events.recv() => match received {
                Ok(event) => Ok(Some(event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Err(Error::TransportLost(
                    format!("receiver lagged by {} events", skipped),
                )),
                Err(broadcast::error::RecvError::Closed) => Ok(None),
            },
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}
