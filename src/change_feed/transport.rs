//! Push channel transport seam

use async_trait::async_trait;

use super::types::{ChangeEvent, SubscriptionKey};
use crate::error::Result;

/// One open push-channel connection
#[async_trait]
pub trait FeedConnection: Send {
    /// Next event in delivery order.
    ///
    /// `Ok(None)` means the server closed the connection; `Err` is a
    /// transport failure. Both end the connection.
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>>;
}

pub type FeedConnectionBox = Box<dyn FeedConnection>;

/// Opens push-channel connections for a subscription key
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self, key: &SubscriptionKey) -> Result<FeedConnectionBox>;

    /// Transport name for logs
    fn name(&self) -> &'static str;
}
