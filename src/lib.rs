//! Camwatch Sync Library
//!
//! Real-time state synchronization for the camera monitoring dashboard
//!
//! ## Architecture (6 Components)
//!
//! 1. ChangeFeedClient - Push-channel subscriptions with reconnect
//! 2. EntityCache - Client-side copy of devices, notifications, jobs
//! 3. Reconciler - Single write path merging REST, feed and optimistic writes
//! 4. DetectionToggleController - Optimistic detection toggles
//! 5. JobTracker - Video upload and analysis job status
//! 6. SubscriptionManager - View-driven subscription lifecycle
//!
//! Supporting adapters: store (authoritative CRUD), detector_client,
//! blob_storage, device_registry, realtime_hub, web_api.
//!
//! ## Design Principles
//!
//! - The authoritative store is the single source of truth
//! - Every cache write goes through the Reconciler
//! - Every (re)connect is followed by a scope refetch

pub mod blob_storage;
pub mod change_feed;
pub mod detection_toggle;
pub mod detector_client;
pub mod device_registry;
pub mod entity_cache;
pub mod error;
pub mod job_tracker;
pub mod models;
pub mod realtime_hub;
pub mod reconciler;
pub mod session;
pub mod state;
pub mod store;
pub mod subscription_manager;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
