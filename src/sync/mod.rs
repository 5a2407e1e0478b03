//! Replication of registrations between nodes.
//!
//! # Data Flow
//! ```text
//! Local mutation (rendezvous service, after commit)
//!     → SyncDriver::publish_upsert / publish_remove   (every publish-capable driver)
//!     → driver queue → backend (broker)
//!
//! Backend message from another node
//!     → driver → EventHandler(SyncEvent)
//!     → rendezvous service → store.merge / store.remove_if_not_fresher
//! ```
//!
//! # Design Decisions
//! - Drivers are trait objects; the rendezvous service never special-cases
//!   a backend, and "no backend" is the no-op driver
//! - Conflicts resolve by last-write-wins on expiry
//! - Publishing never blocks on the network; drivers queue and may drop
//! - Events carry their origin so a driver ignores its own echoes

pub mod broker;
pub mod noop;
pub mod wire;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::store::RendezvousRecord;

pub use broker::{BrokerConfig, BrokerDriver};
pub use noop::NoopDriver;

/// Which directions a driver handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Publish,
    Subscribe,
    Both,
}

impl Capability {
    pub fn can_publish(self) -> bool {
        matches!(self, Capability::Publish | Capability::Both)
    }

    pub fn can_subscribe(self) -> bool {
        matches!(self, Capability::Subscribe | Capability::Both)
    }
}

/// Where clients can reach a driver's backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEndpoint {
    pub driver: String,
    pub url: String,
}

/// A replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    Upsert {
        origin: String,
        record: RendezvousRecord,
    },
    /// `record` holds the key and the expiry the removal is ordered by.
    Remove {
        origin: String,
        record: RendezvousRecord,
    },
}

impl SyncEvent {
    pub fn origin(&self) -> &str {
        match self {
            SyncEvent::Upsert { origin, .. } | SyncEvent::Remove { origin, .. } => origin,
        }
    }

    pub fn record(&self) -> &RendezvousRecord {
        match self {
            SyncEvent::Upsert { record, .. } | SyncEvent::Remove { record, .. } => record,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::Upsert { .. } => "upsert",
            SyncEvent::Remove { .. } => "remove",
        }
    }
}

/// Callback receiving events from other nodes.
pub type EventHandler = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Error type for sync drivers.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("cannot connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("invalid endpoint '{0}'")]
    Endpoint(String),
    #[error("driver is closed")]
    Closed,
    #[error("driver is already running")]
    AlreadyRunning,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A replication backend.
#[async_trait]
pub trait SyncDriver: Send + Sync {
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    /// Endpoint advertised to clients, if any.
    fn endpoint(&self) -> Option<SyncEndpoint> {
        None
    }

    /// Establish the backend session.
    async fn connect(&self) -> Result<(), SyncError>;

    /// Queue a local upsert for other nodes.
    async fn publish_upsert(&self, record: &RendezvousRecord) -> Result<(), SyncError>;

    /// Queue a local removal for other nodes.
    async fn publish_remove(&self, record: &RendezvousRecord) -> Result<(), SyncError>;

    /// Install the handler for events from other nodes.
    fn subscribe(&self, handler: EventHandler);

    /// Background I/O until `token` fires.
    async fn run(&self, token: CancellationToken) -> Result<(), SyncError>;

    /// Release the backend session. Safe whether or not `connect` succeeded.
    async fn close(&self);
}
