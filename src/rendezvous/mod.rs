//! Rendezvous: peers register under namespaces and discover each other.
//!
//! # Data Flow
//! ```text
//! register   → validate → store.upsert → publish_upsert (every publisher)
//! unregister → validate → store.remove → publish_remove
//! discover   → store.query (cursor paging)
//! sync_info  → endpoints advertised by the drivers
//!
//! driver event → store.merge | store.remove_if_not_fresher
//! ```
//!
//! # Design Decisions
//! - Publishing happens after the store call returns, never under its lock
//! - Replicated events are applied to the store only, never republished

pub mod protocol;
pub mod service;

use std::time::Duration;

pub use protocol::{RendezvousRequest, RendezvousResponse, Status, PROTOCOL};
pub use service::RendezvousService;

use crate::store::StoreError;

/// Longest namespace accepted, in bytes.
pub const MAX_NAMESPACE_LEN: usize = 255;

pub const DEFAULT_DISCOVER_LIMIT: usize = 100;
pub const MAX_DISCOVER_LIMIT: usize = 1000;

/// Error type for rendezvous operations.
#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("namespace must be 1 to {MAX_NAMESPACE_LEN} bytes, got {0}")]
    InvalidNamespace(usize),
    #[error("invalid peer id {0}")]
    InvalidPeer(String),
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("ttl {0:?} outside the accepted range")]
    InvalidTtl(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RendezvousError {
    /// Status reported to the client.
    pub fn status(&self) -> Status {
        match self {
            RendezvousError::InvalidNamespace(_) => Status::InvalidNamespace,
            RendezvousError::InvalidPeer(_) => Status::InvalidPeer,
            RendezvousError::InvalidAddress(_) => Status::InvalidAddress,
            RendezvousError::InvalidTtl(_) => Status::InvalidTtl,
            RendezvousError::Store(StoreError::Closed) => Status::Unavailable,
            RendezvousError::Store(_) => Status::Internal,
        }
    }
}
