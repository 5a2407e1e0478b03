//! Registration records and the values that flow through the store.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Default registration lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Longest registration lifetime the store accepts.
pub const MAX_TTL: Duration = Duration::from_secs(72 * 60 * 60);

/// A peer registered under a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousRecord {
    pub namespace: String,
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
    /// Expiry, unix milliseconds.
    pub expires_at: u64,
    /// Insertion sequence; kept when the record is refreshed.
    #[serde(default)]
    pub seq: u64,
}

impl RendezvousRecord {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now_ms))
    }
}

/// A local registration request.
#[derive(Debug, Clone)]
pub struct Registration {
    pub namespace: String,
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub ttl: Duration,
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No live record existed for the key.
    Inserted,
    /// A live record was replaced; its sequence number was kept.
    Refreshed,
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub records: Vec<RendezvousRecord>,
    /// Pass back to continue after the last returned record.
    pub cursor: u64,
}

/// Current time in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
