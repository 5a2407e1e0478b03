//! Rendezvous protocol messages.
//!
//! One JSON request per frame, answered by one JSON response:
//!
//! ```text
//! {"type":"register","namespace":"chat","peer":"12D3…","addrs":["/ip4/…"],"ttl":7200}
//! {"type":"registered","ttl":7200}
//!
//! {"type":"discover","namespace":"chat","limit":10,"cursor":0}
//! {"type":"discovered","records":[…],"cursor":42}
//! ```
//!
//! Peers and addresses travel as strings and are validated by the service,
//! so a bad value gets a precise status instead of a generic parse error.

use serde::{Deserialize, Serialize};

use crate::store::RendezvousRecord;
use crate::sync::SyncEndpoint;

pub const PROTOCOL: &str = "/rdvp/rendezvous/1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RendezvousRequest {
    Register {
        namespace: String,
        peer: String,
        #[serde(default)]
        addrs: Vec<String>,
        /// Seconds; the default TTL applies when absent.
        #[serde(default)]
        ttl: Option<u64>,
    },
    Unregister {
        namespace: String,
        peer: String,
    },
    Discover {
        /// Empty matches every namespace.
        #[serde(default)]
        namespace: String,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        cursor: u64,
    },
    SyncInfo,
}

impl RendezvousRequest {
    /// Operation label used in logs and metrics.
    pub fn op(&self) -> &'static str {
        match self {
            RendezvousRequest::Register { .. } => "register",
            RendezvousRequest::Unregister { .. } => "unregister",
            RendezvousRequest::Discover { .. } => "discover",
            RendezvousRequest::SyncInfo => "sync_info",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RendezvousResponse {
    /// `ttl` is the lifetime granted, in seconds.
    Registered { ttl: u64 },
    Unregistered,
    Discovered {
        records: Vec<RendezvousRecord>,
        cursor: u64,
    },
    SyncInfo { endpoints: Vec<SyncEndpoint> },
    Error { status: Status, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    InvalidNamespace,
    InvalidPeer,
    InvalidAddress,
    InvalidTtl,
    Malformed,
    Internal,
    Unavailable,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::InvalidNamespace => "invalid_namespace",
            Status::InvalidPeer => "invalid_peer",
            Status::InvalidAddress => "invalid_address",
            Status::InvalidTtl => "invalid_ttl",
            Status::Malformed => "malformed",
            Status::Internal => "internal",
            Status::Unavailable => "unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_defaults() {
        let request: RendezvousRequest = serde_json::from_str(r#"{"type":"discover"}"#).unwrap();
        assert_eq!(
            request,
            RendezvousRequest::Discover {
                namespace: String::new(),
                limit: None,
                cursor: 0
            }
        );
        assert_eq!(request.op(), "discover");
    }

    #[test]
    fn test_error_shape() {
        let response = RendezvousResponse::Error {
            status: Status::InvalidTtl,
            message: "too long".into(),
        };
        let text = serde_json::to_string(&response).unwrap();
        assert_eq!(
            text,
            r#"{"type":"error","status":"invalid_ttl","message":"too long"}"#
        );
    }
}
