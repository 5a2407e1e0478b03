//! Relay protocol messages.
//!
//! ```text
//! target    → relay   {"type":"reserve","peer":"<target>"}
//! relay     → target  {"type":"reserved"}
//! initiator → relay   {"type":"connect","peer":"<initiator>","target":"<target>"}
//! relay     → target  {"type":"incoming","circuit":"<uuid>","from":"<initiator>"}   (control stream)
//! target    → relay   {"type":"accept","circuit":"<uuid>"}                          (new stream)
//! relay     → both    {"type":"connected","circuit":"<uuid>"}
//! ...raw bytes in both directions...
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::PeerId;

pub const PROTOCOL: &str = "/rdvp/relay/1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayRequest {
    Reserve { peer: PeerId },
    Connect { peer: PeerId, target: PeerId },
    Accept { circuit: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayResponse {
    Reserved,
    Incoming { circuit: Uuid, from: PeerId },
    Connected { circuit: Uuid },
    Error { code: ErrorCode, message: String },
}

impl RelayResponse {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        RelayResponse::Error {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoReservation,
    ResourceLimitExceeded,
    UnknownCircuit,
    Timeout,
    Malformed,
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let circuit = Uuid::nil();
        let text = serde_json::to_string(&RelayRequest::Accept { circuit }).unwrap();
        assert_eq!(
            text,
            r#"{"type":"accept","circuit":"00000000-0000-0000-0000-000000000000"}"#
        );

        let err = RelayResponse::error(ErrorCode::NoReservation, "nobody home");
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains(r#""code":"no_reservation""#));
    }

    #[test]
    fn test_rejects_bad_peer_id() {
        let text = r#"{"type":"reserve","peer":"not-a-peer"}"#;
        assert!(serde_json::from_str::<RelayRequest>(text).is_err());
    }
}
