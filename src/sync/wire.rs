//! Broker wire frames.
//!
//! One JSON object per WebSocket text message, tagged by `op`:
//!
//! ```text
//! client → broker   {"op":"auth","key":"…","origin":"…"}
//! broker → client   {"op":"ack"} | {"op":"error","reason":"…"}
//! client → broker   {"op":"subscribe","channel":"rendezvous/"}
//! client → broker   {"op":"publish","channel":"rendezvous/<ns>","payload":{…}}
//! broker → client   {"op":"message","channel":"rendezvous/<ns>","payload":{…}}
//! ```
//!
//! Subscriptions match by channel prefix.

use serde::{Deserialize, Serialize};

/// Prefix of every rendezvous channel.
pub const CHANNEL_PREFIX: &str = "rendezvous/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Auth { key: String, origin: String },
    Ack,
    Error { reason: String },
    Subscribe { channel: String },
    Publish { channel: String, payload: serde_json::Value },
    Message { channel: String, payload: serde_json::Value },
}

impl Frame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Channel carrying events for `namespace`.
pub fn channel_for(namespace: &str) -> String {
    format!("{CHANNEL_PREFIX}{namespace}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_tagging() {
        let text = Frame::Subscribe {
            channel: CHANNEL_PREFIX.into(),
        }
        .encode()
        .unwrap();
        assert_eq!(text, r#"{"op":"subscribe","channel":"rendezvous/"}"#);
        assert_eq!(Frame::decode(r#"{"op":"ack"}"#).unwrap(), Frame::Ack);
        assert!(Frame::decode(r#"{"op":"bogus"}"#).is_err());
    }

    #[test]
    fn test_channel_for() {
        assert_eq!(channel_for("chat"), "rendezvous/chat");
    }
}
