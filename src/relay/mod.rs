//! Circuit relay for peers that cannot reach each other directly.
//!
//! # Data Flow
//! ```text
//! target ── reserve ──→ relay (control stream stays open)
//! initiator ── connect(target) ──→ relay
//!     → relay sends incoming{circuit} on the target's control stream
//!     → target opens a new stream: accept{circuit}
//!     → relay answers connected{circuit} on both streams
//!     → raw bytes spliced in both directions
//! ```
//!
//! # Design Decisions
//! - Limits default to unlimited; each bound is opt-in
//! - Exceeding a bound ends or rejects only the circuit concerned

pub mod circuit;
pub mod client;
pub mod limits;
pub mod protocol;
pub mod service;

pub use limits::RelayLimits;
pub use protocol::{ErrorCode, PROTOCOL};
pub use service::RelayService;

use crate::net::StreamError;

/// Error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),
    #[error("relay refused: {code:?}: {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("unexpected reply from relay")]
    UnexpectedReply,
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
