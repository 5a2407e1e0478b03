//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Listen addresses (multiaddr list)
//!     → address.rs (parse, resolve ip + tcp)
//!     → listener.rs (bind, accept, connection limits)
//!     → connection.rs (lifecycle tracking)
//!     → bandwidth.rs (byte accounting per connection and peer)
//!     → host.rs (protocol negotiation, handler dispatch)
//!     → stream.rs (length-delimited JSON frames, raw splice)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - One protocol per connection; no multiplexing, no transport security

pub mod address;
pub mod bandwidth;
pub mod connection;
pub mod host;
pub mod listener;
pub mod stream;

pub use address::{parse_address_list, socket_addr, AddressParseError};
pub use bandwidth::BandwidthCounter;
pub use host::{Host, HostConfig, HostError, StreamHandler};
pub use stream::{RawStream, Stream, StreamError};
