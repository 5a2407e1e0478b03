//! Rendezvous and relay node library

pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod relay;
pub mod rendezvous;
pub mod resilience;
pub mod store;
pub mod sync;

pub use config::NodeConfig;
pub use error::NodeError;
pub use lifecycle::{Node, Shutdown};
