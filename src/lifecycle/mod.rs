//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → identity → host → store → drivers → services → exporter
//!
//! Run (supervisor.rs):
//!     signals, host, sweeper, sync drivers, relay, metrics run concurrently
//!     first exit (or Shutdown::trigger) → interrupt all → wait for all
//!
//! Teardown (startup.rs):
//!     relay.stop → driver.close → store.close, exactly once
//! ```
//!
//! # Design Decisions
//! - One cancellation source per process (shutdown.rs)
//! - The supervisor never force-kills; stragglers are logged and awaited
//! - Component states only move forward (state.rs)

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod state;
pub mod supervisor;

pub use shutdown::Shutdown;
pub use startup::Node;
pub use state::{LifecycleState, StateCell};
pub use supervisor::{Supervisor, SupervisorFailure};
