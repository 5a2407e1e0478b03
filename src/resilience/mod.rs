//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to the broker (connect, publish):
//!     → retries.rs (bounded attempts, stop on cancellation)
//!     → backoff.rs (exponential delay + jitter between attempts)
//! ```
//!
//! # Design Decisions
//! - Every retry loop has a finite budget
//! - Exhaustion is surfaced to the caller, which decides to drop or fail

pub mod backoff;
pub mod retries;

pub use retries::{RetryError, RetryPolicy};
