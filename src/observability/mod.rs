//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (logging.rs sets the sink)
//!     → metrics facade calls (metrics.rs names and records them)
//!
//! Consumers:
//!     → Log sink (stderr, stdout or file; json or human formats)
//!     → exporter.rs (Prometheus scrape on /metrics)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Metrics are cheap (atomic increments); scrape-time values are
//!   refreshed by collectors
//! - The exporter is optional; recording without it is a no-op

pub mod exporter;
pub mod logging;
pub mod metrics;

pub use exporter::{ExporterError, MetricsExporter};
pub use logging::{LogConfig, LogDestination, LogFormat, LoggingError};
