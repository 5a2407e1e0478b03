//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! command line ─┐
//! RDVP_* env ───┼→ cli (clap; flag file fills what neither set)
//! flag file ────┘     → loader.rs (plain or TOML flag file)
//!                     → NodeConfig (schema.rs)
//!                     → validation.rs (semantic checks)
//!                     → Node::build, then immutable
//! ```
//!
//! # Design Decisions
//! - Precedence is command line > environment > flag file > default
//! - Config is immutable once built; there is no live reload
//! - All fields have defaults to allow an empty command line
//! - Validation separates syntactic (clap, serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_flag_file, ConfigError};
pub use schema::{
    EmitterConfig, IdentityConfig, MetricsConfig, NetworkConfig, NodeConfig, RelayConfig,
    StoreConfig, SyncConfig, DEFAULT_LISTEN,
};
pub use validation::{validate_config, ValidationError};
