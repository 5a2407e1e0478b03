//! Top-level error type.

use crate::config::ConfigError;
use crate::identity::KeyError;
use crate::lifecycle::SupervisorFailure;
use crate::net::{AddressParseError, HostError};
use crate::observability::LoggingError;
use crate::store::StoreError;
use crate::sync::SyncError;

/// Failure of a node or CLI command, naming the component involved.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("identity: {0}")]
    Key(#[from] KeyError),
    #[error("address: {0}")]
    Address(#[from] AddressParseError),
    #[error("host: {0}")]
    Host(#[from] HostError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("sync driver {driver}: {source}")]
    Driver {
        driver: String,
        #[source]
        source: SyncError,
    },
    #[error("logging: {0}")]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorFailure),
}
