//! Configuration schema definitions.
//!
//! `NodeConfig` is built once from the command line (plus environment and
//! flag file) and never changes afterwards. Every section has defaults so
//! `rdvp serve` with no flags is a working node.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::relay::RelayLimits;
use crate::resilience::RetryPolicy;

/// Listen addresses used when none are given.
pub const DEFAULT_LISTEN: &str = "/ip4/0.0.0.0/tcp/4040,/ip4/0.0.0.0/udp/4141/quic";

/// Root configuration for a node.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub identity: IdentityConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub relay: RelayConfig,
    pub metrics: MetricsConfig,
}

/// Host listeners and announced addresses.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Comma-separated multiaddrs to listen on.
    pub listen: String,

    /// Comma-separated multiaddrs announced instead of the bound ones.
    pub announce: String,

    /// Maximum concurrent connections per listener.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            announce: String::new(),
            max_connections: crate::net::host::DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Node key.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Base64 private key from `rdvp genkey`; absent means ephemeral.
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
}

impl fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Record store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `:memory:` or a path for the database file.
    pub location: String,

    /// Longest registration lifetime in seconds.
    pub max_ttl_secs: u64,

    /// Seconds between expired-record sweeps.
    pub sweep_interval_secs: u64,
}

impl StoreConfig {
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            location: crate::store::IN_MEMORY.to_string(),
            max_ttl_secs: crate::store::MAX_TTL.as_secs(),
            sweep_interval_secs: crate::store::sweeper::DEFAULT_SWEEP_INTERVAL.as_secs(),
        }
    }
}

/// Replication settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    pub emitter: EmitterConfig,
}

/// Broker connection.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Broker address, e.g. `tcp://127.0.0.1:8080`.
    pub server: Option<String>,

    #[serde(skip_serializing)]
    pub admin_key: Option<String>,

    /// Address handed to clients instead of `server`.
    pub public_addr: Option<String>,

    /// Refuse to start, and stop the node, when the broker is unreachable.
    pub mandatory: bool,

    /// Dial and handshake timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Events buffered while the broker is slow or away.
    pub queue_capacity: usize,

    /// Budget for reconnects and event delivery.
    pub retry: RetryPolicy,
}

impl EmitterConfig {
    /// The broker is used only when both the server and the key are set.
    pub fn is_enabled(&self) -> bool {
        self.server.as_deref().is_some_and(|s| !s.is_empty())
            && self.admin_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            server: None,
            admin_key: None,
            public_addr: None,
            mandatory: false,
            connect_timeout_secs: crate::sync::broker::DEFAULT_CONNECT_TIMEOUT.as_secs(),
            queue_capacity: crate::sync::broker::DEFAULT_QUEUE_CAPACITY,
            retry: RetryPolicy {
                max_attempts: 5,
                base_delay_ms: 500,
                max_delay_ms: 10_000,
            },
        }
    }
}

impl fmt::Debug for EmitterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmitterConfig")
            .field("server", &self.server)
            .field("admin_key", &self.admin_key.as_ref().map(|_| "<redacted>"))
            .field("public_addr", &self.public_addr)
            .field("mandatory", &self.mandatory)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("queue_capacity", &self.queue_capacity)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Relay limits; unset means unlimited.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub max_circuits: Option<usize>,

    /// Bytes per circuit, both directions combined.
    pub max_data_bytes: Option<u64>,

    /// Circuit lifetime in seconds.
    pub max_duration_secs: Option<u64>,
}

impl RelayConfig {
    pub fn limits(&self) -> RelayLimits {
        RelayLimits {
            max_circuits: self.max_circuits,
            max_data_per_circuit: self.max_data_bytes,
            max_duration: self.max_duration_secs.map(Duration::from_secs),
        }
    }
}

/// Prometheus endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// `host:port` to serve `/metrics` on; disabled when unset.
    pub listen: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.network.listen, DEFAULT_LISTEN);
        assert_eq!(config.store.location, ":memory:");
        assert_eq!(config.store.max_ttl(), Duration::from_secs(72 * 3600));
        assert!(!config.sync.emitter.is_enabled());
        assert!(config.relay.limits().is_unlimited());
        assert!(config.metrics.listen.is_none());
    }

    #[test]
    fn test_emitter_needs_server_and_key() {
        let mut emitter = EmitterConfig {
            server: Some("tcp://127.0.0.1:8080".into()),
            ..Default::default()
        };
        assert!(!emitter.is_enabled());
        emitter.admin_key = Some("secret".into());
        assert!(emitter.is_enabled());
        assert!(!format!("{emitter:?}").contains("secret"));
    }

    #[test]
    fn test_relay_limits_conversion() {
        let relay = RelayConfig {
            max_circuits: Some(4),
            max_data_bytes: Some(1 << 20),
            max_duration_secs: Some(120),
        };
        let limits = relay.limits();
        assert_eq!(limits.max_circuits, Some(4));
        assert_eq!(limits.max_data_per_circuit, Some(1 << 20));
        assert_eq!(limits.max_duration, Some(Duration::from_secs(120)));
    }
}
