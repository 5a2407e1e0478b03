//! Node assembly.
//!
//! # Responsibilities
//! - Validate configuration and resolve identity and addresses
//! - Bind the host, open the store, connect sync drivers
//! - Build the relay and rendezvous services and the metrics exporter
//! - Run every long-lived part under the supervisor, then tear down
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal, except the ones that degrade
//!   (non-mandatory broker, metrics bind)
//! - Whatever was already opened is closed when a later step fails
//! - Teardown runs exactly once, after the supervisor returns

use std::net::SocketAddr;
use std::sync::Arc;

use multiaddr::Multiaddr;

use crate::config::{validate_config, ConfigError, NodeConfig};
use crate::error::NodeError;
use crate::identity::{self, Identity, KeyType, PeerId};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals;
use crate::lifecycle::state::{LifecycleState, StateCell};
use crate::lifecycle::supervisor::Supervisor;
use crate::net::{parse_address_list, Host, HostConfig};
use crate::observability::metrics;
use crate::observability::MetricsExporter;
use crate::relay::{self, RelayService};
use crate::rendezvous::{self, RendezvousService};
use crate::store::{sweeper, RecordStore, StoreOptions};
use crate::sync::{BrokerConfig, BrokerDriver, NoopDriver, SyncDriver};

/// A fully assembled node, ready to run.
pub struct Node {
    config: NodeConfig,
    identity: Arc<Identity>,
    host: Arc<Host>,
    store: RecordStore,
    drivers: Vec<Arc<dyn SyncDriver>>,
    relay: Arc<RelayService>,
    rendezvous: Arc<RendezvousService>,
    exporter: Option<MetricsExporter>,
    shutdown: Shutdown,
    state: StateCell,
}

impl Node {
    /// Assemble every component described by `config`.
    pub async fn build(config: NodeConfig) -> Result<Self, NodeError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let identity = Arc::new(match &config.identity.private_key {
            Some(key) => identity::load(key)?,
            None => {
                tracing::warn!("No private key given, using an ephemeral Ed25519 identity");
                Identity::generate(KeyType::Ed25519, 0)?
            }
        });

        let host_config = HostConfig {
            listen: parse_address_list(&config.network.listen)?,
            announce: parse_address_list(&config.network.announce)?,
            max_connections: config.network.max_connections,
        };
        let host = Arc::new(Host::bind(identity.clone(), host_config).await?);
        log_host_info(&host);

        let store = RecordStore::open(
            &config.store.location,
            StoreOptions {
                max_ttl: config.store.max_ttl(),
            },
        )?;

        let drivers = match connect_drivers(&config, identity.peer_id()).await {
            Ok(drivers) => drivers,
            Err(e) => {
                store.close();
                return Err(e);
            }
        };

        let relay = Arc::new(RelayService::new(config.relay.limits()));
        host.set_stream_handler(relay::PROTOCOL, relay.clone());
        if relay.limits().is_unlimited() {
            tracing::info!("Relay enabled without limits");
        } else {
            tracing::info!(limits = ?relay.limits(), "Relay enabled");
        }

        let rendezvous = Arc::new(RendezvousService::new(store.clone(), drivers.clone()));
        rendezvous.attach();
        host.set_stream_handler(rendezvous::PROTOCOL, rendezvous.clone());

        let exporter = match &config.metrics.listen {
            Some(listen) => match MetricsExporter::bind(listen).await {
                Ok(exporter) => Some(with_collectors(exporter, &host, &store, &relay)),
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics disabled");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            config,
            identity,
            host,
            store,
            drivers,
            relay,
            rendezvous,
            exporter,
            shutdown: Shutdown::new(),
            state: StateCell::new(),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Multiaddrs the host bound.
    pub fn local_addrs(&self) -> &[Multiaddr] {
        self.host.local_addrs()
    }

    /// Socket addresses the host bound.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.host.socket_addrs()
    }

    /// Address of the metrics listener, when it is enabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.exporter.as_ref().and_then(|e| e.local_addr().ok())
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn rendezvous(&self) -> &Arc<RendezvousService> {
        &self.rendezvous
    }

    pub fn relay(&self) -> &Arc<RelayService> {
        &self.relay
    }

    /// Handle that stops a running node.
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    /// Run until a signal, a shutdown request or the first task exit.
    pub async fn run(self) -> Result<(), NodeError> {
        let Node {
            config,
            host,
            store,
            drivers,
            relay,
            exporter,
            shutdown,
            state,
            ..
        } = self;

        let _ = state.advance(LifecycleState::Running);
        let mut supervisor = Supervisor::with_shutdown(shutdown);

        supervisor.spawn("signals", |token| async move {
            signals::wait_for_signal(token).await.map(|_| ())
        });
        {
            let host = host.clone();
            supervisor.spawn("host", move |token| async move { host.run(token).await });
        }
        {
            let store = store.clone();
            let interval = config.store.sweep_interval();
            supervisor.spawn("sweeper", move |token| sweeper::run(store, interval, token));
        }
        for driver in &drivers {
            let driver = driver.clone();
            let name = format!("sync:{}", driver.name());
            supervisor.spawn(name, move |token| async move { driver.run(token).await });
        }
        {
            let relay = relay.clone();
            supervisor.spawn("relay", move |token| async move { relay.run(token).await });
        }
        if let Some(exporter) = exporter {
            supervisor.spawn("metrics", move |token| exporter.run(token));
        }

        let result = supervisor.run().await;

        let _ = state.advance(LifecycleState::Stopping);
        relay.stop();
        for driver in &drivers {
            driver.close().await;
        }
        store.close();

        match result {
            Ok(()) => {
                let _ = state.advance(LifecycleState::Stopped);
                tracing::info!("Node stopped");
                Ok(())
            }
            Err(failure) => {
                let _ = state.advance(LifecycleState::Failed);
                Err(failure.into())
            }
        }
    }
}

async fn connect_drivers(
    config: &NodeConfig,
    peer_id: &PeerId,
) -> Result<Vec<Arc<dyn SyncDriver>>, NodeError> {
    let emitter = &config.sync.emitter;
    let (Some(server), Some(admin_key)) = (&emitter.server, &emitter.admin_key) else {
        if emitter.server.is_some() || emitter.admin_key.is_some() {
            tracing::warn!("Broker needs both emitter-server and emitter-admin-key, sync disabled");
        }
        return Ok(vec![Arc::new(NoopDriver::new())]);
    };
    if !emitter.is_enabled() {
        return Ok(vec![Arc::new(NoopDriver::new())]);
    }

    let mut broker = BrokerConfig::new(server.clone(), admin_key.clone(), peer_id.to_string());
    broker.public_addr = emitter.public_addr.clone();
    broker.mandatory = emitter.mandatory;
    broker.retry = emitter.retry;
    broker.connect_timeout = emitter.connect_timeout();
    broker.queue_capacity = emitter.queue_capacity;

    let driver = BrokerDriver::new(broker).map_err(|source| NodeError::Driver {
        driver: "broker".to_string(),
        source,
    })?;

    match driver.connect().await {
        Ok(()) => {}
        Err(source) if emitter.mandatory => {
            driver.close().await;
            return Err(NodeError::Driver {
                driver: driver.name().to_string(),
                source,
            });
        }
        Err(e) => tracing::warn!(broker = %server, error = %e, "Broker unavailable, starting local-only"),
    }

    Ok(vec![Arc::new(driver)])
}

fn with_collectors(
    exporter: MetricsExporter,
    host: &Arc<Host>,
    store: &RecordStore,
    relay: &Arc<RelayService>,
) -> MetricsExporter {
    let bandwidth = host.bandwidth().clone();
    let connections = host.clone();
    let store = store.clone();
    let relay = relay.clone();
    exporter
        .with_collector(move || metrics::record_bandwidth(&bandwidth))
        .with_collector(move || metrics::record_connections(connections.connections().active_count()))
        .with_collector(move || metrics::record_store_size(store.len()))
        .with_collector(move || {
            metrics::record_relay_active(relay.active_circuits(), relay.reservation_count())
        })
}

fn log_host_info(host: &Host) {
    let peer_id = host.peer_id();
    let maddrs: Vec<String> = host
        .announce_addrs()
        .iter()
        .map(|addr| format!("{addr}/p2p/{peer_id}"))
        .collect();
    tracing::info!(peer_id = %peer_id, maddrs = ?maddrs, "Host started");
}
