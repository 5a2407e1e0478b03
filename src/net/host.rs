//! Network host: listeners, protocol negotiation, handler dispatch.
//!
//! # Responsibilities
//! - Bind every TCP listen address, skip the ones it cannot serve
//! - Negotiate one protocol per inbound connection
//! - Dispatch negotiated streams to registered handlers
//! - Track connections and count bandwidth
//!
//! # Design Decisions
//! - Handlers are registered before `run`; late registration still works
//!   because the table is consulted per connection
//! - Connection tasks get a child of the host token so shutdown reaches them

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use multiaddr::Multiaddr;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::identity::{Identity, PeerId};
use crate::net::address::{socket_addr, to_multiaddr};
use crate::net::bandwidth::{BandwidthCounter, MeteredStream};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};
use crate::net::stream::{codec, Stream, NEGOTIATION_TIMEOUT, PROTOCOL_NOT_AVAILABLE};

/// Default limit on concurrent host connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Time connections get to finish after shutdown starts.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for host operations.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("no listen address could be bound")]
    NoListeners,
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Handler for one protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Serve one negotiated stream until it ends or `token` fires.
    async fn handle(&self, stream: Stream, token: CancellationToken);
}

/// Host settings.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub listen: Vec<Multiaddr>,
    pub announce: Vec<Multiaddr>,
    pub max_connections: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            announce: Vec::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

type HandlerTable = Arc<RwLock<HashMap<String, Arc<dyn StreamHandler>>>>;

/// The node's network host.
pub struct Host {
    identity: Arc<Identity>,
    listeners: Vec<Listener>,
    bound: Vec<Multiaddr>,
    announce: Vec<Multiaddr>,
    handlers: HandlerTable,
    connections: ConnectionTracker,
    bandwidth: Arc<BandwidthCounter>,
}

impl Host {
    /// Bind every supported listen address.
    ///
    /// Addresses the host cannot serve (udp/quic, dns) are skipped with a
    /// warning. Failing to bind a supported address is an error, and so is
    /// ending up with no listener at all.
    pub async fn bind(identity: Arc<Identity>, config: HostConfig) -> Result<Self, HostError> {
        let mut listeners = Vec::new();
        let mut bound = Vec::new();
        for addr in &config.listen {
            let sock = match socket_addr(addr) {
                Ok(sock) => sock,
                Err(reason) => {
                    tracing::warn!(address = %addr, reason = %reason, "Skipping unsupported listen address");
                    continue;
                }
            };
            let listener = Listener::bind(sock, config.max_connections).await?;
            bound.push(to_multiaddr(listener.local_addr()?));
            listeners.push(listener);
        }

        if listeners.is_empty() {
            return Err(HostError::NoListeners);
        }

        tracing::info!(
            peer_id = %identity.peer_id(),
            addrs = ?bound.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
            "Host listening"
        );

        Ok(Self {
            identity,
            listeners,
            bound,
            announce: config.announce,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            connections: ConnectionTracker::new(),
            bandwidth: Arc::new(BandwidthCounter::new()),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    /// Addresses actually bound, with resolved ports.
    pub fn local_addrs(&self) -> &[Multiaddr] {
        &self.bound
    }

    /// Socket addresses actually bound.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Addresses advertised to peers: the announce override if set.
    pub fn announce_addrs(&self) -> &[Multiaddr] {
        if self.announce.is_empty() {
            &self.bound
        } else {
            &self.announce
        }
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthCounter> {
        &self.bandwidth
    }

    /// Register the handler for `protocol`, replacing any previous one.
    pub fn set_stream_handler(&self, protocol: impl Into<String>, handler: Arc<dyn StreamHandler>) {
        let protocol = protocol.into();
        tracing::debug!(protocol = %protocol, "Stream handler registered");
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(protocol, handler);
    }

    /// Accept connections until `token` fires, then drain.
    pub async fn run(&self, token: CancellationToken) -> Result<(), HostError> {
        let loops = self
            .listeners
            .iter()
            .map(|listener| self.accept_loop(listener, token.clone()));
        futures_util::future::join_all(loops).await;

        if !self.connections.wait_for_idle(DRAIN_TIMEOUT).await {
            tracing::warn!(
                active = self.connections.active_count(),
                "Connections still open after drain timeout"
            );
        }
        tracing::info!("Host stopped");
        Ok(())
    }

    async fn accept_loop(&self, listener: &Listener, token: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (tcp, remote, permit) = match accepted {
                Ok(conn) => conn,
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let guard = self.connections.track(remote);
            let handlers = self.handlers.clone();
            let bandwidth = self.bandwidth.clone();
            let token = token.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                tracing::debug!(connection_id = %guard.id(), remote = %guard.remote(), "Connection opened");
                serve_connection(tcp, remote, handlers, bandwidth, token).await;
                drop(guard);
            });
        }
    }
}

async fn serve_connection(
    tcp: TcpStream,
    remote: SocketAddr,
    handlers: HandlerTable,
    bandwidth: Arc<BandwidthCounter>,
    token: CancellationToken,
) {
    let _ = tcp.set_nodelay(true);
    let peer = Arc::new(OnceLock::new());
    let mut framed = Framed::new(MeteredStream::new(tcp, bandwidth, peer.clone()), codec());

    let protocol = tokio::select! {
        _ = token.cancelled() => return,
        first = tokio::time::timeout(NEGOTIATION_TIMEOUT, framed.next()) => match first {
            Ok(Some(Ok(frame))) => String::from_utf8_lossy(&frame).into_owned(),
            Ok(Some(Err(e))) => {
                tracing::debug!(remote = %remote, error = %e, "Negotiation failed");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                tracing::debug!(remote = %remote, "Negotiation timed out");
                return;
            }
        },
    };

    let handler = handlers
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get(&protocol)
        .cloned();

    let Some(handler) = handler else {
        tracing::debug!(remote = %remote, protocol = %protocol, "Protocol not supported");
        let _ = framed.send(Bytes::from_static(PROTOCOL_NOT_AVAILABLE.as_bytes())).await;
        return;
    };

    if let Err(e) = framed.send(Bytes::from(protocol.clone().into_bytes())).await {
        tracing::debug!(remote = %remote, error = %e, "Negotiation reply failed");
        return;
    }

    handler
        .handle(Stream::new(framed, remote, peer, protocol), token)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyType;
    use crate::net::stream::StreamError;

    struct Echo;

    #[async_trait]
    impl StreamHandler for Echo {
        async fn handle(&self, mut stream: Stream, _token: CancellationToken) {
            while let Ok(Some(msg)) = stream.recv::<String>().await {
                if stream.send(&msg).await.is_err() {
                    break;
                }
            }
        }
    }

    async fn test_host() -> Arc<Host> {
        let identity = Arc::new(Identity::generate(KeyType::Ed25519, 0).unwrap());
        let config = HostConfig {
            listen: vec![
                "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
                "/ip4/127.0.0.1/udp/0/quic".parse().unwrap(),
            ],
            ..Default::default()
        };
        Arc::new(Host::bind(identity, config).await.unwrap())
    }

    #[tokio::test]
    async fn test_quic_address_skipped() {
        let host = test_host().await;
        assert_eq!(host.local_addrs().len(), 1);
        assert_ne!(host.socket_addrs()[0].port(), 0);
    }

    #[tokio::test]
    async fn test_no_bindable_address_is_error() {
        let identity = Arc::new(Identity::generate(KeyType::Ed25519, 0).unwrap());
        let config = HostConfig {
            listen: vec!["/ip4/127.0.0.1/udp/0/quic".parse().unwrap()],
            ..Default::default()
        };
        assert!(matches!(
            Host::bind(identity, config).await,
            Err(HostError::NoListeners)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_and_unknown_protocol() {
        let host = test_host().await;
        host.set_stream_handler("/echo/1", Arc::new(Echo));
        let addr = host.socket_addrs()[0];
        let token = CancellationToken::new();
        let runner = {
            let host = host.clone();
            let token = token.clone();
            tokio::spawn(async move { host.run(token).await })
        };

        let mut stream = Stream::dial(addr, "/echo/1").await.unwrap();
        stream.send(&"ping".to_string()).await.unwrap();
        let reply: Option<String> = stream.recv().await.unwrap();
        assert_eq!(reply.as_deref(), Some("ping"));

        let err = Stream::dial(addr, "/missing/1").await.err().unwrap();
        assert!(matches!(err, StreamError::ProtocolNotSupported(_)));

        assert!(host.bandwidth().totals().inbound > 0);
        drop(stream);
        token.cancel();
        runner.await.unwrap().unwrap();
    }
}
