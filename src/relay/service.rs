//! Relay stream handler.
//!
//! # Responsibilities
//! - Hold reservations: one control stream per target peer
//! - Match `connect` requests to reserved targets and wait for `accept`
//! - Splice accepted circuits and enforce [`RelayLimits`]
//!
//! # Design Decisions
//! - A newer reservation for the same peer replaces the older one
//! - Limits apply per circuit; hitting one never affects other circuits
//! - The accepting stream's task lives until its circuit ends so the host
//!   keeps counting the connection

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::circuit::{splice, CircuitEnd};
use super::limits::{CircuitSlots, DataBudget, RelayLimits};
use super::protocol::{ErrorCode, RelayRequest, RelayResponse};
use super::RelayError;
use crate::identity::PeerId;
use crate::net::{Stream, StreamHandler};
use crate::observability::metrics;

/// Time a client gets to send its first request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a reserved target gets to accept an incoming circuit.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

const NOTICE_QUEUE: usize = 16;

struct Reservation {
    id: u64,
    notices: mpsc::Sender<RelayResponse>,
}

struct Accepted {
    stream: Stream,
    // dropped when the circuit ends
    _done: oneshot::Sender<()>,
}

/// Circuit relay between reserved peers.
pub struct RelayService {
    limits: RelayLimits,
    slots: CircuitSlots,
    reservations: DashMap<PeerId, Reservation>,
    pending: DashMap<Uuid, oneshot::Sender<Accepted>>,
    next_reservation: AtomicU64,
    stop: CancellationToken,
    stopped: AtomicBool,
}

impl RelayService {
    pub fn new(limits: RelayLimits) -> Self {
        Self {
            limits,
            slots: CircuitSlots::new(limits.max_circuits),
            reservations: DashMap::new(),
            pending: DashMap::new(),
            next_reservation: AtomicU64::new(1),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn limits(&self) -> RelayLimits {
        self.limits
    }

    pub fn active_circuits(&self) -> usize {
        self.slots.active()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Cancel every circuit and reservation. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.cancel();
        self.pending.clear();
        self.reservations.clear();
        self.report();
        tracing::info!("Relay stopped");
    }

    /// Supervised task: idle until `token` fires, then stop.
    pub async fn run(&self, token: CancellationToken) -> Result<(), RelayError> {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = self.stop.cancelled() => {}
        }
        self.stop();
        Ok(())
    }

    fn report(&self) {
        metrics::record_relay_active(self.slots.active(), self.reservations.len());
    }

    /// Token firing on the host token or on `stop`.
    fn link(&self, host: &CancellationToken) -> CancellationToken {
        let token = self.stop.child_token();
        let linked = token.clone();
        let host = host.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = host.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        token
    }

    async fn reserve(&self, mut stream: Stream, peer: PeerId, token: &CancellationToken) {
        let id = self.next_reservation.fetch_add(1, Ordering::Relaxed);
        let (notices, mut rx) = mpsc::channel(NOTICE_QUEUE);
        stream.identify(&peer);
        if self
            .reservations
            .insert(peer.clone(), Reservation { id, notices })
            .is_some()
        {
            tracing::debug!(peer = %peer, "Replacing existing reservation");
        }
        self.report();

        if stream.send(&RelayResponse::Reserved).await.is_ok() {
            tracing::info!(peer = %peer, remote = %stream.remote_addr(), "Reservation accepted");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    notice = rx.recv() => match notice {
                        Some(notice) => {
                            if stream.send(&notice).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    message = stream.recv::<serde_json::Value>() => match message {
                        Ok(Some(_)) => {}
                        _ => break,
                    },
                }
            }
        }

        self.reservations.remove_if(&peer, |_, r| r.id == id);
        self.report();
        tracing::debug!(peer = %peer, "Reservation ended");
    }

    async fn connect(&self, mut stream: Stream, peer: PeerId, target: PeerId, token: &CancellationToken) {
        stream.identify(&peer);
        let notices = self.reservations.get(&target).map(|r| r.notices.clone());
        let Some(notices) = notices else {
            metrics::record_relay_circuit("no_reservation");
            let reply = RelayResponse::error(ErrorCode::NoReservation, format!("{target} has no reservation"));
            let _ = stream.send(&reply).await;
            return;
        };

        let slot = match self.slots.acquire() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(peer = %peer, target = %target, error = %e, "Circuit rejected");
                metrics::record_relay_circuit("rejected");
                let reply = RelayResponse::error(ErrorCode::ResourceLimitExceeded, e.to_string());
                let _ = stream.send(&reply).await;
                return;
            }
        };

        let circuit = Uuid::new_v4();
        let (accepted_tx, accepted_rx) = oneshot::channel();
        self.pending.insert(circuit, accepted_tx);

        let incoming = RelayResponse::Incoming {
            circuit,
            from: peer.clone(),
        };
        if notices.send(incoming).await.is_err() {
            self.pending.remove(&circuit);
            metrics::record_relay_circuit("no_reservation");
            let reply = RelayResponse::error(ErrorCode::NoReservation, format!("{target} went away"));
            let _ = stream.send(&reply).await;
            return;
        }

        let accepted = tokio::select! {
            accepted = tokio::time::timeout(ACCEPT_TIMEOUT, accepted_rx) => accepted,
            _ = token.cancelled() => {
                self.pending.remove(&circuit);
                return;
            }
        };
        let Accepted { stream: mut other, _done: done } = match accepted {
            Ok(Ok(accepted)) => accepted,
            _ => {
                self.pending.remove(&circuit);
                metrics::record_relay_circuit("timeout");
                let reply = RelayResponse::error(ErrorCode::Timeout, "target did not accept in time");
                let _ = stream.send(&reply).await;
                return;
            }
        };

        let connected = RelayResponse::Connected { circuit };
        if stream.send(&connected).await.is_err() || other.send(&connected).await.is_err() {
            metrics::record_relay_circuit("aborted");
            return;
        }

        metrics::record_relay_circuit("opened");
        self.report();
        tracing::info!(%circuit, from = %peer, to = %target, "Circuit opened");

        let budget = DataBudget::new(self.limits.max_data_per_circuit);
        let result = splice(
            circuit,
            stream.into_raw(),
            other.into_raw(),
            &budget,
            self.limits.max_duration,
            token,
        )
        .await;

        match result {
            Ok(CircuitEnd::Closed) => metrics::record_relay_circuit("closed"),
            Ok(CircuitEnd::Cancelled) => metrics::record_relay_circuit("cancelled"),
            Err(RelayError::ResourceExceeded(reason)) => {
                tracing::warn!(%circuit, reason = %reason, bytes = budget.used(), "Circuit terminated");
                metrics::record_relay_circuit("limit_exceeded");
            }
            Err(e) => {
                tracing::debug!(%circuit, error = %e, "Circuit failed");
                metrics::record_relay_circuit("failed");
            }
        }

        drop(done);
        drop(slot);
        self.report();
    }

    async fn accept(&self, mut stream: Stream, circuit: Uuid) {
        let Some((_, waiter)) = self.pending.remove(&circuit) else {
            let reply = RelayResponse::error(ErrorCode::UnknownCircuit, format!("no pending circuit {circuit}"));
            let _ = stream.send(&reply).await;
            return;
        };

        let (done, finished) = oneshot::channel();
        if waiter.send(Accepted { stream, _done: done }).is_ok() {
            let _ = finished.await;
        }
    }
}

#[async_trait]
impl StreamHandler for RelayService {
    async fn handle(&self, mut stream: Stream, token: CancellationToken) {
        if self.is_stopped() {
            let reply = RelayResponse::error(ErrorCode::Unavailable, "relay is stopping");
            let _ = stream.send(&reply).await;
            return;
        }

        let request = match stream.recv_timeout::<RelayRequest>(REQUEST_TIMEOUT).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(remote = %stream.remote_addr(), error = %e, "Bad relay request");
                let reply = RelayResponse::error(ErrorCode::Malformed, e.to_string());
                let _ = stream.send(&reply).await;
                return;
            }
        };

        let token = self.link(&token);
        let _unlink = token.clone().drop_guard();
        match request {
            RelayRequest::Reserve { peer } => self.reserve(stream, peer, &token).await,
            RelayRequest::Connect { peer, target } => self.connect(stream, peer, target, &token).await,
            RelayRequest::Accept { circuit } => self.accept(stream, circuit).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::identity::{Identity, KeyType};
    use crate::net::{Host, HostConfig};
    use crate::relay::client;
    use crate::relay::protocol::PROTOCOL;

    fn peer() -> PeerId {
        Identity::generate(KeyType::Ed25519, 0)
            .unwrap()
            .peer_id()
            .clone()
    }

    async fn relay_host(limits: RelayLimits) -> (Arc<Host>, Arc<RelayService>, CancellationToken) {
        let identity = Arc::new(Identity::generate(KeyType::Ed25519, 0).unwrap());
        let config = HostConfig {
            listen: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
            ..Default::default()
        };
        let host = Arc::new(Host::bind(identity, config).await.unwrap());
        let relay = Arc::new(RelayService::new(limits));
        host.set_stream_handler(PROTOCOL, relay.clone());
        let token = CancellationToken::new();
        {
            let host = host.clone();
            let token = token.clone();
            tokio::spawn(async move { host.run(token).await });
        }
        (host, relay, token)
    }

    #[tokio::test]
    async fn test_connect_without_reservation() {
        let (host, _relay, token) = relay_host(RelayLimits::unlimited()).await;
        let addr = host.socket_addrs()[0];
        let result = client::connect(addr, &peer(), &peer()).await;
        assert!(matches!(
            result,
            Err(RelayError::Rejected {
                code: ErrorCode::NoReservation,
                ..
            })
        ));
        token.cancel();
    }

    #[tokio::test]
    async fn test_unknown_circuit() {
        let (host, _relay, token) = relay_host(RelayLimits::unlimited()).await;
        let addr = host.socket_addrs()[0];
        let reservation = client::reserve(addr, &peer()).await.unwrap();
        let result = reservation.accept(Uuid::new_v4()).await;
        assert!(matches!(
            result,
            Err(RelayError::Rejected {
                code: ErrorCode::UnknownCircuit,
                ..
            })
        ));
        token.cancel();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_refuses_new_work() {
        let (host, relay, token) = relay_host(RelayLimits::unlimited()).await;
        let addr = host.socket_addrs()[0];

        let mut reservation = client::reserve(addr, &peer()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while relay.reservation_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        relay.stop();
        relay.stop();
        assert!(relay.is_stopped());
        assert_eq!(relay.reservation_count(), 0);

        let closed = tokio::time::timeout(Duration::from_secs(2), reservation.next_incoming())
            .await
            .unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));

        let refused = client::reserve(addr, &peer()).await;
        assert!(matches!(
            refused,
            Err(RelayError::Rejected {
                code: ErrorCode::Unavailable,
                ..
            })
        ));
        token.cancel();
    }
}
