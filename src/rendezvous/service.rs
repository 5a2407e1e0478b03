//! Rendezvous request handling and replication glue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multiaddr::Multiaddr;
use tokio_util::sync::CancellationToken;

use super::protocol::{RendezvousRequest, RendezvousResponse, Status};
use super::{RendezvousError, DEFAULT_DISCOVER_LIMIT, MAX_DISCOVER_LIMIT, MAX_NAMESPACE_LEN};
use crate::identity::PeerId;
use crate::net::{Stream, StreamHandler};
use crate::observability::metrics;
use crate::store::{Page, RecordStore, Registration, RendezvousRecord, DEFAULT_TTL};
use crate::sync::{SyncDriver, SyncEndpoint, SyncEvent};

/// Time a client may stay idle between requests.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Registers and discovers peers, and keeps drivers in sync with the store.
pub struct RendezvousService {
    store: RecordStore,
    drivers: Vec<Arc<dyn SyncDriver>>,
}

impl RendezvousService {
    pub fn new(store: RecordStore, drivers: Vec<Arc<dyn SyncDriver>>) -> Self {
        Self { store, drivers }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn drivers(&self) -> &[Arc<dyn SyncDriver>] {
        &self.drivers
    }

    /// Route events from every subscribe-capable driver into the store.
    pub fn attach(&self) {
        for driver in self.drivers.iter().filter(|d| d.capability().can_subscribe()) {
            let store = self.store.clone();
            let name = driver.name().to_string();
            driver.subscribe(Arc::new(move |event| {
                if let Err(e) = apply_event(&store, &event) {
                    tracing::warn!(driver = %name, kind = event.kind(), error = %e, "Failed to apply sync event");
                }
            }));
        }
    }

    /// Register a peer and publish the result once it is committed.
    pub async fn register(&self, registration: Registration) -> Result<RendezvousRecord, RendezvousError> {
        validate_namespace(&registration.namespace)?;
        if registration.ttl.is_zero() || registration.ttl > self.store.max_ttl() {
            return Err(RendezvousError::InvalidTtl(registration.ttl));
        }

        let (record, outcome) = self.store.upsert(registration)?;
        tracing::debug!(
            namespace = %record.namespace,
            peer = %record.peer,
            outcome = ?outcome,
            "Registration"
        );
        for driver in self.publishers() {
            if let Err(e) = driver.publish_upsert(&record).await {
                tracing::warn!(driver = driver.name(), error = %e, "Publish failed");
            }
        }
        Ok(record)
    }

    /// Remove a registration. Removing an absent one is not an error.
    pub async fn unregister(
        &self,
        namespace: &str,
        peer: &PeerId,
    ) -> Result<Option<RendezvousRecord>, RendezvousError> {
        validate_namespace(namespace)?;
        let removed = self.store.remove(namespace, peer)?;
        if let Some(record) = &removed {
            for driver in self.publishers() {
                if let Err(e) = driver.publish_remove(record).await {
                    tracing::warn!(driver = driver.name(), error = %e, "Publish failed");
                }
            }
        }
        Ok(removed)
    }

    /// Page through live registrations.
    pub fn discover(
        &self,
        namespace: &str,
        limit: Option<usize>,
        cursor: u64,
    ) -> Result<Page, RendezvousError> {
        if !namespace.is_empty() {
            validate_namespace(namespace)?;
        }
        let limit = match limit {
            None | Some(0) => DEFAULT_DISCOVER_LIMIT,
            Some(n) => n.min(MAX_DISCOVER_LIMIT),
        };
        Ok(self.store.query(namespace, limit, cursor)?)
    }

    /// Endpoints clients can use to reach the drivers' backends.
    pub fn sync_endpoints(&self) -> Vec<SyncEndpoint> {
        self.drivers.iter().filter_map(|d| d.endpoint()).collect()
    }

    fn publishers(&self) -> impl Iterator<Item = &Arc<dyn SyncDriver>> {
        self.drivers.iter().filter(|d| d.capability().can_publish())
    }

    async fn dispatch(&self, request: RendezvousRequest) -> Result<RendezvousResponse, RendezvousError> {
        match request {
            RendezvousRequest::Register {
                namespace,
                peer,
                addrs,
                ttl,
            } => {
                let registration = Registration {
                    namespace,
                    peer: parse_peer(&peer)?,
                    addrs: parse_addrs(&addrs)?,
                    ttl: ttl.map(Duration::from_secs).unwrap_or(DEFAULT_TTL),
                };
                let ttl = registration.ttl.as_secs();
                self.register(registration).await?;
                Ok(RendezvousResponse::Registered { ttl })
            }
            RendezvousRequest::Unregister { namespace, peer } => {
                self.unregister(&namespace, &parse_peer(&peer)?).await?;
                Ok(RendezvousResponse::Unregistered)
            }
            RendezvousRequest::Discover {
                namespace,
                limit,
                cursor,
            } => {
                let page = self.discover(&namespace, limit, cursor)?;
                Ok(RendezvousResponse::Discovered {
                    records: page.records,
                    cursor: page.cursor,
                })
            }
            RendezvousRequest::SyncInfo => Ok(RendezvousResponse::SyncInfo {
                endpoints: self.sync_endpoints(),
            }),
        }
    }
}

/// Apply a replicated event. Returns whether the store changed.
pub fn apply_event(store: &RecordStore, event: &SyncEvent) -> Result<bool, RendezvousError> {
    let changed = match event {
        SyncEvent::Upsert { record, .. } => store.merge(record.clone())?,
        SyncEvent::Remove { record, .. } => store.remove_if_not_fresher(record)?,
    };
    tracing::debug!(
        kind = event.kind(),
        origin = event.origin(),
        namespace = %event.record().namespace,
        peer = %event.record().peer,
        changed,
        "Sync event applied"
    );
    Ok(changed)
}

pub fn validate_namespace(namespace: &str) -> Result<(), RendezvousError> {
    if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN {
        return Err(RendezvousError::InvalidNamespace(namespace.len()));
    }
    Ok(())
}

fn parse_peer(peer: &str) -> Result<PeerId, RendezvousError> {
    peer.parse()
        .map_err(|e| RendezvousError::InvalidPeer(format!("{peer}: {e}")))
}

fn parse_addrs(addrs: &[String]) -> Result<Vec<Multiaddr>, RendezvousError> {
    addrs
        .iter()
        .map(|a| {
            a.parse()
                .map_err(|e| RendezvousError::InvalidAddress(format!("{a}: {e}")))
        })
        .collect()
}

#[async_trait]
impl StreamHandler for RendezvousService {
    async fn handle(&self, mut stream: Stream, token: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = token.cancelled() => return,
                request = stream.recv_timeout::<RendezvousRequest>(IDLE_TIMEOUT) => request,
            };
            let request = match request {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(crate::net::StreamError::Json(e)) => {
                    metrics::record_rendezvous_request("unknown", Status::Malformed.as_str());
                    let reply = RendezvousResponse::Error {
                        status: Status::Malformed,
                        message: e.to_string(),
                    };
                    if stream.send(&reply).await.is_err() {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::debug!(remote = %stream.remote_addr(), error = %e, "Rendezvous stream ended");
                    return;
                }
            };

            if let RendezvousRequest::Register { peer, .. } = &request {
                if let Ok(peer) = peer.parse::<PeerId>() {
                    stream.identify(&peer);
                }
            }

            let op = request.op();
            let reply = match self.dispatch(request).await {
                Ok(reply) => {
                    metrics::record_rendezvous_request(op, "ok");
                    reply
                }
                Err(e) => {
                    let status = e.status();
                    if status == Status::Internal {
                        tracing::error!(op, error = %e, "Rendezvous request failed");
                    } else {
                        tracing::debug!(op, error = %e, "Rendezvous request rejected");
                    }
                    metrics::record_rendezvous_request(op, status.as_str());
                    RendezvousResponse::Error {
                        status,
                        message: e.to_string(),
                    }
                }
            };
            if stream.send(&reply).await.is_err() {
                return;
            }
        }
    }
}
