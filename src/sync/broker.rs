//! Broker-backed sync driver.
//!
//! # Responsibilities
//! - Dial the broker over WebSocket and authenticate with the admin key
//! - Queue local mutations and deliver them as `publish` frames
//! - Hand `message` frames from other nodes to the subscriber
//! - Reconnect after a lost connection, within the retry budget
//!
//! # Design Decisions
//! - Publishing only enqueues; a full queue drops the event with a warning
//! - An event that keeps failing is dropped once its attempts reach the
//!   retry budget
//! - When reconnecting is exhausted, a mandatory driver fails the node;
//!   otherwise the node stays local-only and tries again later

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::wire::{channel_for, Frame, CHANNEL_PREFIX};
use super::{Capability, EventHandler, SyncDriver, SyncEndpoint, SyncError, SyncEvent};
use crate::observability::metrics;
use crate::resilience::{RetryError, RetryPolicy};
use crate::store::RendezvousRecord;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DRIVER_NAME: &str = "broker";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_LOCAL_ONLY_RETRY: Duration = Duration::from_secs(60);

/// Broker driver settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker address: `ws://host:port`, `tcp://host:port` or `host:port`.
    pub server: String,
    pub admin_key: String,
    /// Address advertised to clients instead of `server`.
    pub public_addr: Option<String>,
    /// Identifies this node's events; usually its PeerId.
    pub origin: String,
    /// Fail the node instead of degrading when the broker is unreachable.
    pub mandatory: bool,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
    /// Pause before retrying after falling back to local-only.
    pub local_only_retry: Duration,
}

impl BrokerConfig {
    pub fn new(server: impl Into<String>, admin_key: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            admin_key: admin_key.into(),
            public_addr: None,
            origin: origin.into(),
            mandatory: false,
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            local_only_retry: DEFAULT_LOCAL_ONLY_RETRY,
        }
    }
}

/// Turn a configured broker address into a WebSocket URL.
pub fn normalize_endpoint(server: &str) -> Result<Url, SyncError> {
    let server = server.trim();
    let candidate = if let Some(rest) = server.strip_prefix("tcp://") {
        format!("ws://{rest}")
    } else if server.contains("://") {
        server.to_string()
    } else {
        format!("ws://{server}")
    };

    let url = Url::parse(&candidate).map_err(|_| SyncError::Endpoint(server.to_string()))?;
    if url.scheme() != "ws" || url.host_str().is_none() {
        return Err(SyncError::Endpoint(server.to_string()));
    }
    Ok(url)
}

struct Outbound {
    frame: Frame,
    kind: &'static str,
    attempts: u32,
}

enum SessionEnd {
    Stopped,
    Lost(String),
}

/// Sync driver speaking JSON frames to a WebSocket broker.
pub struct BrokerDriver {
    config: BrokerConfig,
    url: Url,
    queue_tx: mpsc::Sender<Outbound>,
    queue_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    session: Mutex<Option<WsStream>>,
    handler: RwLock<Option<EventHandler>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl BrokerDriver {
    pub fn new(config: BrokerConfig) -> Result<Self, SyncError> {
        let url = normalize_endpoint(&config.server)?;
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Ok(Self {
            config,
            url,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            session: Mutex::new(None),
            handler: RwLock::new(None),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_mandatory(&self) -> bool {
        self.config.mandatory
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn connect_error(&self, reason: impl Into<String>) -> SyncError {
        SyncError::Connect {
            endpoint: self.url.to_string(),
            reason: reason.into(),
        }
    }

    /// Dial, authenticate and subscribe.
    async fn open_session(&self) -> Result<WsStream, SyncError> {
        let handshake = async {
            let (mut ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(|e| self.connect_error(e.to_string()))?;

            let auth = Frame::Auth {
                key: self.config.admin_key.clone(),
                origin: self.config.origin.clone(),
            };
            send_frame(&mut ws, &auth)
                .await
                .map_err(|e| self.connect_error(e))?;

            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                        Ok(Frame::Ack) => break,
                        Ok(Frame::Error { reason }) => {
                            return Err(self.connect_error(format!("rejected: {reason}")))
                        }
                        Ok(other) => {
                            return Err(self.connect_error(format!("unexpected frame {other:?}")))
                        }
                        Err(e) => return Err(self.connect_error(e.to_string())),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(self.connect_error("closed during handshake"))
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(self.connect_error(e.to_string())),
                }
            }

            let subscribe = Frame::Subscribe {
                channel: CHANNEL_PREFIX.to_string(),
            };
            send_frame(&mut ws, &subscribe)
                .await
                .map_err(|e| self.connect_error(e))?;
            Ok(ws)
        };

        tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| self.connect_error("timed out"))?
    }

    fn enqueue(&self, event: SyncEvent) -> Result<(), SyncError> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        let kind = event.kind();
        let channel = channel_for(&event.record().namespace);
        let payload = serde_json::to_value(&event).map_err(|e| SyncError::Protocol(e.to_string()))?;
        let outbound = Outbound {
            frame: Frame::Publish { channel, payload },
            kind,
            attempts: 0,
        };
        match self.queue_tx.try_send(outbound) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(driver = DRIVER_NAME, kind, "Sync queue full, dropping event");
                metrics::record_sync_dropped(DRIVER_NAME, "queue_full");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(SyncError::Closed),
        }
    }

    fn drop_event(&self, kind: &'static str, reason: &'static str) {
        tracing::warn!(driver = DRIVER_NAME, kind, reason, "Dropping sync event");
        metrics::record_sync_dropped(DRIVER_NAME, reason);
    }

    fn on_frame(&self, text: &str) {
        let (channel, payload) = match Frame::decode(text) {
            Ok(Frame::Message { channel, payload }) => (channel, payload),
            Ok(Frame::Error { reason }) => {
                tracing::warn!(driver = DRIVER_NAME, reason = %reason, "Broker reported an error");
                return;
            }
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(driver = DRIVER_NAME, error = %e, "Malformed broker frame");
                return;
            }
        };
        if !channel.starts_with(CHANNEL_PREFIX) {
            return;
        }

        let event: SyncEvent = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(driver = DRIVER_NAME, channel = %channel, error = %e, "Malformed sync event");
                return;
            }
        };
        if event.origin() == self.config.origin {
            return;
        }

        metrics::record_sync_event(DRIVER_NAME, "in", event.kind());
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    async fn deliver<S>(
        &self,
        sink: &mut S,
        mut outbound: Outbound,
        pending: &mut Option<Outbound>,
    ) -> Result<(), String>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        match send_frame(sink, &outbound.frame).await {
            Ok(()) => {
                metrics::record_sync_event(DRIVER_NAME, "out", outbound.kind);
                Ok(())
            }
            Err(e) => {
                outbound.attempts += 1;
                if outbound.attempts >= self.config.retry.max_attempts.max(1) {
                    self.drop_event(outbound.kind, "retries_exhausted");
                } else {
                    *pending = Some(outbound);
                }
                Err(e)
            }
        }
    }

    /// Pump one connected session until it ends.
    async fn pump(
        &self,
        ws: WsStream,
        queue: &mut mpsc::Receiver<Outbound>,
        pending: &mut Option<Outbound>,
        stop: &CancellationToken,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        if let Some(outbound) = pending.take() {
            if let Err(e) = self.deliver(&mut sink, outbound, pending).await {
                return SessionEnd::Lost(e);
            }
        }

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Stopped;
                }
                outbound = queue.recv() => match outbound {
                    Some(outbound) => {
                        if let Err(e) = self.deliver(&mut sink, outbound, pending).await {
                            return SessionEnd::Lost(e);
                        }
                    }
                    None => return SessionEnd::Stopped,
                },
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.on_frame(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost("closed by broker".to_string())
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                },
            }
        }
    }

    /// Drop events until the retry pause is over. Returns false if stopped.
    async fn local_only(&self, queue: &mut mpsc::Receiver<Outbound>, stop: &CancellationToken) -> bool {
        let pause = tokio::time::sleep(self.config.local_only_retry);
        tokio::pin!(pause);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = &mut pause => return true,
                outbound = queue.recv() => match outbound {
                    Some(outbound) => self.drop_event(outbound.kind, "disconnected"),
                    None => return false,
                },
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), String>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = frame.encode().map_err(|e| e.to_string())?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| e.to_string())
}

#[async_trait]
impl SyncDriver for BrokerDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn capability(&self) -> Capability {
        Capability::Both
    }

    fn endpoint(&self) -> Option<SyncEndpoint> {
        let url = self
            .config
            .public_addr
            .clone()
            .unwrap_or_else(|| self.config.server.clone());
        Some(SyncEndpoint {
            driver: DRIVER_NAME.to_string(),
            url,
        })
    }

    async fn connect(&self) -> Result<(), SyncError> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        let ws = self.open_session().await?;
        *self.session.lock().await = Some(ws);
        tracing::info!(broker = %self.url, "Connected to broker");
        Ok(())
    }

    async fn publish_upsert(&self, record: &RendezvousRecord) -> Result<(), SyncError> {
        self.enqueue(SyncEvent::Upsert {
            origin: self.config.origin.clone(),
            record: record.clone(),
        })
    }

    async fn publish_remove(&self, record: &RendezvousRecord) -> Result<(), SyncError> {
        self.enqueue(SyncEvent::Remove {
            origin: self.config.origin.clone(),
            record: record.clone(),
        })
    }

    fn subscribe(&self, handler: EventHandler) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SyncError> {
        let mut queue = self
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or(SyncError::AlreadyRunning)?;

        // fires on the supervisor token or on close()
        let stop = self.shutdown.child_token();
        let _stop_guard = stop.clone().drop_guard();
        {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => stop.cancel(),
                    _ = stop.cancelled() => {}
                }
            });
        }

        let mut session = self.session.lock().await.take();
        let mut pending: Option<Outbound> = None;

        loop {
            let ws = match session.take() {
                Some(ws) => ws,
                None => {
                    let attempt = self
                        .config
                        .retry
                        .run("broker connect", &stop, |_| self.open_session())
                        .await;
                    match attempt {
                        Ok(ws) => {
                            tracing::info!(broker = %self.url, "Reconnected to broker");
                            ws
                        }
                        Err(RetryError::Cancelled) => break,
                        Err(RetryError::Exhausted { last, .. }) => {
                            if self.config.mandatory {
                                tracing::error!(broker = %self.url, error = %last, "Broker unreachable");
                                return Err(last);
                            }
                            tracing::warn!(
                                broker = %self.url,
                                error = %last,
                                retry_in = ?self.config.local_only_retry,
                                "Broker unreachable, continuing local-only"
                            );
                            if let Some(outbound) = pending.take() {
                                self.drop_event(outbound.kind, "disconnected");
                            }
                            if !self.local_only(&mut queue, &stop).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            match self.pump(ws, &mut queue, &mut pending, &stop).await {
                SessionEnd::Stopped => break,
                SessionEnd::Lost(reason) => {
                    tracing::warn!(broker = %self.url, reason = %reason, "Broker connection lost");
                }
            }
        }

        tracing::debug!(driver = DRIVER_NAME, "Sync driver stopped");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        if let Some(mut ws) = self.session.lock().await.take() {
            let _ = ws.close(None).await;
        }
        tracing::info!(driver = DRIVER_NAME, "Sync driver closed");
    }
}
