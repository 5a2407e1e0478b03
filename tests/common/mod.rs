//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rdvp::config::NodeConfig;
use rdvp::identity::{Identity, KeyType, PeerId};
use rdvp::net::{RawStream, Stream};
use rdvp::rendezvous::{RendezvousRequest, RendezvousResponse, PROTOCOL};
use rdvp::resilience::RetryPolicy;
use rdvp::store::RecordStore;
use rdvp::sync::wire::Frame;
use rdvp::{Node, NodeError, Shutdown};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub const LOCALHOST: &str = "/ip4/127.0.0.1/tcp/0";

/// Configuration for a node on an ephemeral localhost port.
pub fn node_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.network.listen = LOCALHOST.to_string();
    config.network.announce = String::new();
    config
}

/// Point `config` at a broker with a short retry budget.
pub fn with_broker(mut config: NodeConfig, url: &str, key: &str) -> NodeConfig {
    config.sync.emitter.server = Some(url.to_string());
    config.sync.emitter.admin_key = Some(key.to_string());
    config.sync.emitter.connect_timeout_secs = 2;
    config.sync.emitter.retry = RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 50,
        max_delay_ms: 100,
    };
    config
}

pub fn random_peer() -> PeerId {
    Identity::generate(KeyType::Ed25519, 0)
        .unwrap()
        .peer_id()
        .clone()
}

/// A node running in the background.
pub struct RunningNode {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub metrics: Option<SocketAddr>,
    pub store: RecordStore,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), NodeError>>,
}

impl RunningNode {
    pub async fn stop(self) -> Result<(), NodeError> {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("node did not stop in time")
            .expect("node task panicked")
    }
}

pub async fn start_node(config: NodeConfig) -> RunningNode {
    let node = Node::build(config).await.unwrap();
    let running = RunningNode {
        peer_id: node.peer_id().clone(),
        addr: node.socket_addrs()[0],
        metrics: node.metrics_addr(),
        store: node.store().clone(),
        shutdown: node.shutdown(),
        handle: tokio::spawn(node.run()),
    };
    // Give the host a moment to start accepting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    running
}

/// Send one rendezvous request on a fresh stream.
pub async fn rendezvous(addr: SocketAddr, request: &RendezvousRequest) -> RendezvousResponse {
    let mut stream = Stream::dial(addr, PROTOCOL).await.unwrap();
    stream.send(request).await.unwrap();
    stream
        .recv::<RendezvousResponse>()
        .await
        .unwrap()
        .expect("stream closed without a response")
}

pub fn register(namespace: &str, peer: &PeerId, ttl: Option<u64>) -> RendezvousRequest {
    RendezvousRequest::Register {
        namespace: namespace.to_string(),
        peer: peer.to_string(),
        addrs: vec!["/ip4/10.0.0.1/tcp/4001".to_string()],
        ttl,
    }
}

pub fn discover(namespace: &str) -> RendezvousRequest {
    RendezvousRequest::Discover {
        namespace: namespace.to_string(),
        limit: None,
        cursor: 0,
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Read exactly `n` bytes from a relayed stream, starting with its leftover.
pub async fn read_raw(raw: &mut RawStream, n: usize) -> std::io::Result<Vec<u8>> {
    let take = raw.leftover.len().min(n);
    let mut out = raw.leftover.split_to(take).to_vec();
    if out.len() < n {
        let mut rest = vec![0u8; n - out.len()];
        raw.io.read_exact(&mut rest).await?;
        out.extend_from_slice(&rest);
    }
    Ok(out)
}

pub async fn write_raw(raw: &mut RawStream, data: &[u8]) -> std::io::Result<()> {
    raw.io.write_all(data).await?;
    raw.io.flush().await
}

/// In-process broker speaking the rendezvous wire frames.
pub struct MockBroker {
    pub addr: SocketAddr,
    pub published: Arc<AtomicU64>,
    accept: JoinHandle<()>,
}

impl MockBroker {
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

struct Client {
    prefix: Option<String>,
    tx: mpsc::UnboundedSender<String>,
}

type Clients = Arc<Mutex<HashMap<u64, Client>>>;

/// Start a broker that accepts `key` and fans publishes out to every other
/// subscribed client.
pub async fn start_broker(key: &str) -> MockBroker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let clients: Clients = Arc::new(Mutex::new(HashMap::new()));
    let published = Arc::new(AtomicU64::new(0));
    let key = key.to_string();

    let accept = {
        let published = published.clone();
        tokio::spawn(async move {
            let mut next_id = 0u64;
            while let Ok((socket, _)) = listener.accept().await {
                next_id += 1;
                tokio::spawn(serve_client(
                    next_id,
                    socket,
                    key.clone(),
                    clients.clone(),
                    published.clone(),
                ));
            }
        })
    };

    MockBroker {
        addr,
        published,
        accept,
    }
}

async fn serve_client(
    id: u64,
    socket: tokio::net::TcpStream,
    key: String,
    clients: Clients,
    published: Arc<AtomicU64>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(socket).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let encode = |frame: &Frame| frame.encode().unwrap();
    let mut authed = false;
    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = Frame::decode(text.as_str()) else {
            continue;
        };
        match frame {
            Frame::Auth { key: offered, .. } if !authed => {
                if offered == key {
                    authed = true;
                    clients.lock().unwrap().insert(
                        id,
                        Client {
                            prefix: None,
                            tx: tx.clone(),
                        },
                    );
                    let _ = tx.send(encode(&Frame::Ack));
                } else {
                    let _ = tx.send(encode(&Frame::Error {
                        reason: "bad key".to_string(),
                    }));
                    break;
                }
            }
            Frame::Subscribe { channel } if authed => {
                if let Some(client) = clients.lock().unwrap().get_mut(&id) {
                    client.prefix = Some(channel);
                }
            }
            Frame::Publish { channel, payload } if authed => {
                published.fetch_add(1, Ordering::SeqCst);
                let text = encode(&Frame::Message {
                    channel: channel.clone(),
                    payload,
                });
                for (other, client) in clients.lock().unwrap().iter() {
                    let subscribed = client
                        .prefix
                        .as_ref()
                        .is_some_and(|prefix| channel.starts_with(prefix.as_str()));
                    if *other != id && subscribed {
                        let _ = client.tx.send(text.clone());
                    }
                }
            }
            _ => break,
        }
    }

    clients.lock().unwrap().remove(&id);
    drop(tx);
    let _ = writer.await;
}
