//! Broker replication between nodes.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use rdvp::identity::PeerId;
use rdvp::rendezvous::{RendezvousRequest, RendezvousResponse};
use rdvp::store::RecordStore;
use rdvp::sync::{BrokerConfig, BrokerDriver, SyncDriver, SyncError};
use rdvp::{Node, NodeError};

async fn has_record(store: &RecordStore, namespace: &str, peer: &PeerId) -> bool {
    matches!(store.get(namespace, peer), Ok(Some(_)))
}

async fn lacks_record(store: &RecordStore, namespace: &str, peer: &PeerId) -> bool {
    matches!(store.get(namespace, peer), Ok(None))
}

#[tokio::test]
async fn test_registration_replicates_between_nodes() {
    let broker = start_broker("secret").await;
    let a = start_node(with_broker(node_config(), &broker.url(), "secret")).await;
    let b = start_node(with_broker(node_config(), &broker.url(), "secret")).await;
    let peer = random_peer();

    let reply = rendezvous(a.addr, &register("games", &peer, Some(120))).await;
    assert!(matches!(reply, RendezvousResponse::Registered { .. }));

    let store = b.store.clone();
    assert!(wait_until(Duration::from_secs(5), || has_record(&store, "games", &peer)).await);

    match rendezvous(b.addr, &discover("games")).await {
        RendezvousResponse::Discovered { records, .. } => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].peer, peer);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    let unregister = RendezvousRequest::Unregister {
        namespace: "games".to_string(),
        peer: peer.to_string(),
    };
    assert_eq!(
        rendezvous(a.addr, &unregister).await,
        RendezvousResponse::Unregistered
    );
    let store = b.store.clone();
    assert!(wait_until(Duration::from_secs(5), || lacks_record(&store, "games", &peer)).await);

    // Events received from the broker are not published again.
    let published = broker.published.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.published.load(Ordering::SeqCst), published);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_sync_info_lists_broker() {
    let broker = start_broker("secret").await;
    let mut config = with_broker(node_config(), &broker.url(), "secret");
    config.sync.emitter.public_addr = Some("ws://broker.example:8080".to_string());
    let node = start_node(config).await;

    match rendezvous(node.addr, &RendezvousRequest::SyncInfo).await {
        RendezvousResponse::SyncInfo { endpoints } => {
            assert_eq!(endpoints.len(), 1);
            assert_eq!(endpoints[0].url, "ws://broker.example:8080");
        }
        other => panic!("unexpected reply {other:?}"),
    }
    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_wrong_admin_key_is_rejected() {
    let broker = start_broker("secret").await;
    let config = BrokerConfig::new(broker.url(), "wrong", random_peer().to_string());
    let driver = BrokerDriver::new(config).unwrap();

    let err = driver.connect().await.unwrap_err();
    match err {
        SyncError::Connect { reason, .. } => assert!(reason.contains("rejected")),
        other => panic!("unexpected error {other:?}"),
    }
    driver.close().await;
}

#[tokio::test]
async fn test_unreachable_broker_degrades_to_local_only() {
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", unused.local_addr().unwrap());
    drop(unused);

    let node = start_node(with_broker(node_config(), &url, "secret")).await;
    let peer = random_peer();
    let reply = rendezvous(node.addr, &register("local", &peer, None)).await;
    assert!(matches!(reply, RendezvousResponse::Registered { .. }));
    match rendezvous(node.addr, &discover("local")).await {
        RendezvousResponse::Discovered { records, .. } => assert_eq!(records.len(), 1),
        other => panic!("unexpected reply {other:?}"),
    }
    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_mandatory_broker_fails_startup() {
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", unused.local_addr().unwrap());
    drop(unused);

    let mut config = with_broker(node_config(), &url, "secret");
    config.sync.emitter.mandatory = true;
    match Node::build(config).await {
        Err(NodeError::Driver { source, .. }) => {
            assert!(matches!(source, SyncError::Connect { .. }))
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("startup should fail"),
    }
}
