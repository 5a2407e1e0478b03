//! Prometheus endpoint of a running node.

mod common;

use common::*;
use rdvp::rendezvous::RendezvousResponse;

#[tokio::test]
async fn test_metrics_report_node_activity() {
    let mut config = node_config();
    config.metrics.listen = Some("127.0.0.1:0".to_string());
    let node = start_node(config).await;
    let metrics = node.metrics.expect("metrics listener bound");

    let reply = rendezvous(node.addr, &register("metrics", &random_peer(), None)).await;
    assert!(matches!(reply, RendezvousResponse::Registered { .. }));

    let response = reqwest::get(format!("http://{metrics}/metrics")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("rdvp_bandwidth_inbound_bytes_total"));
    assert!(body.contains("rdvp_bandwidth_outbound_bytes_total"));
    assert!(body.contains("rdvp_records"));
    assert!(body.contains("rdvp_rendezvous_requests_total"));
    assert!(body.contains("rdvp_build_info"));

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_metrics_bind_failure_is_not_fatal() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = node_config();
    config.metrics.listen = Some(taken.local_addr().unwrap().to_string());

    let node = start_node(config).await;
    assert!(node.metrics.is_none());
    let reply = rendezvous(node.addr, &discover("anything")).await;
    assert!(matches!(reply, RendezvousResponse::Discovered { .. }));
    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let mut config = node_config();
    config.metrics.listen = Some("127.0.0.1:0".to_string());
    let node = start_node(config).await;
    let metrics = node.metrics.unwrap();

    let response = reqwest::get(format!("http://{metrics}/nope")).await.unwrap();
    assert_eq!(response.status(), 404);
    node.stop().await.unwrap();
}
