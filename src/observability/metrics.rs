//! Metric definitions and recording helpers.
//!
//! # Metrics
//! - `rdvp_build_info` (gauge): 1, labelled with the crate version
//! - `rdvp_uptime_seconds` (gauge): seconds since start
//! - `rdvp_runtime_workers` / `rdvp_runtime_alive_tasks` (gauge): tokio runtime
//! - `rdvp_host_connections` (gauge): open host connections
//! - `rdvp_bandwidth_inbound_bytes_total` / `..._outbound_bytes_total`
//!   (counter): aggregate bytes, and per peer with a `peer` label
//!   (peers past the tracking limit share `peer="other"`)
//! - `rdvp_records` (gauge): stored registrations
//! - `rdvp_records_reclaimed_total` (counter): expired registrations swept
//! - `rdvp_rendezvous_requests_total` (counter): by `op`, `status`
//! - `rdvp_sync_events_total` (counter): by `driver`, `direction`, `kind`
//! - `rdvp_sync_events_dropped_total` (counter): by `driver`, `reason`
//! - `rdvp_relay_circuits_total` (counter): by `outcome`
//! - `rdvp_relay_active_circuits` / `rdvp_relay_reservations` (gauge)
//! - `rdvp_relay_bytes_total` (counter): bytes spliced through circuits
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Totals owned by other components (bandwidth, connections) are copied
//!   in at scrape time with `absolute`

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};

use crate::net::bandwidth::{BandwidthCounter, Totals, OTHER_PEERS};

/// Register descriptions for every metric.
pub fn describe() {
    describe_gauge!("rdvp_build_info", "Build information");
    describe_gauge!("rdvp_uptime_seconds", Unit::Seconds, "Time since the node started");
    describe_gauge!("rdvp_runtime_workers", "Tokio worker threads");
    describe_gauge!("rdvp_runtime_alive_tasks", "Tokio tasks alive");
    describe_gauge!("rdvp_host_connections", "Open host connections");
    describe_counter!(
        "rdvp_bandwidth_inbound_bytes_total",
        Unit::Bytes,
        "Bytes received by the host"
    );
    describe_counter!(
        "rdvp_bandwidth_outbound_bytes_total",
        Unit::Bytes,
        "Bytes sent by the host"
    );
    describe_gauge!("rdvp_records", "Stored rendezvous registrations");
    describe_counter!("rdvp_records_reclaimed_total", "Expired registrations removed");
    describe_counter!("rdvp_rendezvous_requests_total", "Rendezvous requests handled");
    describe_counter!("rdvp_sync_events_total", "Sync events published and received");
    describe_counter!("rdvp_sync_events_dropped_total", "Sync events dropped");
    describe_counter!("rdvp_relay_circuits_total", "Relay circuit attempts by outcome");
    describe_gauge!("rdvp_relay_active_circuits", "Relay circuits currently open");
    describe_gauge!("rdvp_relay_reservations", "Relay reservations currently held");
    describe_counter!("rdvp_relay_bytes_total", Unit::Bytes, "Bytes relayed through circuits");
}

pub fn record_build_info() {
    gauge!("rdvp_build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

pub fn record_uptime(uptime: Duration) {
    gauge!("rdvp_uptime_seconds").set(uptime.as_secs_f64());
}

/// Copy tokio runtime gauges from the current runtime.
pub fn record_runtime() {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let m = handle.metrics();
        gauge!("rdvp_runtime_workers").set(m.num_workers() as f64);
        gauge!("rdvp_runtime_alive_tasks").set(m.num_alive_tasks() as f64);
    }
}

pub fn record_connections(active: u64) {
    gauge!("rdvp_host_connections").set(active as f64);
}

/// Copy aggregate and per-peer byte totals.
pub fn record_bandwidth(bandwidth: &BandwidthCounter) {
    let totals = bandwidth.totals();
    counter!("rdvp_bandwidth_inbound_bytes_total").absolute(totals.inbound);
    counter!("rdvp_bandwidth_outbound_bytes_total").absolute(totals.outbound);
    for (peer, totals) in bandwidth.peers() {
        counter!("rdvp_bandwidth_inbound_bytes_total", "peer" => peer.clone()).absolute(totals.inbound);
        counter!("rdvp_bandwidth_outbound_bytes_total", "peer" => peer).absolute(totals.outbound);
    }
    let other = bandwidth.other_totals();
    if other != Totals::default() {
        counter!("rdvp_bandwidth_inbound_bytes_total", "peer" => OTHER_PEERS).absolute(other.inbound);
        counter!("rdvp_bandwidth_outbound_bytes_total", "peer" => OTHER_PEERS).absolute(other.outbound);
    }
}

pub fn record_store_size(records: usize) {
    gauge!("rdvp_records").set(records as f64);
}

pub fn record_reclaimed(count: usize) {
    counter!("rdvp_records_reclaimed_total").increment(count as u64);
}

pub fn record_rendezvous_request(op: &'static str, status: &'static str) {
    counter!("rdvp_rendezvous_requests_total", "op" => op, "status" => status).increment(1);
}

pub fn record_sync_event(driver: &str, direction: &'static str, kind: &'static str) {
    counter!(
        "rdvp_sync_events_total",
        "driver" => driver.to_string(),
        "direction" => direction,
        "kind" => kind
    )
    .increment(1);
}

pub fn record_sync_dropped(driver: &str, reason: &'static str) {
    counter!(
        "rdvp_sync_events_dropped_total",
        "driver" => driver.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_relay_circuit(outcome: &'static str) {
    counter!("rdvp_relay_circuits_total", "outcome" => outcome).increment(1);
}

pub fn record_relay_active(circuits: usize, reservations: usize) {
    gauge!("rdvp_relay_active_circuits").set(circuits as f64);
    gauge!("rdvp_relay_reservations").set(reservations as f64);
}

pub fn record_relay_bytes(bytes: u64) {
    counter!("rdvp_relay_bytes_total").increment(bytes);
}
