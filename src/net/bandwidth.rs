//! Byte accounting for host traffic.
//!
//! Every host connection is wrapped in a [`MeteredStream`] that adds the
//! bytes it moves to a shared [`BandwidthCounter`], in aggregate and, once
//! the remote peer has identified itself, per peer.
//!
//! The per-peer table holds at most `peer_limit` peers. Traffic of peers
//! seen after it filled up is counted under [`OTHER_PEERS`].

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Inbound/outbound byte totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub inbound: u64,
    pub outbound: u64,
}

#[derive(Debug, Default)]
struct Counters {
    inbound: AtomicU64,
    outbound: AtomicU64,
}

impl Counters {
    fn totals(&self) -> Totals {
        Totals {
            inbound: self.inbound.load(Ordering::Relaxed),
            outbound: self.outbound.load(Ordering::Relaxed),
        }
    }
}

/// Default size of the per-peer table.
pub const DEFAULT_PEER_LIMIT: usize = 1024;

/// Label reported for traffic of peers that did not fit the table.
pub const OTHER_PEERS: &str = "other";

/// Aggregate and per-peer byte counters.
#[derive(Debug)]
pub struct BandwidthCounter {
    total: Counters,
    peers: DashMap<String, Counters>,
    other: Counters,
    peer_limit: usize,
}

impl Default for BandwidthCounter {
    fn default() -> Self {
        Self::with_peer_limit(DEFAULT_PEER_LIMIT)
    }
}

impl BandwidthCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter tracking at most `peer_limit` distinct peers.
    pub fn with_peer_limit(peer_limit: usize) -> Self {
        Self {
            total: Counters::default(),
            peers: DashMap::new(),
            other: Counters::default(),
            peer_limit,
        }
    }

    pub fn record_inbound(&self, peer: Option<&str>, bytes: u64) {
        self.total.inbound.fetch_add(bytes, Ordering::Relaxed);
        if let Some(peer) = peer {
            self.with_peer(peer, |c| c.inbound.fetch_add(bytes, Ordering::Relaxed));
        }
    }

    pub fn record_outbound(&self, peer: Option<&str>, bytes: u64) {
        self.total.outbound.fetch_add(bytes, Ordering::Relaxed);
        if let Some(peer) = peer {
            self.with_peer(peer, |c| c.outbound.fetch_add(bytes, Ordering::Relaxed));
        }
    }

    // Concurrent first sightings may overshoot the limit by a few entries.
    fn with_peer(&self, peer: &str, f: impl FnOnce(&Counters) -> u64) {
        if let Some(counters) = self.peers.get(peer) {
            f(counters.value());
        } else if self.peers.len() < self.peer_limit {
            f(self.peers.entry(peer.to_string()).or_default().value());
        } else {
            f(&self.other);
        }
    }

    /// Totals across every connection.
    pub fn totals(&self) -> Totals {
        self.total.totals()
    }

    pub fn peer_totals(&self, peer: &str) -> Option<Totals> {
        self.peers.get(peer).map(|c| c.totals())
    }

    /// Per-peer totals, unordered.
    pub fn peers(&self) -> Vec<(String, Totals)> {
        self.peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().totals()))
            .collect()
    }

    /// Totals of peers that did not fit the per-peer table.
    pub fn other_totals(&self) -> Totals {
        self.other.totals()
    }

    pub fn peer_limit(&self) -> usize {
        self.peer_limit
    }
}

/// I/O wrapper that counts every byte it reads or writes.
#[derive(Debug)]
pub struct MeteredStream<S> {
    inner: S,
    counter: Arc<BandwidthCounter>,
    peer: Arc<OnceLock<String>>,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, counter: Arc<BandwidthCounter>, peer: Arc<OnceLock<String>>) -> Self {
        Self {
            inner,
            counter,
            peer,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn peer(&self) -> Option<&str> {
        self.peer.get().map(String::as_str)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.counter.record_inbound(this.peer(), n as u64);
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            if n > 0 {
                this.counter.record_outbound(this.peer(), n as u64);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_counts_both_directions_and_attributes_peer() {
        let counter = Arc::new(BandwidthCounter::new());
        let peer = Arc::new(OnceLock::new());
        let (a, mut b) = tokio::io::duplex(64);
        let mut metered = MeteredStream::new(a, counter.clone(), peer.clone());

        metered.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();

        peer.set("peer-a".to_string()).unwrap();
        b.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        metered.read_exact(&mut buf).await.unwrap();

        assert_eq!(
            counter.totals(),
            Totals {
                inbound: 3,
                outbound: 5
            }
        );
        assert_eq!(
            counter.peer_totals("peer-a"),
            Some(Totals {
                inbound: 3,
                outbound: 0
            })
        );
        assert_eq!(counter.peers().len(), 1);
    }

    #[test]
    fn test_peer_table_is_bounded() {
        let counter = BandwidthCounter::with_peer_limit(2);
        for i in 0..10 {
            let peer = format!("peer-{i}");
            counter.record_inbound(Some(&peer), 10);
            counter.record_outbound(Some(&peer), 1);
        }
        counter.record_inbound(Some("peer-0"), 5);

        assert_eq!(counter.peers().len(), 2);
        assert_eq!(counter.peer_totals("peer-0").unwrap().inbound, 15);
        assert!(counter.peer_totals("peer-9").is_none());
        assert_eq!(
            counter.other_totals(),
            Totals {
                inbound: 80,
                outbound: 8
            }
        );
        assert_eq!(counter.totals().inbound, 105);
    }
}
