//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Number host connections for log correlation
//! - Count live connections for the metrics gauge
//! - Let the host wait for connections to drain on shutdown

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Sequence number of a connection within one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Live and total connection counts, shared by the host and its tasks.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<Counts>,
}

#[derive(Debug, Default)]
struct Counts {
    active: AtomicU64,
    total: AtomicU64,
    idle: Notify,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection from `remote`; it counts until the guard drops.
    pub fn track(&self, remote: SocketAddr) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let seq = self.inner.total.fetch_add(1, Ordering::Relaxed) + 1;
        ConnectionGuard {
            counts: Arc::clone(&self.inner),
            id: ConnectionId(seq),
            remote,
            opened: Instant::now(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Connections accepted since the host started.
    pub fn total_count(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Wait until every connection has closed. Returns false on timeout.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// One open connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    counts: Arc<Counts>,
    id: ConnectionId,
    remote: SocketAddr,
    opened: Instant,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.counts.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counts.idle.notify_waiters();
        }
        tracing::trace!(
            connection_id = %self.id,
            remote = %self.remote,
            duration_ms = self.opened.elapsed().as_millis() as u64,
            "Connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "127.0.0.1:4040".parse().unwrap()
    }

    #[test]
    fn test_ids_follow_accept_order() {
        let tracker = ConnectionTracker::new();
        let first = tracker.track(remote());
        let second = tracker.track(remote());
        assert!(first.id() < second.id());
        assert_eq!(first.id().to_string(), "conn-1");
        assert_eq!(second.remote(), remote());
    }

    #[test]
    fn test_guards_drive_the_counts() {
        let tracker = ConnectionTracker::new();
        let a = tracker.track(remote());
        let b = tracker.track(remote());
        assert_eq!(tracker.active_count(), 2);

        drop(a);
        assert_eq!(tracker.active_count(), 1);
        drop(b);
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.total_count(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_idle() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.wait_for_idle(Duration::from_millis(10)).await);

        let guard = tracker.track(remote());
        assert!(!tracker.wait_for_idle(Duration::from_millis(20)).await);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_idle(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }
}
