//! Shutdown coordination for the node.

use tokio_util::sync::CancellationToken;

/// Coordinator for graceful shutdown.
///
/// Wraps the single process-wide cancellation source. Every long-running
/// task gets a child token; triggering the root cancels all of them.
/// Triggering more than once is a no-op.
#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("Shutdown triggered");
        }
        self.token.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_cancels_subscribers() {
        let shutdown = Shutdown::new();
        let a = shutdown.subscribe();
        let b = shutdown.subscribe();
        assert!(!a.is_cancelled());

        shutdown.trigger();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(shutdown.is_triggered());

        // Second trigger is a no-op.
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn test_child_cancel_does_not_propagate_up() {
        let shutdown = Shutdown::new();
        let child = shutdown.subscribe();
        child.cancel();
        assert!(!shutdown.is_triggered());
    }
}
