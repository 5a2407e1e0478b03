//! Driver that replicates nothing.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Capability, EventHandler, SyncDriver, SyncError};
use crate::store::RendezvousRecord;

/// Accepts every call and does nothing. Used when no backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDriver;

impl NoopDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SyncDriver for NoopDriver {
    fn name(&self) -> &str {
        "noop"
    }

    fn capability(&self) -> Capability {
        Capability::Both
    }

    async fn connect(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn publish_upsert(&self, _record: &RendezvousRecord) -> Result<(), SyncError> {
        Ok(())
    }

    async fn publish_remove(&self, _record: &RendezvousRecord) -> Result<(), SyncError> {
        Ok(())
    }

    fn subscribe(&self, _handler: EventHandler) {}

    async fn run(&self, token: CancellationToken) -> Result<(), SyncError> {
        token.cancelled().await;
        Ok(())
    }

    async fn close(&self) {}
}
