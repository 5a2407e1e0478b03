//! Splicing two raw streams into a circuit.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::limits::DataBudget;
use super::RelayError;
use crate::net::RawStream;
use crate::observability::metrics;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// How a circuit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEnd {
    /// Both sides closed their write halves.
    Closed,
    /// The relay is stopping.
    Cancelled,
}

/// Forward bytes between `a` and `b` until both sides finish, a limit is
/// hit, or `token` fires.
pub(crate) async fn splice(
    circuit: Uuid,
    a: RawStream,
    b: RawStream,
    budget: &DataBudget,
    max_duration: Option<Duration>,
    token: &CancellationToken,
) -> Result<CircuitEnd, RelayError> {
    let (a_read, a_write) = tokio::io::split(a.io);
    let (b_read, b_write) = tokio::io::split(b.io);

    let forward = pump(a_read, b_write, a.leftover, budget);
    let backward = pump(b_read, a_write, b.leftover, budget);
    let both = async { tokio::try_join!(forward, backward) };

    let deadline = async {
        match max_duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = both => {
            let (up, down) = result?;
            tracing::debug!(%circuit, up, down, "Circuit closed");
            Ok(CircuitEnd::Closed)
        }
        _ = deadline => Err(RelayError::ResourceExceeded(format!(
            "circuit exceeded its {:?} lifetime",
            max_duration.unwrap_or_default()
        ))),
        _ = token.cancelled() => Ok(CircuitEnd::Cancelled),
    }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    leftover: BytesMut,
    budget: &DataBudget,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    if !leftover.is_empty() {
        budget.charge(leftover.len() as u64)?;
        writer.write_all(&leftover).await?;
        total += leftover.len() as u64;
        metrics::record_relay_bytes(leftover.len() as u64);
    }

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // half-close so the other side sees EOF
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        budget.charge(n as u64)?;
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        metrics::record_relay_bytes(n as u64);
    }
}
