//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGINT (and SIGTERM on unix)
//! - Report the signal as a clean completion so the supervisor shuts down
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Runs as a supervised task; its token ends it when another task stops
//!   the node first

use tokio_util::sync::CancellationToken;

/// Which event ended [`wait_for_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Interrupt,
    Terminate,
    Cancelled,
}

/// Wait for a termination signal or for `token`.
pub async fn wait_for_signal(token: CancellationToken) -> std::io::Result<SignalOutcome> {
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminated = async move {
        terminate.recv().await;
    };
    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    let outcome = tokio::select! {
        _ = token.cancelled() => SignalOutcome::Cancelled,
        result = tokio::signal::ctrl_c() => {
            result?;
            SignalOutcome::Interrupt
        }
        _ = terminated => SignalOutcome::Terminate,
    };

    if outcome != SignalOutcome::Cancelled {
        tracing::info!(signal = ?outcome, "Shutdown signal received");
    }
    Ok(outcome)
}
