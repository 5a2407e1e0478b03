//! rdvp: rendezvous and relay node.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────────────┐
//!                  │                        NODE                           │
//!                  │                                                       │
//!   Peer stream    │  ┌────────┐   protocol    ┌────────────┐              │
//!   ───────────────┼─▶│  net   │──────────────▶│ rendezvous │──┐           │
//!                  │  │  host  │   dispatch    └────────────┘  │           │
//!                  │  └────────┘       │                       ▼           │
//!                  │                   │        ┌───────┐  ┌───────┐       │
//!                  │                   └───────▶│ relay │  │ store │       │
//!                  │                            └───────┘  └───┬───┘       │
//!                  │                                          │           │
//!                  │                                          ▼           │
//!                  │                                    ┌──────────┐      │   Broker
//!                  │                                    │   sync   │◀─────┼──────────▶
//!                  │                                    └──────────┘      │
//!                  │                                                       │
//!                  │  identity · config · observability · lifecycle        │
//!                  └──────────────────────────────────────────────────────┘
//! ```

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let invocation = match rdvp::cli::parse_from(std::env::args_os()) {
        Ok(invocation) => invocation,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(e.exit_code().clamp(0, 255) as u8);
        }
    };

    match invocation.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "rdvp failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
