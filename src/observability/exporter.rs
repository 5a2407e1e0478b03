//! Prometheus endpoint.
//!
//! # Responsibilities
//! - Install the process-wide Prometheus recorder (once)
//! - Bind the metrics listener during assembly
//! - Serve `GET /metrics`, refreshing scrape-time gauges first
//!
//! # Design Decisions
//! - The listener is bound before the node starts so a bad address is
//!   reported early; the caller decides whether that is fatal
//! - Collectors are plain closures so the exporter knows nothing about
//!   the components it reports on

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::observability::metrics;

/// Deadline for a scrape request.
pub const SCRAPE_TIMEOUT: Duration = Duration::from_secs(3);

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Error type for the metrics exporter.
#[derive(Debug, thiserror::Error)]
pub enum ExporterError {
    #[error("cannot bind metrics listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("metrics server: {0}")]
    Serve(#[source] std::io::Error),
}

/// Install the Prometheus recorder, or return the one already installed.
pub fn install_recorder() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(e) = ::metrics::set_global_recorder(recorder) {
                tracing::warn!(error = %e, "Another metrics recorder is already installed");
            }
            metrics::describe();
            metrics::record_build_info();
            handle
        })
        .clone()
}

type Collector = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
struct ExporterState {
    handle: PrometheusHandle,
    collectors: Arc<Vec<Collector>>,
    started: Instant,
}

/// HTTP server for `/metrics`.
pub struct MetricsExporter {
    listener: TcpListener,
    handle: PrometheusHandle,
    collectors: Vec<Collector>,
    started: Instant,
}

impl MetricsExporter {
    /// Bind the metrics listener (`host:port`).
    pub async fn bind(addr: &str) -> Result<Self, ExporterError> {
        let bind_err = |source| ExporterError::Bind {
            addr: addr.to_string(),
            source,
        };
        let sock: SocketAddr = addr.parse().map_err(|e| {
            bind_err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        let listener = TcpListener::bind(sock).await.map_err(bind_err)?;

        Ok(Self {
            listener,
            handle: install_recorder(),
            collectors: Vec::new(),
            started: Instant::now(),
        })
    }

    /// Run `collector` before every scrape.
    pub fn with_collector(mut self, collector: impl Fn() + Send + Sync + 'static) -> Self {
        self.collectors.push(Arc::new(collector));
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[allow(deprecated)]
    fn router(state: ExporterState) -> Router {
        Router::new()
            .route("/metrics", get(render))
            .with_state(state)
            .layer(TimeoutLayer::new(SCRAPE_TIMEOUT))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `token` fires.
    pub async fn run(self, token: CancellationToken) -> Result<(), ExporterError> {
        let addr = self.listener.local_addr().map_err(ExporterError::Serve)?;
        let state = ExporterState {
            handle: self.handle,
            collectors: Arc::new(self.collectors),
            started: self.started,
        };

        tracing::info!(address = %addr, handler = "/metrics", "Metrics listener");

        axum::serve(self.listener, Self::router(state))
            .with_graceful_shutdown(token.cancelled_owned())
            .await
            .map_err(ExporterError::Serve)?;

        tracing::info!("Metrics listener stopped");
        Ok(())
    }
}

async fn render(State(state): State<ExporterState>) -> impl IntoResponse {
    for collect in state.collectors.iter() {
        collect();
    }
    metrics::record_uptime(state.started.elapsed());
    metrics::record_runtime();

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.handle.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        let err = MetricsExporter::bind("not an address").await.err().unwrap();
        assert!(matches!(err, ExporterError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = MetricsExporter::bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap().to_string();
        assert!(matches!(
            MetricsExporter::bind(&addr).await,
            Err(ExporterError::Bind { .. })
        ));
    }
}
