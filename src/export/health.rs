use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::transport::TransportStatsSnapshot;

const NAMESPACE: &str = "backhaul";

/// Prometheus metrics for agent health.
///
/// All metrics use the "backhaul" namespace. Per-source series carry a
/// `source` label.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Messages written to the backend.
    pub messages_sent: CounterVec,
    /// Payload bytes written to the backend, terminators included.
    pub bytes_sent: CounterVec,
    /// Messages dropped after exhausting send retries.
    pub messages_lost: CounterVec,
    /// Messages dropped by the realtime backlog handler or a failed drain.
    pub messages_discarded: CounterVec,
    /// Connection attempts to the backend.
    pub connect_attempts: CounterVec,
    /// Poll cycles completed.
    pub cycles: CounterVec,
    /// Fetches that failed outright.
    pub fetch_failures: CounterVec,
    /// Messages waiting in each transport queue.
    pub queue_depth: GaugeVec,
    /// Pollers currently running.
    pub pollers_running: Gauge,
    /// Pollers that have finished.
    pub pollers_finished: Gauge,
}

fn counter_vec(name: &str, help: &str) -> Result<CounterVec> {
    Ok(CounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        &["source"],
    )?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let messages_sent = counter_vec("messages_sent_total", "Messages written to the backend.")?;
        let bytes_sent = counter_vec("bytes_sent_total", "Bytes written to the backend.")?;
        let messages_lost = counter_vec(
            "messages_lost_total",
            "Messages dropped after exhausting send retries.",
        )?;
        let messages_discarded = counter_vec(
            "messages_discarded_total",
            "Queued messages discarded without being sent.",
        )?;
        let connect_attempts =
            counter_vec("connect_attempts_total", "Connection attempts to the backend.")?;
        let cycles = counter_vec("cycles_total", "Poll cycles completed.")?;
        let fetch_failures = counter_vec("fetch_failures_total", "Source fetches that failed.")?;
        let queue_depth = GaugeVec::new(
            Opts::new("queue_depth", "Messages waiting in the transport queue.")
                .namespace(NAMESPACE),
            &["source"],
        )?;
        let pollers_running = Gauge::with_opts(
            Opts::new("pollers_running", "Pollers currently running.").namespace(NAMESPACE),
        )?;
        let pollers_finished = Gauge::with_opts(
            Opts::new("pollers_finished", "Pollers that have finished.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;
        registry.register(Box::new(messages_lost.clone()))?;
        registry.register(Box::new(messages_discarded.clone()))?;
        registry.register(Box::new(connect_attempts.clone()))?;
        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(fetch_failures.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(pollers_running.clone()))?;
        registry.register(Box::new(pollers_finished.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            messages_sent,
            bytes_sent,
            messages_lost,
            messages_discarded,
            connect_attempts,
            cycles,
            fetch_failures,
            queue_depth,
            pollers_running,
            pollers_finished,
        })
    }

    /// Add transport counter increments for `source`.
    pub fn record_transport(&self, source: &str, delta: &TransportStatsSnapshot) {
        let add = |vec: &CounterVec, n: u64| {
            if n > 0 {
                vec.with_label_values(&[source]).inc_by(n as f64);
            }
        };
        add(&self.messages_sent, delta.messages_sent);
        add(&self.bytes_sent, delta.bytes_sent);
        add(&self.messages_lost, delta.messages_lost);
        add(&self.messages_discarded, delta.messages_discarded);
        add(&self.connect_attempts, delta.connect_attempts);
    }

    pub fn record_cycles(&self, source: &str, cycles: u64, fetch_failures: u64) {
        if cycles > 0 {
            self.cycles.with_label_values(&[source]).inc_by(cycles as f64);
        }
        if fetch_failures > 0 {
            self.fetch_failures
                .with_label_values(&[source])
                .inc_by(fetch_failures as f64);
        }
    }

    /// Registry backing `/metrics`.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9464"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

fn render(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metric families")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
