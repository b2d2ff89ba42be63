use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::bind_addr;

const NAMESPACE: &str = "hindsight";

/// Prometheus metrics for every role.
///
/// All metrics use the "hindsight" namespace. A process registers the full
/// set; each role only moves its own.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,

    // === Agent ===
    /// Completed buffers received from the buffer transport.
    pub buffers_received: Counter,
    /// Completed-buffer batches received from the buffer transport.
    pub complete_batches: Counter,
    /// Buffers handed to the reporting sender.
    pub buffers_reported: Counter,
    /// Buffers evicted by cache state (untriggered/triggered).
    pub buffers_evicted: CounterVec,
    /// Accepted triggers by source (local/remote).
    pub triggers: CounterVec,
    /// Refused triggers by reason (rate_limit/queue_limit).
    pub triggers_dropped: CounterVec,
    /// Items dropped on full channels, by kind.
    pub channel_dropped: CounterVec,
    /// Buffers currently cached, by state (untriggered/triggered).
    pub cache_buffers: GaugeVec,
    /// Age of the most recently evicted untriggered trace.
    pub event_horizon_seconds: Gauge,
    /// Mean buffers per completed batch over the last interval.
    pub mean_batch_size: Gauge,
    /// Per-queue share of triggered buffers evicted rather than reported.
    pub queue_eviction_percent: GaugeVec,
    /// Per-queue reported buffers per second.
    pub queue_reported_rate: GaugeVec,
    /// Per-queue evicted buffers per second.
    pub queue_evicted_rate: GaugeVec,
    /// Failed batch sends to the collector.
    pub reporting_errors: Counter,

    // === Coordinator ===
    /// Requests applied to the dissemination graph, by kind.
    pub coordinator_requests: CounterVec,
    /// Traces tracked by the coordinator.
    pub coordinator_traces: Gauge,
    /// Triggers tracked by the coordinator.
    pub coordinator_triggers: Gauge,
    /// Triggers expired from the coordinator.
    pub finished_triggers: Counter,
    /// Dissemination time of expired triggers (1ms-60s buckets).
    pub dissemination_duration: Histogram,

    // === Collector ===
    /// Buffers received by the collector.
    pub collector_buffers: Counter,
    /// Payload bytes received by the collector.
    pub collector_bytes: Counter,
    /// Open agent connections.
    pub collector_connections: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Agent ===
        let buffers_received = Counter::with_opts(
            Opts::new(
                "buffers_received_total",
                "Completed buffers received from the buffer transport.",
            )
            .namespace(NAMESPACE),
        )?;
        let complete_batches = Counter::with_opts(
            Opts::new(
                "complete_batches_total",
                "Completed-buffer batches received from the buffer transport.",
            )
            .namespace(NAMESPACE),
        )?;
        let buffers_reported = Counter::with_opts(
            Opts::new(
                "buffers_reported_total",
                "Buffers handed to the reporting sender.",
            )
            .namespace(NAMESPACE),
        )?;
        let buffers_evicted = CounterVec::new(
            Opts::new("buffers_evicted_total", "Buffers evicted by cache state.")
                .namespace(NAMESPACE),
            &["state"],
        )?;
        let triggers = CounterVec::new(
            Opts::new("triggers_total", "Accepted triggers by source.").namespace(NAMESPACE),
            &["source"],
        )?;
        let triggers_dropped = CounterVec::new(
            Opts::new("triggers_dropped_total", "Refused triggers by reason.")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let channel_dropped = CounterVec::new(
            Opts::new(
                "channel_dropped_total",
                "Items dropped because a bounded channel was full.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let cache_buffers = GaugeVec::new(
            Opts::new("cache_buffers", "Buffers currently cached by state.").namespace(NAMESPACE),
            &["state"],
        )?;
        let event_horizon_seconds = Gauge::with_opts(
            Opts::new(
                "event_horizon_seconds",
                "Age of the most recently evicted untriggered trace.",
            )
            .namespace(NAMESPACE),
        )?;
        let mean_batch_size = Gauge::with_opts(
            Opts::new(
                "mean_batch_size",
                "Mean buffers per completed batch over the last interval.",
            )
            .namespace(NAMESPACE),
        )?;
        let queue_eviction_percent = GaugeVec::new(
            Opts::new(
                "queue_eviction_percent",
                "Share of triggered buffers evicted rather than reported.",
            )
            .namespace(NAMESPACE),
            &["queue"],
        )?;
        let queue_reported_rate = GaugeVec::new(
            Opts::new(
                "queue_reported_buffers_per_second",
                "Reported buffers per second by queue.",
            )
            .namespace(NAMESPACE),
            &["queue"],
        )?;
        let queue_evicted_rate = GaugeVec::new(
            Opts::new(
                "queue_evicted_buffers_per_second",
                "Evicted buffers per second by queue.",
            )
            .namespace(NAMESPACE),
            &["queue"],
        )?;
        let reporting_errors = Counter::with_opts(
            Opts::new(
                "reporting_errors_total",
                "Failed batch sends to the collector.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Coordinator ===
        let coordinator_requests = CounterVec::new(
            Opts::new(
                "coordinator_requests_total",
                "Requests applied to the dissemination graph by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let coordinator_traces = Gauge::with_opts(
            Opts::new("coordinator_traces", "Traces tracked by the coordinator.")
                .namespace(NAMESPACE),
        )?;
        let coordinator_triggers = Gauge::with_opts(
            Opts::new("coordinator_triggers", "Triggers tracked by the coordinator.")
                .namespace(NAMESPACE),
        )?;
        let finished_triggers = Counter::with_opts(
            Opts::new(
                "finished_triggers_total",
                "Triggers expired from the coordinator.",
            )
            .namespace(NAMESPACE),
        )?;
        let dissemination_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dissemination_duration_seconds",
                "Time between a trigger's creation and its last update.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
        )?;

        // === Collector ===
        let collector_buffers = Counter::with_opts(
            Opts::new(
                "collector_buffers_total",
                "Buffers received by the collector.",
            )
            .namespace(NAMESPACE),
        )?;
        let collector_bytes = Counter::with_opts(
            Opts::new(
                "collector_bytes_total",
                "Payload bytes received by the collector.",
            )
            .namespace(NAMESPACE),
        )?;
        let collector_connections = Gauge::with_opts(
            Opts::new("collector_connections", "Open agent connections.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(buffers_received.clone()))?;
        registry.register(Box::new(complete_batches.clone()))?;
        registry.register(Box::new(buffers_reported.clone()))?;
        registry.register(Box::new(buffers_evicted.clone()))?;
        registry.register(Box::new(triggers.clone()))?;
        registry.register(Box::new(triggers_dropped.clone()))?;
        registry.register(Box::new(channel_dropped.clone()))?;
        registry.register(Box::new(cache_buffers.clone()))?;
        registry.register(Box::new(event_horizon_seconds.clone()))?;
        registry.register(Box::new(mean_batch_size.clone()))?;
        registry.register(Box::new(queue_eviction_percent.clone()))?;
        registry.register(Box::new(queue_reported_rate.clone()))?;
        registry.register(Box::new(queue_evicted_rate.clone()))?;
        registry.register(Box::new(reporting_errors.clone()))?;
        registry.register(Box::new(coordinator_requests.clone()))?;
        registry.register(Box::new(coordinator_traces.clone()))?;
        registry.register(Box::new(coordinator_triggers.clone()))?;
        registry.register(Box::new(finished_triggers.clone()))?;
        registry.register(Box::new(dissemination_duration.clone()))?;
        registry.register(Box::new(collector_buffers.clone()))?;
        registry.register(Box::new(collector_bytes.clone()))?;
        registry.register(Box::new(collector_connections.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            buffers_received,
            complete_batches,
            buffers_reported,
            buffers_evicted,
            triggers,
            triggers_dropped,
            channel_dropped,
            cache_buffers,
            event_horizon_seconds,
            mean_batch_size,
            queue_eviction_percent,
            queue_reported_rate,
            queue_evicted_rate,
            reporting_errors,
            coordinator_requests,
            coordinator_traces,
            coordinator_triggers,
            finished_triggers,
            dissemination_duration,
            collector_buffers,
            collector_bytes,
            collector_connections,
        })
    }

    /// Starts the HTTP server for /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };
        let bind = bind_addr(addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("listening on {bind}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.local_addr.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
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

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Stops the HTTP server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Prometheus text encoding of every registered metric.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("metrics are not utf-8")
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered_under_namespace() {
        let health = HealthMetrics::new(":0").unwrap();
        health.buffers_received.inc_by(3.0);
        health.triggers.with_label_values(&["local"]).inc();
        health.cache_buffers.with_label_values(&["triggered"]).set(7.0);

        let text = health.encode().unwrap();
        assert!(text.contains("hindsight_buffers_received_total 3"));
        assert!(text.contains("hindsight_triggers_total{source=\"local\"} 1"));
        assert!(text.contains("hindsight_cache_buffers{state=\"triggered\"} 7"));
    }

    #[tokio::test]
    async fn test_server_serves_healthz() {
        let health = HealthMetrics::new("127.0.0.1:0").unwrap();
        health.start().await.unwrap();
        let addr = health.local_addr().unwrap();

        let body = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        health.stop().await.unwrap();
    }
}
