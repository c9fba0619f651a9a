use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "event_rollup";

/// Prometheus metrics for service health and observability.
///
/// All metrics use the "event_rollup" namespace. Organized by stage:
/// - Scan: events read, aggregated and dropped, scan lifecycle
/// - Backlog: discovery passes and queue depth
/// - Flush: sink writes and table size
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Scan ===
    /// Total raw events read from source collections.
    pub events_scanned: Counter,
    /// Total raw events applied to the accumulator table.
    pub events_aggregated: Counter,
    /// Total raw events dropped because their version did not resolve.
    pub events_unresolved: Counter,
    /// Total accumulator updates rejected for a value kind mismatch.
    pub kind_mismatches: Counter,
    /// Total scans started.
    pub scans_started: Counter,
    /// Finished scans by result (ok/failed/cancelled).
    pub scans_finished: CounterVec,
    /// Scans currently holding an admission permit.
    pub scans_running: Gauge,
    /// Wall time of one collection scan.
    pub scan_duration: Histogram,

    // === Backlog ===
    /// Collections waiting for a scanner.
    pub backlog_length: Gauge,
    /// Total discovery passes completed.
    pub discovery_passes: Counter,
    /// Discovery errors by stage (list/count).
    pub discovery_errors: CounterVec,

    // === Flush ===
    /// Total flushes of the accumulator table.
    pub flushes: Counter,
    /// Wall time of one flush.
    pub flush_duration: Histogram,
    /// Flushed entries by result (inserted/updated/failed).
    pub flush_entries: CounterVec,
    /// Entries in the accumulator table.
    pub accumulator_entries: Gauge,
    /// Versions in the dimension cache.
    pub dimension_cache_entries: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Scan ===
        let events_scanned = Counter::with_opts(
            Opts::new(
                "events_scanned_total",
                "Total raw events read from source collections.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_aggregated = Counter::with_opts(
            Opts::new(
                "events_aggregated_total",
                "Total raw events applied to the accumulator table.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_unresolved = Counter::with_opts(
            Opts::new(
                "events_unresolved_total",
                "Total raw events dropped because their version has no game or customer.",
            )
            .namespace(NAMESPACE),
        )?;
        let kind_mismatches = Counter::with_opts(
            Opts::new(
                "kind_mismatches_total",
                "Total accumulator updates rejected for a value kind mismatch.",
            )
            .namespace(NAMESPACE),
        )?;
        let scans_started = Counter::with_opts(
            Opts::new("scans_started_total", "Total collection scans started.")
                .namespace(NAMESPACE),
        )?;
        let scans_finished = CounterVec::new(
            Opts::new(
                "scans_finished_total",
                "Total collection scans finished by result.",
            )
            .namespace(NAMESPACE),
            &["result"],
        )?;
        let scans_running = Gauge::with_opts(
            Opts::new("scans_running", "Collection scans currently running.")
                .namespace(NAMESPACE),
        )?;
        let scan_duration = Histogram::with_opts(
            HistogramOpts::new("scan_duration_seconds", "Wall time of one collection scan.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
        )?;

        // === Backlog ===
        let backlog_length = Gauge::with_opts(
            Opts::new("backlog_length", "Collections waiting for a scanner.")
                .namespace(NAMESPACE),
        )?;
        let discovery_passes = Counter::with_opts(
            Opts::new(
                "discovery_passes_total",
                "Total backlog discovery passes completed.",
            )
            .namespace(NAMESPACE),
        )?;
        let discovery_errors = CounterVec::new(
            Opts::new(
                "discovery_errors_total",
                "Total backlog discovery errors by stage.",
            )
            .namespace(NAMESPACE),
            &["stage"],
        )?;

        // === Flush ===
        let flushes = Counter::with_opts(
            Opts::new("flushes_total", "Total accumulator table flushes.").namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new("flush_duration_seconds", "Wall time of one table flush.")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let flush_entries = CounterVec::new(
            Opts::new(
                "flush_entries_total",
                "Total flushed accumulator entries by result.",
            )
            .namespace(NAMESPACE),
            &["result"],
        )?;
        let accumulator_entries = Gauge::with_opts(
            Opts::new("accumulator_entries", "Entries in the accumulator table.")
                .namespace(NAMESPACE),
        )?;
        let dimension_cache_entries = Gauge::with_opts(
            Opts::new(
                "dimension_cache_entries",
                "Versions loaded into the dimension cache.",
            )
            .namespace(NAMESPACE),
        )?;

        // Register all metrics with the custom registry.
        // Scan
        registry.register(Box::new(events_scanned.clone()))?;
        registry.register(Box::new(events_aggregated.clone()))?;
        registry.register(Box::new(events_unresolved.clone()))?;
        registry.register(Box::new(kind_mismatches.clone()))?;
        registry.register(Box::new(scans_started.clone()))?;
        registry.register(Box::new(scans_finished.clone()))?;
        registry.register(Box::new(scans_running.clone()))?;
        registry.register(Box::new(scan_duration.clone()))?;

        // Backlog
        registry.register(Box::new(backlog_length.clone()))?;
        registry.register(Box::new(discovery_passes.clone()))?;
        registry.register(Box::new(discovery_errors.clone()))?;

        // Flush
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(flush_entries.clone()))?;
        registry.register(Box::new(accumulator_entries.clone()))?;
        registry.register(Box::new(dimension_cache_entries.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_scanned,
            events_aggregated,
            events_unresolved,
            kind_mismatches,
            scans_started,
            scans_finished,
            scans_running,
            scan_duration,
            backlog_length,
            discovery_passes,
            discovery_errors,
            flushes,
            flush_duration,
            flush_entries,
            accumulator_entries,
            dimension_cache_entries,
        })
    }

    /// Renders every registered metric in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

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

        Ok(local_addr)
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

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
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
