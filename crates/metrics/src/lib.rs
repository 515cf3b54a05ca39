//! Metrics and tracing setup for dotkv.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a dotkv node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Client operation counters ──
    pub kv_gets: IntCounter,
    pub kv_puts: IntCounter,
    pub kv_deletes: IntCounter,
    pub kv_timeouts: IntCounter,

    // ── Client operation latency ──
    pub kv_latency_secs: HistogramVec,

    // ── Convergence counters ──
    pub read_repairs: IntCounter,
    pub keys_repaired: IntCounter,
    pub exchanges: IntCounter,
    pub exchanges_skipped: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for client-op latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let kv_gets = IntCounter::with_opts(Opts::new("dotkv_kv_gets_total", "KV GET operations"))
            .expect("kv_gets counter");
        let kv_puts = IntCounter::with_opts(Opts::new("dotkv_kv_puts_total", "KV PUT operations"))
            .expect("kv_puts counter");
        let kv_deletes =
            IntCounter::with_opts(Opts::new("dotkv_kv_deletes_total", "KV DELETE operations"))
                .expect("kv_deletes counter");
        let kv_timeouts = IntCounter::with_opts(Opts::new(
            "dotkv_kv_timeouts_total",
            "Client operations that timed out",
        ))
        .expect("kv_timeouts counter");

        let kv_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "dotkv_kv_latency_seconds",
                "KV operation latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["op_type"],
        )
        .expect("kv_latency_secs histogram");

        let read_repairs = IntCounter::with_opts(Opts::new(
            "dotkv_read_repairs_total",
            "Read repair rounds dispatched by get coordinators",
        ))
        .expect("read_repairs counter");
        let keys_repaired = IntCounter::with_opts(Opts::new(
            "dotkv_keys_repaired_total",
            "Stale replica objects overwritten by repair",
        ))
        .expect("keys_repaired counter");
        let exchanges = IntCounter::with_opts(Opts::new(
            "dotkv_exchanges_total",
            "Anti-entropy exchanges completed",
        ))
        .expect("exchanges counter");
        let exchanges_skipped = IntCounter::with_opts(Opts::new(
            "dotkv_exchanges_skipped_total",
            "Anti-entropy ticks skipped (busy pair, missing tokens, tree not built)",
        ))
        .expect("exchanges_skipped counter");

        for collector in [
            Box::new(kv_gets.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(kv_puts.clone()),
            Box::new(kv_deletes.clone()),
            Box::new(kv_timeouts.clone()),
            Box::new(read_repairs.clone()),
            Box::new(keys_repaired.clone()),
            Box::new(exchanges.clone()),
            Box::new(exchanges_skipped.clone()),
        ] {
            registry.register(collector).expect("register counter");
        }
        registry
            .register(Box::new(kv_latency_secs.clone()))
            .expect("register kv_latency_secs");

        Self {
            registry,
            kv_gets,
            kv_puts,
            kv_deletes,
            kv_timeouts,
            kv_latency_secs,
            read_repairs,
            keys_repaired,
            exchanges,
            exchanges_skipped,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start a KV operation latency timer. Returns a guard that
/// records elapsed time on drop.
pub fn start_kv_timer(op_type: &str) -> prometheus::HistogramTimer {
    metrics()
        .kv_latency_secs
        .with_label_values(&[op_type])
        .start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
