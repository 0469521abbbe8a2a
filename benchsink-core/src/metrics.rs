use std::sync::OnceLock;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, error};

use crate::error::{Error, Result};

// Label identifying the output instance.
const OUTPUT_LABEL: &str = "output";

// Note: We do not add a suffix to the metric name, as the suffix is inferred through the metric type
// by the prometheus client library (counters get `_total`).
// Note: Please keep these names stable, dashboards depend on them.
const RUNNING: &str = "output_bench_running";
const COUNT_TOTAL: &str = "output_bench_count";
const SUCCESS_TOTAL: &str = "output_bench_success";
const ERROR_TOTAL: &str = "output_bench_error";
const LATENCY: &str = "output_bench_latency";

/// The global register of all metrics.
#[derive(Default)]
pub struct GlobalRegistry {
    // It is okay to use a sync mutex because we register each metric only one time.
    pub registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::default()),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// OutputMetrics holds the metric families updated by the consume loop. Every family is keyed by
/// the `output` label so multiple outputs can share the registry.
pub struct OutputMetrics {
    // gauge
    pub running: Family<Vec<(String, String)>, Gauge>,

    // counters
    pub count: Family<Vec<(String, String)>, Counter>,
    pub success: Family<Vec<(String, String)>, Counter>,
    pub error: Family<Vec<(String, String)>, Counter>,

    // timers
    pub latency: Family<Vec<(String, String)>, Histogram>,
}

impl OutputMetrics {
    fn new() -> Self {
        let metrics = Self {
            running: Family::<Vec<(String, String)>, Gauge>::default(),
            count: Family::<Vec<(String, String)>, Counter>::default(),
            success: Family::<Vec<(String, String)>, Counter>::default(),
            error: Family::<Vec<(String, String)>, Counter>::default(),
            // 100us up to 15 minutes
            latency: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(100.0, 60000000.0 * 15.0, 10))
            }),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            RUNNING,
            "A Gauge of the number of consume loops currently running",
            metrics.running.clone(),
        );
        registry.register(
            COUNT_TOTAL,
            "A Counter to keep track of the total number of messages accepted from upstream",
            metrics.count.clone(),
        );
        registry.register(
            SUCCESS_TOTAL,
            "A Counter to keep track of the total number of messages that reached acknowledgment",
            metrics.success.clone(),
        );
        registry.register(
            ERROR_TOTAL,
            "A Counter to keep track of the total number of messages a record could not be derived from",
            metrics.error.clone(),
        );
        registry.register(
            LATENCY,
            "A Histogram to keep track of the latency carried by derived records, in microseconds",
            metrics.latency.clone(),
        );
        metrics
    }
}

static OUTPUT_METRICS: OnceLock<OutputMetrics> = OnceLock::new();

/// output_metrics is a helper function used to fetch the OutputMetrics object.
pub(crate) fn output_metrics() -> &'static OutputMetrics {
    OUTPUT_METRICS.get_or_init(OutputMetrics::new)
}

/// Labels for the output with the given name.
pub(crate) fn output_metrics_labels(name: &str) -> Vec<(String, String)> {
    vec![(OUTPUT_LABEL.to_string(), name.to_string())]
}

/// metrics_handler returns a snapshot of the global registry in the prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    // make sure the families are registered even before the first output starts.
    let _ = output_metrics();

    let mut buffer = String::new();
    let encoded = {
        let registry = global_registry().registry.lock();
        encode(&mut buffer, &registry)
    };
    if let Err(e) = encoded {
        error!(?e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    debug!("Exposing Metrics: {:?}", buffer);
    (StatusCode::OK, Body::from(buffer)).into_response()
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

/// Serves the metrics over plain HTTP until the listener fails.
pub async fn start_metrics_http_server<A>(addr: A) -> Result<()>
where
    A: ToSocketAddrs + std::fmt::Debug,
{
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Metrics(format!("Creating listener on {:?}: {}", addr, e)))?;

    debug!("metrics server started at addr: {:?}", addr);

    axum::serve(listener, metrics_router())
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn test_metrics_handler() {
        let labels = output_metrics_labels("metrics-handler-test");
        output_metrics().count.get_or_create(&labels).inc();

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("output_bench_count_total{output=\"metrics-handler-test\"} 1"));
        assert!(body.contains("# TYPE output_bench_running gauge"));
        assert!(body.contains("# TYPE output_bench_latency histogram"));
    }

    #[tokio::test]
    async fn test_livez() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_start_metrics_http_server_addr_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let result = start_metrics_http_server(addr).await;
        assert!(matches!(result, Err(Error::Metrics(_))));
    }
}
