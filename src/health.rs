//! Probe and metrics endpoints
//!
//! `/healthz` answers as long as the process runs, `/readyz` once the
//! controller has started, and `/metrics` serves the Prometheus registry.

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;

const LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Identifies a `PostgreSQL` object in metric labels
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

impl ClusterLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl EncodeLabelSet for ClusterLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Per-cluster operator metrics
pub struct Metrics {
    pub reconciliations: Family<ClusterLabels, Counter>,
    pub reconciliation_errors: Family<ClusterLabels, Counter>,
    pub reconcile_duration_seconds: Family<ClusterLabels, Histogram>,
    /// Primaries repointed after repmgr promoted a standby
    pub failovers: Family<ClusterLabels, Counter>,
    pub nodes_desired: Family<ClusterLabels, Gauge>,
    pub nodes_ready: Family<ClusterLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("repmgr_operator");

        let reconciliations = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "reconciliations",
            "Reconciliation passes that completed",
            reconciliations.clone(),
        );

        let reconciliation_errors = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "reconciliation_errors",
            "Reconciliation passes that returned an error",
            reconciliation_errors.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            });
        registry.register(
            "reconcile_duration_seconds",
            "Time spent in one reconciliation pass",
            reconcile_duration_seconds.clone(),
        );

        let failovers = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "failovers",
            "Failovers picked up from the repmgr catalog",
            failovers.clone(),
        );

        let nodes_desired = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "cluster_nodes_desired",
            "Nodes listed in the cluster spec",
            nodes_desired.clone(),
        );

        let nodes_ready = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "cluster_nodes_ready",
            "Spec nodes whose Deployment reports a ready replica",
            nodes_ready.clone(),
        );

        Self {
            reconciliations,
            reconciliation_errors,
            reconcile_duration_seconds,
            failovers,
            nodes_desired,
            nodes_ready,
            registry,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ClusterLabels::new(namespace, name);
        self.reconciliations.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors
            .get_or_create(&ClusterLabels::new(namespace, name))
            .inc();
    }

    pub fn record_failover(&self, namespace: &str, name: &str) {
        self.failovers
            .get_or_create(&ClusterLabels::new(namespace, name))
            .inc();
    }

    pub fn set_cluster_nodes(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = ClusterLabels::new(namespace, name);
        self.nodes_desired.get_or_create(&labels).set(desired);
        self.nodes_ready.get_or_create(&labels).set(ready);
    }

    fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// State shared between the controller and the HTTP handlers
#[derive(Default)]
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Metrics,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the probe and metrics endpoints until the listener fails
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(LISTEN_ADDR).await?;
    tracing::info!(addr = LISTEN_ADDR, "Health server listening");
    axum::serve(listener, create_router(state)).await
}
