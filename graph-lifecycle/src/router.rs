use axum::extract::State;
use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::health::{HealthProbe, HealthReport};
use crate::metrics::{track_metrics, MetricsBridge};

#[derive(Clone)]
pub struct AppState {
    pub client: String,
    pub probe: HealthProbe,
    pub bridge: MetricsBridge,
    pub recorder: Option<PrometheusHandle>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(readiness))
        .route("/_liveness", routing::get(liveness))
        .route("/metrics", routing::get(metrics))
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "graph lifecycle"
}

async fn liveness() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<AppState>) -> HealthReport {
    state.probe.report(&state.client).await
}

async fn metrics(State(state): State<AppState>) -> String {
    let Some(recorder) = &state.recorder else {
        return "no metrics recorder installed".to_owned();
    };
    state.bridge.publish(&state.client);
    recorder.render()
}
