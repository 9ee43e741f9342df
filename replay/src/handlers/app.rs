use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing, Json, Router};
use ingest_common::metrics::track_metrics;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::coordinator::{ReplayCoordinator, Termination};

pub fn app(coordinator: Arc<ReplayCoordinator>, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(|| std::future::ready("ok")))
        .route("/replay", routing::post(replay))
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(coordinator)
}

pub async fn index() -> &'static str {
    "dead-letter replay"
}

/// Run one drain now, waiting for any drain already in progress to finish first.
async fn replay(State(coordinator): State<Arc<ReplayCoordinator>>) -> Response {
    match coordinator.drain().await {
        Ok(report) => {
            let status = match report.termination {
                Termination::Drained => StatusCode::OK,
                Termination::PullCapReached => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(report)).into_response()
        }
        Err(e) => e.into_response(),
    }
}
