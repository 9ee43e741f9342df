use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use ingest_common::metrics::{setup_metrics_recorder, track_metrics, with_metrics_route};
use ingest_common::time::TimeSource;
use tower_http::trace::TraceLayer;

use crate::batch::BatchAccumulator;
use crate::normalizer::Normalizer;
use crate::push_endpoint;
use crate::sampler::Sampler;

#[derive(Clone)]
pub struct State {
    pub accumulator: BatchAccumulator,
    pub sampler: Sampler,
    pub normalizer: Arc<dyn Normalizer + Send + Sync>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub wait_timeout: Duration,
}

async fn index() -> &'static str {
    "ingest"
}

pub fn router<
    TZ: TimeSource + Send + Sync + 'static,
    N: Normalizer + Send + Sync + 'static,
>(
    timesource: TZ,
    accumulator: BatchAccumulator,
    sampler: Sampler,
    normalizer: N,
    wait_timeout: Duration,
    metrics: bool,
) -> Router {
    let state = State {
        accumulator,
        sampler,
        normalizer: Arc::new(normalizer),
        timesource: Arc::new(timesource),
        wait_timeout,
    };

    let router = Router::new()
        .route("/", get(index).post(push_endpoint::push))
        .route("/push", post(push_endpoint::push))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when ingest is used as a library (during tests etc)
    // does not work well.
    if metrics {
        with_metrics_route(router, setup_metrics_recorder())
    } else {
        router
    }
}
