use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ingest_common::queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("failed to pull from the dead-letter subscription: {0}")]
    PullFailed(#[source] QueueError),
}

impl IntoResponse for ReplayError {
    fn into_response(self) -> Response {
        match self {
            ReplayError::PullFailed(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
        }
        .into_response()
    }
}
