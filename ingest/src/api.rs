use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ingest_common::envelope::{FormatError, ValidationError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to decode push delivery: {0}")]
    RequestDecodingError(String),
    #[error("failed to parse envelope: {0}")]
    EnvelopeFormatError(#[from] FormatError),
    #[error("invalid envelope: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("event rejected by the sink: {0}")]
    PermanentRejectError(String),

    #[error("transient error, please retry: {0}")]
    RetryableSinkError(String),
    #[error("timed out waiting for the batch write, please retry")]
    WaitTimeout,
    #[error("shutting down, please retry")]
    ShuttingDown,
}

impl IngestError {
    /// Terminal errors must not be retried with the same input.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            IngestError::RetryableSinkError(_)
                | IngestError::WaitTimeout
                | IngestError::ShuttingDown
        )
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::RequestDecodingError(_) | IngestError::EnvelopeFormatError(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }

            IngestError::ValidationError(_) | IngestError::PermanentRejectError(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }

            IngestError::RetryableSinkError(_)
            | IngestError::WaitTimeout
            | IngestError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        }
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_status_codes() {
        let cases = [
            (
                IngestError::RequestDecodingError("bad".to_string()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                IngestError::EnvelopeFormatError(FormatError::InvalidEncoding),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                IngestError::ValidationError(ValidationError::NoIdempotencyKey),
                StatusCode::BAD_REQUEST,
            ),
            (
                IngestError::PermanentRejectError("invalid".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                IngestError::RetryableSinkError("timeout".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (IngestError::WaitTimeout, StatusCode::SERVICE_UNAVAILABLE),
            (IngestError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (error, status) in cases {
            let terminal = error.is_terminal();
            assert_eq!(terminal, status.is_client_error());
            assert_eq!(error.into_response().status(), status);
        }
    }
}
