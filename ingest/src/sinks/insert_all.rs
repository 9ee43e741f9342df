use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::SinkConfig;
use crate::sinks::{InsertResult, RowError, RowErrorReason, Sink, SinkError, SinkRow};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRequest<'a> {
    rows: &'a [SinkRow],
    skip_invalid_rows: bool,
    ignore_unknown_values: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<InsertErrors>,
}

#[derive(Deserialize)]
struct InsertErrors {
    index: usize,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

/// Streams rows into a table through an `insertAll`-style REST endpoint.
///
/// Rows carry their idempotency key as `insertId`, which the sink uses to drop
/// re-inserted rows.
pub struct InsertAllSink {
    client: reqwest::Client,
    url: String,
}

impl InsertAllSink {
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        let project = config
            .sink_project
            .as_deref()
            .ok_or_else(|| SinkError::ConfigurationError("SINK_PROJECT is not set".to_string()))?;

        let mut headers = header::HeaderMap::new();
        if let Some(token) = &config.sink_auth_token {
            let value = header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SinkError::ConfigurationError(e.to_string()))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("event ingest")
            .timeout(config.sink_timeout_ms.0)
            .build()
            .map_err(|e| SinkError::ConfigurationError(e.to_string()))?;

        Ok(Self {
            client,
            url: format!(
                "{}/projects/{}/datasets/{}/tables/{}/insertAll",
                config.sink_url.trim_end_matches('/'),
                project,
                config.sink_dataset,
                config.sink_table
            ),
        })
    }

    async fn send(&self, rows: &[SinkRow]) -> Result<InsertResult, SinkError> {
        let request = InsertAllRequest {
            rows,
            skip_invalid_rows: false,
            ignore_unknown_values: false,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SinkError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_invalid_data_rejection(status, &body) {
                // The request itself was rejected for its data, so is every row in it
                warn!(status = status.as_u16(), "sink rejected insert request: {body}");
                return Ok(InsertResult::PartialFailure(
                    (0..rows.len())
                        .map(|index| RowError {
                            index,
                            reason: RowErrorReason::Invalid,
                            message: format!("request rejected with status {status}: {body}"),
                        })
                        .collect(),
                ));
            }
            if !is_retryable_status(status) {
                error!(status = status.as_u16(), "sink refused insert request: {body}");
            }
            return Err(SinkError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed = response
            .json::<InsertAllResponse>()
            .await
            .map_err(|e| SinkError::InvalidResponse(e.to_string()))?;

        if parsed.insert_errors.is_empty() {
            return Ok(InsertResult::Success);
        }

        let mut row_errors = Vec::new();
        for entry in parsed.insert_errors {
            if entry.errors.is_empty() {
                row_errors.push(RowError {
                    index: entry.index,
                    reason: RowErrorReason::Other("unknown".to_string()),
                    message: "row error without detail".to_string(),
                });
            }
            for error in entry.errors {
                row_errors.push(RowError {
                    index: entry.index,
                    reason: RowErrorReason::from(error.reason.as_str()),
                    message: error.message,
                });
            }
        }
        Ok(InsertResult::PartialFailure(row_errors))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Only a 400 whose error body names an invalid-data reason rejects the rows themselves.
/// Any other failed call says nothing about the rows and is left to be retried.
fn is_invalid_data_rejection(status: StatusCode, body: &str) -> bool {
    if status != StatusCode::BAD_REQUEST {
        return false;
    }
    serde_json::from_str::<ErrorResponse>(body)
        .map(|response| {
            response
                .error
                .errors
                .iter()
                .any(|e| RowErrorReason::from(e.reason.as_str()) == RowErrorReason::Invalid)
        })
        .unwrap_or(false)
}

#[async_trait]
impl Sink for InsertAllSink {
    async fn insert(&self, rows: Vec<SinkRow>) -> InsertResult {
        histogram!("ingest_sink_insert_batch_size").record(rows.len() as f64);

        match self.send(&rows).await {
            Ok(result) => {
                let outcome = match &result {
                    InsertResult::Success => "success",
                    InsertResult::PartialFailure(_) => "partial_failure",
                    InsertResult::TotalFailure(_) => "total_failure",
                };
                counter!("ingest_sink_inserts_total", "result" => outcome).increment(1);
                result
            }
            Err(err) => {
                error!(rows = rows.len(), "insert call failed: {err}");
                counter!("ingest_sink_inserts_total", "result" => "total_failure").increment(1);
                InsertResult::TotalFailure(err)
            }
        }
    }
}
