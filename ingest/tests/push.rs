use std::sync::Arc;
use std::time::Duration;

use assert_json_diff::assert_json_eq;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::Engine;
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use ingest::batch::BatchAccumulator;
use ingest::normalizer::PhoneNormalizer;
use ingest::router::router;
use ingest::sampler::Sampler;
use ingest::sinks::memory::MemorySink;
use ingest::sinks::{InsertResult, SinkError};
use ingest::writer::SinkWriter;
use ingest_common::time::FixedTime;

struct TestApp {
    router: Router,
    sink: MemorySink,
    accumulator: BatchAccumulator,
}

fn test_app(
    sampling_rate: f64,
    batch_size: usize,
    batch_wait_ms: u64,
    wait_timeout_ms: u64,
) -> TestApp {
    let sink = MemorySink::new();
    let accumulator = BatchAccumulator::new(
        SinkWriter::new(Arc::new(sink.clone())),
        batch_size,
        Duration::from_millis(batch_wait_ms),
    );
    let router = router(
        FixedTime {
            time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        },
        accumulator.clone(),
        Sampler::new(sampling_rate),
        PhoneNormalizer::new(vec!["from".to_string()], "1"),
        Duration::from_millis(wait_timeout_ms),
        false,
    );
    TestApp {
        router,
        sink,
        accumulator,
    }
}

fn envelope(call_id: &str) -> Value {
    json!({
        "envelopeVersion": 1,
        "eventType": "call.completed",
        "schemaVersion": 2,
        "tenantId": "tenant-a",
        "occurredAt": "2024-05-01T11:59:00Z",
        "traceId": "trace-1",
        "source": "switch-7",
        "payload": {"call_id": call_id, "from": "(415) 555-0100", "duration": 42}
    })
}

fn push_body(envelope: &Value) -> String {
    let data = base64::engine::general_purpose::STANDARD.encode(envelope.to_string());
    json!({
        "message": {"data": data, "messageId": "1234", "attributes": {}},
        "subscription": "projects/p/subscriptions/ingest-push"
    })
    .to_string()
}

async fn post(router: &Router, body: String) -> (StatusCode, String) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/push")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

#[tokio::test]
async fn stores_valid_event() {
    let app = test_app(1.0, 1, 0, 5000);

    let (status, body) = post(&app.router, push_body(&envelope("call-1"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());

    let rows = app.sink.rows();
    assert_eq!(rows.len(), 1);
    let mut stored = serde_json::to_value(&rows[0]).unwrap();
    let payload: Value = serde_json::from_str(stored["payload"].as_str().unwrap()).unwrap();
    stored["payload"] = payload;

    assert_json_eq!(
        stored,
        json!({
            "idempotency_key": "call-1",
            "envelope_version": 1,
            "event_type": "call.completed",
            "schema_version": 2,
            "tenant_id": "tenant-a",
            "occurred_at": "2024-05-01T11:59:00Z",
            "received_at": "2024-05-01T12:00:00Z",
            "trace_id": "trace-1",
            "source": "switch-7",
            "payload": {"call_id": "call-1", "from": "+14155550100", "duration": 42},
            "sampled": true
        })
    );
}

#[tokio::test]
async fn root_path_accepts_pushes() {
    let app = test_app(1.0, 1, 0, 5000);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .body(Body::from(push_body(&envelope("call-root"))))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(app.sink.insert_ids(), vec!["call-root"]);
}

#[tokio::test]
async fn validation_failures_are_400() {
    let app = test_app(1.0, 1, 0, 5000);

    let mut missing = envelope("call-1");
    missing.as_object_mut().unwrap().remove("tenantId");
    let (status, body) = post(&app.router, push_body(&missing)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("tenantId"), "unexpected body: {body}");

    let mut bad_time = envelope("call-1");
    bad_time["occurredAt"] = json!("last tuesday");
    let (status, body) = post(&app.router, push_body(&bad_time)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("occurredAt"), "unexpected body: {body}");

    let mut keyless = envelope("call-1");
    keyless["payload"] = json!({"duration": 1});
    keyless.as_object_mut().unwrap().remove("traceId");
    let (status, _) = post(&app.router, push_body(&keyless)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(app.sink.rows().is_empty());
}

#[tokio::test]
async fn malformed_deliveries_are_422() {
    let app = test_app(1.0, 1, 0, 5000);

    let not_a_delivery = "{\"hello\": true}".to_string();
    let bad_base64 = json!({"message": {"data": "%%%"}}).to_string();
    let not_json = json!({
        "message": {"data": base64::engine::general_purpose::STANDARD.encode("not json")}
    })
    .to_string();
    let wrong_type = push_body(&json!({"envelopeVersion": "one", "payload": {}}));

    for body in [not_a_delivery, bad_base64, not_json, wrong_type] {
        let (status, _) = post(&app.router, body.clone()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "body: {body}");
    }
    assert!(app.sink.rows().is_empty());
}

#[tokio::test]
async fn sampled_out_events_are_acknowledged_but_not_stored() {
    let app = test_app(0.0, 1, 0, 5000);

    let (status, body) = post(&app.router, push_body(&envelope("call-1"))).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());
    assert!(app.sink.rows().is_empty());
    assert!(app.sink.batch_sizes().is_empty());
}

#[tokio::test]
async fn redeliveries_store_a_single_row() {
    // Unbatched: every delivery is its own insert
    let app = test_app(1.0, 1, 0, 5000);
    for _ in 0..5 {
        let (status, _) = post(&app.router, push_body(&envelope("call-dup"))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    assert_eq!(app.sink.insert_ids(), vec!["call-dup"]);
    assert_eq!(app.sink.batch_sizes(), vec![1; 5]);

    // Batched: duplicates share a batch
    let app = test_app(1.0, 4, 50, 5000);
    let requests = (0..4).map(|_| post(&app.router, push_body(&envelope("call-dup"))));
    for (status, _) in futures::future::join_all(requests).await {
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    assert_eq!(app.sink.insert_ids(), vec!["call-dup"]);
}

#[tokio::test]
async fn sink_outcomes_map_to_status_codes() {
    let app = test_app(1.0, 1, 0, 5000);

    app.sink.inject(InsertResult::TotalFailure(SinkError::RequestFailed(
        "connection reset".to_string(),
    )));
    let (status, _) = post(&app.router, push_body(&envelope("call-1"))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(app.sink.rows().is_empty());

    // The transport redelivers after a 503
    let (status, _) = post(&app.router, push_body(&envelope("call-1"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    app.sink.inject_row_errors(&[(0, "invalid")]);
    let (status, body) = post(&app.router, push_body(&envelope("call-2"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("invalid"), "unexpected body: {body}");

    app.sink.inject_row_errors(&[(0, "duplicate")]);
    let (status, _) = post(&app.router, push_body(&envelope("call-1"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    app.sink.inject_row_errors(&[(0, "backendError")]);
    let (status, _) = post(&app.router, push_body(&envelope("call-3"))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    assert_eq!(app.sink.insert_ids(), vec!["call-1"]);
}

#[tokio::test(start_paused = true)]
async fn wait_timeout_is_503_but_the_event_is_still_written() {
    let app = test_app(1.0, 10, 60_000, 100);

    let (status, _) = post(&app.router, push_body(&envelope("call-slow"))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(app.sink.rows().is_empty());

    tokio::time::sleep(Duration::from_secs(61)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(app.sink.insert_ids(), vec!["call-slow"]);
}

#[tokio::test]
async fn pushes_after_shutdown_are_503() {
    let app = test_app(1.0, 1, 0, 5000);
    app.accumulator.shutdown().await;

    let (status, body) = post(&app.router, push_body(&envelope("call-1"))).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("shutting down"));
}

#[tokio::test]
async fn health_routes() {
    let app = test_app(1.0, 1, 0, 5000);

    for uri in ["/", "/_readiness", "/_liveness"] {
        let response = app
            .router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
    }
}
