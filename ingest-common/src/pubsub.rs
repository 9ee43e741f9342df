//! A minimal client for the Pub/Sub REST API, plus the push delivery wire format.
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::queue::{
    DeadLetterSource, OutboundMessage, Publisher, QueueError, QueueMessage, ReceivedMessage,
};

/// Body of a push delivery, as POSTed by the queue to the ingestion endpoint.
#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub message: WireMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, String>>,
    #[serde(default, alias = "message_id", skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
    #[serde(default, alias = "publish_time", skip_serializing_if = "Option::is_none")]
    pub publish_time: Option<String>,
}

impl WireMessage {
    pub fn decode(self) -> Result<QueueMessage, base64::DecodeError> {
        let data = base64::engine::general_purpose::STANDARD.decode(self.data.trim())?;

        Ok(QueueMessage {
            message_id: self.message_id,
            data,
            attributes: self.attributes.unwrap_or_default(),
            ordering_key: self.ordering_key.filter(|key| !key.is_empty()),
            publish_time: self.publish_time,
        })
    }
}

impl From<OutboundMessage> for WireMessage {
    fn from(message: OutboundMessage) -> Self {
        WireMessage {
            data: base64::engine::general_purpose::STANDARD.encode(message.data),
            attributes: Some(message.attributes),
            ordering_key: message.ordering_key,
            ..Default::default()
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceivedMessage {
    ack_id: String,
    message: WireMessage,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [String],
}

#[derive(Serialize)]
struct PublishRequest {
    messages: Vec<WireMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Clone)]
pub struct PubSubClient {
    client: reqwest::Client,
    base_url: String,
    project: String,
}

impl PubSubClient {
    pub fn new(
        base_url: &str,
        project: &str,
        auth_token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, QueueError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(token) = auth_token {
            let value = header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| QueueError::ConfigurationError(e.to_string()))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("dead-letter replay")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            project: project.to_owned(),
        })
    }

    /// A handle on one subscription of this project, usable as a [`DeadLetterSource`].
    pub fn subscription(&self, name: &str) -> PubSubSubscription {
        PubSubSubscription {
            client: self.clone(),
            name: name.to_owned(),
        }
    }

    fn subscription_url(&self, subscription: &str, verb: &str) -> String {
        format!(
            "{}/v1/projects/{}/subscriptions/{}:{}",
            self.base_url, self.project, subscription, verb
        )
    }

    fn topic_url(&self, topic: &str) -> String {
        format!(
            "{}/v1/projects/{}/topics/{}:publish",
            self.base_url, self.project, topic
        )
    }

    async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<R, QueueError> {
        let response = self.client.post(url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueueError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| QueueError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl Publisher for PubSubClient {
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<String, QueueError> {
        let request = PublishRequest {
            messages: vec![WireMessage::from(message)],
        };
        let response: PublishResponse = self.post_json(&self.topic_url(topic), &request).await?;

        response.message_ids.into_iter().next().ok_or_else(|| {
            QueueError::InvalidResponse("publish response holds no message id".to_string())
        })
    }
}

#[derive(Clone)]
pub struct PubSubSubscription {
    client: PubSubClient,
    name: String,
}

#[async_trait]
impl DeadLetterSource for PubSubSubscription {
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let url = self.client.subscription_url(&self.name, "pull");
        let response: PullResponse = self
            .client
            .post_json(&url, &PullRequest { max_messages })
            .await?;

        debug!(
            subscription = self.name.as_str(),
            count = response.received_messages.len(),
            "pulled messages"
        );

        response
            .received_messages
            .into_iter()
            .map(|received| {
                let message = received.message.decode().map_err(|e| {
                    QueueError::InvalidResponse(format!("message data is not base64: {e}"))
                })?;
                Ok(ReceivedMessage {
                    ack_id: received.ack_id,
                    message,
                })
            })
            .collect()
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), QueueError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let url = self.client.subscription_url(&self.name, "acknowledge");
        self.client
            .post_json::<_, serde_json::Value>(&url, &AcknowledgeRequest { ack_ids })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> PubSubClient {
        PubSubClient::new(
            &server.base_url(),
            "proj",
            Some("secret"),
            Duration::from_secs(5),
        )
        .expect("failed to build client")
    }

    #[test]
    fn decodes_push_delivery() {
        let push: PushRequest = serde_json::from_value(json!({
            "message": {
                "data": "eyJhIjoxfQ==",
                "attributes": {"x-replay-attempts": "1"},
                "messageId": "42",
                "publishTime": "2024-05-01T00:00:00Z"
            },
            "subscription": "projects/proj/subscriptions/ingest-push"
        }))
        .unwrap();

        let message = push.message.decode().unwrap();
        assert_eq!(message.data, br#"{"a":1}"#);
        assert_eq!(message.message_id, "42");
        assert_eq!(message.attributes["x-replay-attempts"], "1");
    }

    #[test]
    fn rejects_invalid_base64() {
        let message = WireMessage {
            data: "not base64!".to_string(),
            ..Default::default()
        };
        assert!(message.decode().is_err());
    }

    #[tokio::test]
    async fn pulls_and_decodes_messages() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/projects/proj/subscriptions/dlq:pull")
                    .header("authorization", "Bearer secret")
                    .json_body(json!({"maxMessages": 10}));
                then.status(200).json_body(json!({
                    "receivedMessages": [{
                        "ackId": "ack-1",
                        "message": {
                            "data": "aGVsbG8=",
                            "attributes": {"googclient_x": "y"},
                            "messageId": "m-1",
                            "orderingKey": "tenant-a"
                        }
                    }]
                }));
            })
            .await;

        let received = client(&server)
            .subscription("dlq")
            .pull(10)
            .await
            .expect("pull failed");

        mock.assert_async().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].ack_id, "ack-1");
        assert_eq!(received[0].message.data, b"hello");
        assert_eq!(received[0].message.ordering_key.as_deref(), Some("tenant-a"));
    }

    #[tokio::test]
    async fn empty_pull_response_means_no_messages() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/projects/proj/subscriptions/dlq:pull");
                then.status(200).json_body(json!({}));
            })
            .await;

        let received = client(&server).subscription("dlq").pull(5).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn acknowledges_ack_ids() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/projects/proj/subscriptions/dlq:acknowledge")
                    .json_body(json!({"ackIds": ["a", "b"]}));
                then.status(200).json_body(json!({}));
            })
            .await;

        client(&server)
            .subscription("dlq")
            .acknowledge(&["a".to_string(), "b".to_string()])
            .await
            .expect("acknowledge failed");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn publishes_encoded_message() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/projects/proj/topics/ingest:publish")
                    .json_body(json!({"messages": [{
                        "data": "aGVsbG8=",
                        "attributes": {"x-replay-attempts": "1"},
                        "orderingKey": "tenant-a"
                    }]}));
                then.status(200).json_body(json!({"messageIds": ["99"]}));
            })
            .await;

        let message = OutboundMessage {
            data: b"hello".to_vec(),
            attributes: HashMap::from([("x-replay-attempts".to_string(), "1".to_string())]),
            ordering_key: Some("tenant-a".to_string()),
        };
        let id = client(&server)
            .publish("ingest", message)
            .await
            .expect("publish failed");

        mock.assert_async().await;
        assert_eq!(id, "99");
    }

    #[tokio::test]
    async fn surfaces_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/projects/proj/topics/parking:publish");
                then.status(503).body("unavailable");
            })
            .await;

        let result = client(&server)
            .publish("parking", OutboundMessage::default())
            .await;

        match result {
            Err(QueueError::UnexpectedStatus { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "unavailable");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
