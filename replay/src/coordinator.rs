//! Drains the dead-letter subscription, giving each envelope a bounded number of extra
//! attempts through the ingestion topic before parking it for manual review.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ingest_common::attributes::{
    self, is_transport_attribute, FINAL_ATTEMPT_COUNT, ORIGINAL_MESSAGE_ID, PARKED_REASON,
    PARKED_TIMESTAMP, REPLAY_ATTEMPTS, REPLAY_BOOKKEEPING, REPLAY_TIMESTAMP,
};
use ingest_common::envelope::Envelope;
use ingest_common::queue::{DeadLetterSource, OutboundMessage, Publisher, QueueMessage};
use ingest_common::time::TimeSource;
use metrics::counter;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::error::ReplayError;

pub const PARKED_REASON_EXHAUSTED: &str = "max-replay-attempts-exceeded";

const REPLAY_MESSAGES_TOTAL: &str = "replay_messages_total";
const REPLAY_DRAINS_TOTAL: &str = "replay_drains_total";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySettings {
    /// Messages requested per pull.
    pub batch_size: usize,
    /// Pause after each handled message.
    pub delay: Duration,
    pub max_attempts: u32,
    pub max_pulls: usize,
}

/// What to do with one dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayAction {
    /// Send it through ingestion again, as attempt number `attempt`.
    Republish {
        attempt: u32,
        message: OutboundMessage,
    },
    /// Give up and park it.
    Park {
        attempts: u32,
        message: OutboundMessage,
    },
}

/// Decide between republishing and parking, and build the message to publish.
///
/// `now` is stamped on the outgoing message as the replay or parking time.
pub fn plan(message: &QueueMessage, max_attempts: u32, now: &str) -> ReplayAction {
    let attempts = attributes::replay_attempts(&message.attributes);

    let mut outgoing: HashMap<String, String> = message
        .attributes
        .iter()
        .filter(|(name, _)| !is_transport_attribute(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    outgoing
        .entry(ORIGINAL_MESSAGE_ID.to_string())
        .or_insert_with(|| message.message_id.clone());

    if attempts >= max_attempts {
        for name in REPLAY_BOOKKEEPING {
            outgoing.remove(name);
        }
        outgoing.insert(PARKED_REASON.to_string(), PARKED_REASON_EXHAUSTED.to_string());
        outgoing.insert(FINAL_ATTEMPT_COUNT.to_string(), attempts.to_string());
        outgoing.insert(PARKED_TIMESTAMP.to_string(), now.to_string());

        ReplayAction::Park {
            attempts,
            message: OutboundMessage {
                data: message.data.clone(),
                attributes: outgoing,
                ordering_key: message.ordering_key.clone(),
            },
        }
    } else {
        let attempt = attempts + 1;
        outgoing.insert(REPLAY_ATTEMPTS.to_string(), attempt.to_string());
        outgoing.insert(REPLAY_TIMESTAMP.to_string(), now.to_string());

        ReplayAction::Republish {
            attempt,
            message: OutboundMessage {
                data: message.data.clone(),
                attributes: outgoing,
                ordering_key: message.ordering_key.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// A pull came back empty.
    Drained,
    /// Stopped after the maximum number of pulls with messages still coming.
    PullCapReached,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Drained => "drained",
            Termination::PullCapReached => "pull_cap_reached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub pulls: usize,
    pub pulled: usize,
    pub replayed: usize,
    pub parked: usize,
    pub publish_failures: usize,
    pub acknowledged: usize,
    pub acknowledge_failures: usize,
    pub termination: Termination,
}

impl Default for DrainReport {
    fn default() -> Self {
        Self {
            pulls: 0,
            pulled: 0,
            replayed: 0,
            parked: 0,
            publish_failures: 0,
            acknowledged: 0,
            acknowledge_failures: 0,
            termination: Termination::Drained,
        }
    }
}

pub struct ReplayCoordinator {
    source: Arc<dyn DeadLetterSource + Send + Sync>,
    publisher: Arc<dyn Publisher + Send + Sync>,
    ingestion_topic: String,
    parking_topic: String,
    settings: ReplaySettings,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    // Held for the whole drain so scheduled and triggered drains never overlap
    draining: Mutex<()>,
}

impl ReplayCoordinator {
    pub fn new(
        source: Arc<dyn DeadLetterSource + Send + Sync>,
        publisher: Arc<dyn Publisher + Send + Sync>,
        ingestion_topic: &str,
        parking_topic: &str,
        settings: ReplaySettings,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            source,
            publisher,
            ingestion_topic: ingestion_topic.to_owned(),
            parking_topic: parking_topic.to_owned(),
            settings,
            timesource,
            draining: Mutex::new(()),
        }
    }

    /// Pull and handle dead-lettered messages until a pull comes back empty or the pull cap
    /// is hit. Each message is acknowledged only once its republish or park succeeded.
    #[instrument(skip_all)]
    pub async fn drain(&self) -> Result<DrainReport, ReplayError> {
        let _draining = self.draining.lock().await;
        let mut report = DrainReport::default();

        loop {
            if report.pulls >= self.settings.max_pulls {
                report.termination = Termination::PullCapReached;
                break;
            }

            let received = self
                .source
                .pull(self.settings.batch_size)
                .await
                .map_err(|e| {
                    counter!(REPLAY_DRAINS_TOTAL, "termination" => "pull_failed").increment(1);
                    ReplayError::PullFailed(e)
                })?;
            report.pulls += 1;

            if received.is_empty() {
                report.termination = Termination::Drained;
                break;
            }
            report.pulled += received.len();

            let mut ack_ids = Vec::with_capacity(received.len());
            for delivery in received {
                match self.replay(&delivery.message).await {
                    Some(ReplayAction::Republish { .. }) => {
                        report.replayed += 1;
                        ack_ids.push(delivery.ack_id);
                    }
                    Some(ReplayAction::Park { .. }) => {
                        report.parked += 1;
                        ack_ids.push(delivery.ack_id);
                    }
                    None => report.publish_failures += 1,
                }

                if !self.settings.delay.is_zero() {
                    tokio::time::sleep(self.settings.delay).await;
                }
            }

            match self.source.acknowledge(&ack_ids).await {
                Ok(()) => report.acknowledged += ack_ids.len(),
                Err(e) => {
                    // Unacknowledged messages are redelivered and replayed again later
                    error!(count = ack_ids.len(), "failed to acknowledge replayed messages: {e}");
                    counter!("replay_acknowledge_failures_total").increment(ack_ids.len() as u64);
                    report.acknowledge_failures += ack_ids.len();
                }
            }
        }

        counter!(REPLAY_DRAINS_TOTAL, "termination" => report.termination.as_str()).increment(1);
        match report.termination {
            Termination::Drained => info!(?report, "dead-letter subscription drained"),
            Termination::PullCapReached => warn!(
                ?report,
                "stopped replaying after {} pulls, dead-letter subscription is not empty",
                report.pulls
            ),
        }

        Ok(report)
    }

    /// Republish or park one message. Returns the action taken, or `None` if publishing failed.
    async fn replay(&self, message: &QueueMessage) -> Option<ReplayAction> {
        let action = plan(
            message,
            self.settings.max_attempts,
            &self.timesource.current_timestamp(),
        );

        let (topic, outgoing, label) = match &action {
            ReplayAction::Republish { message, .. } => {
                (self.ingestion_topic.as_str(), message.clone(), "replayed")
            }
            ReplayAction::Park { message, .. } => {
                (self.parking_topic.as_str(), message.clone(), "parked")
            }
        };

        // Best effort, only used to make logs traceable
        let envelope = Envelope::from_bytes(&message.data).unwrap_or_default();
        let idempotency_key = envelope.derive_key().map(|key| key.value).unwrap_or_default();
        let tenant_id = envelope.tenant_id.unwrap_or_default();
        let event_type = envelope.event_type.unwrap_or_default();

        match self.publisher.publish(topic, outgoing).await {
            Ok(published_id) => {
                counter!(REPLAY_MESSAGES_TOTAL, "action" => label).increment(1);
                match &action {
                    ReplayAction::Republish { attempt, .. } => info!(
                        message_id = message.message_id.as_str(),
                        published_id = published_id.as_str(),
                        idempotency_key = idempotency_key.as_str(),
                        tenant_id = tenant_id.as_str(),
                        event_type = event_type.as_str(),
                        attempt,
                        "replayed dead-lettered message"
                    ),
                    ReplayAction::Park { attempts, .. } => warn!(
                        message_id = message.message_id.as_str(),
                        published_id = published_id.as_str(),
                        idempotency_key = idempotency_key.as_str(),
                        tenant_id = tenant_id.as_str(),
                        event_type = event_type.as_str(),
                        attempts,
                        "parked message after exhausting its replays"
                    ),
                }
                Some(action)
            }
            Err(e) => {
                counter!(REPLAY_MESSAGES_TOTAL, "action" => "publish_failed").increment(1);
                error!(
                    message_id = message.message_id.as_str(),
                    idempotency_key = idempotency_key.as_str(),
                    tenant_id = tenant_id.as_str(),
                    event_type = event_type.as_str(),
                    topic,
                    "failed to publish, leaving message on the dead-letter subscription: {e}"
                );
                None
            }
        }
    }
}
