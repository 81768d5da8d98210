//! Subscription side of the enrichment channel.
//!
//! Deliveries are handed out one at a time and must be settled explicitly:
//! [`EventSubscription::ack`] removes the message from the channel for good,
//! [`EventSubscription::release`] gives it back so that the next fetch
//! returns it again. A process that crashes between the two never commits,
//! so the broker redelivers to another member of the consumer group.

use crate::config::KafkaConfig;
use crate::event::{EnrichmentEvent, EventError, Timestamp, TIMESTAMP_HEADER};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to queue: {0}")]
    SubscriptionError(String),

    #[error("Failed to acknowledge message: {0}")]
    AckError(String),

    #[error("Failed to release message for redelivery: {0}")]
    ReleaseError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),

    #[error("Subscription closed")]
    Closed,
}

/// Where a message came from
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub queue: String,
    pub partition: i32,
    pub offset: i64,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    /// Decode the enrichment event carried by this message
    pub fn event(&self) -> Result<EnrichmentEvent, EventError> {
        if self.payload.is_empty() {
            return Err(EventError::MissingPath);
        }
        let path = std::str::from_utf8(&self.payload).map_err(|_| EventError::InvalidPath)?;
        let timestamp: Timestamp = self
            .header(TIMESTAMP_HEADER)
            .ok_or(EventError::MissingTimestamp)?
            .parse()?;

        Ok(EnrichmentEvent::new(path, timestamp))
    }
}

/// One unacknowledged message handed to the consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: IncomingMessage,
}

impl Delivery {
    pub fn event(&self) -> Result<EnrichmentEvent, EventError> {
        self.message.event()
    }

    pub fn offset(&self) -> i64 {
        self.message.metadata.offset
    }
}

/// Client-acknowledged source of enrichment deliveries
#[async_trait]
pub trait EventSubscription: Send + Sync {
    /// Wait for the next delivery
    async fn next_delivery(&self) -> Result<Delivery, ConsumerError>;

    /// Permanently remove the delivery from the channel
    async fn ack(&self, delivery: &Delivery) -> Result<(), ConsumerError>;

    /// Leave the delivery unacknowledged so that it is delivered again
    async fn release(&self, delivery: &Delivery) -> Result<(), ConsumerError>;
}

/// Kafka consumer-group subscription with manual offset commits
pub struct KafkaSubscription {
    consumer: StreamConsumer,
    redelivery_delay: Duration,
}

impl KafkaSubscription {
    /// Create a consumer and subscribe it to the enrichment queue
    pub fn new(config: &KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            "Creating enrichment event consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[config.queue.name.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        info!(queue = %config.queue.name, "Subscribed to enrichment queue");

        Ok(Self {
            consumer,
            redelivery_delay: config.redelivery_delay(),
        })
    }

    /// Convert a borrowed Kafka message to an owned IncomingMessage
    fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
        let payload = msg.payload().unwrap_or(&[]).to_vec();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for header in h.iter() {
                if let Some(value) = header.value {
                    if let Ok(v) = String::from_utf8(value.to_vec()) {
                        headers.insert(header.key.to_string(), v);
                    }
                }
            }
        }

        IncomingMessage {
            payload,
            metadata: MessageMetadata {
                queue: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                headers,
            },
        }
    }
}

#[async_trait]
impl EventSubscription for KafkaSubscription {
    async fn next_delivery(&self) -> Result<Delivery, ConsumerError> {
        let borrowed = self
            .consumer
            .recv()
            .await
            .map_err(|e| ConsumerError::PollError(e.to_string()))?;

        let message = Self::convert_message(&borrowed);
        debug!(
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            "Received enrichment message"
        );

        Ok(Delivery { message })
    }

    #[instrument(skip(self, delivery), fields(offset = delivery.offset()))]
    async fn ack(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let meta = &delivery.message.metadata;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&meta.queue, meta.partition, Offset::Offset(meta.offset + 1))
            .map_err(|e| ConsumerError::AckError(e.to_string()))?;

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| ConsumerError::AckError(e.to_string()))
    }

    #[instrument(skip(self, delivery), fields(offset = delivery.offset()))]
    async fn release(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        tokio::time::sleep(self.redelivery_delay).await;

        let meta = &delivery.message.metadata;
        self.consumer
            .seek(
                &meta.queue,
                meta.partition,
                Offset::Offset(meta.offset),
                Duration::from_secs(10),
            )
            .map_err(|e| {
                warn!(error = %e, "Seek failed, message will be redelivered after rebalance");
                ConsumerError::ReleaseError(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: &[u8], timestamp: Option<&str>) -> IncomingMessage {
        let mut headers = HashMap::new();
        if let Some(ts) = timestamp {
            headers.insert(TIMESTAMP_HEADER.to_string(), ts.to_string());
        }
        IncomingMessage {
            payload: payload.to_vec(),
            metadata: MessageMetadata {
                queue: "visual-insights.enrichment".to_string(),
                partition: 0,
                offset: 41,
                headers,
            },
        }
    }

    #[test]
    fn test_decode_event() {
        let msg = message(b"/srv/node/gpfs0/AUTH_a/c/cat.png", Some("1463745600.5"));
        let event = msg.event().unwrap();

        assert_eq!(event.path, "/srv/node/gpfs0/AUTH_a/c/cat.png");
        assert_eq!(event.timestamp.normal(), "1463745600.50000");
    }

    #[test]
    fn test_decode_rejects_malformed_messages() {
        assert_eq!(
            message(b"", Some("1.0")).event(),
            Err(EventError::MissingPath)
        );
        assert_eq!(
            message(&[0xff, 0xfe], Some("1.0")).event(),
            Err(EventError::InvalidPath)
        );
        assert_eq!(
            message(b"/a/b", None).event(),
            Err(EventError::MissingTimestamp)
        );
        assert!(matches!(
            message(b"/a/b", Some("soon")).event(),
            Err(EventError::Timestamp(_))
        ));
    }
}
