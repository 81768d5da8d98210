//! Publishing side of the enrichment channel.
//!
//! [`EventPublisher`] is the seam the producer middleware talks to. The Kafka
//! implementation keeps one long-lived client and keys every record by the
//! object path, which keeps all events for one object on one partition and
//! therefore in publish order.

use crate::config::KafkaConfig;
use crate::event::{EnrichmentEvent, MESSAGE_ID_HEADER, TIMESTAMP_HEADER};
use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur while publishing an enrichment event
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to connect to the channel: {0}")]
    Connect(String),

    #[error("Failed to send message to queue {queue}: {message}")]
    Send { queue: String, message: String },

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Message to be sent to the channel
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Queue to send the message to
    pub queue: String,
    /// Message key for partitioning
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Encode an enrichment event: body is the object path, the write
    /// timestamp travels in the `X-Timestamp` header
    pub fn for_event(queue: impl Into<String>, event: &EnrichmentEvent) -> Self {
        Self {
            queue: queue.into(),
            key: None,
            payload: event.path.as_bytes().to_vec(),
            headers: Vec::new(),
        }
        .with_key(event.path.clone())
        .with_header(TIMESTAMP_HEADER, event.timestamp.internal())
        .with_header(MESSAGE_ID_HEADER, Uuid::new_v4().to_string())
    }

    /// Set the message key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Sink for enrichment events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &EnrichmentEvent) -> Result<(), PublishError>;
}

/// Kafka-backed event publisher
pub struct KafkaPublisher {
    producer: FutureProducer,
    queue: String,
    timeout: Duration,
}

impl KafkaPublisher {
    /// Create a new publisher with the given configuration
    pub fn new(config: &KafkaConfig) -> Result<Self, PublishError> {
        info!(
            brokers = %config.bootstrap_servers,
            queue = %config.queue.name,
            "Creating enrichment event publisher"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| PublishError::Connect(e.to_string()))?;

        Ok(Self {
            producer,
            queue: config.queue.name.clone(),
            timeout: config.publish_timeout(),
        })
    }

    /// Send a message and wait for broker acknowledgment
    #[instrument(skip(self, message), fields(queue = %message.queue, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<(), PublishError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let key = message.key.clone().unwrap_or_default();
        let record = FutureRecord::to(&message.queue)
            .payload(&message.payload)
            .key(&key)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| PublishError::Send {
                queue: message.queue.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Enrichment event delivered");
        Ok(())
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| PublishError::Timeout(timeout))
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, event: &EnrichmentEvent) -> Result<(), PublishError> {
        self.send(OutgoingMessage::for_event(&self.queue, event)).await
    }
}

impl Drop for KafkaPublisher {
    fn drop(&mut self) {
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush publisher on shutdown: {}", e);
        }
    }
}
