//! Visual Insights Pipeline - enrichment event channel
//!
//! This library carries enrichment events from the storage write path to the
//! tagger service. It handles:
//!
//! - The event model: object path plus the write [`Timestamp`]
//! - Publishing events from the producer middleware
//! - Client-acknowledged, at-least-once consumption with redelivery
//!
//! # Example
//!
//! ```rust,no_run
//! use insight_pipeline::{EventPublisher, EventSubscription, KafkaConfig, KafkaPublisher, KafkaSubscription};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::from_env()?;
//!     let publisher = KafkaPublisher::new(&config)?;
//!     let subscription = KafkaSubscription::new(&config)?;
//!
//!     let delivery = subscription.next_delivery().await?;
//!     println!("enrich {}", delivery.event()?.path);
//!     subscription.ack(&delivery).await?;
//!     # drop(publisher);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod event;
pub mod memory;
pub mod producer;

pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, QueueConfig, SaslConfig, SecurityProtocol,
    SslConfig,
};
pub use consumer::{
    ConsumerError, Delivery, EventSubscription, IncomingMessage, KafkaSubscription,
    MessageMetadata,
};
pub use event::{
    EnrichmentEvent, EventError, Timestamp, TimestampError, MESSAGE_ID_HEADER, TIMESTAMP_HEADER,
};
pub use memory::MemoryChannel;
pub use producer::{EventPublisher, KafkaPublisher, OutgoingMessage, PublishError};
