//! The enrichment loop.
//!
//! One delivery at a time: decode the event, check that the object has not
//! been rewritten since the event was produced, classify the image, merge the
//! tags into the object's metadata and acknowledge. Superseded, vanished or
//! undecodable events are acknowledged without work. Transient failures leave
//! the delivery unacknowledged so the channel hands it out again; there is no
//! retry loop here.

use crate::classifier::{Classifier, ClassifierError};
use crate::config::MetadataConfig;
use crate::metadata_store::{MetadataError, ObjectStore};
use crate::tags::{rank, TagSet};
use insight_pipeline::{ConsumerError, Delivery, EnrichmentEvent, EventSubscription, Timestamp};
use metrics::{counter, histogram};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Why an event was acknowledged without enrichment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The object was rewritten after the event was produced
    Stale { stored: Timestamp, event: Timestamp },
    /// The object or its metadata no longer exists
    NotFound,
    /// The stored metadata carries no usable write timestamp
    MissingTimestamp,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale { stored, event } => {
                write!(f, "object rewritten at {}, event is for {}", stored, event)
            }
            Self::NotFound => write!(f, "object not found"),
            Self::MissingTimestamp => write!(f, "stored metadata has no write timestamp"),
        }
    }
}

impl SkipReason {
    fn as_label(&self) -> &'static str {
        match self {
            Self::Stale { .. } => "stale",
            Self::NotFound => "not_found",
            Self::MissingTimestamp => "missing_timestamp",
        }
    }
}

/// Terminal result of processing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Enriched(TagSet),
    Skipped(SkipReason),
}

/// Failures while processing an event
#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("Failed to read metadata: {0}")]
    ReadMetadata(#[source] MetadataError),

    #[error("Failed to read object content: {0}")]
    ReadContent(#[source] MetadataError),

    #[error("Classification failed: {0}")]
    Classify(#[from] ClassifierError),

    #[error("Failed to write metadata: {0}")]
    WriteMetadata(#[source] MetadataError),
}

impl EnrichError {
    /// Transient failures are retried through redelivery; anything else
    /// would fail the same way again and is dropped
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ReadMetadata(e) | Self::ReadContent(e) | Self::WriteMetadata(e) => {
                matches!(e, MetadataError::Io { .. })
            }
            Self::Classify(_) => true,
        }
    }
}

/// Consumes enrichment events and tags objects
pub struct Enricher {
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn ObjectStore>,
    config: MetadataConfig,
}

impl Enricher {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn ObjectStore>,
        config: MetadataConfig,
    ) -> Self {
        Self {
            classifier,
            store,
            config,
        }
    }

    /// Process deliveries until the subscription closes or `shutdown` fires.
    /// Shutdown is only observed between events. A delivery that cannot be
    /// released ends the loop with an error so that consumption restarts from
    /// the last committed position.
    pub async fn run(
        &self,
        subscription: &dyn EventSubscription,
        shutdown: CancellationToken,
    ) -> Result<(), ConsumerError> {
        info!("Starting enrichment loop");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping enrichment loop");
                    return Ok(());
                }
                delivery = subscription.next_delivery() => delivery,
            };

            match delivery {
                Ok(delivery) => match self.handle(subscription, &delivery).await {
                    Ok(()) => {}
                    Err(e @ ConsumerError::ReleaseError(_)) => {
                        // Acking a later offset would commit past this one
                        error!(error = %e, offset = delivery.offset(), "Failed to release delivery, stopping");
                        counter!("insights.channel.errors").increment(1);
                        return Err(e);
                    }
                    Err(e) => {
                        error!(error = %e, offset = delivery.offset(), "Failed to settle delivery");
                        counter!("insights.channel.errors").increment(1);
                    }
                },
                Err(ConsumerError::Closed) => {
                    info!("Subscription closed, stopping enrichment loop");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Failed to fetch enrichment event");
                    counter!("insights.channel.errors").increment(1);
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Process one delivery and settle it with the channel
    pub async fn handle(
        &self,
        subscription: &dyn EventSubscription,
        delivery: &Delivery,
    ) -> Result<(), ConsumerError> {
        let event = match delivery.event() {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, offset = delivery.offset(), "Dropping malformed enrichment message");
                counter!("insights.events.malformed").increment(1);
                return subscription.ack(delivery).await;
            }
        };

        match self.process(&event).await {
            Ok(Outcome::Enriched(tags)) => {
                info!(path = %event.path, tags = tags.len(), "Object enriched");
                counter!("insights.events.enriched").increment(1);
                subscription.ack(delivery).await
            }
            Ok(Outcome::Skipped(reason)) => {
                info!(path = %event.path, reason = %reason, "Skipping enrichment");
                counter!("insights.events.skipped", "reason" => reason.as_label()).increment(1);
                subscription.ack(delivery).await
            }
            Err(e) if e.is_transient() => {
                warn!(path = %event.path, error = %e, "Enrichment failed, leaving event for redelivery");
                counter!("insights.events.failed", "transient" => "true").increment(1);
                subscription.release(delivery).await
            }
            Err(e) => {
                error!(path = %event.path, error = %e, "Enrichment failed permanently, dropping event");
                counter!("insights.events.failed", "transient" => "false").increment(1);
                subscription.ack(delivery).await
            }
        }
    }

    /// Staleness check, classification and merge for one event
    #[instrument(skip(self, event), fields(path = %event.path, timestamp = %event.timestamp))]
    pub async fn process(&self, event: &EnrichmentEvent) -> Result<Outcome, EnrichError> {
        let path = Path::new(&event.path);

        let metadata = match self.store.read_metadata(path).await {
            Ok(metadata) => metadata,
            Err(MetadataError::NotFound(_)) => return Ok(Outcome::Skipped(SkipReason::NotFound)),
            Err(e) => return Err(EnrichError::ReadMetadata(e)),
        };

        let Some(stored) = metadata.timestamp(&self.config.timestamp_attribute) else {
            return Ok(Outcome::Skipped(SkipReason::MissingTimestamp));
        };
        debug!(
            stored = %stored.isoformat(),
            requested = %event.timestamp.isoformat(),
            "Checking object freshness"
        );
        if stored != event.timestamp {
            return Ok(Outcome::Skipped(SkipReason::Stale {
                stored,
                event: event.timestamp,
            }));
        }

        let content = match self.store.read_content(path).await {
            Ok(content) => content,
            Err(MetadataError::NotFound(_)) => return Ok(Outcome::Skipped(SkipReason::NotFound)),
            Err(e) => return Err(EnrichError::ReadContent(e)),
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let started = Instant::now();
        let labels = self.classifier.classify(content, file_name).await?;
        histogram!("insights.classify.duration_seconds").record(started.elapsed().as_secs_f64());

        // The object may have been rewritten while it was being classified
        let mut metadata = match self.store.read_metadata(path).await {
            Ok(metadata) => metadata,
            Err(MetadataError::NotFound(_)) => return Ok(Outcome::Skipped(SkipReason::NotFound)),
            Err(e) => return Err(EnrichError::ReadMetadata(e)),
        };
        match metadata.timestamp(&self.config.timestamp_attribute) {
            Some(current) if current == event.timestamp => {}
            Some(current) => {
                return Ok(Outcome::Skipped(SkipReason::Stale {
                    stored: current,
                    event: event.timestamp,
                }))
            }
            None => return Ok(Outcome::Skipped(SkipReason::MissingTimestamp)),
        }

        let tags = rank(&labels, self.config.max_tags);
        tags.merge_into(&mut metadata, &self.config.tag_attribute);
        self.store
            .write_metadata(path, &metadata)
            .await
            .map_err(EnrichError::WriteMetadata)?;

        Ok(Outcome::Enriched(tags))
    }
}
