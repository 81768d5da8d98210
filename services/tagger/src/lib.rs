//! Visual Insights Tagger
//!
//! Consumer side of the image enrichment pipeline. Takes enrichment events
//! off the channel, checks that the object they name is still the version
//! that was written, asks the visual recognition service for labels and
//! stores the top ones in the object's metadata.
//!
//! ## Architecture
//!
//! ```text
//!   enrichment queue
//!         │
//!         ▼
//! ┌──────────────┐   stale?   ┌──────────────┐
//! │ Enricher     │───────────▶│ Metadata     │
//! │ (one event   │            │ Store        │
//! │  at a time)  │◀───────────│ (sidecar)    │
//! └──────────────┘  tags      └──────────────┘
//!         │                          ▲
//!         ▼                          │
//! ┌──────────────┐   labels   ┌──────────────┐
//! │ Classifier   │───────────▶│ Tag ranking  │
//! └──────────────┘            └──────────────┘
//! ```

pub mod classifier;
pub mod config;
pub mod enricher;
pub mod metadata_store;
pub mod tags;

pub use classifier::{Classifier, ClassifierError, Label, WatsonClassifier};
pub use config::{ClassifierConfig, Config, ConfigError, LogFormat, MetadataConfig, ServiceConfig};
pub use enricher::{EnrichError, Enricher, Outcome, SkipReason};
pub use metadata_store::{MetadataError, ObjectMetadata, ObjectStore, SidecarStore};
pub use tags::{format_confidence, rank, TagSet};
