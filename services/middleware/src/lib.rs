//! Visual Insights write-path producer
//!
//! Sits on the object server's request pipeline. After each successful write
//! it decides whether the object should be classified and, if so, publishes
//! an enrichment event naming the object's file on disk.
//!
//! ## Architecture
//!
//! ```text
//! PUT /v1/{account}/{container}/{object}
//!        │
//!        ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Event        │──▶│ Topology     │──▶│ Event        │──▶ enrichment queue
//! │ Filter       │   │ (policy,ring)│   │ Publisher    │
//! └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! Policies and rings are loaded once at startup into an immutable
//! [`Topology`] shared behind an `Arc`.

pub mod config;
pub mod filter;
pub mod middleware;
pub mod policy;
pub mod topology;

pub use config::{ConfigError, MiddlewareConfig};
pub use filter::{Decision, EventFilter, SkipReason, WriteRequest};
pub use middleware::{enrich_on_write, publish_event, with_enrichment, EnrichmentState};
pub use policy::{PolicyError, PolicyRegistry, StoragePolicy, FILE_ACCESS_FUNCTION, POLICY_HEADER};
pub use topology::{ring_file_name, Device, HashPath, Ring, RingError, Topology, TopologyError};
