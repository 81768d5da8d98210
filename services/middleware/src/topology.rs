//! Topology resolution: from `(account, container, policy)` to the directory
//! holding the container's objects on a storage device.
//!
//! Each policy has an object ring. The ring hashes `/{account}/{container}`
//! with MD5 (salted with the cluster-wide hash path prefix/suffix), takes the
//! top `part_power` bits of the digest as the partition and
//! maps the partition to one device per replica. File-accessible policies
//! place every container on a single virtual device, so the first node is the
//! device whose directory tree holds the object files:
//!
//! ```text
//! {devices}/{device}/{account}/{container}/{object}
//! ```
//!
//! Rings are JSON documents:
//!
//! ```json
//! {
//!   "part_power": 2,
//!   "devs": [{"id": 0, "device": "gpfs0"}],
//!   "replica2part2dev_id": [[0, 0, 0, 0]]
//! }
//! ```

use crate::config::MiddlewareConfig;
use crate::policy::{PolicyError, PolicyRegistry};
use axum::http::HeaderMap;
use serde::Deserialize;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised by topology lookups
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Unknown storage policy index {0}")]
    UnknownPolicy(u32),

    #[error("Topology unavailable for policy {policy}: {reason}")]
    Unavailable { policy: u32, reason: String },
}

/// Errors raised while loading a ring file
#[derive(Error, Debug)]
pub enum RingError {
    #[error("Failed to read ring {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse ring {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid ring: {0}")]
    Invalid(String),
}

/// A storage device referenced by a ring
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Device {
    pub id: u32,
    /// Device directory name under the devices root
    pub device: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Replica placement table for one storage policy
#[derive(Debug, Clone, Deserialize)]
pub struct Ring {
    part_power: u8,
    /// Indexed by device id; removed devices leave a hole
    devs: Vec<Option<Device>>,
    replica2part2dev_id: Vec<Vec<u32>>,
}

impl Ring {
    pub fn new(
        part_power: u8,
        devs: Vec<Option<Device>>,
        replica2part2dev_id: Vec<Vec<u32>>,
    ) -> Result<Self, RingError> {
        let ring = Self {
            part_power,
            devs,
            replica2part2dev_id,
        };
        ring.validate()?;
        Ok(ring)
    }

    pub fn load(path: &Path) -> Result<Self, RingError> {
        let raw = std::fs::read(path).map_err(|source| RingError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let ring: Ring = serde_json::from_slice(&raw).map_err(|source| RingError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        ring.validate()?;
        Ok(ring)
    }

    fn validate(&self) -> Result<(), RingError> {
        if self.part_power > 32 {
            return Err(RingError::Invalid(format!(
                "part_power {} exceeds 32",
                self.part_power
            )));
        }
        if self.replica2part2dev_id.is_empty() {
            return Err(RingError::Invalid("ring has no replicas".to_string()));
        }

        let partitions = self.partition_count();
        for (replica, row) in self.replica2part2dev_id.iter().enumerate() {
            if row.len() as u64 != partitions {
                return Err(RingError::Invalid(format!(
                    "replica {} maps {} partitions, expected {}",
                    replica,
                    row.len(),
                    partitions
                )));
            }
            if let Some(id) = row.iter().find(|id| self.device(**id).is_none()) {
                return Err(RingError::Invalid(format!(
                    "replica {} references missing device {}",
                    replica, id
                )));
            }
        }

        for (slot, dev) in self.devs.iter().enumerate() {
            if let Some(dev) = dev {
                if dev.id as usize != slot {
                    return Err(RingError::Invalid(format!(
                        "device {} stored in slot {}",
                        dev.id, slot
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn partition_count(&self) -> u64 {
        1u64 << self.part_power
    }

    pub fn replica_count(&self) -> usize {
        self.replica2part2dev_id.len()
    }

    fn device(&self, id: u32) -> Option<&Device> {
        self.devs.get(id as usize).and_then(Option::as_ref)
    }

    /// Partition for an account/container pair
    pub fn get_part(&self, hash_path: &HashPath, account: &str, container: &str) -> u32 {
        let digest = hash_path.digest(account, container);
        let top = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        (u64::from(top) >> (32 - u32::from(self.part_power))) as u32
    }

    /// Partition and distinct devices holding an account/container pair,
    /// in replica order
    pub fn get_nodes(
        &self,
        hash_path: &HashPath,
        account: &str,
        container: &str,
    ) -> (u32, Vec<&Device>) {
        let part = self.get_part(hash_path, account, container);
        let mut nodes: Vec<&Device> = Vec::with_capacity(self.replica_count());
        for row in &self.replica2part2dev_id {
            if let Some(dev) = row.get(part as usize).and_then(|id| self.device(*id)) {
                if !nodes.iter().any(|n| n.id == dev.id) {
                    nodes.push(dev);
                }
            }
        }
        (part, nodes)
    }
}

/// Cluster-wide salt mixed into every ring hash
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashPath {
    pub prefix: String,
    pub suffix: String,
}

impl HashPath {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    fn digest(&self, account: &str, container: &str) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update(self.prefix.as_bytes());
        hasher.update(format!("/{}/{}", account, container).as_bytes());
        hasher.update(self.suffix.as_bytes());
        hasher.finalize().into()
    }
}

/// Ring file name for a policy index
pub fn ring_file_name(policy: u32) -> String {
    if policy == 0 {
        "object.ring.json".to_string()
    } else {
        format!("object-{}.ring.json", policy)
    }
}

/// Immutable storage topology: policies plus the rings of every
/// file-accessible policy
#[derive(Debug)]
pub struct Topology {
    policies: PolicyRegistry,
    rings: HashMap<u32, Result<Ring, String>>,
    devices_root: PathBuf,
    hash_path: HashPath,
}

impl Topology {
    pub fn new(
        policies: PolicyRegistry,
        rings: HashMap<u32, Result<Ring, String>>,
        devices_root: impl Into<PathBuf>,
        hash_path: HashPath,
    ) -> Self {
        Self {
            policies,
            rings,
            devices_root: devices_root.into(),
            hash_path,
        }
    }

    /// Load policies and rings. A missing or malformed policy file is fatal;
    /// a ring that cannot be loaded only disables resolution for its policy.
    pub fn load(config: &MiddlewareConfig) -> Result<Self, PolicyError> {
        let policies = PolicyRegistry::load(&config.policy_path())?;

        let mut rings = HashMap::new();
        for index in policies.file_accessible_indexes() {
            let path = config.swift_dir.join(ring_file_name(index));
            let ring = match Ring::load(&path) {
                Ok(ring) => {
                    info!(
                        policy = index,
                        path = %path.display(),
                        partitions = ring.partition_count(),
                        "Loaded object ring"
                    );
                    Ok(ring)
                }
                Err(e) => {
                    warn!(policy = index, error = %e, "Object ring unavailable");
                    Err(e.to_string())
                }
            };
            rings.insert(index, ring);
        }

        Ok(Self::new(
            policies,
            rings,
            config.devices.clone(),
            HashPath::new(&config.hash_path_prefix, &config.hash_path_suffix),
        ))
    }

    pub fn is_file_accessible(&self, policy: u32) -> bool {
        self.policies.is_file_accessible(policy)
    }

    pub fn resolve_policy(&self, headers: &HeaderMap) -> Result<u32, PolicyError> {
        self.policies.resolve_policy(headers)
    }

    /// Directory holding the container's objects for the given policy
    pub fn resolve(
        &self,
        account: &str,
        container: &str,
        policy: u32,
    ) -> Result<PathBuf, TopologyError> {
        if self.policies.get(policy).is_none() {
            return Err(TopologyError::UnknownPolicy(policy));
        }

        let ring = match self.rings.get(&policy) {
            Some(Ok(ring)) => ring,
            Some(Err(reason)) => {
                return Err(TopologyError::Unavailable {
                    policy,
                    reason: reason.clone(),
                })
            }
            None => {
                return Err(TopologyError::Unavailable {
                    policy,
                    reason: "no ring loaded".to_string(),
                })
            }
        };

        let (part, nodes) = ring.get_nodes(&self.hash_path, account, container);
        let device = nodes.first().ok_or_else(|| TopologyError::Unavailable {
            policy,
            reason: format!("partition {} has no device", part),
        })?;

        Ok(self
            .devices_root
            .join(&device.device)
            .join(account)
            .join(container))
    }
}
