//! Storage policy registry.
//!
//! Policies are read once at startup from an INI file with one
//! `[storage-policy:N]` section per policy:
//!
//! ```ini
//! [storage-policy:0]
//! name = gold
//! default = yes
//!
//! [storage-policy:1]
//! name = sof
//! functions = file-and-object-access
//! ```
//!
//! The registry is immutable afterwards and shared behind an `Arc`.

use axum::http::HeaderMap;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Capability marking a policy whose objects are reachable as plain files
pub const FILE_ACCESS_FUNCTION: &str = "file-and-object-access";

/// Request header naming the target storage policy
pub const POLICY_HEADER: &str = "X-Storage-Policy";

const SECTION_PREFIX: &str = "storage-policy:";

const TRUE_VALUES: [&str; 6] = ["true", "1", "yes", "on", "t", "y"];

/// Errors raised while loading or resolving storage policies
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Invalid X-Storage-Policy '{0}'")]
    InvalidPolicy(String),

    #[error("Storage Policy '{0}' is deprecated")]
    DeprecatedPolicy(String),

    #[error("Invalid storage policy configuration: {0}")]
    Config(String),

    #[error("Failed to load storage policies from {path}: {message}")]
    Load { path: String, message: String },
}

/// A named replication/placement scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePolicy {
    pub index: u32,
    pub name: String,
    pub is_default: bool,
    pub is_deprecated: bool,
    pub functions: Vec<String>,
}

impl StoragePolicy {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            is_default: false,
            is_deprecated: false,
            functions: Vec::new(),
        }
    }

    pub fn default_policy(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.is_deprecated = true;
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.functions.push(function.into());
        self
    }

    /// Whether objects in this policy are eligible for enrichment
    pub fn is_file_accessible(&self) -> bool {
        self.functions.iter().any(|f| f == FILE_ACCESS_FUNCTION)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PolicySection {
    name: Option<String>,
    default: Option<String>,
    deprecated: Option<String>,
    functions: Option<String>,
}

fn config_true_value(value: Option<&str>) -> bool {
    value
        .map(|v| TRUE_VALUES.contains(&v.trim().to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Immutable set of configured storage policies
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: BTreeMap<u32, StoragePolicy>,
    default_index: u32,
}

impl PolicyRegistry {
    /// Build a registry, checking names are unique and exactly one
    /// usable default exists
    pub fn new(policies: Vec<StoragePolicy>) -> Result<Self, PolicyError> {
        if policies.is_empty() {
            return Err(PolicyError::Config("no storage policies defined".to_string()));
        }

        let mut by_index = BTreeMap::new();
        let mut names = HashMap::new();
        for policy in policies {
            if let Some(other) = names.insert(policy.name.to_lowercase(), policy.index) {
                return Err(PolicyError::Config(format!(
                    "duplicate policy name '{}' (indexes {} and {})",
                    policy.name, other, policy.index
                )));
            }
            let index = policy.index;
            if by_index.insert(index, policy).is_some() {
                return Err(PolicyError::Config(format!("duplicate policy index {}", index)));
            }
        }

        let defaults: Vec<u32> = by_index
            .values()
            .filter(|p| p.is_default)
            .map(|p| p.index)
            .collect();
        let default_index = match defaults.as_slice() {
            [index] => *index,
            [] if by_index.len() == 1 => *by_index.keys().next().unwrap_or(&0),
            [] if by_index.contains_key(&0) => 0,
            [] => return Err(PolicyError::Config("no default storage policy".to_string())),
            _ => {
                return Err(PolicyError::Config(format!(
                    "multiple default storage policies: {:?}",
                    defaults
                )))
            }
        };

        if by_index[&default_index].is_deprecated {
            return Err(PolicyError::Config(format!(
                "default storage policy {} is deprecated",
                default_index
            )));
        }

        Ok(Self {
            policies: by_index,
            default_index,
        })
    }

    /// Load the registry from an INI policy file; the file must exist
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let load_error = |message: String| PolicyError::Load {
            path: path.display().to_string(),
            message,
        };

        if !path.exists() {
            return Err(load_error("file does not exist".to_string()));
        }

        let sections: HashMap<String, config::Value> = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Ini))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| load_error(e.to_string()))?;

        let mut policies = Vec::new();
        for (section, value) in sections {
            let Some(index) = section.strip_prefix(SECTION_PREFIX) else {
                continue;
            };
            let index: u32 = index
                .trim()
                .parse()
                .map_err(|_| load_error(format!("invalid policy section '{}'", section)))?;
            let fields: PolicySection = value
                .try_deserialize()
                .map_err(|e| load_error(format!("section '{}': {}", section, e)))?;

            policies.push(StoragePolicy {
                index,
                name: fields
                    .name
                    .filter(|n| !n.trim().is_empty())
                    .map(|n| n.trim().to_string())
                    .unwrap_or_else(|| format!("Policy-{}", index)),
                is_default: config_true_value(fields.default.as_deref()),
                is_deprecated: config_true_value(fields.deprecated.as_deref()),
                functions: fields
                    .functions
                    .unwrap_or_default()
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect(),
            });
        }

        let registry = Self::new(policies)?;
        info!(
            path = %path.display(),
            policies = registry.policies.len(),
            file_accessible = ?registry.file_accessible_indexes(),
            "Loaded storage policies"
        );
        Ok(registry)
    }

    pub fn get(&self, index: u32) -> Option<&StoragePolicy> {
        self.policies.get(&index)
    }

    /// Case-insensitive lookup by policy name
    pub fn get_by_name(&self, name: &str) -> Option<&StoragePolicy> {
        self.policies
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn default_policy(&self) -> &StoragePolicy {
        &self.policies[&self.default_index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoragePolicy> {
        self.policies.values()
    }

    pub fn is_file_accessible(&self, index: u32) -> bool {
        self.get(index).map(StoragePolicy::is_file_accessible).unwrap_or(false)
    }

    pub fn file_accessible_indexes(&self) -> Vec<u32> {
        self.iter()
            .filter(|p| p.is_file_accessible())
            .map(|p| p.index)
            .collect()
    }

    /// Policy targeted by a request: the `X-Storage-Policy` header when
    /// present and non-empty, the default policy otherwise
    pub fn resolve_policy(&self, headers: &HeaderMap) -> Result<u32, PolicyError> {
        let Some(value) = headers.get(POLICY_HEADER) else {
            return Ok(self.default_index);
        };
        let name = value
            .to_str()
            .map_err(|_| PolicyError::InvalidPolicy(String::from_utf8_lossy(value.as_bytes()).into_owned()))?;
        if name.trim().is_empty() {
            return Ok(self.default_index);
        }

        let policy = self
            .get_by_name(name)
            .ok_or_else(|| PolicyError::InvalidPolicy(name.to_string()))?;
        if policy.is_deprecated {
            return Err(PolicyError::DeprecatedPolicy(policy.name.clone()));
        }
        Ok(policy.index)
    }
}
