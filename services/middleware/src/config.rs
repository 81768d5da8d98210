use crate::policy::PolicyError;
use axum::http::HeaderName;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load middleware configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Producer middleware configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MiddlewareConfig {
    /// Directory holding the policy file and object rings
    #[serde(default = "default_swift_dir")]
    pub swift_dir: PathBuf,
    /// Policy file name under `swift_dir`
    #[serde(default = "default_policy_file")]
    pub policy_file: String,
    /// Root under which storage devices are mounted
    pub devices: PathBuf,
    /// Object extensions eligible for enrichment (case-sensitive)
    #[serde(default = "default_image_types")]
    pub image_types: Vec<String>,
    /// Header whose presence opts a write into enrichment. Clients of older
    /// deployments send `X-Visual_Insights_Enable`; set this to that name to
    /// keep them working.
    #[serde(default = "default_opt_in_header")]
    pub opt_in_header: String,
    #[serde(default)]
    pub hash_path_prefix: String,
    #[serde(default)]
    pub hash_path_suffix: String,
}

fn default_swift_dir() -> PathBuf {
    PathBuf::from("/etc/swift")
}

fn default_policy_file() -> String {
    "spectrum-scale-object-policies.conf".to_string()
}

fn default_image_types() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}

fn default_opt_in_header() -> String {
    "X-Visual-Insights-Enable".to_string()
}

impl MiddlewareConfig {
    pub fn new(devices: impl Into<PathBuf>) -> Self {
        Self {
            swift_dir: default_swift_dir(),
            policy_file: default_policy_file(),
            devices: devices.into(),
            image_types: default_image_types(),
            opt_in_header: default_opt_in_header(),
            hash_path_prefix: String::new(),
            hash_path_suffix: String::new(),
        }
    }

    /// Load from `config/insights`, `/etc/visual-insights/insights` and
    /// `INSIGHTS__*` environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/insights").required(false))
            .add_source(config::File::with_name("/etc/visual-insights/insights").required(false))
            // INSIGHTS__IMAGE_TYPES=jpg,png -> image_types
            .add_source(
                config::Environment::with_prefix("INSIGHTS")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("image_types")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a single file, format inferred from the extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn policy_path(&self) -> PathBuf {
        self.swift_dir.join(&self.policy_file)
    }

    /// Parsed opt-in header name
    pub fn opt_in_header_name(&self) -> Result<HeaderName, ConfigError> {
        HeaderName::from_bytes(self.opt_in_header.to_lowercase().as_bytes()).map_err(|e| {
            ConfigError::InvalidValue {
                key: "opt_in_header".to_string(),
                message: e.to_string(),
            }
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "devices".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.policy_file.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "policy_file".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if let Some(ext) = self
            .image_types
            .iter()
            .find(|ext| ext.is_empty() || ext.contains('.'))
        {
            return Err(ConfigError::InvalidValue {
                key: "image_types".to_string(),
                message: format!("'{}' is not a bare extension", ext),
            });
        }
        if self.hash_path_prefix.is_empty() && self.hash_path_suffix.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "hash_path_suffix".to_string(),
                message: "hash path prefix and suffix cannot both be empty".to_string(),
            });
        }
        self.opt_in_header_name()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "devices = \"/srv/node\"\nhash_path_suffix = \"changeme\"").unwrap();

        let config = MiddlewareConfig::from_file(file.path()).unwrap();
        assert_eq!(config.devices, PathBuf::from("/srv/node"));
        assert_eq!(config.image_types, vec!["jpg", "jpeg", "png"]);
        assert_eq!(
            config.policy_path(),
            PathBuf::from("/etc/swift/spectrum-scale-object-policies.conf")
        );
        assert_eq!(
            config.opt_in_header_name().unwrap(),
            "x-visual-insights-enable"
        );
    }

    #[test]
    fn test_legacy_opt_in_header_name() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "devices = \"/srv/node\"\nhash_path_suffix = \"changeme\"\nopt_in_header = \"X-Visual_Insights_Enable\""
        )
        .unwrap();

        let config = MiddlewareConfig::from_file(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.opt_in_header_name().unwrap(),
            "x-visual_insights_enable"
        );
    }

    #[test]
    fn test_devices_required() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "hash_path_suffix = \"changeme\"").unwrap();
        assert!(MiddlewareConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = MiddlewareConfig::new("/srv/node");
        assert!(config.validate().is_err());

        config.hash_path_suffix = "changeme".to_string();
        assert!(config.validate().is_ok());

        config.image_types = vec![".jpg".to_string()];
        assert!(config.validate().is_err());

        config.image_types = default_image_types();
        config.opt_in_header = "bad header".to_string();
        assert!(config.validate().is_err());
    }
}
