use insight_pipeline::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error(transparent)]
    Kafka(#[from] insight_pipeline::ConfigError),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the tagger service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Enrichment channel configuration
    pub kafka: KafkaConfig,
    /// Classification service configuration
    pub classifier: ClassifierConfig,
    /// Object metadata configuration
    #[serde(default)]
    pub metadata: MetadataConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Visual recognition service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Classify endpoint URL
    #[serde(default = "default_classifier_endpoint")]
    pub endpoint: String,
    pub api_key: String,
    /// API version date sent with every request
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Request timeout in milliseconds
    #[serde(default = "default_classifier_timeout_ms")]
    pub timeout_ms: u64,
}

/// Object metadata attribute names
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Attribute receiving the classification tags
    #[serde(default = "default_tag_attribute")]
    pub tag_attribute: String,
    /// Attribute holding the object's last write timestamp
    #[serde(default = "default_timestamp_attribute")]
    pub timestamp_attribute: String,
    /// Number of labels kept per object
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
}

// Default value functions
fn default_service_name() -> String {
    "insight-tagger".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_classifier_endpoint() -> String {
    "https://gateway-a.watsonplatform.net/visual-recognition/api/v3/classify".to_string()
}

fn default_api_version() -> String {
    "2016-05-20".to_string()
}

fn default_classifier_timeout_ms() -> u64 {
    30000
}

fn default_tag_attribute() -> String {
    "X-Object-Meta-Classification-Tags".to_string()
}

fn default_timestamp_attribute() -> String {
    "X-Timestamp".to_string()
}

fn default_max_tags() -> usize {
    3
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("service.metrics_port", default_metrics_port())?
            .add_source(config::File::with_name("config/tagger").required(false))
            .add_source(config::File::with_name("/etc/visual-insights/tagger").required(false))
            // TAGGER__CLASSIFIER__API_KEY -> classifier.api_key
            .add_source(
                config::Environment::with_prefix("TAGGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints; a failure aborts startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kafka.validate()?;

        if self.classifier.api_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "classifier.api_key".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.classifier.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "classifier.timeout_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        // A delivery held longer than the poll interval is handed to another
        // group member while we are still classifying it
        if self.classifier_timeout() >= self.kafka.redelivery_window() {
            return Err(ConfigError::InvalidValue {
                key: "classifier.timeout_ms".to_string(),
                message: format!(
                    "{:?} must be shorter than the redelivery window {:?}",
                    self.classifier_timeout(),
                    self.kafka.redelivery_window()
                ),
            });
        }
        if self.metadata.max_tags == 0 {
            return Err(ConfigError::InvalidValue {
                key: "metadata.max_tags".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier.timeout_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            tag_attribute: default_tag_attribute(),
            timestamp_attribute: default_timestamp_attribute(),
            max_tags: default_max_tags(),
        }
    }
}

impl ClassifierConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: default_classifier_endpoint(),
            api_key: api_key.into(),
            api_version: default_api_version(),
            timeout_ms: default_classifier_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            service: ServiceConfig::default(),
            kafka: KafkaConfig::new("localhost:9092"),
            classifier: ClassifierConfig::new("secret"),
            metadata: MetadataConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        let config = config();
        assert_eq!(config.classifier_timeout(), Duration::from_secs(30));
        assert_eq!(config.metadata.tag_attribute, "X-Object-Meta-Classification-Tags");
        assert_eq!(config.metadata.timestamp_attribute, "X-Timestamp");
        assert_eq!(config.metadata.max_tags, 3);
        assert_eq!(config.service.log_format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_classifier_timeout_must_fit_redelivery_window() {
        let mut config = config();
        config.classifier.timeout_ms = config.kafka.consumer.max_poll_interval_ms;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "classifier.timeout_ms"
        ));
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let mut config = config();
        config.classifier.api_key = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: Config = config::Config::builder()
            .set_override("kafka.bootstrap_servers", "broker:9092")
            .unwrap()
            .set_override("classifier.api_key", "k")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.kafka.queue.name, "visual-insights.enrichment");
        assert_eq!(config.classifier.api_version, "2016-05-20");
        assert_eq!(config.service.name, "insight-tagger");
    }
}
