//! Kafka configuration for the enrichment channel.
//!
//! The channel is a single queue (topic) shared by every tagger process in one
//! consumer group. Offsets are committed manually, one message at a time, so
//! auto commit is always off.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SSL/TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslConfig {
    /// Path to CA certificate file
    pub ca_location: Option<String>,
    /// Path to client certificate file
    pub certificate_location: Option<String>,
    /// Path to client private key file
    pub key_location: Option<String>,
}

/// SASL PLAIN credentials
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Enrichment queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Topic carrying enrichment events
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Pause before a released message is fetched again
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
    /// How long a publish may wait for broker acknowledgment
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

fn default_queue_name() -> String {
    "visual-insights.enrichment".to_string()
}

fn default_redelivery_delay_ms() -> u64 {
    5000
}

fn default_publish_timeout_ms() -> u64 {
    10000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

/// Consumer group settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group shared by all tagger processes
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// Upper bound on the time spent processing one message before the
    /// broker hands its partition to another group member
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

fn default_group_id() -> String {
    "visual-insights-tagger".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_max_poll_interval() -> u64 {
    300000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

/// Main Kafka configuration for the enrichment channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub sasl: SaslConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_client_id() -> String {
    "visual-insights".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            queue: QueueConfig::default(),
            consumer: ConsumerConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    /// Create a new KafkaConfig with the specified bootstrap servers
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `KAFKA_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let bootstrap_servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .unwrap_or_else(|_| "localhost:9092".to_string());

        let mut config = Self::new(bootstrap_servers);

        if let Ok(client_id) = std::env::var("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Ok(queue) = std::env::var("KAFKA_QUEUE_NAME") {
            config.queue.name = queue;
        }
        if let Ok(group_id) = std::env::var("KAFKA_GROUP_ID") {
            config.consumer.group_id = group_id;
        }
        if let Ok(protocol) = std::env::var("KAFKA_SECURITY_PROTOCOL") {
            config.security_protocol = match protocol.to_lowercase().as_str() {
                "ssl" => SecurityProtocol::Ssl,
                "sasl_plaintext" => SecurityProtocol::SaslPlaintext,
                "sasl_ssl" => SecurityProtocol::SaslSsl,
                "plaintext" => SecurityProtocol::Plaintext,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "KAFKA_SECURITY_PROTOCOL".to_string(),
                        message: format!("unknown protocol '{}'", other),
                    })
                }
            };
        }
        if let Ok(username) = std::env::var("KAFKA_SASL_USERNAME") {
            config.sasl.username = Some(username);
        }
        if let Ok(password) = std::env::var("KAFKA_SASL_PASSWORD") {
            config.sasl.password = Some(password);
        }
        if let Ok(ca) = std::env::var("KAFKA_SSL_CA_LOCATION") {
            config.ssl.ca_location = Some(ca);
        }

        config.validate()?;
        Ok(config)
    }

    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", "PLAIN");
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();
        config.set("acks", "all");
        config.set("enable.idempotence", "true");
        config.set("message.timeout.ms", self.queue.publish_timeout_ms.to_string());
        config
    }

    /// Build a consumer ClientConfig with manual, per-message commits
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", &self.consumer.group_id);
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set(
            "session.timeout.ms",
            self.consumer.session_timeout_ms.to_string(),
        );
        config.set(
            "max.poll.interval.ms",
            self.consumer.max_poll_interval_ms.to_string(),
        );

        config
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.publish_timeout_ms)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.queue.redelivery_delay_ms)
    }

    /// Window after which an unacknowledged message is handed to another consumer
    pub fn redelivery_window(&self) -> Duration {
        Duration::from_millis(self.consumer.max_poll_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::MissingRequired("bootstrap_servers".to_string()));
        }
        if self.queue.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired("queue.name".to_string()));
        }
        if self.consumer.group_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired("consumer.group_id".to_string()));
        }
        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "sasl.username (required for SASL)".to_string(),
            ));
        }
        Ok(())
    }
}
