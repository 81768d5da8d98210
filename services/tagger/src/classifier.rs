//! Visual classification client.
//!
//! Speaks the Watson Visual Recognition v3 `classify` contract: the image is
//! posted as the multipart field `images_file`, credentials and API version
//! travel as query parameters, and the answer lists `(class, score)` pairs for
//! the first image under its first classifier.

use crate::config::ClassifierConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument};

const IMAGE_FIELD: &str = "images_file";

/// Errors returned by the classification service. All of them are
/// transient from the pipeline's point of view.
#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Classifier request failed: {0}")]
    Network(String),

    #[error("Classifier returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Malformed classifier response: {0}")]
    Malformed(String),
}

/// One ranked label
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Label {
    #[serde(rename = "class")]
    pub name: String,
    #[serde(rename = "score")]
    pub confidence: f64,
}

impl Label {
    pub fn new(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

/// Black-box image classifier
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify raw image bytes, returning labels with confidence in `[0, 1]`
    async fn classify(&self, image: Vec<u8>, file_name: String) -> Result<Vec<Label>, ClassifierError>;
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    #[serde(default)]
    images: Vec<ClassifiedImage>,
}

#[derive(Debug, Deserialize)]
struct ClassifiedImage {
    #[serde(default)]
    classifiers: Vec<ClassifierResult>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ClassifierResult {
    #[serde(default)]
    classes: Vec<Label>,
}

impl ClassifyResponse {
    fn into_labels(self) -> Result<Vec<Label>, ClassifierError> {
        let image = self
            .images
            .into_iter()
            .next()
            .ok_or_else(|| ClassifierError::Malformed("no images in response".to_string()))?;
        if let Some(error) = image.error {
            return Err(ClassifierError::Malformed(format!("image rejected: {}", error)));
        }
        let classifier = image
            .classifiers
            .into_iter()
            .next()
            .ok_or_else(|| ClassifierError::Malformed("no classifiers in response".to_string()))?;

        if let Some(label) = classifier
            .classes
            .iter()
            .find(|l| !(0.0..=1.0).contains(&l.confidence))
        {
            return Err(ClassifierError::Malformed(format!(
                "score {} for '{}' is out of range",
                label.confidence, label.name
            )));
        }
        Ok(classifier.classes)
    }
}

/// Watson Visual Recognition client
pub struct WatsonClassifier {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: String,
    api_version: String,
}

impl WatsonClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ClassifierError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
        })
    }
}

#[async_trait]
impl Classifier for WatsonClassifier {
    #[instrument(skip(self, image), fields(bytes = image.len()))]
    async fn classify(&self, image: Vec<u8>, file_name: String) -> Result<Vec<Label>, ClassifierError> {
        let started = Instant::now();

        let part = reqwest::multipart::Part::bytes(image).file_name(file_name);
        let form = reqwest::multipart::Form::new().part(IMAGE_FIELD, part);

        let response = self
            .http_client
            .post(&self.endpoint)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("version", self.api_version.as_str()),
            ])
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClassifierError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::Malformed(e.to_string()))?;
        let labels = parsed.into_labels()?;

        debug!(
            labels = labels.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image classified"
        );
        Ok(labels)
    }
}
