//! Ranking of classifier labels into the stored tag set.

use crate::classifier::Label;
use crate::metadata_store::ObjectMetadata;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Ordered `label -> "NN.N%"` pairs, highest confidence first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(Vec<(String, String)>);

impl TagSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// JSON object text with entries in rank order
    pub fn to_json(&self) -> String {
        // Serializing string pairs cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Store the tags under `attribute`, leaving every other attribute as is
    pub fn merge_into(&self, metadata: &mut ObjectMetadata, attribute: &str) {
        metadata.insert(attribute, self.to_json());
    }
}

impl Serialize for TagSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, confidence) in &self.0 {
            map.serialize_entry(label, confidence)?;
        }
        map.end()
    }
}

/// Keep the `limit` best labels ordered by `(confidence, label)` descending.
/// A label reported more than once keeps its last score.
pub fn rank(labels: &[Label], limit: usize) -> TagSet {
    let mut scores: HashMap<&str, f64> = HashMap::with_capacity(labels.len());
    for label in labels {
        scores.insert(label.name.as_str(), label.confidence);
    }

    let mut ranked: Vec<(&str, f64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| match b.1.total_cmp(&a.1) {
        Ordering::Equal => b.0.cmp(a.0),
        other => other,
    });

    TagSet(
        ranked
            .into_iter()
            .take(limit)
            .map(|(name, confidence)| (name.to_string(), format_confidence(confidence)))
            .collect(),
    )
}

/// Percentage rounded to two decimals, shortest form with at least one
/// fractional digit: `0.95 -> "95.0%"`, `0.1235 -> "12.35%"`
pub fn format_confidence(confidence: f64) -> String {
    let percent = (confidence * 100.0 * 100.0).round() / 100.0;
    format!("{:?}%", percent)
}
