//! Data model: raw samples produced by collectors, normalized observations
//! shipped to the ingestion service, and the batches that carry them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CollectError;

/// Dimension set attached to samples and observations.
///
/// Ordered so that serialized payloads are deterministic.
pub type Dimensions = BTreeMap<String, String>;

/// How a raw value must be interpreted by the diff engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// Cumulative, monotonically non-decreasing while the source lives.
    Counter,
    /// Point-in-time value, passed through unchanged.
    Gauge,
}

/// Unprocessed value read from a source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    /// Identity of the entity within one collector (table, query, metric...).
    pub entity_key: String,
    pub metric_name: String,
    pub raw_value: f64,
    pub captured_at: DateTime<Utc>,
    pub kind: SampleKind,
    /// Unit of `raw_value`. Counters are reported as `<unit>/s`.
    pub unit: String,
    pub dimensions: Dimensions,
}

impl RawSample {
    pub fn counter(
        entity_key: impl Into<String>,
        metric_name: impl Into<String>,
        raw_value: f64,
        unit: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            metric_name: metric_name.into(),
            raw_value,
            captured_at,
            kind: SampleKind::Counter,
            unit: unit.into(),
            dimensions: Dimensions::new(),
        }
    }

    pub fn gauge(
        entity_key: impl Into<String>,
        metric_name: impl Into<String>,
        raw_value: f64,
        unit: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: SampleKind::Gauge,
            ..Self::counter(entity_key, metric_name, raw_value, unit, captured_at)
        }
    }

    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    pub fn with_dimensions(mut self, dimensions: &Dimensions) -> Self {
        self.dimensions
            .extend(dimensions.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// Normalized rate-or-gauge value ready for delivery.
///
/// Fields are private: an observation is never modified after it leaves the
/// builder methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    metric_name: String,
    value: f64,
    unit: String,
    timestamp: DateTime<Utc>,
    dimensions: Dimensions,
}

impl Observation {
    pub fn new(
        metric_name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            metric_name: metric_name.into(),
            value,
            unit: unit.into(),
            timestamp,
            dimensions: Dimensions::new(),
        }
    }

    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions.extend(dimensions);
        self
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dimensions
    }

    pub fn dimension(&self, key: &str) -> Option<&str> {
        self.dimensions.get(key).map(String::as_str)
    }
}

/// What one job tick produced.
///
/// A failed tick carries no observations: partial results are discarded.
#[derive(Debug, Clone, Default)]
pub struct CollectorResult {
    pub observations: Vec<Observation>,
    pub error: Option<CollectError>,
}

impl CollectorResult {
    pub fn success(observations: Vec<Observation>) -> Self {
        Self {
            observations,
            error: None,
        }
    }

    pub fn failure(error: CollectError) -> Self {
        Self {
            observations: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Observations accumulated for one delivery.
#[derive(Debug, Clone)]
pub struct Batch {
    pub seq: u64,
    pub observations: Vec<Observation>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(seq: u64, observations: Vec<Observation>) -> Self {
        Self {
            seq,
            observations,
            attempt_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}
