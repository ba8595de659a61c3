//! Collectors: one external source read per tick, turned into raw samples.
//!
//! ```text
//!   tick ──► Collector::sample() ──► Vec<RawSample> ──► rates::normalize_all
//! ```
//!
//! A collector never diffs, never retries and never enforces its own time
//! budget; the scheduler does all three around it.

mod cloud;
mod health;
mod indexes;
mod long_running;
mod queries;
mod schema;
mod server_status;
mod tables;

pub use cloud::CloudMetricsCollector;
pub use health::HealthReportCollector;
pub use indexes::{IndexStatsCollector, rank_indexes};
pub use long_running::{LongRunningQueryCollector, query_fingerprint};
pub use queries::QueryMonitorCollector;
pub use schema::SchemaMonitorCollector;
pub use server_status::ServerStatusCollector;
pub use tables::{TableStatsCollector, rank_tables};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CollectError;
use crate::model::{Dimensions, RawSample};

/// Capability shared by every collector variant.
#[async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Stable name; also the snapshot partition of the owning job.
    fn name(&self) -> &str;

    /// Reads the source once. A failure discards everything read so far.
    async fn sample(&self) -> Result<Vec<RawSample>, CollectError>;

    /// Called after a successful tick's observations reached the dispatcher.
    /// Not called for failed, timed out or abandoned ticks.
    fn handed_off(&self) {}
}

/// The closed set of collector variants the agent knows how to configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    ServerStatus,
    TableStats,
    IndexStats,
    QueryMonitor,
    LongRunningQuery,
    SchemaMonitor,
    CloudMetrics,
    HealthReport,
}

impl CollectorKind {
    pub const ALL: [CollectorKind; 8] = [
        CollectorKind::ServerStatus,
        CollectorKind::TableStats,
        CollectorKind::IndexStats,
        CollectorKind::QueryMonitor,
        CollectorKind::LongRunningQuery,
        CollectorKind::SchemaMonitor,
        CollectorKind::CloudMetrics,
        CollectorKind::HealthReport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CollectorKind::ServerStatus => "server_status",
            CollectorKind::TableStats => "table_stats",
            CollectorKind::IndexStats => "index_stats",
            CollectorKind::QueryMonitor => "query_monitor",
            CollectorKind::LongRunningQuery => "long_running_query",
            CollectorKind::SchemaMonitor => "schema_monitor",
            CollectorKind::CloudMetrics => "cloud_metrics",
            CollectorKind::HealthReport => "health_report",
        }
    }

    pub fn default_interval(self) -> Duration {
        Duration::from_secs(match self {
            CollectorKind::ServerStatus => 60,
            CollectorKind::TableStats | CollectorKind::IndexStats => 300,
            CollectorKind::QueryMonitor => 300,
            CollectorKind::LongRunningQuery => 60,
            CollectorKind::SchemaMonitor => 3600,
            CollectorKind::CloudMetrics => 60,
            CollectorKind::HealthReport => 60,
        })
    }

    /// Shortest interval accepted by configuration validation.
    pub fn min_interval(self) -> Duration {
        Duration::from_secs(match self {
            CollectorKind::ServerStatus => 60,
            CollectorKind::TableStats
            | CollectorKind::IndexStats
            | CollectorKind::QueryMonitor
            | CollectorKind::SchemaMonitor => 300,
            CollectorKind::LongRunningQuery
            | CollectorKind::CloudMetrics
            | CollectorKind::HealthReport => 1,
        })
    }
}

impl fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulates the samples of one entity, sharing key, time and dimensions.
pub(crate) struct EntitySamples<'a> {
    out: &'a mut Vec<RawSample>,
    entity_key: String,
    captured_at: DateTime<Utc>,
    dimensions: Dimensions,
}

impl<'a> EntitySamples<'a> {
    pub(crate) fn new(
        out: &'a mut Vec<RawSample>,
        entity_key: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            out,
            entity_key: entity_key.into(),
            captured_at,
            dimensions: Dimensions::new(),
        }
    }

    pub(crate) fn dimension(mut self, key: &str, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.to_string(), value.into());
        self
    }

    pub(crate) fn counter(&mut self, metric: &str, value: i64, unit: &str) -> &mut Self {
        self.counter_f64(metric, value as f64, unit)
    }

    pub(crate) fn counter_f64(&mut self, metric: &str, value: f64, unit: &str) -> &mut Self {
        self.out.push(
            RawSample::counter(
                self.entity_key.as_str(),
                metric,
                value,
                unit,
                self.captured_at,
            )
            .with_dimensions(&self.dimensions),
        );
        self
    }

    pub(crate) fn gauge(&mut self, metric: &str, value: f64, unit: &str) -> &mut Self {
        self.out.push(
            RawSample::gauge(
                self.entity_key.as_str(),
                metric,
                value,
                unit,
                self.captured_at,
            )
            .with_dimensions(&self.dimensions),
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SampleKind;

    #[test]
    fn entity_samples_share_key_and_dimensions() {
        let mut out = Vec::new();
        let at = Utc::now();
        EntitySamples::new(&mut out, "public.orders", at)
            .dimension("schema", "public")
            .dimension("table", "orders")
            .counter("table_seq_scans", 4, "count")
            .gauge("table_live_rows", 10.0, "rows");

        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|s| s.entity_key == "public.orders"));
        assert!(out.iter().all(|s| s.captured_at == at));
        assert_eq!(out[0].kind, SampleKind::Counter);
        assert_eq!(out[1].kind, SampleKind::Gauge);
        assert_eq!(out[1].dimensions.get("table").map(String::as_str), Some("orders"));
    }

    #[test]
    fn kind_names_round_trip_through_serde() {
        for kind in CollectorKind::ALL {
            let yaml = serde_yaml::to_string(&kind).unwrap();
            assert_eq!(yaml.trim(), kind.as_str());
            let back: CollectorKind = serde_yaml::from_str(&yaml).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn defaults_respect_minimums() {
        for kind in CollectorKind::ALL {
            assert!(kind.default_interval() >= kind.min_interval(), "{kind}");
        }
    }
}
