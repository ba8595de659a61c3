//! Sources the collectors read from.
//!
//! The collectors never talk SQL or HTTP themselves; they call one of the
//! adapter traits below and turn the typed rows into raw samples:
//!
//! ```text
//!   Collector ──► DatabaseSource ──► PgSource (postgres client, blocking pool)
//!             │                  └─► MockDatabase (tests)
//!             └─► CloudMetricsSource ──► MockCloudMetrics (tests)
//! ```

pub mod mock;
pub mod pg;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CollectError;
use crate::model::SampleKind;

pub use self::pg::{PgConnectionConfig, PgSource, SslMode};

// ============================================================
// Row types
// ============================================================

/// One database-wide status value (`pg_stat_database` sums, bgwriter, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct StatusValue {
    /// Source view, e.g. `pg_stat_database`.
    pub view: String,
    pub name: String,
    pub value: f64,
    pub kind: SampleKind,
    pub unit: String,
}

impl StatusValue {
    pub fn counter(view: &str, name: &str, value: f64, unit: &str) -> Self {
        Self {
            view: view.to_string(),
            name: name.to_string(),
            value,
            kind: SampleKind::Counter,
            unit: unit.to_string(),
        }
    }

    pub fn gauge(view: &str, name: &str, value: f64, unit: &str) -> Self {
        Self {
            kind: SampleKind::Gauge,
            ..Self::counter(view, name, value, unit)
        }
    }
}

/// Numeric server setting ("knob").
#[derive(Debug, Clone, PartialEq)]
pub struct Setting {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

/// Per-table counters and sizes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableStats {
    pub schema: String,
    pub name: String,
    pub seq_scan: i64,
    pub seq_tup_read: i64,
    pub idx_scan: i64,
    pub idx_tup_fetch: i64,
    pub n_tup_ins: i64,
    pub n_tup_upd: i64,
    pub n_tup_del: i64,
    pub n_tup_hot_upd: i64,
    pub n_live_tup: i64,
    pub n_dead_tup: i64,
    pub vacuum_count: i64,
    pub autovacuum_count: i64,
    pub analyze_count: i64,
    pub autoanalyze_count: i64,
    pub heap_blks_read: i64,
    pub heap_blks_hit: i64,
    pub idx_blks_read: i64,
    pub idx_blks_hit: i64,
    pub relation_size: i64,
    pub indexes_size: i64,
    pub toast_size: i64,
}

impl TableStats {
    pub fn key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn total_size(&self) -> i64 {
        self.relation_size + self.indexes_size + self.toast_size
    }

    /// Scans plus row modifications since the statistics were last reset.
    pub fn activity(&self) -> i64 {
        self.seq_scan + self.idx_scan + self.n_tup_ins + self.n_tup_upd + self.n_tup_del
    }
}

/// Per-index counters and size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexStats {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub idx_scan: i64,
    pub idx_tup_read: i64,
    pub idx_tup_fetch: i64,
    pub idx_blks_read: i64,
    pub idx_blks_hit: i64,
    pub size: i64,
}

impl IndexStats {
    pub fn key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Aggregate statistics of one statement fingerprint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementStats {
    pub queryid: i64,
    pub datname: String,
    pub usename: String,
    /// False for statements executed inside functions (PostgreSQL 14+ with
    /// `pg_stat_statements.track = all`). Older servers report only top level.
    pub toplevel: bool,
    pub calls: i64,
    /// Milliseconds.
    pub total_exec_time: f64,
    /// Milliseconds.
    pub mean_exec_time: f64,
    pub rows: i64,
}

/// One session currently executing a statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveQuery {
    pub pid: i32,
    pub datname: String,
    pub usename: String,
    pub state: String,
    pub wait_event: String,
    pub query: String,
    pub query_start: DateTime<Utc>,
    pub running_for: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub ordinal: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub is_unique: bool,
    pub is_primary: bool,
}

/// Structural metadata of user schemas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableDef>,
    pub indexes: Vec<IndexDef>,
}

// ============================================================
// Entity ranking
// ============================================================

/// Order used to pick the tables kept when there are more than the limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableRanking {
    /// Estimated live rows, descending.
    #[default]
    LiveTuples,
    /// Heap + indexes + toast bytes, descending.
    TotalSize,
    /// Scans plus modified rows, descending.
    Activity,
}

/// Order used to pick the indexes kept when there are more than the limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexRanking {
    /// On-disk size, descending.
    #[default]
    Size,
    /// Index scans, descending.
    Scans,
}

// ============================================================
// Adapter traits
// ============================================================

/// Database introspection adapter.
///
/// Implementations return typed rows; they never diff or filter beyond the
/// requested limits.
#[async_trait]
pub trait DatabaseSource: Send + Sync + 'static {
    /// Engine-wide counters and gauges.
    async fn server_status(&self) -> Result<Vec<StatusValue>, CollectError>;

    /// Numeric configuration parameters.
    async fn settings(&self) -> Result<Vec<Setting>, CollectError>;

    /// Up to `limit` tables, ordered by `ranking`.
    async fn table_stats(
        &self,
        limit: usize,
        ranking: TableRanking,
    ) -> Result<Vec<TableStats>, CollectError>;

    /// Up to `limit` indexes, ordered by `ranking`.
    async fn index_stats(
        &self,
        limit: usize,
        ranking: IndexRanking,
    ) -> Result<Vec<IndexStats>, CollectError>;

    /// Up to `limit` statement fingerprints, by total execution time.
    async fn statement_stats(&self, limit: usize) -> Result<Vec<StatementStats>, CollectError>;

    /// Sessions whose current statement has been running at least `min_duration`.
    async fn active_queries(&self, min_duration: Duration)
    -> Result<Vec<ActiveQuery>, CollectError>;

    async fn schema(&self) -> Result<SchemaSnapshot, CollectError>;
}

/// One point returned by the cloud monitoring API.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudDatapoint {
    pub metric_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Cloud monitoring adapter:
/// `list_metrics(resource_id, metric_names, period) -> [(metric_name, timestamp, value)]`.
#[async_trait]
pub trait CloudMetricsSource: Send + Sync + 'static {
    async fn list_metrics(
        &self,
        resource_id: &str,
        metric_names: &[String],
        period: Duration,
    ) -> Result<Vec<CloudDatapoint>, CollectError>;
}
