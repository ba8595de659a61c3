//! Agent configuration.
//!
//! Loaded from YAML, overridden from the command line / environment, then
//! validated. Every section has defaults, so an almost empty file is enough:
//!
//! ```yaml
//! server_url: https://ingest.example.com
//! api_key: ...
//! organization_id: org-1
//! db_key: orders-primary
//! database:
//!   host: orders.cluster-xyz.rds.amazonaws.com
//!   user: monitor
//!   enable_iam_auth: true
//!   auth_token_file: /var/run/dbwatch/token
//!   sslmode: require
//! collectors:
//!   table_stats:
//!     max_entities: 500
//!     rank_by: total_size
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::collector::CollectorKind;
use crate::dispatcher::{DispatcherConfig, RetryPolicy};
use crate::ingest::{AgentIdentity, validate_endpoint_url};
use crate::scheduler::SchedulerConfig;
use crate::source::{IndexRanking, PgConnectionConfig, SslMode, TableRanking};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("config validation error: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    pub sslmode: SslMode,
    pub enable_iam_auth: bool,
    pub auth_token_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub statement_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            dbname: "postgres".to_string(),
            sslmode: SslMode::default(),
            enable_iam_auth: false,
            auth_token_file: None,
            connect_timeout_secs: 10,
            statement_timeout_secs: 30,
        }
    }
}

/// Settings every job has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub enabled: bool,
    /// Falls back to the collector's default interval.
    pub interval_secs: Option<u64>,
    /// Falls back to `scheduler.tick_timeout_secs`.
    pub timeout_secs: Option<u64>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: None,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableStatsConfig {
    #[serde(flatten)]
    pub job: JobConfig,
    pub max_entities: usize,
    pub rank_by: TableRanking,
}

impl Default for TableStatsConfig {
    fn default() -> Self {
        Self {
            job: JobConfig::default(),
            max_entities: 1000,
            rank_by: TableRanking::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexStatsConfig {
    #[serde(flatten)]
    pub job: JobConfig,
    pub max_entities: usize,
    pub rank_by: IndexRanking,
}

impl Default for IndexStatsConfig {
    fn default() -> Self {
        Self {
            job: JobConfig::default(),
            max_entities: 10_000,
            rank_by: IndexRanking::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryMonitorConfig {
    #[serde(flatten)]
    pub job: JobConfig,
    pub max_entities: usize,
}

impl Default for QueryMonitorConfig {
    fn default() -> Self {
        Self {
            job: JobConfig::default(),
            max_entities: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LongRunningQueryConfig {
    #[serde(flatten)]
    pub job: JobConfig,
    pub latency_threshold_min: u64,
}

impl Default for LongRunningQueryConfig {
    fn default() -> Self {
        Self {
            job: JobConfig::default(),
            latency_threshold_min: 5,
        }
    }
}

impl LongRunningQueryConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.latency_threshold_min * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudMetricsConfig {
    #[serde(flatten)]
    pub job: JobConfig,
    pub resource_id: String,
    pub metric_names: Vec<String>,
    pub period_secs: u64,
}

impl Default for CloudMetricsConfig {
    fn default() -> Self {
        Self {
            job: JobConfig {
                enabled: false,
                ..JobConfig::default()
            },
            resource_id: String::new(),
            metric_names: [
                "CPUUtilization",
                "FreeableMemory",
                "FreeStorageSpace",
                "ReadIOPS",
                "WriteIOPS",
                "ReadLatency",
                "WriteLatency",
                "DatabaseConnections",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            period_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorsConfig {
    pub server_status: JobConfig,
    pub table_stats: TableStatsConfig,
    pub index_stats: IndexStatsConfig,
    pub query_monitor: QueryMonitorConfig,
    pub long_running_query: LongRunningQueryConfig,
    pub schema_monitor: JobConfig,
    pub cloud_metrics: CloudMetricsConfig,
    pub health_report: JobConfig,
}

impl CollectorsConfig {
    pub fn job(&self, kind: CollectorKind) -> &JobConfig {
        match kind {
            CollectorKind::ServerStatus => &self.server_status,
            CollectorKind::TableStats => &self.table_stats.job,
            CollectorKind::IndexStats => &self.index_stats.job,
            CollectorKind::QueryMonitor => &self.query_monitor.job,
            CollectorKind::LongRunningQuery => &self.long_running_query.job,
            CollectorKind::SchemaMonitor => &self.schema_monitor,
            CollectorKind::CloudMetrics => &self.cloud_metrics.job,
            CollectorKind::HealthReport => &self.health_report,
        }
    }

    pub fn job_mut(&mut self, kind: CollectorKind) -> &mut JobConfig {
        match kind {
            CollectorKind::ServerStatus => &mut self.server_status,
            CollectorKind::TableStats => &mut self.table_stats.job,
            CollectorKind::IndexStats => &mut self.index_stats.job,
            CollectorKind::QueryMonitor => &mut self.query_monitor.job,
            CollectorKind::LongRunningQuery => &mut self.long_running_query.job,
            CollectorKind::SchemaMonitor => &mut self.schema_monitor,
            CollectorKind::CloudMetrics => &mut self.cloud_metrics.job,
            CollectorKind::HealthReport => &mut self.health_report,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_timeout_secs: u64,
    pub max_jitter_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_timeout_secs: 30,
            max_jitter_secs: 10,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub flush_interval_secs: u64,
    pub max_batch_size: usize,
    pub max_buffered: usize,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
            max_batch_size: 5_000,
            max_buffered: 50_000,
            max_retries: 3,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_secs: 30,
            request_timeout_secs: 10,
        }
    }
}

impl DispatcherSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub enabled: bool,
    pub directory: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("/var/lib/dbwatch/export"),
        }
    }
}

// =============================================================================
// Agent configuration
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server_url: String,
    pub api_key: String,
    pub organization_id: String,
    pub db_key: String,
    pub database: DatabaseConfig,
    pub collectors: CollectorsConfig,
    pub scheduler: SchedulerSection,
    pub dispatcher: DispatcherSection,
    pub export: ExportConfig,
}

/// Values given on the command line or in the environment. `None` keeps the
/// file's value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    pub organization_id: Option<String>,
    pub db_key: Option<String>,
    pub db_host: Option<String>,
    pub db_port: Option<u16>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub db_name: Option<String>,
    pub enable_iam_auth: Option<bool>,
    pub auth_token_file: Option<PathBuf>,
    pub disabled: Vec<CollectorKind>,
    pub intervals: Vec<(CollectorKind, u64)>,
    pub max_tables: Option<usize>,
    pub max_indexes: Option<usize>,
    pub max_queries: Option<usize>,
    pub latency_threshold_min: Option<u64>,
    pub export_directory: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Reads the file without validating it; overrides come first.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn apply(&mut self, o: ConfigOverrides) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(v) = value {
                *slot = v;
            }
        }

        set(&mut self.server_url, o.server_url);
        set(&mut self.api_key, o.api_key);
        set(&mut self.organization_id, o.organization_id);
        set(&mut self.db_key, o.db_key);

        let db = &mut self.database;
        set(&mut db.host, o.db_host);
        set(&mut db.port, o.db_port);
        set(&mut db.user, o.db_user);
        if o.db_password.is_some() {
            db.password = o.db_password;
        }
        set(&mut db.dbname, o.db_name);
        set(&mut db.enable_iam_auth, o.enable_iam_auth);
        if o.auth_token_file.is_some() {
            db.auth_token_file = o.auth_token_file;
        }

        for kind in o.disabled {
            self.collectors.job_mut(kind).enabled = false;
        }
        for (kind, secs) in o.intervals {
            self.collectors.job_mut(kind).interval_secs = Some(secs);
        }
        set(&mut self.collectors.table_stats.max_entities, o.max_tables);
        set(&mut self.collectors.index_stats.max_entities, o.max_indexes);
        set(&mut self.collectors.query_monitor.max_entities, o.max_queries);
        set(
            &mut self.collectors.long_running_query.latency_threshold_min,
            o.latency_threshold_min,
        );
        if let Some(dir) = o.export_directory {
            self.export.enabled = true;
            self.export.directory = dir;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("api_key", &self.api_key),
            ("organization_id", &self.organization_id),
            ("db_key", &self.db_key),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("{field} must not be empty")));
            }
        }
        validate_endpoint_url(&self.server_url).map_err(|e| invalid(e.to_string()))?;

        for kind in CollectorKind::ALL {
            let interval = self.interval(kind);
            if interval < kind.min_interval() {
                return Err(invalid(format!(
                    "{kind} interval must be at least {}s, got {}s",
                    kind.min_interval().as_secs(),
                    interval.as_secs()
                )));
            }
            if self.timeout(kind).is_zero() {
                return Err(invalid(format!("{kind} timeout must be greater than 0")));
            }
        }

        let c = &self.collectors;
        for (name, n) in [
            ("table_stats.max_entities", c.table_stats.max_entities),
            ("index_stats.max_entities", c.index_stats.max_entities),
            ("query_monitor.max_entities", c.query_monitor.max_entities),
        ] {
            if n == 0 {
                return Err(invalid(format!("{name} must be greater than 0")));
            }
        }
        if c.long_running_query.latency_threshold_min == 0 {
            return Err(invalid("long_running_query.latency_threshold_min must be greater than 0"));
        }
        if c.cloud_metrics.job.enabled {
            if c.cloud_metrics.resource_id.trim().is_empty() {
                return Err(invalid("cloud_metrics.resource_id must be set when enabled"));
            }
            if c.cloud_metrics.period_secs == 0 {
                return Err(invalid("cloud_metrics.period_secs must be greater than 0"));
            }
        }

        let db = &self.database;
        if db.host.trim().is_empty() {
            return Err(invalid("database.host must not be empty"));
        }
        if db.enable_iam_auth {
            if db.auth_token_file.is_none() {
                return Err(invalid("database.auth_token_file is required with enable_iam_auth"));
            }
            if db.sslmode == SslMode::Disable {
                return Err(invalid("database.sslmode must not be disable with enable_iam_auth"));
            }
        }

        let d = &self.dispatcher;
        if d.max_batch_size == 0 {
            return Err(invalid("dispatcher.max_batch_size must be greater than 0"));
        }
        if d.max_buffered < d.max_batch_size {
            return Err(invalid("dispatcher.max_buffered must be at least max_batch_size"));
        }
        if d.flush_interval_secs == 0 || d.request_timeout_secs == 0 {
            return Err(invalid(
                "dispatcher.flush_interval_secs and request_timeout_secs must be greater than 0",
            ));
        }
        d.retry_policy()
            .validate()
            .map_err(|e| invalid(format!("dispatcher retry schedule: {e}")))?;

        if self.export.enabled && self.export.directory.as_os_str().is_empty() {
            return Err(invalid("export.directory must be set when export is enabled"));
        }

        if !c.health_report.enabled {
            warn!("health_report cannot be disabled, ignoring enabled: false");
        }
        Ok(())
    }

    /// Whether the job for `kind` runs. The heartbeat always does.
    pub fn is_enabled(&self, kind: CollectorKind) -> bool {
        kind == CollectorKind::HealthReport || self.collectors.job(kind).enabled
    }

    pub fn interval(&self, kind: CollectorKind) -> Duration {
        self.collectors
            .job(kind)
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| kind.default_interval())
    }

    pub fn timeout(&self, kind: CollectorKind) -> Duration {
        Duration::from_secs(
            self.collectors
                .job(kind)
                .timeout_secs
                .unwrap_or(self.scheduler.tick_timeout_secs),
        )
    }

    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            organization_id: self.organization_id.clone(),
            db_key: self.db_key.clone(),
        }
    }

    pub fn pg_connection(&self, application_name: &str) -> PgConnectionConfig {
        let db = &self.database;
        PgConnectionConfig {
            host: db.host.clone(),
            port: db.port,
            user: db.user.clone(),
            password: db.password.clone(),
            dbname: db.dbname.clone(),
            sslmode: db.sslmode,
            auth_token_file: if db.enable_iam_auth {
                db.auth_token_file.clone()
            } else {
                None
            },
            connect_timeout: Duration::from_secs(db.connect_timeout_secs),
            statement_timeout: Duration::from_secs(db.statement_timeout_secs),
            application_name: application_name.to_string(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_jitter: Duration::from_secs(self.scheduler.max_jitter_secs),
            shutdown_grace: Duration::from_secs(self.scheduler.shutdown_grace_secs),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let d = &self.dispatcher;
        DispatcherConfig {
            flush_interval: Duration::from_secs(d.flush_interval_secs),
            max_batch_size: d.max_batch_size,
            max_buffered: d.max_buffered,
            retry: d.retry_policy(),
            shutdown_grace: Duration::from_secs(self.scheduler.shutdown_grace_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatcher.request_timeout_secs)
    }
}
