//! Agent wiring: configuration in, scheduler and dispatcher running.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::{
    CloudMetricsCollector, Collector, CollectorKind, HealthReportCollector, IndexStatsCollector,
    LongRunningQueryCollector, QueryMonitorCollector, SchemaMonitorCollector,
    ServerStatusCollector, TableStatsCollector,
};
use crate::config::{AgentConfig, ConfigError};
use crate::dispatcher::Dispatcher;
use crate::export::BatchExporter;
use crate::health::HealthRegistry;
use crate::ingest::{EndpointError, HttpIngest, IngestTransport};
use crate::scheduler::{JobSpec, Scheduler};
use crate::snapshot::SnapshotStore;
use crate::source::{CloudMetricsSource, DatabaseSource, PgSource};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// How the agent stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Shutdown was requested.
    Clean,
    /// The ingestion service rejected the credentials.
    FatalAuth,
}

impl AgentExit {
    pub fn code(self) -> i32 {
        match self {
            AgentExit::Clean => 0,
            AgentExit::FatalAuth => 2,
        }
    }
}

/// Builds the database source of one job.
pub type SourceFactory = dyn Fn(CollectorKind) -> Arc<dyn DatabaseSource> + Send + Sync;

pub struct Agent {
    config: AgentConfig,
    health: HealthRegistry,
    transport: Arc<dyn IngestTransport>,
    sources: Box<SourceFactory>,
    cloud: Option<Arc<dyn CloudMetricsSource>>,
}

impl Agent {
    /// Agent talking to PostgreSQL and the HTTP ingestion endpoint.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let transport =
            HttpIngest::new(&config.server_url, &config.api_key, config.request_timeout())?;
        info!(url = %transport.url(), "ingestion endpoint");

        let pg_config = config.clone();
        let sources = Box::new(move |kind: CollectorKind| {
            let conn = pg_config.pg_connection(&format!("dbwatch-{kind}"));
            Arc::new(PgSource::new(conn)) as Arc<dyn DatabaseSource>
        });
        Ok(Self::with_parts(config, Arc::new(transport), sources))
    }

    pub fn with_parts(
        config: AgentConfig,
        transport: Arc<dyn IngestTransport>,
        sources: Box<SourceFactory>,
    ) -> Self {
        Self {
            config,
            health: HealthRegistry::new(),
            transport,
            sources,
            cloud: None,
        }
    }

    pub fn with_cloud_source(mut self, cloud: Arc<dyn CloudMetricsSource>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// One job per collector kind, each with its own source handle so that
    /// jobs never share a database connection.
    pub fn jobs(&self) -> Vec<JobSpec> {
        let c = &self.config.collectors;
        let mut jobs = Vec::with_capacity(CollectorKind::ALL.len());

        for kind in CollectorKind::ALL {
            let name = kind.as_str();
            let collector: Arc<dyn Collector> = match kind {
                CollectorKind::ServerStatus => {
                    Arc::new(ServerStatusCollector::new(name, (self.sources)(kind)))
                }
                CollectorKind::TableStats => Arc::new(TableStatsCollector::new(
                    name,
                    (self.sources)(kind),
                    c.table_stats.max_entities,
                    c.table_stats.rank_by,
                )),
                CollectorKind::IndexStats => Arc::new(IndexStatsCollector::new(
                    name,
                    (self.sources)(kind),
                    c.index_stats.max_entities,
                    c.index_stats.rank_by,
                )),
                CollectorKind::QueryMonitor => Arc::new(QueryMonitorCollector::new(
                    name,
                    (self.sources)(kind),
                    c.query_monitor.max_entities,
                )),
                CollectorKind::LongRunningQuery => Arc::new(LongRunningQueryCollector::new(
                    name,
                    (self.sources)(kind),
                    c.long_running_query.threshold(),
                )),
                CollectorKind::SchemaMonitor => {
                    Arc::new(SchemaMonitorCollector::new(name, (self.sources)(kind)))
                }
                CollectorKind::CloudMetrics => {
                    let Some(cloud) = self.cloud.clone() else {
                        if self.config.is_enabled(kind) {
                            warn!(job = name, "no cloud metrics adapter, job not started");
                        }
                        continue;
                    };
                    Arc::new(CloudMetricsCollector::new(
                        name,
                        cloud,
                        c.cloud_metrics.resource_id.clone(),
                        c.cloud_metrics.metric_names.clone(),
                        std::time::Duration::from_secs(c.cloud_metrics.period_secs),
                    ))
                }
                CollectorKind::HealthReport => {
                    Arc::new(HealthReportCollector::new(name, self.health.clone()))
                }
            };

            let mut spec = JobSpec::new(
                collector,
                self.config.interval(kind),
                self.config.timeout(kind),
            );
            if !self.config.is_enabled(kind) {
                spec = spec.disabled();
            }
            jobs.push(spec);
        }
        jobs
    }

    /// Runs until `shutdown` is cancelled or the ingestion service rejects
    /// the credentials.
    pub async fn run(self, shutdown: CancellationToken) -> AgentExit {
        let jobs = self.jobs();

        let (mut dispatcher, handle) = Dispatcher::new(
            self.config.dispatcher_config(),
            self.config.identity(),
            Arc::clone(&self.transport),
            self.health.clone(),
        );
        if self.config.export.enabled {
            info!(directory = %self.config.export.directory.display(), "batch export enabled");
            dispatcher = dispatcher.with_exporter(BatchExporter::new(
                self.config.export.directory.clone(),
                self.config.organization_id.clone(),
            ));
        }

        let scheduler = Scheduler::new(
            jobs,
            self.config.scheduler_config(),
            SnapshotStore::new(),
            self.health.clone(),
            Arc::new(handle),
        );

        let fatal = CancellationToken::new();
        let stop_scheduler = shutdown.child_token();
        let stop_dispatcher = CancellationToken::new();

        let dispatcher_task =
            tokio::spawn(dispatcher.run(stop_dispatcher.clone(), fatal.clone()));
        let scheduler_task = tokio::spawn(scheduler.run(stop_scheduler.clone()));

        tokio::select! {
            _ = shutdown.cancelled() => info!("shutdown requested"),
            _ = fatal.cancelled() => {
                error!("stopping collection, ingestion credentials were rejected");
                stop_scheduler.cancel();
            }
        }

        if let Err(e) = scheduler_task.await {
            error!(error = %e, "scheduler task failed");
        }
        // Ticks drained by the scheduler are still flushed.
        stop_dispatcher.cancel();
        if let Err(e) = dispatcher_task.await {
            error!(error = %e, "dispatcher task failed");
        }

        if self.health.is_fatal() {
            AgentExit::FatalAuth
        } else {
            AgentExit::Clean
        }
    }
}
