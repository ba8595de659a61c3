//! In-memory mock sources for testing collectors and the scheduler without a
//! running database or cloud account.
//!
//! Both mocks are cheap to clone and clones share state, so a test can keep
//! a handle, hand another to a collector, and change the returned rows
//! between ticks.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ActiveQuery, CloudDatapoint, CloudMetricsSource, DatabaseSource, IndexRanking, IndexStats,
    SchemaSnapshot, Setting, StatementStats, StatusValue, TableRanking, TableStats,
};
use crate::error::CollectError;

/// Adapter method, used to script failures and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceCall {
    ServerStatus,
    Settings,
    TableStats,
    IndexStats,
    StatementStats,
    ActiveQueries,
    Schema,
    CloudMetrics,
}

#[derive(Debug, Default)]
struct Script {
    /// One-shot failures, consumed before the persistent one.
    queued: HashMap<SourceCall, VecDeque<CollectError>>,
    /// Failure returned on every call until cleared.
    persistent: HashMap<SourceCall, CollectError>,
    calls: HashMap<SourceCall, usize>,
    delay: Duration,
}

impl Script {
    /// Records the call and returns the scripted failure, if any.
    fn enter(&mut self, call: SourceCall) -> (Duration, Option<CollectError>) {
        *self.calls.entry(call).or_default() += 1;
        let err = self
            .queued
            .get_mut(&call)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.persistent.get(&call).cloned());
        (self.delay, err)
    }
}

#[derive(Debug, Default)]
struct DbState {
    script: Script,
    status: Vec<StatusValue>,
    settings: Vec<Setting>,
    tables: Vec<TableStats>,
    indexes: Vec<IndexStats>,
    statements: Vec<StatementStats>,
    active: Vec<ActiveQuery>,
    schema: SchemaSnapshot,
}

/// Scripted [`DatabaseSource`].
///
/// Returns whatever rows were last set, unranked and untruncated: ranking
/// and limits are the collectors' job.
#[derive(Debug, Clone, Default)]
pub struct MockDatabase {
    state: Arc<Mutex<DbState>>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_server_status(&self, values: Vec<StatusValue>) {
        self.lock().status = values;
    }

    pub fn set_settings(&self, settings: Vec<Setting>) {
        self.lock().settings = settings;
    }

    pub fn set_tables(&self, tables: Vec<TableStats>) {
        self.lock().tables = tables;
    }

    pub fn set_indexes(&self, indexes: Vec<IndexStats>) {
        self.lock().indexes = indexes;
    }

    pub fn set_statements(&self, statements: Vec<StatementStats>) {
        self.lock().statements = statements;
    }

    pub fn set_active_queries(&self, active: Vec<ActiveQuery>) {
        self.lock().active = active;
    }

    pub fn set_schema(&self, schema: SchemaSnapshot) {
        self.lock().schema = schema;
    }

    /// Every call sleeps this long first (tokio time, so paused clocks apply).
    pub fn set_delay(&self, delay: Duration) {
        self.lock().script.delay = delay;
    }

    /// Fails the next call of `call` with `err`. May be queued repeatedly.
    pub fn fail_once(&self, call: SourceCall, err: CollectError) {
        self.lock()
            .script
            .queued
            .entry(call)
            .or_default()
            .push_back(err);
    }

    /// Fails every call of `call` until [`MockDatabase::clear_failure`].
    pub fn fail_always(&self, call: SourceCall, err: CollectError) {
        self.lock().script.persistent.insert(call, err);
    }

    pub fn clear_failure(&self, call: SourceCall) {
        let mut state = self.lock();
        state.script.persistent.remove(&call);
        state.script.queued.remove(&call);
    }

    /// Number of times `call` was invoked.
    pub fn calls(&self, call: SourceCall) -> usize {
        self.lock().script.calls.get(&call).copied().unwrap_or(0)
    }

    async fn respond<T>(
        &self,
        call: SourceCall,
        read: impl FnOnce(&DbState) -> T,
    ) -> Result<T, CollectError> {
        let (delay, err) = self.lock().script.enter(call);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match err {
            Some(err) => Err(err),
            None => Ok(read(&*self.lock())),
        }
    }
}

#[async_trait]
impl DatabaseSource for MockDatabase {
    async fn server_status(&self) -> Result<Vec<StatusValue>, CollectError> {
        self.respond(SourceCall::ServerStatus, |s| s.status.clone())
            .await
    }

    async fn settings(&self) -> Result<Vec<Setting>, CollectError> {
        self.respond(SourceCall::Settings, |s| s.settings.clone())
            .await
    }

    async fn table_stats(
        &self,
        _limit: usize,
        _ranking: TableRanking,
    ) -> Result<Vec<TableStats>, CollectError> {
        self.respond(SourceCall::TableStats, |s| s.tables.clone())
            .await
    }

    async fn index_stats(
        &self,
        _limit: usize,
        _ranking: IndexRanking,
    ) -> Result<Vec<IndexStats>, CollectError> {
        self.respond(SourceCall::IndexStats, |s| s.indexes.clone())
            .await
    }

    async fn statement_stats(&self, _limit: usize) -> Result<Vec<StatementStats>, CollectError> {
        self.respond(SourceCall::StatementStats, |s| s.statements.clone())
            .await
    }

    async fn active_queries(
        &self,
        min_duration: Duration,
    ) -> Result<Vec<ActiveQuery>, CollectError> {
        self.respond(SourceCall::ActiveQueries, |s| {
            s.active
                .iter()
                .filter(|q| q.running_for >= min_duration)
                .cloned()
                .collect()
        })
        .await
    }

    async fn schema(&self) -> Result<SchemaSnapshot, CollectError> {
        self.respond(SourceCall::Schema, |s| s.schema.clone()).await
    }
}

/// Arguments of the last `list_metrics` call.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudRequest {
    pub resource_id: String,
    pub metric_names: Vec<String>,
    pub period: Duration,
}

#[derive(Debug, Default)]
struct CloudState {
    script: Script,
    datapoints: Vec<CloudDatapoint>,
    last_request: Option<CloudRequest>,
}

/// Scripted [`CloudMetricsSource`].
#[derive(Debug, Clone, Default)]
pub struct MockCloudMetrics {
    state: Arc<Mutex<CloudState>>,
}

impl MockCloudMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_datapoints(&self, datapoints: Vec<CloudDatapoint>) {
        self.lock().datapoints = datapoints;
    }

    pub fn fail_once(&self, err: CollectError) {
        self.lock()
            .script
            .queued
            .entry(SourceCall::CloudMetrics)
            .or_default()
            .push_back(err);
    }

    pub fn last_request(&self) -> Option<CloudRequest> {
        self.lock().last_request.clone()
    }

    pub fn calls(&self) -> usize {
        self.lock()
            .script
            .calls
            .get(&SourceCall::CloudMetrics)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl CloudMetricsSource for MockCloudMetrics {
    async fn list_metrics(
        &self,
        resource_id: &str,
        metric_names: &[String],
        period: Duration,
    ) -> Result<Vec<CloudDatapoint>, CollectError> {
        let mut state = self.lock();
        state.last_request = Some(CloudRequest {
            resource_id: resource_id.to_string(),
            metric_names: metric_names.to_vec(),
            period,
        });
        let (_, err) = state.script.enter(SourceCall::CloudMetrics);
        if let Some(err) = err {
            return Err(err);
        }
        Ok(state
            .datapoints
            .iter()
            .filter(|d| metric_names.contains(&d.metric_name))
            .cloned()
            .collect())
    }
}
