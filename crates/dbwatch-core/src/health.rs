//! Agent self-health bookkeeping.
//!
//! The scheduler records every tick outcome here and the dispatcher records
//! every delivery outcome. The health-report collector turns a
//! [`HealthRegistry::report`] into observations, so degradation becomes
//! visible through the normal delivery path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{CollectError, ErrorKind};

/// Overall agent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Ok,
    /// A job is failing or disabled, or a batch was dropped since the last report.
    Degraded,
    /// The ingestion service rejected the credentials.
    Fatal,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Ok => "ok",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Fatal => "fatal",
        }
    }

    /// Numeric encoding used for the `agent_status` gauge.
    pub fn code(self) -> f64 {
        match self {
            AgentStatus::Ok => 0.0,
            AgentStatus::Degraded => 1.0,
            AgentStatus::Fatal => 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobError {
    pub at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Health of one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobHealth {
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<JobError>,
    pub consecutive_failures: u32,
    pub runs: u64,
    pub skipped_ticks: u64,
    /// Set once a job is switched off for the rest of the process lifetime.
    pub disabled: Option<ErrorKind>,
    /// Observations of this job evicted from a full dispatcher buffer.
    pub evicted_observations: u64,
}

impl JobHealth {
    /// Last error is newer than the last success.
    pub fn is_failing(&self) -> bool {
        match (&self.last_error, self.last_success) {
            (Some(err), Some(ok)) => err.at >= ok,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Delivery-side counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryHealth {
    pub batches_sent: u64,
    pub observations_sent: u64,
    /// Batches dropped after exhausting retries.
    pub delivery_failures: u64,
    /// Batches rejected with a non-retryable status.
    pub batches_rejected: u64,
    pub observations_dropped: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub fatal: Option<String>,
}

/// Point-in-time copy of the registry, as emitted by the health-report job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub uptime_secs: f64,
    pub jobs: BTreeMap<String, JobHealth>,
    pub delivery: DeliveryHealth,
    /// Job and delivery errors recorded since the last acknowledged report.
    pub errors_since_last_report: u64,
    /// Drop events (evictions, failed or rejected batches) in the same window.
    pub drops_since_last_report: u64,
}

#[derive(Debug, Default)]
struct HealthState {
    jobs: BTreeMap<String, JobHealth>,
    delivery: DeliveryHealth,
    errors_since_report: u64,
    drops_since_report: u64,
}

/// Shared, cheaply cloneable health registry.
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    started_at: DateTime<Utc>,
    state: Arc<Mutex<HealthState>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::started_at(Utc::now())
    }

    pub fn started_at(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            state: Arc::new(Mutex::new(HealthState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_job(&self, job: &str) {
        self.lock().jobs.entry(job.to_string()).or_default();
    }

    pub fn record_success(&self, job: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        let health = state.jobs.entry(job.to_string()).or_default();
        health.last_success = Some(at);
        health.consecutive_failures = 0;
        health.runs += 1;
    }

    pub fn record_failure(&self, job: &str, err: &CollectError, at: DateTime<Utc>) {
        let mut state = self.lock();
        state.errors_since_report += 1;
        let health = state.jobs.entry(job.to_string()).or_default();
        health.last_error = Some(JobError {
            at,
            kind: err.kind(),
            message: err.to_string(),
        });
        health.consecutive_failures += 1;
        health.runs += 1;
    }

    pub fn record_skip(&self, job: &str) {
        self.lock()
            .jobs
            .entry(job.to_string())
            .or_default()
            .skipped_ticks += 1;
    }

    pub fn record_disabled(&self, job: &str, kind: ErrorKind) {
        self.lock().jobs.entry(job.to_string()).or_default().disabled = Some(kind);
    }

    pub fn record_evicted(&self, job: &str, count: u64) {
        let mut state = self.lock();
        state.drops_since_report += 1;
        state.delivery.observations_dropped += count;
        state
            .jobs
            .entry(job.to_string())
            .or_default()
            .evicted_observations += count;
    }

    pub fn record_batch_sent(&self, observations: usize) {
        let mut state = self.lock();
        state.delivery.batches_sent += 1;
        state.delivery.observations_sent += observations as u64;
    }

    /// One signal per batch dropped after its retries were exhausted.
    pub fn record_delivery_failure(&self, observations: usize) {
        let mut state = self.lock();
        state.errors_since_report += 1;
        state.drops_since_report += 1;
        state.delivery.delivery_failures += 1;
        state.delivery.observations_dropped += observations as u64;
        state.delivery.last_failure = Some(Utc::now());
    }

    pub fn record_batch_rejected(&self, observations: usize) {
        let mut state = self.lock();
        state.errors_since_report += 1;
        state.drops_since_report += 1;
        state.delivery.batches_rejected += 1;
        state.delivery.observations_dropped += observations as u64;
        state.delivery.last_failure = Some(Utc::now());
    }

    pub fn set_fatal(&self, reason: impl Into<String>) {
        let mut state = self.lock();
        state.errors_since_report += 1;
        state.delivery.fatal.get_or_insert_with(|| reason.into());
    }

    pub fn is_fatal(&self) -> bool {
        self.lock().delivery.fatal.is_some()
    }

    pub fn job(&self, job: &str) -> Option<JobHealth> {
        self.lock().jobs.get(job).cloned()
    }

    pub fn delivery(&self) -> DeliveryHealth {
        self.lock().delivery.clone()
    }

    pub fn status(&self) -> AgentStatus {
        status_of(&self.lock())
    }

    /// Builds a report. The since-last-report counters stay until
    /// [`HealthRegistry::acknowledge_report`] is called for it, so a report
    /// that never leaves the agent is folded into the next one.
    pub fn report(&self) -> HealthReport {
        let now = Utc::now();
        let state = self.lock();
        HealthReport {
            status: status_of(&state),
            started_at: self.started_at,
            generated_at: now,
            uptime_secs: (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0,
            jobs: state.jobs.clone(),
            delivery: state.delivery.clone(),
            errors_since_last_report: state.errors_since_report,
            drops_since_last_report: state.drops_since_report,
        }
    }

    /// Clears what `report` covered. Events recorded after it was built stay.
    pub fn acknowledge_report(&self, report: &HealthReport) {
        let mut state = self.lock();
        state.errors_since_report = state
            .errors_since_report
            .saturating_sub(report.errors_since_last_report);
        state.drops_since_report = state
            .drops_since_report
            .saturating_sub(report.drops_since_last_report);
    }
}

fn status_of(state: &HealthState) -> AgentStatus {
    if state.delivery.fatal.is_some() {
        return AgentStatus::Fatal;
    }
    let job_problem = state
        .jobs
        .values()
        .any(|j| j.disabled.is_some() || j.is_failing());
    if job_problem || state.drops_since_report > 0 {
        AgentStatus::Degraded
    } else {
        AgentStatus::Ok
    }
}
