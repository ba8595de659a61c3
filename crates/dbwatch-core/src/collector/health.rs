//! The agent's own heartbeat, built from the [`HealthRegistry`].
//!
//! The since-last-report counters are acknowledged only once the scheduler
//! has handed the heartbeat to the dispatcher. A heartbeat lost after that
//! (evicted, or dropped by a failed delivery) is itself counted as a drop in
//! the following report.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{Collector, EntitySamples};
use crate::error::CollectError;
use crate::health::{HealthRegistry, HealthReport};
use crate::model::RawSample;

pub struct HealthReportCollector {
    name: String,
    registry: HealthRegistry,
    /// Last report sampled and not yet handed off.
    pending: Mutex<Option<HealthReport>>,
}

impl HealthReportCollector {
    pub fn new(name: impl Into<String>, registry: HealthRegistry) -> Self {
        Self {
            name: name.into(),
            registry,
            pending: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Collector for HealthReportCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sample(&self) -> Result<Vec<RawSample>, CollectError> {
        let report = self.registry.report();
        let at = report.generated_at;
        let mut out = Vec::new();

        EntitySamples::new(&mut out, "agent", at)
            .dimension("status", report.status.as_str())
            .dimension("version", crate::VERSION)
            .gauge("agent_status", report.status.code(), "code")
            .gauge("agent_uptime", report.uptime_secs, "seconds")
            .gauge(
                "agent_errors_since_last_report",
                report.errors_since_last_report as f64,
                "count",
            )
            .gauge(
                "agent_drops_since_last_report",
                report.drops_since_last_report as f64,
                "count",
            );

        let d = &report.delivery;
        EntitySamples::new(&mut out, "delivery", at)
            .gauge("delivery_batches_sent", d.batches_sent as f64, "count")
            .gauge("delivery_observations_sent", d.observations_sent as f64, "count")
            .gauge("delivery_failures", d.delivery_failures as f64, "count")
            .gauge("delivery_batches_rejected", d.batches_rejected as f64, "count")
            .gauge("delivery_observations_dropped", d.observations_dropped as f64, "count");

        for (job, health) in &report.jobs {
            let mut entity = EntitySamples::new(&mut out, format!("job:{job}"), at)
                .dimension("job", job.as_str())
                .dimension(
                    "last_error_kind",
                    health
                        .last_error
                        .as_ref()
                        .map(|e| e.kind.as_str())
                        .unwrap_or(""),
                )
                .dimension(
                    "last_error",
                    health
                        .last_error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_default(),
                );
            entity
                .gauge(
                    "job_enabled",
                    if health.disabled.is_some() { 0.0 } else { 1.0 },
                    "bool",
                )
                .gauge(
                    "job_consecutive_failures",
                    f64::from(health.consecutive_failures),
                    "count",
                )
                .gauge("job_skipped_ticks", health.skipped_ticks as f64, "count")
                .gauge("job_runs", health.runs as f64, "count");
            if let Some(ok) = health.last_success {
                entity.gauge("job_last_success", ok.timestamp() as f64, "unix_seconds");
            }
            if let Some(err) = &health.last_error {
                entity.gauge("job_last_error", err.at.timestamp() as f64, "unix_seconds");
            }
        }

        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
        Ok(out)
    }

    fn handed_off(&self) {
        let report = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(report) = report {
            self.registry.acknowledge_report(&report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::Utc;

    fn find<'a>(samples: &'a [RawSample], entity: &str, metric: &str) -> &'a RawSample {
        samples
            .iter()
            .find(|s| s.entity_key == entity && s.metric_name == metric)
            .unwrap_or_else(|| panic!("missing {entity}/{metric}"))
    }

    #[tokio::test]
    async fn reports_jobs_and_delivery() {
        let registry = HealthRegistry::new();
        registry.record_success("server_status", Utc::now());
        registry.record_failure(
            "table_stats",
            &CollectError::Connection("refused".into()),
            Utc::now(),
        );
        registry.record_skip("table_stats");
        registry.record_delivery_failure(5);

        let collector = HealthReportCollector::new("health_report", registry.clone());
        let samples = collector.sample().await.unwrap();

        let status = find(&samples, "agent", "agent_status");
        assert_eq!(status.raw_value, 1.0);
        assert_eq!(status.dimensions.get("status").map(String::as_str), Some("degraded"));
        assert_eq!(find(&samples, "agent", "agent_errors_since_last_report").raw_value, 2.0);
        assert_eq!(find(&samples, "delivery", "delivery_failures").raw_value, 1.0);

        let tables = find(&samples, "job:table_stats", "job_consecutive_failures");
        assert_eq!(tables.raw_value, 1.0);
        assert_eq!(
            tables.dimensions.get("last_error_kind").map(String::as_str),
            Some(ErrorKind::Connection.as_str())
        );
        assert_eq!(find(&samples, "job:table_stats", "job_skipped_ticks").raw_value, 1.0);
        find(&samples, "job:server_status", "job_last_success");

        // Not handed off: the next heartbeat still carries the errors.
        let again = collector.sample().await.unwrap();
        assert_eq!(find(&again, "agent", "agent_errors_since_last_report").raw_value, 2.0);
        assert_eq!(find(&again, "agent", "agent_drops_since_last_report").raw_value, 1.0);

        collector.handed_off();
        let cleared = collector.sample().await.unwrap();
        assert_eq!(find(&cleared, "agent", "agent_errors_since_last_report").raw_value, 0.0);
        assert_eq!(find(&cleared, "agent", "agent_drops_since_last_report").raw_value, 0.0);
    }

    #[tokio::test]
    async fn fatal_state_is_visible() {
        let registry = HealthRegistry::new();
        registry.set_fatal("HTTP 401");
        let samples = HealthReportCollector::new("health_report", registry)
            .sample()
            .await
            .unwrap();
        assert_eq!(find(&samples, "agent", "agent_status").raw_value, 2.0);
    }
}
