//! Statements running longer than a threshold.
//!
//! Each occurrence is its own gauge sample keyed by backend pid, so nothing
//! here is diffed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use xxhash_rust::xxh3::xxh3_64;

use super::{Collector, EntitySamples};
use crate::error::CollectError;
use crate::model::RawSample;
use crate::source::DatabaseSource;

pub struct LongRunningQueryCollector {
    name: String,
    source: Arc<dyn DatabaseSource>,
    threshold: Duration,
}

impl LongRunningQueryCollector {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn DatabaseSource>,
        threshold: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            threshold,
        }
    }
}

/// Stable fingerprint of a statement text, whitespace-insensitive.
pub fn query_fingerprint(query: &str) -> String {
    let normalized = query.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{:016x}", xxh3_64(normalized.as_bytes()))
}

#[async_trait]
impl Collector for LongRunningQueryCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sample(&self) -> Result<Vec<RawSample>, CollectError> {
        let active = self.source.active_queries(self.threshold).await?;

        let captured_at = Utc::now();
        let mut out = Vec::with_capacity(active.len() + 1);
        for q in active.iter().filter(|q| q.running_for >= self.threshold) {
            EntitySamples::new(&mut out, format!("pid:{}", q.pid), captured_at)
                .dimension("pid", q.pid.to_string())
                .dimension("database", q.datname.as_str())
                .dimension("user", q.usename.as_str())
                .dimension("state", q.state.as_str())
                .dimension("wait_event", q.wait_event.as_str())
                .dimension("fingerprint", query_fingerprint(&q.query))
                .dimension("query_start", q.query_start.to_rfc3339())
                .gauge(
                    "long_running_query_duration",
                    q.running_for.as_secs_f64(),
                    "seconds",
                );
        }
        let count = out.len();
        EntitySamples::new(&mut out, "instance", captured_at)
            .dimension("threshold_secs", self.threshold.as_secs().to_string())
            .gauge("long_running_queries", count as f64, "count");
        Ok(out)
    }
}
