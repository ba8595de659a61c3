//! Top statements from `pg_stat_statements`.
//!
//! Call counts, total time and rows are cumulative per fingerprint and go
//! through the diff engine; mean time is already a point value.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{Collector, EntitySamples};
use crate::error::CollectError;
use crate::model::RawSample;
use crate::source::{DatabaseSource, StatementStats};

pub struct QueryMonitorCollector {
    name: String,
    source: Arc<dyn DatabaseSource>,
    max_entities: usize,
}

impl QueryMonitorCollector {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn DatabaseSource>,
        max_entities: usize,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            max_entities,
        }
    }
}

/// `pg_stat_statements` keys rows by (user, database, queryid, toplevel).
fn statement_key(s: &StatementStats) -> String {
    if s.toplevel {
        format!("{}/{}/{}", s.datname, s.usename, s.queryid)
    } else {
        format!("{}/{}/{}/nested", s.datname, s.usename, s.queryid)
    }
}

fn top_statements(mut statements: Vec<StatementStats>, limit: usize) -> Vec<StatementStats> {
    statements.sort_by(|a, b| {
        b.total_exec_time
            .partial_cmp(&a.total_exec_time)
            .unwrap_or(Ordering::Equal)
            .then_with(|| statement_key(a).cmp(&statement_key(b)))
    });
    statements.truncate(limit);
    statements
}

#[async_trait]
impl Collector for QueryMonitorCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sample(&self) -> Result<Vec<RawSample>, CollectError> {
        let statements = self.source.statement_stats(self.max_entities).await?;
        let statements = top_statements(statements, self.max_entities);

        let captured_at = Utc::now();
        let mut out = Vec::with_capacity(statements.len() * 4);
        for s in &statements {
            EntitySamples::new(&mut out, statement_key(s), captured_at)
                .dimension("queryid", s.queryid.to_string())
                .dimension("database", s.datname.as_str())
                .dimension("user", s.usename.as_str())
                .dimension("toplevel", s.toplevel.to_string())
                .counter("query_calls", s.calls, "count")
                .counter_f64("query_total_exec_time", s.total_exec_time, "ms")
                .counter("query_rows", s.rows, "rows")
                .gauge("query_mean_exec_time", s.mean_exec_time, "ms");
        }
        Ok(out)
    }
}
