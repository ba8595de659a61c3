//! Engine-wide status: database sums, background writer, archiver and
//! numeric settings.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{Collector, EntitySamples};
use crate::error::CollectError;
use crate::model::{RawSample, SampleKind};
use crate::source::DatabaseSource;

pub struct ServerStatusCollector {
    name: String,
    source: Arc<dyn DatabaseSource>,
    include_settings: bool,
}

impl ServerStatusCollector {
    pub fn new(name: impl Into<String>, source: Arc<dyn DatabaseSource>) -> Self {
        Self {
            name: name.into(),
            source,
            include_settings: true,
        }
    }

    /// Skips the `pg_settings` read.
    pub fn without_settings(mut self) -> Self {
        self.include_settings = false;
        self
    }
}

#[async_trait]
impl Collector for ServerStatusCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sample(&self) -> Result<Vec<RawSample>, CollectError> {
        let status = self.source.server_status().await?;
        let settings = if self.include_settings {
            self.source.settings().await?
        } else {
            Vec::new()
        };

        let captured_at = Utc::now();
        let mut out = Vec::with_capacity(status.len() + settings.len());

        for value in &status {
            let mut entity = EntitySamples::new(&mut out, value.view.as_str(), captured_at)
                .dimension("view", value.view.as_str());
            match value.kind {
                SampleKind::Counter => entity.counter_f64(&value.name, value.value, &value.unit),
                SampleKind::Gauge => entity.gauge(&value.name, value.value, &value.unit),
            };
        }

        for setting in &settings {
            EntitySamples::new(&mut out, format!("setting:{}", setting.name), captured_at)
                .dimension("name", setting.name.as_str())
                .gauge("pg_setting", setting.value, &setting.unit);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::normalize_all;
    use crate::snapshot::SnapshotStore;
    use crate::source::mock::{MockDatabase, SourceCall};
    use crate::source::{Setting, StatusValue};

    fn mock() -> MockDatabase {
        let db = MockDatabase::new();
        db.set_server_status(vec![
            StatusValue::gauge("pg_stat_database", "numbackends", 12.0, "connections"),
            StatusValue::counter("pg_stat_database", "xact_commit", 1000.0, "count"),
        ]);
        db.set_settings(vec![Setting {
            name: "shared_buffers".into(),
            value: 16384.0,
            unit: "8kB".into(),
        }]);
        db
    }

    #[tokio::test]
    async fn counters_and_gauges_keep_their_kind() {
        let db = mock();
        let collector = ServerStatusCollector::new("server_status", Arc::new(db));
        let samples = collector.sample().await.unwrap();

        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].metric_name, "numbackends");
        assert_eq!(samples[0].kind, SampleKind::Gauge);
        assert_eq!(samples[1].metric_name, "xact_commit");
        assert_eq!(samples[1].kind, SampleKind::Counter);
        assert_eq!(samples[2].metric_name, "pg_setting");
        assert_eq!(
            samples[2].dimensions.get("name").map(String::as_str),
            Some("shared_buffers")
        );
    }

    #[tokio::test]
    async fn first_tick_only_emits_gauges() {
        let db = mock();
        let collector = ServerStatusCollector::new("server_status", Arc::new(db.clone()));
        let store = SnapshotStore::new();

        let samples = collector.sample().await.unwrap();
        let (obs, stats) = normalize_all("server_status", &samples, &store);
        assert_eq!(stats.baselines, 1);
        assert!(obs.iter().all(|o| o.metric_name() != "xact_commit"));
        assert_eq!(obs.len(), 2);
    }

    #[tokio::test]
    async fn settings_failure_fails_the_tick() {
        let db = mock();
        db.fail_once(SourceCall::Settings, CollectError::Query("boom".into()));
        let collector = ServerStatusCollector::new("server_status", Arc::new(db));
        assert!(collector.sample().await.is_err());
    }

    #[tokio::test]
    async fn settings_can_be_skipped() {
        let db = mock();
        let collector =
            ServerStatusCollector::new("server_status", Arc::new(db.clone())).without_settings();
        let samples = collector.sample().await.unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(db.calls(SourceCall::Settings), 0);
    }
}
