//! Metrics published by the cloud provider's monitoring API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Collector, EntitySamples};
use crate::error::CollectError;
use crate::model::RawSample;
use crate::source::CloudMetricsSource;

pub struct CloudMetricsCollector {
    name: String,
    source: Arc<dyn CloudMetricsSource>,
    resource_id: String,
    metric_names: Vec<String>,
    period: Duration,
}

impl CloudMetricsCollector {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn CloudMetricsSource>,
        resource_id: impl Into<String>,
        metric_names: Vec<String>,
        period: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            resource_id: resource_id.into(),
            metric_names,
            period,
        }
    }
}

#[async_trait]
impl Collector for CloudMetricsCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sample(&self) -> Result<Vec<RawSample>, CollectError> {
        let points = self
            .source
            .list_metrics(&self.resource_id, &self.metric_names, self.period)
            .await?;

        // Points already carry their own timestamps and are not cumulative.
        let mut out = Vec::with_capacity(points.len());
        for p in &points {
            EntitySamples::new(&mut out, p.metric_name.as_str(), p.timestamp)
                .dimension("resource_id", self.resource_id.as_str())
                .gauge(&p.metric_name, p.value, "none");
        }
        Ok(out)
    }
}
