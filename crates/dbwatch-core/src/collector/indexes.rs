//! Per-index statistics (`pg_stat_user_indexes` + `pg_statio_user_indexes`).

use std::cmp::Reverse;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{Collector, EntitySamples};
use crate::error::CollectError;
use crate::model::RawSample;
use crate::source::{DatabaseSource, IndexRanking, IndexStats};

pub struct IndexStatsCollector {
    name: String,
    source: Arc<dyn DatabaseSource>,
    max_entities: usize,
    ranking: IndexRanking,
}

impl IndexStatsCollector {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn DatabaseSource>,
        max_entities: usize,
        ranking: IndexRanking,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            max_entities,
            ranking,
        }
    }
}

/// Same contract as [`super::rank_tables`], for indexes.
pub fn rank_indexes(
    mut indexes: Vec<IndexStats>,
    ranking: IndexRanking,
    limit: usize,
) -> Vec<IndexStats> {
    let score = |i: &IndexStats| match ranking {
        IndexRanking::Size => i.size,
        IndexRanking::Scans => i.idx_scan,
    };
    indexes.sort_by_cached_key(|i| (Reverse(score(i)), i.key()));
    indexes.truncate(limit);
    indexes
}

#[async_trait]
impl Collector for IndexStatsCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sample(&self) -> Result<Vec<RawSample>, CollectError> {
        let indexes = self
            .source
            .index_stats(self.max_entities, self.ranking)
            .await?;
        let indexes = rank_indexes(indexes, self.ranking, self.max_entities);

        let captured_at = Utc::now();
        let mut out = Vec::with_capacity(indexes.len() * 6);
        for i in &indexes {
            EntitySamples::new(&mut out, i.key(), captured_at)
                .dimension("schema", i.schema.as_str())
                .dimension("table", i.table.as_str())
                .dimension("index", i.name.as_str())
                .counter("index_scans", i.idx_scan, "count")
                .counter("index_tuples_read", i.idx_tup_read, "rows")
                .counter("index_tuples_fetched", i.idx_tup_fetch, "rows")
                .counter("index_blocks_read", i.idx_blks_read, "blocks")
                .counter("index_blocks_hit", i.idx_blks_hit, "blocks")
                .gauge("index_size", i.size as f64, "bytes");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mock::MockDatabase;

    fn index(name: &str, size: i64, scans: i64) -> IndexStats {
        IndexStats {
            schema: "public".into(),
            table: "orders".into(),
            name: name.into(),
            idx_scan: scans,
            size,
            ..IndexStats::default()
        }
    }

    #[test]
    fn ranks_by_size_or_scans() {
        let all = vec![index("a", 10, 900), index("b", 500, 1), index("c", 500, 2)];

        let by_size = rank_indexes(all.clone(), IndexRanking::Size, 2);
        let names: Vec<_> = by_size.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["b", "c"]);

        let by_scans = rank_indexes(all, IndexRanking::Scans, 1);
        assert_eq!(by_scans[0].name, "a");
    }

    #[tokio::test]
    async fn emits_counters_and_size_gauge() {
        let db = MockDatabase::new();
        db.set_indexes(vec![index("orders_pkey", 8192, 3)]);
        let collector =
            IndexStatsCollector::new("index_stats", Arc::new(db), 10, IndexRanking::Size);

        let samples = collector.sample().await.unwrap();
        assert_eq!(samples.len(), 6);
        let size = samples.iter().find(|s| s.metric_name == "index_size").unwrap();
        assert_eq!(size.raw_value, 8192.0);
        assert_eq!(size.dimensions.get("index").map(String::as_str), Some("orders_pkey"));
    }
}
