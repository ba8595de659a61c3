//! Per-table statistics (`pg_stat_user_tables` + `pg_statio_user_tables`).

use std::cmp::Reverse;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{Collector, EntitySamples};
use crate::error::CollectError;
use crate::model::RawSample;
use crate::source::{DatabaseSource, TableRanking, TableStats};

pub struct TableStatsCollector {
    name: String,
    source: Arc<dyn DatabaseSource>,
    max_entities: usize,
    ranking: TableRanking,
}

impl TableStatsCollector {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn DatabaseSource>,
        max_entities: usize,
        ranking: TableRanking,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            max_entities,
            ranking,
        }
    }
}

/// Orders tables by `ranking` (descending), ties by key, and keeps `limit`.
///
/// The source is asked for the same order, but it is re-applied here so the
/// kept set never depends on how a source breaks ties.
pub fn rank_tables(
    mut tables: Vec<TableStats>,
    ranking: TableRanking,
    limit: usize,
) -> Vec<TableStats> {
    let score = |t: &TableStats| match ranking {
        TableRanking::LiveTuples => t.n_live_tup,
        TableRanking::TotalSize => t.total_size(),
        TableRanking::Activity => t.activity(),
    };
    tables.sort_by_cached_key(|t| (Reverse(score(t)), t.key()));
    tables.truncate(limit);
    tables
}

#[async_trait]
impl Collector for TableStatsCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sample(&self) -> Result<Vec<RawSample>, CollectError> {
        let tables = self
            .source
            .table_stats(self.max_entities, self.ranking)
            .await?;
        let tables = rank_tables(tables, self.ranking, self.max_entities);

        let captured_at = Utc::now();
        let mut out = Vec::with_capacity(tables.len() * 21);
        for t in &tables {
            EntitySamples::new(&mut out, t.key(), captured_at)
                .dimension("schema", t.schema.as_str())
                .dimension("table", t.name.as_str())
                .counter("table_seq_scans", t.seq_scan, "count")
                .counter("table_seq_tuples_read", t.seq_tup_read, "rows")
                .counter("table_index_scans", t.idx_scan, "count")
                .counter("table_index_tuples_fetched", t.idx_tup_fetch, "rows")
                .counter("table_rows_inserted", t.n_tup_ins, "rows")
                .counter("table_rows_updated", t.n_tup_upd, "rows")
                .counter("table_rows_deleted", t.n_tup_del, "rows")
                .counter("table_rows_hot_updated", t.n_tup_hot_upd, "rows")
                .counter("table_vacuums", t.vacuum_count, "count")
                .counter("table_autovacuums", t.autovacuum_count, "count")
                .counter("table_analyzes", t.analyze_count, "count")
                .counter("table_autoanalyzes", t.autoanalyze_count, "count")
                .counter("table_heap_blocks_read", t.heap_blks_read, "blocks")
                .counter("table_heap_blocks_hit", t.heap_blks_hit, "blocks")
                .counter("table_index_blocks_read", t.idx_blks_read, "blocks")
                .counter("table_index_blocks_hit", t.idx_blks_hit, "blocks")
                .gauge("table_live_rows", t.n_live_tup as f64, "rows")
                .gauge("table_dead_rows", t.n_dead_tup as f64, "rows")
                .gauge("table_size", t.relation_size as f64, "bytes")
                .gauge("table_indexes_size", t.indexes_size as f64, "bytes")
                .gauge("table_toast_size", t.toast_size as f64, "bytes");
        }
        Ok(out)
    }
}
