//! SQL query builders for PostgreSQL statistics views.

use crate::source::{IndexRanking, TableRanking};

/// Database-wide sums over `pg_stat_database`.
///
/// Every column is cast to `double precision`; the adapter reads them
/// generically by column name.
pub(super) fn build_stat_database_query() -> &'static str {
    r#"
        SELECT
            COALESCE(SUM(numbackends), 0)::double precision AS numbackends,
            COALESCE(SUM(xact_commit), 0)::double precision AS xact_commit,
            COALESCE(SUM(xact_rollback), 0)::double precision AS xact_rollback,
            COALESCE(SUM(blks_read), 0)::double precision AS blks_read,
            COALESCE(SUM(blks_hit), 0)::double precision AS blks_hit,
            COALESCE(SUM(tup_returned), 0)::double precision AS tup_returned,
            COALESCE(SUM(tup_fetched), 0)::double precision AS tup_fetched,
            COALESCE(SUM(tup_inserted), 0)::double precision AS tup_inserted,
            COALESCE(SUM(tup_updated), 0)::double precision AS tup_updated,
            COALESCE(SUM(tup_deleted), 0)::double precision AS tup_deleted,
            COALESCE(SUM(conflicts), 0)::double precision AS conflicts,
            COALESCE(SUM(temp_files), 0)::double precision AS temp_files,
            COALESCE(SUM(temp_bytes), 0)::double precision AS temp_bytes,
            COALESCE(SUM(deadlocks), 0)::double precision AS deadlocks,
            COALESCE(SUM(blk_read_time), 0)::double precision AS blk_read_time,
            COALESCE(SUM(blk_write_time), 0)::double precision AS blk_write_time
        FROM pg_stat_database
        WHERE datname IS NOT NULL
          AND datname NOT IN ('template0', 'template1')
    "#
}

/// Recovery conflict counters, summed over databases.
pub(super) fn build_stat_database_conflicts_query() -> &'static str {
    r#"
        SELECT
            COALESCE(SUM(confl_tablespace), 0)::double precision AS confl_tablespace,
            COALESCE(SUM(confl_lock), 0)::double precision AS confl_lock,
            COALESCE(SUM(confl_snapshot), 0)::double precision AS confl_snapshot,
            COALESCE(SUM(confl_bufferpin), 0)::double precision AS confl_bufferpin,
            COALESCE(SUM(confl_deadlock), 0)::double precision AS confl_deadlock
        FROM pg_stat_database_conflicts
        WHERE datname NOT IN ('template0', 'template1')
    "#
}

/// Builds version-aware query for pg_stat_bgwriter (+ pg_stat_checkpointer on PG 17+).
///
/// PG < 17: all fields in pg_stat_bgwriter (single view).
/// PG 17+:  checkpoint fields moved to pg_stat_checkpointer,
///          buffers_backend/buffers_backend_fsync moved to pg_stat_io and
///          are reported as 0.
pub(super) fn build_stat_bgwriter_query(server_version_num: i32) -> &'static str {
    if server_version_num >= 170000 {
        r#"
            SELECT
                COALESCE(c.num_timed, 0)::double precision AS checkpoints_timed,
                COALESCE(c.num_requested, 0)::double precision AS checkpoints_req,
                COALESCE(c.write_time, 0)::double precision AS checkpoint_write_time,
                COALESCE(c.sync_time, 0)::double precision AS checkpoint_sync_time,
                COALESCE(c.buffers_written, 0)::double precision AS buffers_checkpoint,
                COALESCE(b.buffers_clean, 0)::double precision AS buffers_clean,
                COALESCE(b.maxwritten_clean, 0)::double precision AS maxwritten_clean,
                0::double precision AS buffers_backend,
                0::double precision AS buffers_backend_fsync,
                COALESCE(b.buffers_alloc, 0)::double precision AS buffers_alloc
            FROM pg_stat_bgwriter b
            CROSS JOIN pg_stat_checkpointer c
        "#
    } else {
        r#"
            SELECT
                COALESCE(checkpoints_timed, 0)::double precision AS checkpoints_timed,
                COALESCE(checkpoints_req, 0)::double precision AS checkpoints_req,
                COALESCE(checkpoint_write_time, 0)::double precision AS checkpoint_write_time,
                COALESCE(checkpoint_sync_time, 0)::double precision AS checkpoint_sync_time,
                COALESCE(buffers_checkpoint, 0)::double precision AS buffers_checkpoint,
                COALESCE(buffers_clean, 0)::double precision AS buffers_clean,
                COALESCE(maxwritten_clean, 0)::double precision AS maxwritten_clean,
                COALESCE(buffers_backend, 0)::double precision AS buffers_backend,
                COALESCE(buffers_backend_fsync, 0)::double precision AS buffers_backend_fsync,
                COALESCE(buffers_alloc, 0)::double precision AS buffers_alloc
            FROM pg_stat_bgwriter
        "#
    }
}

/// pg_stat_archiver exists since 9.4.
pub(super) fn build_stat_archiver_query(server_version_num: i32) -> Option<&'static str> {
    (server_version_num >= 90400).then_some(
        r#"
            SELECT
                COALESCE(archived_count, 0)::double precision AS archived_count,
                COALESCE(failed_count, 0)::double precision AS failed_count
            FROM pg_stat_archiver
        "#,
    )
}

/// Numeric settings only; enum/string/bool knobs cannot be sampled as values.
pub(super) const SETTINGS_QUERY: &str = r#"
    SELECT name, setting, COALESCE(unit, '') AS unit
    FROM pg_settings
    WHERE vartype IN ('integer', 'real')
    ORDER BY name
"#;

pub(super) const STATEMENTS_EXTENSION_QUERY: &str =
    "SELECT extversion FROM pg_extension WHERE extname = 'pg_stat_statements'";

fn table_order_expr(ranking: TableRanking) -> &'static str {
    match ranking {
        TableRanking::LiveTuples => "COALESCE(t.n_live_tup, 0)",
        TableRanking::TotalSize => "pg_total_relation_size(t.relid)",
        TableRanking::Activity => {
            "COALESCE(t.seq_scan, 0) + COALESCE(t.idx_scan, 0) \
             + COALESCE(t.n_tup_ins, 0) + COALESCE(t.n_tup_upd, 0) + COALESCE(t.n_tup_del, 0)"
        }
    }
}

/// pg_stat_user_tables joined with pg_statio_user_tables, ranked and limited
/// by `$1`. Ties are broken by name so truncation is stable.
pub(super) fn build_user_tables_query(ranking: TableRanking) -> String {
    let order_expr = table_order_expr(ranking);
    format!(
        r#"
            SELECT
                COALESCE(t.schemaname, '') as schemaname,
                COALESCE(t.relname, '') as relname,
                COALESCE(t.seq_scan, 0)::bigint as seq_scan,
                COALESCE(t.seq_tup_read, 0)::bigint as seq_tup_read,
                COALESCE(t.idx_scan, 0)::bigint as idx_scan,
                COALESCE(t.idx_tup_fetch, 0)::bigint as idx_tup_fetch,
                COALESCE(t.n_tup_ins, 0)::bigint as n_tup_ins,
                COALESCE(t.n_tup_upd, 0)::bigint as n_tup_upd,
                COALESCE(t.n_tup_del, 0)::bigint as n_tup_del,
                COALESCE(t.n_tup_hot_upd, 0)::bigint as n_tup_hot_upd,
                COALESCE(t.n_live_tup, 0)::bigint as n_live_tup,
                COALESCE(t.n_dead_tup, 0)::bigint as n_dead_tup,
                COALESCE(t.vacuum_count, 0)::bigint as vacuum_count,
                COALESCE(t.autovacuum_count, 0)::bigint as autovacuum_count,
                COALESCE(t.analyze_count, 0)::bigint as analyze_count,
                COALESCE(t.autoanalyze_count, 0)::bigint as autoanalyze_count,
                COALESCE(s.heap_blks_read, 0)::bigint as heap_blks_read,
                COALESCE(s.heap_blks_hit, 0)::bigint as heap_blks_hit,
                COALESCE(s.idx_blks_read, 0)::bigint as idx_blks_read,
                COALESCE(s.idx_blks_hit, 0)::bigint as idx_blks_hit,
                COALESCE(pg_relation_size(t.relid), 0)::bigint as relation_size,
                COALESCE(pg_indexes_size(t.relid), 0)::bigint as indexes_size,
                COALESCE(pg_total_relation_size(t.relid)
                    - pg_relation_size(t.relid)
                    - pg_indexes_size(t.relid), 0)::bigint as toast_size
            FROM pg_stat_user_tables t
            LEFT JOIN pg_statio_user_tables s ON s.relid = t.relid
            ORDER BY {order_expr} DESC, t.schemaname, t.relname
            LIMIT $1
        "#
    )
}

fn index_order_expr(ranking: IndexRanking) -> &'static str {
    match ranking {
        IndexRanking::Size => "pg_relation_size(i.indexrelid)",
        IndexRanking::Scans => "COALESCE(i.idx_scan, 0)",
    }
}

/// pg_stat_user_indexes joined with pg_statio_user_indexes, ranked and
/// limited by `$1`.
pub(super) fn build_user_indexes_query(ranking: IndexRanking) -> String {
    let order_expr = index_order_expr(ranking);
    format!(
        r#"
            SELECT
                COALESCE(i.schemaname, '') as schemaname,
                COALESCE(i.relname, '') as relname,
                COALESCE(i.indexrelname, '') as indexrelname,
                COALESCE(i.idx_scan, 0)::bigint as idx_scan,
                COALESCE(i.idx_tup_read, 0)::bigint as idx_tup_read,
                COALESCE(i.idx_tup_fetch, 0)::bigint as idx_tup_fetch,
                COALESCE(s.idx_blks_read, 0)::bigint as idx_blks_read,
                COALESCE(s.idx_blks_hit, 0)::bigint as idx_blks_hit,
                COALESCE(pg_relation_size(i.indexrelid), 0)::bigint as size_bytes
            FROM pg_stat_user_indexes i
            LEFT JOIN pg_statio_user_indexes s ON s.indexrelid = i.indexrelid
            ORDER BY {order_expr} DESC, i.schemaname, i.indexrelname
            LIMIT $1
        "#
    )
}

/// Builds version-aware query for pg_stat_statements, top `$1` by total time.
pub(super) fn build_stat_statements_query(server_version_num: i32) -> String {
    let (total_exec_time_expr, mean_exec_time_expr) = if server_version_num >= 130000 {
        ("s.total_exec_time", "s.mean_exec_time")
    } else {
        ("s.total_time", "s.mean_time")
    };
    // One (dbid, userid, queryid) has a top-level and a nested row on 14+.
    let toplevel_expr = if server_version_num >= 140000 {
        "s.toplevel"
    } else {
        "true"
    };

    format!(
        r#"
            SELECT
                s.queryid,
                COALESCE(d.datname, '') as datname,
                COALESCE(r.rolname, '') as usename,
                {toplevel_expr} as toplevel,
                s.calls,
                {total_exec_time_expr}::double precision as total_exec_time,
                {mean_exec_time_expr}::double precision as mean_exec_time,
                s.rows
            FROM pg_stat_statements s
            LEFT JOIN pg_database d ON d.oid = s.dbid
            LEFT JOIN pg_roles r ON r.oid = s.userid
            WHERE s.queryid IS NOT NULL
            ORDER BY total_exec_time DESC, s.queryid, toplevel DESC
            LIMIT $1
        "#
    )
}

/// Non-idle sessions whose statement started at least `$1` seconds ago.
pub(super) fn build_active_queries_query() -> &'static str {
    r#"
        SELECT
            pid,
            COALESCE(datname, '') as datname,
            COALESCE(usename, '') as usename,
            COALESCE(state, '') as state,
            COALESCE(wait_event, '') as wait_event,
            COALESCE(query, '') as query,
            EXTRACT(EPOCH FROM query_start)::double precision as query_start,
            EXTRACT(EPOCH FROM (now() - query_start))::double precision as running_for
        FROM pg_stat_activity
        WHERE state IS DISTINCT FROM 'idle'
          AND pid <> pg_backend_pid()
          AND backend_type = 'client backend'
          AND query_start IS NOT NULL
          AND now() - query_start >= $1::double precision * interval '1 second'
        ORDER BY query_start, pid
    "#
}

const USER_SCHEMA_FILTER: &str = "n.nspname NOT IN ('pg_catalog', 'information_schema') \
     AND n.nspname NOT LIKE 'pg_toast%' \
     AND n.nspname NOT LIKE 'pg_temp%'";

pub(super) fn build_columns_query() -> String {
    format!(
        r#"
            SELECT
                n.nspname as schemaname,
                c.relname as relname,
                a.attname as attname,
                format_type(a.atttypid, a.atttypmod) as data_type,
                NOT a.attnotnull as nullable,
                a.attnum::int as ordinal
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ('r', 'p')
              AND a.attnum > 0
              AND NOT a.attisdropped
              AND {USER_SCHEMA_FILTER}
            ORDER BY n.nspname, c.relname, a.attnum
        "#
    )
}

pub(super) fn build_indexes_query() -> String {
    format!(
        r#"
            SELECT
                n.nspname as schemaname,
                t.relname as relname,
                i.relname as indexrelname,
                x.indisunique as is_unique,
                x.indisprimary as is_primary
            FROM pg_index x
            JOIN pg_class i ON i.oid = x.indexrelid
            JOIN pg_class t ON t.oid = x.indrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            WHERE {USER_SCHEMA_FILTER}
            ORDER BY n.nspname, t.relname, i.relname
        "#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_statements_query_uses_exec_time_columns_on_pg13_plus() {
        let q = build_stat_statements_query(130000);
        assert!(q.contains("s.total_exec_time::double precision as total_exec_time"));
        assert!(q.contains("s.mean_exec_time::double precision as mean_exec_time"));
        assert!(q.contains("LEFT JOIN pg_database"));
        assert!(q.contains("LIMIT $1"));
    }

    #[test]
    fn stat_statements_query_uses_legacy_time_columns_on_pg12_and_older() {
        let q = build_stat_statements_query(120000);
        assert!(q.contains("s.total_time::double precision as total_exec_time"));
        assert!(q.contains("s.mean_time::double precision as mean_exec_time"));
        assert!(!q.contains("s.total_exec_time"));
    }

    #[test]
    fn stat_statements_query_selects_toplevel_on_pg14_plus() {
        assert!(build_stat_statements_query(140000).contains("s.toplevel as toplevel"));
        let q = build_stat_statements_query(130000);
        assert!(q.contains("true as toplevel"));
        assert!(!q.contains("s.toplevel"));
    }

    #[test]
    fn stat_bgwriter_query_pg16_uses_single_view() {
        let q = build_stat_bgwriter_query(160000);
        assert!(q.contains("FROM pg_stat_bgwriter"));
        assert!(!q.contains("pg_stat_checkpointer"));
    }

    #[test]
    fn stat_bgwriter_query_pg17_uses_split_views() {
        let q = build_stat_bgwriter_query(170000);
        assert!(q.contains("pg_stat_checkpointer"));
        assert!(q.contains("num_timed"));
        assert!(q.contains("0::double precision AS buffers_backend"));
    }

    #[test]
    fn archiver_only_on_94_plus() {
        assert!(build_stat_archiver_query(90300).is_none());
        assert!(build_stat_archiver_query(90400).unwrap().contains("pg_stat_archiver"));
    }

    #[test]
    fn table_query_orders_by_ranking_with_name_tiebreak() {
        let q = build_user_tables_query(TableRanking::TotalSize);
        assert!(
            q.contains("ORDER BY pg_total_relation_size(t.relid) DESC, t.schemaname, t.relname")
        );
        let q = build_user_tables_query(TableRanking::LiveTuples);
        assert!(q.contains("ORDER BY COALESCE(t.n_live_tup, 0) DESC"));
        assert!(q.contains("pg_statio_user_tables"));
    }

    #[test]
    fn index_query_orders_by_ranking() {
        let q = build_user_indexes_query(IndexRanking::Scans);
        assert!(q.contains("ORDER BY COALESCE(i.idx_scan, 0) DESC, i.schemaname, i.indexrelname"));
        let q = build_user_indexes_query(IndexRanking::Size);
        assert!(q.contains("ORDER BY pg_relation_size(i.indexrelid) DESC"));
    }

    #[test]
    fn schema_queries_skip_system_schemas() {
        for q in [build_columns_query(), build_indexes_query()] {
            assert!(q.contains("'pg_catalog', 'information_schema'"));
            assert!(q.contains("pg_toast%"));
        }
    }
}
