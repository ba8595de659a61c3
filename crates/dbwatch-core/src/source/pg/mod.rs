//! PostgreSQL database adapter.
//!
//! Reads statistics views through the synchronous `postgres` client. Every
//! call runs on the tokio blocking pool, so a slow server only ever stalls
//! the job that owns this source.
//!
//! ## Connection lifecycle
//!
//! One `PgSource` (and so one connection) is created per job. The
//! connection is opened lazily on the first call, the server version is
//! read once per (re)connect, and the client is dropped after any failed
//! statement. The next tick reconnects.
//!
//! With IAM authentication the password is a short-lived token read from
//! `auth_token_file` on every connect; the file is expected to be refreshed
//! by an external process.

mod queries;

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use native_tls::TlsConnector;
use postgres::error::DbError;
use postgres::{Client, NoTls, Row};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    ActiveQuery, ColumnDef, DatabaseSource, IndexDef, IndexRanking, IndexStats, SchemaSnapshot,
    Setting, StatementStats, StatusValue, TableDef, TableRanking, TableStats,
};
use crate::error::CollectError;

/// TLS policy for the database connection (libpq `sslmode` subset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    /// TLS when the server offers it, certificate not verified.
    #[default]
    Prefer,
    /// TLS mandatory, certificate not verified.
    Require,
    /// TLS mandatory, certificate chain and host name verified.
    VerifyFull,
}

/// Everything needed to (re)open a connection.
#[derive(Clone)]
pub struct PgConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    pub sslmode: SslMode,
    /// IAM token file; when set it takes precedence over `password`.
    pub auth_token_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Server-side `statement_timeout`; zero leaves the server default.
    pub statement_timeout: Duration,
    pub application_name: String,
}

impl fmt::Debug for PgConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("dbname", &self.dbname)
            .field("sslmode", &self.sslmode)
            .field("auth_token_file", &self.auth_token_file)
            .finish_non_exhaustive()
    }
}

impl PgConnectionConfig {
    fn resolve_password(&self) -> Result<Option<String>, CollectError> {
        if let Some(path) = &self.auth_token_file {
            let token = std::fs::read_to_string(path).map_err(|e| {
                CollectError::Connection(format!(
                    "failed to read auth token {}: {e}",
                    path.display()
                ))
            })?;
            return Ok(Some(token.trim().to_string()));
        }
        Ok(self.password.clone().filter(|p| !p.is_empty()))
    }

    fn connect(&self) -> Result<Client, CollectError> {
        let mut cfg = postgres::Config::new();
        cfg.host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .application_name(&self.application_name)
            .connect_timeout(self.connect_timeout);
        if !self.statement_timeout.is_zero() {
            cfg.options(&format!(
                "-c statement_timeout={}",
                self.statement_timeout.as_millis()
            ));
        }
        if let Some(password) = self.resolve_password()? {
            cfg.password(password);
        }

        let result = match self.sslmode {
            SslMode::Disable => cfg
                .ssl_mode(postgres::config::SslMode::Disable)
                .connect(NoTls),
            mode => {
                let verify = mode == SslMode::VerifyFull;
                let connector = TlsConnector::builder()
                    .danger_accept_invalid_certs(!verify)
                    .danger_accept_invalid_hostnames(!verify)
                    .build()
                    .map_err(|e| CollectError::Connection(format!("TLS setup failed: {e}")))?;
                let ssl_mode = if mode == SslMode::Prefer {
                    postgres::config::SslMode::Prefer
                } else {
                    postgres::config::SslMode::Require
                };
                cfg.ssl_mode(ssl_mode)
                    .connect(MakeTlsConnector::new(connector))
            }
        };

        result.map_err(|e| match e.as_db_error() {
            Some(db) => classify_db_error(db),
            None => CollectError::Connection(e.to_string()),
        })
    }
}

#[derive(Default)]
struct PgState {
    client: Option<Client>,
    server_version_num: i32,
}

impl PgState {
    /// Ensures the connection is established, reconnecting if needed.
    fn ensure_connected(&mut self, config: &PgConnectionConfig) -> Result<(), CollectError> {
        if self.client.is_some() {
            return Ok(());
        }

        let mut client = config.connect()?;

        // Determine server version once per (re)connect.
        self.server_version_num = client
            .query_one("SHOW server_version_num", &[])
            .ok()
            .and_then(|row| row.try_get::<_, String>(0).ok())
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0);

        info!(
            host = %config.host,
            dbname = %config.dbname,
            server_version_num = self.server_version_num,
            "connected to PostgreSQL"
        );
        self.client = Some(client);
        Ok(())
    }
}

/// [`DatabaseSource`] backed by one PostgreSQL connection.
pub struct PgSource {
    config: PgConnectionConfig,
    state: Arc<Mutex<PgState>>,
}

impl PgSource {
    pub fn new(config: PgConnectionConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(PgState::default())),
        }
    }

    pub fn config(&self) -> &PgConnectionConfig {
        &self.config
    }

    /// Runs `f` against the live connection on the blocking pool.
    ///
    /// A tick abandoned on timeout leaves its blocking call running; the
    /// next call fails fast instead of queueing behind it.
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, CollectError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Client, i32) -> Result<T, CollectError> + Send + 'static,
    {
        let config = self.config.clone();
        let shared = Arc::clone(&self.state);

        tokio::task::spawn_blocking(move || {
            let mut state = match shared.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    return Err(CollectError::Query(format!(
                        "{op}: previous statement still running"
                    )));
                }
            };

            state.ensure_connected(&config)?;
            let version = state.server_version_num;
            let Some(client) = state.client.as_mut() else {
                return Err(CollectError::Connection("not connected".to_string()));
            };

            let result = f(client, version);
            if let Err(e) = &result {
                debug!(op, error = %e, "dropping PostgreSQL connection after failure");
                state.client = None;
            }
            result
        })
        .await
        .map_err(|e| CollectError::Query(format!("{op}: blocking task failed: {e}")))?
    }
}

#[async_trait]
impl DatabaseSource for PgSource {
    async fn server_status(&self) -> Result<Vec<StatusValue>, CollectError> {
        self.run("server_status", |client, version| {
            let mut values = Vec::new();

            let row = client.query_one(queries::build_stat_database_query(), &[])?;
            push_status_row(&mut values, "pg_stat_database", &row)?;

            let row = client.query_one(queries::build_stat_database_conflicts_query(), &[])?;
            push_status_row(&mut values, "pg_stat_database_conflicts", &row)?;

            let row = client.query_one(queries::build_stat_bgwriter_query(version), &[])?;
            push_status_row(&mut values, "pg_stat_bgwriter", &row)?;

            if let Some(query) = queries::build_stat_archiver_query(version) {
                let row = client.query_one(query, &[])?;
                push_status_row(&mut values, "pg_stat_archiver", &row)?;
            }

            Ok(values)
        })
        .await
    }

    async fn settings(&self) -> Result<Vec<Setting>, CollectError> {
        self.run("settings", |client, _| {
            let rows = client.query(queries::SETTINGS_QUERY, &[])?;
            let mut settings = Vec::with_capacity(rows.len());
            for row in &rows {
                let name: String = row.try_get("name")?;
                let setting: String = row.try_get("setting")?;
                let unit: String = row.try_get("unit")?;
                // Skip values that do not parse (should not happen for numeric vartypes).
                let Ok(value) = setting.parse::<f64>() else {
                    continue;
                };
                settings.push(Setting { name, value, unit });
            }
            Ok(settings)
        })
        .await
    }

    async fn table_stats(
        &self,
        limit: usize,
        ranking: TableRanking,
    ) -> Result<Vec<TableStats>, CollectError> {
        let limit = sql_limit(limit);
        self.run("table_stats", move |client, _| {
            let query = queries::build_user_tables_query(ranking);
            let rows = client.query(query.as_str(), &[&limit])?;
            rows.iter()
                .map(|row| table_from_row(row).map_err(CollectError::from))
                .collect()
        })
        .await
    }

    async fn index_stats(
        &self,
        limit: usize,
        ranking: IndexRanking,
    ) -> Result<Vec<IndexStats>, CollectError> {
        let limit = sql_limit(limit);
        self.run("index_stats", move |client, _| {
            let query = queries::build_user_indexes_query(ranking);
            let rows = client.query(query.as_str(), &[&limit])?;
            rows.iter()
                .map(|row| -> Result<IndexStats, CollectError> {
                    Ok(IndexStats {
                        schema: row.try_get("schemaname")?,
                        table: row.try_get("relname")?,
                        name: row.try_get("indexrelname")?,
                        idx_scan: row.try_get("idx_scan")?,
                        idx_tup_read: row.try_get("idx_tup_read")?,
                        idx_tup_fetch: row.try_get("idx_tup_fetch")?,
                        idx_blks_read: row.try_get("idx_blks_read")?,
                        idx_blks_hit: row.try_get("idx_blks_hit")?,
                        size: row.try_get("size_bytes")?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn statement_stats(&self, limit: usize) -> Result<Vec<StatementStats>, CollectError> {
        let limit = sql_limit(limit);
        self.run("statement_stats", move |client, version| {
            if client
                .query_opt(queries::STATEMENTS_EXTENSION_QUERY, &[])?
                .is_none()
            {
                return Err(CollectError::SchemaDrift(
                    "pg_stat_statements extension is not installed".to_string(),
                ));
            }

            let query = queries::build_stat_statements_query(version);
            let rows = client.query(query.as_str(), &[&limit])?;
            rows.iter()
                .map(|row| -> Result<StatementStats, CollectError> {
                    Ok(StatementStats {
                        queryid: row.try_get("queryid")?,
                        datname: row.try_get("datname")?,
                        usename: row.try_get("usename")?,
                        toplevel: row.try_get("toplevel")?,
                        calls: row.try_get("calls")?,
                        total_exec_time: row.try_get("total_exec_time")?,
                        mean_exec_time: row.try_get("mean_exec_time")?,
                        rows: row.try_get("rows")?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn active_queries(
        &self,
        min_duration: Duration,
    ) -> Result<Vec<ActiveQuery>, CollectError> {
        let min_secs = min_duration.as_secs_f64();
        self.run("active_queries", move |client, _| {
            let rows = client.query(queries::build_active_queries_query(), &[&min_secs])?;
            rows.iter()
                .map(|row| -> Result<ActiveQuery, CollectError> {
                    let query_start: f64 = row.try_get("query_start")?;
                    let running_for: f64 = row.try_get("running_for")?;
                    Ok(ActiveQuery {
                        pid: row.try_get("pid")?,
                        datname: row.try_get("datname")?,
                        usename: row.try_get("usename")?,
                        state: row.try_get("state")?,
                        wait_event: row.try_get("wait_event")?,
                        query: row.try_get("query")?,
                        query_start: epoch_to_utc(query_start),
                        running_for: Duration::from_secs_f64(running_for.max(0.0)),
                    })
                })
                .collect()
        })
        .await
    }

    async fn schema(&self) -> Result<SchemaSnapshot, CollectError> {
        self.run("schema", |client, _| {
            let mut snapshot = SchemaSnapshot::default();

            for row in &client.query(queries::build_columns_query().as_str(), &[])? {
                let schema: String = row.try_get("schemaname")?;
                let table: String = row.try_get("relname")?;
                let column = ColumnDef {
                    name: row.try_get("attname")?,
                    data_type: row.try_get("data_type")?,
                    nullable: row.try_get("nullable")?,
                    ordinal: row.try_get("ordinal")?,
                };
                // Rows arrive ordered by (schema, table, attnum).
                match snapshot.tables.last_mut() {
                    Some(last) if last.schema == schema && last.name == table => {
                        last.columns.push(column);
                    }
                    _ => snapshot.tables.push(TableDef {
                        schema,
                        name: table,
                        columns: vec![column],
                    }),
                }
            }

            for row in &client.query(queries::build_indexes_query().as_str(), &[])? {
                snapshot.indexes.push(IndexDef {
                    schema: row.try_get("schemaname")?,
                    table: row.try_get("relname")?,
                    name: row.try_get("indexrelname")?,
                    is_unique: row.try_get("is_unique")?,
                    is_primary: row.try_get("is_primary")?,
                });
            }

            Ok(snapshot)
        })
        .await
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn epoch_to_utc(epoch_secs: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis((epoch_secs * 1000.0) as i64).unwrap_or_else(Utc::now)
}

fn table_from_row(row: &Row) -> Result<TableStats, postgres::Error> {
    Ok(TableStats {
        schema: row.try_get("schemaname")?,
        name: row.try_get("relname")?,
        seq_scan: row.try_get("seq_scan")?,
        seq_tup_read: row.try_get("seq_tup_read")?,
        idx_scan: row.try_get("idx_scan")?,
        idx_tup_fetch: row.try_get("idx_tup_fetch")?,
        n_tup_ins: row.try_get("n_tup_ins")?,
        n_tup_upd: row.try_get("n_tup_upd")?,
        n_tup_del: row.try_get("n_tup_del")?,
        n_tup_hot_upd: row.try_get("n_tup_hot_upd")?,
        n_live_tup: row.try_get("n_live_tup")?,
        n_dead_tup: row.try_get("n_dead_tup")?,
        vacuum_count: row.try_get("vacuum_count")?,
        autovacuum_count: row.try_get("autovacuum_count")?,
        analyze_count: row.try_get("analyze_count")?,
        autoanalyze_count: row.try_get("autoanalyze_count")?,
        heap_blks_read: row.try_get("heap_blks_read")?,
        heap_blks_hit: row.try_get("heap_blks_hit")?,
        idx_blks_read: row.try_get("idx_blks_read")?,
        idx_blks_hit: row.try_get("idx_blks_hit")?,
        relation_size: row.try_get("relation_size")?,
        indexes_size: row.try_get("indexes_size")?,
        toast_size: row.try_get("toast_size")?,
    })
}

/// Appends every column of a single-row status query.
fn push_status_row(
    out: &mut Vec<StatusValue>,
    view: &str,
    row: &Row,
) -> Result<(), postgres::Error> {
    for (i, column) in row.columns().iter().enumerate() {
        let value: f64 = row.try_get(i)?;
        let name = column.name();
        out.push(if name == "numbackends" {
            StatusValue::gauge(view, name, value, "connections")
        } else {
            StatusValue::counter(view, name, value, status_unit(name))
        });
    }
    Ok(())
}

fn status_unit(name: &str) -> &'static str {
    if name.ends_with("_time") {
        "ms"
    } else if name.ends_with("_bytes") {
        "bytes"
    } else if name.contains("blks") || name.starts_with("buffers_") || name == "maxwritten_clean" {
        "blocks"
    } else {
        "count"
    }
}

/// Maps a SQLSTATE to the collector error taxonomy.
pub(crate) fn classify_sqlstate(code: &str, message: String) -> CollectError {
    match code {
        c if c.starts_with("28") || c == "42501" => CollectError::Auth(message),
        "42P01" | "42703" | "42883" | "42704" => CollectError::SchemaDrift(message),
        c if c.starts_with("08") || c.starts_with("57P") => CollectError::Connection(message),
        _ => CollectError::Query(message),
    }
}

/// Server-side error as `SQLSTATE SEVERITY: message`, classified by code.
fn classify_db_error(db: &DbError) -> CollectError {
    let code = db.code().code();
    classify_sqlstate(code, format!("{code} {}: {}", db.severity(), db.message()))
}

impl From<postgres::Error> for CollectError {
    fn from(e: postgres::Error) -> Self {
        if let Some(db) = e.as_db_error() {
            return classify_db_error(db);
        }
        let io = std::error::Error::source(&e).is_some_and(|s| s.is::<std::io::Error>());
        if e.is_closed() || io {
            CollectError::Connection(e.to_string())
        } else {
            CollectError::Query(e.to_string())
        }
    }
}
