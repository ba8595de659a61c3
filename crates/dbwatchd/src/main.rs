//! dbwatchd - database metrics agent.
//!
//! Samples PostgreSQL (and optionally cloud monitoring) metrics on
//! independent schedules and ships them to the ingestion service.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 the ingestion
//! service rejected the API key.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use dbwatch_core::agent::{Agent, AgentExit};
use dbwatch_core::collector::CollectorKind;
use dbwatch_core::config::{AgentConfig, ConfigOverrides};

const EXIT_CONFIG: i32 = 1;

// ============================================================
// CLI
// ============================================================

#[derive(Parser, Debug)]
#[command(name = "dbwatchd", about = "Database metrics agent", version = dbwatch_core::VERSION)]
struct Args {
    /// YAML configuration file. Without it, defaults plus flags are used.
    #[arg(short, long, env = "DBWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Ingestion service base URL.
    #[arg(long, env = "DBWATCH_SERVER_URL")]
    server_url: Option<String>,

    /// API key sent in the `ApiKey` header.
    #[arg(long, env = "DBWATCH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "DBWATCH_ORGANIZATION_ID")]
    organization_id: Option<String>,

    /// Key identifying the monitored database to the ingestion service.
    #[arg(long, env = "DBWATCH_DB_KEY")]
    db_key: Option<String>,

    #[arg(long, env = "DBWATCH_DB_HOST")]
    db_host: Option<String>,

    #[arg(long, env = "DBWATCH_DB_PORT")]
    db_port: Option<u16>,

    #[arg(long, env = "DBWATCH_DB_USER")]
    db_user: Option<String>,

    #[arg(long, env = "DBWATCH_DB_PASSWORD", hide_env_values = true)]
    db_password: Option<String>,

    #[arg(long, env = "DBWATCH_DB_NAME")]
    db_name: Option<String>,

    /// Authenticate with an IAM token read from --auth-token-file.
    #[arg(long, env = "DBWATCH_ENABLE_IAM_AUTH")]
    enable_iam_auth: Option<bool>,

    #[arg(long, env = "DBWATCH_AUTH_TOKEN_FILE")]
    auth_token_file: Option<PathBuf>,

    /// Collector to disable (repeatable): server_status, table_stats,
    /// index_stats, query_monitor, long_running_query, schema_monitor,
    /// cloud_metrics.
    #[arg(long = "disable", value_name = "COLLECTOR", value_parser = parse_kind)]
    disable: Vec<CollectorKind>,

    /// Interval override in seconds, e.g. `table_stats=600` (repeatable).
    #[arg(long = "interval", value_name = "COLLECTOR=SECS", value_parser = parse_interval)]
    intervals: Vec<(CollectorKind, u64)>,

    /// Maximum number of tables sampled per tick.
    #[arg(long, env = "DBWATCH_MAX_TABLES")]
    max_tables: Option<usize>,

    /// Maximum number of indexes sampled per tick.
    #[arg(long, env = "DBWATCH_MAX_INDEXES")]
    max_indexes: Option<usize>,

    /// Maximum number of statements sampled per tick.
    #[arg(long, env = "DBWATCH_MAX_QUERIES")]
    max_queries: Option<usize>,

    /// Latency threshold (minutes) of long running queries.
    #[arg(long, env = "DBWATCH_LR_QUERY_LATENCY_THRESHOLD_MIN")]
    lr_query_latency_threshold_min: Option<u64>,

    /// Also write every flushed batch under this directory.
    #[arg(long, env = "DBWATCH_EXPORT_DIR")]
    export_dir: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            server_url: self.server_url.clone(),
            api_key: self.api_key.clone(),
            organization_id: self.organization_id.clone(),
            db_key: self.db_key.clone(),
            db_host: self.db_host.clone(),
            db_port: self.db_port,
            db_user: self.db_user.clone(),
            db_password: self.db_password.clone(),
            db_name: self.db_name.clone(),
            enable_iam_auth: self.enable_iam_auth,
            auth_token_file: self.auth_token_file.clone(),
            disabled: self.disable.clone(),
            intervals: self.intervals.clone(),
            max_tables: self.max_tables,
            max_indexes: self.max_indexes,
            max_queries: self.max_queries,
            latency_threshold_min: self.lr_query_latency_threshold_min,
            export_directory: self.export_dir.clone(),
        }
    }
}

fn parse_kind(s: &str) -> Result<CollectorKind, String> {
    CollectorKind::ALL
        .into_iter()
        .find(|k| k.as_str() == s.trim())
        .ok_or_else(|| format!("unknown collector '{s}'"))
}

fn parse_interval(s: &str) -> Result<(CollectorKind, u64), String> {
    let (kind, secs) = s
        .split_once('=')
        .ok_or_else(|| format!("expected COLLECTOR=SECS, got '{s}'"))?;
    let secs = secs
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid interval '{secs}': {e}"))?;
    Ok((parse_kind(kind)?, secs))
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["dbwatchd", "dbwatch_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(args: &Args) -> Result<AgentConfig, String> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path).map_err(|e| e.to_string())?,
        None => AgentConfig::default(),
    };
    config.apply(args.overrides());
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!(version = dbwatch_core::VERSION, "dbwatchd starting");

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            process::exit(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(EXIT_CONFIG);
        }
    };

    let exit = runtime.block_on(async_main(config));
    // Blocking database calls of abandoned ticks must not hold the process.
    runtime.shutdown_background();
    process::exit(exit);
}

async fn async_main(config: AgentConfig) -> i32 {
    info!(
        server_url = %config.server_url,
        organization_id = %config.organization_id,
        db_key = %config.db_key,
        db_host = %config.database.host,
        iam_auth = config.database.enable_iam_auth,
        "configuration loaded"
    );

    let agent = match Agent::new(config) {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "failed to start agent");
            return EXIT_CONFIG;
        }
    };

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        token.cancel();
    }) {
        warn!(error = %e, "failed to set Ctrl-C handler");
    }

    let exit = agent.run(shutdown).await;
    match exit {
        AgentExit::Clean => info!("dbwatchd stopped"),
        AgentExit::FatalAuth => error!("dbwatchd stopped: ingestion service rejected the API key"),
    }
    exit.code()
}
