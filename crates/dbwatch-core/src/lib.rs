//! dbwatch-core - shared library for the dbwatch agent.
//!
//! Provides:
//! - `model` - observations, raw samples, batches
//! - `snapshot` - last-seen raw counter values per metric key
//! - `rates` - counter diff engine (cumulative counters to per-second rates)
//! - `collector` - the `Collector` capability and its variants
//! - `source` - database and cloud-monitoring adapters the collectors read from
//! - `scheduler` - jobs, per-job tick loops, timeouts, shutdown
//! - `dispatcher` - batching and reliable delivery to the ingestion service
//! - `ingest` - ingestion wire format and HTTP transport
//! - `health` - agent self-health registry
//! - `config` - YAML configuration, overrides, validation
//! - `export` - optional object-storage style export of flushed batches
//! - `agent` - wiring of all of the above into one running agent

pub mod agent;
pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod export;
pub mod health;
pub mod ingest;
pub mod model;
pub mod rates;
pub mod scheduler;
pub mod snapshot;
pub mod source;

/// Agent version reported to the ingestion service.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
