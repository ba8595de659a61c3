//! Error taxonomy shared by collectors, sources and the dispatcher.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Classification of a failure, used for job policy and health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Source unreachable. The job retries on its next tick.
    Connection,
    /// Credentials rejected by the database or the ingestion service.
    Auth,
    /// Network failure worth retrying (delivery only).
    TransientNetwork,
    /// Expected view/column/extension is missing on this server version.
    SchemaDrift,
    /// The tick exceeded its time budget.
    Timeout,
    /// A statement failed for another reason; transient per tick.
    Query,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Auth => "auth",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::SchemaDrift => "schema_drift",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Query => "query",
        }
    }

    /// Whether a collector failing with this kind is disabled for the rest
    /// of the process lifetime.
    pub fn disables_job(self) -> bool {
        matches!(self, ErrorKind::Auth | ErrorKind::SchemaDrift)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one collector invocation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollectError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("schema drift: {0}")]
    SchemaDrift(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("query failed: {0}")]
    Query(String),
}

impl CollectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollectError::Connection(_) => ErrorKind::Connection,
            CollectError::Auth(_) => ErrorKind::Auth,
            CollectError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            CollectError::SchemaDrift(_) => ErrorKind::SchemaDrift,
            CollectError::Timeout(_) => ErrorKind::Timeout,
            CollectError::Query(_) => ErrorKind::Query,
        }
    }
}

/// Failure of one delivery attempt to the ingestion service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeliveryError {
    /// Connection failure, timeout or a retryable status (5xx, 408, 429).
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// 401/403: the API key is not accepted. Fatal for the process.
    #[error("ingestion service rejected credentials (HTTP {status})")]
    Auth { status: u16 },

    /// Any other non-success status. The batch is dropped without retry.
    #[error("ingestion service rejected batch (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to encode batch: {0}")]
    Encode(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::Transient(_) => ErrorKind::TransientNetwork,
            DeliveryError::Auth { .. } => ErrorKind::Auth,
            DeliveryError::Rejected { .. } | DeliveryError::Encode(_) => ErrorKind::Query,
        }
    }

    /// Maps an HTTP status of the ingestion endpoint to a delivery outcome.
    pub fn from_status(status: u16, body: impl Into<String>) -> Option<Self> {
        match status {
            200..=299 => None,
            401 | 403 => Some(DeliveryError::Auth { status }),
            408 | 429 | 500..=599 => Some(DeliveryError::Transient(format!("HTTP {status}"))),
            _ => Some(DeliveryError::Rejected {
                status,
                body: body.into(),
            }),
        }
    }
}
