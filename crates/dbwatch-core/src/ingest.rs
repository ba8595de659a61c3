//! Ingestion service client.
//!
//! Wire contract: `POST {server_url}/observation/` with a JSON body
//! `{agent_version, organization_id, db_key, observations: [...]}` and the
//! API key in the `ApiKey` header. 2xx accepts the batch, 401/403 reject the
//! credentials, 5xx and connection failures are retryable.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::error::DeliveryError;
use crate::model::{Batch, Observation};

pub const API_KEY_HEADER: &str = "ApiKey";
pub const OBSERVATION_PATH: &str = "observation/";

/// Who the delivered observations belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub organization_id: String,
    pub db_key: String,
}

/// JSON body of one delivery.
#[derive(Debug, Serialize)]
pub struct IngestPayload<'a> {
    pub agent_version: &'a str,
    pub organization_id: &'a str,
    pub db_key: &'a str,
    pub observations: &'a [Observation],
}

impl<'a> IngestPayload<'a> {
    pub fn new(identity: &'a AgentIdentity, batch: &'a Batch) -> Self {
        Self {
            agent_version: crate::VERSION,
            organization_id: &identity.organization_id,
            db_key: &identity.db_key,
            observations: &batch.observations,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, DeliveryError> {
        serde_json::to_vec(self).map_err(|e| DeliveryError::Encode(e.to_string()))
    }
}

/// One delivery attempt. Retrying is the dispatcher's business.
#[async_trait]
pub trait IngestTransport: Send + Sync + 'static {
    async fn send(&self, payload: &IngestPayload<'_>) -> Result<(), DeliveryError>;
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid ingestion url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    Client(String),
}

/// Checks that `endpoint` is an absolute http(s) URL with a host.
pub fn validate_endpoint_url(endpoint: &str) -> Result<Url, EndpointError> {
    let invalid = |reason: String| EndpointError::InvalidUrl {
        url: endpoint.to_string(),
        reason,
    };

    if endpoint.is_empty() {
        return Err(invalid("url is empty".into()));
    }
    let url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(invalid(format!("scheme '{scheme}' is not http or https"))),
    }
    match url.host_str() {
        None | Some("") => return Err(invalid("missing host".into())),
        _ => {}
    }
    Ok(url)
}

/// `{server_url}/observation/`, tolerant of a trailing slash on the base.
pub fn observation_url(server_url: &str) -> Result<Url, EndpointError> {
    let mut base = validate_endpoint_url(server_url)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(OBSERVATION_PATH)
        .map_err(|e| EndpointError::InvalidUrl {
            url: server_url.to_string(),
            reason: e.to_string(),
        })
}

/// HTTP transport on `reqwest`.
pub struct HttpIngest {
    client: reqwest::Client,
    url: Url,
    api_key: String,
}

impl HttpIngest {
    pub fn new(server_url: &str, api_key: &str, timeout: Duration) -> Result<Self, EndpointError> {
        let url = observation_url(server_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dbwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EndpointError::Client(e.to_string()))?;
        Ok(Self {
            client,
            url,
            api_key: api_key.to_string(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl std::fmt::Debug for HttpIngest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIngest")
            .field("url", &self.url.as_str())
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl IngestTransport for HttpIngest {
    async fn send(&self, payload: &IngestPayload<'_>) -> Result<(), DeliveryError> {
        let body = payload.to_json()?;
        let response = self
            .client
            .post(self.url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .header("organization_id", payload.organization_id)
            .header("agent_version", payload.agent_version)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            debug!(status, observations = payload.observations.len(), "batch accepted");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        match DeliveryError::from_status(status, body) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Transport with a scripted sequence of outcomes, for tests.
#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct Attempt {
        pub at: Instant,
        pub observations: usize,
        pub metric_names: Vec<String>,
    }

    #[derive(Default)]
    struct Script {
        outcomes: VecDeque<Result<(), DeliveryError>>,
        attempts: Vec<Attempt>,
        delay: Duration,
    }

    /// Replays queued outcomes, then accepts everything.
    #[derive(Clone, Default)]
    pub struct ScriptedIngest {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedIngest {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_status(&self, status: u16) -> &Self {
            let outcome = match DeliveryError::from_status(status, "scripted") {
                Some(err) => Err(err),
                None => Ok(()),
            };
            self.script.lock().unwrap().outcomes.push_back(outcome);
            self
        }

        /// Every send takes this long (tokio time) before answering.
        pub fn set_delay(&self, delay: Duration) {
            self.script.lock().unwrap().delay = delay;
        }

        pub fn attempts(&self) -> Vec<Attempt> {
            self.script.lock().unwrap().attempts.clone()
        }
    }

    #[async_trait]
    impl IngestTransport for ScriptedIngest {
        async fn send(&self, payload: &IngestPayload<'_>) -> Result<(), DeliveryError> {
            let (delay, outcome) = {
                let mut script = self.script.lock().unwrap();
                script.attempts.push(Attempt {
                    at: Instant::now(),
                    observations: payload.observations.len(),
                    metric_names: payload
                        .observations
                        .iter()
                        .map(|o| o.metric_name().to_string())
                        .collect(),
                });
                (script.delay, script.outcomes.pop_front().unwrap_or(Ok(())))
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            outcome
        }
    }
}
