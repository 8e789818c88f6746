//! HTTP client for the ingestion server.
//!
//! [`ServerClient`] is a stateless wrapper over the three server operations
//! the relay needs: an unauthenticated liveness ping, a credential check,
//! and the batch PUT. Connection pooling comes from the shared
//! `reqwest::Client`; every call carries an explicit timeout. There is no
//! retry here: retrying a failed batch is the autoflush timer's job.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::ShellConfig;
use crate::record::RecordBatch;
use crate::wire;

/// Deadline for the unauthenticated liveness ping. Deliberately not the
/// configured call timeout: liveness must answer fast or not at all.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from server calls.
#[derive(Debug)]
pub enum ClientError {
    /// The HTTP transport failed (connect, DNS, protocol).
    Network(reqwest::Error),

    /// The call exceeded its deadline.
    Timeout,

    /// The server rejected the credentials (401/403).
    Auth(StatusCode),

    /// The server failed (5xx).
    Server(StatusCode),

    /// The server rejected the request for another reason (4xx).
    BadRequest(StatusCode),

    /// The HTTP client could not be built.
    Config(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Network(e) => write!(f, "HTTP request failed: {}", e),
            ClientError::Timeout => write!(f, "Request timed out"),
            ClientError::Auth(code) => write!(f, "Credentials rejected ({})", code),
            ClientError::Server(code) => write!(f, "Server error ({})", code),
            ClientError::BadRequest(code) => write!(f, "Request rejected ({})", code),
            ClientError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Network(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Network(err)
        }
    }
}

/// Stateless HTTP wrapper around the ingestion server.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct ServerClient {
    /// The underlying HTTP client (reused for connection pooling).
    http: Client,

    /// Server base URL, with trailing `/`.
    host: String,

    /// Account used for authenticated calls.
    user: String,

    /// Password for basic auth.
    password: String,

    /// Deadline for authenticated calls.
    timeout: Duration,
}

impl ServerClient {
    /// Create a client for the configured host and credentials.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &ShellConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            http,
            host: config.host.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            timeout: config.timeout,
        })
    }

    /// The server base URL this client talks to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Unauthenticated liveness check: GET the host root, bounded by
    /// [`PING_TIMEOUT`]. True iff the server answered with a 2xx.
    pub async fn ping(&self) -> bool {
        let result = self
            .http
            .get(&self.host)
            .timeout(PING_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(host = %self.host, error = %e, "Ping failed");
                false
            }
        }
    }

    /// Whether the configured credentials resolve to a registered user at
    /// the host. Transport failures count as "not registered".
    pub async fn is_registered(&self) -> bool {
        let url = format!("{}users/{}", self.host, self.user);
        let result = self
            .http
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .timeout(self.timeout)
            .send()
            .await;
        match result {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!(url = %url, error = %e, "Registration check failed");
                false
            }
        }
    }

    /// PUT one batch to the ingestion endpoint.
    ///
    /// The batch is serialized to the XML wire format and sent with basic
    /// auth under the configured timeout. Any 2xx counts as acknowledged.
    pub async fn put_batch(&self, batch: &RecordBatch) -> Result<(), ClientError> {
        let url = format!("{}sensordata", self.host);
        let body = wire::to_xml(batch);

        debug!(url = %url, records = batch.len(), "Sending batch");

        let response = self
            .http
            .put(&url)
            .basic_auth(&self.user, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(ClientError::Auth(status))
        } else if status.is_server_error() {
            Err(ClientError::Server(status))
        } else {
            Err(ClientError::BadRequest(status))
        }
    }
}
