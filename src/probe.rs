//! Bounded-latency reachability probe.
//!
//! Wraps [`ServerClient::is_registered`] under a hard wall-clock bound.
//! HTTP connect/read timeouts are not uniformly honored across platforms,
//! so a supervisory `tokio::time::timeout` guarantees the latency the
//! caller sees; a straggling check is abandoned and its eventual result
//! discarded.

use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::client::ServerClient;

/// Default wall-clock bound for a probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness-with-credentials check for one server.
#[derive(Debug, Clone)]
pub struct ReachabilityProbe {
    client: ServerClient,
    bound: Duration,
}

impl ReachabilityProbe {
    /// Create a probe with the default bound.
    pub fn new(client: ServerClient) -> Self {
        Self::with_bound(client, DEFAULT_PROBE_TIMEOUT)
    }

    /// Create a probe with an explicit bound.
    pub fn with_bound(client: ServerClient, bound: Duration) -> Self {
        Self { client, bound }
    }

    /// Whether the server is contactable with the configured credentials,
    /// answered within the probe's bound.
    pub async fn is_pingable(&self) -> bool {
        self.is_pingable_within(self.bound).await
    }

    /// As [`is_pingable`](Self::is_pingable) with an explicit bound.
    /// A zero bound means no bound at all.
    pub async fn is_pingable_within(&self, bound: Duration) -> bool {
        if bound.is_zero() {
            return self.client.is_registered().await;
        }
        match timeout(bound, self.client.is_registered()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(host = %self.client.host(), bound_ms = bound.as_millis() as u64,
                    "Probe abandoned: no answer within bound");
                false
            }
        }
    }
}
