//! The construction façade.
//!
//! Sensors build a [`Relay`] and get either a single shell or a fan-out,
//! decided by `multishell.enabled`, behind one operation surface. This is
//! the only construction path sensors should use.

use chrono::{DateTime, Utc};

use crate::config::ShellConfig;
use crate::multi::MultiShell;
use crate::record::SensorRecord;
use crate::shell::{SensorShell, ShellError};

/// A transmission pipeline: one shell or many, per configuration.
pub enum Relay {
    Single(SensorShell),
    Multi(MultiShell),
}

impl Relay {
    /// Build the pipeline the configuration asks for.
    pub async fn start(config: ShellConfig, tool: &str) -> Result<Self, ShellError> {
        if config.multishell_enabled {
            Ok(Relay::Multi(MultiShell::start(config, tool).await?))
        } else {
            Ok(Relay::Single(SensorShell::start(config, tool).await?))
        }
    }

    /// Queue one record for transmission.
    pub async fn add(&self, record: SensorRecord) -> Result<(), ShellError> {
        match self {
            Relay::Single(shell) => shell.add(record).await,
            Relay::Multi(multi) => multi.add(record).await,
        }
    }

    /// Build a record from ordered key/value pairs and queue it.
    pub async fn add_key_vals(&self, pairs: &[(String, String)]) -> Result<(), ShellError> {
        match self {
            Relay::Single(shell) => shell.add_key_vals(pairs).await,
            Relay::Multi(multi) => multi.add_key_vals(pairs).await,
        }
    }

    /// Queue the pairs iff the `(resource, checksum)` state changed.
    pub async fn statechange(
        &self,
        checksum: i64,
        pairs: &[(String, String)],
    ) -> Result<bool, ShellError> {
        match self {
            Relay::Single(shell) => shell.statechange(checksum, pairs).await,
            Relay::Multi(multi) => multi.statechange(checksum, pairs).await,
        }
    }

    /// Flush now; returns the acknowledged record count.
    pub async fn send(&self) -> Result<usize, ShellError> {
        match self {
            Relay::Single(shell) => shell.send().await,
            Relay::Multi(multi) => multi.send().await,
        }
    }

    /// Whether the server answers with the configured credentials.
    pub async fn ping(&self) -> bool {
        match self {
            Relay::Single(shell) => shell.ping().await,
            Relay::Multi(multi) => multi.ping().await,
        }
    }

    /// Drain and terminate the pipeline.
    pub async fn quit(&self) -> Result<(), ShellError> {
        match self {
            Relay::Single(shell) => shell.quit().await,
            Relay::Multi(multi) => multi.quit().await,
        }
    }

    /// Replace the autoflush period (every child, in multi mode).
    pub fn set_autosend_interval(&self, minutes: f64) {
        match self {
            Relay::Single(shell) => shell.set_autosend_interval(minutes),
            Relay::Multi(multi) => multi.set_autosend_interval(minutes),
        }
    }

    /// Total records acknowledged over the pipeline's life.
    pub fn total_sent(&self) -> u64 {
        match self {
            Relay::Single(shell) => shell.total_sent(),
            Relay::Multi(multi) => multi.total_sent(),
        }
    }

    /// Whether any batch has been spooled since construction.
    pub fn has_offline_data(&self) -> bool {
        match self {
            Relay::Single(shell) => shell.has_offline_data(),
            Relay::Multi(multi) => multi.has_offline_data(),
        }
    }

    /// When the pipeline was constructed (first child, in multi mode).
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Relay::Single(shell) => Some(shell.start_time()),
            Relay::Multi(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StubServer;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(host: &str, data_dir: &TempDir) -> ShellConfig {
        let mut config = ShellConfig::new(host, "pat@example.org", "secret").unwrap();
        config.timeout = Duration::from_secs(2);
        config.autosend_interval_minutes = 0.0;
        config.multishell_autosend_interval_minutes = 0.0;
        config.data_dir = data_dir.path().to_path_buf();
        config
    }

    fn record(resource: &str) -> SensorRecord {
        SensorRecord::new("pat@example.org", "Eclipse", "DevEvent", resource)
    }

    #[tokio::test]
    async fn test_selects_single_shell_by_default() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let relay = Relay::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();
        assert!(matches!(relay, Relay::Single(_)));

        relay.add(record("a.rs")).await.unwrap();
        assert_eq!(relay.send().await.unwrap(), 1);
        assert_eq!(relay.total_sent(), 1);
        relay.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_selects_multi_shell_when_enabled() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let mut config = test_config(&server.host(), &data_dir);
        config.multishell_enabled = true;
        config.multishell_num_shells = 2;
        let relay = Relay::start(config, "test").await.unwrap();
        assert!(matches!(relay, Relay::Multi(_)));

        relay.add(record("a.rs")).await.unwrap();
        relay.add(record("b.rs")).await.unwrap();
        assert_eq!(relay.send().await.unwrap(), 2);
        assert!(relay.ping().await);
        relay.quit().await.unwrap();
    }
}
