//! Sensor Relay
//!
//! A client-side telemetry relay for development-activity sensors. Sensors
//! enqueue records through a long-lived [`Relay`]; the relay buffers them,
//! transmits them to an ingestion server in batches, hides transient
//! outages by spooling batches to local disk, and replays the spool at the
//! next startup.
//!
//! - **config**: validated settings from a flat properties file
//! - **record**: sensor data records and batches
//! - **wire**: the XML batch document shared by server and spool
//! - **client**: the three server operations (ping, credential check, PUT)
//! - **probe**: wall-clock-bounded reachability check
//! - **spool**: durable on-disk queue of failed batches
//! - **logger**: per-tool shell session log
//! - **shell**: the buffered single-shell pipeline
//! - **multi**: round-robin fan-out over N shells
//! - **relay**: the construction façade sensors use
//!
//! # Example
//!
//! ```no_run
//! use sensor_relay::{Relay, ShellConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ShellConfig::new(
//!         "http://relay.example.org:9876/relay",
//!         "pat@example.org",
//!         "secret",
//!     )?;
//!     let relay = Relay::start(config, "my-editor-sensor").await?;
//!
//!     relay
//!         .add_key_vals(&[
//!             ("tool".to_string(), "Eclipse".to_string()),
//!             ("sensorDataType".to_string(), "DevEvent".to_string()),
//!             ("DevEvent-Type".to_string(), "Compile".to_string()),
//!         ])
//!         .await?;
//!
//!     relay.quit().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod logger;
pub mod multi;
pub mod probe;
pub mod record;
pub mod relay;
pub mod shell;
pub mod spool;
pub mod wire;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export the types sensors touch in normal use.
pub use client::{ClientError, ServerClient};
pub use config::{ConfigError, LogLevel, ShellConfig};
pub use multi::MultiShell;
pub use record::{RecordBatch, SensorRecord, ValidationError};
pub use relay::Relay;
pub use shell::{FlushFailure, SensorShell, ShellError};
pub use spool::SpoolStore;
