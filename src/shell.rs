//! The single transmission shell.
//!
//! A [`SensorShell`] owns an in-memory buffer of pending records, a
//! periodic autoflush task, a reachability probe, a server client, and a
//! spool store. Producers call `add`/`statechange`; the shell batches,
//! transmits, and diverts to the spool when the server is unreachable or a
//! PUT fails. At construction the shell replays previously spooled batches
//! through a short-lived recovery helper shell.
//!
//! Locking: the buffer mutex is held only to append or detach records.
//! The HTTP call runs outside it, under a separate flush gate that admits
//! one in-flight flush per shell; a timer tick that finds the gate taken
//! skips its turn.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::client::{ClientError, ServerClient};
use crate::config::ShellConfig;
use crate::logger::ShellLogger;
use crate::probe::ReachabilityProbe;
use crate::record::{RecordBatch, SensorRecord, ValidationError};
use crate::spool::{SpoolError, SpoolStore};
use crate::wire;

/// Autoflush periods below this many minutes disable the timer.
pub const MIN_AUTOSEND_MINUTES: f64 = 0.01;

/// Log-tool suffix for the startup recovery helper shell.
const RECOVERY_TOOL_SUFFIX: &str = "-offline-recovery";

/// Why a flush failed to deliver its batch.
///
/// Server-unreachable and empty-buffer are normal flush outcomes, not
/// failures; only I/O problems land here.
#[derive(Debug)]
pub enum FlushFailure {
    /// The batch PUT was rejected or the transport failed.
    Transmit(ClientError),

    /// The batch could not be written to the spool; its records are lost.
    Spool(SpoolError),
}

impl std::fmt::Display for FlushFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushFailure::Transmit(e) => write!(f, "transmission failed: {}", e),
            FlushFailure::Spool(e) => write!(f, "spool write failed: {}", e),
        }
    }
}

/// Errors surfaced by shell operations.
#[derive(Debug)]
pub enum ShellError {
    /// The shell has been terminated by `quit`.
    Closed,

    /// A record failed validation.
    Validation(ValidationError),

    /// The HTTP client could not be constructed.
    Client(ClientError),

    /// The spool directory could not be opened.
    Spool(SpoolError),

    /// The final flush during `quit` failed; teardown still completed.
    FinalFlush(FlushFailure),

    /// Failures collected from child shells.
    Children(Vec<ShellError>),
}

impl std::fmt::Display for ShellError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellError::Closed => write!(f, "Shell is terminated"),
            ShellError::Validation(e) => write!(f, "Invalid record: {}", e),
            ShellError::Client(e) => write!(f, "Can't construct server client: {}", e),
            ShellError::Spool(e) => write!(f, "Can't open spool: {}", e),
            ShellError::FinalFlush(e) => write!(f, "Final flush failed: {}", e),
            ShellError::Children(errors) => {
                write!(f, "{} child shell(s) failed", errors.len())?;
                for error in errors {
                    write!(f, "; {}", error)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ShellError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShellError::Validation(e) => Some(e),
            ShellError::Client(e) => Some(e),
            ShellError::Spool(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for ShellError {
    fn from(err: ValidationError) -> Self {
        ShellError::Validation(err)
    }
}

/// Result of one flush pass.
struct FlushOutcome {
    /// Records the server acknowledged in this pass.
    sent: usize,

    /// The I/O failure, if the pass had one.
    failure: Option<FlushFailure>,
}

impl FlushOutcome {
    fn empty() -> Self {
        Self {
            sent: 0,
            failure: None,
        }
    }
}

/// `(last_resource, last_checksum)` pair for statechange deduplication.
#[derive(Debug, Default)]
struct StateChangeMemo {
    resource: String,
    checksum: i64,
}

struct ShellInner {
    config: ShellConfig,
    tool: String,
    client: ServerClient,
    probe: ReachabilityProbe,
    spool: Arc<SpoolStore>,
    log: ShellLogger,

    /// Pending records; held only to append or detach.
    buffer: tokio::sync::Mutex<Vec<SensorRecord>>,

    /// Statechange dedup state. Brief, synchronous critical section.
    memo: std::sync::Mutex<StateChangeMemo>,

    /// Admits one in-flight flush; held across the HTTP call.
    flush_gate: tokio::sync::Mutex<()>,

    /// The autoflush task, if the timer is enabled.
    ticker: std::sync::Mutex<Option<JoinHandle<()>>>,

    total_sent: AtomicU64,
    closed: AtomicBool,
    start_time: DateTime<Utc>,
}

impl Drop for ShellInner {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

/// A buffered producer/consumer pipeline to one ingestion server.
pub struct SensorShell {
    inner: Arc<ShellInner>,
}

impl SensorShell {
    /// Construct a shell, start its autoflush timer, and replay any
    /// spooled batches if recovery is enabled and the server answers.
    pub async fn start(config: ShellConfig, tool: &str) -> Result<Self, ShellError> {
        let spool = Arc::new(SpoolStore::new(config.offline_dir()).map_err(ShellError::Spool)?);
        Self::assemble(config, tool.to_string(), spool, true).await
    }

    /// Shared construction path. `run_recovery` is false for the recovery
    /// helper itself and for multishell children other than the first.
    pub(crate) async fn assemble(
        config: ShellConfig,
        tool: String,
        spool: Arc<SpoolStore>,
        run_recovery: bool,
    ) -> Result<Self, ShellError> {
        let client = ServerClient::new(&config).map_err(ShellError::Client)?;
        let probe = ReachabilityProbe::new(client.clone());
        let log = ShellLogger::open(&config.log_dir(), &tool, config.logging_level);

        let autosend_minutes = config.effective_autosend_minutes();
        let inner = Arc::new(ShellInner {
            config,
            tool,
            client,
            probe,
            spool,
            log,
            buffer: tokio::sync::Mutex::new(Vec::new()),
            memo: std::sync::Mutex::new(StateChangeMemo::default()),
            flush_gate: tokio::sync::Mutex::new(()),
            ticker: std::sync::Mutex::new(None),
            total_sent: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            start_time: Utc::now(),
        });
        let shell = Self { inner };

        shell.print_banner().await;
        shell.set_autosend_interval(autosend_minutes);
        if run_recovery && shell.inner.config.offline_recovery_enabled {
            shell.recover_offline().await;
        }
        Ok(shell)
    }

    /// Append a record to the buffer.
    ///
    /// When the buffer reaches the configured maximum this flushes
    /// synchronously before returning, so the caller observes server (or
    /// spool) latency on that call only.
    pub async fn add(&self, record: SensorRecord) -> Result<(), ShellError> {
        self.ensure_open()?;
        record.validate()?;

        let max_buffer = self.inner.config.effective_max_buffer();
        let at_limit = {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.push(record);
            max_buffer > 0 && buffer.len() >= max_buffer
        };
        if at_limit {
            let _gate = self.inner.flush_gate.lock().await;
            let outcome = ShellInner::flush_buffer(&self.inner).await;
            if let Some(failure) = outcome.failure {
                self.inner
                    .log
                    .warn(&format!("Buffer-limit flush failed: {}", failure));
            }
        }
        Ok(())
    }

    /// Build a record from ordered key/value pairs and add it.
    ///
    /// The six reserved keys become fields; `owner` defaults to the
    /// configured user and `timestamp`/`runtime` to now.
    pub async fn add_key_vals(&self, pairs: &[(String, String)]) -> Result<(), ShellError> {
        self.ensure_open()?;
        let record = SensorRecord::from_key_vals(pairs, &self.inner.config.user)?;
        self.add(record).await
    }

    /// Add the pairs as a record iff `(resource, checksum)` differs from
    /// the last call. The memo is updated unconditionally. Returns whether
    /// a record was queued.
    pub async fn statechange(
        &self,
        checksum: i64,
        pairs: &[(String, String)],
    ) -> Result<bool, ShellError> {
        self.ensure_open()?;
        let resource = pairs
            .iter()
            .find(|(key, _)| key == "resource")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();

        let changed = {
            let mut memo = self.inner.memo.lock().unwrap_or_else(|e| e.into_inner());
            let changed = memo.resource != resource || memo.checksum != checksum;
            memo.resource = resource;
            memo.checksum = checksum;
            changed
        };
        if changed {
            self.add_key_vals(pairs).await?;
        }
        Ok(changed)
    }

    /// Flush the buffer now. Returns the number of records the server
    /// acknowledged in this call; transmission and spool failures are
    /// absorbed (logged) and count as zero.
    pub async fn send(&self) -> Result<usize, ShellError> {
        self.ensure_open()?;
        let _gate = self.inner.flush_gate.lock().await;
        let outcome = ShellInner::flush_buffer(&self.inner).await;
        if let Some(failure) = outcome.failure {
            self.inner.log.warn(&format!("Send failed: {}", failure));
        }
        Ok(outcome.sent)
    }

    /// Whether the server is contactable with the configured credentials.
    pub async fn ping(&self) -> bool {
        self.inner.probe.is_pingable().await
    }

    /// Terminate the shell: stop the timer, drain the buffer with one
    /// final flush, and close the session log. A final-flush failure is
    /// reported after teardown completes; any spool file it produced
    /// persists for the next recovery.
    pub async fn quit(&self) -> Result<(), ShellError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(ShellError::Closed);
        }
        if let Some(handle) = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        let outcome = {
            let _gate = self.inner.flush_gate.lock().await;
            ShellInner::flush_buffer(&self.inner).await
        };
        if let Some(failure) = &outcome.failure {
            self.inner
                .log
                .warn(&format!("Final flush failed: {}", failure));
        }
        self.inner.log.info("Quitting.");
        self.inner.log.close();

        match outcome.failure {
            Some(failure) => Err(ShellError::FinalFlush(failure)),
            None => Ok(()),
        }
    }

    /// Replace the autoflush period. Periods below
    /// [`MIN_AUTOSEND_MINUTES`] cancel the timer.
    pub fn set_autosend_interval(&self, minutes: f64) {
        let mut ticker = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = ticker.take() {
            handle.abort();
        }
        if !minutes.is_finite() || minutes < MIN_AUTOSEND_MINUTES {
            self.inner.log.info("Autoflush timer disabled.");
            return;
        }

        let period = Duration::from_millis((minutes * 60_000.0).round() as u64);
        let weak = Arc::downgrade(&self.inner);
        *ticker = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                // One in-flight flush per shell; a busy gate skips the tick.
                let gate = inner.flush_gate.try_lock();
                if let Ok(_gate) = gate {
                    let outcome = ShellInner::flush_buffer(&inner).await;
                    if let Some(failure) = outcome.failure {
                        inner
                            .log
                            .warn(&format!("Automatic flush failed: {}", failure));
                    }
                }
            }
        }));
        self.inner
            .log
            .info(&format!("Autoflush set to {} minutes.", minutes));
    }

    /// Whether the autoflush timer is currently running.
    pub fn autoflush_enabled(&self) -> bool {
        self.inner
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Total records acknowledged by the server over this shell's life.
    pub fn total_sent(&self) -> u64 {
        self.inner.total_sent.load(Ordering::SeqCst)
    }

    /// Whether this shell has spooled any batch since construction.
    pub fn has_offline_data(&self) -> bool {
        self.inner.spool.has_offline_data()
    }

    /// When this shell was constructed.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.inner.start_time
    }

    /// The log-tool name this shell was created with.
    pub fn tool(&self) -> &str {
        &self.inner.tool
    }

    /// Records currently waiting in the buffer.
    pub async fn buffered(&self) -> usize {
        self.inner.buffer.lock().await.len()
    }

    fn ensure_open(&self) -> Result<(), ShellError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(ShellError::Closed)
        } else {
            Ok(())
        }
    }

    async fn print_banner(&self) {
        let inner = &self.inner;
        inner.log.info(&format!(
            "sensor-relay {} started at {}.",
            env!("CARGO_PKG_VERSION"),
            inner.start_time.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        let available = inner.client.ping().await;
        inner.log.info(&format!(
            "Host {} is {}.",
            inner.config.host,
            if available { "available" } else { "not available" }
        ));
        if inner.client.is_registered().await {
            inner.log.info(&format!(
                "User {} is authorized to log in at this host.",
                inner.config.user
            ));
        } else {
            inner.log.warn(&format!(
                "User {} is NOT authorized to log in at this host.",
                inner.config.user
            ));
        }
    }

    /// Replay spooled batches through a helper shell.
    ///
    /// The helper runs with caching and recovery disabled and with its own
    /// flush triggers off, so each file goes out as exactly one batch and
    /// a failure cannot re-spool a duplicate file. A file is deleted only
    /// when the server acknowledged every record it held.
    async fn recover_offline(&self) {
        let inner = &self.inner;
        if !inner.probe.is_pingable().await {
            inner
                .log
                .info("Not checking for offline data: server not available.");
            return;
        }
        let files = match inner.spool.list() {
            Ok(files) => files,
            Err(e) => {
                inner
                    .log
                    .warn(&format!("Can't enumerate offline data: {}", e));
                return;
            }
        };
        if files.is_empty() {
            inner.log.info("No offline data to recover.");
            return;
        }
        inner.log.info(&format!(
            "Checking for offline data to recover ({} files).",
            files.len()
        ));

        let mut helper_config = inner.config.clone();
        helper_config.offline_cache_enabled = false;
        helper_config.offline_recovery_enabled = false;
        // Each spool file must go out as one acknowledged batch, so the
        // helper never flushes on its own.
        helper_config.multishell_enabled = false;
        helper_config.autosend_interval_minutes = 0.0;
        helper_config.autosend_max_buffer = 0;

        let helper_tool = format!("{}{}", inner.tool, RECOVERY_TOOL_SUFFIX);
        let helper =
            match Box::pin(SensorShell::assemble(
                helper_config,
                helper_tool,
                inner.spool.clone(),
                false,
            ))
            .await
            {
                Ok(shell) => shell,
                Err(e) => {
                    inner
                        .log
                        .warn(&format!("Can't construct recovery shell: {}", e));
                    return;
                }
            };

        for path in files {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| wire::from_xml(&text).map_err(|e| e.to_string()));
            let batch = match parsed {
                Ok(batch) => batch,
                Err(e) => {
                    inner.log.warn(&format!(
                        "Skipping unreadable spool file {}: {}",
                        path.display(),
                        e
                    ));
                    continue;
                }
            };
            if batch.is_empty() {
                let _ = inner.spool.delete(&path);
                continue;
            }

            let expected = batch.len();
            let mut queued_all = true;
            for record in batch.records {
                if helper.add(record).await.is_err() {
                    queued_all = false;
                }
            }
            let sent = helper.send().await.unwrap_or(0);
            if queued_all && sent == expected {
                match inner.spool.delete(&path) {
                    Ok(()) => inner.log.info(&format!(
                        "Recovered {} records from {}.",
                        sent,
                        path.display()
                    )),
                    Err(e) => inner.log.warn(&format!(
                        "Recovered data but can't delete {}: {}",
                        path.display(),
                        e
                    )),
                }
            } else {
                inner.log.warn(&format!(
                    "Recovery of {} incomplete ({} of {} acknowledged), keeping file.",
                    path.display(),
                    sent,
                    expected
                ));
            }
        }

        if let Err(e) = helper.quit().await {
            inner.log.warn(&format!("Recovery shell quit failed: {}", e));
        }
    }
}

impl ShellInner {
    /// One flush pass: detach the buffer, then transmit or divert.
    ///
    /// Callers must hold the flush gate. The buffer mutex is released
    /// before any network or disk I/O. No retry happens here; the batch
    /// either reaches the server, reaches the spool, or (with caching
    /// disabled) is dropped.
    async fn flush_buffer(inner: &Arc<ShellInner>) -> FlushOutcome {
        let batch = {
            let mut buffer = inner.buffer.lock().await;
            if buffer.is_empty() {
                return FlushOutcome::empty();
            }
            RecordBatch::new(std::mem::take(&mut *buffer))
        };
        let count = batch.len();

        if !inner.probe.is_pingable().await {
            if inner.config.offline_cache_enabled {
                return inner.divert_to_spool(batch, None);
            }
            inner.log.warn(&format!(
                "Server not available and offline storage disabled. {} records lost.",
                count
            ));
            return FlushOutcome::empty();
        }

        match inner.client.put_batch(&batch).await {
            Ok(()) => {
                inner.total_sent.fetch_add(count as u64, Ordering::SeqCst);
                inner.log.info(&format!("Sent {} records.", count));
                FlushOutcome {
                    sent: count,
                    failure: None,
                }
            }
            Err(e) => {
                inner.log.warn(&format!("Transmission failed: {}", e));
                if inner.config.offline_cache_enabled {
                    inner.divert_to_spool(batch, Some(e))
                } else {
                    inner
                        .log
                        .warn(&format!("Offline storage disabled. {} records lost.", count));
                    FlushOutcome {
                        sent: 0,
                        failure: Some(FlushFailure::Transmit(e)),
                    }
                }
            }
        }
    }

    fn divert_to_spool(&self, batch: RecordBatch, transmit_error: Option<ClientError>) -> FlushOutcome {
        let count = batch.len();
        match self.spool.store(&batch) {
            Ok(Some(path)) => {
                self.log.info(&format!(
                    "Stored {} records in {}.",
                    count,
                    path.display()
                ));
                FlushOutcome {
                    sent: 0,
                    failure: transmit_error.map(FlushFailure::Transmit),
                }
            }
            Ok(None) => FlushOutcome::empty(),
            Err(e) => {
                self.log
                    .error(&format!("{} records lost: {}", count, e));
                FlushOutcome {
                    sent: 0,
                    failure: Some(FlushFailure::Spool(e)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{unreachable_host, StubServer};
    use tempfile::TempDir;

    /// Config pointing at `host`, with on-disk state in a temp dir and the
    /// autoflush timer disabled unless a test turns it back on.
    fn test_config(host: &str, data_dir: &TempDir) -> ShellConfig {
        let mut config = ShellConfig::new(host, "pat@example.org", "secret").unwrap();
        config.timeout = Duration::from_secs(2);
        config.autosend_interval_minutes = 0.0;
        config.data_dir = data_dir.path().to_path_buf();
        config
    }

    fn record(resource: &str) -> SensorRecord {
        SensorRecord::new("pat@example.org", "Eclipse", "DevEvent", resource)
    }

    fn kv(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_happy_path_add_and_send() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();

        shell
            .add_key_vals(&kv(&[
                ("timestamp", "2024-01-01T00:00:00.000Z"),
                ("tool", "Eclipse"),
                ("sensorDataType", "DevEvent"),
                ("DevEvent-Type", "Compile"),
            ]))
            .await
            .unwrap();

        assert_eq!(shell.send().await.unwrap(), 1);

        let bodies = server.put_bodies();
        assert_eq!(bodies.len(), 1);
        let batch = wire::from_xml(&bodies[0]).unwrap();
        assert_eq!(batch.len(), 1);
        let sent = &batch.records[0];
        assert_eq!(sent.tool, "Eclipse");
        assert_eq!(sent.sensor_data_type, "DevEvent");
        assert_eq!(sent.owner, "pat@example.org");
        assert_eq!(
            sent.properties,
            vec![("DevEvent-Type".to_string(), "Compile".to_string())]
        );
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_preserves_fifo_order() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();

        for i in 0..5 {
            shell.add(record(&format!("r{}.rs", i))).await.unwrap();
        }
        assert_eq!(shell.send().await.unwrap(), 5);

        let batch = wire::from_xml(&server.put_bodies()[0]).unwrap();
        let resources: Vec<&str> = batch.records.iter().map(|r| r.resource.as_str()).collect();
        assert_eq!(resources, vec!["r0.rs", "r1.rs", "r2.rs", "r3.rs", "r4.rs"]);
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_send_returns_zero_without_io() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();

        assert_eq!(shell.send().await.unwrap(), 0);
        assert!(server.put_bodies().is_empty());
        assert!(!shell.has_offline_data());
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_statechange_dedup() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();

        let foo = kv(&[("resource", "foo.java"), ("sensorDataType", "DevEvent")]);
        let bar = kv(&[("resource", "bar.java"), ("sensorDataType", "DevEvent")]);

        assert!(shell.statechange(100, &foo).await.unwrap());
        assert!(!shell.statechange(100, &foo).await.unwrap());
        assert!(shell.statechange(200, &foo).await.unwrap());
        assert!(shell.statechange(200, &bar).await.unwrap());
        assert_eq!(shell.buffered().await, 3);
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_statechange_missing_resource_counts_as_empty() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();

        // Initial memo is ("", 0): same pair again produces nothing.
        assert!(!shell
            .statechange(0, &kv(&[("sensorDataType", "DevEvent")]))
            .await
            .unwrap());
        assert!(shell
            .statechange(7, &kv(&[("sensorDataType", "DevEvent")]))
            .await
            .unwrap());
        assert_eq!(shell.buffered().await, 1);
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_buffer_forces_synchronous_flush() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let mut config = test_config(&server.host(), &data_dir);
        config.autosend_max_buffer = 3;
        let shell = SensorShell::start(config, "test").await.unwrap();

        shell.add(record("a.rs")).await.unwrap();
        shell.add(record("b.rs")).await.unwrap();
        assert!(server.put_bodies().is_empty());

        // The third add returns only after the server acknowledged.
        shell.add(record("c.rs")).await.unwrap();
        assert_eq!(server.acknowledged_records(), 3);
        assert_eq!(shell.buffered().await, 0);
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_buffer_zero_never_triggers() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let mut config = test_config(&server.host(), &data_dir);
        config.autosend_max_buffer = 0;
        let shell = SensorShell::start(config, "test").await.unwrap();

        for i in 0..10 {
            shell.add(record(&format!("r{}.rs", i))).await.unwrap();
        }
        assert!(server.put_bodies().is_empty());
        assert_eq!(shell.buffered().await, 10);
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_flush_spools_batch() {
        let host = unreachable_host().await;
        let data_dir = TempDir::new().unwrap();
        let shell = SensorShell::start(test_config(&host, &data_dir), "test")
            .await
            .unwrap();

        shell.add(record("r1.rs")).await.unwrap();
        shell.add(record("r2.rs")).await.unwrap();
        assert_eq!(shell.send().await.unwrap(), 0);
        assert!(shell.has_offline_data());

        let files: Vec<_> = std::fs::read_dir(data_dir.path().join("offline"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let batch = wire::from_xml(&std::fs::read_to_string(&files[0]).unwrap()).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].resource, "r1.rs");
        assert_eq!(batch.records[1].resource, "r2.rs");
    }

    #[tokio::test]
    async fn test_offline_flush_with_cache_disabled_drops_batch() {
        let host = unreachable_host().await;
        let data_dir = TempDir::new().unwrap();
        let mut config = test_config(&host, &data_dir);
        config.offline_cache_enabled = false;
        let shell = SensorShell::start(config, "test").await.unwrap();

        shell.add(record("r1.rs")).await.unwrap();
        assert_eq!(shell.send().await.unwrap(), 0);
        assert!(!shell.has_offline_data());
        assert!(std::fs::read_dir(data_dir.path().join("offline"))
            .unwrap()
            .next()
            .is_none());
    }

    #[tokio::test]
    async fn test_offline_then_recovery_round_trip() {
        let data_dir = TempDir::new().unwrap();

        // First shell: server down, two records end up in one spool file.
        let host = unreachable_host().await;
        let shell = SensorShell::start(test_config(&host, &data_dir), "test")
            .await
            .unwrap();
        shell.add(record("r1.rs")).await.unwrap();
        shell.add(record("r2.rs")).await.unwrap();
        assert_eq!(shell.send().await.unwrap(), 0);
        drop(shell);

        // Second shell: server up, recovery drains the spool.
        let server = StubServer::start().await;
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();

        assert!(std::fs::read_dir(data_dir.path().join("offline"))
            .unwrap()
            .next()
            .is_none());
        assert_eq!(server.acknowledged_records(), 2);
        let batch = wire::from_xml(&server.put_bodies()[0]).unwrap();
        assert_eq!(batch.records[0].resource, "r1.rs");
        assert_eq!(batch.records[1].resource, "r2.rs");

        // The helper logged under its own tool name and is gone.
        assert!(data_dir
            .path()
            .join("logs")
            .join("test-offline-recovery.log")
            .exists());
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_keeps_file_on_failed_put() {
        let data_dir = TempDir::new().unwrap();

        // Seed the spool directly: file A (2 records), then file B (3).
        let spool = SpoolStore::new(data_dir.path().join("offline")).unwrap();
        spool
            .store(&RecordBatch::new(vec![record("a1.rs"), record("a2.rs")]))
            .unwrap();
        spool
            .store(&RecordBatch::new(vec![
                record("b1.rs"),
                record("b2.rs"),
                record("b3.rs"),
            ]))
            .unwrap();
        drop(spool);

        let server = StubServer::start().await;
        server.script_put_status(201);
        server.script_put_status(500);
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();

        let remaining: Vec<_> = std::fs::read_dir(data_dir.path().join("offline"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(remaining.len(), 1);
        let kept = wire::from_xml(&std::fs::read_to_string(&remaining[0]).unwrap()).unwrap();
        assert_eq!(kept.len(), 3);
        assert_eq!(server.acknowledged_records(), 2);
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_skips_unparseable_file() {
        let data_dir = TempDir::new().unwrap();
        let offline = data_dir.path().join("offline");
        std::fs::create_dir_all(&offline).unwrap();
        std::fs::write(offline.join("2024.01.01.00.00.00.000.xml"), "not xml").unwrap();

        let server = StubServer::start().await;
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();

        assert!(offline.join("2024.01.01.00.00.00.000.xml").exists());
        assert_eq!(server.acknowledged_records(), 0);
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_disabled_leaves_spool_alone() {
        let data_dir = TempDir::new().unwrap();
        let spool = SpoolStore::new(data_dir.path().join("offline")).unwrap();
        spool
            .store(&RecordBatch::new(vec![record("a.rs")]))
            .unwrap();
        drop(spool);

        let server = StubServer::start().await;
        let mut config = test_config(&server.host(), &data_dir);
        config.offline_recovery_enabled = false;
        let shell = SensorShell::start(config, "test").await.unwrap();

        assert_eq!(server.acknowledged_records(), 0);
        assert_eq!(
            std::fs::read_dir(data_dir.path().join("offline"))
                .unwrap()
                .count(),
            1
        );
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_quit_drains_buffer_and_closes_shell() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();

        shell.add(record("r1.rs")).await.unwrap();
        shell.quit().await.unwrap();
        assert_eq!(server.acknowledged_records(), 1);

        assert!(matches!(
            shell.add(record("r2.rs")).await,
            Err(ShellError::Closed)
        ));
        assert!(matches!(shell.send().await, Err(ShellError::Closed)));
        assert!(matches!(shell.quit().await, Err(ShellError::Closed)));
    }

    #[tokio::test]
    async fn test_quit_reports_final_flush_failure_but_spools() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();

        shell.add(record("r1.rs")).await.unwrap();
        server.script_put_status(500);
        let result = shell.quit().await;
        assert!(matches!(
            result,
            Err(ShellError::FinalFlush(FlushFailure::Transmit(_)))
        ));

        // Teardown completed and the batch survived on disk.
        assert_eq!(
            std::fs::read_dir(data_dir.path().join("offline"))
                .unwrap()
                .count(),
            1
        );
        assert!(matches!(shell.send().await, Err(ShellError::Closed)));
    }

    #[tokio::test]
    async fn test_total_sent_tracks_acknowledgements() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();

        shell.add(record("a.rs")).await.unwrap();
        shell.add(record("b.rs")).await.unwrap();
        assert_eq!(shell.send().await.unwrap(), 2);

        // A failed PUT adds nothing to the counter.
        shell.add(record("c.rs")).await.unwrap();
        server.script_put_status(500);
        assert_eq!(shell.send().await.unwrap(), 0);
        assert_eq!(shell.total_sent(), 2);

        shell.add(record("d.rs")).await.unwrap();
        assert_eq!(shell.send().await.unwrap(), 1);
        assert_eq!(shell.total_sent(), 3);
        let _ = shell.quit().await;
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_record() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();

        let invalid = SensorRecord::new("", "Eclipse", "DevEvent", "a.rs");
        assert!(matches!(
            shell.add(invalid).await,
            Err(ShellError::Validation(ValidationError::MissingField("owner")))
        ));
        assert_eq!(shell.buffered().await, 0);
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_autoflush_timer_drains_buffer() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let mut config = test_config(&server.host(), &data_dir);
        config.autosend_interval_minutes = MIN_AUTOSEND_MINUTES; // 600 ms
        let shell = SensorShell::start(config, "test").await.unwrap();
        assert!(shell.autoflush_enabled());

        shell.add(record("r1.rs")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(server.acknowledged_records(), 1);
        assert_eq!(shell.buffered().await, 0);
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_autoflush_below_minimum_is_disabled() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let mut config = test_config(&server.host(), &data_dir);
        config.autosend_interval_minutes = 0.001;
        let shell = SensorShell::start(config, "test").await.unwrap();
        assert!(!shell.autoflush_enabled());
        shell.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_autosend_interval_replaces_timer() {
        let server = StubServer::start().await;
        let data_dir = TempDir::new().unwrap();
        let shell = SensorShell::start(test_config(&server.host(), &data_dir), "test")
            .await
            .unwrap();
        assert!(!shell.autoflush_enabled());

        shell.set_autosend_interval(1.0);
        assert!(shell.autoflush_enabled());
        shell.set_autosend_interval(0.0);
        assert!(!shell.autoflush_enabled());
        shell.quit().await.unwrap();
    }
}
