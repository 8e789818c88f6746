//! Configuration for the sensor relay.
//!
//! Settings come from the flat `key=value` properties file at
//! `~/.hackystat/sensorshell/sensorshell.properties` (or any explicit path),
//! or are built programmatically with [`ShellConfig::new`]. Three keys are
//! required: `host`, `user`, and `password`. Every other key has a default;
//! an invalid optional value is logged and replaced with its default rather
//! than failing construction.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Relative path of the relay data directory under the user's home.
const DATA_DIR: &str = ".hackystat/sensorshell";

/// Default HTTP call deadline in seconds (excluding ping).
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Minimum accepted HTTP timeout in seconds.
const MIN_TIMEOUT_SECS: u64 = 1;

/// Default minutes between automatic flushes.
const DEFAULT_AUTOSEND_MINUTES: f64 = 1.0;

/// Default buffer size that triggers a synchronous flush. Zero disables
/// the size trigger.
const DEFAULT_AUTOSEND_MAX_BUFFER: usize = 250;

/// Default advisory seconds between statechange wakeups.
const DEFAULT_STATECHANGE_SECS: u64 = 30;

/// Default child shell count when multishell is enabled.
const DEFAULT_MULTISHELL_NUM_SHELLS: usize = 10;

/// Default consecutive records routed to one child.
const DEFAULT_MULTISHELL_BATCH_SIZE: usize = 499;

/// Default per-child buffer trigger when multishell is enabled. Kept above
/// the batch size so the timer wins over the size trigger.
const DEFAULT_MULTISHELL_MAX_BUFFER: usize = 500;

/// Default per-child flush period in minutes when multishell is enabled.
const DEFAULT_MULTISHELL_AUTOSEND_MINUTES: f64 = 0.05;

/// Verbosity of the per-tool shell session log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Whether a message at `level` should be written under this setting.
    pub fn enabled(self, level: LogLevel) -> bool {
        level != LogLevel::Off && level <= self
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" | "severe" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "fine" => Ok(LogLevel::Debug),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Off => write!(f, "off"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
        }
    }
}

/// Error type for configuration loading failures.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub key: Option<String>,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: None,
        }
    }

    fn for_key(key: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key {
            Some(key) => write!(f, "Configuration error for {}: {}", key, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Validated, immutable relay settings.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Ingestion server URL, always with a trailing `/`.
    pub host: String,

    /// User account at the ingestion server.
    pub user: String,

    /// Password for the user account.
    pub password: String,

    /// HTTP call deadline (excluding ping, which has its own bound).
    pub timeout: Duration,

    /// Minutes between automatic flushes in single-shell mode.
    pub autosend_interval_minutes: f64,

    /// Buffer size triggering a synchronous flush in single-shell mode.
    /// Zero means the size trigger is disabled.
    pub autosend_max_buffer: usize,

    /// Spool batches to disk when transmission fails.
    pub offline_cache_enabled: bool,

    /// Replay the spool at shell construction.
    pub offline_recovery_enabled: bool,

    /// Advisory period for statechange-driven callers; not enforced.
    pub statechange_interval: Duration,

    /// Fan out over multiple child shells.
    pub multishell_enabled: bool,

    /// Child shell count when multishell is enabled.
    pub multishell_num_shells: usize,

    /// Consecutive records routed to one child before advancing.
    pub multishell_batch_size: usize,

    /// Per-child buffer trigger when multishell is enabled.
    pub multishell_max_buffer: usize,

    /// Per-child flush period in minutes when multishell is enabled.
    pub multishell_autosend_interval_minutes: f64,

    /// Verbosity of the shell session log.
    pub logging_level: LogLevel,

    /// Root of the relay's on-disk state (spool, logs). Defaults to
    /// `~/.hackystat/sensorshell`; overridable so tests can use temp dirs.
    pub data_dir: PathBuf,
}

impl ShellConfig {
    /// Build a configuration with the three required settings and defaults
    /// for everything else.
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let host = normalize_host(host.into())?;
        let user = user.into();
        let password = password.into();
        if user.is_empty() {
            return Err(ConfigError::for_key("user", "required key is missing"));
        }
        if password.is_empty() {
            return Err(ConfigError::for_key("password", "required key is missing"));
        }
        Ok(Self {
            host,
            user,
            password,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            autosend_interval_minutes: DEFAULT_AUTOSEND_MINUTES,
            autosend_max_buffer: DEFAULT_AUTOSEND_MAX_BUFFER,
            offline_cache_enabled: true,
            offline_recovery_enabled: true,
            statechange_interval: Duration::from_secs(DEFAULT_STATECHANGE_SECS),
            multishell_enabled: false,
            multishell_num_shells: DEFAULT_MULTISHELL_NUM_SHELLS,
            multishell_batch_size: DEFAULT_MULTISHELL_BATCH_SIZE,
            multishell_max_buffer: DEFAULT_MULTISHELL_MAX_BUFFER,
            multishell_autosend_interval_minutes: DEFAULT_MULTISHELL_AUTOSEND_MINUTES,
            logging_level: LogLevel::Info,
            data_dir: default_data_dir(),
        })
    }

    /// Load configuration from a flat `key=value` properties file.
    ///
    /// Lines starting with `#` and blank lines are ignored.
    pub fn from_properties_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::new(format!("can't read {}: {}", path.display(), e)))?;
        Self::from_properties(&parse_properties(&text))
    }

    /// Build a configuration from already-parsed properties.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let host = props
            .get("host")
            .ok_or_else(|| ConfigError::for_key("host", "required key is missing"))?;
        let user = props
            .get("user")
            .ok_or_else(|| ConfigError::for_key("user", "required key is missing"))?;
        let password = props
            .get("password")
            .ok_or_else(|| ConfigError::for_key("password", "required key is missing"))?;

        let mut config = Self::new(host.clone(), user.clone(), password.clone())?;

        if let Some(secs) = parse_optional(props, "timeout", |v| {
            v.parse::<u64>().ok().filter(|s| *s >= MIN_TIMEOUT_SECS)
        }) {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(minutes) = parse_optional(props, "autosend.timeinterval", |v| {
            v.parse::<f64>().ok().filter(|m| *m >= 0.0)
        }) {
            config.autosend_interval_minutes = minutes;
        }
        if let Some(count) =
            parse_optional(props, "autosend.maxbuffer", |v| v.parse::<usize>().ok())
        {
            config.autosend_max_buffer = count;
        }
        if let Some(enabled) = parse_optional(props, "offline.cache.enabled", parse_bool) {
            config.offline_cache_enabled = enabled;
        }
        if let Some(enabled) = parse_optional(props, "offline.recovery.enabled", parse_bool) {
            config.offline_recovery_enabled = enabled;
        }
        if let Some(secs) = parse_optional(props, "statechange.interval", |v| {
            v.parse::<u64>().ok().filter(|s| *s >= 1)
        }) {
            config.statechange_interval = Duration::from_secs(secs);
        }
        if let Some(enabled) = parse_optional(props, "multishell.enabled", parse_bool) {
            config.multishell_enabled = enabled;
        }
        if let Some(count) = parse_optional(props, "multishell.numshells", |v| {
            v.parse::<usize>().ok().filter(|n| *n >= 1)
        }) {
            config.multishell_num_shells = count;
        }
        if let Some(count) =
            parse_optional(props, "multishell.batchsize", |v| v.parse::<usize>().ok())
        {
            config.multishell_batch_size = count;
        }
        if let Some(count) = parse_optional(props, "multishell.maxbuffer", |v| {
            v.parse::<usize>().ok().filter(|n| *n >= 1)
        }) {
            config.multishell_max_buffer = count;
        }
        if let Some(minutes) = parse_optional(props, "multishell.autosend.timeinterval", |v| {
            v.parse::<f64>().ok().filter(|m| *m >= 0.0)
        }) {
            config.multishell_autosend_interval_minutes = minutes;
        }
        if let Some(level) = parse_optional(props, "logging.level", |v| v.parse::<LogLevel>().ok())
        {
            config.logging_level = level;
        }

        Ok(config)
    }

    /// The flush period effective for a single shell, honoring the
    /// multishell override.
    pub fn effective_autosend_minutes(&self) -> f64 {
        if self.multishell_enabled {
            self.multishell_autosend_interval_minutes
        } else {
            self.autosend_interval_minutes
        }
    }

    /// The buffer trigger effective for a single shell, honoring the
    /// multishell override.
    pub fn effective_max_buffer(&self) -> usize {
        if self.multishell_enabled {
            self.multishell_max_buffer
        } else {
            self.autosend_max_buffer
        }
    }

    /// Directory holding spooled batches.
    pub fn offline_dir(&self) -> PathBuf {
        self.data_dir.join("offline")
    }

    /// Directory holding per-tool session logs.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// The conventional location of the properties file.
    pub fn default_properties_path() -> PathBuf {
        default_data_dir().join("sensorshell.properties")
    }
}

/// Parse flat `key=value` properties text.
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(eq) = line.find('=') {
            let key = line[..eq].trim().to_string();
            let value = line[eq + 1..].trim().to_string();
            if !key.is_empty() {
                props.insert(key, value);
            }
        }
    }
    props
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR)
}

fn normalize_host(host: String) -> Result<String, ConfigError> {
    if host.is_empty() {
        return Err(ConfigError::for_key("host", "required key is missing"));
    }
    if host.ends_with('/') {
        Ok(host)
    } else {
        Ok(format!("{}/", host))
    }
}

/// Parse one optional key, logging and falling back to the default (by
/// returning `None`) when the value is invalid.
fn parse_optional<T>(
    props: &HashMap<String, String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let value = props.get(key)?;
    match parse(value) {
        Some(parsed) => Some(parsed),
        None => {
            warn!(key, value = %value, "Invalid configuration value, using default");
            None
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
