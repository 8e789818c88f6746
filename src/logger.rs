//! Per-tool shell session log.
//!
//! Every shell appends its banner, processed commands, flush outcomes, and
//! spool activity to `<logs>/<tool>.log`, one timestamped line per message.
//! The file rotates (to `<tool>.log.old`) when it grows past the size
//! limit. Messages are mirrored as `tracing` events so operators watching
//! a console see the same stream.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use tracing::warn;

use crate::config::LogLevel;

/// Rotate the session log once it grows past this many bytes.
const MAX_LOG_BYTES: u64 = 500_000;

/// Timestamp prefix on each log line.
const LINE_STAMP_FORMAT: &str = "%m/%d %H:%M:%S";

/// Append-only, size-rotated log for one shell.
#[derive(Debug)]
pub struct ShellLogger {
    tool: String,
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
    level: LogLevel,
    rotate_bytes: u64,
}

impl ShellLogger {
    /// Open the session log for `tool` under `dir`.
    ///
    /// A logger is always returned: if the directory or file cannot be
    /// opened the failure is reported once and the logger degrades to
    /// tracing-only.
    pub fn open(dir: &Path, tool: &str, level: LogLevel) -> Self {
        let path = dir.join(format!("{}.log", tool));
        let file = std::fs::create_dir_all(dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path))
            .map_err(|e| {
                warn!(path = %path.display(), error = %e, "Can't open shell session log");
                e
            })
            .ok();
        let opened = file.is_some();
        Self {
            tool: tool.to_string(),
            path: opened.then_some(path),
            file: Mutex::new(file),
            level,
            rotate_bytes: MAX_LOG_BYTES,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_rotate_bytes(mut self, rotate_bytes: u64) -> Self {
        self.rotate_bytes = rotate_bytes;
        self
    }

    /// The log file path, if the file could be opened.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(tool = %self.tool, "{}", message);
        self.write_line(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(tool = %self.tool, "{}", message);
        self.write_line(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(tool = %self.tool, "{}", message);
        self.write_line(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(tool = %self.tool, "{}", message);
        self.write_line(LogLevel::Error, message);
    }

    /// Flush and release the file handle. Further messages go to tracing
    /// only.
    pub fn close(&self) {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut file) = guard.take() {
            let _ = file.flush();
        }
    }

    fn write_line(&self, level: LogLevel, message: &str) {
        if !self.level.enabled(level) {
            return;
        }
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let Some(file) = guard.as_mut() else {
            return;
        };

        let line = format!("{} {}\n", Local::now().format(LINE_STAMP_FORMAT), message);
        if file.write_all(line.as_bytes()).is_err() {
            return;
        }

        if let Ok(metadata) = file.metadata() {
            if metadata.len() > self.rotate_bytes {
                *guard = self.rotate();
            }
        }
    }

    /// Move the current file aside and start a fresh one.
    fn rotate(&self) -> Option<File> {
        let path = self.path.as_ref()?;
        let old = path.with_extension("log.old");
        if let Err(e) = std::fs::rename(path, &old) {
            warn!(path = %path.display(), error = %e, "Session log rotation failed");
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    }
}
