//! Fan-out over multiple single shells.
//!
//! A [`MultiShell`] owns N [`SensorShell`]s and routes consecutive runs of
//! records to one child before advancing round-robin. Each child flushes
//! on its own timer task, so while one child is blocked in an HTTP PUT the
//! others keep accepting records; that overlap is the whole point of the
//! fan-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::config::ShellConfig;
use crate::record::SensorRecord;
use crate::shell::{SensorShell, ShellError};
use crate::spool::SpoolStore;

/// Round-robin dispatcher state, guarded by one brief mutex.
#[derive(Debug, Default)]
struct Dispatch {
    /// Records routed to the current child so far.
    batch_counter: usize,

    /// Index of the child currently receiving records.
    index: usize,
}

/// N single shells behind the single-shell operation surface.
pub struct MultiShell {
    shells: Vec<SensorShell>,
    dispatch: Mutex<Dispatch>,
    batch_size: usize,
    user: String,

    /// Statechange dedup state, kept at the fan-out level so routing
    /// cannot split the memo across children.
    memo: Mutex<(String, i64)>,

    closed: AtomicBool,
}

impl MultiShell {
    /// Construct the child shells. They share one spool store; only the
    /// first child replays spooled data, so recovery runs exactly once.
    pub async fn start(config: ShellConfig, tool: &str) -> Result<Self, ShellError> {
        let mut config = config;
        // Children must pick up the multishell buffer/timer overrides even
        // when this constructor is called directly.
        config.multishell_enabled = true;

        let num_shells = config.multishell_num_shells.max(1);
        let batch_size = config.multishell_batch_size;
        let user = config.user.clone();
        let spool = Arc::new(SpoolStore::new(config.offline_dir()).map_err(ShellError::Spool)?);

        let mut shells = Vec::with_capacity(num_shells);
        for i in 0..num_shells {
            let child_tool = format!("{}-{}", tool, i);
            let shell =
                SensorShell::assemble(config.clone(), child_tool, spool.clone(), i == 0).await?;
            shells.push(shell);
        }

        Ok(Self {
            shells,
            dispatch: Mutex::new(Dispatch::default()),
            batch_size,
            user,
            memo: Mutex::new((String::new(), 0)),
            closed: AtomicBool::new(false),
        })
    }

    /// Route a record to one child shell.
    pub async fn add(&self, record: SensorRecord) -> Result<(), ShellError> {
        self.ensure_open()?;
        let index = self.next_index();
        self.shells[index].add(record).await
    }

    /// Build a record from ordered key/value pairs and route it.
    pub async fn add_key_vals(&self, pairs: &[(String, String)]) -> Result<(), ShellError> {
        self.ensure_open()?;
        let record = SensorRecord::from_key_vals(pairs, &self.user)?;
        self.add(record).await
    }

    /// Statechange dedup over the whole fan-out; see
    /// [`SensorShell::statechange`].
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
            let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
            let changed = memo.0 != resource || memo.1 != checksum;
            *memo = (resource, checksum);
            changed
        };
        if changed {
            self.add_key_vals(pairs).await?;
        }
        Ok(changed)
    }

    /// Flush every child; returns the summed acknowledged count.
    pub async fn send(&self) -> Result<usize, ShellError> {
        self.ensure_open()?;
        let mut total = 0;
        for shell in &self.shells {
            total += shell.send().await?;
        }
        Ok(total)
    }

    /// Delegates to the first child's probe.
    pub async fn ping(&self) -> bool {
        self.shells[0].ping().await
    }

    /// Quit every child. A failure in one child does not stop the others;
    /// collected failures come back as [`ShellError::Children`].
    pub async fn quit(&self) -> Result<(), ShellError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ShellError::Closed);
        }
        let mut failures = Vec::new();
        for shell in &self.shells {
            if let Err(e) = shell.quit().await {
                failures.push(e);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShellError::Children(failures))
        }
    }

    /// Replace the autoflush period on every child.
    pub fn set_autosend_interval(&self, minutes: f64) {
        for shell in &self.shells {
            shell.set_autosend_interval(minutes);
        }
    }

    /// Summed acknowledged count across children.
    pub fn total_sent(&self) -> u64 {
        self.shells.iter().map(|s| s.total_sent()).sum()
    }

    /// Whether any child has spooled a batch since construction.
    pub fn has_offline_data(&self) -> bool {
        self.shells.iter().any(|s| s.has_offline_data())
    }

    /// Number of child shells.
    pub fn num_shells(&self) -> usize {
        self.shells.len()
    }

    /// Records waiting across all child buffers.
    pub async fn buffered(&self) -> usize {
        let mut total = 0;
        for shell in &self.shells {
            total += shell.buffered().await;
        }
        total
    }

    #[cfg(test)]
    pub(crate) fn child(&self, index: usize) -> &SensorShell {
        &self.shells[index]
    }

    fn ensure_open(&self) -> Result<(), ShellError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ShellError::Closed)
        } else {
            Ok(())
        }
    }

    /// Pick the child for the next record: `batch_size` consecutive
    /// records per child, then advance. A zero batch size places each
    /// record uniformly at random (measurably worse; retained for
    /// comparison runs).
    fn next_index(&self) -> usize {
        if self.batch_size == 0 {
            return rand::thread_rng().gen_range(0..self.shells.len());
        }
        let mut dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
        if dispatch.batch_counter == self.batch_size {
            dispatch.batch_counter = 0;
            dispatch.index = (dispatch.index + 1) % self.shells.len();
        }
        dispatch.batch_counter += 1;
        dispatch.index
    }
}
