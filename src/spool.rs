//! Durable on-disk queue of serialized batches.
//!
//! One file per batch, named by a local-time stamp so that lexicographic
//! order equals creation order. Files are written once and never mutated;
//! the recovery path reads and deletes them only after the server has
//! acknowledged every record they hold. The directory is private to one
//! process.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use tracing::{debug, warn};

use crate::record::RecordBatch;
use crate::wire;

/// Filename stamp, millisecond precision, local time.
const FILE_STAMP_FORMAT: &str = "%Y.%m.%d.%H.%M.%S%.3f";

/// An I/O failure in the spool directory.
#[derive(Debug)]
pub struct SpoolError {
    pub op: &'static str,
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl SpoolError {
    fn new(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self {
            op,
            path: path.into(),
            source,
        }
    }
}

impl std::fmt::Display for SpoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Spool {} failed for {}: {}",
            self.op,
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for SpoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Durable FIFO of batches under one directory.
#[derive(Debug)]
pub struct SpoolStore {
    dir: PathBuf,

    /// Set once a batch has been stored by this instance.
    has_offline_data: AtomicBool,

    /// Last filename stamp issued, for same-millisecond tie-breaking.
    last_stamp: Mutex<(String, u32)>,
}

impl SpoolStore {
    /// Open (creating if necessary) the spool directory.
    pub fn new(dir: PathBuf) -> Result<Self, SpoolError> {
        fs::create_dir_all(&dir).map_err(|e| SpoolError::new("create", &dir, e))?;
        Ok(Self {
            dir,
            has_offline_data: AtomicBool::new(false),
            last_stamp: Mutex::new((String::new(), 0)),
        })
    }

    /// The directory this store owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a non-empty batch to a new spool file.
    ///
    /// Returns the path of the written file, or `None` for an empty batch
    /// (nothing is written). The file is never touched again by this store
    /// except through [`delete`](Self::delete).
    pub fn store(&self, batch: &RecordBatch) -> Result<Option<PathBuf>, SpoolError> {
        if batch.is_empty() {
            return Ok(None);
        }
        let path = self.dir.join(self.next_file_name(Local::now()));
        let document = wire::to_xml(batch);
        fs::write(&path, document).map_err(|e| SpoolError::new("write", &path, e))?;
        self.has_offline_data.store(true, Ordering::SeqCst);
        debug!(path = %path.display(), records = batch.len(), "Stored batch offline");
        Ok(Some(path))
    }

    /// Enumerate spool files in creation (= lexicographic) order.
    pub fn list(&self) -> Result<Vec<PathBuf>, SpoolError> {
        let entries =
            fs::read_dir(&self.dir).map_err(|e| SpoolError::new("list", &self.dir, e))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|ext| ext == "xml").unwrap_or(false))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Remove one spool file.
    pub fn delete(&self, path: &Path) -> Result<(), SpoolError> {
        fs::remove_file(path).map_err(|e| SpoolError::new("delete", path, e))
    }

    /// Whether this store has persisted any batch since construction.
    pub fn has_offline_data(&self) -> bool {
        self.has_offline_data.load(Ordering::SeqCst)
    }

    /// Next filename: the millisecond stamp, with a zero-padded counter
    /// appended on a same-millisecond collision. Digits sort after the
    /// `.xml` dot, so suffixed names stay after their base and in issue
    /// order.
    fn next_file_name(&self, now: DateTime<Local>) -> String {
        let stamp = now.format(FILE_STAMP_FORMAT).to_string();
        let mut last = self.last_stamp.lock().unwrap_or_else(|e| e.into_inner());
        if last.0 == stamp {
            last.1 += 1;
            if last.1 > 999 {
                warn!(stamp = %stamp, "More than 1000 spool files in one millisecond");
            }
            format!("{}{:03}.xml", stamp, last.1)
        } else {
            *last = (stamp.clone(), 0);
            format!("{}.xml", stamp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SensorRecord;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn batch(resources: &[&str]) -> RecordBatch {
        RecordBatch::new(
            resources
                .iter()
                .map(|r| SensorRecord::new("pat@example.org", "Eclipse", "DevEvent", *r))
                .collect(),
        )
    }

    #[test]
    fn test_store_and_list_round_trip() {
        let dir = tempdir().unwrap();
        let store = SpoolStore::new(dir.path().to_path_buf()).unwrap();
        assert!(!store.has_offline_data());

        let path = store.store(&batch(&["a.rs", "b.rs"])).unwrap().unwrap();
        assert!(store.has_offline_data());

        let files = store.list().unwrap();
        assert_eq!(files, vec![path.clone()]);

        let parsed = wire::from_xml(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.records[0].resource, "a.rs");
        assert_eq!(parsed.records[1].resource, "b.rs");
    }

    #[test]
    fn test_empty_batch_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = SpoolStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.store(&RecordBatch::default()).unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
        assert!(!store.has_offline_data());
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let store = SpoolStore::new(dir.path().to_path_buf()).unwrap();
        let path = store.store(&batch(&["a.rs"])).unwrap().unwrap();
        store.delete(&path).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_ignores_foreign_files() {
        let dir = tempdir().unwrap();
        let store = SpoolStore::new(dir.path().to_path_buf()).unwrap();
        fs::write(dir.path().join("notes.txt"), "not a batch").unwrap();
        store.store(&batch(&["a.rs"])).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_filenames_sort_in_creation_order() {
        let dir = tempdir().unwrap();
        let store = SpoolStore::new(dir.path().to_path_buf()).unwrap();
        let mut written = Vec::new();
        for i in 0..20 {
            let path = store
                .store(&batch(&[format!("r{}.rs", i).as_str()]))
                .unwrap()
                .unwrap();
            written.push(path);
        }
        let mut sorted = written.clone();
        sorted.sort();
        assert_eq!(sorted, written);
        assert_eq!(store.list().unwrap(), written);
    }

    #[test]
    fn test_same_millisecond_names_are_distinct_and_ordered() {
        let dir = tempdir().unwrap();
        let store = SpoolStore::new(dir.path().to_path_buf()).unwrap();
        let instant = Local.with_ymd_and_hms(2024, 3, 5, 10, 20, 30).unwrap()
            + chrono::Duration::milliseconds(427);

        let first = store.next_file_name(instant);
        let second = store.next_file_name(instant);
        let third = store.next_file_name(instant);
        assert_eq!(first, "2024.03.05.10.20.30.427.xml");
        assert_eq!(second, "2024.03.05.10.20.30.427001.xml");
        assert_eq!(third, "2024.03.05.10.20.30.427002.xml");
        assert!(first < second && second < third);

        // A later millisecond still sorts after every suffixed name.
        let later = store.next_file_name(instant + chrono::Duration::milliseconds(1));
        assert_eq!(later, "2024.03.05.10.20.30.428.xml");
        assert!(third < later);
    }
}
