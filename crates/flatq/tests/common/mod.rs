//! Shared helpers for integration tests: isolated temp directories and
//! queue construction for both engines.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use flatq::{CoreFields, FileQueue, QueueEngine, SqliteQueue};

/// Isolated environment holding one temp directory per test.
pub struct QueueHarness {
    temp_dir: TempDir,
}

impl QueueHarness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes a delimited file into the temp directory.
    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content).expect("Failed to write test file");
        path
    }

    /// A file-backed SQLite queue inside the temp directory.
    pub fn sqlite_queue(&self, name: &str) -> SqliteQueue {
        SqliteQueue::open(&self.temp_dir.path().join(name)).expect("Failed to open sqlite queue")
    }

    /// A fresh flat-file queue inside the temp directory.
    pub fn file_queue(&self, name: &str) -> FileQueue {
        FileQueue::create(&self.temp_dir.path().join(name), None)
            .expect("Failed to create file queue")
    }
}

impl Default for QueueHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs a test subscriber once so engine logs surface under
/// `--nocapture`. Later calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Seeds `ids` as fresh queued records.
pub fn seed<Q: QueueEngine>(queue: &Q, ids: &[&str]) {
    for id in ids {
        queue
            .upsert(id, &CoreFields::default(), &BTreeMap::new(), false)
            .expect("Failed to seed record");
    }
}

/// Builds an extras map from pairs.
pub fn extras(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
