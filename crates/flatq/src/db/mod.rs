//! Transactional storage for the queue.
//!
//! Uses rusqlite (SQLite) with a thread-safe `Database` handle. All access
//! is serialized through a `Mutex<Connection>`. The durability pragmas
//! favor single-writer throughput: WAL journaling (readers stay concurrent
//! during a write), `synchronous=NORMAL`, in-memory temp storage. Exactly
//! one process is expected to hold the write lock at a time; a crash
//! between WAL write and checkpoint is recovered by SQLite itself.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

pub mod error;
pub mod migrations;
pub mod queue;

pub use error::DatabaseError;
pub use queue::SqliteQueue;

/// Thread-safe database handle wrapping a single rusqlite connection.
///
/// Cloning is cheap (inner `Arc`). All access is serialized through a
/// `Mutex`, which is fine for SQLite (which serializes writes anyway).
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database at the given path, applies the
    /// single-writer pragmas, and runs all pending migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;",
        )?;

        migrations::run_all(&conn)?;

        log::info!("Queue database opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database for testing. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }

    /// Rebuilds the database file to reclaim free pages.
    ///
    /// Maintenance call: must not run concurrently with an open transaction
    /// or an in-flight batch on the same handle.
    pub fn vacuum(&self) -> Result<(), DatabaseError> {
        self.with_conn(|conn| {
            conn.execute_batch("VACUUM;")?;
            Ok(())
        })
    }

    /// Refreshes the query planner statistics.
    ///
    /// Same concurrency caveat as [`Database::vacuum`].
    pub fn analyze(&self) -> Result<(), DatabaseError> {
        self.with_conn(|conn| {
            conn.execute_batch("ANALYZE;")?;
            Ok(())
        })
    }

    /// Drops the jobs table and recreates it empty.
    ///
    /// Destroys all queue state. Same concurrency caveat as
    /// [`Database::vacuum`].
    pub fn drop_jobs(&self) -> Result<(), DatabaseError> {
        self.with_conn(|conn| {
            conn.execute_batch("DROP TABLE IF EXISTS jobs;")?;
            conn.execute_batch(migrations::JOBS_SCHEMA)?;
            Ok(())
        })
    }
}

/// Removes a queue database file together with its `-wal` and `-shm` side
/// files. Every handle on the database must be dropped first; calling this
/// while a connection is open is undefined from SQLite's point of view.
pub fn delete_database_files(path: &Path) -> Result<(), DatabaseError> {
    let mut targets = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        targets.push(PathBuf::from(side));
    }

    for target in targets {
        match std::fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(DatabaseError::Io {
                    path: target,
                    source: e,
                });
            }
        }
    }
    Ok(())
}

/// Returns the canonical queue database path: `~/.flatq/data/queue.db`.
pub fn default_queue_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".flatq").join("data").join("queue.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let count: u32 =
                conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))?;
            assert!(count > 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_open_file_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            let count: u32 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_database_is_clone() {
        let db = Database::open_in_memory().unwrap();
        let db2 = db.clone();
        db.with_conn(|conn| {
            conn.execute("INSERT INTO jobs (id) VALUES ('c1')", [])?;
            Ok(())
        })
        .unwrap();
        db2.with_conn(|conn| {
            let count: u32 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
            assert_eq!(count, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_drop_jobs_recreates_empty_table() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute("INSERT INTO jobs (id) VALUES ('d1')", [])?;
            Ok(())
        })
        .unwrap();

        db.drop_jobs().unwrap();

        db.with_conn(|conn| {
            let count: u32 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_vacuum_and_analyze() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("queue.db")).unwrap();
        db.vacuum().unwrap();
        db.analyze().unwrap();
    }

    #[test]
    fn test_delete_database_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let _db = Database::open(&path).unwrap();
        }
        assert!(path.exists());

        delete_database_files(&path).unwrap();
        assert!(!path.exists());

        // Deleting again is fine — missing files are not an error.
        delete_database_files(&path).unwrap();
    }

    #[test]
    fn test_default_queue_path() {
        let path = default_queue_path();
        assert!(path.is_some());
        let path = path.unwrap();
        assert!(path.ends_with("queue.db"));
        assert!(path.to_string_lossy().contains(".flatq"));
    }
}
