//! flatq — a durable work queue over a flat table of jobs.
//!
//! Two interchangeable storage engines implement the same
//! [`QueueEngine`] contract: [`SqliteQueue`] (embedded SQLite, claims
//! expressed as guarded SQL updates) and [`FileQueue`] (a delimited file
//! that is both input and queue, persisted by whole-file atomic rewrite).
//! Both guarantee at most one claimant per job and sweep claims orphaned
//! by a crashed process back to `queued` on open.
//!
//! The [`Importer`] and [`Exporter`] move arbitrary delimited files in
//! and out of a queue through a declarative [`MappingProfile`] (header
//! aliases, defaults, per-field transforms, export projection), merging
//! externally supplied columns with queue-owned state without losing
//! unmapped data.

pub mod db;
pub mod engine;
pub mod error;
pub mod export;
pub mod flatfile;
pub mod import;
pub mod profile;
pub mod record;
pub mod text;

pub use db::{default_queue_path, delete_database_files, Database, DatabaseError, SqliteQueue};
pub use engine::{ExportRow, QueueEngine};
pub use error::{ExportError, ImportError, QueueError, Result};
pub use export::Exporter;
pub use flatfile::{FileQueue, FileStoreError};
pub use import::Importer;
pub use profile::{truthy_flag, MappingProfile, Transform};
pub use record::{CoreFields, JobRecord, JobStatus, Progress, CORE_COLUMNS};
