use std::path::PathBuf;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::flatfile::FileStoreError;

/// Errors from queue engine operations, shared by both engines.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("File store error: {0}")]
    File(#[from] FileStoreError),

    /// A state transition was requested for an id the queue does not hold.
    #[error("Unknown job id '{0}'")]
    UnknownId(String),
}

/// Errors from the import pipeline. Configuration errors (unreadable file,
/// unresolvable id column) surface here before any storage mutation;
/// row-level data problems never do — bad rows are skipped and counted out.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Failed to read import file '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Import file '{path}' has no column matching an 'id' alias")]
    MissingIdColumn { path: PathBuf },

    #[error("Failed to parse delimited data in '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Queue error during import: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from the export pipeline.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write export file '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Failed to write export file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue error during export: {0}")]
    Queue(#[from] QueueError),
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
