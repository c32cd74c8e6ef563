//! Flat-file store error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the flat-file store.
#[derive(Error, Debug)]
pub enum FileStoreError {
    /// IO error reading or writing the queue file.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The delimited data could not be parsed.
    #[error("Failed to parse delimited data in '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// A required queue column is missing from the file header.
    #[error("Queue file '{path}' is missing required column '{column}'")]
    MissingColumn { path: PathBuf, column: String },

    /// The atomic replace of the queue file failed; the original file is
    /// untouched.
    #[error("Failed to replace '{to}' with '{from}': {source}")]
    Replace {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The in-memory table lock was poisoned.
    #[error("Queue table lock poisoned")]
    LockPoisoned,
}
