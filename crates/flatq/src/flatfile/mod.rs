//! The flat-file queue engine.
//!
//! The delimited file itself is the durable store: every record is one
//! row, loaded into an in-memory ordered table with an id index. Every
//! mutation rewrites the whole file through a temp-and-rename replace
//! (one rewrite per batch when batched), so the on-disk state is always
//! either the previous file or the new one. Claims that were in flight
//! when a previous process died are swept back to `queued` on load, and
//! that recovery is itself persisted before any new claim happens.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

pub(crate) mod codec;
pub mod error;

pub use error::FileStoreError;

use crate::engine::{ExportRow, QueueEngine};
use crate::error::QueueError;
use crate::record::{
    extras_from_json, extras_to_json, now_timestamp, parse_flag, parse_result, CoreFields,
    JobRecord, JobStatus, Progress, CORE_COLUMNS, EXTRAS_COLUMN,
};
use crate::text::norm_key;

/// In-memory table: ordered records (stable insertion order is part of the
/// claim contract), an id→position index, the additive set of known extras
/// keys, and the batch nesting depth.
struct FileState {
    rows: Vec<JobRecord>,
    index: HashMap<String, usize>,
    extra_keys: Vec<String>,
    batch_depth: u32,
}

impl FileState {
    fn empty() -> Self {
        Self {
            rows: Vec::new(),
            index: HashMap::new(),
            extra_keys: Vec::new(),
            batch_depth: 0,
        }
    }

    fn register_extra_keys<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>) {
        for key in keys {
            if !self.extra_keys.iter().any(|k| k == key) {
                self.extra_keys.push(key.clone());
            }
        }
    }

    fn push_record(&mut self, rec: JobRecord) {
        self.register_extra_keys(rec.extras.keys());
        self.index.insert(rec.id.clone(), self.rows.len());
        self.rows.push(rec);
    }
}

/// Queue engine backed by a single delimited file.
///
/// Unknown-id policy: `mark_success` and `mark_failure` return
/// [`QueueError::UnknownId`]; `update_by_id` instead *creates* the record —
/// the file's schema is additive, and a row that is worth updating is worth
/// tracking.
pub struct FileQueue {
    path: PathBuf,
    delimiter: u8,
    state: Mutex<FileState>,
}

impl FileQueue {
    /// Loads the queue file at `path` if it exists, otherwise creates a
    /// fresh empty one. `delimiter` defaults to `;` when `None`.
    pub fn open(path: &Path, delimiter: Option<u8>) -> Result<Self, FileStoreError> {
        if path.exists() {
            Self::load(path, delimiter)
        } else {
            Self::create(path, delimiter)
        }
    }

    /// Creates a fresh, empty queue file (header only), truncating any
    /// existing file at `path`.
    pub fn create(path: &Path, delimiter: Option<u8>) -> Result<Self, FileStoreError> {
        let queue = Self {
            path: path.to_path_buf(),
            delimiter: delimiter.unwrap_or(codec::DEFAULT_DELIMITER),
            state: Mutex::new(FileState::empty()),
        };
        queue.persist(&*queue.state()?)?;
        log::info!("Created queue file at {}", path.display());
        Ok(queue)
    }

    /// Loads an existing queue file, sweeping any record left claimed by a
    /// dead worker back to `queued`. If the sweep changed anything, the
    /// file is rewritten immediately so the recovery is durable before the
    /// first claim.
    pub fn load(path: &Path, delimiter: Option<u8>) -> Result<Self, FileStoreError> {
        let delimiter = delimiter.unwrap_or(codec::DEFAULT_DELIMITER);
        let (header, rows) = codec::read_table(path, delimiter)?;

        let columns = classify_columns(&header);
        for required in CORE_COLUMNS {
            if !columns
                .iter()
                .any(|c| matches!(c, Column::Core(name) if *name == required))
            {
                return Err(FileStoreError::MissingColumn {
                    path: path.to_path_buf(),
                    column: required.to_string(),
                });
            }
        }

        let mut state = FileState::empty();
        // Header-declared passthrough columns are known keys from the
        // start, even when every cell is empty.
        for col in &columns {
            if let Column::Passthrough(name) = col {
                state.register_extra_keys(std::iter::once(name));
            }
        }

        for cells in &rows {
            match record_from_cells(&columns, cells) {
                Some(rec) if state.index.contains_key(&rec.id) => {
                    log::debug!("Dropping duplicate row for id '{}'", rec.id);
                }
                Some(rec) => state.push_record(rec),
                None => log::debug!("Dropping row without id in {}", path.display()),
            }
        }

        let now = now_timestamp();
        let mut recovered = 0u64;
        for rec in &mut state.rows {
            if rec.recover(&now) {
                recovered += 1;
            }
        }

        let queue = Self {
            path: path.to_path_buf(),
            delimiter,
            state: Mutex::new(state),
        };

        if recovered > 0 {
            log::info!(
                "Recovered {} stale in-progress jobs in {}",
                recovered,
                path.display()
            );
            queue.persist(&*queue.state()?)?;
        }

        Ok(queue)
    }

    /// The queue file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The effective column set: the fixed core columns followed by every
    /// extras key seen so far, in first-seen order. Grows additively over
    /// the instance's lifetime.
    pub fn columns(&self) -> Result<Vec<String>, FileStoreError> {
        let state = self.state()?;
        let mut cols: Vec<String> = CORE_COLUMNS.iter().map(|c| c.to_string()).collect();
        cols.extend(state.extra_keys.iter().cloned());
        Ok(cols)
    }

    /// Sweeps records that have sat `in_progress` for longer than
    /// `max_age` (judged by `updated_at`; an unparseable or missing
    /// timestamp counts as stale) back to `queued`. Returns the number of
    /// records swept.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<u64, FileStoreError> {
        let cutoff = Utc::now() - max_age;
        let now = now_timestamp();

        let mut state = self.state()?;
        let mut swept = 0u64;
        for rec in &mut state.rows {
            if !rec.in_progress {
                continue;
            }
            let stale = match rec.updated_at.as_deref() {
                Some(ts) => match DateTime::parse_from_rfc3339(ts) {
                    Ok(dt) => dt.with_timezone(&Utc) < cutoff,
                    Err(_) => true,
                },
                None => true,
            };
            if stale && rec.recover(&now) {
                swept += 1;
            }
        }

        if swept > 0 {
            self.flush_if_unbatched(&state)?;
        }
        Ok(swept)
    }

    /// Fetches one record by id.
    pub fn find_by_id(&self, id: &str) -> Result<Option<JobRecord>, FileStoreError> {
        let state = self.state()?;
        Ok(state.index.get(id).map(|&i| state.rows[i].clone()))
    }

    fn state(&self) -> Result<MutexGuard<'_, FileState>, FileStoreError> {
        self.state.lock().map_err(|_| FileStoreError::LockPoisoned)
    }

    /// Rewrites the whole queue file from the in-memory table.
    fn persist(&self, state: &FileState) -> Result<(), FileStoreError> {
        let mut header: Vec<String> = CORE_COLUMNS.iter().map(|c| c.to_string()).collect();
        header.push(EXTRAS_COLUMN.to_string());

        let rows: Vec<Vec<String>> = state.rows.iter().map(record_to_cells).collect();
        codec::write_table(&self.path, self.delimiter, &header, rows)
    }

    fn flush_if_unbatched(&self, state: &FileState) -> Result<(), FileStoreError> {
        if state.batch_depth == 0 {
            self.persist(state)?;
        }
        Ok(())
    }
}

/// Decrements the batch depth when a `perform_batch` frame exits, even on
/// panic, so a failed batch can never wedge the queue in "batched" mode.
struct BatchGuard<'a> {
    queue: &'a FileQueue,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.queue.state.lock() {
            state.batch_depth = state.batch_depth.saturating_sub(1);
        }
    }
}

enum Column {
    Core(&'static str),
    Extras,
    Passthrough(String),
}

fn classify_columns(header: &[String]) -> Vec<Column> {
    header
        .iter()
        .map(|cell| {
            let key = norm_key(cell);
            if key == EXTRAS_COLUMN {
                Column::Extras
            } else if let Some(core) = CORE_COLUMNS.iter().find(|c| **c == key) {
                Column::Core(core)
            } else {
                Column::Passthrough(cell.clone())
            }
        })
        .collect()
}

/// Builds a record from one data row. Returns `None` for rows without an
/// id — those are data errors, not load failures.
fn record_from_cells(columns: &[Column], cells: &[String]) -> Option<JobRecord> {
    let cell = |i: usize| cells.get(i).map(String::as_str).unwrap_or("");

    let mut rec = JobRecord::new("");
    let mut passthrough: BTreeMap<String, String> = BTreeMap::new();

    for (i, col) in columns.iter().enumerate() {
        let value = cell(i);
        match col {
            Column::Core("id") => rec.id = value.to_string(),
            Column::Core("processed") => rec.processed = parse_flag(value),
            Column::Core("in_progress") => rec.in_progress = parse_flag(value),
            Column::Core("status") => rec.status = JobStatus::parse(value),
            Column::Core("result") => rec.result = parse_result(value),
            Column::Core("updated_at") => {
                rec.updated_at = (!value.is_empty()).then(|| value.to_string());
            }
            Column::Core("last_error") => {
                rec.last_error = (!value.is_empty()).then(|| value.to_string());
            }
            Column::Core(_) => {}
            Column::Extras => rec.extras = extras_from_json(&rec.id, value),
            Column::Passthrough(name) => {
                if !value.trim().is_empty() {
                    passthrough.insert(name.clone(), value.to_string());
                }
            }
        }
    }

    if rec.id.is_empty() {
        return None;
    }
    rec.merge_extras(&passthrough);
    Some(rec)
}

fn record_to_cells(rec: &JobRecord) -> Vec<String> {
    vec![
        rec.id.clone(),
        if rec.processed { "1" } else { "0" }.to_string(),
        if rec.in_progress { "1" } else { "0" }.to_string(),
        rec.status.as_str().to_string(),
        rec.result.map(|r| r.to_string()).unwrap_or_default(),
        rec.updated_at.clone().unwrap_or_default(),
        rec.last_error.clone().unwrap_or_default(),
        if rec.extras.is_empty() {
            String::new()
        } else {
            extras_to_json(&rec.extras)
        },
    ]
}

impl QueueEngine for FileQueue {
    fn fetch_next(&self) -> Result<Option<JobRecord>, QueueError> {
        let mut state = self.state()?;
        let Some(idx) = state.rows.iter().position(JobRecord::is_eligible) else {
            return Ok(None);
        };

        let now = now_timestamp();
        state.rows[idx].begin_work(&now);
        let rec = state.rows[idx].clone();
        self.flush_if_unbatched(&state)?;
        Ok(Some(rec))
    }

    fn mark_success(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state()?;
        let Some(&idx) = state.index.get(id) else {
            return Err(QueueError::UnknownId(id.to_string()));
        };
        state.rows[idx].finish_ok(&now_timestamp());
        self.flush_if_unbatched(&state)?;
        Ok(())
    }

    fn mark_failure(&self, id: &str, message: &str) -> Result<(), QueueError> {
        let mut state = self.state()?;
        let Some(&idx) = state.index.get(id) else {
            return Err(QueueError::UnknownId(id.to_string()));
        };
        state.rows[idx].finish_err(message, &now_timestamp());
        self.flush_if_unbatched(&state)?;
        Ok(())
    }

    fn upsert(
        &self,
        id: &str,
        core: &CoreFields,
        extras: &BTreeMap<String, String>,
        update_core: bool,
    ) -> Result<(), QueueError> {
        let mut state = self.state()?;

        match state.index.get(id).copied() {
            None => {
                // First insert: core fields always apply.
                let mut rec = JobRecord::new(id);
                rec.apply_core(core);
                rec.merge_extras(extras);
                if rec.updated_at.is_none() {
                    rec.updated_at = Some(now_timestamp());
                }
                state.push_record(rec);
            }
            Some(idx) => {
                if !update_core && extras.is_empty() {
                    return Ok(());
                }
                state.register_extra_keys(extras.keys());
                let explicit_updated_at = update_core && core.updated_at.is_some();
                let rec = &mut state.rows[idx];
                rec.merge_extras(extras);
                if update_core {
                    rec.apply_core(core);
                }
                if !explicit_updated_at {
                    rec.updated_at = Some(now_timestamp());
                }
            }
        }

        self.flush_if_unbatched(&state)?;
        Ok(())
    }

    /// Unknown id creates the record here: the file's schema is additive,
    /// so an update aimed at a missing row becomes its insert.
    fn update_by_id(
        &self,
        id: &str,
        core: &CoreFields,
        extras: &BTreeMap<String, String>,
    ) -> Result<(), QueueError> {
        let mut state = self.state()?;

        match state.index.get(id).copied() {
            None => {
                let mut rec = JobRecord::new(id);
                rec.apply_core(core);
                rec.merge_extras(extras);
                if rec.updated_at.is_none() {
                    rec.updated_at = Some(now_timestamp());
                }
                state.push_record(rec);
            }
            Some(idx) => {
                state.register_extra_keys(extras.keys());
                let explicit_updated_at = core.updated_at.is_some();
                let rec = &mut state.rows[idx];
                rec.merge_extras(extras);
                rec.apply_core(core);
                if !explicit_updated_at {
                    rec.updated_at = Some(now_timestamp());
                }
            }
        }

        self.flush_if_unbatched(&state)?;
        Ok(())
    }

    fn reset_all(&self) -> Result<u64, QueueError> {
        let mut state = self.state()?;
        let now = now_timestamp();
        for rec in &mut state.rows {
            rec.requeue(&now);
        }
        let count = state.rows.len() as u64;
        self.flush_if_unbatched(&state)?;
        Ok(count)
    }

    fn total_items(&self) -> Result<u64, QueueError> {
        Ok(self.state()?.rows.len() as u64)
    }

    fn progress(&self) -> Result<Progress, QueueError> {
        let state = self.state()?;
        let total = state.rows.len() as u64;
        let done = state
            .rows
            .iter()
            .filter(|r| r.status == JobStatus::Ok)
            .count() as u64;
        let errors = state
            .rows
            .iter()
            .filter(|r| r.status == JobStatus::Error)
            .count() as u64;
        let in_progress = state.rows.iter().filter(|r| r.in_progress).count() as u64;
        Ok(Progress::new(total, done, errors, in_progress))
    }

    fn fetch_all_for_export(&self) -> Result<Vec<ExportRow>, QueueError> {
        let state = self.state()?;
        Ok(state.rows.iter().map(JobRecord::export_row).collect())
    }

    fn perform_batch<T, E>(&self, f: impl FnOnce(&Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<QueueError>,
    {
        {
            let mut state = self
                .state()
                .map_err(|e| E::from(QueueError::from(e)))?;
            state.batch_depth += 1;
        }
        let guard = BatchGuard { queue: self };
        let outcome = f(self);
        drop(guard);

        match outcome {
            Ok(value) => {
                let state = self
                    .state()
                    .map_err(|e| E::from(QueueError::from(e)))?;
                if state.batch_depth == 0 {
                    self.persist(&state)
                        .map_err(|e| E::from(QueueError::from(e)))?;
                }
                Ok(value)
            }
            // No flush: the on-disk file still holds the pre-batch state.
            // In-memory rows stay mutated; callers that keep using the
            // instance after a failed batch accept that divergence.
            Err(e) => Err(e),
        }
    }
}
