//! The transactional queue engine.
//!
//! One indexed `jobs` table; the claim is expressed in SQL as a
//! select-then-guarded-update inside an explicit transaction, so a racing
//! claimant loses cleanly (the guarded update affects zero rows and the
//! call returns `None`). On open, records left claimed by a dead process
//! are swept back to `queued` before the handle is handed out.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};
use crate::engine::{ExportRow, QueueEngine};
use crate::error::QueueError;
use crate::record::{
    extras_from_json, extras_to_json, now_timestamp, CoreFields, JobRecord, JobStatus, Progress,
};
use crate::text::flatten_newlines;

/// Predicate shared by the eligibility scan and the claim guard.
const ELIGIBLE: &str = "processed = 0 AND in_progress = 0 AND status IN ('', 'queued')";

/// Queue engine backed by a SQLite `jobs` table.
///
/// Unknown-id policy: `mark_success`, `mark_failure` and `update_by_id`
/// all return [`QueueError::UnknownId`] — a lost id surfaces loudly
/// instead of silently dropping a state transition.
pub struct SqliteQueue {
    db: Database,
}

impl SqliteQueue {
    /// Opens (or creates) the queue database at `path` and recovers any
    /// records left `in_progress` by a previous, unterminated run.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        Self::from_database(Database::open(path)?)
    }

    /// In-memory queue for tests.
    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::from_database(Database::open_in_memory()?)
    }

    /// Wraps an existing database handle, running the stale-claim sweep
    /// before returning.
    pub fn from_database(db: Database) -> Result<Self, QueueError> {
        let queue = Self { db };
        let recovered = queue.recover_stale()?;
        if recovered > 0 {
            log::info!("Recovered {} stale in-progress jobs", recovered);
        }
        Ok(queue)
    }

    /// The underlying database handle (for maintenance calls).
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Sweeps records left claimed by a dead worker back to claimable
    /// state. Returns the number of recovered records.
    fn recover_stale(&self) -> Result<u64, QueueError> {
        let affected = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE jobs
                    SET in_progress = 0,
                        status = CASE WHEN status = 'in_progress' THEN 'queued' ELSE status END,
                        updated_at = ?1
                  WHERE in_progress = 1",
                params![now_timestamp()],
            )?)
        })?;
        Ok(affected as u64)
    }

    /// Moves every `error` record back to `queued`, clearing result and
    /// error. Returns the number of records retried.
    pub fn retry_errors(&self) -> Result<u64, QueueError> {
        let affected = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE jobs
                    SET processed = 0, in_progress = 0, status = 'queued',
                        result = NULL, last_error = NULL, updated_at = ?1
                  WHERE status = 'error'",
                params![now_timestamp()],
            )?)
        })?;
        Ok(affected as u64)
    }

    /// Fetches one record by id.
    pub fn find_by_id(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        let rec = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
            let mut rows = stmt.query_map(params![id], record_from_row)?;
            match rows.next() {
                Some(Ok(rec)) => Ok(Some(rec)),
                Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
                None => Ok(None),
            }
        })?;
        Ok(rec)
    }

    /// Applies core fields and merged extras to an existing row. The SET
    /// list is assembled dynamically so absent core fields never touch
    /// their columns.
    fn apply_update(
        conn: &Connection,
        id: &str,
        core: &CoreFields,
        apply_core: bool,
        merged_extras: &BTreeMap<String, String>,
    ) -> Result<(), DatabaseError> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(id.to_string())];

        let mut explicit_updated_at = false;
        if apply_core {
            if let Some(v) = core.processed {
                values.push(Box::new(v));
                sets.push(format!("processed = ?{}", values.len()));
            }
            if let Some(v) = core.in_progress {
                values.push(Box::new(v));
                sets.push(format!("in_progress = ?{}", values.len()));
            }
            if let Some(v) = core.status {
                values.push(Box::new(v.as_str().to_string()));
                sets.push(format!("status = ?{}", values.len()));
            }
            if let Some(v) = core.result {
                values.push(Box::new(v));
                sets.push(format!("result = ?{}", values.len()));
            }
            if let Some(ref v) = core.updated_at {
                values.push(Box::new(v.clone()));
                sets.push(format!("updated_at = ?{}", values.len()));
                explicit_updated_at = true;
            }
            if let Some(ref v) = core.last_error {
                values.push(Box::new(v.clone()));
                sets.push(format!("last_error = ?{}", values.len()));
            }
        }

        values.push(Box::new(extras_to_json(merged_extras)));
        sets.push(format!("extras = ?{}", values.len()));

        if !explicit_updated_at {
            values.push(Box::new(now_timestamp()));
            sets.push(format!("updated_at = ?{}", values.len()));
        }

        let sql = format!("UPDATE jobs SET {} WHERE id = ?1", sets.join(", "));
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(|v| v.as_ref()).collect();
        conn.execute(&sql, params_ref.as_slice())?;
        Ok(())
    }
}

fn insert_record(conn: &Connection, rec: &JobRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, processed, in_progress, status, result, updated_at, last_error, extras)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            rec.id,
            rec.processed,
            rec.in_progress,
            rec.status.as_str(),
            rec.result,
            rec.updated_at,
            rec.last_error,
            extras_to_json(&rec.extras),
        ],
    )?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> Result<JobRecord, rusqlite::Error> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let extras_blob: String = row.get("extras")?;
    let extras = extras_from_json(&id, &extras_blob);
    Ok(JobRecord {
        id,
        processed: row.get("processed")?,
        in_progress: row.get("in_progress")?,
        status: JobStatus::parse(&status),
        result: row.get("result")?,
        updated_at: row.get("updated_at")?,
        last_error: row.get("last_error")?,
        extras,
    })
}

impl QueueEngine for SqliteQueue {
    fn fetch_next(&self) -> Result<Option<JobRecord>, QueueError> {
        let claimed = self.db.with_conn(|conn| {
            // Inside a batch the claim joins the open transaction.
            let own_tx = conn.is_autocommit();
            if own_tx {
                conn.execute_batch("BEGIN IMMEDIATE;")?;
            }

            let claim = (|| -> Result<Option<JobRecord>, DatabaseError> {
                let id: Option<String> = conn
                    .query_row(
                        &format!(
                            "SELECT id FROM jobs WHERE {ELIGIBLE} ORDER BY rowid LIMIT 1"
                        ),
                        [],
                        |r| r.get(0),
                    )
                    .optional()?;
                let Some(id) = id else {
                    return Ok(None);
                };

                // Guarded update: a concurrent claimant that flipped the row
                // between the select and here makes this affect zero rows,
                // and the whole call returns None.
                let affected = conn.execute(
                    &format!(
                        "UPDATE jobs
                            SET in_progress = 1, status = 'in_progress', updated_at = ?2
                          WHERE id = ?1 AND {ELIGIBLE}"
                    ),
                    params![id, now_timestamp()],
                )?;
                if affected != 1 {
                    return Ok(None);
                }

                let rec = conn.query_row(
                    "SELECT * FROM jobs WHERE id = ?1",
                    params![id],
                    record_from_row,
                )?;
                Ok(Some(rec))
            })();

            if own_tx {
                match &claim {
                    Ok(_) => conn.execute_batch("COMMIT;")?,
                    Err(_) => {
                        let _ = conn.execute_batch("ROLLBACK;");
                    }
                }
            }
            claim
        })?;
        Ok(claimed)
    }

    fn mark_success(&self, id: &str) -> Result<(), QueueError> {
        let affected = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE jobs
                    SET processed = 1, in_progress = 0, status = 'ok',
                        result = 1, last_error = NULL, updated_at = ?2
                  WHERE id = ?1",
                params![id, now_timestamp()],
            )?)
        })?;
        if affected == 0 {
            return Err(QueueError::UnknownId(id.to_string()));
        }
        Ok(())
    }

    fn mark_failure(&self, id: &str, message: &str) -> Result<(), QueueError> {
        let affected = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE jobs
                    SET processed = 0, in_progress = 0, status = 'error',
                        result = 0, last_error = ?3, updated_at = ?2
                  WHERE id = ?1",
                params![id, now_timestamp(), flatten_newlines(message)],
            )?)
        })?;
        if affected == 0 {
            return Err(QueueError::UnknownId(id.to_string()));
        }
        Ok(())
    }

    fn upsert(
        &self,
        id: &str,
        core: &CoreFields,
        extras: &BTreeMap<String, String>,
        update_core: bool,
    ) -> Result<(), QueueError> {
        self.db.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row("SELECT extras FROM jobs WHERE id = ?1", params![id], |r| {
                    r.get(0)
                })
                .optional()?;

            match existing {
                None => {
                    // First insert: there is no prior state to protect, so
                    // core fields apply regardless of update_core.
                    let mut rec = JobRecord::new(id);
                    rec.apply_core(core);
                    rec.merge_extras(extras);
                    if rec.updated_at.is_none() {
                        rec.updated_at = Some(now_timestamp());
                    }
                    insert_record(conn, &rec)
                }
                Some(blob) => {
                    if !update_core && extras.is_empty() {
                        return Ok(());
                    }
                    let mut merged = extras_from_json(id, &blob);
                    for (k, v) in extras {
                        merged.insert(k.clone(), v.clone());
                    }
                    Self::apply_update(conn, id, core, update_core, &merged)
                }
            }
        })?;
        Ok(())
    }

    /// Unknown id is an error here; only `upsert` creates records in this
    /// engine.
    fn update_by_id(
        &self,
        id: &str,
        core: &CoreFields,
        extras: &BTreeMap<String, String>,
    ) -> Result<(), QueueError> {
        let found = self.db.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row("SELECT extras FROM jobs WHERE id = ?1", params![id], |r| {
                    r.get(0)
                })
                .optional()?;
            let Some(blob) = existing else {
                return Ok(false);
            };
            let mut merged = extras_from_json(id, &blob);
            for (k, v) in extras {
                merged.insert(k.clone(), v.clone());
            }
            Self::apply_update(conn, id, core, true, &merged)?;
            Ok(true)
        })?;
        if !found {
            return Err(QueueError::UnknownId(id.to_string()));
        }
        Ok(())
    }

    fn reset_all(&self) -> Result<u64, QueueError> {
        let affected = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE jobs
                    SET processed = 0, in_progress = 0, status = 'queued',
                        result = NULL, last_error = NULL, updated_at = ?1",
                params![now_timestamp()],
            )?)
        })?;
        Ok(affected as u64)
    }

    fn total_items(&self) -> Result<u64, QueueError> {
        let count: i64 = self
            .db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?))?;
        Ok(count as u64)
    }

    fn progress(&self) -> Result<Progress, QueueError> {
        let (total, done, errors, in_progress) = self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN status = 'ok' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN in_progress = 1 THEN 1 ELSE 0 END), 0)
                   FROM jobs",
                [],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, i64>(2)?,
                        r.get::<_, i64>(3)?,
                    ))
                },
            )?)
        })?;
        Ok(Progress::new(
            total as u64,
            done as u64,
            errors as u64,
            in_progress as u64,
        ))
    }

    fn fetch_all_for_export(&self) -> Result<Vec<ExportRow>, QueueError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY rowid")?;
            let rows: Vec<JobRecord> = stmt
                .query_map([], record_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows.iter().map(JobRecord::export_row).collect())
    }

    fn perform_batch<T, E>(&self, f: impl FnOnce(&Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<QueueError>,
    {
        let to_err = |e: DatabaseError| E::from(QueueError::from(e));

        let nested = self
            .db
            .with_conn(|conn| Ok(!conn.is_autocommit()))
            .map_err(to_err)?;
        if nested {
            // Already inside a batch: join the outer transaction.
            return f(self);
        }

        self.db
            .with_conn(|conn| {
                conn.execute_batch("BEGIN IMMEDIATE;")?;
                Ok(())
            })
            .map_err(to_err)?;

        match f(self) {
            Ok(value) => {
                self.db
                    .with_conn(|conn| {
                        conn.execute_batch("COMMIT;")?;
                        Ok(())
                    })
                    .map_err(to_err)?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.db.with_conn(|conn| {
                    conn.execute_batch("ROLLBACK;")?;
                    Ok(())
                });
                Err(e)
            }
        }
    }
}
