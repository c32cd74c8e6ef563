//! The queue engine contract.
//!
//! Both storage engines — [`SqliteQueue`](crate::db::SqliteQueue) and
//! [`FileQueue`](crate::flatfile::FileQueue) — implement this trait with
//! identical semantics and no shared state. Callers that only claim and
//! report work can stay generic over the engine.

use std::collections::BTreeMap;

use crate::error::QueueError;
use crate::record::{CoreFields, JobRecord, Progress};

/// A flat, merged view of one record: every core field plus every extras
/// key, all coerced to text. Core values win when an extras key collides
/// with a core column name.
pub type ExportRow = BTreeMap<String, String>;

/// The capability contract every queue engine satisfies.
///
/// All methods take `&self`; each engine owns its interior synchronization
/// and is safe to share via `Arc` within one process. The design assumes a
/// single active writer process per queue instance — crash recovery, not
/// cross-machine arbitration.
///
/// Unknown-id policy: `mark_success` and `mark_failure` return
/// [`QueueError::UnknownId`] in both engines. `update_by_id` differs per
/// engine and is documented on each implementation.
pub trait QueueEngine: Send + Sync {
    /// Atomically claims the first eligible record in insertion order:
    /// flips it to `in_progress`, persists the flip, and returns the record
    /// as it exists after the flip. Returns `Ok(None)` — with no side
    /// effects — when nothing is eligible or a racing claimant won; the
    /// caller loops rather than the engine retrying.
    ///
    /// Eligibility: `processed=false`, `in_progress=false`, status queued.
    /// No two calls ever return the same record as in-progress.
    fn fetch_next(&self) -> Result<Option<JobRecord>, QueueError>;

    /// Marks a job successfully completed: `processed=1, in_progress=0,
    /// status=ok, result=1`, error cleared, `updated_at` stamped.
    fn mark_success(&self, id: &str) -> Result<(), QueueError>;

    /// Records a job failure: `processed=0, in_progress=0, status=error,
    /// result=0`, `last_error` set to `message` with newlines flattened.
    /// A failing job is queue state, not a system error.
    fn mark_failure(&self, id: &str, message: &str) -> Result<(), QueueError>;

    /// Insert-if-absent by id. Extras are always deep-merged (supplied keys
    /// win, others persist). Core fields apply only when `update_core` is
    /// true — except on first insert, where there is no prior state to
    /// protect and they always apply. `None` core fields are skipped.
    fn upsert(
        &self,
        id: &str,
        core: &CoreFields,
        extras: &BTreeMap<String, String>,
        update_core: bool,
    ) -> Result<(), QueueError>;

    /// Directly mutates one record: applies every present core field and
    /// merges extras. Unknown-id behavior is engine-defined and documented
    /// on each implementation.
    fn update_by_id(
        &self,
        id: &str,
        core: &CoreFields,
        extras: &BTreeMap<String, String>,
    ) -> Result<(), QueueError>;

    /// Forces every record back to `queued` (`result` and `last_error`
    /// cleared, `updated_at` set to the reset time). Returns the number of
    /// records touched.
    fn reset_all(&self) -> Result<u64, QueueError>;

    /// Number of records in the queue.
    fn total_items(&self) -> Result<u64, QueueError>;

    /// Queue totals; `remaining` is floored at zero.
    fn progress(&self) -> Result<Progress, QueueError>;

    /// A finite snapshot of every record's merged core+extras view, in
    /// insertion order. Safe to call repeatedly.
    fn fetch_all_for_export(&self) -> Result<Vec<ExportRow>, QueueError>;

    /// Runs `f` so that every contained operation is durable as one unit:
    /// a database transaction for the transactional engine, a single
    /// whole-file rewrite for the flat-file engine. Nested calls join the
    /// outermost batch. On `Err` nothing new reaches disk; note the
    /// flat-file engine's in-memory rows stay mutated (documented on the
    /// implementation).
    fn perform_batch<T, E>(&self, f: impl FnOnce(&Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<QueueError>,
        Self: Sized;
}
