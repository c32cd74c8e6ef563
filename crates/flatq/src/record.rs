//! The job record: the single data entity both storage engines persist.
//!
//! A record carries seven fixed core fields plus an open `extras` map for
//! caller-defined columns. All state transitions go through the helpers
//! here so the `status` / `(processed, in_progress)` consistency invariant
//! lives in exactly one place.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::text::flatten_newlines;

/// The seven fixed queue-state columns, in canonical order.
pub const CORE_COLUMNS: [&str; 7] = [
    "id",
    "processed",
    "in_progress",
    "status",
    "result",
    "updated_at",
    "last_error",
];

/// Name of the column holding the serialized extras blob in the flat-file
/// store.
pub const EXTRAS_COLUMN: &str = "extras";

/// Returns true if `name` is one of the fixed core columns.
pub fn is_core_column(name: &str) -> bool {
    CORE_COLUMNS.contains(&name)
}

/// Current timestamp in the stored format (RFC 3339, UTC).
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// Queue state of a record. Stored as text alongside the boolean flags for
/// human/CSV readability; the two representations must stay consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Ok,
    Error,
}

impl JobStatus {
    /// The stored text form.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Ok => "ok",
            JobStatus::Error => "error",
        }
    }

    /// Parses a stored status cell. Empty text means `Queued`; anything
    /// unrecognized is treated as `Queued` with a warning, matching how
    /// the rest of the system degrades on dirty rows.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "" | "queued" => JobStatus::Queued,
            "in_progress" => JobStatus::InProgress,
            "ok" => JobStatus::Ok,
            "error" => JobStatus::Error,
            other => {
                log::warn!("Unknown job status '{}', treating as queued", other);
                JobStatus::Queued
            }
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a boolean cell ("1"/"true", case-insensitive). Anything else,
/// including blank, is false.
pub fn parse_flag(s: &str) -> bool {
    let s = s.trim();
    s == "1" || s.eq_ignore_ascii_case("true")
}

/// Parses the tri-state `result` cell: blank is unset, "true"/"false" map
/// to 1/0, otherwise an integer parse (unparseable text is unset).
pub fn parse_result(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s.eq_ignore_ascii_case("true") {
        return Some(1);
    }
    if s.eq_ignore_ascii_case("false") {
        return Some(0);
    }
    s.parse::<i64>().ok()
}

/// One queue entry, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Stable, unique, immutable key.
    pub id: String,
    /// True only after a successful completion.
    pub processed: bool,
    /// True while claimed by a worker; never true together with `processed`.
    pub in_progress: bool,
    pub status: JobStatus,
    /// Unset = never attempted, 1 = succeeded, 0 = failed.
    pub result: Option<i64>,
    /// Set on every state transition.
    pub updated_at: Option<String>,
    /// Set on failure, cleared on success.
    pub last_error: Option<String>,
    /// Open caller-defined fields, merged (never wholesale replaced) on
    /// repeated upserts.
    pub extras: BTreeMap<String, String>,
}

impl JobRecord {
    /// Creates a fresh queued record.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            processed: false,
            in_progress: false,
            status: JobStatus::Queued,
            result: None,
            updated_at: None,
            last_error: None,
            extras: BTreeMap::new(),
        }
    }

    /// True if this record can be claimed: not processed, not in progress,
    /// and status queued.
    pub fn is_eligible(&self) -> bool {
        !self.processed && !self.in_progress && self.status == JobStatus::Queued
    }

    /// Claims the record: queued → in_progress.
    pub fn begin_work(&mut self, now: &str) {
        self.in_progress = true;
        self.processed = false;
        self.status = JobStatus::InProgress;
        self.updated_at = Some(now.to_string());
    }

    /// Completes the record successfully: → ok, result 1, error cleared.
    pub fn finish_ok(&mut self, now: &str) {
        self.processed = true;
        self.in_progress = false;
        self.status = JobStatus::Ok;
        self.result = Some(1);
        self.last_error = None;
        self.updated_at = Some(now.to_string());
    }

    /// Records a failure: → error, result 0, message flattened to one line.
    pub fn finish_err(&mut self, message: &str, now: &str) {
        self.processed = false;
        self.in_progress = false;
        self.status = JobStatus::Error;
        self.result = Some(0);
        self.last_error = Some(flatten_newlines(message));
        self.updated_at = Some(now.to_string());
    }

    /// Forces the record back to a fresh queued state, clearing result and
    /// error. Used by `reset_all`.
    pub fn requeue(&mut self, now: &str) {
        self.processed = false;
        self.in_progress = false;
        self.status = JobStatus::Queued;
        self.result = None;
        self.last_error = None;
        self.updated_at = Some(now.to_string());
    }

    /// Recovers a record left claimed by a dead worker: drops the
    /// `in_progress` flag and, if the status still says `in_progress`,
    /// moves it back to `queued`. Result and error are left untouched.
    /// Returns true if anything changed.
    pub fn recover(&mut self, now: &str) -> bool {
        if !self.in_progress {
            return false;
        }
        self.in_progress = false;
        if self.status == JobStatus::InProgress {
            self.status = JobStatus::Queued;
        }
        self.updated_at = Some(now.to_string());
        true
    }

    /// Merges `extras` into this record: supplied keys win, keys not
    /// supplied are untouched.
    pub fn merge_extras(&mut self, extras: &BTreeMap<String, String>) {
        for (k, v) in extras {
            self.extras.insert(k.clone(), v.clone());
        }
    }

    /// Applies every present field of `core` as a direct overwrite. Absent
    /// (`None`) fields are skipped — they mean "not in the source", never
    /// "clear the stored value".
    pub fn apply_core(&mut self, core: &CoreFields) {
        if let Some(v) = core.processed {
            self.processed = v;
        }
        if let Some(v) = core.in_progress {
            self.in_progress = v;
        }
        if let Some(v) = core.status {
            self.status = v;
        }
        if let Some(v) = core.result {
            self.result = Some(v);
        }
        if let Some(ref v) = core.updated_at {
            self.updated_at = Some(v.clone());
        }
        if let Some(ref v) = core.last_error {
            self.last_error = Some(v.clone());
        }
    }

    /// The merged flat view used for export: all core fields plus all
    /// extras, with core values winning on a key collision.
    pub fn export_row(&self) -> BTreeMap<String, String> {
        let mut row = self.extras.clone();
        row.insert("id".to_string(), self.id.clone());
        row.insert("processed".to_string(), flag_text(self.processed));
        row.insert("in_progress".to_string(), flag_text(self.in_progress));
        row.insert("status".to_string(), self.status.as_str().to_string());
        row.insert(
            "result".to_string(),
            self.result.map(|r| r.to_string()).unwrap_or_default(),
        );
        row.insert(
            "updated_at".to_string(),
            self.updated_at.clone().unwrap_or_default(),
        );
        row.insert(
            "last_error".to_string(),
            self.last_error.clone().unwrap_or_default(),
        );
        row
    }
}

fn flag_text(v: bool) -> String {
    if v { "1" } else { "0" }.to_string()
}

/// Per-import view of the core columns minus `id`. Every field is
/// optional: `None` means "absent from the source row", which an upsert
/// must skip rather than treat as a clear.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreFields {
    pub processed: Option<bool>,
    pub in_progress: Option<bool>,
    pub status: Option<JobStatus>,
    pub result: Option<i64>,
    pub updated_at: Option<String>,
    pub last_error: Option<String>,
}

impl CoreFields {
    /// True if no field is present.
    pub fn is_empty(&self) -> bool {
        self.processed.is_none()
            && self.in_progress.is_none()
            && self.status.is_none()
            && self.result.is_none()
            && self.updated_at.is_none()
            && self.last_error.is_none()
    }

    /// Sets one field from its import cell text. Blank cells leave the
    /// field absent. Unknown field names are ignored (`id` is handled by
    /// the importer, not here).
    pub fn set_from_text(&mut self, field: &str, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        match field {
            "processed" => self.processed = Some(parse_flag(value)),
            "in_progress" => self.in_progress = Some(parse_flag(value)),
            "status" => self.status = Some(JobStatus::parse(value)),
            "result" => self.result = parse_result(value),
            "updated_at" => self.updated_at = Some(value.to_string()),
            "last_error" => self.last_error = Some(value.to_string()),
            _ => {}
        }
    }
}

/// Parses a stored extras blob (a JSON object) into the open field map.
/// Non-string scalars are coerced to text; a malformed blob degrades to an
/// empty map with a warning rather than poisoning the whole record.
pub(crate) fn extras_from_json(id: &str, blob: &str) -> BTreeMap<String, String> {
    let blob = blob.trim();
    if blob.is_empty() {
        return BTreeMap::new();
    }
    match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(blob) {
        Ok(values) => values
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
        Err(e) => {
            log::warn!("Malformed extras blob for job {}: {}", id, e);
            BTreeMap::new()
        }
    }
}

/// Serializes the open field map back into its stored JSON form.
pub(crate) fn extras_to_json(extras: &BTreeMap<String, String>) -> String {
    serde_json::to_string(extras).unwrap_or_else(|_| "{}".to_string())
}

/// Queue totals as exposed by `progress()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: u64,
    pub done: u64,
    pub errors: u64,
    pub in_progress: u64,
    /// `total - done - errors - in_progress`, floored at zero.
    pub remaining: u64,
}

impl Progress {
    pub fn new(total: u64, done: u64, errors: u64, in_progress: u64) -> Self {
        Self {
            total,
            done,
            errors,
            in_progress,
            remaining: total
                .saturating_sub(done)
                .saturating_sub(errors)
                .saturating_sub(in_progress),
        }
    }
}
