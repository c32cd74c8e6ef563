//! The mapping profile: a declarative schema governing how external
//! delimited files map onto queue records and back.
//!
//! A profile declares header aliases per logical field, default values,
//! per-field transforms (stored as plain function values, never
//! executable strings), a passthrough flag for unmatched columns, and the
//! export column list with optional label overrides. Profiles are built
//! fluently and are independent of any engine, so they can be tested in
//! isolation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::record::CORE_COLUMNS;
use crate::text::norm_key;

/// A pure per-field transform: cell text in, cell text out.
pub type Transform = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Declarative import/export schema. See the module docs.
#[derive(Clone, Default)]
pub struct MappingProfile {
    /// Logical field name → normalized alias list. The field's own name
    /// always matches implicitly.
    aliases: BTreeMap<String, Vec<String>>,
    defaults: BTreeMap<String, String>,
    transforms: HashMap<String, Transform>,
    /// Whether unmatched header columns become extras. On unless disabled.
    drop_unmatched: bool,
    export_columns: Vec<String>,
    export_labels: HashMap<String, String>,
}

impl MappingProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares every core column as a logical field under its own name.
    /// Convenient base for profiles that restore or round-trip queue
    /// state; only declared fields ever resolve.
    pub fn core_fields(mut self) -> Self {
        for column in CORE_COLUMNS {
            self.aliases.entry(column.to_string()).or_default();
        }
        self
    }

    /// Declares header aliases for a logical field. Matching is
    /// case/whitespace-insensitive; the field name itself always matches.
    pub fn alias(mut self, field: &str, aliases: &[&str]) -> Self {
        self.aliases
            .entry(field.to_string())
            .or_default()
            .extend(aliases.iter().map(|a| norm_key(a)));
        self
    }

    /// Declares a default value for a field. Core-field defaults only fill
    /// blank cells of columns the header actually carries (and only in
    /// restore-core imports); extras defaults fill in whenever the row has
    /// no non-empty value for the key.
    pub fn default_value(mut self, field: &str, value: &str) -> Self {
        self.defaults.insert(field.to_string(), value.to_string());
        self
    }

    /// Registers a transform applied to the field's resolved, defaulted
    /// cell text before storage.
    pub fn transform(
        mut self,
        field: &str,
        f: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.transforms.insert(field.to_string(), Arc::new(f));
        self
    }

    /// Disables the default passthrough of unmatched header columns into
    /// extras.
    pub fn drop_unmatched_columns(mut self) -> Self {
        self.drop_unmatched = true;
        self
    }

    /// Declares the export column list, in output order.
    pub fn export_columns(mut self, columns: &[&str]) -> Self {
        self.export_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Overrides the header label written for one export column.
    pub fn export_label(mut self, column: &str, label: &str) -> Self {
        self.export_labels
            .insert(column.to_string(), label.to_string());
        self
    }

    /// Resolves a normalized header cell to a logical field name, testing
    /// every alias of every declared field plus each field's own name.
    pub fn resolve_field(&self, header_cell: &str) -> Option<&str> {
        let key = norm_key(header_cell);
        if key.is_empty() {
            return None;
        }
        for (field, aliases) in &self.aliases {
            if norm_key(field) == key || aliases.iter().any(|a| *a == key) {
                return Some(field);
            }
        }
        None
    }

    /// The declared default for a field, if any.
    pub fn default_for(&self, field: &str) -> Option<&str> {
        self.defaults.get(field).map(String::as_str)
    }

    /// Iterates declared defaults.
    pub(crate) fn defaults(&self) -> impl Iterator<Item = (&str, &str)> {
        self.defaults
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Applies the field's transform, or returns the value unchanged when
    /// none is registered.
    pub fn apply_transform(&self, field: &str, value: &str) -> String {
        match self.transforms.get(field) {
            Some(f) => f(value),
            None => value.to_string(),
        }
    }

    /// Whether unmatched header columns flow into extras.
    pub fn passthrough(&self) -> bool {
        !self.drop_unmatched
    }

    /// The declared export columns.
    pub fn export_column_list(&self) -> &[String] {
        &self.export_columns
    }

    /// The export header row: each column's label override, or the raw
    /// column name.
    pub fn export_header(&self) -> Vec<String> {
        self.export_columns
            .iter()
            .map(|c| {
                self.export_labels
                    .get(c)
                    .cloned()
                    .unwrap_or_else(|| c.clone())
            })
            .collect()
    }
}

impl std::fmt::Debug for MappingProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingProfile")
            .field("aliases", &self.aliases)
            .field("defaults", &self.defaults)
            .field("transforms", &self.transforms.keys().collect::<Vec<_>>())
            .field("drop_unmatched", &self.drop_unmatched)
            .field("export_columns", &self.export_columns)
            .field("export_labels", &self.export_labels)
            .finish()
    }
}

/// Common flag transform: `1`, `true`, `yes` and `ok` (case-insensitive)
/// become `"1"`, anything else non-empty becomes `"0"`. Blank stays blank
/// so an absent value stays absent.
pub fn truthy_flag(value: &str) -> String {
    let v = value.trim();
    if v.is_empty() {
        return String::new();
    }
    if v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("ok")
    {
        "1".to_string()
    } else {
        "0".to_string()
    }
}
