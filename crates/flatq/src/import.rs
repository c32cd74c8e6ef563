//! The importer: streams an external delimited file through a mapping
//! profile into queue upserts, inside one batch.
//!
//! Configuration problems (unreadable file, no resolvable id column) fail
//! fast before any storage mutation. Row-level problems (unparseable or
//! second-header rows, rows without an id) are skipped silently and never
//! count toward the import total.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use crate::engine::QueueEngine;
use crate::error::ImportError;
use crate::flatfile::codec;
use crate::profile::MappingProfile;
use crate::record::{is_core_column, CoreFields, CORE_COLUMNS};
use crate::text::normalize_cell;

/// Where a header column's cells end up.
enum Target {
    /// One of the seven core columns.
    Core(&'static str),
    /// An extras key: alias-resolved name if the profile matched the
    /// column, raw header text otherwise (passthrough).
    Extra(String),
    /// Unmatched column with passthrough disabled.
    Skip,
}

/// Imports delimited files into a queue engine through a mapping profile.
pub struct Importer {
    profile: MappingProfile,
    delimiter: u8,
}

impl Importer {
    pub fn new(profile: MappingProfile) -> Self {
        Self {
            profile,
            delimiter: codec::DEFAULT_DELIMITER,
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn profile(&self) -> &MappingProfile {
        &self.profile
    }

    /// Runs the import: header resolve, then one upsert per data row,
    /// all inside a single engine batch. `update_core` selects restore
    /// mode: source core fields overwrite stored core state (and core
    /// defaults fill blank carried cells); otherwise core fields only
    /// apply to newly inserted records.
    ///
    /// Returns the number of rows upserted.
    pub fn import<Q: QueueEngine>(
        &self,
        queue: &Q,
        path: &Path,
        update_core: bool,
    ) -> Result<u64, ImportError> {
        let span = tracing::info_span!("import", file = %path.display(), update_core);
        let _guard = span.enter();

        let file = File::open(path).map_err(|e| ImportError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut reader = codec::reader_builder(self.delimiter).from_reader(file);
        let mut records = reader.records();

        // First non-empty row is the header.
        let header: Vec<String> = loop {
            match records.next() {
                None => {
                    return Err(ImportError::MissingIdColumn {
                        path: path.to_path_buf(),
                    });
                }
                Some(Err(e)) => {
                    return Err(ImportError::Csv {
                        path: path.to_path_buf(),
                        source: e,
                    });
                }
                Some(Ok(record)) => {
                    let cells: Vec<String> = record.iter().map(normalize_cell).collect();
                    if cells.iter().any(|c| !c.is_empty()) {
                        break cells;
                    }
                }
            }
        };

        let targets = self.plan_columns(&header);
        if !targets
            .iter()
            .any(|t| matches!(t, Target::Core("id")))
        {
            return Err(ImportError::MissingIdColumn {
                path: path.to_path_buf(),
            });
        }

        // Core columns the header actually carries; core defaults only
        // ever fill blank cells of carried columns.
        let carried_core: Vec<&'static str> = targets
            .iter()
            .filter_map(|t| match t {
                Target::Core(name) if *name != "id" => Some(*name),
                _ => None,
            })
            .collect();

        let count = queue.perform_batch(|q| {
            let mut count = 0u64;
            for record in records {
                let record = match record {
                    Ok(r) => r,
                    Err(e) => {
                        log::debug!("Skipping unparseable row in {}: {}", path.display(), e);
                        continue;
                    }
                };
                let cells: Vec<String> = record.iter().map(normalize_cell).collect();
                if cells.iter().all(|c| c.is_empty()) {
                    continue;
                }

                let mut logical: BTreeMap<&'static str, String> = BTreeMap::new();
                let mut extras: BTreeMap<String, String> = BTreeMap::new();
                for (i, target) in targets.iter().enumerate() {
                    let value = cells.get(i).map(String::as_str).unwrap_or("");
                    match target {
                        Target::Core(name) => {
                            logical.insert(*name, value.to_string());
                        }
                        Target::Extra(name) => {
                            // Extras only carry substance, never blanks.
                            if !value.trim().is_empty() {
                                extras.insert(name.clone(), value.to_string());
                            }
                        }
                        Target::Skip => {}
                    }
                }

                let id = logical.remove("id").unwrap_or_default();
                let id = id.trim();
                if id.is_empty() || id == "id" {
                    // No key, or an accidental second header row.
                    log::debug!("Skipping keyless row in {}", path.display());
                    continue;
                }

                self.apply_defaults(&mut logical, &mut extras, &carried_core, update_core);

                let mut core = CoreFields::default();
                for (name, value) in &logical {
                    let transformed = self.profile.apply_transform(name, value);
                    core.set_from_text(name, &transformed);
                }
                let extras: BTreeMap<String, String> = extras
                    .into_iter()
                    .map(|(key, value)| {
                        let transformed = self.profile.apply_transform(&key, &value);
                        (key, transformed)
                    })
                    .collect();

                q.upsert(id, &core, &extras, update_core)?;
                count += 1;
            }
            Ok::<_, ImportError>(count)
        })?;

        log::info!("Imported {} rows from {}", count, path.display());
        Ok(count)
    }

    /// Maps each header cell to its destination by testing every alias of
    /// every declared logical field.
    fn plan_columns(&self, header: &[String]) -> Vec<Target> {
        header
            .iter()
            .map(|cell| match self.profile.resolve_field(cell) {
                Some(field) => match CORE_COLUMNS.iter().find(|c| ***c == *field) {
                    Some(core) => Target::Core(core),
                    None => Target::Extra(field.to_string()),
                },
                None => {
                    if self.profile.passthrough() && !cell.is_empty() {
                        Target::Extra(cell.clone())
                    } else {
                        Target::Skip
                    }
                }
            })
            .collect()
    }

    /// Fills declared defaults. Core defaults only materialize in restore
    /// mode for carried-but-blank columns; extras defaults materialize
    /// whenever the row holds no non-empty value for the key.
    fn apply_defaults(
        &self,
        logical: &mut BTreeMap<&'static str, String>,
        extras: &mut BTreeMap<String, String>,
        carried_core: &[&'static str],
        update_core: bool,
    ) {
        if update_core {
            for &name in carried_core {
                let blank = logical
                    .get(name)
                    .map(|v| v.trim().is_empty())
                    .unwrap_or(true);
                if blank {
                    if let Some(default) = self.profile.default_for(name) {
                        logical.insert(name, default.to_string());
                    }
                }
            }
        }

        for (field, default) in self.profile.defaults() {
            if is_core_column(field) {
                continue;
            }
            let present = extras
                .get(field)
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false);
            if !present {
                extras.insert(field.to_string(), default.to_string());
            }
        }
    }
}
