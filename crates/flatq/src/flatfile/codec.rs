//! Delimited-file wire format shared by the flat-file store and the
//! import/export pipeline.
//!
//! Format: single-byte delimiter (default `;`), double-quote quoting,
//! backslash escape, one header row, UTF-8. A byte-order mark on the
//! header is tolerated and stripped. Rewrites go through a temporary
//! sibling file followed by an atomic rename, so a crash leaves either
//! the old file or the new file intact — never a torn one.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, WriterBuilder};

use super::error::FileStoreError;
use crate::text::normalize_cell;

/// Default column delimiter.
pub(crate) const DEFAULT_DELIMITER: u8 = b';';

/// Reader configuration for the shared wire format. Header handling is
/// left to the caller so header cells get the same normalization as data
/// cells. `flexible` because short rows are a row-level data problem, not
/// a reason to abort a whole file.
pub(crate) fn reader_builder(delimiter: u8) -> ReaderBuilder {
    let mut builder = ReaderBuilder::new();
    builder
        .delimiter(delimiter)
        .quote(b'"')
        .escape(Some(b'\\'))
        .flexible(true)
        .has_headers(false);
    builder
}

/// Writer configuration matching [`reader_builder`].
pub(crate) fn writer_builder(delimiter: u8) -> WriterBuilder {
    let mut builder = WriterBuilder::new();
    builder.delimiter(delimiter).quote(b'"');
    builder
}

/// Reads a whole delimited file: the normalized header plus all data rows
/// (each cell normalized, fully-empty rows dropped). Unparseable rows are
/// skipped with a debug log.
pub(crate) fn read_table(
    path: &Path,
    delimiter: u8,
) -> Result<(Vec<String>, Vec<Vec<String>>), FileStoreError> {
    let file = File::open(path).map_err(|e| FileStoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut reader = reader_builder(delimiter).from_reader(file);

    let mut header: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();

    for record in reader.records() {
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
        if header.is_empty() {
            header = cells;
        } else {
            rows.push(cells);
        }
    }

    Ok((header, rows))
}

/// Writes `header` and `rows` to `path` via a temporary sibling file and
/// an atomic rename.
pub(crate) fn write_table<R, C>(
    path: &Path,
    delimiter: u8,
    header: &[String],
    rows: R,
) -> Result<(), FileStoreError>
where
    R: IntoIterator<Item = C>,
    C: IntoIterator<Item = String>,
{
    let tmp = sibling_tmp_path(path);

    let file = File::create(&tmp).map_err(|e| FileStoreError::Io {
        path: tmp.clone(),
        source: e,
    })?;
    let mut writer = writer_builder(delimiter).from_writer(file);

    let csv_err = |e: csv::Error| FileStoreError::Csv {
        path: tmp.clone(),
        source: e,
    };
    writer.write_record(header).map_err(csv_err)?;
    for row in rows {
        writer.write_record(row).map_err(csv_err)?;
    }
    writer.flush().map_err(|e| FileStoreError::Io {
        path: tmp.clone(),
        source: e,
    })?;

    let file = writer.into_inner().map_err(|e| FileStoreError::Io {
        path: tmp.clone(),
        source: e.into_error(),
    })?;
    // Best-effort durability; the rename below is the atomicity boundary.
    let _ = file.sync_all();
    drop(file);

    replace_file(&tmp, path)
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("queue");
    path.with_file_name(format!("{}.tmp", name))
}

/// Renames `from` over `to`. Rename-over-existing is atomic on POSIX;
/// platforms that refuse it get a delete-then-rename fallback, which still
/// never exposes a half-written file.
fn replace_file(from: &Path, to: &Path) -> Result<(), FileStoreError> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }

    if to.exists() {
        std::fs::remove_file(to).map_err(|e| FileStoreError::Replace {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::rename(from, to).map_err(|e| FileStoreError::Replace {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_raw(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_read_table_basic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(&dir, "t.csv", "id;name\n1;alpha\n2;beta\n");

        let (header, rows) = read_table(&path, b';').unwrap();
        assert_eq!(header, vec!["id", "name"]);
        assert_eq!(rows, vec![vec!["1", "alpha"], vec!["2", "beta"]]);
    }

    #[test]
    fn test_read_table_strips_bom_and_padding() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(&dir, "t.csv", "\u{feff}id; name \n 1 ;alpha\n");

        let (header, rows) = read_table(&path, b';').unwrap();
        assert_eq!(header, vec!["id", "name"]);
        assert_eq!(rows, vec![vec!["1", "alpha"]]);
    }

    #[test]
    fn test_read_table_skips_blank_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(&dir, "t.csv", "id;name\n\n;\n1;alpha\n");

        let (_, rows) = read_table(&path, b';').unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_read_table_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_table(&dir.path().join("absent.csv"), b';');
        assert!(matches!(result, Err(FileStoreError::Io { .. })));
    }

    #[test]
    fn test_read_table_quoted_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(&dir, "t.csv", "id;note\n1;\"a;b\"\n");

        let (_, rows) = read_table(&path, b';').unwrap();
        assert_eq!(rows[0][1], "a;b");
    }

    #[test]
    fn test_write_table_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let header = vec!["id".to_string(), "note".to_string()];
        let rows = vec![
            vec!["1".to_string(), "has;delimiter".to_string()],
            vec!["2".to_string(), String::new()],
        ];
        write_table(&path, b';', &header, rows.clone()).unwrap();

        let (h, r) = read_table(&path, b';').unwrap();
        assert_eq!(h, header);
        // The all-empty trailing cell survives as an empty string.
        assert_eq!(r[0], rows[0]);
        assert_eq!(r[1][0], "2");
    }

    #[test]
    fn test_write_table_replaces_existing_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(&dir, "q.csv", "id\nold\n");

        let header = vec!["id".to_string()];
        write_table(&path, b';', &header, vec![vec!["new".to_string()]]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("new"));
        assert!(!content.contains("old"));
        // No temp file left behind.
        assert!(!dir.path().join("q.csv.tmp").exists());
    }

    #[test]
    fn test_write_table_custom_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.csv");

        write_table(
            &path,
            b',',
            &["id".to_string(), "v".to_string()],
            vec![vec!["1".to_string(), "x".to_string()]],
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("id,v"));
    }
}
