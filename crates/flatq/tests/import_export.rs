//! Mapping pipeline scenarios: import through aliases/defaults/transforms,
//! export projection, and full round-trips on both engines.

mod common;

use assert_fs::prelude::*;
use assert_fs::TempDir;

use common::{extras, seed, QueueHarness};
use flatq::{
    truthy_flag, CoreFields, Exporter, FileQueue, Importer, JobStatus, MappingProfile,
    QueueEngine, SqliteQueue,
};

fn done_profile() -> MappingProfile {
    MappingProfile::new()
        .alias("id", &[])
        .alias("processed", &["done"])
        .transform("processed", truthy_flag)
}

/// Rows already marked done in the source file must not be claimable
/// after import; the first fetch returns the one unfinished row.
fn check_complex_import<Q: QueueEngine>(queue: &Q, path: &std::path::Path) {
    let count = Importer::new(done_profile())
        .import(queue, path, true)
        .unwrap();
    assert_eq!(count, 3);

    let next = queue.fetch_next().unwrap().unwrap();
    assert_eq!(next.id, "1006");
    assert!(queue.fetch_next().unwrap().is_none());

    let p = queue.progress().unwrap();
    assert_eq!(p.total, 3);
    assert_eq!(p.in_progress, 1);
}

#[test]
fn test_complex_import_sqlite() {
    let temp = TempDir::new().unwrap();
    let input = temp.child("orders.csv");
    input
        .write_str("id;done\n1001;1\n1002;true\n1006;\n")
        .unwrap();

    let queue = SqliteQueue::open_in_memory().unwrap();
    check_complex_import(&queue, input.path());
}

#[test]
fn test_complex_import_file_queue() {
    let temp = TempDir::new().unwrap();
    let input = temp.child("orders.csv");
    input
        .write_str("id;done\n1001;1\n1002;true\n1006;\n")
        .unwrap();

    let queue = FileQueue::create(&temp.child("queue.csv").path().to_path_buf(), None).unwrap();
    check_complex_import(&queue, input.path());
}

#[test]
fn test_import_tolerates_bom_header() {
    let temp = TempDir::new().unwrap();
    let input = temp.child("bom.csv");
    input.write_str("\u{feff}id;customer\n1;acme\n").unwrap();

    let queue = SqliteQueue::open_in_memory().unwrap();
    let count = Importer::new(MappingProfile::new().alias("id", &[]))
        .import(&queue, input.path(), false)
        .unwrap();
    assert_eq!(count, 1);
    assert!(queue.find_by_id("1").unwrap().is_some());
}

#[test]
fn test_failure_report_scenario() {
    let queue = SqliteQueue::open_in_memory().unwrap();
    seed(&queue, &["1004"]);

    queue.mark_failure("1004", "api timeout").unwrap();

    let p = queue.progress().unwrap();
    assert_eq!(p.errors, 1);
    let rec = queue.find_by_id("1004").unwrap().unwrap();
    assert_eq!(rec.last_error.as_deref(), Some("api timeout"));
}

#[test]
fn test_export_then_reimport_round_trip() {
    let harness = QueueHarness::new();
    let source = SqliteQueue::open_in_memory().unwrap();

    // Build a queue with every state represented.
    seed(&source, &["1001", "1002", "1003", "1004"]);
    source
        .upsert(
            "1001",
            &CoreFields::default(),
            &extras(&[("customer", "acme")]),
            false,
        )
        .unwrap();
    source.fetch_next().unwrap().unwrap();
    source.mark_success("1001").unwrap();
    source.mark_failure("1002", "api timeout").unwrap();
    source.fetch_next().unwrap().unwrap(); // 1003 stays claimed

    let out = harness.path().join("dump.csv");
    let export_profile = MappingProfile::new().export_columns(&[
        "id",
        "processed",
        "in_progress",
        "status",
        "result",
        "updated_at",
        "last_error",
        "customer",
    ]);
    let written = Exporter::new(export_profile).export(&source, &out).unwrap();
    assert_eq!(written, 4);

    // Re-import into a fresh queue with aliases equal to the export
    // column names, restoring core state.
    let target = SqliteQueue::open_in_memory().unwrap();
    let import_profile = MappingProfile::new().core_fields();
    let count = Importer::new(import_profile)
        .import(&target, &out, true)
        .unwrap();
    assert_eq!(count, 4);

    for id in ["1001", "1002", "1003", "1004"] {
        let a = source.find_by_id(id).unwrap().unwrap();
        let b = target.find_by_id(id).unwrap().unwrap();
        assert_eq!(a.processed, b.processed, "processed differs for {}", id);
        assert_eq!(a.in_progress, b.in_progress, "in_progress differs for {}", id);
        assert_eq!(a.status, b.status, "status differs for {}", id);
        assert_eq!(a.result, b.result, "result differs for {}", id);
        assert_eq!(a.updated_at, b.updated_at, "updated_at differs for {}", id);
        assert_eq!(a.last_error, b.last_error, "last_error differs for {}", id);
        assert_eq!(a.extras, b.extras, "extras differ for {}", id);
    }
}

#[test]
fn test_round_trip_through_file_queue_storage() {
    let harness = QueueHarness::new();

    // The flat-file engine's own storage is the same wire format the
    // importer understands, so a queue file can be imported directly.
    let path = harness.path().join("store.csv");
    {
        let queue = FileQueue::create(&path, None).unwrap();
        seed(&queue, &["a", "b"]);
        queue
            .upsert("a", &CoreFields::default(), &extras(&[("note", "kept")]), false)
            .unwrap();
        queue.mark_success("a").unwrap();
    }

    let target = SqliteQueue::open_in_memory().unwrap();
    let count = Importer::new(MappingProfile::new().core_fields())
        .import(&target, &path, true)
        .unwrap();
    assert_eq!(count, 2);

    let a = target.find_by_id("a").unwrap().unwrap();
    assert!(a.processed);
    assert_eq!(a.status, JobStatus::Ok);
    // The serialized extras blob is passthrough data for the importer and
    // rides along as a plain column.
    assert!(a.extras.contains_key("extras"));

    assert!(target.find_by_id("b").unwrap().unwrap().is_eligible());
}

#[test]
fn test_import_then_export_preserves_unmapped_columns() {
    let temp = TempDir::new().unwrap();
    let input = temp.child("in.csv");
    input
        .write_str("id;Kundenname;internal_ref\n1;acme;X-7\n2;globex;\n")
        .unwrap();

    let queue = SqliteQueue::open_in_memory().unwrap();
    let profile = MappingProfile::new()
        .alias("id", &[])
        .alias("customer", &["Kundenname"]);
    Importer::new(profile)
        .import(&queue, input.path(), false)
        .unwrap();

    let out = temp.child("out.csv");
    let export_profile = MappingProfile::new()
        .export_columns(&["id", "status", "customer", "internal_ref"])
        .export_label("customer", "Kundenname");
    Exporter::new(export_profile)
        .export(&queue, &out.path().to_path_buf())
        .unwrap();

    let content = std::fs::read_to_string(out.path()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines[0], "id;status;Kundenname;internal_ref");
    assert_eq!(lines[1], "1;queued;acme;X-7");
    assert_eq!(lines[2], "2;queued;globex;");
}

#[test]
fn test_import_inside_batch_is_atomic_for_file_queue() {
    let harness = QueueHarness::new();
    let input = harness.write_file("in.csv", "id;v\n1;a\n2;b\n3;c\n");
    let queue = harness.file_queue("q.csv");

    Importer::new(MappingProfile::new().alias("id", &[]))
        .import(&queue, &input, false)
        .unwrap();

    // All three rows are durable after the single batched rewrite.
    let reloaded = FileQueue::load(&harness.path().join("q.csv"), None).unwrap();
    assert_eq!(reloaded.total_items().unwrap(), 3);
}
