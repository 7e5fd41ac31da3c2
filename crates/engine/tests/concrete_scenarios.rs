//! Integration tests for the concrete scenarios enumerated alongside the
//! universal invariants: basic CRUD across a reopen, snapshot-isolation
//! conflicts, crash durability against a forged WAL frame, unique
//! constraints, GC horizon pinning by a read-only transaction, and vacuum
//! idempotence.

use tempfile::TempDir;

use galdr_common::GaldrError;
use galdrdb::{DocumentWrite, GaldrDb, IndexSpec, Options};

fn small_options() -> Options {
    Options {
        page_size: 4096,
        auto_gc: false,
        ..Options::default()
    }
}

#[test]
fn basic_crud_survives_reopen() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("people.galdr");

    {
        let db = GaldrDb::create(&path, small_options()).expect("create");
        db.ensure_collection("people", vec![IndexSpec::new("age", false)])
            .expect("ensure collection");

        let alice = DocumentWrite::new(br#"{"name":"Alice","age":30}"#.to_vec())
            .with_id(1)
            .with_index_key("age", b"30".to_vec());
        db.insert("people", alice).expect("insert alice");

        let bob = DocumentWrite::new(br#"{"name":"Bob","age":25}"#.to_vec())
            .with_id(2)
            .with_index_key("age", b"25".to_vec());
        db.insert("people", bob).expect("insert bob");

        db.replace(
            "people",
            1,
            br#"{"name":"Alice2","age":31}"#.to_vec(),
            vec![("age".to_string(), b"31".to_vec())],
        )
        .expect("replace alice");

        db.delete_by_id("people", 2).expect("delete bob");
        db.checkpoint().expect("checkpoint");
    }

    let db = GaldrDb::open(&path, small_options()).expect("reopen");
    let alice = db.get_by_id("people", 1).expect("get alice");
    assert_eq!(alice, Some(br#"{"name":"Alice2","age":31}"#.to_vec()));
    assert_eq!(db.get_by_id("people", 2).expect("get bob"), None);

    let hits = db
        .scan_index("people", "age", None, Some((b"30", false)))
        .expect("range scan");
    assert!(hits.is_empty(), "no document has age < 30 after the update");
}

#[test]
fn concurrent_writers_conflict_first_writer_wins() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("conflict.galdr");
    let db = GaldrDb::create(&path, small_options()).expect("create");
    db.ensure_collection("docs", vec![]).expect("ensure collection");
    db.insert("docs", DocumentWrite::new(b"v0".to_vec()).with_id(1))
        .expect("seed insert");

    let mut tx1 = db.begin_transaction();
    let mut tx2 = db.begin_transaction();

    tx2.replace("docs", 1, b"A".to_vec(), vec![]).expect("tx2 replace");
    let tx2_id = tx2.tx_id();
    tx2.commit().expect("tx2 commit");

    let err = tx1
        .replace("docs", 1, b"B".to_vec(), vec![])
        .expect_err("tx1 must see the conflict");
    match err {
        GaldrError::WriteConflict {
            collection,
            doc_id,
            conflicting_tx_id,
        } => {
            assert_eq!(collection, "docs");
            assert_eq!(doc_id, 1);
            assert_eq!(conflicting_tx_id, tx2_id);
        }
        other => panic!("expected WriteConflict, got {other:?}"),
    }
}

#[test]
fn uncommitted_wal_frame_is_not_applied_on_recovery() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("durable.galdr");
    let wal_path = path.with_extension("galdrwal");
    let page_size = small_options().page_size;

    {
        let db = GaldrDb::create(&path, small_options()).expect("create");
        db.ensure_collection("docs", vec![]).expect("ensure collection");
        db.insert("docs", DocumentWrite::new(b"Committed".to_vec()).with_id(1))
            .expect("insert");
        db.checkpoint().expect("checkpoint");
    }

    {
        let writer = galdr_wal::WalWriter::open(&wal_path, page_size).expect("reopen wal");
        let forged_payload = vec![0xFFu8; page_size as usize];
        writer
            .write_frame(9_999, 0, galdr_common::PageType::Document, &forged_payload, galdr_wal::FrameFlags::NONE)
            .expect("write forged frame");
        writer.flush().expect("flush forged frame");
    }

    let db = GaldrDb::open(&path, small_options()).expect("reopen after forged frame");
    let doc = db.get_by_id("docs", 1).expect("get doc");
    assert_eq!(doc, Some(b"Committed".to_vec()));
}

#[test]
fn unique_constraint_blocks_duplicate_then_allows_after_delete() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("unique.galdr");
    let db = GaldrDb::create(&path, small_options()).expect("create");
    db.ensure_collection("users", vec![IndexSpec::new("email", true)])
        .expect("ensure collection");

    let first = DocumentWrite::new(b"first".to_vec()).with_index_key("email", b"a@x".to_vec());
    let first_id = db.insert("users", first).expect("first insert");

    let dup = DocumentWrite::new(b"dup".to_vec()).with_index_key("email", b"a@x".to_vec());
    let err = db.insert("users", dup).expect_err("duplicate email must be rejected");
    match err {
        GaldrError::UniqueConstraintViolation { field, value } => {
            assert_eq!(field, "email");
            assert_eq!(value, "a@x");
        }
        other => panic!("expected UniqueConstraintViolation, got {other:?}"),
    }

    db.delete_by_id("users", first_id).expect("delete first");
    let retry = DocumentWrite::new(b"second".to_vec()).with_index_key("email", b"a@x".to_vec());
    db.insert("users", retry).expect("insert after delete succeeds");
}

#[test]
fn gc_horizon_respects_active_read_only_snapshot() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("gc.galdr");
    let db = GaldrDb::create(&path, small_options()).expect("create");
    db.ensure_collection("docs", vec![]).expect("ensure collection");
    db.insert("docs", DocumentWrite::new(b"v1".to_vec()).with_id(1))
        .expect("insert v1");

    let reader = db.begin_read_only_transaction();
    db.replace("docs", 1, b"v2".to_vec(), vec![]).expect("replace to v2");

    let report = db.vacuum().expect("vacuum while reader pins v1");
    assert_eq!(report.versions_collected, 0, "reader still needs v1");

    assert_eq!(reader.get_by_id("docs", 1).expect("reader read"), Some(b"v1".to_vec()));
    reader.rollback();

    let report = db.vacuum().expect("vacuum after reader ends");
    assert!(report.versions_collected >= 1, "v1 is now collectable");

    let report = db.vacuum().expect("second vacuum");
    assert_eq!(report.versions_collected, 0);
    assert_eq!(report.pages_compacted, 0);
}

#[test]
fn gc_horizon_uses_snapshot_not_tx_id_of_later_reader() {
    // Writer begins first and buffers a write, so its tx_id is smaller than
    // the reader's even though the reader starts (and snapshots) before the
    // writer commits. The GC horizon must track the reader's *snapshot*, not
    // its tx_id, or it collects a version the reader still needs.
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("gc_order.galdr");
    let db = GaldrDb::create(&path, small_options()).expect("create");
    db.ensure_collection("docs", vec![]).expect("ensure collection");
    db.insert("docs", DocumentWrite::new(b"v1".to_vec()).with_id(1))
        .expect("insert v1");

    let mut writer = db.begin_transaction();
    writer
        .replace("docs", 1, b"v2".to_vec(), vec![])
        .expect("buffer replace");

    let reader = db.begin_read_only_transaction();
    assert!(reader.tx_id() > writer.tx_id());

    writer.commit().expect("writer commits, installing v2");

    // Only the reader is active now, with a snapshot predating the commit.
    let report = db.vacuum().expect("vacuum while reader pins v1");
    assert_eq!(report.versions_collected, 0, "reader snapshot still needs v1");

    assert_eq!(reader.get_by_id("docs", 1).expect("reader read"), Some(b"v1".to_vec()));
    reader.rollback();

    let report = db.vacuum().expect("vacuum after reader ends");
    assert!(report.versions_collected >= 1, "v1 is now collectable");
}

#[test]
fn compact_to_preserves_doc_ids_and_drops_dead_versions() {
    let dir = TempDir::new().expect("temp dir");
    let source_path = dir.path().join("source.galdr");
    let target_path = dir.path().join("target.galdr");

    let db = GaldrDb::create(&source_path, small_options()).expect("create");
    db.ensure_collection("docs", vec![IndexSpec::new("k", false)])
        .expect("ensure collection");
    db.insert(
        "docs",
        DocumentWrite::new(b"keep".to_vec()).with_id(1).with_index_key("k", b"1".to_vec()),
    )
    .expect("insert keep");
    db.insert(
        "docs",
        DocumentWrite::new(b"gone".to_vec()).with_id(2).with_index_key("k", b"2".to_vec()),
    )
    .expect("insert gone");
    db.delete_by_id("docs", 2).expect("delete gone");

    let report = db.compact_to(&target_path).expect("compact");
    assert_eq!(report.collections_copied, 1);
    assert_eq!(report.documents_copied, 1);

    let target = GaldrDb::open(&target_path, small_options()).expect("open target");
    assert_eq!(target.get_by_id("docs", 1).expect("get 1"), Some(b"keep".to_vec()));
    assert_eq!(target.get_by_id("docs", 2).expect("get 2"), None);
}
