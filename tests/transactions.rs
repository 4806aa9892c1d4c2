//! Cross-component scenarios: durability, recovery and visibility.

use std::thread;
use std::time::Duration;

use xmldb::db::{Database, DatabaseConfig};
use xmldb::journal::MemorySink;
use xmldb::storage::{CollectionConfig, CollectionPath, Content, DocumentName, DocumentPath};
use xmldb::DbError;

fn col(path: &str) -> CollectionPath {
    CollectionPath::new(path).unwrap()
}

fn doc(path: &str) -> DocumentPath {
    DocumentPath::parse(path).unwrap()
}

fn open(sink: &MemorySink) -> Database {
    Database::open_with_sink(DatabaseConfig::in_memory(), Box::new(sink.clone())).unwrap()
}

fn put(db: &Database, path: &str, xml: &str) {
    let path = doc(path);
    db.with_transaction(|tx| db.store().store(tx, &path.collection, &path.name, Content::xml(xml)))
        .unwrap();
}

#[test]
fn test_only_committed_work_survives_a_crash() {
    let sink = MemorySink::new();
    {
        let db = open(&sink);
        let kept = col("/db/kept");
        db.with_transaction(|tx| db.store().create_collection(tx, &kept)).unwrap();
        put(&db, "/db/kept/a.xml", "<a/>");

        // in flight when the process dies
        let mut tx = db.begin().unwrap();
        let lost = col("/db/lost");
        db.store().create_collection(&mut tx, &lost).unwrap();
        std::mem::forget(tx);
    }

    let db = open(&sink);
    assert!(db.store().collection_exists(&col("/db/kept")).unwrap());
    assert!(!db.store().collection_exists(&col("/db/lost")).unwrap());
    assert!(db.store().fetch_document(&doc("/db/kept/a.xml")).is_ok());
}

#[test]
fn test_rolled_back_operation_is_not_replayed() {
    let sink = MemorySink::new();
    {
        let db = open(&sink);
        let u = col("/db/u");
        db.with_transaction(|tx| db.store().create_collection(tx, &u)).unwrap();
        put(&db, "/db/u/a.xml", "<a/>");

        db.with_transaction(|tx| {
            let name = DocumentName::new("b.xml").unwrap();
            db.store().store(tx, &u, &name, Content::xml("<b/>"))?;
            // fails and rolls back on its own; b.xml stays
            let err = db.store().remove_document(tx, &doc("/db/u/missing.xml")).unwrap_err();
            assert!(err.is_not_found());
            Ok(())
        })
        .unwrap();
    }

    let db = open(&sink);
    let names: Vec<String> = db
        .with_transaction(|tx| db.store().list_documents(tx, &col("/db/u")))
        .unwrap()
        .into_iter()
        .map(|d| d.name.into_string())
        .collect();
    assert_eq!(names, vec!["a.xml", "b.xml"]);
}

#[test]
fn test_journal_write_failure_aborts_the_transaction() {
    let sink = MemorySink::new();
    let db = open(&sink);
    let u = col("/db/u");
    db.with_transaction(|tx| db.store().create_collection(tx, &u)).unwrap();

    let mut tx = db.begin().unwrap();
    sink.fail_writes(true);
    let name = DocumentName::new("a.xml").unwrap();
    let err = db.store().store(&mut tx, &u, &name, Content::xml("<a/>")).unwrap_err();
    assert!(matches!(err, DbError::IoFailure(_)));
    assert!(!tx.is_active());
    sink.fail_writes(false);

    assert!(db.store().fetch_document(&doc("/db/u/a.xml")).unwrap_err().is_not_found());
    assert_eq!(db.transactions().active_count(), 0);
}

#[test]
fn test_failed_commit_marker_discards_everything() {
    let sink = MemorySink::new();
    let db = open(&sink);
    let u = col("/db/u");
    db.with_transaction(|tx| db.store().create_collection(tx, &u)).unwrap();

    let mut tx = db.begin().unwrap();
    let name = DocumentName::new("a.xml").unwrap();
    db.store().store(&mut tx, &u, &name, Content::xml("<a/>")).unwrap();
    sink.fail_writes(true);
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, DbError::IoFailure(_)));
    sink.fail_writes(false);

    assert!(db.store().fetch_document(&doc("/db/u/a.xml")).unwrap_err().is_not_found());

    let reopened = open(&sink);
    assert!(reopened
        .store()
        .fetch_document(&doc("/db/u/a.xml"))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_commit_that_could_not_sync_stays_rolled_back_after_reopen() {
    let sink = MemorySink::new();
    let db = open(&sink);
    let u = col("/db/u");
    db.with_transaction(|tx| db.store().create_collection(tx, &u)).unwrap();

    let mut tx = db.begin().unwrap();
    let lost = DocumentName::new("lost.xml").unwrap();
    db.store().store(&mut tx, &u, &lost, Content::xml("<lost/>")).unwrap();
    sink.fail_syncs(true);
    let failed_seq = db.stats().commit_seq + 1;
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, DbError::IoFailure(_)));
    sink.fail_syncs(false);
    assert!(db.store().fetch_document(&doc("/db/u/lost.xml")).unwrap_err().is_not_found());

    let mut tx = db.begin().unwrap();
    let kept = DocumentName::new("kept.xml").unwrap();
    db.store().store(&mut tx, &u, &kept, Content::xml("<kept/>")).unwrap();
    assert!(tx.commit().unwrap() > failed_seq);

    let reopened = open(&sink);
    assert!(reopened
        .store()
        .fetch_document(&doc("/db/u/lost.xml"))
        .unwrap_err()
        .is_not_found());
    assert!(reopened.store().fetch_document(&doc("/db/u/kept.xml")).is_ok());
}

#[test]
fn test_index_visible_only_after_commit() {
    let db = Database::in_memory().unwrap();
    let plays = col("/db/plays");
    db.with_transaction(|tx| {
        db.store().create_collection(tx, &plays)?;
        db.store()
            .configure_collection(tx, &plays, Some(CollectionConfig::default().with_fulltext(["LINE"])))
    })
    .unwrap();

    let mut tx = db.begin().unwrap();
    let name = DocumentName::new("r3.xml").unwrap();
    db.store()
        .store(&mut tx, &plays, &name, Content::xml("<PLAY><LINE>my kingdom for a horse</LINE></PLAY>"))
        .unwrap();

    let reader = db.clone();
    let seen_before = std::thread::spawn(move || {
        reader
            .store()
            .query(&CollectionPath::root(), "fulltext", "LINE:horse")
            .unwrap()
            .len()
    })
    .join()
    .unwrap();
    assert_eq!(seen_before, 0);

    tx.commit().unwrap();
    let hits = db.store().query(&CollectionPath::root(), "fulltext", "LINE:horse").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, doc("/db/plays/r3.xml"));
}

#[test]
fn test_readers_never_list_uncommitted_members() {
    let db = Database::open(DatabaseConfig::in_memory().lock_timeout(Duration::from_secs(5))).unwrap();
    let c = col("/db/c");
    db.with_transaction(|tx| db.store().create_collection(tx, &c)).unwrap();
    put(&db, "/db/c/clean.xml", "<clean/>");

    let mut writer = db.begin().unwrap();
    let dirty = DocumentName::new("dirty.xml").unwrap();
    db.store().store(&mut writer, &c, &dirty, Content::xml("<dirty/>")).unwrap();
    db.store().create_collection(&mut writer, &col("/db/c/sub")).unwrap();

    let reader = {
        let db = db.clone();
        let c = c.clone();
        thread::spawn(move || {
            let names: Vec<String> = db
                .with_transaction(|tx| db.store().list_documents(tx, &c))
                .unwrap()
                .into_iter()
                .map(|d| d.name.to_string())
                .collect();
            let children = db
                .with_transaction(|tx| db.store().list_collections(tx, &c))
                .unwrap();
            let resolved = db.store().resolve("/db/c/dirty.xml");
            (names, children, resolved.map_err(|e| e.is_not_found()))
        })
    };

    // the reader is blocked on the writer's locks until it aborts
    thread::sleep(Duration::from_millis(100));
    assert!(!reader.is_finished());
    writer.abort();

    let (names, children, resolved) = reader.join().unwrap();
    assert_eq!(names, vec!["clean.xml".to_string()]);
    assert!(children.is_empty());
    assert_eq!(resolved, Err(true));
}

#[test]
fn test_on_disk_database_survives_close_and_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
        let u = col("/db/u");
        db.with_transaction(|tx| db.store().create_collection(tx, &u)).unwrap();
        put(&db, "/db/u/a.xml", "<a>1</a>");
        db.close().unwrap();
    }
    {
        let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
        put(&db, "/db/u/a.xml", "<a>2</a>");
    }

    let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();
    let current = db.store().fetch_document(&doc("/db/u/a.xml")).unwrap();
    assert_eq!(current.content.as_xml(), Some("<a>2</a>"));
    assert_eq!(current.version, 2);
}
