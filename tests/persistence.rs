//! Round-trip laws: reopened stores serve the same bytes, sync makes
//! writes durable, destroyed databases come back fresh, and closing
//! without an explicit sync still leaves a consistent file.

use skipstore::{CursorOp, DbFlags, Error, PutFlags, Store, SyncFlags};
use tempfile::tempdir;

#[test]
fn reopen_returns_identical_contents() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.skp");

    {
        let store = Store::builder().path(&path).random_seed(11).open().unwrap();
        let db = store.db(1, DbFlags::empty()).unwrap();
        for i in 0..300u32 {
            let key = format!("key{i:05}");
            let val = format!("val{i:05}");
            db.put(key.as_bytes(), val.as_bytes()).unwrap();
        }
        store.sync(SyncFlags::empty()).unwrap();
        store.close().unwrap();
    }

    let store = Store::open(&path).unwrap();
    let db = store.db(1, DbFlags::empty()).unwrap();
    for i in 0..300u32 {
        let key = format!("key{i:05}");
        let val = format!("val{i:05}");
        assert_eq!(db.get(key.as_bytes()).unwrap(), val.into_bytes());
    }

    // Ordered traversal is intact as well.
    let mut count = 0;
    let mut cur = db.cursor(CursorOp::BeforeFirst, None).unwrap();
    let mut prev = Vec::new();
    while cur.to(CursorOp::Next).is_ok() {
        let key = cur.key().unwrap();
        assert!(key > prev);
        prev = key;
        count += 1;
    }
    assert_eq!(count, 300);

    store.close().unwrap();
}

#[test]
fn close_and_reopen_is_a_noop_on_contents() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("noop.skp");

    {
        let store = Store::open(&path).unwrap();
        let db = store.db(1, DbFlags::empty()).unwrap();
        db.put(b"k", b"v").unwrap();
        store.close().unwrap();
    }
    let first = std::fs::read(&path).unwrap();

    {
        let store = Store::open(&path).unwrap();
        store.close().unwrap();
    }
    let second = std::fs::read(&path).unwrap();

    assert_eq!(first, second);
}

#[test]
fn put_with_sync_flag_is_durable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sync.skp");

    {
        let store = Store::open(&path).unwrap();
        let db = store.db(1, DbFlags::empty()).unwrap();
        db.put_with(b"k", b"durable", PutFlags::SYNC).unwrap();
        store.close().unwrap();
    }

    let store = Store::open(&path).unwrap();
    let db = store.db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.get(b"k").unwrap(), b"durable");
    store.close().unwrap();
}

#[test]
fn unsynced_writes_survive_handle_drop() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("drop.skp");

    {
        let store = Store::open(&path).unwrap();
        let db = store.db(1, DbFlags::empty()).unwrap();
        for i in 0..100u32 {
            let key = format!("key{i:04}");
            db.put(key.as_bytes(), b"payload").unwrap();
        }
        // No sync, no close: Drop flushes best-effort.
    }

    let store = Store::open(&path).unwrap();
    let db = store.db(1, DbFlags::empty()).unwrap();
    let mut cur = db.cursor(CursorOp::BeforeFirst, None).unwrap();
    let mut count = 0;
    while cur.to(CursorOp::Next).is_ok() {
        let (_, v) = cur.get().unwrap();
        assert_eq!(v, b"payload");
        count += 1;
    }
    assert_eq!(count, 100);
    store.close().unwrap();
}

#[test]
fn database_flags_persist_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("flags.skp");

    {
        let store = Store::open(&path).unwrap();
        store.db(7, DbFlags::UINT32_KEYS).unwrap();
        store.close().unwrap();
    }

    let store = Store::open(&path).unwrap();
    let err = store.db(7, DbFlags::empty()).unwrap_err();
    assert!(matches!(err, Error::IncompatibleDbMode));
    store.db(7, DbFlags::UINT32_KEYS).unwrap();
    store.close().unwrap();
}

#[test]
fn destroy_then_recreate_behaves_fresh() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fresh.skp");

    let store = Store::open(&path).unwrap();
    let db = store.db(1, DbFlags::empty()).unwrap();
    for i in 0..100u32 {
        let key = format!("key{i:04}");
        db.put(key.as_bytes(), b"old").unwrap();
    }
    let grown = store.file_size().unwrap();
    db.destroy().unwrap();

    let db = store.db(1, DbFlags::empty()).unwrap();
    assert!(matches!(db.get(b"key0000"), Err(Error::NotFound)));
    let mut cur = db.cursor(CursorOp::BeforeFirst, None).unwrap();
    assert!(matches!(cur.to(CursorOp::Next), Err(Error::NotFound)));

    // Freed blocks are recycled: refilling does not grow the file.
    for i in 0..100u32 {
        let key = format!("key{i:04}");
        db.put(key.as_bytes(), b"new").unwrap();
    }
    assert!(store.file_size().unwrap() <= grown + 4 * 4096);
    assert_eq!(db.get(b"key0000").unwrap(), b"new");

    store.close().unwrap();
}

#[test]
fn destroy_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dropped.skp");

    {
        let store = Store::open(&path).unwrap();
        let db = store.db(3, DbFlags::empty()).unwrap();
        db.put(b"k", b"v").unwrap();
        db.destroy().unwrap();
        store.close().unwrap();
    }

    let store = Store::open(&path).unwrap();
    // A different flag set is accepted now: the old database is gone.
    let db = store.db(3, DbFlags::UINT32_KEYS).unwrap();
    assert!(matches!(
        db.get(&1u32.to_be_bytes()),
        Err(Error::NotFound)
    ));
    store.close().unwrap();
}

#[test]
fn last_access_time_is_persisted_on_close() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("atime.skp");

    {
        let store = Store::open(&path).unwrap();
        let db = store.db(1, DbFlags::empty()).unwrap();
        db.put(b"k", b"v").unwrap();
        assert!(db.last_access_time() > 0);
        store.close().unwrap();
    }

    let store = Store::open(&path).unwrap();
    let db = store.db(1, DbFlags::empty()).unwrap();
    assert!(db.last_access_time() > 0);
    store.close().unwrap();
}
