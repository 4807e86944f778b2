//! Transactions, record locking and deadlock handling across threads.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stratum::{Db, DbConfig, DbError, Key};
use tempfile::TempDir;

const VALUE_LEN: usize = 64;

fn open_db(dir: &TempDir) -> (Arc<Db>, i64) {
    let mut config = DbConfig::new(
        32,
        dir.path().join("wal.log"),
        dir.path().join("trace.txt"),
    );
    config.tables = vec![dir.path().join("t.db")];
    (Arc::new(Db::open(config).unwrap()), 1)
}

fn value(key: Key, tag: u8) -> Vec<u8> {
    let mut v = vec![tag; VALUE_LEN];
    v[..8].copy_from_slice(&key.to_le_bytes());
    v
}

fn seed(db: &Db, table: i64, keys: std::ops::Range<Key>) {
    for k in keys {
        db.insert(table, k, &value(k, 0)).unwrap();
    }
}

#[test]
fn shared_readers_run_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let (db, table) = open_db(&dir);
    seed(&db, table, 0..100);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            let trx = db.trx_begin().unwrap();
            for k in 0..100 {
                assert_eq!(db.find_trx(table, k, trx).unwrap(), value(k, 0));
            }
            db.trx_commit(trx).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn committed_update_is_visible() {
    let dir = tempfile::tempdir().unwrap();
    let (db, table) = open_db(&dir);
    seed(&db, table, 0..10);

    let trx = db.trx_begin().unwrap();
    let old_size = db.update(table, 3, &value(3, 9), trx).unwrap();
    assert_eq!(old_size as usize, VALUE_LEN);
    db.trx_commit(trx).unwrap();

    assert_eq!(db.find(table, 3).unwrap(), value(3, 9));
}

#[test]
fn abort_restores_old_values() {
    let dir = tempfile::tempdir().unwrap();
    let (db, table) = open_db(&dir);
    seed(&db, table, 0..10);

    let trx = db.trx_begin().unwrap();
    for k in 0..3 {
        db.update(table, k, &value(k, 7), trx).unwrap();
    }
    db.trx_abort(trx).unwrap();

    for k in 0..3 {
        assert_eq!(db.find(table, k).unwrap(), value(k, 0));
    }
}

#[test]
fn writer_blocks_reader_until_commit() {
    let dir = tempfile::tempdir().unwrap();
    let (db, table) = open_db(&dir);
    seed(&db, table, 0..10);

    let writer = db.trx_begin().unwrap();
    db.update(table, 5, &value(5, 1), writer).unwrap();

    let db2 = Arc::clone(&db);
    let reader = thread::spawn(move || {
        let trx = db2.trx_begin().unwrap();
        let got = db2.find_trx(table, 5, trx).unwrap();
        db2.trx_commit(trx).unwrap();
        got
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!reader.is_finished(), "reader should wait for the X lock");

    db.trx_commit(writer).unwrap();
    assert_eq!(reader.join().unwrap(), value(5, 1));
}

#[test]
fn deadlock_aborts_exactly_one_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let (db, table) = open_db(&dir);
    seed(&db, table, 0..10);

    let t1 = db.trx_begin().unwrap();
    let t2 = db.trx_begin().unwrap();

    db.update(table, 1, &value(1, 1), t1).unwrap();
    db.update(table, 2, &value(2, 2), t2).unwrap();

    // t1 goes after t2's record in another thread and blocks.
    let db2 = Arc::clone(&db);
    let blocked = thread::spawn(move || db2.update(table, 2, &value(2, 1), t1));
    thread::sleep(Duration::from_millis(100));

    // t2 closing the cycle is the victim; it is rolled back synchronously.
    let err = db.update(table, 1, &value(1, 2), t2).unwrap_err();
    assert!(matches!(err, DbError::Deadlock(t) if t == t2));

    // t1's blocked update now goes through, and t1 can commit.
    blocked.join().unwrap().unwrap();
    db.trx_commit(t1).unwrap();

    // t1's writes stand, t2's rollback restored record 2 before t1's
    // second update landed on it.
    assert_eq!(db.find(table, 1).unwrap(), value(1, 1));
    assert_eq!(db.find(table, 2).unwrap(), value(2, 1));
}

#[test]
fn contending_writers_serialize_per_record() {
    let dir = tempfile::tempdir().unwrap();
    let (db, table) = open_db(&dir);
    seed(&db, table, 0..1);

    let mut handles = Vec::new();
    for tag in 1..=4u8 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            let trx = db.trx_begin().unwrap();
            db.update(table, 0, &value(0, tag), trx).unwrap();
            db.trx_commit(trx).unwrap();
            tag
        }));
    }
    let mut tags = Vec::new();
    for handle in handles {
        tags.push(handle.join().unwrap());
    }
    // Every writer committed; the record holds one of their values.
    let last = db.find(table, 0).unwrap();
    assert!(tags.iter().any(|&tag| last == value(0, tag)));
}
