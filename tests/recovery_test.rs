//! Crash recovery: dropping a `Db` without `shutdown` abandons the buffer
//! pool and any uncommitted transaction, which is how a crash looks to the
//! next open.

use std::path::PathBuf;

use stratum::{Db, DbConfig, DbError, Key};
use tempfile::TempDir;

const VALUE_LEN: usize = 64;

fn config(dir: &TempDir) -> DbConfig {
    let mut config = DbConfig::new(
        32,
        dir.path().join("wal.log"),
        dir.path().join("trace.txt"),
    );
    config.tables = vec![dir.path().join("t.db")];
    config
}

fn value(key: Key, tag: u8) -> Vec<u8> {
    let mut v = vec![tag; VALUE_LEN];
    v[..8].copy_from_slice(&key.to_le_bytes());
    v
}

fn log_len(dir: &TempDir) -> u64 {
    std::fs::metadata(dir.path().join("wal.log")).unwrap().len()
}

/// Seeds keys 0..n durably (inserts are structural, so they are carried by
/// a page flush rather than the log).
fn seed(db: &Db, table: i64, n: Key) {
    for k in 0..n {
        db.insert(table, k, &value(k, 0)).unwrap();
    }
    db.flush_all().unwrap();
}

#[test]
fn committed_updates_survive_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let table = 1;

    {
        let db = Db::open(config(&dir)).unwrap();
        seed(&db, table, 50);

        let trx = db.trx_begin().unwrap();
        for k in 20..25 {
            db.update(table, k, &value(k, 9), trx).unwrap();
        }
        db.trx_commit(trx).unwrap();
        // Crash: no page flush, no shutdown.
        drop(db);
    }

    let db = Db::open(config(&dir)).unwrap();
    for k in 0..50 {
        let expected = if (20..25).contains(&k) {
            value(k, 9)
        } else {
            value(k, 0)
        };
        assert_eq!(db.find(table, k).unwrap(), expected, "key {k}");
    }
}

#[test]
fn uncommitted_updates_roll_back_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let table = 1;

    {
        let db = Db::open(config(&dir)).unwrap();
        seed(&db, table, 50);

        // Loser: updates but never commits.
        let loser = db.trx_begin().unwrap();
        for k in 0..10 {
            db.update(table, k, &value(k, 7), loser).unwrap();
        }
        // Winner: its commit forces the log, making the loser's updates
        // durable too.
        let winner = db.trx_begin().unwrap();
        for k in 20..25 {
            db.update(table, k, &value(k, 9), winner).unwrap();
        }
        db.trx_commit(winner).unwrap();
        drop(db);
    }

    let db = Db::open(config(&dir)).unwrap();
    for k in 0..50 {
        let expected = if (20..25).contains(&k) {
            value(k, 9)
        } else {
            value(k, 0) // loser's writes are gone
        };
        assert_eq!(db.find(table, k).unwrap(), expected, "key {k}");
    }
}

#[test]
fn recovery_is_idempotent_across_repeated_crashes() {
    let dir = tempfile::tempdir().unwrap();
    let table = 1;

    {
        let db = Db::open(config(&dir)).unwrap();
        seed(&db, table, 30);
        let loser = db.trx_begin().unwrap();
        db.update(table, 3, &value(3, 7), loser).unwrap();
        let winner = db.trx_begin().unwrap();
        db.update(table, 4, &value(4, 9), winner).unwrap();
        db.trx_commit(winner).unwrap();
        drop(db);
    }

    // First recovery rolls the loser back, then crash again right away.
    {
        let db = Db::open(config(&dir)).unwrap();
        assert_eq!(db.find(table, 3).unwrap(), value(3, 0));
        assert_eq!(db.find(table, 4).unwrap(), value(4, 9));
        drop(db);
    }

    // Second recovery sees the loser's Rollback record, finds no losers,
    // and truncates the log down to a checkpoint.
    let before = log_len(&dir);
    {
        let db = Db::open(config(&dir)).unwrap();
        assert_eq!(db.find(table, 3).unwrap(), value(3, 0));
        assert_eq!(db.find(table, 4).unwrap(), value(4, 9));
        assert!(log_len(&dir) < before);
        db.shutdown().unwrap();
    }
}

#[test]
fn clean_shutdown_truncates_on_next_open() {
    let dir = tempfile::tempdir().unwrap();
    let table = 1;

    {
        let db = Db::open(config(&dir)).unwrap();
        seed(&db, table, 10);
        let trx = db.trx_begin().unwrap();
        db.update(table, 1, &value(1, 5), trx).unwrap();
        db.trx_commit(trx).unwrap();
        db.shutdown().unwrap();
    }
    let before = log_len(&dir);
    assert!(before > 0);

    let db = Db::open(config(&dir)).unwrap();
    assert_eq!(db.find(table, 1).unwrap(), value(1, 5));
    assert!(log_len(&dir) < before);
}

#[test]
fn committed_updates_survive_truncating_restarts() {
    // A truncating recovery must not rewind the LSN counter below the page
    // LSNs already on disk; redo would then mistake later committed
    // updates for already-applied history and skip them.
    let dir = tempfile::tempdir().unwrap();
    let table = 1;

    {
        let db = Db::open(config(&dir)).unwrap();
        seed(&db, table, 10);
        let trx = db.trx_begin().unwrap();
        for k in 0..5 {
            db.update(table, k, &value(k, 2), trx).unwrap();
        }
        db.trx_commit(trx).unwrap();
        drop(db);
    }

    // Clean recovery: no losers, so the log gets truncated.
    {
        let db = Db::open(config(&dir)).unwrap();
        assert_eq!(db.find(table, 0).unwrap(), value(0, 2));
        drop(db);
    }

    // New committed updates after the truncation, then another crash.
    {
        let db = Db::open(config(&dir)).unwrap();
        let trx = db.trx_begin().unwrap();
        for k in 0..5 {
            db.update(table, k, &value(k, 9), trx).unwrap();
        }
        db.trx_commit(trx).unwrap();
        drop(db);
    }

    let db = Db::open(config(&dir)).unwrap();
    for k in 0..5 {
        assert_eq!(db.find(table, k).unwrap(), value(k, 9), "key {k}");
    }
}

#[test]
fn recovery_writes_a_trace() {
    let dir = tempfile::tempdir().unwrap();
    let table = 1;

    {
        let db = Db::open(config(&dir)).unwrap();
        seed(&db, table, 10);
        let loser = db.trx_begin().unwrap();
        db.update(table, 0, &value(0, 7), loser).unwrap();
        db.flush_all().unwrap();
        drop(db);
    }

    let db = Db::open(config(&dir)).unwrap();
    assert_eq!(db.find(table, 0).unwrap(), value(0, 0));

    let trace = std::fs::read_to_string(dir.path().join("trace.txt")).unwrap();
    assert!(trace.contains("[ANALYSIS]"));
    assert!(trace.contains("[REDO]"));
    assert!(trace.contains("[UNDO]"));
    assert!(trace.contains("loser transactions: 1"));
}

#[test]
fn abandoned_transaction_rolls_back_even_after_page_flush() {
    // The dirty pages hit disk before the crash; undo still restores the
    // pre-images because the loser never committed.
    let dir = tempfile::tempdir().unwrap();
    let table = 1;

    {
        let db = Db::open(config(&dir)).unwrap();
        seed(&db, table, 20);
        let loser = db.trx_begin().unwrap();
        for k in 5..9 {
            db.update(table, k, &value(k, 7), loser).unwrap();
        }
        db.flush_all().unwrap(); // WAL rule forces the log out first
        drop(db);
    }

    let db = Db::open(config(&dir)).unwrap();
    for k in 0..20 {
        assert_eq!(db.find(table, k).unwrap(), value(k, 0), "key {k}");
    }
}

#[test]
fn missing_table_path_fails_cleanly() {
    // Recovery needs the referenced tables; a config with a bogus list is
    // an error, not a panic.
    let dir = tempfile::tempdir().unwrap();
    let mut bad = config(&dir);
    bad.tables = vec![PathBuf::from("/nonexistent-dir/t.db")];
    assert!(matches!(Db::open(bad), Err(DbError::Io(_))));
}
