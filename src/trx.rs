//! Transactions: begin/commit/abort, strict two-phase locking, and
//! deadlock handling.
//!
//! The manager keeps one table of live transactions (held locks, undo
//! stack, last LSN) and the wait-for graph. A lock request inserts its
//! edges and runs a cycle check *before* blocking; if the request would
//! close a cycle, the requester itself is rolled back and the caller gets
//! `DbError::Deadlock`. Locks are held until commit or abort.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::BufferManager;
use crate::errors::{DbError, Result};
use crate::lock_table::{LockId, LockMode, LockRequest, LockTable};
use crate::log::{LogBody, LogManager, UpdateBody};
use crate::{Key, Lsn, PageNum, TableId, TrxId};

/// Pre-image of one updated record, captured before the bytes change.
#[derive(Debug, Clone)]
pub struct UndoImage {
    pub table: TableId,
    pub page: PageNum,
    pub offset: u16,
    pub old: Vec<u8>,
    /// The transaction's previous LSN at the time of the update; becomes
    /// the next-undo pointer of the compensation record.
    pub prev_lsn: Lsn,
}

#[derive(Debug, Default)]
struct Transaction {
    locks: Vec<LockId>,
    undo: Vec<UndoImage>,
    last_lsn: Lsn,
}

struct TrxState {
    next_id: TrxId,
    table: HashMap<TrxId, Transaction>,
    waits_for: HashMap<TrxId, HashSet<TrxId>>,
}

pub struct TrxManager {
    state: Mutex<TrxState>,
}

impl Default for TrxManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TrxManager {
    pub fn new() -> Self {
        TrxManager {
            state: Mutex::new(TrxState {
                next_id: 1,
                table: HashMap::new(),
                waits_for: HashMap::new(),
            }),
        }
    }

    /// Starts a transaction and logs its Begin record.
    pub fn begin(&self, log: &LogManager) -> Result<TrxId> {
        let trx = {
            let mut state = self.state.lock();
            let trx = state.next_id;
            state.next_id += 1;
            state.table.insert(trx, Transaction::default());
            trx
        };
        let lsn = log.append(trx, 0, LogBody::Begin)?;
        self.set_last_lsn(trx, lsn)?;
        debug!(trx, "begin");
        Ok(trx)
    }

    pub fn is_active(&self, trx: TrxId) -> bool {
        self.state.lock().table.contains_key(&trx)
    }

    pub fn last_lsn(&self, trx: TrxId) -> Result<Lsn> {
        let state = self.state.lock();
        state
            .table
            .get(&trx)
            .map(|t| t.last_lsn)
            .ok_or(DbError::UnknownTransaction(trx))
    }

    pub fn set_last_lsn(&self, trx: TrxId, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        state
            .table
            .get_mut(&trx)
            .map(|t| t.last_lsn = lsn)
            .ok_or(DbError::UnknownTransaction(trx))
    }

    /// Records a pre-image to replay if the transaction aborts.
    pub fn push_undo(&self, trx: TrxId, image: UndoImage) -> Result<()> {
        let mut state = self.state.lock();
        state
            .table
            .get_mut(&trx)
            .map(|t| t.undo.push(image))
            .ok_or(DbError::UnknownTransaction(trx))
    }

    /// Acquires a record lock for `trx`, blocking until granted.
    ///
    /// Before blocking, the request's wait-for edges go into the graph and
    /// a cycle check runs; a request that would close a cycle rolls the
    /// requester back instead of waiting.
    ///
    /// Locks are keyed by `(table, page, record)`, so the caller must
    /// ensure the record stays on `page` while the lock is held:
    /// structural operations that relocate records must not interleave
    /// with transactions holding locks on the affected leaves.
    pub fn get_lock(
        &self,
        trx: TrxId,
        table: TableId,
        page: PageNum,
        record: Key,
        mode: LockMode,
        locks: &LockTable,
        buffer: &BufferManager,
        log: &LogManager,
    ) -> Result<()> {
        if !self.is_active(trx) {
            return Err(DbError::UnknownTransaction(trx));
        }
        let id = match locks.request(table, page, record, trx, mode) {
            LockRequest::Covered => return Ok(()),
            LockRequest::Enqueued(id) => id,
        };
        {
            let mut state = self.state.lock();
            match state.table.get_mut(&trx) {
                Some(t) => t.locks.push(id),
                None => return Err(DbError::UnknownTransaction(trx)),
            }
        }

        let holders = locks.conflicting_holders(id);
        if !holders.is_empty() {
            let mut state = self.state.lock();
            state.waits_for.insert(trx, holders.into_iter().collect());
            if has_cycle(&state.waits_for, trx) {
                state.waits_for.remove(&trx);
                drop(state);
                warn!(trx, "deadlock detected, aborting requester");
                self.abort(trx, locks, buffer, log)?;
                return Err(DbError::Deadlock(trx));
            }
        }

        locks.wait_granted(id);
        self.state.lock().waits_for.remove(&trx);
        Ok(())
    }

    /// Commits: logs Commit, forces the log, then releases every lock.
    pub fn commit(&self, trx: TrxId, locks: &LockTable, log: &LogManager) -> Result<()> {
        let transaction = {
            let mut state = self.state.lock();
            state.waits_for.remove(&trx);
            state
                .table
                .remove(&trx)
                .ok_or(DbError::UnknownTransaction(trx))?
        };
        log.append(trx, transaction.last_lsn, LogBody::Commit)?;
        log.flush()?;
        for id in transaction.locks {
            locks.release(id);
        }
        debug!(trx, "commit");
        Ok(())
    }

    /// Aborts: replays the undo stack newest-first (one Compensate record
    /// per restored pre-image), logs Rollback, forces the log, releases
    /// every lock.
    pub fn abort(
        &self,
        trx: TrxId,
        locks: &LockTable,
        buffer: &BufferManager,
        log: &LogManager,
    ) -> Result<()> {
        let transaction = {
            let mut state = self.state.lock();
            state.waits_for.remove(&trx);
            state
                .table
                .remove(&trx)
                .ok_or(DbError::UnknownTransaction(trx))?
        };

        let mut last_lsn = transaction.last_lsn;
        for image in transaction.undo.iter().rev() {
            let frame = buffer.fetch(image.table, image.page)?;
            let current = {
                let page = frame.read();
                page.record(image.offset, image.old.len() as u16).to_vec()
            };
            let clr_lsn = log.append(
                trx,
                last_lsn,
                LogBody::Compensate {
                    body: UpdateBody {
                        table: image.table,
                        page: image.page,
                        offset: image.offset,
                        old: current,
                        new: image.old.clone(),
                    },
                    next_undo: image.prev_lsn,
                },
            )?;
            {
                let mut page = frame.write();
                page.set_record(image.offset, &image.old);
                page.set_page_lsn(clr_lsn);
            }
            last_lsn = clr_lsn;
        }

        log.append(trx, last_lsn, LogBody::Rollback)?;
        log.flush()?;
        for id in transaction.locks {
            locks.release(id);
        }
        debug!(trx, undone = transaction.undo.len(), "abort");
        Ok(())
    }
}

/// Depth-first walk of the wait-for graph looking for a path from `start`
/// back to itself.
fn has_cycle(waits_for: &HashMap<TrxId, HashSet<TrxId>>, start: TrxId) -> bool {
    let mut stack = vec![start];
    let mut visited = HashSet::new();
    while let Some(trx) = stack.pop() {
        if let Some(next) = waits_for.get(&trx) {
            for &n in next {
                if n == start {
                    return true;
                }
                if visited.insert(n) {
                    stack.push(n);
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskManager;
    use crate::log::LogRecord;

    fn graph(edges: &[(TrxId, TrxId)]) -> HashMap<TrxId, HashSet<TrxId>> {
        let mut waits: HashMap<TrxId, HashSet<TrxId>> = HashMap::new();
        for &(from, to) in edges {
            waits.entry(from).or_default().insert(to);
        }
        waits
    }

    #[test]
    fn cycle_detection() {
        assert!(!has_cycle(&graph(&[(1, 2), (2, 3)]), 1));
        assert!(has_cycle(&graph(&[(1, 2), (2, 1)]), 1));
        assert!(has_cycle(&graph(&[(1, 2), (2, 3), (3, 1)]), 1));
        // A cycle the requester is not part of does not abort it.
        assert!(!has_cycle(&graph(&[(1, 2), (2, 3), (3, 2)]), 1));
    }

    fn fixture() -> (tempfile::TempDir, BufferManager, LogManager, TableId) {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = DiskManager::new();
        let table = disk.open_table(dir.path().join("t.db")).unwrap();
        let buffer = BufferManager::new(disk, 8, None);
        let log = LogManager::open(dir.path().join("wal.log"), dir.path().join("trace.txt"))
            .unwrap();
        (dir, buffer, log, table)
    }

    #[test]
    fn begin_and_commit_chain_log_records() {
        let (_dir, _buffer, log, _table) = fixture();
        let locks = LockTable::new();
        let trx_mgr = TrxManager::new();

        let trx = trx_mgr.begin(&log).unwrap();
        trx_mgr.commit(trx, &locks, &log).unwrap();
        assert!(!trx_mgr.is_active(trx));

        let records: Vec<LogRecord> = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].body, LogBody::Begin));
        assert!(matches!(records[1].body, LogBody::Commit));
        assert_eq!(records[1].prev_lsn, records[0].lsn);
    }

    #[test]
    fn abort_restores_pre_images_and_logs_compensation() {
        let (_dir, buffer, log, table) = fixture();
        let locks = LockTable::new();
        let trx_mgr = TrxManager::new();

        let trx = trx_mgr.begin(&log).unwrap();
        let prev = trx_mgr.last_lsn(trx).unwrap();

        // Simulate one logged update to page 1.
        let offset = 4000u16;
        let old = b"old bytes!".to_vec();
        let new = b"new bytes!".to_vec();
        {
            let frame = buffer.fetch(table, 1).unwrap();
            frame.write().set_record(offset, &old);
        }
        let lsn = log
            .append(
                trx,
                prev,
                LogBody::Update(UpdateBody {
                    table,
                    page: 1,
                    offset,
                    old: old.clone(),
                    new: new.clone(),
                }),
            )
            .unwrap();
        trx_mgr.set_last_lsn(trx, lsn).unwrap();
        trx_mgr
            .push_undo(
                trx,
                UndoImage {
                    table,
                    page: 1,
                    offset,
                    old: old.clone(),
                    prev_lsn: prev,
                },
            )
            .unwrap();
        {
            let frame = buffer.fetch(table, 1).unwrap();
            let mut page = frame.write();
            page.set_record(offset, &new);
            page.set_page_lsn(lsn);
        }

        trx_mgr.abort(trx, &locks, &buffer, &log).unwrap();

        let frame = buffer.fetch(table, 1).unwrap();
        assert_eq!(frame.read().record(offset, old.len() as u16), &old[..]);

        let records = log.read_all().unwrap();
        let compensate = records
            .iter()
            .find(|r| matches!(r.body, LogBody::Compensate { .. }))
            .unwrap();
        match &compensate.body {
            LogBody::Compensate { body, next_undo } => {
                assert_eq!(body.new, old);
                assert_eq!(*next_undo, prev);
            }
            _ => unreachable!(),
        }
        assert!(matches!(
            records.last().unwrap().body,
            LogBody::Rollback
        ));
    }

    #[test]
    fn deadlock_aborts_the_requester() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let (_dir, buffer, log, table) = fixture();
        let buffer = Arc::new(buffer);
        let log = Arc::new(log);
        let locks = Arc::new(LockTable::new());
        let trx_mgr = Arc::new(TrxManager::new());

        let t1 = trx_mgr.begin(&log).unwrap();
        let t2 = trx_mgr.begin(&log).unwrap();

        // t1 holds record 1, t2 holds record 2.
        trx_mgr
            .get_lock(t1, table, 1, 1, LockMode::Exclusive, &locks, &buffer, &log)
            .unwrap();
        trx_mgr
            .get_lock(t2, table, 1, 2, LockMode::Exclusive, &locks, &buffer, &log)
            .unwrap();

        // t1 blocks on record 2 in a helper thread.
        let (mgr2, locks2, buf2, log2) = (
            Arc::clone(&trx_mgr),
            Arc::clone(&locks),
            Arc::clone(&buffer),
            Arc::clone(&log),
        );
        let blocked = thread::spawn(move || {
            mgr2.get_lock(t1, table, 1, 2, LockMode::Exclusive, &locks2, &buf2, &log2)
        });
        thread::sleep(Duration::from_millis(50));

        // t2 requesting record 1 closes the cycle and must die.
        let err = trx_mgr
            .get_lock(t2, table, 1, 1, LockMode::Exclusive, &locks, &buffer, &log)
            .unwrap_err();
        assert!(matches!(err, DbError::Deadlock(t) if t == t2));
        assert!(!trx_mgr.is_active(t2));

        // t2's rollback released its locks, so t1 gets record 2.
        blocked.join().unwrap().unwrap();
        trx_mgr.commit(t1, &locks, &log).unwrap();
    }
}
