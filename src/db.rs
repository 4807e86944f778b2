//! The engine context and its public operations.
//!
//! `Db` owns every manager; there is no global state. All methods take
//! `&self` (the managers synchronize internally), so a `Db` can be shared
//! across threads behind an `Arc` with one thread per transaction.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::btree;
use crate::buffer::BufferManager;
use crate::disk::DiskManager;
use crate::errors::{DbError, Result};
use crate::lock_table::{LockMode, LockTable};
use crate::page::MAX_RECORD_SIZE;
use crate::log::{LogBody, LogManager, RecoverySummary, UpdateBody};
use crate::trx::{TrxManager, UndoImage};
use crate::{Key, TableId, TrxId};

/// Startup configuration for [`Db::open`].
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Number of buffer pool frames.
    pub buffer_capacity: usize,
    pub log_path: PathBuf,
    /// Human-readable recovery trace, one line per recovery step.
    pub trace_path: PathBuf,
    /// Table files opened before recovery runs. Ids are assigned in order
    /// starting at 1, so a restart that lists the same files in the same
    /// order sees the same ids the log records were written with.
    pub tables: Vec<PathBuf>,
    /// Run analysis/redo/undo over the existing log at open.
    pub recover: bool,
    /// Record size policy, bounds inclusive.
    pub min_value_size: u16,
    pub max_value_size: u16,
}

impl DbConfig {
    pub fn new(
        buffer_capacity: usize,
        log_path: impl Into<PathBuf>,
        trace_path: impl Into<PathBuf>,
    ) -> Self {
        DbConfig {
            buffer_capacity,
            log_path: log_path.into(),
            trace_path: trace_path.into(),
            tables: Vec::new(),
            recover: true,
            min_value_size: 50,
            max_value_size: 112,
        }
    }
}

pub struct Db {
    buffer: BufferManager,
    locks: LockTable,
    trx: TrxManager,
    log: Arc<LogManager>,
    /// Serializes structural tree operations (insert/delete); record reads
    /// and updates go through the record locks instead.
    tree_latch: Mutex<()>,
    min_value_size: u16,
    max_value_size: u16,
}

impl Db {
    /// Opens the engine: table files first, then the log, then recovery
    /// (when enabled and the log is non-empty).
    pub fn open(config: DbConfig) -> Result<Db> {
        if config.min_value_size == 0
            || config.min_value_size > config.max_value_size
            || config.max_value_size > MAX_RECORD_SIZE
        {
            return Err(DbError::InvalidConfig(format!(
                "record size bounds {}..={} must lie within 1..={}",
                config.min_value_size, config.max_value_size, MAX_RECORD_SIZE
            )));
        }
        let mut disk = DiskManager::new();
        for path in &config.tables {
            disk.open_table(path)?;
        }
        let log = Arc::new(LogManager::open(&config.log_path, &config.trace_path)?);
        let buffer = BufferManager::new(disk, config.buffer_capacity, Some(Arc::clone(&log)));
        if config.recover {
            log.recover(&buffer)?;
        }
        Ok(Db {
            buffer,
            locks: LockTable::new(),
            trx: TrxManager::new(),
            log,
            tree_latch: Mutex::new(()),
            min_value_size: config.min_value_size,
            max_value_size: config.max_value_size,
        })
    }

    /// Opens one more table file; its id continues the startup sequence.
    pub fn open_table(&self, path: impl Into<PathBuf>) -> Result<TableId> {
        self.buffer.disk.lock().open_table(path.into())
    }

    fn check_size(&self, len: usize) -> Result<()> {
        let size = len as u16;
        if len > u16::MAX as usize || size < self.min_value_size || size > self.max_value_size {
            return Err(DbError::RecordSize {
                size,
                min: self.min_value_size,
                max: self.max_value_size,
            });
        }
        Ok(())
    }

    /// Inserts `(key, value)`; inserting an existing key is a no-op.
    pub fn insert(&self, table: TableId, key: Key, value: &[u8]) -> Result<()> {
        self.check_size(value.len())?;
        let _structural = self.tree_latch.lock();
        btree::insert(&self.buffer, table, key, value)
    }

    /// Deletes `key` and rebalances the tree.
    pub fn delete(&self, table: TableId, key: Key) -> Result<()> {
        let _structural = self.tree_latch.lock();
        btree::delete(&self.buffer, table, key)
    }

    /// Non-transactional point lookup.
    pub fn find(&self, table: TableId, key: Key) -> Result<Vec<u8>> {
        match btree::find(&self.buffer, table, key)? {
            Some((leaf, slot)) => {
                let (_, value) = btree::read_record(&self.buffer, table, leaf, slot)?;
                Ok(value)
            }
            None => Err(DbError::KeyNotFound(key)),
        }
    }

    /// Transactional lookup under a shared record lock. A miss aborts the
    /// transaction before reporting not-found.
    pub fn find_trx(&self, table: TableId, key: Key, trx: TrxId) -> Result<Vec<u8>> {
        let leaf = match btree::find(&self.buffer, table, key)? {
            Some((leaf, _)) => leaf,
            None => {
                self.trx.abort(trx, &self.locks, &self.buffer, &self.log)?;
                return Err(DbError::KeyNotFound(key));
            }
        };
        self.trx.get_lock(
            trx,
            table,
            leaf,
            key,
            LockMode::Shared,
            &self.locks,
            &self.buffer,
            &self.log,
        )?;
        match btree::find(&self.buffer, table, key)? {
            Some((leaf, slot)) => {
                let (_, value) = btree::read_record(&self.buffer, table, leaf, slot)?;
                Ok(value)
            }
            None => {
                self.trx.abort(trx, &self.locks, &self.buffer, &self.log)?;
                Err(DbError::KeyNotFound(key))
            }
        }
    }

    /// Transactional update under an exclusive record lock. The new value
    /// must be exactly the stored record's size; returns the old size.
    pub fn update(&self, table: TableId, key: Key, value: &[u8], trx: TrxId) -> Result<u16> {
        self.check_size(value.len())?;
        let leaf = match btree::find(&self.buffer, table, key)? {
            Some((leaf, _)) => leaf,
            None => {
                self.trx.abort(trx, &self.locks, &self.buffer, &self.log)?;
                return Err(DbError::KeyNotFound(key));
            }
        };
        self.trx.get_lock(
            trx,
            table,
            leaf,
            key,
            LockMode::Exclusive,
            &self.locks,
            &self.buffer,
            &self.log,
        )?;

        let (leaf, slot_idx) = match btree::find(&self.buffer, table, key)? {
            Some(loc) => loc,
            None => {
                self.trx.abort(trx, &self.locks, &self.buffer, &self.log)?;
                return Err(DbError::KeyNotFound(key));
            }
        };
        let frame = self.buffer.fetch(table, leaf)?;
        let (slot, old) = {
            let page = frame.read();
            let slot = page.slot(slot_idx as usize);
            (slot, page.record(slot.offset, slot.size).to_vec())
        };
        if value.len() != slot.size as usize {
            // Size policy violation: reject without touching the page or
            // the transaction.
            return Err(DbError::RecordSizeMismatch {
                new: value.len() as u16,
                old: slot.size,
            });
        }

        let prev = self.trx.last_lsn(trx)?;
        let lsn = self.log.append(
            trx,
            prev,
            LogBody::Update(UpdateBody {
                table,
                page: leaf,
                offset: slot.offset,
                old: old.clone(),
                new: value.to_vec(),
            }),
        )?;
        self.trx.set_last_lsn(trx, lsn)?;
        self.trx.push_undo(
            trx,
            UndoImage {
                table,
                page: leaf,
                offset: slot.offset,
                old,
                prev_lsn: prev,
            },
        )?;
        {
            let mut page = frame.write();
            page.set_record(slot.offset, value);
            page.set_page_lsn(lsn);
        }
        Ok(slot.size)
    }

    /// Range scan, both bounds inclusive.
    pub fn scan(&self, table: TableId, begin: Key, end: Key) -> Result<Vec<(Key, Vec<u8>)>> {
        btree::scan(&self.buffer, table, begin, end)
    }

    pub fn trx_begin(&self) -> Result<TrxId> {
        self.trx.begin(&self.log)
    }

    pub fn trx_commit(&self, trx: TrxId) -> Result<()> {
        self.trx.commit(trx, &self.locks, &self.log)
    }

    pub fn trx_abort(&self, trx: TrxId) -> Result<()> {
        self.trx.abort(trx, &self.locks, &self.buffer, &self.log)
    }

    /// Forces the log and every dirty page to disk.
    pub fn flush_all(&self) -> Result<()> {
        self.log.flush()?;
        self.buffer.flush_all()
    }

    /// Flushes and closes the table files. Transactions still active are
    /// left as-is; their effects are rolled back by recovery on the next
    /// open, which is also how tests simulate a crash.
    pub fn shutdown(self) -> Result<()> {
        self.flush_all()?;
        self.buffer.disk.lock().close_all()
    }

    /// Diagnostic: checks the structural invariants of one table's tree.
    pub fn verify_table(&self, table: TableId) -> Result<()> {
        btree::verify_tree(&self.buffer, table)
    }

    /// Re-runs recovery by hand; normally done automatically at open.
    pub fn recover(&self) -> Result<RecoverySummary> {
        self.log.recover(&self.buffer)
    }
}
