//! stratum: a single-process, multi-table key/value storage engine.
//!
//! Each table is a disk-resident B+-tree over fixed 4096-byte pages. Page
//! access goes through a pinning LRU buffer pool, record access is guarded
//! by a per-record lock table with deadlock detection, and every update is
//! write-ahead logged so a crashed instance recovers with an
//! analysis/redo/undo pass on restart.

pub mod btree;
pub mod buffer;
pub mod db;
pub mod disk;
pub mod errors;
pub mod lock_table;
pub mod log;
pub mod page;
pub mod trx;

pub const PAGE_SIZE: usize = 4096;

/// On-disk page number within one table file. Page 0 is the header page.
pub type PageNum = u64;
/// Identifier handed out by [`disk::DiskManager::open_table`].
pub type TableId = i64;
/// Record key.
pub type Key = i64;
/// Index into a leaf page's slot directory.
pub type SlotNum = u16;
/// Transaction identifier, monotonically assigned starting at 1.
pub type TrxId = u32;
/// Log sequence number. 0 means "none".
pub type Lsn = u64;

pub use db::{Db, DbConfig};
pub use errors::{DbError, Result};
