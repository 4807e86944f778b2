//! Error taxonomy for the engine.

use crate::{Key, TableId, TrxId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The requesting transaction closed a cycle in the wait-for graph and
    /// was chosen as the victim. It has already been rolled back.
    #[error("deadlock detected, transaction {0} aborted")]
    Deadlock(TrxId),

    #[error("key {0} not found")]
    KeyNotFound(Key),

    #[error("table file {0:?} is already open")]
    TableAlreadyOpen(std::path::PathBuf),

    #[error("table {0} is not open")]
    UnknownTable(TableId),

    #[error("transaction {0} is not active")]
    UnknownTransaction(TrxId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("record size {size} outside allowed range {min}..={max}")]
    RecordSize { size: u16, min: u16, max: u16 },

    #[error("new value size {new} does not match stored record size {old}")]
    RecordSizeMismatch { new: u16, old: u16 },

    /// Every buffer frame is pinned; the pool cannot make forward progress.
    #[error("buffer pool exhausted: every frame is pinned")]
    BufferPoolExhausted,

    #[error("corruption: {0}")]
    Corruption(String),
}
