//! Write-ahead log and crash recovery.
//!
//! Every mutation appends a record here before touching the page image
//! (the record may sit in the in-memory log buffer; the buffer manager
//! forces it to disk before the page itself can be written back). Records
//! carry a crc32 trailer; a bad checksum terminates the startup scan and
//! marks the torn tail of the log.
//!
//! Recovery is the classic three-pass scheme: analysis finds the loser
//! transactions, redo replays every update the page image has not yet seen,
//! undo walks each loser's chain backwards writing compensation records.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::buffer::BufferManager;
use crate::errors::{DbError, Result};
use crate::{Lsn, PageNum, TableId, TrxId};

/// The log buffer is forced to disk once it holds this many records.
pub const LOG_BUFFER_LIMIT: usize = 64;

/// Fixed part of every serialized record:
/// size u32, LSN u64, prev LSN u64, trx id u32, type u32.
const RECORD_HEADER_SIZE: usize = 28;
const CRC_SIZE: usize = 4;

const TYPE_BEGIN: u32 = 0;
const TYPE_UPDATE: u32 = 1;
const TYPE_COMMIT: u32 = 2;
const TYPE_ROLLBACK: u32 = 3;
const TYPE_COMPENSATE: u32 = 4;
const TYPE_CHECKPOINT: u32 = 5;

/// Payload shared by Update and Compensate records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBody {
    pub table: TableId,
    pub page: PageNum,
    pub offset: u16,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogBody {
    Begin,
    Update(UpdateBody),
    Commit,
    Rollback,
    Compensate { body: UpdateBody, next_undo: Lsn },
    /// Written as the sole record after a truncation. Carries no payload;
    /// its LSN keeps the counter ahead of every page LSN already on disk.
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub trx: TrxId,
    pub body: LogBody,
}

/// What a recovery pass did; returned for diagnostics and tests.
#[derive(Debug, Default, Clone)]
pub struct RecoverySummary {
    pub losers: Vec<TrxId>,
    pub redone: usize,
    pub undone: usize,
}

struct LogState {
    file: File,
    buf: Vec<LogRecord>,
    next_lsn: Lsn,
    durable_lsn: Lsn,
}

pub struct LogManager {
    state: Mutex<LogState>,
    trace: Mutex<File>,
}

impl LogManager {
    /// Opens (or creates) the log file and the recovery trace file, and
    /// scans the existing records to seat the LSN counter.
    pub fn open(log_path: impl AsRef<Path>, trace_path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(log_path)?;
        let trace = OpenOptions::new()
            .append(true)
            .create(true)
            .open(trace_path)?;

        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;
        let records = scan_records(&bytes);
        let last_lsn = records.last().map(|r| r.lsn).unwrap_or(0);

        Ok(LogManager {
            state: Mutex::new(LogState {
                file,
                buf: Vec::new(),
                next_lsn: last_lsn + 1,
                durable_lsn: last_lsn,
            }),
            trace: Mutex::new(trace),
        })
    }

    /// Appends a record to the log buffer and returns its LSN. The buffer
    /// is forced out once it reaches `LOG_BUFFER_LIMIT` records.
    pub fn append(&self, trx: TrxId, prev_lsn: Lsn, body: LogBody) -> Result<Lsn> {
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        state.next_lsn += 1;
        state.buf.push(LogRecord {
            lsn,
            prev_lsn,
            trx,
            body,
        });
        if state.buf.len() >= LOG_BUFFER_LIMIT {
            flush_locked(&mut state)?;
        }
        Ok(lsn)
    }

    /// Forces every buffered record to disk.
    pub fn flush(&self) -> Result<()> {
        flush_locked(&mut self.state.lock())
    }

    /// WAL hook for the buffer manager: before a page with `page_lsn` goes
    /// to disk, the log must be durable at least that far.
    pub fn flush_for_page(&self, page_lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if page_lsn > state.durable_lsn {
            flush_locked(&mut state)?;
        }
        Ok(())
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.state.lock().durable_lsn
    }

    /// Reads every record currently in the log, buffered ones included.
    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        let mut state = self.state.lock();
        flush_locked(&mut state)?;
        let mut bytes = Vec::new();
        state.file.seek(SeekFrom::Start(0))?;
        state.file.read_to_end(&mut bytes)?;
        Ok(scan_records(&bytes))
    }

    /// Drops every record and seats a checkpoint in their place. Only safe
    /// once no transaction needs undo and every page at or below the
    /// durable LSN has been flushed. The checkpoint takes the next LSN, so
    /// the counter never rewinds below the page LSNs already on disk.
    pub fn truncate(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.buf.clear();
        state.file.set_len(0)?;
        let lsn = state.next_lsn;
        state.next_lsn += 1;
        state.buf.push(LogRecord {
            lsn,
            prev_lsn: 0,
            trx: 0,
            body: LogBody::Checkpoint,
        });
        flush_locked(&mut state)
    }

    fn trace_line(&self, line: &str) -> Result<()> {
        let mut trace = self.trace.lock();
        writeln!(trace, "{line}")?;
        Ok(())
    }

    /// Analysis / redo / undo over the current log contents.
    ///
    /// Every table referenced by the log must already be open with the same
    /// id it had when the records were written (ids are assigned in table
    /// open order, so reopening the same files in the same order suffices).
    pub fn recover(&self, buffer: &BufferManager) -> Result<RecoverySummary> {
        let records = self.read_all()?;
        let mut summary = RecoverySummary::default();
        if records.is_empty() {
            return Ok(summary);
        }

        // Analysis: a transaction with a Begin but neither Commit nor
        // Rollback lost the race with the crash.
        self.trace_line("[ANALYSIS] begin")?;
        let mut active: Vec<TrxId> = Vec::new();
        let mut last_lsn: std::collections::HashMap<TrxId, Lsn> = std::collections::HashMap::new();
        let mut by_lsn: std::collections::HashMap<Lsn, &LogRecord> =
            std::collections::HashMap::new();
        for rec in &records {
            by_lsn.insert(rec.lsn, rec);
            last_lsn.insert(rec.trx, rec.lsn);
            match rec.body {
                LogBody::Begin => active.push(rec.trx),
                LogBody::Commit | LogBody::Rollback => active.retain(|&t| t != rec.trx),
                _ => {}
            }
        }
        active.sort_unstable();
        summary.losers = active.clone();
        if active.is_empty() {
            self.trace_line("[ANALYSIS] no loser transactions")?;
        } else {
            let list = active
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            self.trace_line(&format!("[ANALYSIS] loser transactions: {list}"))?;
        }

        // Redo: replay history in LSN order. A page whose LSN is already at
        // or past the record carries the effect; skip it (consider-redo).
        self.trace_line("[REDO] begin")?;
        for rec in &records {
            let (body, lsn) = match &rec.body {
                LogBody::Update(body) => (body, rec.lsn),
                LogBody::Compensate { body, .. } => (body, rec.lsn),
                _ => continue,
            };
            let frame = buffer.fetch(body.table, body.page)?;
            let applied = {
                let page = frame.read();
                page.page_lsn() < lsn
            };
            if applied {
                let mut page = frame.write();
                page.set_record(body.offset, &body.new);
                page.set_page_lsn(lsn);
                summary.redone += 1;
                self.trace_line(&format!(
                    "[REDO] lsn={} trx={} table={} page={} offset={} applied",
                    lsn, rec.trx, body.table, body.page, body.offset
                ))?;
            } else {
                self.trace_line(&format!(
                    "[REDO] lsn={} trx={} table={} page={} consider-redo",
                    lsn, rec.trx, body.table, body.page
                ))?;
            }
        }

        // Undo: roll each loser back along its prev-LSN chain, logging one
        // compensation record per reversed update.
        self.trace_line("[UNDO] begin")?;
        for &trx in &active {
            let mut cursor = match last_lsn.get(&trx) {
                Some(&lsn) => lsn,
                None => continue,
            };
            let mut tail_lsn = cursor;
            loop {
                let rec = by_lsn.get(&cursor).copied().ok_or_else(|| {
                    DbError::Corruption(format!("undo chain of trx {trx} broke at lsn {cursor}"))
                })?;
                match &rec.body {
                    LogBody::Begin => {
                        let lsn = self.append(trx, tail_lsn, LogBody::Rollback)?;
                        self.trace_line(&format!("[UNDO] trx={trx} rolled back, lsn={lsn}"))?;
                        break;
                    }
                    LogBody::Update(body) => {
                        let clr = UpdateBody {
                            table: body.table,
                            page: body.page,
                            offset: body.offset,
                            old: body.new.clone(),
                            new: body.old.clone(),
                        };
                        let clr_lsn = self.append(
                            trx,
                            tail_lsn,
                            LogBody::Compensate {
                                body: clr,
                                next_undo: rec.prev_lsn,
                            },
                        )?;
                        let frame = buffer.fetch(body.table, body.page)?;
                        {
                            let mut page = frame.write();
                            page.set_record(body.offset, &body.old);
                            page.set_page_lsn(clr_lsn);
                        }
                        summary.undone += 1;
                        tail_lsn = clr_lsn;
                        self.trace_line(&format!(
                            "[UNDO] lsn={} trx={} table={} page={} offset={} compensated, lsn={}",
                            rec.lsn, trx, body.table, body.page, body.offset, clr_lsn
                        ))?;
                        cursor = rec.prev_lsn;
                    }
                    LogBody::Compensate { next_undo, .. } => {
                        // Already undone before the crash; jump over it.
                        self.trace_line(&format!(
                            "[UNDO] lsn={} trx={} compensation, skip to lsn={}",
                            rec.lsn, trx, next_undo
                        ))?;
                        cursor = *next_undo;
                    }
                    LogBody::Commit | LogBody::Rollback | LogBody::Checkpoint => {
                        return Err(DbError::Corruption(format!(
                            "unexpected record in undo chain of trx {trx} at lsn {}",
                            rec.lsn
                        )));
                    }
                }
            }
        }

        self.flush()?;
        buffer.flush_all()?;
        if summary.losers.is_empty() {
            self.trace_line("[RECOVERY] no losers, truncating log")?;
            self.truncate()?;
        }
        self.trace_line(&format!(
            "[RECOVERY] complete: {} losers, {} redone, {} undone",
            summary.losers.len(),
            summary.redone,
            summary.undone
        ))?;
        info!(
            losers = summary.losers.len(),
            redone = summary.redone,
            undone = summary.undone,
            "recovery complete"
        );
        Ok(summary)
    }
}

fn flush_locked(state: &mut LogState) -> Result<()> {
    if state.buf.is_empty() {
        return Ok(());
    }
    let mut bytes = Vec::new();
    for rec in &state.buf {
        encode_record(rec, &mut bytes);
    }
    state.file.write_all(&bytes)?;
    state.file.sync_data()?;
    let last = state.buf.last().map(|r| r.lsn).unwrap_or(state.durable_lsn);
    debug!(records = state.buf.len(), durable_lsn = last, "log flush");
    state.durable_lsn = last;
    state.buf.clear();
    Ok(())
}

fn type_tag(body: &LogBody) -> u32 {
    match body {
        LogBody::Begin => TYPE_BEGIN,
        LogBody::Update(_) => TYPE_UPDATE,
        LogBody::Commit => TYPE_COMMIT,
        LogBody::Rollback => TYPE_ROLLBACK,
        LogBody::Compensate { .. } => TYPE_COMPENSATE,
        LogBody::Checkpoint => TYPE_CHECKPOINT,
    }
}

fn encode_record(rec: &LogRecord, out: &mut Vec<u8>) {
    let start = out.len();
    out.extend_from_slice(&0u32.to_le_bytes()); // size, patched below
    out.extend_from_slice(&rec.lsn.to_le_bytes());
    out.extend_from_slice(&rec.prev_lsn.to_le_bytes());
    out.extend_from_slice(&rec.trx.to_le_bytes());
    out.extend_from_slice(&type_tag(&rec.body).to_le_bytes());

    match &rec.body {
        LogBody::Begin | LogBody::Commit | LogBody::Rollback | LogBody::Checkpoint => {}
        LogBody::Update(body) => encode_update_body(body, out),
        LogBody::Compensate { body, next_undo } => {
            encode_update_body(body, out);
            out.extend_from_slice(&next_undo.to_le_bytes());
        }
    }

    let size = (out.len() - start + CRC_SIZE) as u32;
    out[start..start + 4].copy_from_slice(&size.to_le_bytes());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&out[start..]);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
}

fn encode_update_body(body: &UpdateBody, out: &mut Vec<u8>) {
    out.extend_from_slice(&body.table.to_le_bytes());
    out.extend_from_slice(&body.page.to_le_bytes());
    out.extend_from_slice(&body.offset.to_le_bytes());
    out.extend_from_slice(&(body.old.len() as u16).to_le_bytes());
    out.extend_from_slice(&body.old);
    out.extend_from_slice(&body.new);
}

/// Decodes records until the bytes run out or a record fails its checksum.
fn scan_records(bytes: &[u8]) -> Vec<LogRecord> {
    let mut records = Vec::new();
    let mut pos = 0;
    while let Some((rec, len)) = decode_record(&bytes[pos..]) {
        records.push(rec);
        pos += len;
    }
    records
}

fn decode_record(bytes: &[u8]) -> Option<(LogRecord, usize)> {
    if bytes.len() < RECORD_HEADER_SIZE + CRC_SIZE {
        return None;
    }
    let size = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
    if size < RECORD_HEADER_SIZE + CRC_SIZE || size > bytes.len() {
        return None;
    }
    let payload = &bytes[..size - CRC_SIZE];
    let stored_crc = u32::from_le_bytes(bytes[size - CRC_SIZE..size].try_into().ok()?);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return None;
    }

    let lsn = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
    let prev_lsn = u64::from_le_bytes(bytes[12..20].try_into().ok()?);
    let trx = u32::from_le_bytes(bytes[20..24].try_into().ok()?);
    let tag = u32::from_le_bytes(bytes[24..28].try_into().ok()?);

    let body = match tag {
        TYPE_BEGIN => LogBody::Begin,
        TYPE_COMMIT => LogBody::Commit,
        TYPE_ROLLBACK => LogBody::Rollback,
        TYPE_CHECKPOINT => LogBody::Checkpoint,
        TYPE_UPDATE => LogBody::Update(decode_update_body(&payload[RECORD_HEADER_SIZE..])?),
        TYPE_COMPENSATE => {
            let body = decode_update_body(&payload[RECORD_HEADER_SIZE..])?;
            let tail = payload.len().checked_sub(8)?;
            let next_undo = u64::from_le_bytes(payload[tail..].try_into().ok()?);
            LogBody::Compensate { body, next_undo }
        }
        _ => return None,
    };

    Some((
        LogRecord {
            lsn,
            prev_lsn,
            trx,
            body,
        },
        size,
    ))
}

fn decode_update_body(bytes: &[u8]) -> Option<UpdateBody> {
    if bytes.len() < 20 {
        return None;
    }
    let table = i64::from_le_bytes(bytes[0..8].try_into().ok()?);
    let page = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
    let offset = u16::from_le_bytes(bytes[16..18].try_into().ok()?);
    let length = u16::from_le_bytes(bytes[18..20].try_into().ok()?) as usize;
    if bytes.len() < 20 + 2 * length {
        return None;
    }
    let old = bytes[20..20 + length].to_vec();
    let new = bytes[20 + length..20 + 2 * length].to_vec();
    Some(UpdateBody {
        table,
        page,
        offset,
        old,
        new,
    })
}
