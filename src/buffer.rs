//! The buffer pool: a fixed set of in-memory frames caching disk pages.
//!
//! Structural state (the page index, the LRU chain, pin counts, dirty
//! flags) lives behind one mutex; the page bytes of each frame live behind
//! a per-frame `RwLock`. Lock order: a thread may take the structural mutex
//! while holding a frame lock, never the other way around — the one
//! exception is claiming a frame with zero pins during a miss, which cannot
//! block because an unpinned frame has no outstanding guards.
//!
//! The LRU chain is an index-linked arena over the frame table, so the
//! structural state is plain data with no self-references.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::disk::DiskManager;
use crate::errors::{DbError, Result};
use crate::log::LogManager;
use crate::page::{Page, INVALID_PAGE_NUM};
use crate::{PageNum, TableId};

const NIL: usize = usize::MAX;

struct FrameMeta {
    owner: Option<(TableId, PageNum)>,
    pins: u32,
    dirty: bool,
    prev: usize,
    next: usize,
}

impl FrameMeta {
    fn empty() -> Self {
        FrameMeta {
            owner: None,
            pins: 0,
            dirty: false,
            prev: NIL,
            next: NIL,
        }
    }
}

struct PoolState {
    index: HashMap<(TableId, PageNum), usize>,
    meta: Vec<FrameMeta>,
    /// Most recently used frame.
    lru_head: usize,
    /// Least recently used frame.
    lru_tail: usize,
    free: Vec<usize>,
}

impl PoolState {
    fn detach(&mut self, i: usize) {
        let (prev, next) = (self.meta[i].prev, self.meta[i].next);
        if prev != NIL {
            self.meta[prev].next = next;
        } else if self.lru_head == i {
            self.lru_head = next;
        }
        if next != NIL {
            self.meta[next].prev = prev;
        } else if self.lru_tail == i {
            self.lru_tail = prev;
        }
        self.meta[i].prev = NIL;
        self.meta[i].next = NIL;
    }

    fn push_front(&mut self, i: usize) {
        self.meta[i].prev = NIL;
        self.meta[i].next = self.lru_head;
        if self.lru_head != NIL {
            self.meta[self.lru_head].prev = i;
        }
        self.lru_head = i;
        if self.lru_tail == NIL {
            self.lru_tail = i;
        }
    }

    /// First unpinned frame, scanning from the least recently used end.
    fn find_victim(&self) -> Result<usize> {
        let mut i = self.lru_tail;
        while i != NIL {
            if self.meta[i].pins == 0 {
                return Ok(i);
            }
            i = self.meta[i].prev;
        }
        Err(DbError::BufferPoolExhausted)
    }
}

pub struct BufferManager {
    pub disk: Mutex<DiskManager>,
    frames: Vec<RwLock<Page>>,
    state: Mutex<PoolState>,
    wal: Option<Arc<LogManager>>,
}

impl BufferManager {
    pub fn new(disk: DiskManager, capacity: usize, wal: Option<Arc<LogManager>>) -> Self {
        BufferManager {
            disk: Mutex::new(disk),
            frames: (0..capacity).map(|_| RwLock::new(Page::new())).collect(),
            state: Mutex::new(PoolState {
                index: HashMap::new(),
                meta: (0..capacity).map(|_| FrameMeta::empty()).collect(),
                lru_head: NIL,
                lru_tail: NIL,
                free: (0..capacity).rev().collect(),
            }),
            wal,
        }
    }

    /// Pins the frame holding `(table, page_num)`, reading it from disk on
    /// a miss. The guard unpins on drop; `read()`/`write()` give access to
    /// the bytes, and `write()` marks the frame dirty.
    pub fn fetch(&self, table: TableId, page_num: PageNum) -> Result<FrameGuard<'_>> {
        let key = (table, page_num);
        let mut state = self.state.lock();

        if let Some(&i) = state.index.get(&key) {
            state.meta[i].pins += 1;
            state.detach(i);
            state.push_front(i);
            return Ok(FrameGuard {
                pool: self,
                frame: i,
            });
        }

        // Miss: claim a frame while still holding the structural mutex. The
        // claimed frame has zero pins, so its write lock is free.
        let (i, evicted) = match state.free.pop() {
            Some(i) => (i, None),
            None => {
                let i = state.find_victim()?;
                state.detach(i);
                let owner = state.meta[i].owner.take();
                let dirty = state.meta[i].dirty;
                if let Some(old) = owner {
                    state.index.remove(&old);
                }
                (i, owner.map(|old| (old, dirty)))
            }
        };
        state.meta[i] = FrameMeta {
            owner: Some(key),
            pins: 1,
            dirty: false,
            prev: NIL,
            next: NIL,
        };
        state.index.insert(key, i);
        state.push_front(i);
        let mut slot = self.frames[i].try_write().ok_or_else(|| {
            DbError::Corruption("unpinned frame held a page lock".to_string())
        })?;
        drop(state);

        // I/O happens under the frame lock only.
        let loaded = (|| -> Result<()> {
            if let Some(((old_table, old_page), true)) = evicted {
                if let Some(wal) = &self.wal {
                    wal.flush_for_page(slot.page_lsn())?;
                }
                self.disk.lock().write_page(old_table, old_page, &slot)?;
                debug!(
                    table = old_table,
                    page = old_page,
                    "evicted dirty page"
                );
            }
            self.disk.lock().read_page(table, page_num, &mut slot)
        })();
        drop(slot);

        if let Err(e) = loaded {
            let mut state = self.state.lock();
            state.index.remove(&key);
            state.detach(i);
            state.meta[i] = FrameMeta::empty();
            state.free.push(i);
            return Err(e);
        }
        Ok(FrameGuard {
            pool: self,
            frame: i,
        })
    }

    /// Pops the free-list head of `table`, doubling the file when the list
    /// is empty. All header mutation goes through the cached header page.
    pub fn alloc_page(&self, table: TableId) -> Result<PageNum> {
        let header = self.fetch(table, 0)?;
        let mut h = header.write();
        if h.free_head() == INVALID_PAGE_NUM {
            let page_count = h.page_count();
            self.disk.lock().extend_table(table, page_count)?;
            h.set_page_count(page_count * 2);
            h.set_free_head(page_count);
            debug!(table, new_count = page_count * 2, "extended table file");
        }
        let head = h.free_head();
        let next = self.fetch(table, head)?.read().next_free();
        h.set_free_head(next);
        Ok(head)
    }

    /// Pushes `page_num` back onto the free list of `table`.
    pub fn free_page(&self, table: TableId, page_num: PageNum) -> Result<()> {
        let header = self.fetch(table, 0)?;
        let mut h = header.write();
        let old_head = h.free_head();
        {
            let frame = self.fetch(table, page_num)?;
            frame.write().set_next_free(old_head);
        }
        h.set_free_head(page_num);
        Ok(())
    }

    /// Writes every dirty frame back, honoring the WAL rule, then syncs
    /// the table files.
    pub fn flush_all(&self) -> Result<()> {
        let targets: Vec<(TableId, PageNum)> = {
            let state = self.state.lock();
            state
                .index
                .iter()
                .filter(|&(_, &i)| state.meta[i].dirty)
                .map(|(&key, _)| key)
                .collect()
        };
        for (table, page_num) in targets {
            self.flush_one(table, page_num)?;
        }
        let mut disk = self.disk.lock();
        for table in disk.table_ids() {
            disk.sync_table(table)?;
        }
        Ok(())
    }

    /// Writes the dirty frames of one table back and syncs its file.
    pub fn flush_table(&self, table: TableId) -> Result<()> {
        let targets: Vec<PageNum> = {
            let state = self.state.lock();
            state
                .index
                .iter()
                .filter(|&(&(t, _), &i)| t == table && state.meta[i].dirty)
                .map(|(&(_, p), _)| p)
                .collect()
        };
        for page_num in targets {
            self.flush_one(table, page_num)?;
        }
        self.disk.lock().sync_table(table)?;
        Ok(())
    }

    fn flush_one(&self, table: TableId, page_num: PageNum) -> Result<()> {
        let frame = self.fetch(table, page_num)?;
        // Holding the read guard excludes writers, so clearing the dirty
        // flag before releasing it cannot lose a concurrent update.
        let page = frame.read();
        if let Some(wal) = &self.wal {
            wal.flush_for_page(page.page_lsn())?;
        }
        self.disk.lock().write_page(table, page_num, &page)?;
        self.state.lock().meta[frame.frame].dirty = false;
        Ok(())
    }
}

/// A pinned frame. Dropping the guard unpins it.
pub struct FrameGuard<'a> {
    pool: &'a BufferManager,
    frame: usize,
}

impl FrameGuard<'_> {
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.pool.frames[self.frame].read()
    }

    /// Exclusive access to the page bytes; marks the frame dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        let guard = self.pool.frames[self.frame].write();
        self.pool.state.lock().meta[self.frame].dirty = true;
        guard
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.meta[self.frame].pins -= 1;
    }
}
