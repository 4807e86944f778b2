//! The layout of a page on disk.
//!
//! Every page is a fixed 4096-byte block. Page 0 of a table file is the
//! header page; every other page is a tree node (leaf or internal) or a
//! member of the free list. All integers are little-endian.

use crate::{Key, Lsn, PageNum, PAGE_SIZE};

pub const INVALID_PAGE_NUM: PageNum = 0;

/// Magic number stored at offset 0 of the header page.
pub const HEADER_MAGIC: u64 = 2022;

/// Node pages reserve their first 128 bytes for the header.
pub const PAGE_HEADER_SIZE: usize = 128;

/// Byte offsets inside the node header.
const PARENT_OFFSET: usize = 0;
const IS_LEAF_OFFSET: usize = 8;
const KEY_COUNT_OFFSET: usize = 12;
const PAGE_LSN_OFFSET: usize = 16;

/// Leaf-only header fields.
const FREE_SPACE_OFFSET: usize = 112;
const RIGHT_SIBLING_OFFSET: usize = 120;

/// Leaf slot directory: 12-byte slots growing forward from byte 128,
/// record bytes packed backward from byte 4096.
pub const SLOT_DIR_OFFSET: usize = 128;
pub const SLOT_SIZE: usize = 12;
pub const INITIAL_FREE_SPACE: u64 = (PAGE_SIZE - PAGE_HEADER_SIZE) as u64;

/// Largest record a leaf can hold: its bytes plus one slot must fit the
/// usable area.
pub const MAX_RECORD_SIZE: u16 = (INITIAL_FREE_SPACE as usize - SLOT_SIZE) as u16;

/// A leaf whose free space reaches this after a deletion gets rebalanced.
pub const REBALANCE_THRESHOLD: u64 = 2500;

/// Internal pages interleave children and keys from byte 120:
/// child(i) at 120 + 16i, key(i) at 128 + 16i.
const INTERNAL_BASE: usize = 120;
/// Maximum fanout: 124 keys, 125 children.
pub const INTERNAL_ORDER: usize = 125;

/// Header-page field offsets.
const MAGIC_OFFSET: usize = 0;
const FREE_HEAD_OFFSET: usize = 8;
const PAGE_COUNT_OFFSET: usize = 16;
const ROOT_OFFSET: usize = 24;

/// One entry of a leaf's slot directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Slot {
    pub key: Key,
    pub size: u16,
    pub offset: u16,
}

/// An in-memory image of one disk page.
#[derive(Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
}

impl Default for Page {
    fn default() -> Self {
        Page {
            data: [0; PAGE_SIZE],
        }
    }
}

impl Page {
    pub fn new() -> Self {
        Self::default()
    }

    fn u16_at(&self, offset: usize) -> u16 {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(&self.data[offset..offset + 2]);
        u16::from_le_bytes(buf)
    }

    fn put_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn u32_at(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[offset..offset + 4]);
        u32::from_le_bytes(buf)
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn u64_at(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    fn put_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn i64_at(&self, offset: usize) -> i64 {
        self.u64_at(offset) as i64
    }

    fn put_i64(&mut self, offset: usize, value: i64) {
        self.put_u64(offset, value as u64);
    }

    // ---- header page (page 0) ----

    pub fn init_header(&mut self, free_head: PageNum, page_count: u64, root: PageNum) {
        self.data.fill(0);
        self.put_u64(MAGIC_OFFSET, HEADER_MAGIC);
        self.put_u64(FREE_HEAD_OFFSET, free_head);
        self.put_u64(PAGE_COUNT_OFFSET, page_count);
        self.put_u64(ROOT_OFFSET, root);
    }

    pub fn magic(&self) -> u64 {
        self.u64_at(MAGIC_OFFSET)
    }

    pub fn free_head(&self) -> PageNum {
        self.u64_at(FREE_HEAD_OFFSET)
    }

    pub fn set_free_head(&mut self, page: PageNum) {
        self.put_u64(FREE_HEAD_OFFSET, page);
    }

    pub fn page_count(&self) -> u64 {
        self.u64_at(PAGE_COUNT_OFFSET)
    }

    pub fn set_page_count(&mut self, count: u64) {
        self.put_u64(PAGE_COUNT_OFFSET, count);
    }

    pub fn root(&self) -> PageNum {
        self.u64_at(ROOT_OFFSET)
    }

    pub fn set_root(&mut self, page: PageNum) {
        self.put_u64(ROOT_OFFSET, page);
    }

    // ---- free pages ----

    /// Next pointer of a free page. The header page keeps its list head at
    /// offset 8 instead; use `free_head` for that.
    pub fn next_free(&self) -> PageNum {
        self.u64_at(0)
    }

    pub fn set_next_free(&mut self, page: PageNum) {
        self.put_u64(0, page);
    }

    // ---- node header (leaf + internal) ----

    pub fn parent(&self) -> PageNum {
        self.u64_at(PARENT_OFFSET)
    }

    pub fn set_parent(&mut self, page: PageNum) {
        self.put_u64(PARENT_OFFSET, page);
    }

    pub fn is_leaf(&self) -> bool {
        self.u32_at(IS_LEAF_OFFSET) != 0
    }

    pub fn key_count(&self) -> usize {
        self.u32_at(KEY_COUNT_OFFSET) as usize
    }

    pub fn set_key_count(&mut self, count: usize) {
        self.put_u32(KEY_COUNT_OFFSET, count as u32);
    }

    pub fn page_lsn(&self) -> Lsn {
        self.u64_at(PAGE_LSN_OFFSET)
    }

    pub fn set_page_lsn(&mut self, lsn: Lsn) {
        self.put_u64(PAGE_LSN_OFFSET, lsn);
    }

    // ---- leaf pages ----

    pub fn init_leaf(&mut self) {
        self.data.fill(0);
        self.put_u32(IS_LEAF_OFFSET, 1);
        self.put_u64(FREE_SPACE_OFFSET, INITIAL_FREE_SPACE);
        self.put_u64(RIGHT_SIBLING_OFFSET, INVALID_PAGE_NUM);
    }

    pub fn free_space(&self) -> u64 {
        self.u64_at(FREE_SPACE_OFFSET)
    }

    pub fn set_free_space(&mut self, free: u64) {
        self.put_u64(FREE_SPACE_OFFSET, free);
    }

    pub fn right_sibling(&self) -> PageNum {
        self.u64_at(RIGHT_SIBLING_OFFSET)
    }

    pub fn set_right_sibling(&mut self, page: PageNum) {
        self.put_u64(RIGHT_SIBLING_OFFSET, page);
    }

    pub fn slot(&self, idx: usize) -> Slot {
        let base = SLOT_DIR_OFFSET + idx * SLOT_SIZE;
        Slot {
            key: self.i64_at(base),
            size: self.u16_at(base + 8),
            offset: self.u16_at(base + 10),
        }
    }

    pub fn set_slot(&mut self, idx: usize, slot: Slot) {
        let base = SLOT_DIR_OFFSET + idx * SLOT_SIZE;
        self.put_i64(base, slot.key);
        self.put_u16(base + 8, slot.size);
        self.put_u16(base + 10, slot.offset);
    }

    pub fn record(&self, offset: u16, size: u16) -> &[u8] {
        &self.data[offset as usize..offset as usize + size as usize]
    }

    pub fn set_record(&mut self, offset: u16, bytes: &[u8]) {
        self.data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
    }

    // ---- internal pages ----

    pub fn init_internal(&mut self) {
        self.data.fill(0);
        self.put_u32(IS_LEAF_OFFSET, 0);
    }

    pub fn child(&self, idx: usize) -> PageNum {
        self.u64_at(INTERNAL_BASE + idx * 16)
    }

    pub fn set_child(&mut self, idx: usize, page: PageNum) {
        self.put_u64(INTERNAL_BASE + idx * 16, page);
    }

    pub fn internal_key(&self, idx: usize) -> Key {
        self.i64_at(INTERNAL_BASE + 8 + idx * 16)
    }

    pub fn set_internal_key(&mut self, idx: usize, key: Key) {
        self.put_i64(INTERNAL_BASE + 8 + idx * 16, key);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_leaf() {
            f.debug_struct("Page")
                .field("leaf", &true)
                .field("parent", &self.parent())
                .field("keys", &self.key_count())
                .field("free_space", &self.free_space())
                .field("right_sibling", &self.right_sibling())
                .field("lsn", &self.page_lsn())
                .finish()
        } else {
            f.debug_struct("Page")
                .field("leaf", &false)
                .field("parent", &self.parent())
                .field("keys", &self.key_count())
                .field("lsn", &self.page_lsn())
                .finish()
        }
    }
}
