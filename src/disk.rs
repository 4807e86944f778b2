//! Table files on disk.
//!
//! The `DiskManager` owns the open table files. A fresh table file starts at
//! 10 MiB: a header page followed by free pages threaded into a singly
//! linked list. Page I/O is an exact-page seek + read/write; the free-list
//! bookkeeping itself lives in the buffer manager so every header mutation
//! goes through the cache.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{DbError, Result};
use crate::page::{Page, HEADER_MAGIC, INVALID_PAGE_NUM};
use crate::{PageNum, TableId, PAGE_SIZE};

/// A new table file is 10 MiB: 2560 pages.
pub const INITIAL_PAGE_COUNT: u64 = (10 * 1024 * 1024 / PAGE_SIZE) as u64;

struct TableFile {
    file: File,
    path: PathBuf,
}

pub struct DiskManager {
    tables: HashMap<TableId, TableFile>,
    next_table_id: TableId,
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskManager {
    pub fn new() -> Self {
        DiskManager {
            tables: HashMap::new(),
            next_table_id: 1,
        }
    }

    /// Opens (or creates) the table file at `path` and returns its id.
    /// Opening the same path twice in one instance is an error.
    pub fn open_table(&mut self, path: impl AsRef<Path>) -> Result<TableId> {
        let path = path.as_ref().to_path_buf();
        if self.tables.values().any(|t| t.path == path) {
            return Err(DbError::TableAlreadyOpen(path));
        }

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => {
                let mut header = Page::new();
                read_page_at(&file, 0, &mut header)?;
                if header.magic() != HEADER_MAGIC {
                    return Err(DbError::Corruption(format!(
                        "bad magic {} in table file {:?}",
                        header.magic(),
                        path
                    )));
                }
                file
            }
            Err(e) if e.kind() == ErrorKind::NotFound => create_table_file(&path)?,
            Err(e) => return Err(e.into()),
        };

        let table_id = self.next_table_id;
        self.next_table_id += 1;
        self.tables.insert(table_id, TableFile { file, path });
        Ok(table_id)
    }

    pub fn read_page(&mut self, table: TableId, page_num: PageNum, page: &mut Page) -> Result<()> {
        let entry = self.table(table)?;
        read_page_at(&entry.file, page_num, page)
    }

    pub fn write_page(&mut self, table: TableId, page_num: PageNum, page: &Page) -> Result<()> {
        let entry = self.table(table)?;
        let mut file = &entry.file;
        file.seek(SeekFrom::Start(page_num * PAGE_SIZE as u64))?;
        file.write_all(&page.data)?;
        Ok(())
    }

    /// Doubles the file from `current_count` pages, threading the new pages
    /// into a free list: page i points to i+1, the last new page terminates.
    /// The header page is not touched; the caller updates the cached copy.
    pub fn extend_table(&mut self, table: TableId, current_count: u64) -> Result<()> {
        let entry = self.table(table)?;
        let new_count = current_count * 2;
        entry.file.set_len(new_count * PAGE_SIZE as u64)?;

        let mut file = &entry.file;
        for i in current_count..new_count {
            let next = if i + 1 == new_count {
                INVALID_PAGE_NUM
            } else {
                i + 1
            };
            file.seek(SeekFrom::Start(i * PAGE_SIZE as u64))?;
            file.write_all(&next.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn sync_table(&mut self, table: TableId) -> Result<()> {
        let entry = self.table(table)?;
        entry.file.sync_data()?;
        Ok(())
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.keys().copied().collect()
    }

    /// Syncs and closes every table file.
    pub fn close_all(&mut self) -> Result<()> {
        for entry in self.tables.values() {
            entry.file.sync_data()?;
        }
        self.tables.clear();
        Ok(())
    }

    fn table(&mut self, table: TableId) -> Result<&mut TableFile> {
        self.tables
            .get_mut(&table)
            .ok_or(DbError::UnknownTable(table))
    }
}

fn read_page_at(mut file: &File, page_num: PageNum, page: &mut Page) -> Result<()> {
    file.seek(SeekFrom::Start(page_num * PAGE_SIZE as u64))?;
    file.read_exact(&mut page.data)?;
    Ok(())
}

/// Lays out a brand-new table file: header page plus a threaded free list
/// covering pages 1..INITIAL_PAGE_COUNT, written in one pass.
fn create_table_file(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;

    let mut image = vec![0u8; (INITIAL_PAGE_COUNT as usize) * PAGE_SIZE];

    let mut header = Page::new();
    header.init_header(1, INITIAL_PAGE_COUNT, INVALID_PAGE_NUM);
    image[..PAGE_SIZE].copy_from_slice(&header.data);

    for i in 1..INITIAL_PAGE_COUNT {
        let next = if i + 1 == INITIAL_PAGE_COUNT {
            INVALID_PAGE_NUM
        } else {
            i + 1
        };
        let base = (i as usize) * PAGE_SIZE;
        image[base..base + 8].copy_from_slice(&next.to_le_bytes());
    }

    let mut f = &file;
    f.write_all(&image)?;
    f.sync_data()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_reopens_table_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");

        let mut disk = DiskManager::new();
        let table = disk.open_table(&path).unwrap();

        let mut header = Page::new();
        disk.read_page(table, 0, &mut header).unwrap();
        assert_eq!(header.magic(), HEADER_MAGIC);
        assert_eq!(header.free_head(), 1);
        assert_eq!(header.page_count(), INITIAL_PAGE_COUNT);
        assert_eq!(header.root(), INVALID_PAGE_NUM);

        // Free pages chain forward and terminate.
        let mut page = Page::new();
        disk.read_page(table, 1, &mut page).unwrap();
        assert_eq!(page.next_free(), 2);
        disk.read_page(table, INITIAL_PAGE_COUNT - 1, &mut page)
            .unwrap();
        assert_eq!(page.next_free(), INVALID_PAGE_NUM);

        disk.close_all().unwrap();

        // A second open must find the same header, not re-initialize.
        let mut disk = DiskManager::new();
        let table = disk.open_table(&path).unwrap();
        disk.read_page(table, 0, &mut header).unwrap();
        assert_eq!(header.page_count(), INITIAL_PAGE_COUNT);
    }

    #[test]
    fn rejects_double_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");

        let mut disk = DiskManager::new();
        disk.open_table(&path).unwrap();
        assert!(matches!(
            disk.open_table(&path),
            Err(DbError::TableAlreadyOpen(_))
        ));
    }

    #[test]
    fn extend_doubles_and_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");

        let mut disk = DiskManager::new();
        let table = disk.open_table(&path).unwrap();
        disk.extend_table(table, INITIAL_PAGE_COUNT).unwrap();

        let mut page = Page::new();
        disk.read_page(table, INITIAL_PAGE_COUNT, &mut page).unwrap();
        assert_eq!(page.next_free(), INITIAL_PAGE_COUNT + 1);
        disk.read_page(table, 2 * INITIAL_PAGE_COUNT - 1, &mut page)
            .unwrap();
        assert_eq!(page.next_free(), INVALID_PAGE_NUM);
    }

    #[test]
    fn page_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");

        let mut disk = DiskManager::new();
        let table = disk.open_table(&path).unwrap();

        let mut page = Page::new();
        page.init_leaf();
        page.set_right_sibling(17);
        disk.write_page(table, 3, &page).unwrap();

        let mut back = Page::new();
        disk.read_page(table, 3, &mut back).unwrap();
        assert!(back.is_leaf());
        assert_eq!(back.right_sibling(), 17);
    }
}
