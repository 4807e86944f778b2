//! Disk-resident B+-tree, one per table.
//!
//! Stateless functions over the buffer pool; the root page number lives in
//! the table's header page. Leaves keep a sorted slot directory with the
//! record bytes packed from the end of the page, internal nodes interleave
//! child pointers and keys. Leaf mutations rewrite the slot directory and
//! record region in one pass.

use crate::buffer::BufferManager;
use crate::errors::{DbError, Result};
use crate::page::{
    Page, Slot, INITIAL_FREE_SPACE, INTERNAL_ORDER, INVALID_PAGE_NUM, REBALANCE_THRESHOLD,
    SLOT_SIZE,
};
use crate::{Key, PageNum, SlotNum, TableId, PAGE_SIZE};

#[derive(Debug, Clone)]
struct LeafEntry {
    key: Key,
    value: Vec<u8>,
}

fn read_leaf_entries(page: &Page) -> Vec<LeafEntry> {
    let mut entries = Vec::with_capacity(page.key_count());
    for i in 0..page.key_count() {
        let slot = page.slot(i);
        entries.push(LeafEntry {
            key: slot.key,
            value: page.record(slot.offset, slot.size).to_vec(),
        });
    }
    entries
}

/// Rewrites the slot directory and record region from `entries`, which must
/// be sorted. Header fields other than key count and free space are kept.
fn write_leaf_entries(page: &mut Page, entries: &[LeafEntry]) {
    let mut offset = PAGE_SIZE as u16;
    let mut free = INITIAL_FREE_SPACE;
    for (i, entry) in entries.iter().enumerate() {
        offset -= entry.value.len() as u16;
        page.set_slot(
            i,
            Slot {
                key: entry.key,
                size: entry.value.len() as u16,
                offset,
            },
        );
        page.set_record(offset, &entry.value);
        free -= (entry.value.len() + SLOT_SIZE) as u64;
    }
    page.set_key_count(entries.len());
    page.set_free_space(free);
}

fn leaf_used(page: &Page) -> u64 {
    INITIAL_FREE_SPACE - page.free_space()
}

/// Split point for an overflowing leaf: the first entry index at which the
/// running slot+record footprint reaches half the usable page.
fn cut_leaf(entries: &[LeafEntry]) -> usize {
    let half = (PAGE_SIZE - crate::page::PAGE_HEADER_SIZE) / 2;
    let mut size = 0;
    for (i, entry) in entries.iter().enumerate() {
        size += entry.value.len() + SLOT_SIZE;
        if size >= half {
            return i;
        }
    }
    entries.len() / 2
}

fn root_of(buffer: &BufferManager, table: TableId) -> Result<PageNum> {
    let frame = buffer.fetch(table, 0)?;
    let root = frame.read().root();
    Ok(root)
}

fn set_root(buffer: &BufferManager, table: TableId, root: PageNum) -> Result<()> {
    let frame = buffer.fetch(table, 0)?;
    frame.write().set_root(root);
    Ok(())
}

fn make_leaf(buffer: &BufferManager, table: TableId) -> Result<PageNum> {
    let page_num = buffer.alloc_page(table)?;
    let frame = buffer.fetch(table, page_num)?;
    frame.write().init_leaf();
    Ok(page_num)
}

fn make_internal(buffer: &BufferManager, table: TableId) -> Result<PageNum> {
    let page_num = buffer.alloc_page(table)?;
    let frame = buffer.fetch(table, page_num)?;
    frame.write().init_internal();
    Ok(page_num)
}

/// Descends from the root to the leaf that covers `key`. Returns 0 for an
/// empty tree.
pub fn find_leaf(buffer: &BufferManager, table: TableId, key: Key) -> Result<PageNum> {
    let mut current = root_of(buffer, table)?;
    if current == INVALID_PAGE_NUM {
        return Ok(INVALID_PAGE_NUM);
    }
    loop {
        let frame = buffer.fetch(table, current)?;
        let page = frame.read();
        if page.is_leaf() {
            return Ok(current);
        }
        let n = page.key_count();
        let mut i = 0;
        while i < n && key >= page.internal_key(i) {
            i += 1;
        }
        let next = page.child(i);
        drop(page);
        current = next;
    }
}

/// Locates `key`: the leaf page holding it and its slot index.
pub fn find(buffer: &BufferManager, table: TableId, key: Key) -> Result<Option<(PageNum, SlotNum)>> {
    let leaf = find_leaf(buffer, table, key)?;
    if leaf == INVALID_PAGE_NUM {
        return Ok(None);
    }
    let frame = buffer.fetch(table, leaf)?;
    let page = frame.read();
    for i in 0..page.key_count() {
        if page.slot(i).key == key {
            return Ok(Some((leaf, i as SlotNum)));
        }
    }
    Ok(None)
}

/// Reads the record bytes at a located slot.
pub fn read_record(
    buffer: &BufferManager,
    table: TableId,
    leaf: PageNum,
    slot_idx: SlotNum,
) -> Result<(Slot, Vec<u8>)> {
    let frame = buffer.fetch(table, leaf)?;
    let page = frame.read();
    if !page.is_leaf() || (slot_idx as usize) >= page.key_count() {
        return Err(DbError::Corruption(format!(
            "slot {slot_idx} out of range on page {leaf}"
        )));
    }
    let slot = page.slot(slot_idx as usize);
    Ok((slot, page.record(slot.offset, slot.size).to_vec()))
}

/// Inserts `(key, value)`. A duplicate key is a silent no-op.
pub fn insert(buffer: &BufferManager, table: TableId, key: Key, value: &[u8]) -> Result<()> {
    if find(buffer, table, key)?.is_some() {
        return Ok(());
    }

    let root = root_of(buffer, table)?;
    if root == INVALID_PAGE_NUM {
        return start_new_tree(buffer, table, key, value);
    }

    let leaf = find_leaf(buffer, table, key)?;
    let free = buffer.fetch(table, leaf)?.read().free_space();
    if free >= (value.len() + SLOT_SIZE) as u64 {
        insert_into_leaf(buffer, table, leaf, key, value)
    } else {
        insert_into_leaf_after_splitting(buffer, table, leaf, key, value)
    }
}

fn start_new_tree(buffer: &BufferManager, table: TableId, key: Key, value: &[u8]) -> Result<()> {
    let root = make_leaf(buffer, table)?;
    set_root(buffer, table, root)?;
    let frame = buffer.fetch(table, root)?;
    write_leaf_entries(
        &mut frame.write(),
        &[LeafEntry {
            key,
            value: value.to_vec(),
        }],
    );
    Ok(())
}

fn sorted_insert(entries: &mut Vec<LeafEntry>, key: Key, value: &[u8]) {
    let pos = entries.partition_point(|e| e.key < key);
    entries.insert(
        pos,
        LeafEntry {
            key,
            value: value.to_vec(),
        },
    );
}

fn insert_into_leaf(
    buffer: &BufferManager,
    table: TableId,
    leaf: PageNum,
    key: Key,
    value: &[u8],
) -> Result<()> {
    let frame = buffer.fetch(table, leaf)?;
    let mut page = frame.write();
    let mut entries = read_leaf_entries(&page);
    sorted_insert(&mut entries, key, value);
    write_leaf_entries(&mut page, &entries);
    Ok(())
}

fn insert_into_leaf_after_splitting(
    buffer: &BufferManager,
    table: TableId,
    leaf: PageNum,
    key: Key,
    value: &[u8],
) -> Result<()> {
    let new_leaf = make_leaf(buffer, table)?;
    let split_key = {
        let frame = buffer.fetch(table, leaf)?;
        let mut page = frame.write();
        let mut entries = read_leaf_entries(&page);
        sorted_insert(&mut entries, key, value);
        let split = cut_leaf(&entries);
        let upper = entries.split_off(split);
        write_leaf_entries(&mut page, &entries);

        let new_frame = buffer.fetch(table, new_leaf)?;
        let mut new_page = new_frame.write();
        write_leaf_entries(&mut new_page, &upper);

        new_page.set_right_sibling(page.right_sibling());
        page.set_right_sibling(new_leaf);
        new_page.set_parent(page.parent());

        upper[0].key
    };
    insert_into_parent(buffer, table, leaf, split_key, new_leaf)
}

fn left_index_of(parent_page: &Page, left: PageNum) -> Result<usize> {
    for i in 0..=parent_page.key_count() {
        if parent_page.child(i) == left {
            return Ok(i);
        }
    }
    Err(DbError::Corruption(format!(
        "page {left} missing from its parent"
    )))
}

fn insert_into_parent(
    buffer: &BufferManager,
    table: TableId,
    left: PageNum,
    key: Key,
    right: PageNum,
) -> Result<()> {
    let parent = buffer.fetch(table, left)?.read().parent();
    if parent == INVALID_PAGE_NUM {
        return insert_into_new_root(buffer, table, left, key, right);
    }

    let (left_index, key_count) = {
        let frame = buffer.fetch(table, parent)?;
        let page = frame.read();
        (left_index_of(&page, left)?, page.key_count())
    };

    if key_count < INTERNAL_ORDER - 1 {
        insert_into_node(buffer, table, parent, left_index, key, right)
    } else {
        insert_into_node_after_splitting(buffer, table, parent, left_index, key, right)
    }
}

fn insert_into_node(
    buffer: &BufferManager,
    table: TableId,
    node: PageNum,
    left_index: usize,
    key: Key,
    right: PageNum,
) -> Result<()> {
    let frame = buffer.fetch(table, node)?;
    let mut guard = frame.write();
    let page = &mut *guard;
    let n = page.key_count();
    let mut i = n;
    while i > left_index {
        page.set_child(i + 1, page.child(i));
        page.set_internal_key(i, page.internal_key(i - 1));
        i -= 1;
    }
    page.set_child(left_index + 1, right);
    page.set_internal_key(left_index, key);
    page.set_key_count(n + 1);
    Ok(())
}

fn insert_into_node_after_splitting(
    buffer: &BufferManager,
    table: TableId,
    node: PageNum,
    left_index: usize,
    key: Key,
    right: PageNum,
) -> Result<()> {
    let (mut keys, mut children, parent) = {
        let frame = buffer.fetch(table, node)?;
        let page = frame.read();
        let n = page.key_count();
        let keys: Vec<Key> = (0..n).map(|i| page.internal_key(i)).collect();
        let children: Vec<PageNum> = (0..=n).map(|i| page.child(i)).collect();
        (keys, children, page.parent())
    };
    keys.insert(left_index, key);
    children.insert(left_index + 1, right);

    let split = INTERNAL_ORDER / 2;
    let prime_key = keys[split - 1];
    let new_node = make_internal(buffer, table)?;

    {
        let frame = buffer.fetch(table, node)?;
        let mut page = frame.write();
        for i in 0..split - 1 {
            page.set_internal_key(i, keys[i]);
            page.set_child(i, children[i]);
        }
        page.set_child(split - 1, children[split - 1]);
        page.set_key_count(split - 1);
    }

    let moved_children: Vec<PageNum> = children[split..].to_vec();
    {
        let frame = buffer.fetch(table, new_node)?;
        let mut page = frame.write();
        for (j, i) in (split..keys.len()).enumerate() {
            page.set_internal_key(j, keys[i]);
        }
        for (j, &child) in moved_children.iter().enumerate() {
            page.set_child(j, child);
        }
        page.set_key_count(keys.len() - split);
        page.set_parent(parent);
    }
    for child in moved_children {
        let frame = buffer.fetch(table, child)?;
        frame.write().set_parent(new_node);
    }

    insert_into_parent(buffer, table, node, prime_key, new_node)
}

fn insert_into_new_root(
    buffer: &BufferManager,
    table: TableId,
    left: PageNum,
    key: Key,
    right: PageNum,
) -> Result<()> {
    let root = make_internal(buffer, table)?;
    set_root(buffer, table, root)?;
    {
        let frame = buffer.fetch(table, root)?;
        let mut page = frame.write();
        page.set_internal_key(0, key);
        page.set_child(0, left);
        page.set_child(1, right);
        page.set_key_count(1);
    }
    for node in [left, right] {
        let frame = buffer.fetch(table, node)?;
        frame.write().set_parent(root);
    }
    Ok(())
}

/// Removes `key`. Missing keys report `DbError::KeyNotFound`.
pub fn delete(buffer: &BufferManager, table: TableId, key: Key) -> Result<()> {
    match find(buffer, table, key)? {
        Some((leaf, _)) => delete_entry(buffer, table, leaf, key),
        None => Err(DbError::KeyNotFound(key)),
    }
}

fn delete_entry(buffer: &BufferManager, table: TableId, node: PageNum, key: Key) -> Result<()> {
    remove_entry_from_node(buffer, table, node, key)?;

    if node == root_of(buffer, table)? {
        return adjust_root(buffer, table);
    }

    let (is_leaf, key_count, free_space, parent) = {
        let frame = buffer.fetch(table, node)?;
        let page = frame.read();
        (
            page.is_leaf(),
            page.key_count(),
            page.free_space(),
            page.parent(),
        )
    };

    // Still healthy: internal nodes by minimum occupancy, leaves by the
    // free-space threshold.
    if !is_leaf && key_count >= INTERNAL_ORDER / 2 {
        return Ok(());
    }
    if is_leaf && free_space < REBALANCE_THRESHOLD {
        return Ok(());
    }

    let (neighbor, sep_idx, extreme) = {
        let frame = buffer.fetch(table, parent)?;
        let page = frame.read();
        let pos = left_index_of(&page, node)?;
        if pos == 0 {
            // Leftmost child: fall back to the right neighbor.
            (page.child(1), 0, true)
        } else {
            (page.child(pos - 1), pos - 1, false)
        }
    };

    if !is_leaf {
        let neighbor_keys = buffer.fetch(table, neighbor)?.read().key_count();
        if neighbor_keys + key_count < INTERNAL_ORDER - 1 {
            merge_nodes(buffer, table, node, neighbor, parent, sep_idx, extreme)
        } else {
            redistribute_internal(buffer, table, node, neighbor, parent, sep_idx, extreme)
        }
    } else {
        let neighbor_used = leaf_used(&buffer.fetch(table, neighbor)?.read());
        let node_used = INITIAL_FREE_SPACE - free_space;
        if node_used + neighbor_used <= INITIAL_FREE_SPACE {
            merge_nodes(buffer, table, node, neighbor, parent, sep_idx, extreme)
        } else {
            // Borrow one entry at a time until the leaf is healthy again.
            loop {
                redistribute_leaf(buffer, table, node, neighbor, parent, sep_idx, extreme)?;
                let frame = buffer.fetch(table, node)?;
                if frame.read().free_space() < REBALANCE_THRESHOLD {
                    return Ok(());
                }
            }
        }
    }
}

fn remove_entry_from_node(
    buffer: &BufferManager,
    table: TableId,
    node: PageNum,
    key: Key,
) -> Result<()> {
    let frame = buffer.fetch(table, node)?;
    let mut guard = frame.write();
    let page = &mut *guard;
    if page.is_leaf() {
        let mut entries = read_leaf_entries(page);
        let before = entries.len();
        entries.retain(|e| e.key != key);
        if entries.len() == before {
            return Err(DbError::Corruption(format!(
                "key {key} vanished from leaf {node} during delete"
            )));
        }
        write_leaf_entries(page, &entries);
    } else {
        let n = page.key_count();
        let idx = (0..n)
            .find(|&i| page.internal_key(i) == key)
            .ok_or_else(|| {
                DbError::Corruption(format!("separator {key} missing from page {node}"))
            })?;
        // Drop key[idx] and the child to its right.
        for j in idx + 1..n {
            page.set_internal_key(j - 1, page.internal_key(j));
        }
        for j in idx + 2..=n {
            page.set_child(j - 1, page.child(j));
        }
        page.set_key_count(n - 1);
    }
    Ok(())
}

fn adjust_root(buffer: &BufferManager, table: TableId) -> Result<()> {
    let root = root_of(buffer, table)?;
    let (key_count, is_leaf, first_child) = {
        let frame = buffer.fetch(table, root)?;
        let page = frame.read();
        (page.key_count(), page.is_leaf(), page.child(0))
    };
    if key_count > 0 {
        return Ok(());
    }

    if is_leaf {
        // The last record is gone; the tree is empty.
        set_root(buffer, table, INVALID_PAGE_NUM)?;
    } else {
        let frame = buffer.fetch(table, first_child)?;
        frame.write().set_parent(INVALID_PAGE_NUM);
        set_root(buffer, table, first_child)?;
    }
    buffer.free_page(table, root)
}

/// Concatenates the right node into the left one, pulls the separator out
/// of the parent and frees the right page.
fn merge_nodes(
    buffer: &BufferManager,
    table: TableId,
    node: PageNum,
    neighbor: PageNum,
    parent: PageNum,
    sep_idx: usize,
    extreme: bool,
) -> Result<()> {
    let (left, right) = if extreme {
        (node, neighbor)
    } else {
        (neighbor, node)
    };
    let sep_key = buffer.fetch(table, parent)?.read().internal_key(sep_idx);
    let is_leaf = buffer.fetch(table, left)?.read().is_leaf();

    if is_leaf {
        let right_entries = {
            let frame = buffer.fetch(table, right)?;
            let page = frame.read();
            (read_leaf_entries(&page), page.right_sibling())
        };
        let frame = buffer.fetch(table, left)?;
        let mut page = frame.write();
        let mut entries = read_leaf_entries(&page);
        entries.extend(right_entries.0);
        write_leaf_entries(&mut page, &entries);
        page.set_right_sibling(right_entries.1);
    } else {
        let (right_keys, right_children) = {
            let frame = buffer.fetch(table, right)?;
            let page = frame.read();
            let n = page.key_count();
            let keys: Vec<Key> = (0..n).map(|i| page.internal_key(i)).collect();
            let children: Vec<PageNum> = (0..=n).map(|i| page.child(i)).collect();
            (keys, children)
        };
        {
            let frame = buffer.fetch(table, left)?;
            let mut page = frame.write();
            let base = page.key_count();
            page.set_internal_key(base, sep_key);
            for (j, &k) in right_keys.iter().enumerate() {
                page.set_internal_key(base + 1 + j, k);
            }
            for (j, &c) in right_children.iter().enumerate() {
                page.set_child(base + 1 + j, c);
            }
            page.set_key_count(base + 1 + right_keys.len());
        }
        for child in right_children {
            let frame = buffer.fetch(table, child)?;
            frame.write().set_parent(left);
        }
    }

    delete_entry(buffer, table, parent, sep_key)?;
    buffer.free_page(table, right)
}

/// Moves one entry from the neighboring leaf into `node` and refreshes the
/// separator in the parent.
fn redistribute_leaf(
    buffer: &BufferManager,
    table: TableId,
    node: PageNum,
    neighbor: PageNum,
    parent: PageNum,
    sep_idx: usize,
    extreme: bool,
) -> Result<()> {
    let moved = {
        let frame = buffer.fetch(table, neighbor)?;
        let mut page = frame.write();
        let mut entries = read_leaf_entries(&page);
        let moved = if extreme {
            entries.remove(0)
        } else {
            match entries.pop() {
                Some(entry) => entry,
                None => {
                    return Err(DbError::Corruption(format!(
                        "leaf {neighbor} drained during redistribution"
                    )))
                }
            }
        };
        write_leaf_entries(&mut page, &entries);
        moved
    };

    let new_sep = {
        let frame = buffer.fetch(table, node)?;
        let mut page = frame.write();
        let mut entries = read_leaf_entries(&page);
        if extreme {
            entries.push(moved);
        } else {
            entries.insert(0, moved);
        }
        write_leaf_entries(&mut page, &entries);
        if extreme {
            // Separator mirrors the right neighbor's new first key.
            buffer.fetch(table, neighbor)?.read().slot(0).key
        } else {
            entries[0].key
        }
    };

    let frame = buffer.fetch(table, parent)?;
    frame.write().set_internal_key(sep_idx, new_sep);
    Ok(())
}

/// Rotates one key/child pair through the parent separator.
fn redistribute_internal(
    buffer: &BufferManager,
    table: TableId,
    node: PageNum,
    neighbor: PageNum,
    parent: PageNum,
    sep_idx: usize,
    extreme: bool,
) -> Result<()> {
    let sep_key = buffer.fetch(table, parent)?.read().internal_key(sep_idx);

    let (moved_child, new_sep) = if extreme {
        // Right neighbor: its first child and key rotate left.
        let frame = buffer.fetch(table, neighbor)?;
        let mut guard = frame.write();
        let page = &mut *guard;
        let n = page.key_count();
        let moved_child = page.child(0);
        let new_sep = page.internal_key(0);
        for i in 0..n - 1 {
            page.set_internal_key(i, page.internal_key(i + 1));
            page.set_child(i, page.child(i + 1));
        }
        page.set_child(n - 1, page.child(n));
        page.set_key_count(n - 1);
        (moved_child, new_sep)
    } else {
        // Left neighbor: its last child and key rotate right.
        let frame = buffer.fetch(table, neighbor)?;
        let mut page = frame.write();
        let n = page.key_count();
        let moved_child = page.child(n);
        let new_sep = page.internal_key(n - 1);
        page.set_key_count(n - 1);
        (moved_child, new_sep)
    };

    {
        let frame = buffer.fetch(table, node)?;
        let mut guard = frame.write();
        let page = &mut *guard;
        let n = page.key_count();
        if extreme {
            page.set_internal_key(n, sep_key);
            page.set_child(n + 1, moved_child);
        } else {
            page.set_child(n + 1, page.child(n));
            let mut i = n;
            while i > 0 {
                page.set_internal_key(i, page.internal_key(i - 1));
                page.set_child(i, page.child(i - 1));
                i -= 1;
            }
            page.set_internal_key(0, sep_key);
            page.set_child(0, moved_child);
        }
        page.set_key_count(n + 1);
    }
    {
        let frame = buffer.fetch(table, moved_child)?;
        frame.write().set_parent(node);
    }

    let frame = buffer.fetch(table, parent)?;
    frame.write().set_internal_key(sep_idx, new_sep);
    Ok(())
}

/// Collects `(key, value)` pairs with `begin <= key <= end`, walking the
/// leaf chain through right-sibling links.
pub fn scan(
    buffer: &BufferManager,
    table: TableId,
    begin: Key,
    end: Key,
) -> Result<Vec<(Key, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut leaf = find_leaf(buffer, table, begin)?;
    while leaf != INVALID_PAGE_NUM {
        let frame = buffer.fetch(table, leaf)?;
        let page = frame.read();
        for i in 0..page.key_count() {
            let slot = page.slot(i);
            if slot.key < begin {
                continue;
            }
            if slot.key > end {
                return Ok(out);
            }
            out.push((slot.key, page.record(slot.offset, slot.size).to_vec()));
        }
        let next = page.right_sibling();
        drop(page);
        leaf = next;
    }
    Ok(out)
}

/// Walks the whole tree checking the structural invariants: sorted keys,
/// consistent separators, uniform leaf depth, parent pointers, slot
/// bookkeeping. Diagnostic for tests.
pub fn verify_tree(buffer: &BufferManager, table: TableId) -> Result<()> {
    let root = root_of(buffer, table)?;
    if root == INVALID_PAGE_NUM {
        return Ok(());
    }
    let mut leaf_depth = None;
    verify_node(
        buffer,
        table,
        root,
        INVALID_PAGE_NUM,
        0,
        None,
        None,
        &mut leaf_depth,
    )
}

#[allow(clippy::too_many_arguments)]
fn verify_node(
    buffer: &BufferManager,
    table: TableId,
    node: PageNum,
    expected_parent: PageNum,
    depth: usize,
    lower: Option<Key>,
    upper: Option<Key>,
    leaf_depth: &mut Option<usize>,
) -> Result<()> {
    let bad = |msg: String| Err(DbError::Corruption(msg));

    let frame = buffer.fetch(table, node)?;
    let page = frame.read();
    if page.parent() != expected_parent {
        return bad(format!(
            "page {node}: parent {} != expected {expected_parent}",
            page.parent()
        ));
    }

    if page.is_leaf() {
        match *leaf_depth {
            None => *leaf_depth = Some(depth),
            Some(d) if d != depth => {
                return bad(format!("leaf {node} at depth {depth}, expected {d}"))
            }
            _ => {}
        }
        let mut expected_free = INITIAL_FREE_SPACE;
        let mut prev: Option<Key> = None;
        for i in 0..page.key_count() {
            let slot = page.slot(i);
            if let Some(p) = prev {
                if slot.key <= p {
                    return bad(format!("leaf {node}: keys out of order at slot {i}"));
                }
            }
            prev = Some(slot.key);
            if let Some(lo) = lower {
                if slot.key < lo {
                    return bad(format!("leaf {node}: key {} below bound {lo}", slot.key));
                }
            }
            if let Some(hi) = upper {
                if slot.key >= hi {
                    return bad(format!("leaf {node}: key {} at/above bound {hi}", slot.key));
                }
            }
            let end = slot.offset as usize + slot.size as usize;
            if (slot.offset as usize) < crate::page::PAGE_HEADER_SIZE || end > PAGE_SIZE {
                return bad(format!("leaf {node}: slot {i} record out of bounds"));
            }
            expected_free -= (slot.size as usize + SLOT_SIZE) as u64;
        }
        if page.free_space() != expected_free {
            return bad(format!(
                "leaf {node}: free space {} != expected {expected_free}",
                page.free_space()
            ));
        }
        return Ok(());
    }

    let n = page.key_count();
    if n == 0 {
        return bad(format!("internal page {node} has no keys"));
    }
    let keys: Vec<Key> = (0..n).map(|i| page.internal_key(i)).collect();
    let children: Vec<PageNum> = (0..=n).map(|i| page.child(i)).collect();
    drop(page);
    drop(frame);

    for w in keys.windows(2) {
        if w[0] >= w[1] {
            return bad(format!("internal page {node}: separators out of order"));
        }
    }
    if let Some(lo) = lower {
        if keys[0] < lo {
            return bad(format!("internal page {node}: separator below bound"));
        }
    }
    if let Some(hi) = upper {
        if keys[n - 1] >= hi {
            return bad(format!("internal page {node}: separator at/above bound"));
        }
    }

    for (i, &child) in children.iter().enumerate() {
        let child_lower = if i == 0 { lower } else { Some(keys[i - 1]) };
        let child_upper = if i == n { upper } else { Some(keys[i]) };
        verify_node(
            buffer,
            table,
            child,
            node,
            depth + 1,
            child_lower,
            child_upper,
            leaf_depth,
        )?;
    }
    Ok(())
}
