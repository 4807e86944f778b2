//! Record-level lock table.
//!
//! Lock nodes live in an arena and are addressed by `LockId`, so queue
//! membership is plain index data. Requests on the same (table, page) hang
//! off one FIFO queue; a request is granted exactly when no earlier-queued
//! request of another transaction conflicts with it on the same record.
//! One table-wide mutex and condvar: `release` wakes every waiter and each
//! re-checks its own predicate.
//!
//! Blocking and deadlock policy live a level up, in the transaction
//! manager; this module only answers "who is ahead of me and in the way".

use std::collections::{HashMap, VecDeque};

use parking_lot::{Condvar, Mutex};

use crate::{Key, PageNum, TableId, TrxId};

pub type LockId = usize;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

fn conflicts(a: LockMode, b: LockMode) -> bool {
    a == LockMode::Exclusive || b == LockMode::Exclusive
}

/// Outcome of a lock request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockRequest {
    /// The transaction already holds a sufficient lock on the record
    /// (including an in-place S-to-X upgrade). Nothing new to track.
    Covered,
    /// A new node joined the queue; the caller must block on it until it
    /// is granted, and release it when the transaction ends.
    Enqueued(LockId),
}

#[derive(Debug, Clone)]
struct LockNode {
    table: TableId,
    page: PageNum,
    record: Key,
    trx: TrxId,
    mode: LockMode,
}

struct Inner {
    nodes: Vec<Option<LockNode>>,
    free: Vec<LockId>,
    queues: HashMap<(TableId, PageNum), VecDeque<LockId>>,
}

impl Inner {
    fn alloc(&mut self, node: LockNode) -> LockId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    /// A node is blocked while an earlier-queued node of another
    /// transaction conflicts with it on the same record.
    fn is_blocked(&self, id: LockId) -> bool {
        let node = match &self.nodes[id] {
            Some(node) => node,
            None => return false,
        };
        let queue = match self.queues.get(&(node.table, node.page)) {
            Some(queue) => queue,
            None => return false,
        };
        for &other_id in queue {
            if other_id == id {
                break;
            }
            if let Some(other) = &self.nodes[other_id] {
                if other.record == node.record
                    && other.trx != node.trx
                    && conflicts(other.mode, node.mode)
                {
                    return true;
                }
            }
        }
        false
    }
}

pub struct LockTable {
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        LockTable {
            inner: Mutex::new(Inner {
                nodes: Vec::new(),
                free: Vec::new(),
                queues: HashMap::new(),
            }),
            wake: Condvar::new(),
        }
    }

    /// Joins the queue for `(table, page, record)` without blocking.
    ///
    /// If `trx` already has a node on the record, a Shared request (or an
    /// Exclusive request on an Exclusive node) is covered outright; an
    /// Exclusive request on a Shared node upgrades in place when no other
    /// transaction is on the record, and otherwise enqueues a separate
    /// Exclusive node behind the current holders.
    pub fn request(
        &self,
        table: TableId,
        page: PageNum,
        record: Key,
        trx: TrxId,
        mode: LockMode,
    ) -> LockRequest {
        let mut inner = self.inner.lock();
        let key = (table, page);

        let mut own: Option<(LockId, LockMode)> = None;
        let mut others_on_record = false;
        if let Some(queue) = inner.queues.get(&key) {
            for &id in queue {
                if let Some(node) = &inner.nodes[id] {
                    if node.record != record {
                        continue;
                    }
                    if node.trx == trx {
                        // Keep the strongest of the transaction's own nodes.
                        if own.is_none() || node.mode == LockMode::Exclusive {
                            own = Some((id, node.mode));
                        }
                    } else {
                        others_on_record = true;
                    }
                }
            }
        }

        if let Some((own_id, own_mode)) = own {
            if own_mode == LockMode::Exclusive || mode == LockMode::Shared {
                return LockRequest::Covered;
            }
            if !others_on_record {
                if let Some(node) = &mut inner.nodes[own_id] {
                    node.mode = LockMode::Exclusive;
                }
                return LockRequest::Covered;
            }
            // Upgrade must queue behind the other holders.
        }

        let id = inner.alloc(LockNode {
            table,
            page,
            record,
            trx,
            mode,
        });
        inner.queues.entry(key).or_default().push_back(id);
        LockRequest::Enqueued(id)
    }

    /// The transactions whose earlier-queued conflicting nodes currently
    /// block `id`. This is the wait-for edge set for deadlock detection.
    pub fn conflicting_holders(&self, id: LockId) -> Vec<TrxId> {
        let inner = self.inner.lock();
        let node = match &inner.nodes[id] {
            Some(node) => node.clone(),
            None => return Vec::new(),
        };
        let mut holders = Vec::new();
        if let Some(queue) = inner.queues.get(&(node.table, node.page)) {
            for &other_id in queue {
                if other_id == id {
                    break;
                }
                if let Some(other) = &inner.nodes[other_id] {
                    if other.record == node.record
                        && other.trx != node.trx
                        && conflicts(other.mode, node.mode)
                        && !holders.contains(&other.trx)
                    {
                        holders.push(other.trx);
                    }
                }
            }
        }
        holders
    }

    /// Blocks until `id` is granted (no conflicting node ahead of it).
    pub fn wait_granted(&self, id: LockId) {
        let mut inner = self.inner.lock();
        while inner.is_blocked(id) {
            self.wake.wait(&mut inner);
        }
    }

    /// Unlinks `id` from its queue and wakes every waiter so later-queued
    /// requests re-check their predicates. Releasing an already-released
    /// id is a no-op.
    pub fn release(&self, id: LockId) {
        let mut inner = self.inner.lock();
        let node = match inner.nodes[id].take() {
            Some(node) => node,
            None => return,
        };
        inner.free.push(id);
        let key = (node.table, node.page);
        if let Some(queue) = inner.queues.get_mut(&key) {
            queue.retain(|&other| other != id);
            if queue.is_empty() {
                inner.queues.remove(&key);
            }
        }
        self.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn enqueue(table: &LockTable, record: Key, trx: TrxId, mode: LockMode) -> LockId {
        match table.request(1, 1, record, trx, mode) {
            LockRequest::Enqueued(id) => id,
            LockRequest::Covered => panic!("expected a new node"),
        }
    }

    #[test]
    fn shared_locks_coexist() {
        let locks = LockTable::new();
        let a = enqueue(&locks, 10, 1, LockMode::Shared);
        let b = enqueue(&locks, 10, 2, LockMode::Shared);
        locks.wait_granted(a);
        locks.wait_granted(b);
    }

    #[test]
    fn exclusive_blocks_and_release_unblocks() {
        let locks = Arc::new(LockTable::new());
        let holder = enqueue(&locks, 10, 1, LockMode::Exclusive);
        let waiter = enqueue(&locks, 10, 2, LockMode::Exclusive);
        assert_eq!(locks.conflicting_holders(waiter), vec![1]);

        let locks2 = Arc::clone(&locks);
        let handle = thread::spawn(move || {
            locks2.wait_granted(waiter);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        locks.release(holder);
        handle.join().unwrap();
    }

    #[test]
    fn different_records_never_conflict() {
        let locks = LockTable::new();
        let _a = enqueue(&locks, 10, 1, LockMode::Exclusive);
        let b = enqueue(&locks, 11, 2, LockMode::Exclusive);
        assert!(locks.conflicting_holders(b).is_empty());
        locks.wait_granted(b);
    }

    #[test]
    fn fifo_order_is_respected() {
        let locks = LockTable::new();
        let _holder = enqueue(&locks, 10, 1, LockMode::Exclusive);
        let _x_waiter = enqueue(&locks, 10, 2, LockMode::Exclusive);
        let s_waiter = enqueue(&locks, 10, 3, LockMode::Shared);
        // The later Shared request waits behind the queued Exclusive one.
        let holders = locks.conflicting_holders(s_waiter);
        assert_eq!(holders, vec![1, 2]);
    }

    #[test]
    fn same_transaction_lock_is_sufficient() {
        let locks = LockTable::new();
        let _x = enqueue(&locks, 10, 1, LockMode::Exclusive);
        assert_eq!(
            locks.request(1, 1, 10, 1, LockMode::Shared),
            LockRequest::Covered
        );
        assert_eq!(
            locks.request(1, 1, 10, 1, LockMode::Exclusive),
            LockRequest::Covered
        );
    }

    #[test]
    fn sole_holder_upgrades_in_place() {
        let locks = LockTable::new();
        let s = enqueue(&locks, 10, 1, LockMode::Shared);
        assert_eq!(
            locks.request(1, 1, 10, 1, LockMode::Exclusive),
            LockRequest::Covered
        );
        // The upgraded node now conflicts with other transactions.
        let other = enqueue(&locks, 10, 2, LockMode::Shared);
        assert_eq!(locks.conflicting_holders(other), vec![1]);
        locks.release(s);
        locks.wait_granted(other);
    }

    #[test]
    fn contended_upgrade_queues_behind_holders() {
        let locks = LockTable::new();
        let _own_s = enqueue(&locks, 10, 1, LockMode::Shared);
        let other_s = enqueue(&locks, 10, 2, LockMode::Shared);
        let upgrade = match locks.request(1, 1, 10, 1, LockMode::Exclusive) {
            LockRequest::Enqueued(id) => id,
            LockRequest::Covered => panic!("upgrade should queue behind the other holder"),
        };
        assert_eq!(locks.conflicting_holders(upgrade), vec![2]);
        locks.release(other_s);
        locks.wait_granted(upgrade);
    }
}
