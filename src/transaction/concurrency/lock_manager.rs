//! Record-granular S/X lock table.
//!
//! Locks hang off FIFO lists keyed by `(table_id, page_id)`; each lock
//! covers slot positions of that page through a 64-bit bitmap, so shared
//! scans compress into one object per page. Exclusive locks on uncontended
//! records are implicit: the owning transaction id is written into the leaf
//! slot and a dummy entry is attached to the owner for cleanup, converted
//! into an explicit list entry the moment another transaction shows up.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::common::types::{PageNum, TableId, TrxId};
use crate::index::btree::node::leaf;
use crate::storage::buffer::{BufferPool, BufferPoolError};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("deadlock detected, transaction {0} must abort")]
    Deadlock(TrxId),

    #[error("no record with key {0} on the locked page")]
    NoSuchRecord(i64),

    #[error("transaction {0} is not active")]
    InvalidTrx(TrxId),

    #[error(transparent)]
    Buffer(#[from] BufferPoolError),
}

pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Result of a successful `acquire`. `waited` tells the caller that the
/// tree may have shifted underneath it while it was suspended, so the
/// traversal must be retried from the root.
#[derive(Debug, Clone, Copy)]
pub struct AcquireOutcome {
    pub waited: bool,
}

type LockId = u64;

struct Lock {
    table_id: TableId,
    page_id: PageNum,
    record_key: i64,
    mode: LockMode,
    bitmap: u64,
    owner: TrxId,
    /// dummies (implicit-lock placeholders) never sit in a lock list
    in_list: bool,
    cond: Arc<Condvar>,
}

#[derive(Default)]
struct TrxLocks {
    /// explicit locks, in acquisition order
    held: Vec<LockId>,
    /// implicit-lock placeholders
    dummies: Vec<LockId>,
    releasing: bool,
}

#[derive(Default)]
struct LockState {
    lists: HashMap<(TableId, PageNum), Vec<LockId>>,
    locks: HashMap<LockId, Lock>,
    chains: HashMap<TrxId, TrxLocks>,
    next_lock_id: LockId,
}

/// The lock table. One latch guards list membership, the per-transaction
/// chains and condition-variable signaling; waiting releases it.
pub struct LockManager {
    state: Mutex<LockState>,
    pool: Arc<BufferPool>,
}

impl LockManager {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            pool,
        }
    }

    /// Track a transaction so its locks can be chained and released.
    pub fn register_trx(&self, trx_id: TrxId) {
        self.state.lock().chains.insert(trx_id, TrxLocks::default());
    }

    pub fn is_registered(&self, trx_id: TrxId) -> bool {
        self.state.lock().chains.contains_key(&trx_id)
    }

    /// Mark a transaction as on its way out, so deadlock detection stops
    /// treating its locks as blocking.
    pub fn set_releasing(&self, trx_id: TrxId) {
        if let Some(chain) = self.state.lock().chains.get_mut(&trx_id) {
            chain.releasing = true;
        }
    }

    /// Acquire an S or X lock on `key` of `page_id`. Implicit locks are
    /// converted or taken as appropriate; on conflict the calling thread
    /// waits on the lock's condition variable. Deadlock aborts the request.
    pub fn acquire(
        &self,
        table_id: TableId,
        page_id: PageNum,
        key: i64,
        trx_id: TrxId,
        mode: LockMode,
    ) -> Result<AcquireOutcome> {
        let mut state = self.state.lock();

        let slotnum = match self.convert_implicit_lock(&mut state, table_id, page_id, key, trx_id)? {
            Some(slotnum) => slotnum,
            None => return Err(LockError::NoSuchRecord(key)),
        };

        if !state.chains.contains_key(&trx_id) {
            return Err(LockError::InvalidTrx(trx_id));
        }

        if mode == LockMode::Exclusive
            && self.try_implicit_lock(&mut state, table_id, page_id, key, trx_id, slotnum)?
        {
            return Ok(AcquireOutcome { waited: false });
        }

        // the transaction may already hold a covering lock of this mode
        if let Some(list) = state.lists.get(&(table_id, page_id)) {
            for &id in list {
                let lock = &state.locks[&id];
                if lock.bitmap & (1u64 << slotnum) != 0
                    && lock.mode == mode
                    && lock.owner == trx_id
                {
                    return Ok(AcquireOutcome { waited: false });
                }
            }
        }

        // lock compression: extend an existing same-transaction S lock on
        // this page when no conflict would be introduced
        if mode == LockMode::Shared {
            let probe = Lock {
                table_id,
                page_id,
                record_key: key,
                mode,
                bitmap: 1u64 << slotnum,
                owner: trx_id,
                in_list: false,
                cond: Arc::new(Condvar::new()),
            };
            if Self::find_conflicting(&state, &probe, None).is_none() {
                let target = state
                    .lists
                    .get(&(table_id, page_id))
                    .and_then(|list| {
                        list.iter()
                            .copied()
                            .find(|id| {
                                let l = &state.locks[id];
                                l.mode == LockMode::Shared && l.owner == trx_id
                            })
                    });
                if let Some(id) = target {
                    state.locks.get_mut(&id).unwrap().bitmap |= 1u64 << slotnum;
                    return Ok(AcquireOutcome { waited: false });
                }
            }
        }

        // create the explicit lock and chain it to the transaction
        let lock_id = Self::insert_lock(
            &mut state,
            Lock {
                table_id,
                page_id,
                record_key: key,
                mode,
                bitmap: 1u64 << slotnum,
                owner: trx_id,
                in_list: false,
                cond: Arc::new(Condvar::new()),
            },
        );
        state.chains.get_mut(&trx_id).unwrap().held.push(lock_id);

        if Self::is_deadlock(&state, lock_id) {
            debug!("deadlock: aborting requester trx {}", trx_id);
            let chain = state.chains.get_mut(&trx_id).unwrap();
            chain.held.retain(|&id| id != lock_id);
            state.locks.remove(&lock_id);
            return Err(LockError::Deadlock(trx_id));
        }

        state
            .lists
            .entry((table_id, page_id))
            .or_default()
            .push(lock_id);
        state.locks.get_mut(&lock_id).unwrap().in_list = true;

        let mut waited = false;
        loop {
            let blocker = {
                let lock = &state.locks[&lock_id];
                Self::find_conflicting(&state, lock, Some(lock_id))
            };
            if blocker.is_none() {
                break;
            }
            waited = true;
            let cond = state.locks[&lock_id].cond.clone();
            cond.wait(&mut state);
        }

        Ok(AcquireOutcome { waited })
    }

    /// Release everything a transaction holds: destroy its dummy locks
    /// (without signaling) and unlink its explicit locks in reverse order of
    /// acquisition, waking unblocked successors.
    pub fn release_all(&self, trx_id: TrxId) {
        let mut state = self.state.lock();
        let Some(chain) = state.chains.remove(&trx_id) else {
            return;
        };

        for id in chain.dummies {
            state.locks.remove(&id);
        }
        for id in chain.held.into_iter().rev() {
            Self::release_one(&mut state, id);
        }
    }

    fn release_one(state: &mut LockState, lock_id: LockId) {
        let Some(lock) = state.locks.remove(&lock_id) else {
            return;
        };
        let key = (lock.table_id, lock.page_id);
        let mut successors = Vec::new();
        if let Some(list) = state.lists.get_mut(&key) {
            if let Some(pos) = list.iter().position(|&id| id == lock_id) {
                list.remove(pos);
                successors = list[pos..].to_vec();
            }
            if list.is_empty() {
                state.lists.remove(&key);
            }
        }
        for id in successors {
            let succ = &state.locks[&id];
            if succ.bitmap & lock.bitmap != 0
                && Self::find_conflicting(state, succ, Some(id)).is_none()
            {
                succ.cond.notify_all();
            }
        }
    }

    /// Locate `key`'s slot on the page; if the slot carries an implicit lock
    /// of another still-active transaction, turn it into an explicit X lock
    /// at the tail of the page's lock list. Returns the slot number, or
    /// `None` when the page has no such record.
    fn convert_implicit_lock(
        &self,
        state: &mut LockState,
        table_id: TableId,
        page_id: PageNum,
        key: i64,
        trx_id: TrxId,
    ) -> Result<Option<usize>> {
        let mut guard = self.pool.get_page(table_id, page_id)?;
        let Some(slotnum) = leaf::find_slot(guard.page(), key) else {
            return Ok(None);
        };

        let holder = leaf::slot(guard.page(), slotnum).owner_trx;
        if holder == 0 || holder == trx_id || !state.chains.contains_key(&holder) {
            return Ok(Some(slotnum));
        }

        leaf::set_owner_trx(guard.page_mut(), slotnum, 0);
        guard.mark_dirty();
        drop(guard);

        // promote the holder's dummy placeholder into the real lock list
        let pos = {
            let chain = &state.chains[&holder];
            chain.dummies.iter().position(|id| {
                let l = &state.locks[id];
                l.table_id == table_id
                    && l.page_id == page_id
                    && l.record_key == key
                    && l.bitmap & (1u64 << slotnum) != 0
            })
        };
        let Some(pos) = pos else {
            return Err(LockError::InvalidTrx(holder));
        };
        let chain = state.chains.get_mut(&holder).unwrap();
        let dummy_id = chain.dummies.remove(pos);
        chain.held.push(dummy_id);
        state.locks.get_mut(&dummy_id).unwrap().in_list = true;
        state
            .lists
            .entry((table_id, page_id))
            .or_default()
            .push(dummy_id);

        debug!(
            "implicit lock of trx {} on ({}, {}, slot {}) made explicit",
            holder, table_id, page_id, slotnum
        );
        Ok(Some(slotnum))
    }

    /// Take an X lock implicitly when no lock covers the slot: record the
    /// owner in the slot itself and stash a dummy entry on the transaction.
    fn try_implicit_lock(
        &self,
        state: &mut LockState,
        table_id: TableId,
        page_id: PageNum,
        key: i64,
        trx_id: TrxId,
        slotnum: usize,
    ) -> Result<bool> {
        if let Some(list) = state.lists.get(&(table_id, page_id)) {
            for &id in list {
                let lock = &state.locks[&id];
                if lock.bitmap & (1u64 << slotnum) != 0 {
                    // only this transaction's own S lock may coexist
                    if !(lock.owner == trx_id && lock.mode == LockMode::Shared) {
                        return Ok(false);
                    }
                }
            }
        }

        let mut guard = self.pool.get_page(table_id, page_id)?;
        match leaf::find_slot(guard.page(), key) {
            Some(i) if i == slotnum => {}
            _ => return Err(LockError::NoSuchRecord(key)),
        }
        leaf::set_owner_trx(guard.page_mut(), slotnum, trx_id);
        guard.mark_dirty();
        drop(guard);

        let dummy_id = Self::insert_lock(
            state,
            Lock {
                table_id,
                page_id,
                record_key: key,
                mode: LockMode::Exclusive,
                bitmap: 1u64 << slotnum,
                owner: trx_id,
                in_list: false,
                cond: Arc::new(Condvar::new()),
            },
        );
        state.chains.get_mut(&trx_id).unwrap().dummies.push(dummy_id);
        Ok(true)
    }

    fn insert_lock(state: &mut LockState, lock: Lock) -> LockId {
        let id = state.next_lock_id;
        state.next_lock_id += 1;
        state.locks.insert(id, lock);
        id
    }

    fn is_conflicting(a: &Lock, b: &Lock) -> bool {
        if a.table_id != b.table_id || a.page_id != b.page_id {
            return false;
        }
        if a.bitmap & b.bitmap == 0 || a.owner == b.owner {
            return false;
        }
        a.mode == LockMode::Exclusive || b.mode == LockMode::Exclusive
    }

    /// First lock ahead of `lock` in its list that conflicts with it. A lock
    /// not yet in the list scans the whole list.
    fn find_conflicting(state: &LockState, lock: &Lock, self_id: Option<LockId>) -> Option<LockId> {
        let list = state.lists.get(&(lock.table_id, lock.page_id))?;
        for &id in list {
            if Some(id) == self_id {
                break;
            }
            if Self::is_conflicting(&state.locks[&id], lock) {
                return Some(id);
            }
        }
        None
    }

    /// A transaction is running iff none of its held locks waits behind a
    /// conflicting predecessor.
    fn is_running(state: &LockState, trx_id: TrxId) -> bool {
        let Some(chain) = state.chains.get(&trx_id) else {
            return true;
        };
        chain.held.iter().all(|id| {
            let lock = &state.locks[id];
            !lock.in_list || Self::find_conflicting(state, lock, Some(*id)).is_none()
        })
    }

    /// DFS over the waits-for graph: does some transaction blocking `target`
    /// lead back to `checking`? Running owners terminate the walk.
    fn wait_path_reaches(state: &LockState, checking: TrxId, target: TrxId) -> bool {
        let Some(chain) = state.chains.get(&target) else {
            return false;
        };
        if Self::is_running(state, target) {
            return false;
        }
        for &lid in &chain.held {
            let lock = &state.locks[&lid];
            if !lock.in_list {
                continue;
            }
            let Some(list) = state.lists.get(&(lock.table_id, lock.page_id)) else {
                continue;
            };
            for &id in list {
                if id == lid {
                    break;
                }
                let other = &state.locks[&id];
                if Self::is_conflicting(other, lock) {
                    if other.owner == checking {
                        return true;
                    }
                    if Self::wait_path_reaches(state, checking, other.owner) {
                        return true;
                    }
                    // locks behind the first X cannot run either way
                    if other.mode == LockMode::Exclusive {
                        break;
                    }
                }
            }
        }
        false
    }

    /// Would `lock_id` (not yet in its list) close a waits-for cycle back to
    /// its owner?
    fn is_deadlock(state: &LockState, lock_id: LockId) -> bool {
        let lock = &state.locks[&lock_id];
        let checking = lock.owner;
        let Some(list) = state.lists.get(&(lock.table_id, lock.page_id)) else {
            return false;
        };
        for &id in list {
            if id == lock_id {
                break;
            }
            let other = &state.locks[&id];
            if Self::is_conflicting(other, lock) {
                let blocker_releasing = state
                    .chains
                    .get(&other.owner)
                    .map(|c| c.releasing)
                    .unwrap_or(true);
                if !blocker_releasing && Self::wait_path_reaches(state, checking, other.owner) {
                    return true;
                }
                if other.mode == LockMode::Exclusive {
                    break;
                }
            }
        }
        false
    }
}
