use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Lsn, PageNum, TableId, TrxId};
use crate::index::btree::node::header;
use crate::storage::buffer::{BufferPool, BufferPoolError};
use crate::transaction::concurrency::lock_manager::{LockError, LockManager};
use crate::transaction::wal::log_manager::{LogError, LogManager};

#[derive(Error, Debug)]
pub enum TrxError {
    #[error("transaction {0} is not active")]
    InvalidTrx(TrxId),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Buffer(#[from] BufferPoolError),
}

pub type Result<T> = std::result::Result<T, TrxError>;

/// One entry of the in-memory undo log, enough to revert the update and to
/// emit the matching compensation record.
struct UndoEntry {
    table_id: TableId,
    page_num: PageNum,
    offset: u16,
    before: Vec<u8>,
    after: Vec<u8>,
    /// `prev_lsn` of the compensated update, i.e. the CLR's next-undo link
    update_prev_lsn: Lsn,
}

struct Transaction {
    #[allow(dead_code)]
    start_time: Instant,
    last_lsn: Lsn,
    undo: Vec<UndoEntry>,
}

struct TrxTables {
    counter: TrxId,
    active: HashMap<TrxId, Transaction>,
}

/// The active-transaction table plus begin/commit/abort.
///
/// Terminal operations remove the transaction from the table first, so the
/// rollback work runs without the table latch held (only page latches and
/// the log latch are taken while reverting).
pub struct TrxManager {
    locks: Arc<LockManager>,
    log: Arc<LogManager>,
    pool: Arc<BufferPool>,
    state: Mutex<TrxTables>,
}

impl TrxManager {
    pub fn new(locks: Arc<LockManager>, log: Arc<LogManager>, pool: Arc<BufferPool>) -> Self {
        Self {
            locks,
            log,
            pool,
            state: Mutex::new(TrxTables {
                counter: 1,
                active: HashMap::new(),
            }),
        }
    }

    /// Start a transaction: assign a fresh wrapping id (never zero), write
    /// the BEGIN record, and register the empty lock chain.
    pub fn begin(&self) -> TrxId {
        let trx_id = {
            let mut state = self.state.lock();
            while state.active.contains_key(&state.counter) {
                state.counter = Self::bump(state.counter);
            }
            let trx_id = state.counter;
            state.counter = Self::bump(trx_id);

            let lsn = self.log.append_begin(trx_id);
            state.active.insert(
                trx_id,
                Transaction {
                    start_time: Instant::now(),
                    last_lsn: lsn,
                    undo: Vec::new(),
                },
            );
            trx_id
        };
        self.locks.register_trx(trx_id);
        trx_id
    }

    fn bump(counter: TrxId) -> TrxId {
        if counter == TrxId::MAX {
            1
        } else {
            counter + 1
        }
    }

    /// Commit: write and flush the COMMIT record, discard the undo log and
    /// release every lock in reverse acquisition order.
    pub fn commit(&self, trx_id: TrxId) -> Result<TrxId> {
        let trx = self
            .state
            .lock()
            .active
            .remove(&trx_id)
            .ok_or(TrxError::InvalidTrx(trx_id))?;

        self.locks.set_releasing(trx_id);
        self.log.append_commit(trx_id, trx.last_lsn);
        self.log.flush()?;
        self.locks.release_all(trx_id);
        Ok(trx_id)
    }

    /// Abort: emit a CLR per undo entry while reverting the page under its
    /// latch, then a ROLLBACK record, then release the locks.
    pub fn abort(&self, trx_id: TrxId) -> Result<TrxId> {
        let trx = self
            .state
            .lock()
            .active
            .remove(&trx_id)
            .ok_or(TrxError::InvalidTrx(trx_id))?;
        debug!("aborting trx {} ({} updates to revert)", trx_id, trx.undo.len());

        self.locks.set_releasing(trx_id);

        let mut last_lsn = trx.last_lsn;
        for entry in trx.undo.iter().rev() {
            let clr_lsn = self.log.append_compensate(
                trx_id,
                last_lsn,
                entry.table_id,
                entry.page_num,
                entry.offset,
                entry.after.clone(),
                entry.before.clone(),
                entry.update_prev_lsn,
            );
            last_lsn = clr_lsn;

            let mut guard = self.pool.get_page(entry.table_id, entry.page_num)?;
            let off = entry.offset as usize;
            guard.page_mut().data[off..off + entry.before.len()].copy_from_slice(&entry.before);
            header::set_page_lsn(guard.page_mut(), clr_lsn);
            guard.mark_dirty();
        }

        self.log.append_rollback(trx_id, last_lsn);
        self.log.flush()?;
        self.locks.release_all(trx_id);
        Ok(trx_id)
    }

    /// Append an UPDATE record for an in-place write the caller is about to
    /// perform, and remember how to undo it. Returns the record's LSN for
    /// the caller to stamp into the page it has latched.
    pub fn log_update(
        &self,
        trx_id: TrxId,
        table_id: TableId,
        page_num: PageNum,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    ) -> Result<Lsn> {
        let mut state = self.state.lock();
        let trx = state
            .active
            .get_mut(&trx_id)
            .ok_or(TrxError::InvalidTrx(trx_id))?;

        let update_prev_lsn = trx.last_lsn;
        let lsn = self.log.append_update(
            trx_id,
            update_prev_lsn,
            table_id,
            page_num,
            offset,
            before.clone(),
            after.clone(),
        );
        trx.last_lsn = lsn;
        trx.undo.push(UndoEntry {
            table_id,
            page_num,
            offset,
            before,
            after,
            update_prev_lsn,
        });
        Ok(lsn)
    }

    pub fn is_active(&self, trx_id: TrxId) -> bool {
        self.state.lock().active.contains_key(&trx_id)
    }

    /// Ids of every transaction still in flight (shutdown aborts them).
    pub fn active_ids(&self) -> Vec<TrxId> {
        self.state.lock().active.keys().copied().collect()
    }

    /// Seed the id counter past every transaction id seen in the log.
    pub fn seed_counter(&self, max_trx_id: TrxId) {
        let mut state = self.state.lock();
        if state.counter <= max_trx_id {
            state.counter = Self::bump(max_trx_id);
        }
    }

    /// Register a loser found by recovery analysis, carrying its last LSN.
    pub fn adopt_loser(&self, trx_id: TrxId, last_lsn: Lsn) {
        self.state.lock().active.insert(
            trx_id,
            Transaction {
                start_time: Instant::now(),
                last_lsn,
                undo: Vec::new(),
            },
        );
    }

    /// Drop a loser once recovery has rolled it back.
    pub fn discard(&self, trx_id: TrxId) {
        self.state.lock().active.remove(&trx_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::btree::node::leaf;
    use crate::storage::disk::FileManager;
    use tempfile::TempDir;

    fn setup() -> (Arc<TrxManager>, Arc<BufferPool>, TableId, PageNum, TempDir) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(FileManager::new(dir.path().join("catalog.tables")).unwrap());
        let log = Arc::new(LogManager::open(dir.path().join("wal.log")).unwrap());
        let pool = Arc::new(BufferPool::new(8, disk.clone(), log.clone()));
        let locks = Arc::new(LockManager::new(pool.clone()));
        let trxs = Arc::new(TrxManager::new(locks, log, pool.clone()));

        let table_id = disk.open_table(dir.path().join("t.db")).unwrap();
        let pagenum = pool.alloc_page(table_id).unwrap();
        {
            let mut guard = pool.get_page(table_id, pagenum).unwrap();
            leaf::init(guard.page_mut(), 0);
            leaf::insert(guard.page_mut(), 1, &[7u8; 50]);
            guard.mark_dirty();
        }
        (trxs, pool, table_id, pagenum, dir)
    }

    #[test]
    fn test_begin_assigns_distinct_positive_ids() {
        let (trxs, _pool, _tid, _page, _dir) = setup();
        let a = trxs.begin();
        let b = trxs.begin();
        assert!(a > 0 && b > 0 && a != b);
        assert!(trxs.is_active(a) && trxs.is_active(b));
    }

    #[test]
    fn test_terminal_ops_on_unknown_trx_fail() {
        let (trxs, _pool, _tid, _page, _dir) = setup();
        assert!(matches!(trxs.commit(42), Err(TrxError::InvalidTrx(42))));
        assert!(matches!(trxs.abort(42), Err(TrxError::InvalidTrx(42))));
    }

    #[test]
    fn test_commit_removes_transaction() {
        let (trxs, _pool, _tid, _page, _dir) = setup();
        let trx = trxs.begin();
        trxs.commit(trx).unwrap();
        assert!(!trxs.is_active(trx));
        assert!(matches!(trxs.commit(trx), Err(TrxError::InvalidTrx(_))));
    }

    #[test]
    fn test_abort_restores_old_images_in_lifo_order() {
        let (trxs, pool, tid, page, _dir) = setup();
        let trx = trxs.begin();

        // two chained updates of the same record, the way the tree applies
        // them: log first, then write under the page latch
        let offset = {
            let guard = pool.get_page(tid, page).unwrap();
            leaf::slot(guard.page(), 0).offset
        };
        for step in [8u8, 9u8] {
            let (before, after) = {
                let guard = pool.get_page(tid, page).unwrap();
                let off = offset as usize;
                (guard.page().data[off..off + 50].to_vec(), vec![step; 50])
            };
            let lsn = trxs
                .log_update(trx, tid, page, offset, before, after.clone())
                .unwrap();
            let mut guard = pool.get_page(tid, page).unwrap();
            let off = offset as usize;
            guard.page_mut().data[off..off + 50].copy_from_slice(&after);
            header::set_page_lsn(guard.page_mut(), lsn);
            guard.mark_dirty();
        }

        trxs.abort(trx).unwrap();

        let guard = pool.get_page(tid, page).unwrap();
        let off = offset as usize;
        assert!(guard.page().data[off..off + 50].iter().all(|&b| b == 7));
    }

    #[test]
    fn test_seed_counter_skips_recovered_ids() {
        let (trxs, _pool, _tid, _page, _dir) = setup();
        trxs.seed_counter(10);
        let trx = trxs.begin();
        assert!(trx > 10);
    }
}
