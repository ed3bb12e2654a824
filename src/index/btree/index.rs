use std::sync::Arc;

use log::warn;

use crate::common::types::{
    Page, PageNum, TableId, TrxId, HEADER_PAGENUM, MAX_RECORD_SIZE, MIN_RECORD_SIZE, PAGE_SIZE,
};
use crate::index::btree::node::{
    header, internal, leaf, LeafSlot, LEAF_SLOT_SIZE, MAX_INTERNAL_ENTRIES, NODE_HEADER_SIZE,
};
use crate::index::btree::{BTreeError, Result};
use crate::storage::buffer::BufferPool;
use crate::storage::disk::file_manager::header_page;
use crate::transaction::concurrency::lock_manager::{LockError, LockManager, LockMode};
use crate::transaction::concurrency::transaction_manager::TrxManager;

/// Transactional plumbing handed into `find`/`update`: the record lock is
/// taken before the page latch, and a wait forces a fresh traversal.
pub struct TrxContext<'a> {
    pub trx_id: TrxId,
    pub locks: &'a LockManager,
    pub trxs: &'a TrxManager,
}

/// Clustered B+-tree over one table's paged file. The root page number
/// lives in the file header and is re-read on every operation.
pub struct BTree {
    pool: Arc<BufferPool>,
}

impl BTree {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub(crate) fn root(&self, table_id: TableId) -> Result<PageNum> {
        let guard = self.pool.get_page(table_id, HEADER_PAGENUM)?;
        Ok(header_page::root_page_number(guard.page()))
    }

    pub(crate) fn set_root(&self, table_id: TableId, root: PageNum) -> Result<()> {
        let mut guard = self.pool.get_page(table_id, HEADER_PAGENUM)?;
        header_page::set_root_page_number(guard.page_mut(), root);
        guard.mark_dirty();
        Ok(())
    }

    /// Descend from the root to the leaf that would hold `key`.
    pub fn find_leaf(&self, table_id: TableId, key: i64) -> Result<Option<PageNum>> {
        let root = self.root(table_id)?;
        if root == 0 {
            return Ok(None);
        }
        let mut pagenum = root;
        loop {
            let guard = self.pool.get_page(table_id, pagenum)?;
            if header::is_leaf(guard.page()) {
                return Ok(Some(pagenum));
            }
            let child = internal::child_for(guard.page(), key);
            if child == 0 {
                return Err(BTreeError::CorruptTree(format!(
                    "internal page {} routes key {} to page 0",
                    pagenum, key
                )));
            }
            pagenum = child;
        }
    }

    /// Look a record up. With a transaction context the leaf's record is
    /// S-locked before the payload is read; a lock wait retries the
    /// traversal from a freshly read root.
    pub fn find(
        &self,
        table_id: TableId,
        key: i64,
        trx: Option<&TrxContext>,
    ) -> Result<Option<(u16, Vec<u8>)>> {
        let mut locked = false;
        loop {
            let Some(leaf_pagenum) = self.find_leaf(table_id, key)? else {
                return Ok(None);
            };

            if let Some(ctx) = trx {
                if !locked {
                    let outcome = match ctx.locks.acquire(
                        table_id,
                        leaf_pagenum,
                        key,
                        ctx.trx_id,
                        LockMode::Shared,
                    ) {
                        Ok(outcome) => outcome,
                        Err(LockError::NoSuchRecord(_)) => return Ok(None),
                        Err(e) => return Err(e.into()),
                    };
                    locked = true;
                    if outcome.waited {
                        // the tree may have split or merged while we slept
                        continue;
                    }
                }
            }

            let guard = self.pool.get_page(table_id, leaf_pagenum)?;
            return Ok(leaf::find_slot(guard.page(), key).map(|i| {
                let slot = leaf::slot(guard.page(), i);
                (slot.size, leaf::payload(guard.page(), &slot).to_vec())
            }));
        }
    }

    /// Overwrite a record in place under an X lock. A shrinking update
    /// keeps the stored slot size and rewrites only the new-value prefix.
    /// Returns the old stored size, or `None` when the key is absent.
    pub fn update(
        &self,
        table_id: TableId,
        key: i64,
        new_value: &[u8],
        trx: Option<&TrxContext>,
    ) -> Result<Option<u16>> {
        let mut locked = false;
        loop {
            let Some(leaf_pagenum) = self.find_leaf(table_id, key)? else {
                return Ok(None);
            };

            if let Some(ctx) = trx {
                if !locked {
                    let outcome = match ctx.locks.acquire(
                        table_id,
                        leaf_pagenum,
                        key,
                        ctx.trx_id,
                        LockMode::Exclusive,
                    ) {
                        Ok(outcome) => outcome,
                        Err(LockError::NoSuchRecord(_)) => return Ok(None),
                        Err(e) => return Err(e.into()),
                    };
                    locked = true;
                    if outcome.waited {
                        continue;
                    }
                }
            }

            let mut guard = self.pool.get_page(table_id, leaf_pagenum)?;
            let Some(slotnum) = leaf::find_slot(guard.page(), key) else {
                return Ok(None);
            };
            let slot = leaf::slot(guard.page(), slotnum);
            let copy_len = (new_value.len() as u16).min(slot.size) as usize;
            let off = slot.offset as usize;

            if let Some(ctx) = trx {
                let before = guard.page().data[off..off + copy_len].to_vec();
                let after = new_value[..copy_len].to_vec();
                let lsn = ctx.trxs.log_update(
                    ctx.trx_id,
                    table_id,
                    leaf_pagenum,
                    slot.offset,
                    before,
                    after,
                )?;
                guard.page_mut().data[off..off + copy_len].copy_from_slice(&new_value[..copy_len]);
                header::set_page_lsn(guard.page_mut(), lsn);
            } else {
                guard.page_mut().data[off..off + copy_len].copy_from_slice(&new_value[..copy_len]);
            }
            guard.mark_dirty();
            return Ok(Some(slot.size));
        }
    }

    /// Insert a record; duplicate keys are rejected.
    pub fn insert(&self, table_id: TableId, key: i64, value: &[u8]) -> Result<()> {
        let size = value.len() as u16;
        if !(MIN_RECORD_SIZE..=MAX_RECORD_SIZE).contains(&size) {
            return Err(BTreeError::InvalidSize(size));
        }
        if self.find(table_id, key, None)?.is_some() {
            return Err(BTreeError::DuplicateKey(key));
        }

        let root = self.root(table_id)?;

        // an empty tree grows its first leaf as the root
        if root == 0 {
            let new_root = self.pool.alloc_page(table_id)?;
            let mut guard = self.pool.get_page(table_id, new_root)?;
            leaf::init(guard.page_mut(), 0);
            leaf::insert(guard.page_mut(), key, value);
            guard.mark_dirty();
            drop(guard);
            self.set_root(table_id, new_root)?;
            return Ok(());
        }

        let leaf_pagenum = self
            .find_leaf(table_id, key)?
            .ok_or_else(|| BTreeError::CorruptTree("root vanished during insert".into()))?;

        let mut guard = self.pool.get_page(table_id, leaf_pagenum)?;
        let required = (LEAF_SLOT_SIZE + value.len()) as u64;
        if leaf::free_space(guard.page()) >= required {
            leaf::insert(guard.page_mut(), key, value);
            guard.mark_dirty();
            return Ok(());
        }
        drop(guard);

        let new_root = self.insert_into_leaf_after_splitting(table_id, root, leaf_pagenum, key, value)?;
        if new_root != root {
            self.set_root(table_id, new_root)?;
        }
        Ok(())
    }

    /// Split a full leaf around a byte-balanced point and push the right
    /// page's first key into the parent. Returns the (possibly new) root.
    fn insert_into_leaf_after_splitting(
        &self,
        table_id: TableId,
        root: PageNum,
        pagenum: PageNum,
        key: i64,
        value: &[u8],
    ) -> Result<PageNum> {
        let guard = self.pool.get_page(table_id, pagenum)?;
        let parent = header::parent(guard.page());
        let old_num_keys = header::num_keys(guard.page());
        let old_right_sibling = leaf::right_sibling(guard.page());

        // sorted slot sequence with the new entry spliced in
        let insert_idx = (0..old_num_keys)
            .find(|&i| leaf::slot(guard.page(), i).key > key)
            .unwrap_or(old_num_keys);
        let mut entries: Vec<(LeafSlot, bool)> = Vec::with_capacity(old_num_keys + 1);
        for i in 0..old_num_keys {
            entries.push((leaf::slot(guard.page(), i), false));
        }
        entries.insert(
            insert_idx,
            (
                LeafSlot {
                    key,
                    size: value.len() as u16,
                    offset: 0,
                    owner_trx: 0,
                },
                true,
            ),
        );

        // split index minimizing the distance from half the used bytes
        let total: u64 = entries
            .iter()
            .map(|(s, _)| (LEAF_SLOT_SIZE + s.size as usize) as u64)
            .sum();
        let half = total / 2;
        let mut split = 0;
        let mut cum = 0u64;
        let mut best_gap = u64::MAX;
        for (i, (slot, _)) in entries.iter().enumerate() {
            cum += (LEAF_SLOT_SIZE + slot.size as usize) as u64;
            let gap = cum.abs_diff(half);
            if gap <= best_gap {
                best_gap = gap;
                split = i;
            } else {
                break;
            }
        }

        let sibling = self.pool.alloc_page(table_id)?;

        let mut left_page = Page::new();
        let mut right_page = Page::new();
        leaf::init(&mut left_page, parent);
        leaf::init(&mut right_page, parent);

        for (i, (slot, is_new)) in entries.iter().enumerate() {
            let dest = if i <= split {
                &mut left_page
            } else {
                &mut right_page
            };
            if *is_new {
                leaf::insert(dest, slot.key, value);
            } else {
                let payload = leaf::payload(guard.page(), slot).to_vec();
                leaf::insert(dest, slot.key, &payload);
                let n = header::num_keys(dest);
                if slot.owner_trx != 0 {
                    leaf::set_owner_trx(dest, n - 1, slot.owner_trx);
                }
            }
        }

        leaf::set_right_sibling(&mut left_page, sibling);
        leaf::set_right_sibling(&mut right_page, old_right_sibling);
        let mid_key = leaf::slot(&right_page, 0).key;

        drop(guard);
        let mut left_guard = self.pool.get_page(table_id, pagenum)?;
        left_guard.page_mut().data.copy_from_slice(&left_page.data);
        left_guard.mark_dirty();
        drop(left_guard);

        let mut right_guard = self.pool.get_page(table_id, sibling)?;
        right_guard.page_mut().data.copy_from_slice(&right_page.data);
        right_guard.mark_dirty();
        drop(right_guard);

        self.insert_into_parent(table_id, root, parent, pagenum, mid_key, sibling)
    }

    /// Hang `right` (with separator `key`) off `left`'s parent, splitting
    /// upward as needed. Returns the (possibly new) root.
    pub(crate) fn insert_into_parent(
        &self,
        table_id: TableId,
        root: PageNum,
        parent: PageNum,
        left: PageNum,
        key: i64,
        right: PageNum,
    ) -> Result<PageNum> {
        if parent == 0 {
            return self.insert_into_new_root(table_id, left, key, right);
        }

        let guard = self.pool.get_page(table_id, parent)?;
        let num_keys = header::num_keys(guard.page());

        // position of `left` among the parent's children; -1 = first child
        let left_idx = if internal::first_child(guard.page()) == left {
            -1
        } else {
            match (0..num_keys).find(|&i| internal::entry(guard.page(), i).1 == left) {
                Some(i) => i as i64,
                None => {
                    return Err(BTreeError::CorruptTree(format!(
                        "page {} not found under parent {}",
                        left, parent
                    )))
                }
            }
        };

        if num_keys < MAX_INTERNAL_ENTRIES {
            drop(guard);
            self.insert_into_internal(table_id, parent, left_idx, key, right)?;
            return Ok(root);
        }

        drop(guard);
        self.insert_into_internal_after_splitting(table_id, root, parent, left_idx, key, right)
    }

    /// Plain internal insert: shift the entries right of `left_idx` and
    /// splice `(key, child)` in; rewrites the child's parent pointer.
    fn insert_into_internal(
        &self,
        table_id: TableId,
        pagenum: PageNum,
        left_idx: i64,
        key: i64,
        child: PageNum,
    ) -> Result<()> {
        let mut guard = self.pool.get_page(table_id, pagenum)?;
        let num_keys = header::num_keys(guard.page());
        let at = (left_idx + 1) as usize;

        for i in (at..num_keys).rev() {
            let (k, c) = internal::entry(guard.page(), i);
            internal::set_entry(guard.page_mut(), i + 1, k, c);
        }
        internal::set_entry(guard.page_mut(), at, key, child);
        header::set_num_keys(guard.page_mut(), num_keys + 1);
        guard.mark_dirty();
        drop(guard);

        self.set_parent(table_id, child, pagenum)
    }

    /// Median split of a full internal page; the median key is promoted,
    /// not kept, and every migrated child's parent pointer is rewritten.
    fn insert_into_internal_after_splitting(
        &self,
        table_id: TableId,
        root: PageNum,
        pagenum: PageNum,
        left_idx: i64,
        key: i64,
        child: PageNum,
    ) -> Result<PageNum> {
        let guard = self.pool.get_page(table_id, pagenum)?;
        let parent = header::parent(guard.page());
        let old_num_keys = header::num_keys(guard.page());
        let first_child = internal::first_child(guard.page());

        let mut entries: Vec<(i64, PageNum)> = (0..old_num_keys)
            .map(|i| internal::entry(guard.page(), i))
            .collect();
        entries.insert((left_idx + 1) as usize, (key, child));
        drop(guard);

        self.set_parent(table_id, child, pagenum)?;

        let new_num = entries.len();
        let split = new_num / 2 + new_num % 2;

        let sibling = self.pool.alloc_page(table_id)?;

        {
            let mut guard = self.pool.get_page(table_id, pagenum)?;
            let page = guard.page_mut();
            internal::init(page, parent);
            internal::set_first_child(page, first_child);
            for (i, &(k, c)) in entries[..split].iter().enumerate() {
                internal::set_entry(page, i, k, c);
            }
            header::set_num_keys(page, split);
            guard.mark_dirty();
        }

        let (mid_key, promoted_child) = entries[split];
        {
            let mut guard = self.pool.get_page(table_id, sibling)?;
            let page = guard.page_mut();
            internal::init(page, parent);
            internal::set_first_child(page, promoted_child);
            for (i, &(k, c)) in entries[split + 1..].iter().enumerate() {
                internal::set_entry(page, i, k, c);
            }
            header::set_num_keys(page, new_num - split - 1);
            guard.mark_dirty();
        }

        self.set_parent(table_id, promoted_child, sibling)?;
        for &(_, c) in &entries[split + 1..] {
            self.set_parent(table_id, c, sibling)?;
        }

        self.insert_into_parent(table_id, root, parent, pagenum, mid_key, sibling)
    }

    fn insert_into_new_root(
        &self,
        table_id: TableId,
        left: PageNum,
        key: i64,
        right: PageNum,
    ) -> Result<PageNum> {
        let new_root = self.pool.alloc_page(table_id)?;
        {
            let mut guard = self.pool.get_page(table_id, new_root)?;
            let page = guard.page_mut();
            internal::init(page, 0);
            internal::set_first_child(page, left);
            internal::set_entry(page, 0, key, right);
            header::set_num_keys(page, 1);
            guard.mark_dirty();
        }
        self.set_parent(table_id, left, new_root)?;
        self.set_parent(table_id, right, new_root)?;
        Ok(new_root)
    }

    pub(crate) fn set_parent(
        &self,
        table_id: TableId,
        pagenum: PageNum,
        parent: PageNum,
    ) -> Result<()> {
        let mut guard = self.pool.get_page(table_id, pagenum)?;
        header::set_parent(guard.page_mut(), parent);
        guard.mark_dirty();
        Ok(())
    }

    /// Swap one separator key of an internal page.
    pub(crate) fn change_key(
        &self,
        table_id: TableId,
        pagenum: PageNum,
        from: i64,
        to: i64,
    ) -> Result<()> {
        let mut guard = self.pool.get_page(table_id, pagenum)?;
        let num_keys = header::num_keys(guard.page());
        for i in 0..num_keys {
            let (k, c) = internal::entry(guard.page(), i);
            if k == from {
                internal::set_entry(guard.page_mut(), i, to, c);
                guard.mark_dirty();
                return Ok(());
            }
        }
        warn!("separator {} not found in internal page {}", from, pagenum);
        Err(BTreeError::CorruptTree(format!(
            "separator {} missing from page {}",
            from, pagenum
        )))
    }

    /// Validate the subtree invariants; used by tests. Returns the number
    /// of records found.
    pub fn validate(&self, table_id: TableId) -> Result<u64> {
        let root = self.root(table_id)?;
        if root == 0 {
            return Ok(0);
        }
        self.validate_subtree(table_id, root, 0, i64::MIN, i64::MAX)
    }

    fn validate_subtree(
        &self,
        table_id: TableId,
        pagenum: PageNum,
        expected_parent: PageNum,
        low: i64,
        high: i64,
    ) -> Result<u64> {
        let guard = self.pool.get_page(table_id, pagenum)?;
        if header::parent(guard.page()) != expected_parent {
            return Err(BTreeError::CorruptTree(format!(
                "page {} has parent {}, expected {}",
                pagenum,
                header::parent(guard.page()),
                expected_parent
            )));
        }
        let num_keys = header::num_keys(guard.page());

        if header::is_leaf(guard.page()) {
            let mut used = 0u64;
            for i in 0..num_keys {
                let slot = leaf::slot(guard.page(), i);
                if slot.key < low || slot.key >= high {
                    return Err(BTreeError::CorruptTree(format!(
                        "leaf {} key {} outside [{}, {})",
                        pagenum, slot.key, low, high
                    )));
                }
                if i > 0 && leaf::slot(guard.page(), i - 1).key >= slot.key {
                    return Err(BTreeError::CorruptTree(format!(
                        "leaf {} keys out of order at slot {}",
                        pagenum, i
                    )));
                }
                if (slot.offset as usize) < NODE_HEADER_SIZE
                    || slot.offset as usize + slot.size as usize > PAGE_SIZE
                {
                    return Err(BTreeError::CorruptTree(format!(
                        "leaf {} slot {} points outside the payload heap",
                        pagenum, i
                    )));
                }
                used += (LEAF_SLOT_SIZE + slot.size as usize) as u64;
            }
            let expect_free = (PAGE_SIZE - NODE_HEADER_SIZE) as u64 - used;
            if leaf::free_space(guard.page()) != expect_free {
                return Err(BTreeError::CorruptTree(format!(
                    "leaf {} free_space {} != expected {}",
                    pagenum,
                    leaf::free_space(guard.page()),
                    expect_free
                )));
            }
            return Ok(num_keys as u64);
        }

        let mut total = 0u64;
        let mut bounds = Vec::with_capacity(num_keys + 1);
        bounds.push((internal::first_child(guard.page()), low, {
            if num_keys > 0 {
                internal::entry(guard.page(), 0).0
            } else {
                high
            }
        }));
        for i in 0..num_keys {
            let (k, c) = internal::entry(guard.page(), i);
            let next = if i + 1 < num_keys {
                internal::entry(guard.page(), i + 1).0
            } else {
                high
            };
            bounds.push((c, k, next));
        }
        drop(guard);

        for (child, lo, hi) in bounds {
            total += self.validate_subtree(table_id, child, pagenum, lo, hi)?;
        }
        Ok(total)
    }
}
