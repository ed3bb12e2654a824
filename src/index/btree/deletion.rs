//! Deletion paths of the B+-tree: slot removal, threshold-driven merging
//! and redistribution, and root adjustment.

use crate::common::types::{Page, PageNum, TableId, NULL_PAGENUM};
use crate::index::btree::index::BTree;
use crate::index::btree::node::{
    header, internal, leaf, LeafSlot, MAX_INTERNAL_ENTRIES, MERGE_THRESHOLD, MIN_INTERNAL_ENTRIES,
};
use crate::index::btree::{BTreeError, Result};

/// Slots plus payloads lifted off a leaf for merging/redistribution.
type LeafSnapshot = Vec<(LeafSlot, Vec<u8>)>;

impl BTree {
    /// Delete a record. Deficient pages (leaf free space past the merge
    /// threshold, internal pages under the minimum entry count) borrow
    /// from or collapse into a neighbor.
    pub fn delete(&self, table_id: TableId, key: i64) -> Result<()> {
        let root = self.root(table_id)?;
        if root == 0 {
            return Err(BTreeError::NoSuchKey(key));
        }
        let leaf_pagenum = self
            .find_leaf(table_id, key)?
            .ok_or(BTreeError::NoSuchKey(key))?;

        let new_root = self.delete_from_leaf(table_id, root, leaf_pagenum, key)?;
        if new_root != root {
            let stored = if new_root == NULL_PAGENUM { 0 } else { new_root };
            self.set_root(table_id, stored)?;
        }
        Ok(())
    }

    fn delete_from_leaf(
        &self,
        table_id: TableId,
        root: PageNum,
        pagenum: PageNum,
        key: i64,
    ) -> Result<PageNum> {
        let mut guard = self.pool().get_page(table_id, pagenum)?;
        let slotnum = leaf::find_slot(guard.page(), key).ok_or(BTreeError::NoSuchKey(key))?;
        leaf::remove(guard.page_mut(), slotnum);
        guard.mark_dirty();

        if root == pagenum {
            drop(guard);
            return self.adjust_root(table_id, root);
        }

        if leaf::free_space(guard.page()) < MERGE_THRESHOLD {
            return Ok(root);
        }

        let parent = header::parent(guard.page());
        let used = leaf::used_bytes(guard.page());
        drop(guard);

        let (neighbor, key_in_parent, page_is_first) =
            self.neighbor_of(table_id, parent, pagenum)?;

        let neighbor_guard = self.pool().get_page(table_id, neighbor)?;
        let neighbor_free = leaf::free_space(neighbor_guard.page());
        drop(neighbor_guard);

        if used <= neighbor_free {
            self.merge_leaf(table_id, root, key_in_parent, pagenum, neighbor, page_is_first)
        } else {
            self.redistribute_leaf(table_id, root, key_in_parent, pagenum, neighbor, page_is_first)
        }
    }

    /// Neighbor choice is deterministic: the parent's first child pairs
    /// with the second child (separator `entries[0]`), every other page
    /// pairs with its immediate left sibling.
    fn neighbor_of(
        &self,
        table_id: TableId,
        parent: PageNum,
        pagenum: PageNum,
    ) -> Result<(PageNum, i64, bool)> {
        let guard = self.pool().get_page(table_id, parent)?;
        let num_keys = header::num_keys(guard.page());
        if num_keys == 0 {
            return Err(BTreeError::CorruptTree(format!(
                "parent {} of page {} has no keys",
                parent, pagenum
            )));
        }

        if internal::first_child(guard.page()) == pagenum {
            let (k, c) = internal::entry(guard.page(), 0);
            return Ok((c, k, true));
        }
        if internal::entry(guard.page(), 0).1 == pagenum {
            let (k, _) = internal::entry(guard.page(), 0);
            return Ok((internal::first_child(guard.page()), k, false));
        }
        for i in 1..num_keys {
            if internal::entry(guard.page(), i).1 == pagenum {
                let (k, _) = internal::entry(guard.page(), i);
                return Ok((internal::entry(guard.page(), i - 1).1, k, false));
            }
        }
        Err(BTreeError::CorruptTree(format!(
            "page {} not found under parent {}",
            pagenum, parent
        )))
    }

    fn snapshot_leaf(&self, table_id: TableId, pagenum: PageNum) -> Result<(LeafSnapshot, PageNum, PageNum)> {
        let guard = self.pool().get_page(table_id, pagenum)?;
        let mut slots = Vec::with_capacity(header::num_keys(guard.page()));
        for i in 0..header::num_keys(guard.page()) {
            let slot = leaf::slot(guard.page(), i);
            slots.push((slot, leaf::payload(guard.page(), &slot).to_vec()));
        }
        let right_sibling = leaf::right_sibling(guard.page());
        let parent = header::parent(guard.page());
        Ok((slots, right_sibling, parent))
    }

    /// Rewrite a leaf from scratch with a compact payload heap.
    fn rebuild_leaf(
        &self,
        table_id: TableId,
        pagenum: PageNum,
        parent: PageNum,
        right_sibling: PageNum,
        slots: &[(LeafSlot, Vec<u8>)],
    ) -> Result<()> {
        let mut fresh = Page::new();
        leaf::init(&mut fresh, parent);
        leaf::set_right_sibling(&mut fresh, right_sibling);
        for (slot, payload) in slots {
            leaf::insert(&mut fresh, slot.key, payload);
            if slot.owner_trx != 0 {
                let n = header::num_keys(&fresh);
                leaf::set_owner_trx(&mut fresh, n - 1, slot.owner_trx);
            }
        }

        let mut guard = self.pool().get_page(table_id, pagenum)?;
        guard.page_mut().data.copy_from_slice(&fresh.data);
        guard.mark_dirty();
        Ok(())
    }

    /// Fold the right page into the left one, relink the sibling chain past
    /// the freed page, and drop the separator from the parent.
    fn merge_leaf(
        &self,
        table_id: TableId,
        root: PageNum,
        key_in_parent: i64,
        pagenum: PageNum,
        neighbor: PageNum,
        page_is_first: bool,
    ) -> Result<PageNum> {
        let (left_pn, right_pn) = if page_is_first {
            (pagenum, neighbor)
        } else {
            (neighbor, pagenum)
        };

        let (right_slots, right_sibling, parent) = self.snapshot_leaf(table_id, right_pn)?;

        let mut guard = self.pool().get_page(table_id, left_pn)?;
        for (slot, payload) in &right_slots {
            if !leaf::insert(guard.page_mut(), slot.key, payload) {
                return Err(BTreeError::CorruptTree(format!(
                    "merge into leaf {} overflowed",
                    left_pn
                )));
            }
            if slot.owner_trx != 0 {
                let n = header::num_keys(guard.page());
                leaf::set_owner_trx(guard.page_mut(), n - 1, slot.owner_trx);
            }
        }
        leaf::set_right_sibling(guard.page_mut(), right_sibling);
        guard.mark_dirty();
        drop(guard);

        self.pool().free_page(table_id, right_pn)?;
        self.delete_from_parent(table_id, root, parent, key_in_parent, right_pn)
    }

    /// Move slots from the neighbor until the deficient page is healthy
    /// again, rebuild the donor compactly, and rewrite the separator.
    fn redistribute_leaf(
        &self,
        table_id: TableId,
        root: PageNum,
        key_in_parent: i64,
        pagenum: PageNum,
        neighbor: PageNum,
        page_is_first: bool,
    ) -> Result<PageNum> {
        let (left_pn, right_pn) = if page_is_first {
            (pagenum, neighbor)
        } else {
            (neighbor, pagenum)
        };

        let new_separator;
        if page_is_first {
            // left is deficient: take from the right's low end
            let (right_slots, right_sibling, parent) = self.snapshot_leaf(table_id, right_pn)?;
            let mut moved = 0;
            {
                let mut guard = self.pool().get_page(table_id, left_pn)?;
                while leaf::free_space(guard.page()) >= MERGE_THRESHOLD && moved < right_slots.len()
                {
                    let (slot, payload) = &right_slots[moved];
                    leaf::insert(guard.page_mut(), slot.key, payload);
                    if slot.owner_trx != 0 {
                        let n = header::num_keys(guard.page());
                        leaf::set_owner_trx(guard.page_mut(), n - 1, slot.owner_trx);
                    }
                    moved += 1;
                }
                guard.mark_dirty();
            }
            if moved >= right_slots.len() {
                return Err(BTreeError::CorruptTree(format!(
                    "redistribution drained leaf {}",
                    right_pn
                )));
            }
            self.rebuild_leaf(table_id, right_pn, parent, right_sibling, &right_slots[moved..])?;
            new_separator = right_slots[moved].0.key;
        } else {
            // right is deficient: take from the left's high end
            let (left_slots, left_sibling, parent) = self.snapshot_leaf(table_id, left_pn)?;
            let mut keep = left_slots.len();
            {
                let mut guard = self.pool().get_page(table_id, right_pn)?;
                while leaf::free_space(guard.page()) >= MERGE_THRESHOLD && keep > 0 {
                    keep -= 1;
                    let (slot, payload) = &left_slots[keep];
                    leaf::insert(guard.page_mut(), slot.key, payload);
                    if slot.owner_trx != 0 {
                        leaf::set_owner_trx(guard.page_mut(), 0, slot.owner_trx);
                    }
                }
                guard.mark_dirty();
            }
            if keep == 0 {
                return Err(BTreeError::CorruptTree(format!(
                    "redistribution drained leaf {}",
                    left_pn
                )));
            }
            self.rebuild_leaf(table_id, left_pn, parent, left_sibling, &left_slots[..keep])?;
            new_separator = left_slots[keep].0.key;
        }

        let parent_guard = self.pool().get_page(table_id, pagenum)?;
        let parent = header::parent(parent_guard.page());
        drop(parent_guard);
        self.change_key(table_id, parent, key_in_parent, new_separator)?;
        Ok(root)
    }

    /// Remove the separator `key` (and the matching child pointer) from an
    /// internal page, then rebalance it if deficient.
    fn delete_from_parent(
        &self,
        table_id: TableId,
        root: PageNum,
        pagenum: PageNum,
        key: i64,
        child: PageNum,
    ) -> Result<PageNum> {
        let mut guard = self.pool().get_page(table_id, pagenum)?;
        let num_keys = header::num_keys(guard.page());

        let key_idx = (0..num_keys)
            .find(|&i| internal::entry(guard.page(), i).0 == key)
            .ok_or_else(|| {
                BTreeError::CorruptTree(format!(
                    "separator {} missing from internal page {}",
                    key, pagenum
                ))
            })?;

        // the freed child may sit on either side of the separator
        let removing_right = !((key_idx == 0 && internal::first_child(guard.page()) == child)
            || (key_idx > 0 && internal::entry(guard.page(), key_idx - 1).1 == child));

        if removing_right {
            if internal::entry(guard.page(), key_idx).1 != child {
                return Err(BTreeError::CorruptTree(format!(
                    "child {} not adjacent to separator {} in page {}",
                    child, key, pagenum
                )));
            }
        } else if key_idx == 0 {
            let (_, c) = internal::entry(guard.page(), 0);
            internal::set_first_child(guard.page_mut(), c);
        } else {
            let (k, _) = internal::entry(guard.page(), key_idx - 1);
            let (_, c) = internal::entry(guard.page(), key_idx);
            internal::set_entry(guard.page_mut(), key_idx - 1, k, c);
        }

        for i in key_idx..num_keys - 1 {
            let (k, c) = internal::entry(guard.page(), i + 1);
            internal::set_entry(guard.page_mut(), i, k, c);
        }
        internal::set_entry(guard.page_mut(), num_keys - 1, 0, 0);
        header::set_num_keys(guard.page_mut(), num_keys - 1);
        guard.mark_dirty();

        if root == pagenum {
            drop(guard);
            return self.adjust_root(table_id, root);
        }

        if num_keys - 1 >= MIN_INTERNAL_ENTRIES {
            return Ok(root);
        }

        let parent = header::parent(guard.page());
        let own_keys = num_keys - 1;
        drop(guard);

        let (neighbor, key_in_parent, page_is_first) =
            self.neighbor_of(table_id, parent, pagenum)?;

        let neighbor_guard = self.pool().get_page(table_id, neighbor)?;
        let neighbor_keys = header::num_keys(neighbor_guard.page());
        drop(neighbor_guard);

        if own_keys + neighbor_keys < MAX_INTERNAL_ENTRIES {
            self.merge_internal(table_id, root, key_in_parent, pagenum, neighbor, page_is_first)
        } else {
            self.redistribute_internal(table_id, root, key_in_parent, pagenum, neighbor, page_is_first)
        }
    }

    /// Merge two internal siblings: the separator comes down from the
    /// parent and sits between the left keys and the migrated right keys.
    fn merge_internal(
        &self,
        table_id: TableId,
        root: PageNum,
        key_in_parent: i64,
        pagenum: PageNum,
        neighbor: PageNum,
        page_is_first: bool,
    ) -> Result<PageNum> {
        let (left_pn, right_pn) = if page_is_first {
            (pagenum, neighbor)
        } else {
            (neighbor, pagenum)
        };

        let (right_first, right_entries, parent) = {
            let guard = self.pool().get_page(table_id, right_pn)?;
            let n = header::num_keys(guard.page());
            (
                internal::first_child(guard.page()),
                (0..n)
                    .map(|i| internal::entry(guard.page(), i))
                    .collect::<Vec<_>>(),
                header::parent(guard.page()),
            )
        };

        {
            let mut guard = self.pool().get_page(table_id, left_pn)?;
            let mut n = header::num_keys(guard.page());
            internal::set_entry(guard.page_mut(), n, key_in_parent, right_first);
            n += 1;
            for &(k, c) in &right_entries {
                internal::set_entry(guard.page_mut(), n, k, c);
                n += 1;
            }
            header::set_num_keys(guard.page_mut(), n);
            guard.mark_dirty();
        }

        self.set_parent(table_id, right_first, left_pn)?;
        for &(_, c) in &right_entries {
            self.set_parent(table_id, c, left_pn)?;
        }

        self.pool().free_page(table_id, right_pn)?;
        self.delete_from_parent(table_id, root, parent, key_in_parent, right_pn)
    }

    /// Rotate one entry through the parent between internal siblings.
    fn redistribute_internal(
        &self,
        table_id: TableId,
        root: PageNum,
        key_in_parent: i64,
        pagenum: PageNum,
        neighbor: PageNum,
        page_is_first: bool,
    ) -> Result<PageNum> {
        let (left_pn, right_pn) = if page_is_first {
            (pagenum, neighbor)
        } else {
            (neighbor, pagenum)
        };

        let parent = {
            let guard = self.pool().get_page(table_id, pagenum)?;
            header::parent(guard.page())
        };

        if page_is_first {
            // pull the right sibling's first child through the parent
            let (right_first, right_e0) = {
                let guard = self.pool().get_page(table_id, right_pn)?;
                (
                    internal::first_child(guard.page()),
                    internal::entry(guard.page(), 0),
                )
            };

            {
                let mut guard = self.pool().get_page(table_id, left_pn)?;
                let n = header::num_keys(guard.page());
                internal::set_entry(guard.page_mut(), n, key_in_parent, right_first);
                header::set_num_keys(guard.page_mut(), n + 1);
                guard.mark_dirty();
            }
            self.set_parent(table_id, right_first, left_pn)?;
            self.change_key(table_id, parent, key_in_parent, right_e0.0)?;

            let mut guard = self.pool().get_page(table_id, right_pn)?;
            let n = header::num_keys(guard.page());
            internal::set_first_child(guard.page_mut(), right_e0.1);
            for i in 0..n - 1 {
                let (k, c) = internal::entry(guard.page(), i + 1);
                internal::set_entry(guard.page_mut(), i, k, c);
            }
            internal::set_entry(guard.page_mut(), n - 1, 0, 0);
            header::set_num_keys(guard.page_mut(), n - 1);
            guard.mark_dirty();
        } else {
            // push the left sibling's last child through the parent
            let left_last = {
                let guard = self.pool().get_page(table_id, left_pn)?;
                let n = header::num_keys(guard.page());
                internal::entry(guard.page(), n - 1)
            };

            {
                let mut guard = self.pool().get_page(table_id, right_pn)?;
                let n = header::num_keys(guard.page());
                for i in (0..n).rev() {
                    let (k, c) = internal::entry(guard.page(), i);
                    internal::set_entry(guard.page_mut(), i + 1, k, c);
                }
                let first = internal::first_child(guard.page());
                internal::set_entry(guard.page_mut(), 0, key_in_parent, first);
                internal::set_first_child(guard.page_mut(), left_last.1);
                header::set_num_keys(guard.page_mut(), n + 1);
                guard.mark_dirty();
            }
            self.set_parent(table_id, left_last.1, right_pn)?;
            self.change_key(table_id, parent, key_in_parent, left_last.0)?;

            let mut guard = self.pool().get_page(table_id, left_pn)?;
            let n = header::num_keys(guard.page());
            internal::set_entry(guard.page_mut(), n - 1, 0, 0);
            header::set_num_keys(guard.page_mut(), n - 1);
            guard.mark_dirty();
        }

        Ok(root)
    }

    /// An empty root collapses: internal roots promote their sole child,
    /// an empty leaf root leaves the tree empty (`NULL_PAGENUM`).
    fn adjust_root(&self, table_id: TableId, root: PageNum) -> Result<PageNum> {
        let guard = self.pool().get_page(table_id, root)?;
        if header::num_keys(guard.page()) > 0 {
            return Ok(root);
        }
        let is_leaf = header::is_leaf(guard.page());
        let first_child = internal::first_child(guard.page());
        drop(guard);

        let new_root = if is_leaf {
            NULL_PAGENUM
        } else {
            self.set_parent(table_id, first_child, 0)?;
            first_child
        };

        self.pool().free_page(table_id, root)?;
        Ok(new_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::BufferPool;
    use crate::storage::disk::FileManager;
    use crate::transaction::wal::log_manager::LogManager;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (BTree, TableId, TempDir) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(FileManager::new(dir.path().join("catalog.tables")).unwrap());
        let log = Arc::new(LogManager::open(dir.path().join("wal.log")).unwrap());
        let pool = Arc::new(BufferPool::new(32, disk.clone(), log));
        let table_id = disk.open_table(dir.path().join("t.db")).unwrap();
        (BTree::new(pool), table_id, dir)
    }

    fn value(key: i64, size: usize) -> Vec<u8> {
        vec![(key % 127) as u8; size]
    }

    #[test]
    fn test_delete_missing_key_fails() {
        let (tree, tid, _dir) = setup();
        assert!(matches!(tree.delete(tid, 1), Err(BTreeError::NoSuchKey(1))));
        tree.insert(tid, 1, &value(1, 50)).unwrap();
        assert!(matches!(tree.delete(tid, 2), Err(BTreeError::NoSuchKey(2))));
    }

    #[test]
    fn test_delete_below_threshold_merges_leaves() {
        let (tree, tid, _dir) = setup();
        // wide records force splits quickly
        for key in 1..=120 {
            tree.insert(tid, key, &value(key, 108)).unwrap();
        }
        assert_eq!(tree.validate(tid).unwrap(), 120);

        // draining one region leaves deficient pages that must collapse
        for key in 40..=90 {
            tree.delete(tid, key).unwrap();
        }
        assert_eq!(tree.validate(tid).unwrap(), 120 - 51);

        for key in 1..=120 {
            let found = tree.find(tid, key, None).unwrap().is_some();
            assert_eq!(found, !(40..=90).contains(&key), "key {}", key);
        }
    }

    #[test]
    fn test_interleaved_delete_redistributes() {
        let (tree, tid, _dir) = setup();
        for key in 1..=120 {
            tree.insert(tid, key, &value(key, 108)).unwrap();
        }
        // every second key: neighbors stay half full, so borrowing kicks in
        for key in (2..=120).step_by(2) {
            tree.delete(tid, key).unwrap();
        }
        assert_eq!(tree.validate(tid).unwrap(), 60);
        for key in (1..=119).step_by(2) {
            assert!(tree.find(tid, key, None).unwrap().is_some(), "key {}", key);
        }
    }

    #[test]
    fn test_delete_all_collapses_to_empty_root() {
        let (tree, tid, _dir) = setup();
        for key in 1..=150 {
            tree.insert(tid, key, &value(key, 100)).unwrap();
        }
        for key in 1..=150 {
            tree.delete(tid, key).unwrap();
        }
        assert_eq!(tree.root(tid).unwrap(), 0);
        assert_eq!(tree.validate(tid).unwrap(), 0);

        // the tree grows again from scratch
        tree.insert(tid, 7, &value(7, 50)).unwrap();
        assert!(tree.find(tid, 7, None).unwrap().is_some());
    }
}
