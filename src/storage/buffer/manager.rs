use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::{ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};

use crate::common::types::{Page, PageNum, TableId, HEADER_PAGENUM};
use crate::storage::buffer::error::{BufferPoolError, Result};
use crate::storage::buffer::replacer::LruList;
use crate::storage::disk::file_manager::{free_page, header_page};
use crate::storage::disk::FileManager;
use crate::transaction::wal::log_manager::LogManager;

/// One cached page image plus its identity and dirty flag. The frame's
/// rwlock is the page latch; holding the write guard is the pin.
pub struct Frame {
    pub page: Page,
    table_id: TableId,
    pagenum: PageNum,
    dirty: bool,
}

impl Frame {
    fn empty() -> Self {
        Self {
            page: Page::new(),
            table_id: -1,
            pagenum: 0,
            dirty: false,
        }
    }
}

type FrameRef = Arc<RwLock<Frame>>;

/// An exclusive pin on one buffered page. The page latch is held until the
/// guard is dropped; `mark_dirty` must be called after any mutation.
pub struct PageGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Frame>,
}

impl PageGuard {
    pub fn table_id(&self) -> TableId {
        self.guard.table_id
    }

    pub fn pagenum(&self) -> PageNum {
        self.guard.pagenum
    }

    pub fn page(&self) -> &Page {
        &self.guard.page
    }

    pub fn page_mut(&mut self) -> &mut Page {
        &mut self.guard.page
    }

    pub fn mark_dirty(&mut self) {
        self.guard.dirty = true;
    }
}

struct PoolState {
    map: HashMap<(TableId, PageNum), usize>,
    lru: LruList,
}

/// In-memory frame cache over the paged files.
///
/// A single pool latch guards the frame map and the LRU list; per-frame
/// latches guard the page bytes. Eviction honors the WAL rule: the log is
/// flushed before a dirty frame is written back.
pub struct BufferPool {
    frames: Vec<FrameRef>,
    state: Mutex<PoolState>,
    disk: Arc<FileManager>,
    log: Arc<LogManager>,
}

impl BufferPool {
    pub fn new(num_buf: usize, disk: Arc<FileManager>, log: Arc<LogManager>) -> Self {
        let frames = (0..num_buf)
            .map(|_| Arc::new(RwLock::new(Frame::empty())))
            .collect();
        Self {
            frames,
            state: Mutex::new(PoolState {
                map: HashMap::new(),
                lru: LruList::new(num_buf),
            }),
            disk,
            log,
        }
    }

    /// Pin a page: return it from the cache, or evict a victim and read it
    /// through the file manager. The caller holds the page latch until the
    /// returned guard is dropped.
    pub fn get_page(&self, table_id: TableId, pagenum: PageNum) -> Result<PageGuard> {
        let key = (table_id, pagenum);
        loop {
            let mut state = self.state.lock();

            if let Some(&idx) = state.map.get(&key) {
                state.lru.promote(idx);
                let frame = self.frames[idx].clone();
                drop(state);

                let guard = frame.write_arc();
                if guard.table_id == table_id && guard.pagenum == pagenum {
                    return Ok(PageGuard { guard });
                }
                // the frame was evicted and reused while we blocked on its
                // latch; look the page up again
                continue;
            }

            // miss: claim a victim frame under the pool latch, publish the
            // new mapping, then do the I/O with only the page latch held
            let (_idx, mut guard) = self.claim_victim(&mut state, key)?;
            drop(state);

            let old_table = guard.table_id;
            let old_pagenum = guard.pagenum;
            let was_dirty = guard.dirty;

            let io_result = (|| -> Result<()> {
                if was_dirty {
                    self.log.flush()?;
                    self.disk
                        .write_page(old_table, old_pagenum, &guard.page, false)?;
                }
                guard.table_id = table_id;
                guard.pagenum = pagenum;
                guard.dirty = false;
                self.disk.read_page(table_id, pagenum, &mut guard.page)?;
                Ok(())
            })();

            if let Err(e) = io_result {
                let mut state = self.state.lock();
                state.map.remove(&key);
                guard.table_id = -1;
                guard.pagenum = 0;
                guard.dirty = false;
                return Err(e);
            }

            return Ok(PageGuard { guard });
        }
    }

    /// Pick the first unpinned frame from the cold end of the LRU list and
    /// map it to `key`. Fails with `NoFreeFrame` if every latch is held.
    fn claim_victim(
        &self,
        state: &mut PoolState,
        key: (TableId, PageNum),
    ) -> Result<(usize, ArcRwLockWriteGuard<RawRwLock, Frame>)> {
        let victim = state
            .lru
            .victims()
            .find_map(|idx| self.frames[idx].try_write_arc().map(|g| (idx, g)));

        let (idx, guard) = victim.ok_or(BufferPoolError::NoFreeFrame)?;
        if guard.table_id >= 0 {
            state.map.remove(&(guard.table_id, guard.pagenum));
        }
        state.map.insert(key, idx);
        state.lru.promote(idx);
        Ok((idx, guard))
    }

    /// Allocate a page for a table, going through the pinned header page so
    /// that free-list updates are serialized by the buffer pool.
    pub fn alloc_page(&self, table_id: TableId) -> Result<PageNum> {
        let mut header = self.get_page(table_id, HEADER_PAGENUM)?;

        if header_page::first_free_page(header.page()) == 0 {
            let (start, _end, num_new_pages) = self.disk.expand_twice(table_id)?;
            debug!(
                "table {} out of free pages, grew by {} pages",
                table_id, num_new_pages
            );
            header_page::set_first_free_page(header.page_mut(), start);
            let total = header_page::num_of_pages(header.page());
            header_page::set_num_of_pages(header.page_mut(), total + num_new_pages);
        }

        let pagenum = header_page::first_free_page(header.page());

        let node = self.get_page(table_id, pagenum)?;
        let next = free_page::next_free_page(node.page());
        drop(node);

        header_page::set_first_free_page(header.page_mut(), next);
        header.mark_dirty();
        Ok(pagenum)
    }

    /// Push a page back onto the free list and make its frame the first
    /// eviction candidate.
    pub fn free_page(&self, table_id: TableId, pagenum: PageNum) -> Result<()> {
        let mut header = self.get_page(table_id, HEADER_PAGENUM)?;
        let mut node = self.get_page(table_id, pagenum)?;

        free_page::set_next_free_page(node.page_mut(), header_page::first_free_page(header.page()));
        header_page::set_first_free_page(header.page_mut(), pagenum);
        node.mark_dirty();
        header.mark_dirty();
        drop(node);
        drop(header);

        let mut state = self.state.lock();
        if let Some(&idx) = state.map.get(&(table_id, pagenum)) {
            state.lru.demote(idx);
        }
        Ok(())
    }

    /// Write every dirty frame and fsync the files. The log is flushed
    /// first so the WAL rule holds for each page written here.
    pub fn flush_all_frames(&self) -> Result<()> {
        self.log.flush()?;
        for frame in &self.frames {
            let mut guard = frame.write_arc();
            if guard.dirty {
                self.disk
                    .write_page(guard.table_id, guard.pagenum, &guard.page, false)?;
                guard.dirty = false;
            }
        }
        self.disk.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(num_buf: usize) -> (BufferPool, TableId, TempDir) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(FileManager::new(dir.path().join("catalog.tables")).unwrap());
        let log = Arc::new(LogManager::open(dir.path().join("wal.log")).unwrap());
        let table_id = disk.open_table(dir.path().join("t.db")).unwrap();
        (BufferPool::new(num_buf, disk, log), table_id, dir)
    }

    #[test]
    fn test_get_page_caches() {
        let (pool, tid, _dir) = setup(4);
        let pagenum = pool.alloc_page(tid).unwrap();

        {
            let mut guard = pool.get_page(tid, pagenum).unwrap();
            guard.page_mut().data[100] = 42;
            guard.mark_dirty();
        }

        let guard = pool.get_page(tid, pagenum).unwrap();
        assert_eq!(guard.page().data[100], 42);
    }

    #[test]
    fn test_eviction_writes_dirty_pages() {
        let (pool, tid, _dir) = setup(2);
        let first = pool.alloc_page(tid).unwrap();

        {
            let mut guard = pool.get_page(tid, first).unwrap();
            guard.page_mut().data[0..4].copy_from_slice(b"keep");
            guard.mark_dirty();
        }

        // cycle enough pages through the 2-frame pool to evict `first`
        for _ in 0..4 {
            let p = pool.alloc_page(tid).unwrap();
            let _guard = pool.get_page(tid, p).unwrap();
        }

        let guard = pool.get_page(tid, first).unwrap();
        assert_eq!(&guard.page().data[0..4], b"keep");
    }

    #[test]
    fn test_all_pinned_fails() {
        let (pool, tid, _dir) = setup(2);
        let p1 = pool.alloc_page(tid).unwrap();
        let p2 = pool.alloc_page(tid).unwrap();
        let p3 = pool.alloc_page(tid).unwrap();

        let _g1 = pool.get_page(tid, p1).unwrap();
        let _g2 = pool.get_page(tid, p2).unwrap();
        match pool.get_page(tid, p3) {
            Err(BufferPoolError::NoFreeFrame) => {}
            other => panic!("expected NoFreeFrame, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_alloc_reuses_freed_page() {
        let (pool, tid, _dir) = setup(4);
        let p = pool.alloc_page(tid).unwrap();
        pool.free_page(tid, p).unwrap();
        let q = pool.alloc_page(tid).unwrap();
        assert_eq!(p, q);
    }
}
