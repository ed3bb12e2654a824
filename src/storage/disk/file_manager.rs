use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::common::types::{Page, PageNum, TableId, DEFAULT_FILE_SIZE, HEADER_PAGENUM, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum FileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown table id: {0}")]
    UnknownTable(TableId),

    #[error("cannot expand file for table {0}")]
    NoSpace(TableId),

    #[error("invalid page number {1} for table {0}")]
    InvalidPage(TableId, PageNum),

    #[error("corrupt table catalog: {0}")]
    CorruptCatalog(String),
}

pub type Result<T> = std::result::Result<T, FileError>;

/// Accessors for the header page fields: `{first_free_page, num_of_pages,
/// root_page_number}` at fixed little-endian offsets.
pub mod header_page {
    use super::*;

    pub fn first_free_page(page: &Page) -> PageNum {
        LittleEndian::read_u64(&page.data[0..8])
    }

    pub fn set_first_free_page(page: &mut Page, v: PageNum) {
        LittleEndian::write_u64(&mut page.data[0..8], v);
    }

    pub fn num_of_pages(page: &Page) -> u64 {
        LittleEndian::read_u64(&page.data[8..16])
    }

    pub fn set_num_of_pages(page: &mut Page, v: u64) {
        LittleEndian::write_u64(&mut page.data[8..16], v);
    }

    pub fn root_page_number(page: &Page) -> PageNum {
        LittleEndian::read_u64(&page.data[16..24])
    }

    pub fn set_root_page_number(page: &mut Page, v: PageNum) {
        LittleEndian::write_u64(&mut page.data[16..24], v);
    }
}

/// Accessors for pages sitting on the free list: the first 8 bytes hold the
/// next free page number.
pub mod free_page {
    use super::*;

    pub fn next_free_page(page: &Page) -> PageNum {
        LittleEndian::read_u64(&page.data[0..8])
    }

    pub fn set_next_free_page(page: &mut Page, v: PageNum) {
        LittleEndian::write_u64(&mut page.data[0..8], v);
    }
}

struct TableFile {
    path: PathBuf,
    file: Mutex<File>,
}

struct Registry {
    by_path: HashMap<PathBuf, TableId>,
    open: HashMap<TableId, Arc<TableFile>>,
}

/// Disk-level manager of paged table files.
///
/// Table ids are stable across process lifetimes: the id/path mapping is
/// persisted in a catalog file so that recovery can resolve the table ids
/// found in log records before any `open_table` call of the new run.
pub struct FileManager {
    catalog_path: PathBuf,
    registry: RwLock<Registry>,
    next_table_id: AtomicI64,
}

impl FileManager {
    /// Load (or create) the table catalog sitting next to the log file.
    pub fn new(catalog_path: impl AsRef<Path>) -> Result<Self> {
        let catalog_path = catalog_path.as_ref().to_path_buf();
        let mut by_path = HashMap::new();
        let mut max_id: TableId = -1;

        if catalog_path.exists() {
            let mut text = String::new();
            File::open(&catalog_path)?.read_to_string(&mut text)?;
            for line in text.lines() {
                if line.is_empty() {
                    continue;
                }
                let (id_str, path_str) = line
                    .split_once('\t')
                    .ok_or_else(|| FileError::CorruptCatalog(line.to_string()))?;
                let id: TableId = id_str
                    .parse()
                    .map_err(|_| FileError::CorruptCatalog(line.to_string()))?;
                by_path.insert(PathBuf::from(path_str), id);
                max_id = max_id.max(id);
            }
        }

        Ok(Self {
            catalog_path,
            registry: RwLock::new(Registry {
                by_path,
                open: HashMap::new(),
            }),
            next_table_id: AtomicI64::new(max_id + 1),
        })
    }

    /// Open an existing table file or create one if it does not exist.
    /// Idempotent per path: reopening returns the previously assigned id.
    pub fn open_table(&self, pathname: impl AsRef<Path>) -> Result<TableId> {
        let path = pathname.as_ref().to_path_buf();

        let known = self.registry.read().by_path.get(&path).copied();
        if let Some(id) = known {
            self.ensure_open(id)?;
            return Ok(id);
        }

        let table_id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
        let created = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let table = Arc::new(TableFile {
            path: path.clone(),
            file: Mutex::new(file),
        });

        if created {
            debug!("creating table file {:?} as table {}", path, table_id);
            Self::initialize_table_file(&table)?;
        }

        {
            let mut reg = self.registry.write();
            if let Some(&existing) = reg.by_path.get(&path) {
                return Ok(existing);
            }
            reg.by_path.insert(path, table_id);
            reg.open.insert(table_id, table);
        }
        self.store_catalog()?;

        Ok(table_id)
    }

    /// Set up a fresh table file: header page, then grow to the default size
    /// with the trailing pages linked into the free list.
    fn initialize_table_file(table: &TableFile) -> Result<()> {
        let mut header = Page::new();
        header_page::set_first_free_page(&mut header, 0);
        header_page::set_num_of_pages(&mut header, 1);
        header_page::set_root_page_number(&mut header, 0);

        {
            let mut file = table.file.lock();
            file.set_len(PAGE_SIZE as u64)?;
            Self::write_page_at(&mut file, HEADER_PAGENUM, &header, true)?;
        }

        Self::expand_and_link(table, DEFAULT_FILE_SIZE - PAGE_SIZE as u64)?;
        Ok(())
    }

    /// Grow the file by `grow_bytes` and push the new pages onto the head of
    /// the free list in the header.
    fn expand_and_link(table: &TableFile, grow_bytes: u64) -> Result<()> {
        let (start, _end, num_new_pages) = Self::expand_and_chain(table, grow_bytes)?;

        let mut file = table.file.lock();
        let mut header = Page::new();
        Self::read_page_at(&mut file, HEADER_PAGENUM, &mut header)?;

        // the chain's last page was terminated with the old list head
        let old_head = header_page::first_free_page(&header);
        if old_head != 0 {
            let last = start + num_new_pages - 1;
            let mut node = Page::new();
            Self::read_page_at(&mut file, last, &mut node)?;
            free_page::set_next_free_page(&mut node, old_head);
            Self::write_page_at(&mut file, last, &node, false)?;
        }

        header_page::set_first_free_page(&mut header, start);
        let new_num_of_pages = header_page::num_of_pages(&header) + num_new_pages;
        header_page::set_num_of_pages(&mut header, new_num_of_pages);
        Self::write_page_at(&mut file, HEADER_PAGENUM, &header, true)?;
        Ok(())
    }

    /// Grow the file by `grow_bytes` and chain the new pages together via
    /// `next_free_page`, terminating with 0. The header is not touched; the
    /// caller threads the chain into a free list itself.
    fn expand_and_chain(table: &TableFile, grow_bytes: u64) -> Result<(PageNum, PageNum, u64)> {
        if grow_bytes == 0 || grow_bytes % PAGE_SIZE as u64 != 0 {
            return Err(FileError::NoSpace(-1));
        }

        let mut file = table.file.lock();
        let old_size = file.metadata()?.len();
        file.set_len(old_size + grow_bytes)?;

        let start = old_size / PAGE_SIZE as u64;
        let num_new_pages = grow_bytes / PAGE_SIZE as u64;
        let end = start + num_new_pages - 1;

        let mut node = Page::new();
        for i in 0..num_new_pages {
            let pagenum = start + i;
            let next = if i + 1 < num_new_pages { pagenum + 1 } else { 0 };
            free_page::set_next_free_page(&mut node, next);
            let sync = i + 1 == num_new_pages;
            Self::write_page_at(&mut file, pagenum, &node, sync)?;
        }

        Ok((start, end, num_new_pages))
    }

    /// Double the file and return `(start, end, num_new_pages)` of the new
    /// chained run, for callers (the buffer pool) that thread the pages into
    /// the header themselves.
    pub fn expand_twice(&self, table_id: TableId) -> Result<(PageNum, PageNum, u64)> {
        let table = self.table(table_id)?;
        let size = table.file.lock().metadata()?.len();
        Self::expand_and_chain(&table, size)
    }

    /// Allocate a page from the free list, doubling the file first if the
    /// list is empty. The returned page carries a stale `next_free_page` in
    /// its first 8 bytes; callers must initialize it before use.
    pub fn alloc_page(&self, table_id: TableId) -> Result<PageNum> {
        let table = self.table(table_id)?;

        let mut header = Page::new();
        {
            let mut file = table.file.lock();
            Self::read_page_at(&mut file, HEADER_PAGENUM, &mut header)?;
        }
        if header_page::first_free_page(&header) == 0 {
            let size = table.file.lock().metadata()?.len();
            Self::expand_and_link(&table, size)?;
            let mut file = table.file.lock();
            Self::read_page_at(&mut file, HEADER_PAGENUM, &mut header)?;
        }

        let pagenum = header_page::first_free_page(&header);
        if pagenum == 0 {
            return Err(FileError::NoSpace(table_id));
        }

        let mut file = table.file.lock();
        let mut node = Page::new();
        Self::read_page_at(&mut file, pagenum, &mut node)?;
        header_page::set_first_free_page(&mut header, free_page::next_free_page(&node));
        Self::write_page_at(&mut file, HEADER_PAGENUM, &header, true)?;

        Ok(pagenum)
    }

    /// Push a page back onto the head of the free list. No zeroing.
    pub fn free_page(&self, table_id: TableId, pagenum: PageNum) -> Result<()> {
        if pagenum == HEADER_PAGENUM {
            return Err(FileError::InvalidPage(table_id, pagenum));
        }
        let table = self.table(table_id)?;
        let mut file = table.file.lock();

        let mut header = Page::new();
        let mut node = Page::new();
        Self::read_page_at(&mut file, HEADER_PAGENUM, &mut header)?;
        Self::read_page_at(&mut file, pagenum, &mut node)?;

        free_page::set_next_free_page(&mut node, header_page::first_free_page(&header));
        header_page::set_first_free_page(&mut header, pagenum);
        Self::write_page_at(&mut file, HEADER_PAGENUM, &header, true)?;
        Self::write_page_at(&mut file, pagenum, &node, true)?;
        Ok(())
    }

    /// Byte-exact read of one page at offset `pagenum * PAGE_SIZE`.
    pub fn read_page(&self, table_id: TableId, pagenum: PageNum, dest: &mut Page) -> Result<()> {
        let table = self.table(table_id)?;
        let mut file = table.file.lock();
        Self::read_page_at(&mut file, pagenum, dest)
    }

    /// Byte-exact write of one page; `sync` elects an fsync.
    pub fn write_page(
        &self,
        table_id: TableId,
        pagenum: PageNum,
        src: &Page,
        sync: bool,
    ) -> Result<()> {
        let table = self.table(table_id)?;
        let mut file = table.file.lock();
        Self::write_page_at(&mut file, pagenum, src, sync)
    }

    pub fn read_header_page(&self, table_id: TableId, dest: &mut Page) -> Result<()> {
        self.read_page(table_id, HEADER_PAGENUM, dest)
    }

    pub fn write_header_page(&self, table_id: TableId, src: &Page) -> Result<()> {
        self.write_page(table_id, HEADER_PAGENUM, src, true)
    }

    /// Size of the table file in bytes.
    pub fn file_size(&self, table_id: TableId) -> Result<u64> {
        let table = self.table(table_id)?;
        let len = table.file.lock().metadata()?.len();
        Ok(len)
    }

    /// Walk the free list and count its pages. Also verifies the list is
    /// acyclic (bounded by the page count of the file).
    pub fn count_free_pages(&self, table_id: TableId) -> Result<u64> {
        let table = self.table(table_id)?;
        let mut file = table.file.lock();

        let mut header = Page::new();
        Self::read_page_at(&mut file, HEADER_PAGENUM, &mut header)?;
        let total = header_page::num_of_pages(&header);

        let mut count = 0u64;
        let mut cursor = header_page::first_free_page(&header);
        let mut node = Page::new();
        while cursor != 0 {
            count += 1;
            if count > total {
                return Err(FileError::CorruptCatalog(format!(
                    "free list of table {} is cyclic",
                    table_id
                )));
            }
            Self::read_page_at(&mut file, cursor, &mut node)?;
            cursor = free_page::next_free_page(&node);
        }
        Ok(count)
    }

    /// fsync every open table file.
    pub fn sync_all(&self) -> Result<()> {
        let reg = self.registry.read();
        for table in reg.open.values() {
            table.file.lock().sync_all()?;
        }
        Ok(())
    }

    /// Table ids currently known to the catalog.
    pub fn known_tables(&self) -> Vec<TableId> {
        self.registry.read().by_path.values().copied().collect()
    }

    fn table(&self, table_id: TableId) -> Result<Arc<TableFile>> {
        if let Some(table) = self.registry.read().open.get(&table_id) {
            return Ok(table.clone());
        }
        self.ensure_open(table_id)
    }

    /// Open the backing file of a catalogued table on demand (recovery may
    /// reference tables before the client reopens them).
    fn ensure_open(&self, table_id: TableId) -> Result<Arc<TableFile>> {
        let path = {
            let reg = self.registry.read();
            if let Some(table) = reg.open.get(&table_id) {
                return Ok(table.clone());
            }
            reg.by_path
                .iter()
                .find(|(_, &id)| id == table_id)
                .map(|(p, _)| p.clone())
                .ok_or(FileError::UnknownTable(table_id))?
        };

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let table = Arc::new(TableFile {
            path,
            file: Mutex::new(file),
        });
        self.registry.write().open.insert(table_id, table.clone());
        Ok(table)
    }

    fn store_catalog(&self) -> Result<()> {
        let reg = self.registry.read();
        let mut text = String::new();
        for (path, id) in &reg.by_path {
            text.push_str(&format!("{}\t{}\n", id, path.display()));
        }
        let mut file = File::create(&self.catalog_path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn read_page_at(file: &mut File, pagenum: PageNum, dest: &mut Page) -> Result<()> {
        file.seek(SeekFrom::Start(pagenum * PAGE_SIZE as u64))?;
        file.read_exact(&mut dest.data)?;
        Ok(())
    }

    fn write_page_at(file: &mut File, pagenum: PageNum, src: &Page, sync: bool) -> Result<()> {
        file.seek(SeekFrom::Start(pagenum * PAGE_SIZE as u64))?;
        file.write_all(&src.data)?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl Drop for FileManager {
    fn drop(&mut self) {
        let reg = self.registry.read();
        for table in reg.open.values() {
            if let Err(e) = table.file.lock().sync_all() {
                warn!("failed to sync {:?} on close: {}", table.path, e);
            }
        }
    }
}
