use anyhow::Result;
use tempfile::TempDir;

use karstdb::common::types::{Page, DEFAULT_FILE_SIZE, PAGE_SIZE};
use karstdb::storage::disk::file_manager::header_page;
use karstdb::storage::disk::FileManager;

#[test]
fn test_dsm_roundtrip() -> Result<()> {
    let dir = TempDir::new()?;
    let catalog = dir.path().join("catalog.tables");
    let path = dir.path().join("test.db");

    // write a marker into a freshly allocated page, then reopen and read it
    let pagenum = {
        let fm = FileManager::new(&catalog)?;
        let tid = fm.open_table(&path)?;
        let pagenum = fm.alloc_page(tid)?;

        let mut page = Page::new();
        fm.read_page(tid, pagenum, &mut page)?;
        page.data[..12].copy_from_slice(b"Hello World!");
        fm.write_page(tid, pagenum, &page, true)?;
        pagenum
    };

    let fm = FileManager::new(&catalog)?;
    let tid = fm.open_table(&path)?;
    let mut page = Page::new();
    fm.read_page(tid, pagenum, &mut page)?;
    assert_eq!(&page.data[..12], b"Hello World!");
    Ok(())
}

#[test]
fn test_free_page_accounting_over_alloc_free_sequences() -> Result<()> {
    let dir = TempDir::new()?;
    let fm = FileManager::new(dir.path().join("catalog.tables"))?;
    let tid = fm.open_table(dir.path().join("t.db"))?;
    let total = DEFAULT_FILE_SIZE / PAGE_SIZE as u64;

    let mut allocated = Vec::new();
    for _ in 0..100 {
        allocated.push(fm.alloc_page(tid)?);
    }
    for &p in allocated.iter().take(40) {
        fm.free_page(tid, p)?;
    }
    for _ in 0..10 {
        allocated.push(fm.alloc_page(tid)?);
    }

    // allocated + free = num_of_pages (header included on the allocated side)
    let free = fm.count_free_pages(tid)?;
    let mut header = Page::new();
    fm.read_header_page(tid, &mut header)?;
    assert_eq!(header_page::num_of_pages(&header), total);
    assert_eq!(free, total - 1 - 100 - 10 + 40);
    assert_eq!(fm.file_size(tid)?, total * PAGE_SIZE as u64);
    Ok(())
}

#[test]
fn test_exhaustion_doubles_exactly_once() -> Result<()> {
    let dir = TempDir::new()?;
    let fm = FileManager::new(dir.path().join("catalog.tables"))?;
    let tid = fm.open_table(dir.path().join("t.db"))?;
    let total = DEFAULT_FILE_SIZE / PAGE_SIZE as u64;

    for _ in 0..total - 1 {
        fm.alloc_page(tid)?;
    }
    assert_eq!(fm.file_size(tid)?, DEFAULT_FILE_SIZE);

    let p = fm.alloc_page(tid)?;
    assert!(p >= total, "new page {} should come from the grown region", p);
    assert_eq!(fm.file_size(tid)?, 2 * DEFAULT_FILE_SIZE);

    let mut header = Page::new();
    fm.read_header_page(tid, &mut header)?;
    assert_eq!(header_page::num_of_pages(&header), 2 * total);
    Ok(())
}
