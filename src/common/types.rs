/// Page size in bytes (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Initial size of a newly created table file (10 MiB)
pub const DEFAULT_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Page number of the file header page
pub const HEADER_PAGENUM: PageNum = 0;

/// Distinguished sentinel for "no page" (an empty tree root)
pub const NULL_PAGENUM: PageNum = u64::MAX;

/// Minimum size of a record payload in bytes
pub const MIN_RECORD_SIZE: u16 = 46;

/// Maximum size of a record payload in bytes
pub const MAX_RECORD_SIZE: u16 = 108;

/// Page number type (64-bit page index into a table file)
pub type PageNum = u64;

/// Table ID type
pub type TableId = i64;

/// Transaction ID type (wrapping, never zero while active)
pub type TrxId = i32;

/// LSN (Log Sequence Number) type
pub type Lsn = u64;

/// A raw fixed-size page image
#[derive(Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new() -> Self {
        Self {
            data: [0; PAGE_SIZE],
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").finish_non_exhaustive()
    }
}
