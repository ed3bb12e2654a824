use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Lsn, PageNum, TableId, TrxId};
use crate::transaction::wal::log_record::{
    LogBody, LogRecord, LogRecordError, LOG_PREFIX_SIZE,
};

/// Size of the zero sentinel terminating the log file. A forward scan stops
/// when it reads a zero `log_size`.
const GUARD_SIZE: u64 = 4;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("log record error: {0}")]
    Record(#[from] LogRecordError),

    #[error("corrupt log file: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, LogError>;

struct LogState {
    file: File,
    /// Encoded records awaiting a flush, in LSN order.
    buffer: Vec<u8>,
    next_lsn: Lsn,
}

/// Append-only write-ahead log: an in-memory buffer over a guarded file.
///
/// A single latch guards the buffer and the LSN counter, so records enter
/// the buffer in LSN order. `flush` makes everything buffered durable and
/// re-terminates the file with the guard sentinel.
pub struct LogManager {
    state: Mutex<LogState>,
    path: PathBuf,
    preexisting: bool,
}

impl LogManager {
    /// Open or create the log file. A fresh file is just the guard
    /// sentinel; for a pre-existing file the caller is expected to run
    /// recovery before serving requests.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let preexisting = path.exists();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if file.metadata()?.len() < GUARD_SIZE {
            file.write_all(&[0u8; GUARD_SIZE as usize])?;
            file.sync_data()?;
        }

        let next_lsn = Self::scan_max_lsn(&mut file)? + 1;
        debug!("log {:?} opened, next lsn {}", path, next_lsn);

        Ok(Self {
            state: Mutex::new(LogState {
                file,
                buffer: Vec::new(),
                next_lsn,
            }),
            path,
            preexisting,
        })
    }

    /// Whether the log file existed before this run (recovery is required).
    pub fn preexisting(&self) -> bool {
        self.preexisting
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a BEGIN record; returns its LSN.
    pub fn append_begin(&self, trx_id: TrxId) -> Lsn {
        self.append(trx_id, 0, LogBody::Begin)
    }

    pub fn append_commit(&self, trx_id: TrxId, prev_lsn: Lsn) -> Lsn {
        self.append(trx_id, prev_lsn, LogBody::Commit)
    }

    pub fn append_rollback(&self, trx_id: TrxId, prev_lsn: Lsn) -> Lsn {
        self.append(trx_id, prev_lsn, LogBody::Rollback)
    }

    /// Append an UPDATE record with equal-length before/after images. The
    /// caller stamps the returned LSN into the page while holding its latch.
    #[allow(clippy::too_many_arguments)]
    pub fn append_update(
        &self,
        trx_id: TrxId,
        prev_lsn: Lsn,
        table_id: TableId,
        page_num: PageNum,
        offset: u16,
        old_image: Vec<u8>,
        new_image: Vec<u8>,
    ) -> Lsn {
        self.append(
            trx_id,
            prev_lsn,
            LogBody::Update {
                table_id,
                page_num,
                offset,
                old_image,
                new_image,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_compensate(
        &self,
        trx_id: TrxId,
        prev_lsn: Lsn,
        table_id: TableId,
        page_num: PageNum,
        offset: u16,
        old_image: Vec<u8>,
        new_image: Vec<u8>,
        next_undo_lsn: Lsn,
    ) -> Lsn {
        self.append(
            trx_id,
            prev_lsn,
            LogBody::Compensate {
                table_id,
                page_num,
                offset,
                old_image,
                new_image,
                next_undo_lsn,
            },
        )
    }

    fn append(&self, trx_id: TrxId, prev_lsn: Lsn, body: LogBody) -> Lsn {
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        state.next_lsn += 1;
        let record = LogRecord {
            lsn,
            prev_lsn,
            trx_id,
            body,
        };
        record.encode(&mut state.buffer);
        lsn
    }

    /// Write the buffered records to the file, re-append the guard sentinel
    /// and fsync. Safe to call with an empty buffer.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.buffer.is_empty() {
            return Ok(());
        }

        let end = state.file.metadata()?.len();
        if end < GUARD_SIZE {
            return Err(LogError::Corrupt(
                "log file shorter than its guard sentinel".to_string(),
            ));
        }
        // overwrite the trailing guard with the new records
        state.file.seek(SeekFrom::Start(end - GUARD_SIZE))?;
        let buffer = std::mem::take(&mut state.buffer);
        state.file.write_all(&buffer)?;
        state.file.write_all(&[0u8; GUARD_SIZE as usize])?;
        state.file.sync_data()?;
        Ok(())
    }

    /// Forward-scan every durable record. Used by recovery before any new
    /// record is appended.
    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        let mut state = self.state.lock();
        let mut bytes = Vec::new();
        state.file.seek(SeekFrom::Start(0))?;
        state.file.read_to_end(&mut bytes)?;

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= bytes.len() {
            let size = LittleEndian::read_u32(&bytes[pos..pos + 4]) as usize;
            if size == 0 {
                break; // guard sentinel
            }
            if size < LOG_PREFIX_SIZE || pos + size > bytes.len() {
                return Err(LogError::Corrupt(format!(
                    "record at offset {} has size {}",
                    pos, size
                )));
            }
            records.push(LogRecord::decode(&bytes[pos..pos + size])?);
            pos += size;
        }
        Ok(records)
    }

    /// Move the LSN counter past everything observed on disk (recovery
    /// seeds it with `max_lsn + 1`).
    pub fn seed_next_lsn(&self, next_lsn: Lsn) {
        let mut state = self.state.lock();
        if state.next_lsn < next_lsn {
            state.next_lsn = next_lsn;
        }
    }

    fn scan_max_lsn(file: &mut File) -> Result<Lsn> {
        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;

        let mut max_lsn = 0;
        let mut pos = 0usize;
        while pos + 4 <= bytes.len() {
            let size = LittleEndian::read_u32(&bytes[pos..pos + 4]) as usize;
            if size == 0 {
                break;
            }
            if size < LOG_PREFIX_SIZE || pos + size > bytes.len() {
                break; // torn tail; records before it are still usable
            }
            let lsn = LittleEndian::read_u64(&bytes[pos + 4..pos + 12]);
            max_lsn = max_lsn.max(lsn);
            pos += size;
        }
        Ok(max_lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::wal::log_record::LogType;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_flush_roundtrip() {
        let dir = TempDir::new().unwrap();
        let log = LogManager::open(dir.path().join("wal.log")).unwrap();
        assert!(!log.preexisting());

        let l1 = log.append_begin(1);
        let l2 = log.append_update(1, l1, 2, 5, 200, vec![0; 46], vec![1; 46]);
        let l3 = log.append_commit(1, l2);
        assert!(l1 < l2 && l2 < l3);
        log.flush().unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].log_type(), LogType::Begin);
        assert_eq!(records[1].prev_lsn, l1);
        assert_eq!(records[2].log_type(), LogType::Commit);
    }

    #[test]
    fn test_reopen_continues_lsns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        let last = {
            let log = LogManager::open(&path).unwrap();
            let l1 = log.append_begin(1);
            let l2 = log.append_commit(1, l1);
            log.flush().unwrap();
            l2
        };

        let log = LogManager::open(&path).unwrap();
        assert!(log.preexisting());
        let next = log.append_begin(2);
        assert!(next > last);
    }

    #[test]
    fn test_unflushed_records_not_durable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        {
            let log = LogManager::open(&path).unwrap();
            let l1 = log.append_begin(1);
            log.flush().unwrap();
            log.append_commit(1, l1);
            // dropped without flush
        }

        let log = LogManager::open(&path).unwrap();
        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].log_type(), LogType::Begin);
    }
}
