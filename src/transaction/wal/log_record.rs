use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::common::types::{Lsn, PageNum, TableId, TrxId};

/// Size of the fixed prefix shared by every record:
/// `{log_size u32, lsn u64, prev_lsn u64, trx_id i32, type i32}`.
pub const LOG_PREFIX_SIZE: usize = 28;

/// Size of an UPDATE/COMPENSATE header before the images:
/// prefix + `{table_id i64, page_num u64, offset u16, len u16}`.
pub const UPDATE_HEADER_SIZE: usize = 48;

#[derive(Error, Debug)]
pub enum LogRecordError {
    #[error("log record truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unknown log record type {0}")]
    UnknownType(i32),

    #[error("log record size field {0} is inconsistent")]
    BadSize(u32),
}

pub type Result<T> = std::result::Result<T, LogRecordError>;

/// Record type tags as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Begin = 0,
    Update = 1,
    Commit = 2,
    Rollback = 3,
    Compensate = 4,
}

impl LogType {
    fn from_i32(v: i32) -> Result<Self> {
        Ok(match v {
            0 => LogType::Begin,
            1 => LogType::Update,
            2 => LogType::Commit,
            3 => LogType::Rollback,
            4 => LogType::Compensate,
            other => return Err(LogRecordError::UnknownType(other)),
        })
    }
}

/// Type-specific payload of a log record.
#[derive(Debug, Clone)]
pub enum LogBody {
    Begin,
    Commit,
    Rollback,
    Update {
        table_id: TableId,
        page_num: PageNum,
        offset: u16,
        old_image: Vec<u8>,
        new_image: Vec<u8>,
    },
    Compensate {
        table_id: TableId,
        page_num: PageNum,
        offset: u16,
        old_image: Vec<u8>,
        new_image: Vec<u8>,
        next_undo_lsn: Lsn,
    },
}

/// One write-ahead log record. Immutable once pushed into the log buffer.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub trx_id: TrxId,
    pub body: LogBody,
}

impl LogRecord {
    pub fn log_type(&self) -> LogType {
        match self.body {
            LogBody::Begin => LogType::Begin,
            LogBody::Commit => LogType::Commit,
            LogBody::Rollback => LogType::Rollback,
            LogBody::Update { .. } => LogType::Update,
            LogBody::Compensate { .. } => LogType::Compensate,
        }
    }

    /// Total on-disk size of the record, including the size field itself.
    pub fn log_size(&self) -> u32 {
        match &self.body {
            LogBody::Begin | LogBody::Commit | LogBody::Rollback => LOG_PREFIX_SIZE as u32,
            LogBody::Update { old_image, .. } => (UPDATE_HEADER_SIZE + 2 * old_image.len()) as u32,
            LogBody::Compensate { old_image, .. } => {
                (UPDATE_HEADER_SIZE + 2 * old_image.len() + 8) as u32
            }
        }
    }

    /// Append the little-endian wire form onto `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut prefix = [0u8; LOG_PREFIX_SIZE];
        LittleEndian::write_u32(&mut prefix[0..4], self.log_size());
        LittleEndian::write_u64(&mut prefix[4..12], self.lsn);
        LittleEndian::write_u64(&mut prefix[12..20], self.prev_lsn);
        LittleEndian::write_i32(&mut prefix[20..24], self.trx_id);
        LittleEndian::write_i32(&mut prefix[24..28], self.log_type() as i32);
        buf.extend_from_slice(&prefix);

        match &self.body {
            LogBody::Begin | LogBody::Commit | LogBody::Rollback => {}
            LogBody::Update {
                table_id,
                page_num,
                offset,
                old_image,
                new_image,
            } => {
                Self::encode_update_tail(buf, *table_id, *page_num, *offset, old_image, new_image);
            }
            LogBody::Compensate {
                table_id,
                page_num,
                offset,
                old_image,
                new_image,
                next_undo_lsn,
            } => {
                Self::encode_update_tail(buf, *table_id, *page_num, *offset, old_image, new_image);
                let mut tail = [0u8; 8];
                LittleEndian::write_u64(&mut tail, *next_undo_lsn);
                buf.extend_from_slice(&tail);
            }
        }
    }

    fn encode_update_tail(
        buf: &mut Vec<u8>,
        table_id: TableId,
        page_num: PageNum,
        offset: u16,
        old_image: &[u8],
        new_image: &[u8],
    ) {
        debug_assert_eq!(old_image.len(), new_image.len());
        let mut head = [0u8; UPDATE_HEADER_SIZE - LOG_PREFIX_SIZE];
        LittleEndian::write_i64(&mut head[0..8], table_id);
        LittleEndian::write_u64(&mut head[8..16], page_num);
        LittleEndian::write_u16(&mut head[16..18], offset);
        LittleEndian::write_u16(&mut head[18..20], old_image.len() as u16);
        buf.extend_from_slice(&head);
        buf.extend_from_slice(old_image);
        buf.extend_from_slice(new_image);
    }

    /// Decode one record from `bytes`, which must start at the record's size
    /// field and contain the whole record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LOG_PREFIX_SIZE {
            return Err(LogRecordError::Truncated {
                need: LOG_PREFIX_SIZE,
                have: bytes.len(),
            });
        }
        let log_size = LittleEndian::read_u32(&bytes[0..4]) as usize;
        if log_size < LOG_PREFIX_SIZE || bytes.len() < log_size {
            return Err(LogRecordError::Truncated {
                need: log_size,
                have: bytes.len(),
            });
        }
        let lsn = LittleEndian::read_u64(&bytes[4..12]);
        let prev_lsn = LittleEndian::read_u64(&bytes[12..20]);
        let trx_id = LittleEndian::read_i32(&bytes[20..24]);
        let log_type = LogType::from_i32(LittleEndian::read_i32(&bytes[24..28]))?;

        let body = match log_type {
            LogType::Begin => LogBody::Begin,
            LogType::Commit => LogBody::Commit,
            LogType::Rollback => LogBody::Rollback,
            LogType::Update | LogType::Compensate => {
                if log_size < UPDATE_HEADER_SIZE {
                    return Err(LogRecordError::BadSize(log_size as u32));
                }
                let table_id = LittleEndian::read_i64(&bytes[28..36]);
                let page_num = LittleEndian::read_u64(&bytes[36..44]);
                let offset = LittleEndian::read_u16(&bytes[44..46]);
                let len = LittleEndian::read_u16(&bytes[46..48]) as usize;

                let tail = if log_type == LogType::Compensate { 8 } else { 0 };
                if log_size != UPDATE_HEADER_SIZE + 2 * len + tail {
                    return Err(LogRecordError::BadSize(log_size as u32));
                }
                let old_image = bytes[48..48 + len].to_vec();
                let new_image = bytes[48 + len..48 + 2 * len].to_vec();

                if log_type == LogType::Update {
                    LogBody::Update {
                        table_id,
                        page_num,
                        offset,
                        old_image,
                        new_image,
                    }
                } else {
                    let next_undo_lsn = LittleEndian::read_u64(&bytes[log_size - 8..log_size]);
                    LogBody::Compensate {
                        table_id,
                        page_num,
                        offset,
                        old_image,
                        new_image,
                        next_undo_lsn,
                    }
                }
            }
        };

        Ok(Self {
            lsn,
            prev_lsn,
            trx_id,
            body,
        })
    }
}
