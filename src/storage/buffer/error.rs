use thiserror::Error;

use crate::storage::disk::FileError;
use crate::transaction::wal::log_manager::LogError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("all buffer frames are pinned, cannot evict")]
    NoFreeFrame,

    #[error(transparent)]
    File(#[from] FileError),

    #[error("log flush before eviction failed: {0}")]
    Log(#[from] LogError),
}

pub type Result<T> = std::result::Result<T, BufferPoolError>;
