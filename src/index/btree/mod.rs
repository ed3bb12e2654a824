pub mod deletion;
pub mod index;
pub mod node;

use thiserror::Error;

use crate::storage::buffer::BufferPoolError;
use crate::transaction::concurrency::lock_manager::LockError;
use crate::transaction::concurrency::transaction_manager::TrxError;

pub use index::{BTree, TrxContext};

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("record size {0} outside [46, 108]")]
    InvalidSize(u16),

    #[error("key {0} already exists")]
    DuplicateKey(i64),

    #[error("no record with key {0}")]
    NoSuchKey(i64),

    #[error("page allocation failed")]
    OutOfPages,

    #[error("tree invariant violated: {0}")]
    CorruptTree(String),

    #[error(transparent)]
    Buffer(#[from] BufferPoolError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Trx(#[from] TrxError),
}

pub type Result<T> = std::result::Result<T, BTreeError>;
