// Export public modules
pub mod common;
pub mod db;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use db::{Db, DbError, DbOptions};
pub use storage::buffer::BufferPool;
pub use storage::buffer::BufferPoolError;
pub use storage::disk::FileManager;
pub use transaction::concurrency::LockMode;
