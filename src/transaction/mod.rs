pub mod concurrency;
pub mod wal;

pub use concurrency::lock_manager::{LockError, LockManager, LockMode};
pub use concurrency::transaction_manager::{TrxError, TrxManager};
pub use wal::log_manager::LogManager;
pub use wal::recovery::RecoveryManager;
