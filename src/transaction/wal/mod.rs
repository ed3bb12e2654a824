pub mod log_manager;
pub mod log_record;
pub mod recovery;

pub use log_manager::{LogError, LogManager};
pub use log_record::{LogBody, LogRecord, LogType};
pub use recovery::{RecoveryError, RecoveryManager, RecoveryOptions};
