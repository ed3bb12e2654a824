use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use karstdb::{Db, DbOptions};

/// Scratch environment for one engine instance. Keep the `TempDir` alive
/// for as long as the files are needed.
#[allow(dead_code)]
pub struct TestEnv {
    pub dir: TempDir,
    pub log_path: PathBuf,
    pub logmsg_path: PathBuf,
    pub table_path: PathBuf,
}

#[allow(dead_code)]
pub fn test_env() -> Result<TestEnv> {
    let dir = TempDir::new()?;
    let log_path = dir.path().join("wal.log");
    let logmsg_path = dir.path().join("logmsg.txt");
    let table_path = dir.path().join("table0.db");
    Ok(TestEnv {
        dir,
        log_path,
        logmsg_path,
        table_path,
    })
}

#[allow(dead_code)]
pub fn open_db(env: &TestEnv, num_buf: usize) -> Result<Arc<Db>> {
    let db = Db::open(DbOptions::new(num_buf, &env.log_path, &env.logmsg_path))?;
    Ok(Arc::new(db))
}

/// Deterministic record payload: the key stamped into the first bytes,
/// filler derived from the key after that.
#[allow(dead_code)]
pub fn make_value(key: i64, size: usize) -> Vec<u8> {
    let mut value = vec![(key % 251) as u8; size];
    value[..8].copy_from_slice(&key.to_le_bytes());
    value
}

/// Balance record used by the transfer workloads: a 50-byte value with a
/// little-endian i64 balance in front.
#[allow(dead_code)]
pub fn balance_value(balance: i64) -> Vec<u8> {
    let mut value = vec![0u8; 50];
    value[..8].copy_from_slice(&balance.to_le_bytes());
    value
}

#[allow(dead_code)]
pub fn read_balance(value: &[u8]) -> i64 {
    i64::from_le_bytes(value[..8].try_into().unwrap())
}
