//! ARIES-style restart recovery: analysis, redo, undo.
//!
//! The operator audit trail (`logmsg` file) records every pass and every
//! record decision in a fixed text format; it is separate from the engine's
//! diagnostic logging.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use thiserror::Error;

use crate::common::types::{Lsn, TrxId};
use crate::index::btree::node::header;
use crate::storage::buffer::{BufferPool, BufferPoolError};
use crate::transaction::concurrency::transaction_manager::TrxManager;
use crate::transaction::wal::log_manager::{LogError, LogManager};
use crate::transaction::wal::log_record::{LogBody, LogRecord, LogType};

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Buffer(#[from] BufferPoolError),

    #[error("I/O error on logmsg file: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt log: {0}")]
    CorruptLog(String),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Crash hooks from the grading harness: flag 1 stops the redo pass after
/// `log_num` applied records, flag 2 stops the undo pass likewise.
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    pub flag: i32,
    pub log_num: u64,
    pub logmsg_path: PathBuf,
}

struct LogMsgWriter {
    file: File,
}

impl LogMsgWriter {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    fn line(&mut self, text: &str) -> Result<()> {
        writeln!(self.file, "{}", text)?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Runs the three restart passes over a pre-existing log.
pub struct RecoveryManager {
    log: Arc<LogManager>,
    pool: Arc<BufferPool>,
    trxs: Arc<TrxManager>,
    options: RecoveryOptions,
}

impl RecoveryManager {
    pub fn new(
        log: Arc<LogManager>,
        pool: Arc<BufferPool>,
        trxs: Arc<TrxManager>,
        options: RecoveryOptions,
    ) -> Self {
        Self {
            log,
            pool,
            trxs,
            options,
        }
    }

    pub fn recover(&self) -> Result<()> {
        let mut msg = LogMsgWriter::open(&self.options.logmsg_path)?;
        let records = self.log.read_all()?;

        let (winners, losers) = self.analysis(&records, &mut msg)?;
        info!(
            "recovery: {} records, {} winners, {} losers",
            records.len(),
            winners.len(),
            losers.len()
        );

        let finished = self.redo(&records, &losers, &mut msg)?;
        if finished {
            self.undo(&records, &losers, &mut msg)?;
        }

        self.log.flush()?;
        msg.finish()
    }

    /// Forward scan classifying transactions into winners (saw a terminal
    /// record) and losers, and seeding the LSN and trx-id counters.
    fn analysis(
        &self,
        records: &[LogRecord],
        msg: &mut LogMsgWriter,
    ) -> Result<(HashSet<TrxId>, HashMap<TrxId, Lsn>)> {
        msg.line("[ANALYSIS] Analysis pass start")?;

        let mut winners: HashSet<TrxId> = HashSet::new();
        let mut losers: HashMap<TrxId, Lsn> = HashMap::new();
        let mut max_lsn: Lsn = 0;
        let mut max_trx_id: TrxId = 0;

        for rec in records {
            max_lsn = max_lsn.max(rec.lsn);
            max_trx_id = max_trx_id.max(rec.trx_id);
            match rec.log_type() {
                LogType::Begin => {
                    losers.insert(rec.trx_id, rec.lsn);
                }
                LogType::Commit | LogType::Rollback => {
                    losers.remove(&rec.trx_id);
                    winners.insert(rec.trx_id);
                }
                LogType::Update | LogType::Compensate => {
                    losers.insert(rec.trx_id, rec.lsn);
                }
            }
        }

        self.log.seed_next_lsn(max_lsn + 1);
        self.trxs.seed_counter(max_trx_id);

        let mut winner_ids: Vec<TrxId> = winners.iter().copied().collect();
        winner_ids.sort_unstable();
        let mut loser_ids: Vec<TrxId> = losers.keys().copied().collect();
        loser_ids.sort_unstable();
        msg.line(&format!(
            "[ANALYSIS] Analysis success. Winner: {}, Loser: {}",
            join_ids(&winner_ids),
            join_ids(&loser_ids)
        ))?;

        Ok((winners, losers))
    }

    /// Repeat history: reapply every update whose LSN is newer than the
    /// page's `page_lsn`. Returns false if a crash hook cut the pass short.
    fn redo(
        &self,
        records: &[LogRecord],
        losers: &HashMap<TrxId, Lsn>,
        msg: &mut LogMsgWriter,
    ) -> Result<bool> {
        msg.line("[REDO] Redo pass start")?;

        for (&trx_id, &last_lsn) in losers {
            self.trxs.adopt_loser(trx_id, last_lsn);
        }

        let mut applied: u64 = 0;
        for rec in records {
            match &rec.body {
                LogBody::Begin => {
                    msg.line(&format!("LSN {} [BEGIN] Transaction id {}", rec.lsn, rec.trx_id))?;
                }
                LogBody::Commit => {
                    msg.line(&format!("LSN {} [COMMIT] Transaction id {}", rec.lsn, rec.trx_id))?;
                }
                LogBody::Rollback => {
                    msg.line(&format!(
                        "LSN {} [ROLLBACK] Transaction id {}",
                        rec.lsn, rec.trx_id
                    ))?;
                }
                LogBody::Update {
                    table_id,
                    page_num,
                    offset,
                    new_image,
                    ..
                }
                | LogBody::Compensate {
                    table_id,
                    page_num,
                    offset,
                    new_image,
                    ..
                } => {
                    let mut guard = self.pool.get_page(*table_id, *page_num)?;
                    if header::page_lsn(guard.page()) < rec.lsn {
                        let off = *offset as usize;
                        guard.page_mut().data[off..off + new_image.len()]
                            .copy_from_slice(new_image);
                        header::set_page_lsn(guard.page_mut(), rec.lsn);
                        guard.mark_dirty();
                        drop(guard);

                        match &rec.body {
                            LogBody::Compensate { next_undo_lsn, .. } => {
                                msg.line(&format!(
                                    "LSN {} [CLR] next undo lsn {}",
                                    rec.lsn, next_undo_lsn
                                ))?;
                            }
                            _ => {
                                msg.line(&format!(
                                    "LSN {} [UPDATE] Transaction id {} redo apply",
                                    rec.lsn, rec.trx_id
                                ))?;
                            }
                        }

                        applied += 1;
                        if self.options.flag == 1 && applied >= self.options.log_num {
                            info!("redo pass stopped by crash hook after {} records", applied);
                            return Ok(false);
                        }
                    } else {
                        msg.line(&format!(
                            "LSN {} [CONSIDER-REDO] Transaction id {}",
                            rec.lsn, rec.trx_id
                        ))?;
                    }
                }
            }
        }

        msg.line("[REDO] Redo pass end")?;
        Ok(true)
    }

    /// Roll the losers back, newest LSN first, emitting CLRs so a repeated
    /// recovery does not undo twice. Each loser bottoms out at its BEGIN,
    /// which gets a ROLLBACK record.
    fn undo(
        &self,
        records: &[LogRecord],
        losers: &HashMap<TrxId, Lsn>,
        msg: &mut LogMsgWriter,
    ) -> Result<()> {
        msg.line("[UNDO] Undo pass start")?;

        let by_lsn: HashMap<Lsn, &LogRecord> =
            records.iter().map(|rec| (rec.lsn, rec)).collect();

        let mut cur_last: HashMap<TrxId, Lsn> = losers.clone();
        let mut heap: BinaryHeap<Lsn> = losers.values().copied().collect();

        let mut applied: u64 = 0;
        while let Some(lsn) = heap.pop() {
            let rec = by_lsn.get(&lsn).ok_or_else(|| {
                RecoveryError::CorruptLog(format!("undo chain references unknown LSN {}", lsn))
            })?;

            match &rec.body {
                LogBody::Update {
                    table_id,
                    page_num,
                    offset,
                    old_image,
                    new_image,
                } => {
                    let prev = cur_last[&rec.trx_id];
                    let clr_lsn = self.log.append_compensate(
                        rec.trx_id,
                        prev,
                        *table_id,
                        *page_num,
                        *offset,
                        new_image.clone(),
                        old_image.clone(),
                        rec.prev_lsn,
                    );
                    cur_last.insert(rec.trx_id, clr_lsn);

                    let mut guard = self.pool.get_page(*table_id, *page_num)?;
                    let off = *offset as usize;
                    guard.page_mut().data[off..off + old_image.len()].copy_from_slice(old_image);
                    header::set_page_lsn(guard.page_mut(), clr_lsn);
                    guard.mark_dirty();
                    drop(guard);

                    msg.line(&format!(
                        "LSN {} [UPDATE] Transaction id {} undo apply",
                        rec.lsn, rec.trx_id
                    ))?;

                    applied += 1;
                    if self.options.flag == 2 && applied >= self.options.log_num {
                        info!("undo pass stopped by crash hook after {} records", applied);
                        return Ok(());
                    }

                    heap.push(rec.prev_lsn);
                }
                LogBody::Compensate { next_undo_lsn, .. } => {
                    if *next_undo_lsn != 0 {
                        heap.push(*next_undo_lsn);
                    }
                }
                LogBody::Begin => {
                    let prev = cur_last[&rec.trx_id];
                    self.log.append_rollback(rec.trx_id, prev);
                    self.trxs.discard(rec.trx_id);
                }
                LogBody::Commit | LogBody::Rollback => {
                    return Err(RecoveryError::CorruptLog(format!(
                        "terminal record LSN {} reached in undo chain of loser {}",
                        rec.lsn, rec.trx_id
                    )));
                }
            }
        }

        msg.line("[UNDO] Undo pass end")?;
        Ok(())
    }
}

fn join_ids(ids: &[TrxId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
