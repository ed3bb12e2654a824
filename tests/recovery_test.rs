use std::fs;
use std::sync::Arc;

use anyhow::Result;

use karstdb::Db;

mod common;
use common::{balance_value, open_db, read_balance, test_env, TestEnv};

fn shutdown(db: Arc<Db>) -> Result<()> {
    Arc::try_unwrap(db).ok().unwrap().shutdown()?;
    Ok(())
}

/// Committed work must survive a crash that loses every data page: redo
/// rebuilds it from the log alone.
#[test]
fn test_committed_updates_survive_crash() -> Result<()> {
    let env = test_env()?;
    let n: i64 = 50;
    {
        let db = open_db(&env, 32)?;
        let tid = db.open_table(&env.table_path)?;
        for key in 0..n {
            db.insert(tid, key, &balance_value(1000))?;
        }
        // data pages reach disk, the later updates exist only in the log
        db.flush_all()?;

        let trx = db.trx_begin();
        for key in 0..n {
            db.update(tid, key, &balance_value(2000), trx)?;
        }
        db.trx_commit(trx)?;
        drop(db); // crash: no frame flush
    }

    let db = open_db(&env, 32)?;
    let tid = db.open_table(&env.table_path)?;
    for key in 0..n {
        assert_eq!(read_balance(&db.find(tid, key, 0)?), 2000, "key {}", key);
    }
    shutdown(db)
}

/// A transaction without a terminal record is a loser: its durable updates
/// are rolled back through CLRs during undo.
#[test]
fn test_loser_updates_rolled_back() -> Result<()> {
    let env = test_env()?;
    {
        let db = open_db(&env, 32)?;
        let tid = db.open_table(&env.table_path)?;
        for key in 0..10 {
            db.insert(tid, key, &balance_value(1000))?;
        }
        db.flush_all()?;

        let loser = db.trx_begin();
        for key in 1..10 {
            db.update(tid, key, &balance_value(9999), loser)?;
        }
        // a concurrent commit on a disjoint record flushes the shared log
        // buffer, making the loser's updates durable without a terminal
        let winner = db.trx_begin();
        db.update(tid, 0, &balance_value(1234), winner)?;
        db.trx_commit(winner)?;
        drop(db); // crash with `loser` still active
    }

    let db = open_db(&env, 32)?;
    let tid = db.open_table(&env.table_path)?;
    // the winner's write is the last committed state of key 0
    assert_eq!(read_balance(&db.find(tid, 0, 0)?), 1234);
    for key in 1..10 {
        assert_eq!(read_balance(&db.find(tid, key, 0)?), 1000, "key {}", key);
    }
    shutdown(db)
}

/// Restart recovery is idempotent: recovering twice over the same log
/// yields the same state.
#[test]
fn test_double_recovery_is_idempotent() -> Result<()> {
    let env = test_env()?;
    let total_expected: i64 = 20 * 1000;
    {
        let db = open_db(&env, 32)?;
        let tid = db.open_table(&env.table_path)?;
        for key in 0..20 {
            db.insert(tid, key, &balance_value(1000))?;
        }
        db.flush_all()?;

        // one committed transfer, one in-flight transfer at crash time
        let trx = db.trx_begin();
        db.update(tid, 0, &balance_value(900), trx)?;
        db.update(tid, 1, &balance_value(1100), trx)?;
        db.trx_commit(trx)?;

        let loser = db.trx_begin();
        db.update(tid, 2, &balance_value(1), loser)?;
        let flusher = db.trx_begin();
        db.update(tid, 3, &balance_value(1000), flusher)?;
        db.trx_commit(flusher)?;
        drop(db);
    }

    for _ in 0..2 {
        let db = open_db(&env, 32)?;
        let tid = db.open_table(&env.table_path)?;
        let trx = db.trx_begin();
        let mut total = 0;
        for key in 0..20 {
            total += read_balance(&db.find(tid, key, trx)?);
        }
        db.trx_commit(trx)?;
        assert_eq!(total, total_expected);
        shutdown(db)?;
    }
    Ok(())
}

#[test]
fn test_logmsg_records_all_passes() -> Result<()> {
    let env = test_env()?;
    {
        let db = open_db(&env, 16)?;
        let tid = db.open_table(&env.table_path)?;
        db.insert(tid, 1, &balance_value(10))?;
        db.insert(tid, 2, &balance_value(10))?;
        db.flush_all()?;

        let loser = db.trx_begin();
        db.update(tid, 1, &balance_value(20), loser)?;
        let winner = db.trx_begin();
        db.update(tid, 2, &balance_value(30), winner)?;
        db.trx_commit(winner)?;
        drop(db);
    }

    let db = open_db(&env, 16)?;
    shutdown(db)?;

    let text = fs::read_to_string(&env.logmsg_path)?;
    assert!(text.contains("[ANALYSIS] Analysis pass start"));
    assert!(text.contains("[ANALYSIS] Analysis success. Winner:"));
    assert!(text.contains("[REDO] Redo pass start"));
    assert!(text.contains("redo apply") || text.contains("[CONSIDER-REDO]"));
    assert!(text.contains("[REDO] Redo pass end"));
    assert!(text.contains("[UNDO] Undo pass start"));
    assert!(text.contains("undo apply"));
    assert!(text.contains("[UNDO] Undo pass end"));
    Ok(())
}

#[test]
fn test_trx_ids_continue_past_recovered_log() -> Result<()> {
    let env = test_env()?;
    let first_trx;
    {
        let db = open_db(&env, 16)?;
        let tid = db.open_table(&env.table_path)?;
        db.insert(tid, 1, &balance_value(1))?;
        first_trx = db.trx_begin();
        db.update(tid, 1, &balance_value(2), first_trx)?;
        db.trx_commit(first_trx)?;
        drop(db);
    }

    let db = open_db(&env, 16)?;
    let next_trx = db.trx_begin();
    assert!(next_trx > first_trx, "trx ids must be seeded past the log");
    db.trx_commit(next_trx)?;
    shutdown(db)
}

/// 30 random transfers, crash, recover, scan: the conserved total holds.
#[test]
fn test_bank_invariant_after_crash() -> Result<()> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let env: TestEnv = test_env()?;
    let n: i64 = 40;
    {
        let db = open_db(&env, 32)?;
        let tid = db.open_table(&env.table_path)?;
        for key in 0..n {
            db.insert(tid, key, &balance_value(1000))?;
        }
        db.flush_all()?;

        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..30 {
            let a = rng.gen_range(0..n);
            let mut b = rng.gen_range(0..n);
            if a == b {
                b = (b + 1) % n;
            }
            let amount = rng.gen_range(1..100);
            let trx = db.trx_begin();
            let bal_a = read_balance(&db.find(tid, a, trx)?);
            let bal_b = read_balance(&db.find(tid, b, trx)?);
            db.update(tid, a, &balance_value(bal_a - amount), trx)?;
            db.update(tid, b, &balance_value(bal_b + amount), trx)?;
            db.trx_commit(trx)?;
        }
        // one in-flight transfer is lost with the crash
        let loser = db.trx_begin();
        db.update(tid, 0, &balance_value(0), loser)?;
        drop(db);
    }

    let db = open_db(&env, 32)?;
    let tid = db.open_table(&env.table_path)?;
    let trx = db.trx_begin();
    let mut total = 0;
    for key in 0..n {
        total += read_balance(&db.find(tid, key, trx)?);
    }
    db.trx_commit(trx)?;
    assert_eq!(total, n * 1000);
    shutdown(db)
}
