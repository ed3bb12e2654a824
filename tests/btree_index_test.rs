use anyhow::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use karstdb::common::types::Page;
use karstdb::storage::disk::file_manager::header_page;
use karstdb::storage::disk::FileManager;
use karstdb::DbError;

mod common;
use common::{make_value, open_db, test_env};

const SIZES: [usize; 4] = [50, 70, 100, 108];

#[test]
fn test_descending_insert_then_find_all() -> Result<()> {
    let env = test_env()?;
    let db = open_db(&env, 64)?;
    let tid = db.open_table(&env.table_path)?;

    for key in (1..=2000).rev() {
        db.insert(tid, key, &make_value(key, 50))?;
    }
    assert_eq!(db.validate_index(tid)?, 2000);

    for key in 1..=2000 {
        let value = db.find(tid, key, 0)?;
        assert_eq!(value, make_value(key, 50), "key {}", key);
    }
    Ok(())
}

#[test]
fn test_random_insert_mixed_sizes_survives_reopen() -> Result<()> {
    let env = test_env()?;
    let n: i64 = 3000;

    let mut keys: Vec<i64> = (1..=n).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    keys.shuffle(&mut rng);

    {
        let db = open_db(&env, 32)?;
        let tid = db.open_table(&env.table_path)?;
        for &key in &keys {
            let size = SIZES[(key % 4) as usize];
            db.insert(tid, key, &make_value(key, size))?;
        }
        assert_eq!(db.validate_index(tid)?, n as u64);
        std::sync::Arc::try_unwrap(db).ok().unwrap().shutdown()?;
    }

    let db = open_db(&env, 32)?;
    let tid = db.open_table(&env.table_path)?;
    for key in 1..=n {
        let size = SIZES[(key % 4) as usize];
        let value = db.find(tid, key, 0)?;
        assert_eq!(value.len(), size);
        assert_eq!(value, make_value(key, size), "key {}", key);
    }
    assert_eq!(db.validate_index(tid)?, n as u64);
    Ok(())
}

#[test]
fn test_duplicate_and_size_limits_rejected() -> Result<()> {
    let env = test_env()?;
    let db = open_db(&env, 16)?;
    let tid = db.open_table(&env.table_path)?;

    db.insert(tid, 1, &make_value(1, 46))?;
    assert!(matches!(
        db.insert(tid, 1, &make_value(1, 46)),
        Err(DbError::DuplicateKey(1))
    ));
    assert!(matches!(
        db.insert(tid, 2, &vec![0u8; 45]),
        Err(DbError::InvalidSize(45))
    ));
    assert!(matches!(
        db.insert(tid, 2, &vec![0u8; 109]),
        Err(DbError::InvalidSize(109))
    ));
    Ok(())
}

#[test]
fn test_insert_delete_find_pattern() -> Result<()> {
    let env = test_env()?;
    let db = open_db(&env, 64)?;
    let tid = db.open_table(&env.table_path)?;
    let n: i64 = 3000;

    for key in 1..=n {
        db.insert(tid, key, &make_value(key, 50))?;
    }

    // drop the lower half plus every third key of the upper half
    for key in 1..n / 2 {
        db.delete(tid, key)?;
    }
    for key in n / 2..=n {
        if key % 3 == 0 {
            db.delete(tid, key)?;
        }
    }

    for key in 1..=n {
        let deleted = key < n / 2 || (key >= n / 2 && key % 3 == 0);
        match db.find(tid, key, 0) {
            Ok(value) => {
                assert!(!deleted, "key {} should have been deleted", key);
                assert_eq!(value, make_value(key, 50));
            }
            Err(DbError::NoSuchKey(_)) => {
                assert!(deleted, "key {} should still exist", key);
            }
            Err(e) => return Err(e.into()),
        }
    }
    db.validate_index(tid)?;
    Ok(())
}

#[test]
fn test_delete_all_leaves_empty_tree() -> Result<()> {
    let env = test_env()?;
    let n: i64 = 2000;
    {
        let db = open_db(&env, 64)?;
        let tid = db.open_table(&env.table_path)?;

        for key in 1..=n {
            db.insert(tid, key, &make_value(key, 70))?;
        }

        let mut keys: Vec<i64> = (1..=n).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        keys.shuffle(&mut rng);
        for &key in &keys {
            db.delete(tid, key)?;
        }

        assert_eq!(db.validate_index(tid)?, 0);
        assert!(matches!(db.find(tid, 1, 0), Err(DbError::NoSuchKey(1))));
        std::sync::Arc::try_unwrap(db).ok().unwrap().shutdown()?;
    }

    // on disk: no root, and every index page went back to the free list
    let mut catalog = env.log_path.as_os_str().to_owned();
    catalog.push(".tables");
    let fm = FileManager::new(std::path::PathBuf::from(catalog))?;
    let tid = fm.open_table(&env.table_path)?;
    let mut header = Page::new();
    fm.read_header_page(tid, &mut header)?;
    assert_eq!(header_page::root_page_number(&header), 0);
    assert_eq!(
        fm.count_free_pages(tid)?,
        header_page::num_of_pages(&header) - 1
    );
    Ok(())
}

/// Wide records drive the tree to two internal levels, so shrinking it
/// back exercises internal-node merging and redistribution as well.
#[test]
fn test_two_level_tree_grows_and_shrinks() -> Result<()> {
    let env = test_env()?;
    let db = open_db(&env, 256)?;
    let tid = db.open_table(&env.table_path)?;
    let n: i64 = 5000;

    for key in 1..=n {
        db.insert(tid, key, &make_value(key, 108))?;
    }
    assert_eq!(db.validate_index(tid)?, n as u64);

    for key in 1..=4500 {
        db.delete(tid, key)?;
    }
    assert_eq!(db.validate_index(tid)?, 500);

    for key in 4501..=n {
        assert_eq!(db.find(tid, key, 0)?, make_value(key, 108), "key {}", key);
    }
    Ok(())
}

#[test]
fn test_update_shrinking_keeps_stored_size() -> Result<()> {
    let env = test_env()?;
    let db = open_db(&env, 16)?;
    let tid = db.open_table(&env.table_path)?;

    db.insert(tid, 9, &make_value(9, 100))?;

    let trx = db.trx_begin();
    let shorter = vec![0xABu8; 60];
    let old_size = db.update(tid, 9, &shorter, trx)?;
    assert_eq!(old_size, 100);
    db.trx_commit(trx)?;

    // the stored size is unchanged; the first 60 bytes carry the new value
    let value = db.find(tid, 9, 0)?;
    assert_eq!(value.len(), 100);
    assert_eq!(&value[..60], &shorter[..]);
    assert_eq!(&value[60..], &make_value(9, 100)[60..]);
    Ok(())
}
