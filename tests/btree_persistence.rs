use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::ops::Bound;
use std::sync::Arc;

use tempfile::tempdir;
use tessera::primitives::block::{BlockStore, FileBlockStore, BLOCK_FRAME_LEN};
use tessera::storage::btree::{BTree, CounterMetrics, TreeConfig, Value, Visit};
use tessera::types::{Result, TesseraError};

fn config() -> TreeConfig {
    TreeConfig::default()
        .max_entry_size(128)
        .leaf_capacity(1024)
        .interior_budget(1024)
}

fn key(n: u32) -> Vec<u8> {
    format!("user:{n:06}").into_bytes()
}

fn value(n: u32) -> Value {
    Value::new(2, format!("{{\"id\":{n}}}").into_bytes())
}

fn open_store(path: &std::path::Path) -> Result<Arc<dyn BlockStore>> {
    Ok(Arc::new(FileBlockStore::open(path)?))
}

#[test]
fn committed_tree_survives_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.blocks");

    let saved = {
        let store = open_store(&path)?;
        let mut tree = BTree::open(&store, config())?;
        for n in 0..2_000 {
            tree.put(&key(n), &value(n))?;
        }
        for n in (0..2_000).step_by(3) {
            tree.remove(&key(n))?;
        }
        assert!(tree.commit()?);
        assert!(tree.height() >= 1);
        tree.config().clone()
    };
    let json = serde_json::to_string(&saved).unwrap();

    let store = open_store(&path)?;
    let config: TreeConfig = serde_json::from_str(&json).unwrap();
    let tree = BTree::open(&store, config)?;
    assert_eq!(tree.integrity_check()?, None);
    assert_eq!(tree.size()?, 2_000 - 667);
    for n in 0..2_000 {
        let expected = (n % 3 != 0).then(|| value(n));
        assert_eq!(tree.get(&key(n))?, expected, "key {n}");
    }
    Ok(())
}

#[test]
fn uncommitted_changes_are_not_visible_after_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.blocks");

    let saved = {
        let store = open_store(&path)?;
        let mut tree = BTree::open(&store, config())?;
        for n in 0..500 {
            tree.put(&key(n), &value(n))?;
        }
        tree.commit()?;
        for n in 500..900 {
            tree.put(&key(n), &value(n))?;
        }
        tree.remove(&key(1))?;
        tree.config().clone()
    };

    let store = open_store(&path)?;
    let tree = BTree::open(&store, saved)?;
    assert_eq!(tree.size()?, 500);
    assert_eq!(tree.get(&key(1))?, Some(value(1)));
    assert_eq!(tree.get(&key(700))?, None);
    Ok(())
}

#[test]
fn rollback_restores_last_commit_on_disk() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.blocks");
    let store = open_store(&path)?;
    let metrics = Arc::new(CounterMetrics::new());
    let mut tree = BTree::with_metrics(&store, config(), metrics.clone())?;

    for n in 0..800 {
        tree.put(&key(n), &value(n))?;
    }
    tree.commit()?;
    let committed_root = tree.config().root;

    for n in 0..800 {
        tree.remove(&key(n))?;
    }
    assert_eq!(tree.size()?, 0);
    tree.rollback()?;
    assert_eq!(tree.config().root, committed_root);
    assert_eq!(tree.size()?, 800);
    assert_eq!(tree.integrity_check()?, None);

    let mut keys = Vec::new();
    tree.scan(
        Bound::Included(key(100).as_slice()),
        Bound::Included(key(104).as_slice()),
        |entry| {
            keys.push(entry.key.to_vec());
            Visit::Continue
        },
    )?;
    assert_eq!(keys, (100..=104).map(key).collect::<Vec<_>>());

    // Blocks released by the second commit become reusable in later transactions.
    for n in 0..800 {
        tree.put(&key(n), &Value::new(3, vec![n as u8; 8]))?;
    }
    tree.commit()?;
    for n in 0..800 {
        tree.put(&key(n), &value(n))?;
    }
    tree.commit()?;
    assert_eq!(tree.integrity_check()?, None);
    let stats = metrics.snapshot();
    assert_eq!(stats.commits, 3);
    assert!(stats.blocks_freed > 0);
    Ok(())
}

#[test]
fn damaged_block_is_reported_as_corruption() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.blocks");
    let root = {
        let store = open_store(&path)?;
        let mut tree = BTree::open(&store, config())?;
        for n in 0..10 {
            tree.put(&key(n), &value(n))?;
        }
        tree.commit()?;
        tree.config().root.expect("committed root")
    };

    {
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(root.address + BLOCK_FRAME_LEN as u64 + 8))
            .unwrap();
        file.write_all(&[0xFF, 0xFF]).unwrap();
        file.sync_all().unwrap();
    }

    let store = open_store(&path)?;
    let mut config = config();
    config.root = Some(root);
    match BTree::open(&store, config) {
        Err(TesseraError::Corruption(_)) => Ok(()),
        Err(other) => panic!("expected corruption, got {other}"),
        Ok(_) => panic!("damaged root opened cleanly"),
    }
}
