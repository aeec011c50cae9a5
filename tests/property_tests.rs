use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera::primitives::block::{BlockStore, MemBlockStore};
use tessera::storage::btree::{BTree, MapPut, SortedBlockMap, TreeConfig, Value, Visit};

#[derive(Debug, Clone)]
enum Operation {
    Put { key: Vec<u8>, tag: u8, payload: Vec<u8> },
    Remove { key: Vec<u8> },
    Commit,
    Rollback,
}

fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..8, 0..4)
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        6 => (arb_key(), any::<u8>(), prop::collection::vec(any::<u8>(), 0..24))
            .prop_map(|(key, tag, payload)| Operation::Put { key, tag, payload }),
        3 => arb_key().prop_map(|key| Operation::Remove { key }),
        1 => Just(Operation::Commit),
        1 => Just(Operation::Rollback),
    ]
}

fn small_config() -> TreeConfig {
    TreeConfig::default()
        .max_entry_size(32)
        .leaf_capacity(160)
        .interior_budget(256)
}

fn tree_keys(tree: &BTree) -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    tree.scan(
        std::ops::Bound::Unbounded,
        std::ops::Bound::Unbounded,
        |entry| {
            keys.push(entry.key.to_vec());
            Visit::Continue
        },
    )
    .unwrap();
    keys
}

proptest! {
    #[test]
    fn prop_tree_matches_model(ops in prop::collection::vec(arb_operation(), 1..300)) {
        let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new());
        let mut tree = BTree::open(&store, small_config()).unwrap();
        let mut live: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        let mut committed = live.clone();

        for op in ops {
            match op {
                Operation::Put { key, tag, payload } => {
                    let value = Value::new(tag, payload);
                    let previous = tree.put(&key, &value).unwrap();
                    prop_assert_eq!(previous, live.insert(key, value));
                }
                Operation::Remove { key } => {
                    let previous = tree.remove(&key).unwrap();
                    prop_assert_eq!(previous, live.remove(&key));
                }
                Operation::Commit => {
                    tree.commit().unwrap();
                    committed = live.clone();
                }
                Operation::Rollback => {
                    tree.rollback().unwrap();
                    live = committed.clone();
                }
            }
            prop_assert_eq!(tree.integrity_check().unwrap(), None);
        }

        prop_assert_eq!(tree.size().unwrap(), live.len() as u64);
        let expected: Vec<Vec<u8>> = live.keys().cloned().collect();
        prop_assert_eq!(tree_keys(&tree), expected);
        for (key, value) in &live {
            let got = tree.get(key).unwrap();
            prop_assert_eq!(got.as_ref(), Some(value));
        }
    }

    #[test]
    fn prop_block_map_stays_consistent(
        ops in prop::collection::vec((any::<bool>(), arb_key(), prop::collection::vec(any::<u8>(), 0..12)), 1..200)
    ) {
        let mut map = SortedBlockMap::create(256).unwrap();
        let mut model: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        for (insert, key, payload) in ops {
            if insert {
                let value = Value::new(3, payload);
                match map.put(&key, value.view()).unwrap() {
                    MapPut::NoSpace => {}
                    MapPut::Inserted => prop_assert!(model.insert(key, value).is_none()),
                    MapPut::Replaced(previous) => {
                        prop_assert_eq!(Some(previous), model.insert(key, value));
                    }
                }
            } else {
                let removed = map.remove(&key).unwrap();
                prop_assert_eq!(removed, model.remove(&key));
            }
            prop_assert_eq!(map.integrity_check(), None);
        }

        let rewrapped = SortedBlockMap::wrap(map.as_bytes().to_vec()).unwrap();
        prop_assert_eq!(rewrapped.len(), model.len());
        for (entry, (key, value)) in rewrapped.iter().zip(model.iter()) {
            let entry = entry.unwrap();
            prop_assert_eq!(entry.key, key.as_slice());
            prop_assert_eq!(entry.value.to_value(), value.clone());
        }
    }

    #[test]
    fn prop_index_of_reports_insertion_point(
        keys in prop::collection::btree_set(prop::collection::vec(any::<u8>(), 1..6), 0..20),
        target in prop::collection::vec(any::<u8>(), 1..6),
    ) {
        let mut map = SortedBlockMap::create(1024).unwrap();
        for key in &keys {
            map.put(key, Value::new(0, Vec::new()).view()).unwrap();
        }
        let sorted: Vec<&Vec<u8>> = keys.iter().collect();
        let expected = match sorted.binary_search(&&target) {
            Ok(idx) => idx as i32,
            Err(point) => -(point as i32) - 1,
        };
        prop_assert_eq!(map.index_of(&target).unwrap(), expected);
    }
}
