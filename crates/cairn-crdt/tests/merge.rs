//! Order independence of the delta merger.

use cairn_crdt::{Batch, CrdtSet, Datastore, Delta, Key, MemoryDatastore};
use cairn_merkle::{Cid, Hasher};
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Clone, Debug)]
enum Op {
    Put(u8, u8),
    Delete(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4, any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
        (0u8..4).prop_map(Op::Delete),
    ]
}

/// A delta per node: a few ops at a priority, tagged with a distinct CID.
fn deltas_strategy() -> impl Strategy<Value = Vec<(Delta, Cid)>> {
    prop::collection::vec((prop::collection::vec(op_strategy(), 1..4), 1u64..5), 1..8).prop_map(
        |nodes| {
            nodes
                .into_iter()
                .enumerate()
                .map(|(i, (ops, priority))| {
                    let mut delta = Delta::new();
                    for op in ops {
                        match op {
                            Op::Put(k, v) => {
                                delta.add(format!("/k{}", k), vec![v]);
                            }
                            Op::Delete(k) => {
                                delta.remove(format!("/k{}", k));
                            }
                        }
                    }
                    delta.priority = priority;
                    (delta, Hasher::hash(&(i as u64).to_le_bytes()))
                })
                .collect()
        },
    )
}

fn materialize<'a>(deltas: impl IntoIterator<Item = &'a (Delta, Cid)>) -> Vec<(Key, Vec<u8>)> {
    let ds = Arc::new(MemoryDatastore::new());
    let set = CrdtSet::new(ds.clone(), &Key::new("/s"));
    for (delta, cid) in deltas {
        let mut batch = Batch::new();
        set.apply(&mut batch, delta, cid).unwrap();
        ds.commit(batch).unwrap();
    }
    set.elements(&Key::root()).unwrap()
}

proptest! {
    #[test]
    fn merge_is_order_independent(deltas in deltas_strategy(), seed in any::<u64>()) {
        let forward = materialize(&deltas);
        let backward = materialize(deltas.iter().rev());

        let mut shuffled = deltas.clone();
        let len = shuffled.len();
        for i in 0..len {
            let j = ((seed.rotate_left(i as u32) as usize) ^ i) % len;
            shuffled.swap(i, j);
        }
        let shuffled_state = materialize(&shuffled);

        prop_assert_eq!(&forward, &backward);
        prop_assert_eq!(&forward, &shuffled_state);
    }

    #[test]
    fn merge_is_idempotent(deltas in deltas_strategy()) {
        let once = materialize(&deltas);
        let twice = materialize(deltas.iter().chain(deltas.iter()));
        prop_assert_eq!(once, twice);
    }
}

#[test]
fn test_equal_priority_delete_wins() {
    let mut put = Delta::new();
    put.add("/a", b"1".to_vec());
    put.priority = 5;
    let mut del = Delta::new();
    del.remove("/a");
    del.priority = 5;

    let nodes = [(put, Hasher::hash(b"put")), (del, Hasher::hash(b"del"))];
    assert!(materialize(&nodes).is_empty());
    assert!(materialize(nodes.iter().rev()).is_empty());
}
