use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use video_encoding_evaluator::store::{Record, RecordId, Store, StoreError};

fn named(name: &str) -> Record {
    Record {
        name: name.to_owned(),
        ..Record::default()
    }
}

#[test]
fn concurrent_inserts_get_distinct_ids() {
    let store = Arc::new(Store::new());

    let handles: Vec<_> = (0..16)
        .map(|thread| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                (0..50)
                    .map(|index| store.insert(named(&format!("{thread}-{index}"))))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let ids: Vec<RecordId> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();

    let unique: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 800);
    assert_eq!(unique.len(), 800);
    assert_eq!(store.ids().len(), 800);
}

#[test]
fn concurrent_updates_leave_one_attempted_value() {
    let store = Store::new();
    let id = store.insert(named("initial"));
    let attempted: Vec<String> = (0..32).map(|index| format!("writer-{index}")).collect();

    std::thread::scope(|scope| {
        for name in &attempted {
            let store = &store;
            scope.spawn(move || {
                for _ in 0..20 {
                    store.update(id, named(name)).unwrap();
                    assert!(store.exists(id));
                    store.get(id).unwrap();
                }
            });
        }
    });

    let last = store.get(id).unwrap();
    assert!(attempted.contains(&last.name));
}

#[test]
fn reads_and_deletes_interleave_safely() {
    let store = Store::new();
    let ids: Vec<_> = (0..100).map(|index| store.insert(named(&index.to_string()))).collect();

    std::thread::scope(|scope| {
        let store = &store;

        scope.spawn(move || {
            for id in ids.iter().step_by(2) {
                store.delete(*id).unwrap();
            }
        });

        scope.spawn(move || {
            for _ in 0..100 {
                for id in store.ids() {
                    match store.get(id) {
                        Ok(_) | Err(StoreError::NotFound(_)) => {}
                    }
                }
            }
        });
    });

    assert_eq!(store.len(), 50);
}

#[derive(Clone, Debug)]
enum Operation {
    Insert,
    Delete(usize),
}

fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        2 => Just(Operation::Insert),
        1 => any::<usize>().prop_map(Operation::Delete),
    ]
}

proptest! {
    #[test]
    fn ids_track_inserts_minus_deletes(operations in proptest::collection::vec(operation(), 0..200)) {
        let store = Store::new();
        let mut issued: Vec<RecordId> = Vec::new();
        let mut live: HashSet<RecordId> = HashSet::new();
        let mut deletes = 0;

        for operation in operations {
            match operation {
                Operation::Insert => {
                    let id = store.insert(Record::default());
                    prop_assert!(!issued.contains(&id));
                    issued.push(id);
                    live.insert(id);
                }
                Operation::Delete(index) if !issued.is_empty() => {
                    let id = issued[index % issued.len()];
                    let deleted = store.delete(id).is_ok();
                    prop_assert_eq!(deleted, live.remove(&id));
                    if deleted {
                        deletes += 1;
                    }
                }
                Operation::Delete(_) => {}
            }
        }

        let ids: HashSet<_> = store.ids().into_iter().collect();
        prop_assert_eq!(ids.len(), issued.len() - deletes);
        prop_assert_eq!(ids, live);
    }
}
