//! Property-based tests for the quantified invariants spec §8 calls out
//! that aren't naturally expressed as a single literal scenario: ordering
//! preservation for change subscribers (#4), migration idempotence (#6),
//! and concurrent `AtomicUpdate` convergence (#8).

use cratedoc_core::collection::{Collection, CollectionOptions};
use cratedoc_core::kv::{KvStore, MemoryKv};
use cratedoc_core::schema::Schema;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::thread;

fn open(schema: Schema) -> Arc<Collection> {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    Collection::open(kv, "items".into(), schema, CollectionOptions::default()).unwrap()
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u8),
    Upsert(u8),
    Remove(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(Op::Insert),
        (0u8..4).prop_map(Op::Upsert),
        (0u8..4).prop_map(Op::Remove),
    ]
}

proptest! {
    /// #4: a live subscriber's event sequence is a prefix-preserving
    /// subsequence of the mutations actually committed - every event it
    /// sees corresponds to a real mutation, in the order those mutations
    /// committed, with none dropped.
    #[test]
    fn subscriber_never_reorders_or_drops_committed_mutations(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let coll = open(Schema::new(vec!["id".into()], "_rev"));
        let sub = coll.changes().unwrap();

        let mut committed = Vec::new();
        for op in &ops {
            let id = match op {
                Op::Insert(n) | Op::Upsert(n) | Op::Remove(n) => n.to_string(),
            };
            match op {
                Op::Insert(_) => {
                    if coll.insert(json!({"id": id, "v": 1})).is_ok() {
                        committed.push(id.clone());
                    }
                }
                Op::Upsert(_) => {
                    coll.upsert(json!({"id": id, "v": 1})).unwrap();
                    committed.push(id.clone());
                }
                Op::Remove(_) => {
                    if coll.remove(&id).is_ok() {
                        committed.push(id.clone());
                    }
                }
            }
        }

        let mut received = Vec::new();
        while let Some(event) = sub.try_recv() {
            received.push(event.id);
        }

        prop_assert_eq!(received, committed);
    }
}

proptest! {
    /// #6: migrating to version N twice yields the same stored documents as
    /// migrating once - the second `migrate()` call (now a no-op, since the
    /// stored version already equals the requested one) must not perturb
    /// anything it already brought in line.
    #[test]
    fn migrating_twice_is_the_same_as_migrating_once(values in prop::collection::vec(1u32..100, 1..10)) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let v1 = Schema::new(vec!["id".into()], "_rev").with_version(1);
        let coll = Collection::open(kv.clone(), "items".into(), v1, CollectionOptions::default()).unwrap();
        for (i, v) in values.iter().enumerate() {
            coll.insert(json!({"id": i.to_string(), "data": v})).unwrap();
        }
        drop(coll);

        let strategy = cratedoc_core::migration::MigrationStrategy {
            version: 2,
            apply: Arc::new(|doc| {
                let mut doc = doc.clone();
                let current = doc.get("data").and_then(|v| v.as_u64()).unwrap_or(0);
                doc.set("data", json!(current * 2));
                Ok(doc)
            }),
        };
        let v2 = Schema::new(vec!["id".into()], "_rev").with_version(2).with_migration_strategies(vec![strategy]);
        let coll = Collection::open(kv, "items".into(), v2, CollectionOptions::default()).unwrap();

        let mut after_first: Vec<_> = coll.export_json().unwrap();
        coll.migrate().unwrap();
        let mut after_second: Vec<_> = coll.export_json().unwrap();

        let sort_key = |docs: &mut Vec<serde_json::Value>| {
            docs.sort_by_key(|d| d.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string());
        };
        sort_key(&mut after_first);
        sort_key(&mut after_second);
        prop_assert_eq!(after_first, after_second);
    }
}

proptest! {
    /// #8: M concurrent `AtomicUpdate`-style callers on the same id each
    /// succeed exactly once, with the mutator seeing the most recent state
    /// in every case - so M concurrent "increment by 1" calls leave the
    /// counter at exactly M, and the change bus records M update events.
    #[test]
    fn concurrent_atomic_updates_each_land_exactly_once(callers in 1usize..6) {
        let coll = open(Schema::new(vec!["id".into()], "_rev"));
        coll.insert(json!({"id": "counter", "n": 0})).unwrap();
        let sub = coll.changes().unwrap();

        thread::scope(|scope| {
            for _ in 0..callers {
                let coll = coll.clone();
                scope.spawn(move || {
                    let mut handle = coll.find_by_id("counter").unwrap();
                    handle
                        .atomic_update(|doc| {
                            let n = doc.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
                            doc.set("n", json!(n + 1));
                            Ok(())
                        })
                        .unwrap();
                });
            }
        });

        let handle = coll.find_by_id("counter").unwrap();
        prop_assert_eq!(handle.get_value("n"), Some(&json!(callers as i64)));

        let mut update_events = 0;
        while sub.try_recv().is_some() {
            update_events += 1;
        }
        prop_assert_eq!(update_events, callers);
    }
}
