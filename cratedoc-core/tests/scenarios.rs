//! The literal end-to-end scenarios (spec §8, S1-S7): one test per
//! scenario, against in-memory fixtures. Named after the behavior under
//! test rather than the scenario label, since the label means nothing to a
//! reader outside this exercise.

use cratedoc_core::collection::{Collection, CollectionOptions};
use cratedoc_core::error::ErrorKind;
use cratedoc_core::index::IndexDef;
use cratedoc_core::kv::{KvStore, MemoryKv};
use cratedoc_core::schema::Schema;
use cratedoc_core::{ChangeKind, Document};
use serde_json::{json, Value};
use std::sync::Arc;

fn open(schema: Schema) -> Arc<Collection> {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    Collection::open(kv, "people".into(), schema, CollectionOptions::default()).unwrap()
}

#[test]
fn insert_then_find_by_id_returns_the_stored_document() {
    let coll = open(Schema::new(vec!["id".into()], "_rev"));
    let inserted = coll.insert(json!({"id": "doc1", "name": "Test"})).unwrap();
    assert!(inserted.get("_rev").and_then(Value::as_str).unwrap_or_default().len() > 0);

    let handle = coll.find_by_id("doc1").unwrap();
    assert_eq!(handle.get_value("name"), Some(&json!("Test")));
}

#[test]
fn successive_upserts_advance_the_revision_and_keep_the_latest_value() {
    let coll = open(Schema::new(vec!["id".into()], "_rev"));
    let first = coll.upsert(json!({"id": "d", "name": "A"})).unwrap();
    let second = coll.upsert(json!({"id": "d", "name": "B"})).unwrap();

    let r1 = first.get("_rev").and_then(Value::as_str).unwrap();
    let r2 = second.get("_rev").and_then(Value::as_str).unwrap();
    assert_ne!(r1, r2);

    let handle = coll.find_by_id("d").unwrap();
    assert_eq!(handle.get_value("name"), Some(&json!("B")));
}

#[test]
fn inserting_an_existing_id_fails_and_leaves_the_original_untouched() {
    let coll = open(Schema::new(vec!["id".into()], "_rev"));
    coll.insert(json!({"id": "doc1", "name": "Test"})).unwrap();

    let err = coll.insert(json!({"id": "doc1", "name": "Other"})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let handle = coll.find_by_id("doc1").unwrap();
    assert_eq!(handle.get_value("name"), Some(&json!("Test")));
}

#[test]
fn an_index_on_age_routes_the_query_to_exactly_the_matching_documents() {
    let schema = Schema::new(vec!["id".into()], "_rev")
        .with_indexes(vec![IndexDef { name: "by_age".into(), fields: vec!["age".into()] }]);
    let coll = open(schema);

    for (id, age) in [("a", 25), ("b", 25), ("c", 30), ("d", 35), ("e", 30)] {
        coll.insert(json!({"id": id, "age": age})).unwrap();
    }

    let found = coll.find(json!({"age": 30})).exec().unwrap();
    assert_eq!(found.len(), 2);
    let mut ids: Vec<&str> = found.iter().map(|(id, _)| id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["c", "e"]);
    assert_eq!(coll.find(json!({"age": 30})).exec().unwrap().len(), 2);
}

#[test]
fn a_subscriber_sees_insert_update_delete_in_commit_order() {
    let coll = open(Schema::new(vec!["id".into()], "_rev"));
    let sub = coll.changes().unwrap();

    coll.insert(json!({"id": "a", "name": "first"})).unwrap();
    coll.upsert(json!({"id": "a", "name": "second"})).unwrap();
    coll.remove("a").unwrap();

    let insert = sub.recv().unwrap();
    assert_eq!(insert.kind, ChangeKind::Insert);
    assert!(insert.old.is_none());
    assert!(insert.doc.is_some());

    let update = sub.recv().unwrap();
    assert_eq!(update.kind, ChangeKind::Update);
    assert!(update.old.is_some());
    assert!(update.doc.is_some());

    let delete = sub.recv().unwrap();
    assert_eq!(delete.kind, ChangeKind::Delete);
    assert!(delete.doc.is_none());
    assert!(delete.old.is_some());
}

#[test]
fn migrating_across_two_versions_applies_both_strategies_in_order() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let v1 = Schema::new(vec!["id".into()], "_rev").with_version(1);
    let coll = Collection::open(kv.clone(), "docs".into(), v1, CollectionOptions::default()).unwrap();
    coll.insert(json!({"id": "d", "data": "v1"})).unwrap();
    drop(coll);

    let strategies = vec![
        cratedoc_core::migration::MigrationStrategy {
            version: 2,
            apply: Arc::new(|doc: &Document| {
                let mut doc = doc.clone();
                doc.set("data", json!("v2"));
                doc.set("step", json!(2));
                Ok(doc)
            }),
        },
        cratedoc_core::migration::MigrationStrategy {
            version: 3,
            apply: Arc::new(|doc: &Document| {
                let mut doc = doc.clone();
                doc.set("data", json!("v3"));
                doc.set("step", json!(3));
                Ok(doc)
            }),
        },
    ];
    let v3 = Schema::new(vec!["id".into()], "_rev").with_version(3).with_migration_strategies(strategies);
    let coll = Collection::open(kv, "docs".into(), v3, CollectionOptions::default()).unwrap();

    let handle = coll.find_by_id("d").unwrap();
    assert_eq!(handle.get_value("data"), Some(&json!("v3")));
    assert_eq!(handle.get_value("step"), Some(&json!(3)));
    assert!(!handle.rev().is_empty());
}

#[test]
fn a_bulk_insert_with_one_duplicate_id_commits_nothing() {
    let coll = open(Schema::new(vec!["id".into()], "_rev"));
    coll.insert(json!({"id": "A"})).unwrap();

    let err = coll.bulk_insert(vec![json!({"id": "B"}), json!({"id": "A"}), json!({"id": "C"})]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    assert_eq!(coll.count().unwrap(), 1);
    assert!(coll.find_by_id("B").is_err());
    assert!(coll.find_by_id("C").is_err());
}
