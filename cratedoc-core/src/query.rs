// src/query.rs
//! Query engine: selector matching (delegated to
//! [`operators::matches_filter`]), sort-field comparison, and skip/limit
//! pagination. Index-routed execution lives in [`crate::collection`], which
//! owns the [`crate::index::IndexManager`] and decides whether a selector's
//! equality prefix can be serviced by a bucket lookup before falling back to
//! a full collection scan.

pub mod operators;

use crate::change_bus::{ChangeEvent, Subscription};
use crate::collection::Collection;
use crate::document::Document;
use crate::error::Result;
use crate::value_utils::compare_values_with_none;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

pub use operators::matches_filter;

/// One key in a multi-field sort, applied in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub descending: bool,
}

impl SortField {
    pub fn asc(field: impl Into<String>) -> Self {
        SortField {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        SortField {
            field: field.into(),
            descending: true,
        }
    }
}

/// Shared shape for `Find`'s `sort`/`skip`/`limit` knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindOptions {
    pub sort: Vec<SortField>,
    pub skip: usize,
    pub limit: Option<usize>,
}

/// Stable sort of `(id, document)` pairs by a declared field list. Missing
/// fields sort before present ones (`compare_values_with_none`); documents
/// with incomparable values at a key keep their relative order.
pub fn sort_documents(items: &mut [(String, Document)], sort: &[SortField]) {
    if sort.is_empty() {
        return;
    }
    items.sort_by(|(_, a), (_, b)| {
        for key in sort {
            let ordering = compare_values_with_none(a.get(&key.field), b.get(&key.field));
            let ordering = if key.descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Apply `skip` then `limit` to an already-ordered result set.
pub fn paginate<T>(items: Vec<T>, skip: usize, limit: Option<usize>) -> Vec<T> {
    let skipped = items.into_iter().skip(skip);
    match limit {
        Some(n) => skipped.take(n).collect(),
        None => skipped.collect(),
    }
}

/// A pending `find` call against one collection: a selector plus
/// sort/skip/limit, built up fluently and run on demand. Holds the
/// collection alive via `Arc` rather than borrowing it, so a `Query` can
/// outlive the call that created it.
pub struct Query {
    collection: Arc<Collection>,
    selector: Value,
    options: FindOptions,
}

impl Query {
    pub(crate) fn new(collection: Arc<Collection>, selector: Value) -> Self {
        Query { collection, selector, options: FindOptions::default() }
    }

    pub fn sort(mut self, fields: Vec<SortField>) -> Self {
        self.options.sort = fields;
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.options.skip = n;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.options.limit = Some(n);
        self
    }

    /// Run the query: route the selector through the best available index
    /// (or fall back to a full scan), re-check every candidate against the
    /// full selector (an index only proves its own fields matched), then
    /// sort and paginate.
    pub fn exec(&self) -> Result<Vec<(String, Document)>> {
        let candidates = self.collection.candidates_for(&self.selector)?;
        let mut matching = Vec::with_capacity(candidates.len());
        for (id, doc) in candidates {
            if matches_filter(&doc, &self.selector)? {
                matching.push((id, doc));
            }
        }
        sort_documents(&mut matching, &self.options.sort);
        Ok(paginate(matching, self.options.skip, self.options.limit))
    }

    pub fn one(&self) -> Result<Option<(String, Document)>> {
        Ok(self.exec()?.into_iter().next())
    }

    /// Delete every document currently matching the selector, atomically per
    /// call. Returns the number removed.
    pub fn remove(&self) -> Result<usize> {
        self.collection.query_remove(&self.selector)
    }

    /// Shallow-merge `patch` into every document currently matching the
    /// selector, atomically per call. Returns the number updated.
    pub fn update(&self, patch: serde_json::Map<String, Value>) -> Result<usize> {
        self.collection.query_update(&self.selector, &patch)
    }

    /// A lazy, restartable sequence of result snapshots: the
    /// first call to [`QueryObserver::next`] returns the query's current
    /// result; subsequent calls block until a change event that could
    /// plausibly affect the result arrives (its pre- or post-state matches
    /// the selector), re-execute, and return the new snapshot - unless it is
    /// id-list-identical to the last one emitted, in which case the observer
    /// keeps waiting instead of surfacing a no-op refresh.
    pub fn observe(&self) -> Result<QueryObserver> {
        let subscription = self.collection.changes()?;
        let initial = self.exec()?;
        Ok(QueryObserver {
            query: Query { collection: self.collection.clone(), selector: self.selector.clone(), options: self.options.clone() },
            subscription,
            last_ids: Some(initial.iter().map(|(id, _)| id.clone()).collect()),
            initial: Some(initial),
        })
    }
}

/// Re-executes a [`Query`] each time a plausibly-relevant change event
/// arrives, yielding only snapshots whose id list differs from the last one
/// returned.
pub struct QueryObserver {
    query: Query,
    subscription: Subscription,
    last_ids: Option<Vec<String>>,
    /// The snapshot taken at subscription time; handed out by the first
    /// `next()` call before any event is waited on.
    initial: Option<Vec<(String, Document)>>,
}

impl QueryObserver {
    fn is_relevant(&self, event: &ChangeEvent) -> bool {
        [&event.doc, &event.old].into_iter().flatten().any(|v| {
            Document::from_value(v.clone())
                .map(|d| matches_filter(&d, &self.query.selector).unwrap_or(false))
                .unwrap_or(false)
        })
    }

    /// Block for the next distinct snapshot, or return `None` once the
    /// underlying collection has closed its change bus.
    pub fn next(&mut self) -> Option<Vec<(String, Document)>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            let event = self.subscription.recv()?;
            if !self.is_relevant(&event) {
                continue;
            }
            let snapshot = self.query.exec().ok()?;
            let ids: Vec<String> = snapshot.iter().map(|(id, _)| id.clone()).collect();
            if self.last_ids.as_ref() == Some(&ids) {
                continue;
            }
            self.last_ids = Some(ids);
            return Some(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{Collection, CollectionOptions};
    use crate::kv::{KvStore, MemoryKv};
    use crate::schema::Schema;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_value(v).unwrap()
    }

    fn open() -> Arc<Collection> {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        Collection::open(kv, "people".into(), Schema::new(vec!["_id".into()], "_rev"), CollectionOptions::default()).unwrap()
    }

    #[test]
    fn observe_emits_initial_snapshot_then_distinct_updates() {
        let coll = open();
        coll.insert(json!({"_id": "a", "age": 30})).unwrap();
        let mut observer = coll.find(json!({"age": {"$gte": 18}})).observe().unwrap();

        let initial = observer.next().unwrap();
        assert_eq!(initial.len(), 1);

        coll.insert(json!({"_id": "b", "age": 25})).unwrap();
        let second = observer.next().unwrap();
        assert_eq!(second.len(), 2);

        // An update that leaves the matching id set unchanged must not
        // surface as a new snapshot.
        coll.find(json!({"_id": "a"})).update(serde_json::Map::from_iter([
            ("nickname".to_string(), json!("Al")),
        ])).unwrap();
        coll.insert(json!({"_id": "c", "age": 40})).unwrap();
        let third = observer.next().unwrap();
        assert_eq!(third.len(), 3);
    }

    #[test]
    fn sort_ascending_by_single_field() {
        let mut items = vec![
            ("a".to_string(), doc(json!({"age": 30}))),
            ("b".to_string(), doc(json!({"age": 20}))),
            ("c".to_string(), doc(json!({"age": 25}))),
        ];
        sort_documents(&mut items, &[SortField::asc("age")]);
        let ids: Vec<&str> = items.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn sort_descending_reverses_order() {
        let mut items = vec![
            ("a".to_string(), doc(json!({"age": 30}))),
            ("b".to_string(), doc(json!({"age": 20}))),
        ];
        sort_documents(&mut items, &[SortField::desc("age")]);
        let ids: Vec<&str> = items.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn sort_missing_field_sorts_first() {
        let mut items = vec![
            ("a".to_string(), doc(json!({"age": 30}))),
            ("b".to_string(), doc(json!({}))),
        ];
        sort_documents(&mut items, &[SortField::asc("age")]);
        let ids: Vec<&str> = items.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn multi_key_sort_breaks_ties_with_second_field() {
        let mut items = vec![
            ("a".to_string(), doc(json!({"city": "NYC", "age": 30}))),
            ("b".to_string(), doc(json!({"city": "NYC", "age": 20}))),
            ("c".to_string(), doc(json!({"city": "LA", "age": 25}))),
        ];
        sort_documents(&mut items, &[SortField::asc("city"), SortField::asc("age")]);
        let ids: Vec<&str> = items.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn paginate_applies_skip_then_limit() {
        let items: Vec<i32> = vec![1, 2, 3, 4, 5];
        assert_eq!(paginate(items.clone(), 1, Some(2)), vec![2, 3]);
        assert_eq!(paginate(items, 3, None), vec![4, 5]);
    }
}
