// src/index.rs
//! Index manager: one KV bucket per index, named
//! `<collection>_idx_<indexName>`. The bucket key is the canonical encoding
//! of the index's field-value tuple; the value is the JSON array of
//! document ids currently bearing that tuple.
//!
//! Because the bucket is keyed by the *whole* tuple rather than a sorted
//! B+Tree supporting range/prefix scans, `select_best` can only route a
//! query through an index when the selector supplies an equality value for
//! every field the index declares - a prefix match shorter than the full
//! index is not servable by a single bucket lookup. See DESIGN.md.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::kv::{BatchOp, KvStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A named composite index: a non-empty ordered list of field paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub fields: Vec<String>,
}

/// Index key - the supported, orderable projection of a JSON value used as
/// an index tuple element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat),
    String(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}
impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    IndexKey::Int(i)
                } else if let Some(f) = n.as_f64() {
                    IndexKey::Float(OrderedFloat(f))
                } else {
                    IndexKey::Null
                }
            }
            Value::String(s) => IndexKey::String(s.clone()),
            // Arrays/objects aren't indexable projections; fold to Null.
            _ => IndexKey::Null,
        }
    }
}

fn encode_key_tuple(tuple: &[IndexKey]) -> Vec<u8> {
    serde_json::to_vec(tuple).expect("IndexKey tuple always serializes")
}

fn decode_id_set(bytes: &[u8]) -> Vec<String> {
    serde_json::from_slice(bytes).unwrap_or_default()
}

fn encode_id_set(ids: &[String]) -> Vec<u8> {
    serde_json::to_vec(ids).expect("string vec always serializes")
}

pub struct IndexManager {
    collection: String,
    indexes: Vec<IndexDef>,
}

impl IndexManager {
    pub fn new(collection: impl Into<String>, indexes: Vec<IndexDef>) -> Self {
        IndexManager {
            collection: collection.into(),
            indexes,
        }
    }

    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    pub fn bucket_name(&self, index_name: &str) -> String {
        format!("{}_idx_{}", self.collection, index_name)
    }

    fn key_tuple(&self, def: &IndexDef, doc: &Document) -> Vec<IndexKey> {
        def.fields
            .iter()
            .map(|f| IndexKey::from(doc.get(f).unwrap_or(&Value::Null)))
            .collect()
    }

    fn read_id_set(&self, kv: &dyn KvStore, bucket: &str, key: &[u8]) -> Result<Vec<String>> {
        Ok(kv.get(bucket, key)?.map(|b| decode_id_set(&b)).unwrap_or_default())
    }

    /// Batch ops maintaining every index for a freshly inserted document.
    /// Caller folds these into the same atomic batch as the document write.
    pub fn on_insert(&self, kv: &dyn KvStore, id: &str, doc: &Document) -> Result<Vec<BatchOp>> {
        let mut ops = Vec::new();
        for def in &self.indexes {
            let bucket = self.bucket_name(&def.name);
            let key = encode_key_tuple(&self.key_tuple(def, doc));
            let mut ids = self.read_id_set(kv, &bucket, &key)?;
            if !ids.iter().any(|x| x == id) {
                ids.push(id.to_string());
            }
            ops.push(BatchOp::Set {
                bucket,
                key,
                value: encode_id_set(&ids),
            });
        }
        Ok(ops)
    }

    /// Batch ops maintaining every index across an update. Unchanged key
    /// tuples are left alone; changed ones move `id` from the old key's set
    /// to the new key's set, deleting the old key if its set empties.
    pub fn on_update(
        &self,
        kv: &dyn KvStore,
        id: &str,
        old: &Document,
        new: &Document,
    ) -> Result<Vec<BatchOp>> {
        let mut ops = Vec::new();
        for def in &self.indexes {
            let old_tuple = self.key_tuple(def, old);
            let new_tuple = self.key_tuple(def, new);
            if old_tuple == new_tuple {
                continue;
            }
            let bucket = self.bucket_name(&def.name);

            let old_key = encode_key_tuple(&old_tuple);
            let mut old_ids = self.read_id_set(kv, &bucket, &old_key)?;
            old_ids.retain(|x| x != id);
            if old_ids.is_empty() {
                ops.push(BatchOp::Delete {
                    bucket: bucket.clone(),
                    key: old_key,
                });
            } else {
                ops.push(BatchOp::Set {
                    bucket: bucket.clone(),
                    key: old_key,
                    value: encode_id_set(&old_ids),
                });
            }

            let new_key = encode_key_tuple(&new_tuple);
            let mut new_ids = self.read_id_set(kv, &bucket, &new_key)?;
            if !new_ids.iter().any(|x| x == id) {
                new_ids.push(id.to_string());
            }
            ops.push(BatchOp::Set {
                bucket,
                key: new_key,
                value: encode_id_set(&new_ids),
            });
        }
        Ok(ops)
    }

    /// Batch ops reversing `on_insert` for a deleted document.
    pub fn on_delete(&self, kv: &dyn KvStore, id: &str, old: &Document) -> Result<Vec<BatchOp>> {
        let mut ops = Vec::new();
        for def in &self.indexes {
            let bucket = self.bucket_name(&def.name);
            let key = encode_key_tuple(&self.key_tuple(def, old));
            let mut ids = self.read_id_set(kv, &bucket, &key)?;
            ids.retain(|x| x != id);
            if ids.is_empty() {
                ops.push(BatchOp::Delete { bucket, key });
            } else {
                ops.push(BatchOp::Set {
                    bucket,
                    key,
                    value: encode_id_set(&ids),
                });
            }
        }
        Ok(ops)
    }

    /// Wipe and reapply every index bucket from a full document scan.
    pub fn rebuild<'a>(
        &self,
        kv: &dyn KvStore,
        docs: impl Iterator<Item = (&'a str, &'a Document)>,
    ) -> Result<()> {
        for def in &self.indexes {
            kv.clear_bucket(&self.bucket_name(&def.name))?;
        }
        for (id, doc) in docs {
            let ops = self.on_insert(kv, id, doc)?;
            kv.batch(ops)?;
        }
        Ok(())
    }

    /// Look up the id-set stored for one index's fully-constrained key tuple.
    pub fn lookup(&self, kv: &dyn KvStore, def: &IndexDef, values: &[Value]) -> Result<Vec<String>> {
        if values.len() != def.fields.len() {
            return Err(Error::index(format!(
                "index '{}' expects {} key values, got {}",
                def.name,
                def.fields.len(),
                values.len()
            )));
        }
        let tuple: Vec<IndexKey> = values.iter().map(IndexKey::from).collect();
        let key = encode_key_tuple(&tuple);
        self.read_id_set(kv, &self.bucket_name(&def.name), &key)
    }

    /// Pick the best index for a selector's top-level equality constraints.
    /// Only an index whose *entire* field list is equality-constrained can
    /// be serviced by a single bucket lookup; among those, the index with
    /// the most fields wins (most selective full match).
    pub fn select_best(&self, selector: &Value) -> Option<(&IndexDef, Vec<Value>)> {
        let eq_fields = extract_equality_fields(selector);
        if eq_fields.is_empty() {
            return None;
        }
        let best = self
            .indexes
            .iter()
            .filter(|def| !def.fields.is_empty() && def.fields.iter().all(|f| eq_fields.contains_key(f)))
            .max_by_key(|def| def.fields.len())?;
        let values = best.fields.iter().map(|f| eq_fields[f].clone()).collect();
        Some((best, values))
    }
}

/// Extract the selector's top-level fields that are constrained by literal
/// equality or an explicit `$eq`. Logical operators (`$and`/`$or`/...) and
/// any other operator form are ignored for index-selection purposes.
fn extract_equality_fields(selector: &Value) -> HashMap<String, Value> {
    let mut out = HashMap::new();
    let Some(obj) = selector.as_object() else {
        return out;
    };
    for (key, value) in obj {
        if key.starts_with('$') {
            continue;
        }
        match value {
            Value::Object(ops) => {
                if let Some(eq) = ops.get("$eq") {
                    out.insert(key.clone(), eq.clone());
                }
            }
            literal => {
                out.insert(key.clone(), literal.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        Document::from_value(v).unwrap()
    }

    fn mgr() -> IndexManager {
        IndexManager::new(
            "people",
            vec![IndexDef {
                name: "by_age".into(),
                fields: vec!["age".into()],
            }],
        )
    }

    #[test]
    fn insert_then_lookup_finds_id() {
        let kv = MemoryKv::new();
        let m = mgr();
        let ops = m.on_insert(&kv, "doc1", &doc(json!({"age": 30}))).unwrap();
        kv.batch(ops).unwrap();
        let ids = m.lookup(&kv, &m.indexes()[0], &[json!(30)]).unwrap();
        assert_eq!(ids, vec!["doc1".to_string()]);
    }

    #[test]
    fn update_moves_id_between_keys() {
        let kv = MemoryKv::new();
        let m = mgr();
        let ops = m.on_insert(&kv, "doc1", &doc(json!({"age": 30}))).unwrap();
        kv.batch(ops).unwrap();
        let ops = m
            .on_update(&kv, "doc1", &doc(json!({"age": 30})), &doc(json!({"age": 31})))
            .unwrap();
        kv.batch(ops).unwrap();
        assert!(m.lookup(&kv, &m.indexes()[0], &[json!(30)]).unwrap().is_empty());
        assert_eq!(
            m.lookup(&kv, &m.indexes()[0], &[json!(31)]).unwrap(),
            vec!["doc1".to_string()]
        );
    }

    #[test]
    fn delete_removes_id_and_empties_key() {
        let kv = MemoryKv::new();
        let m = mgr();
        let ops = m.on_insert(&kv, "doc1", &doc(json!({"age": 30}))).unwrap();
        kv.batch(ops).unwrap();
        let ops = m.on_delete(&kv, "doc1", &doc(json!({"age": 30}))).unwrap();
        kv.batch(ops).unwrap();
        assert!(m.lookup(&kv, &m.indexes()[0], &[json!(30)]).unwrap().is_empty());
    }

    #[test]
    fn select_best_requires_full_field_match() {
        let m = IndexManager::new(
            "people",
            vec![
                IndexDef {
                    name: "by_country".into(),
                    fields: vec!["country".into()],
                },
                IndexDef {
                    name: "by_country_city".into(),
                    fields: vec!["country".into(), "city".into()],
                },
            ],
        );
        // Only "country" constrained: the two-field index isn't fully covered.
        let sel = json!({"country": "hu"});
        let (def, values) = m.select_best(&sel).unwrap();
        assert_eq!(def.name, "by_country");
        assert_eq!(values, vec![json!("hu")]);

        // Both fields constrained: the more selective composite index wins.
        let sel = json!({"country": "hu", "city": "bp"});
        let (def, _) = m.select_best(&sel).unwrap();
        assert_eq!(def.name, "by_country_city");
    }

    #[test]
    fn select_best_none_when_no_index_fully_covered() {
        let m = mgr();
        let sel = json!({"name": "Alice"});
        assert!(m.select_best(&sel).is_none());
    }

    #[test]
    fn rebuild_repopulates_from_scratch() {
        let kv = MemoryKv::new();
        let m = mgr();
        let docs = vec![
            ("a".to_string(), doc(json!({"age": 25}))),
            ("b".to_string(), doc(json!({"age": 25}))),
        ];
        let borrowed: Vec<(&str, &Document)> = docs.iter().map(|(i, d)| (i.as_str(), d)).collect();
        m.rebuild(&kv, borrowed.into_iter()).unwrap();
        let mut ids = m.lookup(&kv, &m.indexes()[0], &[json!(25)]).unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
