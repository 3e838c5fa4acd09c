// src/document.rs
//! The document model: a schemaless, ordered JSON object. Unlike a typical
//! MongoDB clone there is no hardcoded `_id`/`_rev` field name — the
//! collection's [`crate::schema::Schema`] says which field(s) are the
//! primary key and which field is the revision, so the same engine serves
//! collections with differently-named key fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A document is an ordered mapping from string keys to JSON values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Document(pub serde_json::Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Document(serde_json::Map::new())
    }

    pub fn from_value(value: Value) -> crate::error::Result<Self> {
        match value {
            Value::Object(map) => Ok(Document(map)),
            other => Err(crate::error::Error::validation(format!(
                "document must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Field lookup with dot-notation support ("address.city", "items.0.name").
    pub fn get(&self, field: &str) -> Option<&Value> {
        if field.is_empty() {
            return None;
        }
        if !field.contains('.') {
            return self.0.get(field);
        }
        let mut parts = field.split('.');
        let mut value = self.0.get(parts.next().unwrap())?;
        for part in parts {
            value = match value {
                Value::Object(map) => map.get(part)?,
                Value::Array(arr) => arr.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(value)
    }

    /// Top-level field set, overwriting any previous value.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// Set a field, creating intermediate objects along a dotted path.
    pub fn set_nested(&mut self, field: &str, value: Value) {
        if !field.contains('.') {
            self.0.insert(field.to_string(), value);
            return;
        }
        let parts: Vec<&str> = field.split('.').collect();
        let first = parts[0];
        if !self.0.contains_key(first) {
            self.0
                .insert(first.to_string(), Self::create_nested(&parts[1..], value));
            return;
        }
        let root = self.0.get_mut(first).unwrap();
        Self::set_at_path(root, &parts[1..], value);
    }

    fn create_nested(parts: &[&str], value: Value) -> Value {
        if parts.is_empty() {
            return value;
        }
        let mut obj = serde_json::Map::new();
        obj.insert(parts[0].to_string(), Self::create_nested(&parts[1..], value));
        Value::Object(obj)
    }

    fn set_at_path(current: &mut Value, parts: &[&str], value: Value) {
        if parts.is_empty() {
            return;
        }
        if parts.len() == 1 {
            match current {
                Value::Object(map) => {
                    map.insert(parts[0].to_string(), value);
                }
                Value::Array(arr) => {
                    if let Ok(i) = parts[0].parse::<usize>() {
                        if i < arr.len() {
                            arr[i] = value;
                        }
                    }
                }
                _ => {
                    let mut obj = serde_json::Map::new();
                    obj.insert(parts[0].to_string(), value);
                    *current = Value::Object(obj);
                }
            }
            return;
        }
        match current {
            Value::Object(map) => {
                if !map.contains_key(parts[0]) {
                    map.insert(
                        parts[0].to_string(),
                        Self::create_nested(&parts[1..], value),
                    );
                } else {
                    Self::set_at_path(map.get_mut(parts[0]).unwrap(), &parts[1..], value);
                }
            }
            Value::Array(arr) => {
                if let Ok(i) = parts[0].parse::<usize>() {
                    if i < arr.len() {
                        Self::set_at_path(&mut arr[i], &parts[1..], value);
                    }
                }
            }
            _ => *current = Self::create_nested(parts, value),
        }
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Shallow merge: top-level keys in `patch` overwrite this document's.
    pub fn merge_shallow(&mut self, patch: &serde_json::Map<String, Value>) {
        for (k, v) in patch {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Recursive merge: nested objects are merged key-by-key instead of replaced.
    pub fn merge_deep(&mut self, patch: &serde_json::Map<String, Value>) {
        Self::merge_deep_into(&mut self.0, patch);
    }

    fn merge_deep_into(
        target: &mut serde_json::Map<String, Value>,
        patch: &serde_json::Map<String, Value>,
    ) {
        for (k, v) in patch {
            match (target.get_mut(k), v) {
                (Some(Value::Object(existing)), Value::Object(incoming)) => {
                    Self::merge_deep_into(existing, incoming);
                }
                _ => {
                    target.insert(k.clone(), v.clone());
                }
            }
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Object(doc.0)
    }
}

/// Canonically encode a primary-key tuple. A single-field key keeps its
/// natural scalar representation (so `"doc1"` round-trips as the literal
/// string `doc1`); a composite key is the canonical JSON array encoding of
/// the ordered field values, per spec §3/§9.
pub fn encode_id(values: &[Value]) -> String {
    if values.len() == 1 {
        match &values[0] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    } else {
        Value::Array(values.to_vec()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        Document::from_value(v).unwrap()
    }

    #[test]
    fn get_set_top_level() {
        let mut d = Document::new();
        d.set("name", json!("Alice"));
        assert_eq!(d.get("name"), Some(&json!("Alice")));
    }

    #[test]
    fn get_nested_dot_path() {
        let d = doc(json!({"address": {"city": "Budapest", "zip": 1111}}));
        assert_eq!(d.get("address.city"), Some(&json!("Budapest")));
        assert_eq!(d.get("address.zip"), Some(&json!(1111)));
        assert_eq!(d.get("address.missing"), None);
    }

    #[test]
    fn set_nested_creates_path() {
        let mut d = Document::new();
        d.set_nested("address.city", json!("NYC"));
        assert_eq!(d.get("address.city"), Some(&json!("NYC")));
    }

    #[test]
    fn set_nested_overwrites_existing() {
        let mut d = doc(json!({"address": {"city": "NYC", "zip": 1}}));
        d.set_nested("address.city", json!("LA"));
        assert_eq!(d.get("address.city"), Some(&json!("LA")));
        assert_eq!(d.get("address.zip"), Some(&json!(1)));
    }

    #[test]
    fn merge_shallow_replaces_nested_wholesale() {
        let mut d = doc(json!({"a": {"x": 1, "y": 2}}));
        let patch = json!({"a": {"x": 9}});
        d.merge_shallow(patch.as_object().unwrap());
        assert_eq!(d.get("a"), Some(&json!({"x": 9})));
    }

    #[test]
    fn merge_deep_merges_nested_objects() {
        let mut d = doc(json!({"a": {"x": 1, "y": 2}}));
        let patch = json!({"a": {"x": 9}});
        d.merge_deep(patch.as_object().unwrap());
        assert_eq!(d.get("a"), Some(&json!({"x": 9, "y": 2})));
    }

    #[test]
    fn encode_id_single_string() {
        assert_eq!(encode_id(&[json!("doc1")]), "doc1");
    }

    #[test]
    fn encode_id_single_number() {
        assert_eq!(encode_id(&[json!(42)]), "42");
    }

    #[test]
    fn encode_id_composite() {
        assert_eq!(encode_id(&[json!("us"), json!("ny")]), r#"["us","ny"]"#);
    }
}
