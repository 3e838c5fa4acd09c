// src/revision.rs
//! Revision engine (spec §4.1): generates and validates monotonic revision
//! tags derived from a write counter plus a content hash.
//!
//! Encoding: `"<counter>-<16 lowercase hex chars>"`. The counter is how many
//! times this id has been written (1 for the first write); the hash covers
//! the canonical JSON encoding of the document's fields, using `ahash`
//! (already part of the dependency stack) rather than a cryptographic hash
//! since revisions are a conflict-detection primitive, not a security
//! mechanism. This is an implementer's choice (spec leaves the exact
//! encoding open) but satisfies the contract: non-empty on fresh documents,
//! distinct between any two successive writes, deterministic for replay.

use ahash::AHasher;
use serde_json::Value;
use std::hash::Hasher;

/// Parsed form of a revision tag, exposed for callers that want the counter
/// (e.g. to detect "has this ever been written").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionParts {
    pub counter: u64,
    pub hash: u64,
}

pub fn parse(rev: &str) -> Option<RevisionParts> {
    let (counter_str, hash_str) = rev.split_once('-')?;
    let counter = counter_str.parse().ok()?;
    let hash = u64::from_str_radix(hash_str, 16).ok()?;
    Some(RevisionParts { counter, hash })
}

fn content_hash(doc: &Value) -> u64 {
    let canonical = canonicalize(doc);
    let mut hasher = AHasher::default();
    hasher.write(canonical.as_bytes());
    hasher.finish()
}

/// A stable string encoding of a JSON value with object keys sorted, so
/// that field insertion order never perturbs the hash.
fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = String::from("{");
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).unwrap());
                out.push(':');
                out.push_str(&canonicalize(&map[*k]));
            }
            out.push('}');
            out
        }
        Value::Array(items) => {
            let mut out = String::from("[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&canonicalize(item));
            }
            out.push(']');
            out
        }
        other => other.to_string(),
    }
}

/// Revision for a document being written for the first time.
pub fn initial(doc: &Value) -> String {
    format!("1-{:016x}", content_hash(doc))
}

/// Revision for a document following a write to a document previously at
/// `prev_rev`. Always differs from `prev_rev`: either the counter advances
/// or (extremely rarely) the hash collides but the counter still moved.
pub fn next(prev_rev: &str, doc: &Value) -> String {
    let counter = parse(prev_rev).map(|p| p.counter).unwrap_or(0) + 1;
    format!("{counter}-{:016x}", content_hash(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initial_revision_is_non_empty() {
        let r = initial(&json!({"name": "Test"}));
        assert!(!r.is_empty());
        assert!(r.starts_with("1-"));
    }

    #[test]
    fn successive_writes_yield_distinct_revisions() {
        let r1 = initial(&json!({"name": "A"}));
        let r2 = next(&r1, &json!({"name": "B"}));
        assert_ne!(r1, r2);
    }

    #[test]
    fn counter_advances_even_for_identical_content() {
        let r1 = initial(&json!({"name": "A"}));
        let r2 = next(&r1, &json!({"name": "A"}));
        assert_ne!(r1, r2);
        assert_eq!(parse(&r2).unwrap().counter, 2);
    }

    #[test]
    fn deterministic_for_replay() {
        let doc = json!({"name": "Test", "age": 30});
        assert_eq!(initial(&doc), initial(&doc));
    }

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(initial(&a), initial(&b));
    }
}
