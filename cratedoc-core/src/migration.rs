// src/migration.rs
//! Migration Engine (SPEC_FULL.md §4.7): detects schema drift between a
//! collection's persisted shape and the schema it was just opened with, and
//! brings the stored data in line with it.
//!
//! A "migration" is triggered by a version bump with registered strategies,
//! but also by any shape change at an unchanged version (indexes,
//! `encryptedFields`, or `revField` edited in place) and by a version
//! *drop*, which runs no data strategies but still rebuilds every index
//! against the now-current schema. [`Collection`](crate::collection::Collection)
//! drives this; this module is pure data-in, data-out so it stays testable
//! without a live collection.

use crate::document::Document;
use crate::error::Result;
use crate::kv::KvStore;
use serde_json::{json, Value};
use std::sync::Arc;

/// One version's data transform: `version` is the schema version a document
/// lands on *after* `apply` runs. Versions with no registered strategy are
/// tolerated - their documents simply pass through unchanged, per spec §4.7.
#[derive(Clone)]
pub struct MigrationStrategy {
    pub version: u64,
    pub apply: Arc<dyn Fn(&Document) -> Result<Document> + Send + Sync>,
}

impl std::fmt::Debug for MigrationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStrategy").field("version", &self.version).finish()
    }
}

pub struct MigrationEngine;

impl MigrationEngine {
    /// Strategies applicable when moving from `stored` to `requested`, in
    /// ascending version order. Empty whenever `requested <= stored` - a
    /// version rollback never replays data strategies, only a downstream
    /// index rebuild.
    pub fn steps_for(stored: u64, requested: u64, strategies: &[MigrationStrategy]) -> Vec<&MigrationStrategy> {
        if requested <= stored {
            return Vec::new();
        }
        let mut applicable: Vec<&MigrationStrategy> =
            strategies.iter().filter(|s| s.version > stored && s.version <= requested).collect();
        applicable.sort_by_key(|s| s.version);
        applicable
    }

    /// Apply every applicable strategy to every document in `bucket`, in
    /// ascending version order, entirely in memory. Nothing is written here:
    /// a failing strategy aborts via `?` before any document is returned, so
    /// the caller never sees a partial result to stage.
    pub fn run(
        kv: &dyn KvStore,
        bucket: &str,
        old_rev_field: &str,
        new_rev_field: &str,
        strategies: &[MigrationStrategy],
        stored_version: u64,
        requested_version: u64,
    ) -> Result<Vec<(String, Document)>> {
        let steps = Self::steps_for(stored_version, requested_version, strategies);

        let mut rewritten = Vec::new();
        kv.iterate(bucket, &mut |k, v| {
            let id = String::from_utf8_lossy(k).to_string();
            let value: Value = serde_json::from_slice(v)?;
            let mut doc = Document::from_value(value)?;
            let original = doc.clone();

            for step in &steps {
                doc = (step.apply)(&doc)?;
            }

            if old_rev_field != new_rev_field {
                if let Some(old_rev) = doc.remove(old_rev_field) {
                    doc.set(new_rev_field.to_string(), old_rev);
                }
            }

            if doc != original {
                let prev_rev = doc.get(new_rev_field).and_then(Value::as_str).unwrap_or("").to_string();
                let new_rev = crate::revision::next(&prev_rev, &doc.as_value());
                doc.set(new_rev_field.to_string(), json!(new_rev));
            }

            rewritten.push((id, doc));
            Ok(())
        })?;

        Ok(rewritten)
    }
}
