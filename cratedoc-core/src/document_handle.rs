// src/document_handle.rs
//! Document Handle (spec §4.4): a client-held reference to one document's
//! last-read state plus its revision, used for optimistic-concurrency reads
//! and writes without re-fetching on every access.
//!
//! The handle keeps only a `Weak` reference back to its collection - it
//! observes, it never keeps the collection alive on its own (spec §4.4's
//! "back-reference: used only for lookup, never owning").

use crate::change_bus::FilteredSubscription;
use crate::collection::Collection;
use crate::document::Document;
use crate::error::{Error, ErrorKind, Result};
use serde_json::Value;
use std::sync::Weak;

const MAX_ATOMIC_RETRIES: u32 = 5;

/// Converts an optional JSON value into a concrete type, falling back to a
/// type's natural zero value on absence or mismatch - spec §4.4's
/// `Get<T>(field)` contract.
pub trait ZeroValue: Sized {
    fn from_json(value: Option<&Value>) -> Self;
}

impl ZeroValue for String {
    fn from_json(value: Option<&Value>) -> Self {
        value.and_then(Value::as_str).map(str::to_string).unwrap_or_default()
    }
}

impl ZeroValue for i64 {
    fn from_json(value: Option<&Value>) -> Self {
        value.and_then(Value::as_i64).unwrap_or(0)
    }
}

impl ZeroValue for f64 {
    fn from_json(value: Option<&Value>) -> Self {
        value.and_then(Value::as_f64).unwrap_or(0.0)
    }
}

impl ZeroValue for bool {
    fn from_json(value: Option<&Value>) -> Self {
        value.and_then(Value::as_bool).unwrap_or(false)
    }
}

impl ZeroValue for Vec<Value> {
    fn from_json(value: Option<&Value>) -> Self {
        value.and_then(Value::as_array).cloned().unwrap_or_default()
    }
}

impl ZeroValue for serde_json::Map<String, Value> {
    fn from_json(value: Option<&Value>) -> Self {
        value.and_then(Value::as_object).cloned().unwrap_or_default()
    }
}

pub struct DocumentHandle {
    collection: Weak<Collection>,
    id: String,
    data: Document,
    rev: String,
}

impl DocumentHandle {
    pub(crate) fn new(collection: Weak<Collection>, id: String, data: Document, rev: String) -> Self {
        DocumentHandle { collection, id, data, rev }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rev(&self) -> &str {
        &self.rev
    }

    /// Read a field from the in-memory snapshot (not a fresh store read).
    /// Absence or a type mismatch both resolve to `T`'s zero value, never a
    /// panic or an error - this is a convenience accessor, not validation.
    pub fn get<T: ZeroValue>(&self, field: &str) -> T {
        T::from_json(self.data.get(field))
    }

    pub fn get_value(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Mutate the in-memory snapshot without touching the store. Call
    /// [`Self::save`] to persist.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.data.set(field.into(), value);
    }

    pub fn data(&self) -> &Document {
        &self.data
    }

    fn upgrade(&self) -> Result<std::sync::Arc<Collection>> {
        self.collection.upgrade().ok_or_else(|| Error::closed("collection has been closed or dropped"))
    }

    /// Persist the in-memory snapshot, failing with `Conflict` if the store's
    /// current revision for this id no longer matches what this handle last
    /// observed. On success the handle's `data`/`rev` are updated to the
    /// freshly committed state (including the new revision).
    pub fn save(&mut self) -> Result<()> {
        let collection = self.upgrade()?;
        let persisted = collection.save_with_check(&self.id, self.data.clone(), &self.rev)?;
        self.rev = collection.rev_of(&persisted);
        self.data = persisted;
        Ok(())
    }

    /// Shallow-merge `patch` into the in-memory snapshot, then [`Self::save`].
    pub fn update(&mut self, patch: &serde_json::Map<String, Value>) -> Result<()> {
        self.data.merge_shallow(patch);
        self.save()
    }

    /// Re-read the latest stored state, apply `mutator`, and attempt to save
    /// against *that* revision - retrying on `Conflict` up to a bounded
    /// number of times. Unlike [`Self::save`] (which commits against a
    /// revision captured possibly long ago), this always mutates the
    /// freshest state, so it's the right tool for "increment a counter" style
    /// updates under contention.
    pub fn atomic_update(&mut self, mut mutator: impl FnMut(&mut Document) -> Result<()>) -> Result<()> {
        let collection = self.upgrade()?;
        for _ in 0..=MAX_ATOMIC_RETRIES {
            let (mut working, current_rev) = collection.read_current(&self.id)?;
            mutator(&mut working)?;
            match collection.save_with_check(&self.id, working, &current_rev) {
                Ok(persisted) => {
                    self.rev = collection.rev_of(&persisted);
                    self.data = persisted;
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Conflict => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(format!("atomic_update on '{}' did not converge after {MAX_ATOMIC_RETRIES} retries", self.id)))
    }

    /// `atomic_update` with a shallow merge as the mutation.
    pub fn atomic_patch(&mut self, patch: serde_json::Map<String, Value>) -> Result<()> {
        self.atomic_update(move |doc| {
            doc.merge_shallow(&patch);
            Ok(())
        })
    }

    /// `atomic_update` with a recursive (nested-object-preserving) merge.
    pub fn incremental_patch(&mut self, patch: serde_json::Map<String, Value>) -> Result<()> {
        self.atomic_update(move |doc| {
            doc.merge_deep(&patch);
            Ok(())
        })
    }

    pub fn remove(self) -> Result<()> {
        let collection = self.upgrade()?;
        collection.remove(&self.id)
    }

    pub fn deleted(&self) -> Result<bool> {
        let collection = self.upgrade()?;
        Ok(!collection.exists(&self.id)?)
    }

    /// A subscription scoped to this single document id.
    pub fn changes(&self) -> Result<FilteredSubscription> {
        let collection = self.upgrade()?;
        collection.changes_for_id(&self.id)
    }
}
