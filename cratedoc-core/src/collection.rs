// src/collection.rs
//! Collection (spec §4.6): the engine's central type. Owns one KV bucket of
//! documents plus its index buckets, attachment bucket, and metadata bucket;
//! serializes every mutation behind a single reader/writer lock; and is the
//! thing every other seam (hooks, validator, codec, change bus, migration
//! engine) is wired into.
//!
//! Concurrency discipline: reads take the lock in shared mode, mutations
//! take it exclusive. A mutation computes its [`ChangeEvent`] and calls
//! [`ChangeBus::publish`] before releasing the guard - safe because the bus
//! is a non-blocking channel send to pull-based subscribers, never a
//! synchronous callback that could re-enter the collection (see DESIGN.md).
//! Doing it this way, instead of strictly after the unlock, is what makes
//! "delivery order equals commit order" hold without a separate dispatch
//! thread.

use crate::attachment::{attachment_key, digest_hex, AttachmentRecord};
use crate::change_bus::{ChangeBus, ChangeEvent, ChangeKind, FilteredSubscription, Subscription};
use crate::codec::{decode_fields, encode_fields, FieldCodec, PlaintextCodec};
use crate::document::{encode_id, Document};
use crate::document_handle::DocumentHandle;
use crate::error::{Error, Result};
use crate::hooks::{HookPoint, HookRegistry, PostHook, PreHook};
use crate::index::IndexManager;
use crate::kv::{require, BatchOp, KvStore};
use crate::migration::MigrationEngine;
use crate::query::{matches_filter, Query};
use crate::revision;
use crate::schema::{Schema, SchemaSnapshot, Validator};
use fastbloom::BloomFilter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Insert-vs-upsert collision policy for bulk/import paths (SPEC_FULL.md's
/// Open Question (b) decision): `Insert` fails the whole operation on any
/// existing id, `Upsert` overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    Insert,
    Upsert,
}

/// A full collection snapshot: every document plus every attachment,
/// grouped by document id. The unit `Database::export`/`import` work in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionDump {
    pub documents: Vec<Value>,
    pub attachments: HashMap<String, HashMap<String, AttachmentRecord>>,
}

/// Construction-time knobs not carried by [`Schema`] itself: the field
/// codec (encryption) and an optional validator override.
#[derive(Default)]
pub struct CollectionOptions {
    pub codec: Option<Arc<dyn FieldCodec>>,
    pub strict_decryption: bool,
    pub validator: Option<Box<dyn Validator>>,
}

pub struct Collection {
    name: String,
    kv: Arc<dyn KvStore>,
    schema: RwLock<Schema>,
    indexes: RwLock<IndexManager>,
    bus: ChangeBus,
    hooks: RwLock<HookRegistry>,
    validator: RwLock<Box<dyn Validator>>,
    codec: Option<Arc<dyn FieldCodec>>,
    strict_decryption: bool,
    bloom: Mutex<BloomFilter>,
    lock: RwLock<()>,
    closed: AtomicBool,
}

impl Collection {
    /// Open (or re-open) a collection against `kv`. If a schema snapshot was
    /// previously persisted under this name, reconciles drift against it
    /// (running the Migration Engine as needed, spec §4.7) before returning;
    /// otherwise this is a fresh collection and the snapshot is just
    /// recorded as the baseline for future opens.
    pub fn open(kv: Arc<dyn KvStore>, name: String, schema: Schema, options: CollectionOptions) -> Result<Arc<Self>> {
        let indexes = IndexManager::new(name.clone(), schema.indexes.clone());
        let validator: Box<dyn Validator> = match options.validator {
            Some(v) => v,
            None => Box::new(schema.compile_validator()?),
        };

        let coll = Arc::new(Collection {
            name: name.clone(),
            kv,
            schema: RwLock::new(schema),
            indexes: RwLock::new(indexes),
            bus: ChangeBus::new(),
            hooks: RwLock::new(HookRegistry::new()),
            validator: RwLock::new(validator),
            codec: options.codec,
            strict_decryption: options.strict_decryption,
            bloom: Mutex::new(BloomFilter::with_num_bits(1 << 16).expected_items(4096)),
            lock: RwLock::new(()),
            closed: AtomicBool::new(false),
        });

        {
            let _guard = coll.lock.write();
            coll.migrate_locked()?;
        }
        coll.rebuild_bloom()?;
        Ok(coll)
    }

    /// Re-point this collection at a (possibly changed) schema, running
    /// migration if it drifted. Used by `Database::collection` on repeat
    /// calls for an already-open collection.
    pub fn reconcile_schema(&self, new_schema: Schema) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.lock.write();
        let validator = new_schema.compile_validator()?;
        *self.schema.write() = new_schema;
        *self.validator.write() = Box::new(validator);
        self.migrate_locked()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> Schema {
        self.schema.read().clone()
    }

    fn rev_field_name(&self) -> String {
        self.schema.read().rev_field.clone()
    }

    pub(crate) fn rev_of(&self, doc: &Document) -> String {
        doc.get(&self.rev_field_name()).and_then(Value::as_str).unwrap_or("").to_string()
    }

    fn meta_bucket(&self) -> String {
        format!("{}_meta", self.name)
    }

    fn attachments_bucket(&self) -> String {
        format!("{}_attachments", self.name)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed(format!("collection '{}' is closed", self.name)));
        }
        Ok(())
    }

    /// Stop accepting operations and disconnect every change subscriber.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.bus.close();
    }

    // ---- hook registration passthroughs (spec §4.8) ----

    pub fn on_pre_create(&self, hook: PreHook) {
        self.hooks.write().on_pre_create(hook);
    }
    pub fn on_post_create(&self, hook: PostHook) {
        self.hooks.write().on_post_create(hook);
    }
    pub fn on_pre_insert(&self, hook: PreHook) {
        self.hooks.write().on_pre_insert(hook);
    }
    pub fn on_post_insert(&self, hook: PostHook) {
        self.hooks.write().on_post_insert(hook);
    }
    pub fn on_pre_save(&self, hook: PreHook) {
        self.hooks.write().on_pre_save(hook);
    }
    pub fn on_post_save(&self, hook: PostHook) {
        self.hooks.write().on_post_save(hook);
    }
    pub fn on_pre_remove(&self, hook: PreHook) {
        self.hooks.write().on_pre_remove(hook);
    }
    pub fn on_post_remove(&self, hook: PostHook) {
        self.hooks.write().on_post_remove(hook);
    }

    // ---- internal read helpers ----

    fn extract_id(&self, doc: &Document) -> Result<String> {
        let schema = self.schema.read();
        let mut values = Vec::with_capacity(schema.primary_key.len());
        for field in &schema.primary_key {
            let v = doc.get(field).cloned().ok_or_else(|| Error::validation(format!("document missing primary key field '{field}'")))?;
            values.push(v);
        }
        Ok(encode_id(&values))
    }

    /// Ground-truth stored form: decoded (decrypted) but without defaults
    /// applied - the shape used for revision comparisons and as the "old"
    /// half of index/hook calls.
    fn read_raw_locked(&self, id: &str) -> Result<Option<Document>> {
        let Some(bytes) = self.kv.get(&self.name, id.as_bytes())? else {
            return Ok(None);
        };
        let value: Value = serde_json::from_slice(&bytes)?;
        let mut doc = Document::from_value(value)?;
        if let Some(codec) = &self.codec {
            let fields = self.schema.read().encrypted_fields.clone();
            decode_fields(&mut doc, &fields, codec.as_ref(), self.strict_decryption)?;
        }
        Ok(Some(doc))
    }

    /// Read-facing form: `read_raw_locked` plus schema defaults applied.
    /// This is the materialization point spec §4.8's `preCreate`/`postCreate`
    /// fire around - every document handed back to a reader (by id or via a
    /// query) passes through here.
    fn materialize_locked(&self, id: &str) -> Result<Option<Document>> {
        match self.read_raw_locked(id)? {
            Some(mut doc) => {
                self.validator.read().apply_defaults(&mut doc);
                self.hooks.read().run_pre(HookPoint::PreCreate, &mut doc)?;
                self.hooks.read().run_post(HookPoint::PostCreate, &doc);
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        self.ensure_open()?;
        let _guard = self.lock.read();
        Ok(self.kv.get(&self.name, id.as_bytes())?.is_some())
    }

    /// Read the current stored state and revision for `id` under a shared
    /// lock, without applying defaults - the snapshot `DocumentHandle`'s
    /// atomic-update loop mutates against.
    pub(crate) fn read_current(&self, id: &str) -> Result<(Document, String)> {
        self.ensure_open()?;
        let _guard = self.lock.read();
        let doc = require(self.read_raw_locked(id)?, format!("document '{id}' not found"))?;
        let rev = self.rev_of(&doc);
        Ok((doc, rev))
    }

    fn all_locked(&self) -> Result<Vec<(String, Document)>> {
        let mut ids = Vec::new();
        self.kv.iterate(&self.name, &mut |k, _| {
            ids.push(String::from_utf8_lossy(k).to_string());
            Ok(())
        })?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.materialize_locked(&id)? {
                out.push((id, doc));
            }
        }
        Ok(out)
    }

    pub fn all(&self) -> Result<Vec<(String, Document)>> {
        self.ensure_open()?;
        let _guard = self.lock.read();
        self.all_locked()
    }

    pub fn count(&self) -> Result<usize> {
        self.ensure_open()?;
        let _guard = self.lock.read();
        let mut n = 0usize;
        self.kv.iterate(&self.name, &mut |_, _| {
            n += 1;
            Ok(())
        })?;
        Ok(n)
    }

    pub fn find_by_id(self: &Arc<Self>, id: &str) -> Result<DocumentHandle> {
        self.ensure_open()?;
        let doc = {
            let _guard = self.lock.read();
            require(self.materialize_locked(id)?, format!("document '{id}' not found"))?
        };
        let rev = self.rev_of(&doc);
        Ok(DocumentHandle::new(Arc::downgrade(self), id.to_string(), doc, rev))
    }

    // ---- the single write path every mutation funnels through ----

    /// Must be called with the write lock held. `old` is `None` for an
    /// insert, `Some` for an update (its revision is assumed already
    /// validated by the caller - this function does not re-check it).
    fn commit_locked(&self, id: &str, mut doc: Document, old: Option<Document>) -> Result<Document> {
        self.validator.read().apply_defaults(&mut doc);
        if old.is_none() {
            self.hooks.read().run_pre(HookPoint::PreInsert, &mut doc)?;
        }
        self.hooks.read().run_pre(HookPoint::PreSave, &mut doc)?;
        self.validator.read().validate_final_fields(&doc)?;

        let rev_field = self.rev_field_name();
        let prev_rev = old.as_ref().map(|o| self.rev_of(o)).unwrap_or_default();
        let new_rev = if old.is_none() { revision::initial(&doc.as_value()) } else { revision::next(&prev_rev, &doc.as_value()) };
        doc.set(rev_field.clone(), json!(new_rev.clone()));

        let mut stored = doc.clone();
        if let Some(codec) = &self.codec {
            let fields = self.schema.read().encrypted_fields.clone();
            encode_fields(&mut stored, &fields, codec.as_ref());
        }

        let mut ops = match &old {
            None => self.indexes.read().on_insert(self.kv.as_ref(), id, &doc)?,
            Some(o) => self.indexes.read().on_update(self.kv.as_ref(), id, o, &doc)?,
        };
        ops.push(BatchOp::Set { bucket: self.name.clone(), key: id.as_bytes().to_vec(), value: serde_json::to_vec(&stored.as_value())? });
        self.kv.batch(ops)?;
        self.bloom.lock().insert(id.as_bytes());

        if old.is_none() {
            self.hooks.read().run_post(HookPoint::PostInsert, &doc);
        }
        self.hooks.read().run_post(HookPoint::PostSave, &doc);

        let event = ChangeEvent {
            seq: self.bus.next_seq(),
            collection: self.name.clone(),
            id: id.to_string(),
            kind: if old.is_none() { ChangeKind::Insert } else { ChangeKind::Update },
            rev: new_rev,
            doc: Some(doc.as_value()),
            old: old.map(|o| o.as_value()),
            meta: None,
        };
        self.bus.publish(event);

        Ok(doc)
    }

    /// Used by `DocumentHandle::save`/`atomic_update`: re-checks `expected_rev`
    /// against the store's current revision before committing, failing with
    /// `Conflict` on mismatch. The only path that ever produces `Conflict`,
    /// since every other mutation reads-then-writes within one lock
    /// acquisition and can't race against itself.
    pub(crate) fn save_with_check(&self, id: &str, new_doc: Document, expected_rev: &str) -> Result<Document> {
        self.ensure_open()?;
        let _guard = self.lock.write();
        let current = require(self.read_raw_locked(id)?, format!("document '{id}' not found"))?;
        if self.rev_of(&current) != expected_rev {
            return Err(Error::conflict(format!("revision mismatch for document '{id}'")));
        }
        self.commit_locked(id, new_doc, Some(current))
    }

    pub fn insert(&self, doc: Value) -> Result<Document> {
        self.ensure_open()?;
        let doc = Document::from_value(doc)?;
        let id = self.extract_id(&doc)?;
        let _guard = self.lock.write();
        if self.read_raw_locked(&id)?.is_some() {
            return Err(Error::already_exists(format!("document '{id}' already exists")));
        }
        self.validator.read().validate(&doc)?;
        self.commit_locked(&id, doc, None)
    }

    pub fn upsert(&self, doc: Value) -> Result<Document> {
        self.ensure_open()?;
        let doc = Document::from_value(doc)?;
        let id = self.extract_id(&doc)?;
        let _guard = self.lock.write();
        // The bloom filter is advisory only: a positive hit here just means
        // "maybe present". A definite store lookup always follows, closing
        // the false-negative race described in spec §7/§9 - it would only
        // matter if we ever skipped the definite check on a negative bloom
        // result, which we never do.
        let _maybe_present = self.bloom.lock().contains(id.as_bytes());
        let existing = self.read_raw_locked(&id)?;
        self.validator.read().validate(&doc)?;
        self.commit_locked(&id, doc, existing)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.lock.write();
        let old = require(self.read_raw_locked(id)?, format!("document '{id}' not found"))?;
        self.hooks.read().run_pre(HookPoint::PreRemove, &mut old.clone())?;

        let mut ops = self.indexes.read().on_delete(self.kv.as_ref(), id, &old)?;
        ops.extend(self.attachment_delete_ops(id)?);
        ops.push(BatchOp::Delete { bucket: self.name.clone(), key: id.as_bytes().to_vec() });
        self.kv.batch(ops)?;

        self.hooks.read().run_post(HookPoint::PostRemove, &old);

        let rev = self.rev_of(&old);
        self.bus.publish(ChangeEvent {
            seq: self.bus.next_seq(),
            collection: self.name.clone(),
            id: id.to_string(),
            kind: ChangeKind::Delete,
            rev,
            doc: None,
            old: Some(old.as_value()),
            meta: None,
        });
        Ok(())
    }

    fn attachment_delete_ops(&self, doc_id: &str) -> Result<Vec<BatchOp>> {
        let bucket = self.attachments_bucket();
        let prefix = format!("{doc_id}/");
        let mut keys = Vec::new();
        self.kv.iterate(&bucket, &mut |k, _| {
            if k.starts_with(prefix.as_bytes()) {
                keys.push(k.to_vec());
            }
            Ok(())
        })?;
        Ok(keys.into_iter().map(|key| BatchOp::Delete { bucket: bucket.clone(), key }).collect())
    }

    // ---- bulk operations (spec §4.6: all-or-nothing for Insert/Upsert, best-effort for Remove) ----

    pub fn bulk_insert(&self, docs: Vec<Value>) -> Result<Vec<Document>> {
        self.ensure_open()?;
        let _guard = self.lock.write();

        let mut prepared = Vec::with_capacity(docs.len());
        let mut seen_ids = std::collections::HashSet::new();
        for v in docs {
            let mut d = Document::from_value(v)?;
            let id = self.extract_id(&d)?;
            if !seen_ids.insert(id.clone()) {
                return Err(Error::already_exists(format!("document '{id}' duplicated within batch")));
            }
            if self.read_raw_locked(&id)?.is_some() {
                return Err(Error::already_exists(format!("document '{id}' already exists")));
            }
            self.validator.read().validate(&d)?;
            self.validator.read().apply_defaults(&mut d);
            self.hooks.read().run_pre(HookPoint::PreInsert, &mut d)?;
            self.hooks.read().run_pre(HookPoint::PreSave, &mut d)?;
            self.validator.read().validate_final_fields(&d)?;
            prepared.push((id, d));
        }

        let rev_field = self.rev_field_name();
        let mut ops = Vec::new();
        let mut results = Vec::with_capacity(prepared.len());
        for (id, mut d) in prepared {
            let rev = revision::initial(&d.as_value());
            d.set(rev_field.clone(), json!(rev));
            let mut stored = d.clone();
            if let Some(codec) = &self.codec {
                let fields = self.schema.read().encrypted_fields.clone();
                encode_fields(&mut stored, &fields, codec.as_ref());
            }
            ops.extend(self.indexes.read().on_insert(self.kv.as_ref(), &id, &d)?);
            ops.push(BatchOp::Set { bucket: self.name.clone(), key: id.as_bytes().to_vec(), value: serde_json::to_vec(&stored.as_value())? });
            results.push((id, d));
        }
        self.kv.batch(ops)?;

        let mut bloom = self.bloom.lock();
        for (id, _) in &results {
            bloom.insert(id.as_bytes());
        }
        drop(bloom);

        for (_, d) in &results {
            self.hooks.read().run_post(HookPoint::PostInsert, d);
            self.hooks.read().run_post(HookPoint::PostSave, d);
        }

        let mut out = Vec::with_capacity(results.len());
        for (id, d) in results {
            let rev = self.rev_of(&d);
            self.bus.publish(ChangeEvent {
                seq: self.bus.next_seq(),
                collection: self.name.clone(),
                id,
                kind: ChangeKind::Insert,
                rev,
                doc: Some(d.as_value()),
                old: None,
                meta: None,
            });
            out.push(d);
        }
        Ok(out)
    }

    pub fn bulk_upsert(&self, docs: Vec<Value>) -> Result<Vec<Document>> {
        self.ensure_open()?;
        let _guard = self.lock.write();

        let mut out = Vec::with_capacity(docs.len());
        for v in docs {
            let d = Document::from_value(v)?;
            let id = self.extract_id(&d)?;
            let existing = self.read_raw_locked(&id)?;
            self.validator.read().validate(&d)?;
            out.push(self.commit_locked(&id, d, existing)?);
        }
        Ok(out)
    }

    /// Best-effort: ids with no matching document are skipped, not an error.
    /// Returns the number actually removed.
    pub fn bulk_remove(&self, ids: &[String]) -> Result<usize> {
        self.ensure_open()?;
        let _guard = self.lock.write();

        let mut ops = Vec::new();
        let mut removed = Vec::new();
        for id in ids {
            if let Some(old) = self.read_raw_locked(id)? {
                ops.extend(self.indexes.read().on_delete(self.kv.as_ref(), id, &old)?);
                ops.extend(self.attachment_delete_ops(id)?);
                ops.push(BatchOp::Delete { bucket: self.name.clone(), key: id.as_bytes().to_vec() });
                removed.push((id.clone(), old));
            }
        }
        self.kv.batch(ops)?;

        let count = removed.len();
        for (id, old) in removed {
            let rev = self.rev_of(&old);
            self.bus.publish(ChangeEvent {
                seq: self.bus.next_seq(),
                collection: self.name.clone(),
                id,
                kind: ChangeKind::Delete,
                rev,
                doc: None,
                old: Some(old.as_value()),
                meta: None,
            });
        }
        Ok(count)
    }

    /// Insert-or-merge-then-save in one call; `patch` must carry the primary
    /// key field(s) so the target id can be determined.
    pub fn incremental_upsert(&self, patch: Value) -> Result<Document> {
        self.ensure_open()?;
        let patch_doc = Document::from_value(patch)?;
        let id = self.extract_id(&patch_doc)?;
        let _guard = self.lock.write();
        let existing = self.read_raw_locked(&id)?;
        let merged = match &existing {
            Some(old) => {
                let mut merged = old.clone();
                merged.merge_shallow(&patch_doc.0);
                merged
            }
            None => patch_doc,
        };
        if existing.is_none() {
            self.validator.read().validate(&merged)?;
        }
        self.commit_locked(&id, merged, existing)
    }

    /// Read-modify-write in a single lock acquisition - unlike
    /// `DocumentHandle::atomic_update`, this can never observe a conflicting
    /// concurrent writer (there's no earlier, possibly-stale read to race
    /// against), so there's no retry loop.
    pub fn incremental_modify(&self, id: &str, mut mutator: impl FnMut(&mut Document) -> Result<()>) -> Result<Document> {
        self.ensure_open()?;
        let _guard = self.lock.write();
        let old = require(self.read_raw_locked(id)?, format!("document '{id}' not found"))?;
        let mut working = old.clone();
        mutator(&mut working)?;
        self.commit_locked(id, working, Some(old))
    }

    // ---- query plumbing ----

    fn select_candidates_locked(&self, selector: &Value) -> Result<Vec<(String, Document)>> {
        let is_empty = selector.as_object().map(|o| o.is_empty()).unwrap_or(true);
        if is_empty {
            return self.all_locked();
        }
        let picked = self.indexes.read().select_best(selector).map(|(def, values)| (def.clone(), values));
        if let Some((def, values)) = picked {
            let ids = self.indexes.read().lookup(self.kv.as_ref(), &def, &values)?;
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(doc) = self.materialize_locked(&id)? {
                    out.push((id, doc));
                }
            }
            return Ok(out);
        }
        self.all_locked()
    }

    pub(crate) fn candidates_for(&self, selector: &Value) -> Result<Vec<(String, Document)>> {
        self.ensure_open()?;
        let _guard = self.lock.read();
        self.select_candidates_locked(selector)
    }

    pub fn find(self: &Arc<Self>, selector: Value) -> Query {
        Query::new(self.clone(), selector)
    }

    pub fn find_one(self: &Arc<Self>, selector: Value) -> Result<Option<(String, Document)>> {
        self.find(selector).one()
    }

    pub(crate) fn query_remove(&self, selector: &Value) -> Result<usize> {
        self.ensure_open()?;
        let _guard = self.lock.write();
        let candidates = self.select_candidates_locked(selector)?;
        let mut matching = Vec::with_capacity(candidates.len());
        for (id, d) in candidates {
            if matches_filter(&d, selector)? {
                matching.push((id, d));
            }
        }
        if matching.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::new();
        for (id, doc) in &matching {
            ops.extend(self.indexes.read().on_delete(self.kv.as_ref(), id, doc)?);
            ops.extend(self.attachment_delete_ops(id)?);
            ops.push(BatchOp::Delete { bucket: self.name.clone(), key: id.as_bytes().to_vec() });
        }
        self.kv.batch(ops)?;

        let count = matching.len();
        for (id, doc) in matching {
            let rev = self.rev_of(&doc);
            self.bus.publish(ChangeEvent {
                seq: self.bus.next_seq(),
                collection: self.name.clone(),
                id,
                kind: ChangeKind::Delete,
                rev,
                doc: None,
                old: Some(doc.as_value()),
                meta: None,
            });
        }
        Ok(count)
    }

    pub(crate) fn query_update(&self, selector: &Value, patch: &serde_json::Map<String, Value>) -> Result<usize> {
        self.ensure_open()?;
        let primary_key = self.schema.read().primary_key.clone();
        for pk in &primary_key {
            if patch.contains_key(pk) {
                return Err(Error::validation(format!("update must not modify primary key field '{pk}'")));
            }
        }

        let _guard = self.lock.write();
        let candidates = self.select_candidates_locked(selector)?;
        let mut matching = Vec::with_capacity(candidates.len());
        for (id, d) in candidates {
            if matches_filter(&d, selector)? {
                matching.push((id, d));
            }
        }
        if matching.is_empty() {
            return Ok(0);
        }

        let rev_field = self.rev_field_name();
        let mut new_docs = Vec::with_capacity(matching.len());
        for (id, old) in &matching {
            let mut updated = old.clone();
            updated.merge_shallow(patch);
            self.hooks.read().run_pre(HookPoint::PreSave, &mut updated)?;
            self.validator.read().validate_final_fields(&updated)?;
            let prev_rev = self.rev_of(old);
            let new_rev = revision::next(&prev_rev, &updated.as_value());
            updated.set(rev_field.clone(), json!(new_rev));
            new_docs.push((id.clone(), updated));
        }

        let mut ops = Vec::new();
        for ((id, old), (_, new)) in matching.iter().zip(new_docs.iter()) {
            ops.extend(self.indexes.read().on_update(self.kv.as_ref(), id, old, new)?);
            let mut stored = new.clone();
            if let Some(codec) = &self.codec {
                let fields = self.schema.read().encrypted_fields.clone();
                encode_fields(&mut stored, &fields, codec.as_ref());
            }
            ops.push(BatchOp::Set { bucket: self.name.clone(), key: id.as_bytes().to_vec(), value: serde_json::to_vec(&stored.as_value())? });
        }
        self.kv.batch(ops)?;

        for (_, new) in &new_docs {
            self.hooks.read().run_post(HookPoint::PostSave, new);
        }

        let count = new_docs.len();
        for ((id, old), (_, new)) in matching.into_iter().zip(new_docs.into_iter()) {
            let rev = self.rev_of(&new);
            self.bus.publish(ChangeEvent {
                seq: self.bus.next_seq(),
                collection: self.name.clone(),
                id,
                kind: ChangeKind::Update,
                rev,
                doc: Some(new.as_value()),
                old: Some(old.as_value()),
                meta: None,
            });
        }
        Ok(count)
    }

    // ---- change feed ----

    pub fn changes(&self) -> Result<Subscription> {
        self.ensure_open()?;
        Ok(self.bus.subscribe())
    }

    pub(crate) fn changes_for_id(&self, id: &str) -> Result<FilteredSubscription> {
        self.ensure_open()?;
        Ok(self.bus.subscribe().filter_by_id(id.to_string()))
    }

    // ---- attachments (spec §4.6) ----

    pub fn put_attachment(&self, doc_id: &str, attachment_id: &str, name: String, mime_type: String, bytes: Vec<u8>) -> Result<AttachmentRecord> {
        self.ensure_open()?;
        let _guard = self.lock.write();
        if self.read_raw_locked(doc_id)?.is_none() {
            return Err(Error::not_found(format!("document '{doc_id}' not found")));
        }
        let bucket = self.attachments_bucket();
        let key = attachment_key(doc_id, attachment_id);
        let created = self
            .kv
            .get(&bucket, &key)?
            .and_then(|b| serde_json::from_slice::<AttachmentRecord>(&b).ok())
            .map(|r| r.created);
        let record = AttachmentRecord::new(name, mime_type, bytes, created);
        self.kv.set(&bucket, &key, &serde_json::to_vec(&record)?)?;
        Ok(record)
    }

    fn store_attachment_record(&self, doc_id: &str, attachment_id: &str, record: &AttachmentRecord) -> Result<()> {
        let bucket = self.attachments_bucket();
        let key = attachment_key(doc_id, attachment_id);
        self.kv.set(&bucket, &key, &serde_json::to_vec(record)?)
    }

    pub fn get_attachment(&self, doc_id: &str, attachment_id: &str) -> Result<AttachmentRecord> {
        self.ensure_open()?;
        let _guard = self.lock.read();
        let bytes = require(
            self.kv.get(&self.attachments_bucket(), &attachment_key(doc_id, attachment_id))?,
            format!("attachment '{attachment_id}' on document '{doc_id}' not found"),
        )?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn remove_attachment(&self, doc_id: &str, attachment_id: &str) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.lock.write();
        self.kv.delete(&self.attachments_bucket(), &attachment_key(doc_id, attachment_id))
    }

    pub fn get_all_attachments(&self, doc_id: &str) -> Result<HashMap<String, AttachmentRecord>> {
        self.ensure_open()?;
        let _guard = self.lock.read();
        let bucket = self.attachments_bucket();
        let prefix = format!("{doc_id}/");
        let mut out = HashMap::new();
        self.kv.iterate(&bucket, &mut |k, v| {
            let key = String::from_utf8_lossy(k).to_string();
            if let Some(attachment_id) = key.strip_prefix(&prefix) {
                out.insert(attachment_id.to_string(), serde_json::from_slice(v)?);
            }
            Ok(())
        })?;
        Ok(out)
    }

    // ---- bulk import/export (spec §4.6) ----

    pub fn export_json(&self) -> Result<Vec<Value>> {
        Ok(self.all()?.into_iter().map(|(_, d)| d.into_value()).collect())
    }

    pub fn import_json(&self, docs: Vec<Value>, mode: ImportMode) -> Result<()> {
        for doc in docs {
            match mode {
                ImportMode::Insert => {
                    self.insert(doc)?;
                }
                ImportMode::Upsert => {
                    self.upsert(doc)?;
                }
            }
        }
        Ok(())
    }

    pub fn dump(&self) -> Result<CollectionDump> {
        self.ensure_open()?;
        let documents = self.export_json()?;
        let mut attachments = HashMap::new();
        let bucket = self.attachments_bucket();
        let mut by_doc: HashMap<String, HashMap<String, AttachmentRecord>> = HashMap::new();
        self.kv.iterate(&bucket, &mut |k, v| {
            let key = String::from_utf8_lossy(k).to_string();
            if let Some((doc_id, attachment_id)) = key.split_once('/') {
                let record: AttachmentRecord = serde_json::from_slice(v)?;
                by_doc.entry(doc_id.to_string()).or_default().insert(attachment_id.to_string(), record);
            }
            Ok(())
        })?;
        attachments.extend(by_doc);
        Ok(CollectionDump { documents, attachments })
    }

    pub fn import_dump(&self, dump: CollectionDump, mode: ImportMode) -> Result<()> {
        self.import_json(dump.documents, mode)?;
        for (doc_id, atts) in dump.attachments {
            for (attachment_id, record) in atts {
                self.store_attachment_record(&doc_id, &attachment_id, &record)?;
            }
        }
        Ok(())
    }

    // ---- migration (spec §4.7) ----

    pub fn migrate(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.lock.write();
        self.migrate_locked()
    }

    fn read_meta_snapshot(&self) -> Result<Option<SchemaSnapshot>> {
        match self.kv.get(&self.meta_bucket(), b"schema_snapshot")? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn build_meta_op(&self, snapshot: &SchemaSnapshot) -> Result<BatchOp> {
        Ok(BatchOp::Set { bucket: self.meta_bucket(), key: b"schema_snapshot".to_vec(), value: serde_json::to_vec(snapshot)? })
    }

    /// The full §4.7 algorithm. Must run with the write lock held.
    fn migrate_locked(&self) -> Result<()> {
        let schema = self.schema.read().clone();
        let requested = SchemaSnapshot::of(&schema);

        let Some(stored) = self.read_meta_snapshot()? else {
            self.kv.batch(vec![self.build_meta_op(&requested)?])?;
            return Ok(());
        };

        let steps = MigrationEngine::steps_for(stored.version, schema.version, &schema.migration_strategies);
        let drifted = stored.drifted_from(&requested);
        let version_changed = stored.version != schema.version;

        if steps.is_empty() && !drifted && !version_changed {
            return Ok(());
        }

        let rewritten = MigrationEngine::run(
            self.kv.as_ref(),
            &self.name,
            &stored.rev_field,
            &schema.rev_field,
            &schema.migration_strategies,
            stored.version,
            schema.version,
        )?;

        let mut ops = Vec::new();
        for def in &stored.indexes {
            let bucket = format!("{}_idx_{}", self.name, def.name);
            let mut keys = Vec::new();
            self.kv.iterate(&bucket, &mut |k, _| {
                keys.push(k.to_vec());
                Ok(())
            })?;
            for key in keys {
                ops.push(BatchOp::Delete { bucket: bucket.clone(), key });
            }
        }

        let fresh_indexes = IndexManager::new(self.name.clone(), schema.indexes.clone());
        for (id, doc) in &rewritten {
            ops.extend(fresh_indexes.on_insert(self.kv.as_ref(), id, doc)?);
            ops.push(BatchOp::Set { bucket: self.name.clone(), key: id.as_bytes().to_vec(), value: serde_json::to_vec(&doc.as_value())? });
        }
        ops.push(self.build_meta_op(&requested)?);
        self.kv.batch(ops)?;

        *self.indexes.write() = fresh_indexes;
        Ok(())
    }

    fn rebuild_bloom(&self) -> Result<()> {
        let mut bloom = self.bloom.lock();
        self.kv.iterate(&self.name, &mut |k, _| {
            bloom.insert(k);
            Ok(())
        })?;
        Ok(())
    }
}

/// Built-in no-op codec convenience, matching `PlaintextCodec`'s role as the
/// runnable-out-of-the-box default (spec §4.10).
impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions { codec: None, strict_decryption: false, validator: None }
    }
}

#[allow(dead_code)]
fn _assert_plaintext_codec_available() {
    let _: Arc<dyn FieldCodec> = Arc::new(PlaintextCodec);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexDef;
    use crate::kv::MemoryKv;
    use serde_json::json;

    fn open_with(schema: Schema) -> Arc<Collection> {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        Collection::open(kv, "people".into(), schema, CollectionOptions::default()).unwrap()
    }

    fn open() -> Arc<Collection> {
        open_with(Schema::new(vec!["_id".into()], "_rev"))
    }

    #[test]
    fn insert_assigns_revision_and_rejects_duplicate_id() {
        let coll = open();
        let doc = coll.insert(json!({"_id": "doc1", "name": "Test"})).unwrap();
        assert!(doc.get("_rev").and_then(Value::as_str).unwrap().starts_with("1-"));
        assert_eq!(coll.insert(json!({"_id": "doc1"})).unwrap_err().kind(), crate::error::ErrorKind::AlreadyExists);
    }

    #[test]
    fn create_hooks_fire_on_materialization_not_on_insert() {
        let coll = open();
        let pre_calls = Arc::new(Mutex::new(0));
        let post_calls = Arc::new(Mutex::new(0));

        let pre = pre_calls.clone();
        coll.on_pre_create(Box::new(move |doc| {
            *pre.lock() += 1;
            doc.set("greeted", json!(true));
            Ok(())
        }));
        let post = post_calls.clone();
        coll.on_post_create(Box::new(move |_doc| {
            *post.lock() += 1;
        }));

        coll.insert(json!({"_id": "doc1"})).unwrap();
        assert_eq!(*pre_calls.lock(), 0, "insert does not materialize a reader-facing document");
        assert_eq!(*post_calls.lock(), 0);

        let handle = coll.find_by_id("doc1").unwrap();
        assert_eq!(*pre_calls.lock(), 1);
        assert_eq!(*post_calls.lock(), 1);
        assert_eq!(handle.get_value("greeted"), Some(&json!(true)));

        let all = coll.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(*pre_calls.lock(), 2, "full scans materialize through the same path as find_by_id");
        assert_eq!(*post_calls.lock(), 2);
    }

    #[test]
    fn upsert_inserts_then_updates() {
        let coll = open();
        let first = coll.upsert(json!({"_id": "doc1", "count": 1})).unwrap();
        assert!(first.get("_rev").and_then(Value::as_str).unwrap().starts_with("1-"));
        let second = coll.upsert(json!({"_id": "doc1", "count": 2})).unwrap();
        assert!(second.get("_rev").and_then(Value::as_str).unwrap().starts_with("2-"));
    }

    #[test]
    fn remove_deletes_document_and_fires_event() {
        let coll = open();
        coll.insert(json!({"_id": "doc1"})).unwrap();
        let sub = coll.changes().unwrap();
        let _ = sub.try_recv(); // drain insert event
        coll.remove("doc1").unwrap();
        assert!(!coll.exists("doc1").unwrap());
        let event = sub.recv().unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert!(event.doc.is_none());
        assert!(event.old.is_some());
    }

    #[test]
    fn bulk_insert_is_all_or_nothing() {
        let coll = open();
        coll.insert(json!({"_id": "b"})).unwrap();
        let result = coll.bulk_insert(vec![json!({"_id": "a"}), json!({"_id": "b"}), json!({"_id": "c"})]);
        assert!(result.is_err());
        assert!(!coll.exists("a").unwrap());
        assert!(!coll.exists("c").unwrap());
    }

    #[test]
    fn query_update_rejects_primary_key_mutation() {
        let coll = open();
        coll.insert(json!({"_id": "doc1", "name": "a"})).unwrap();
        let mut patch = serde_json::Map::new();
        patch.insert("_id".to_string(), json!("doc2"));
        assert!(coll.query_update(&json!({}), &patch).is_err());
    }

    #[test]
    fn query_update_bumps_revision_and_reindexes() {
        let schema = Schema::new(vec!["_id".into()], "_rev").with_indexes(vec![IndexDef { name: "by_city".into(), fields: vec!["city".into()] }]);
        let coll = open_with(schema);
        coll.insert(json!({"_id": "doc1", "city": "NYC"})).unwrap();
        let mut patch = serde_json::Map::new();
        patch.insert("city".to_string(), json!("LA"));
        let n = coll.query_update(&json!({"city": "NYC"}), &patch).unwrap();
        assert_eq!(n, 1);
        let found = coll.candidates_for(&json!({"city": "LA"})).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn put_and_get_attachment_round_trips() {
        let coll = open();
        coll.insert(json!({"_id": "doc1"})).unwrap();
        coll.put_attachment("doc1", "photo", "a.png".into(), "image/png".into(), b"bytes".to_vec()).unwrap();
        let record = coll.get_attachment("doc1", "photo").unwrap();
        assert_eq!(record.bytes, b"bytes".to_vec());
        assert_eq!(record.digest, digest_hex(b"bytes"));
    }

    #[test]
    fn removing_a_document_also_removes_its_attachments() {
        let coll = open();
        coll.insert(json!({"_id": "doc1"})).unwrap();
        coll.put_attachment("doc1", "photo", "a.png".into(), "image/png".into(), b"bytes".to_vec()).unwrap();
        coll.remove("doc1").unwrap();
        assert!(coll.get_attachment("doc1", "photo").is_err());
    }

    #[test]
    fn dump_and_import_dump_round_trip_documents_and_attachments() {
        let coll = open();
        coll.insert(json!({"_id": "doc1", "name": "Alice"})).unwrap();
        coll.put_attachment("doc1", "photo", "a.png".into(), "image/png".into(), b"bytes".to_vec()).unwrap();
        let dump = coll.dump().unwrap();

        let other = open_with(Schema::new(vec!["_id".into()], "_rev"));
        other.import_dump(dump, ImportMode::Insert).unwrap();
        assert!(other.exists("doc1").unwrap());
        assert_eq!(other.get_attachment("doc1", "photo").unwrap().bytes, b"bytes".to_vec());
    }

    #[test]
    fn migrate_reruns_cleanly_when_nothing_drifted() {
        let coll = open();
        coll.insert(json!({"_id": "doc1"})).unwrap();
        coll.migrate().unwrap();
        assert!(coll.exists("doc1").unwrap());
    }

    #[test]
    fn closing_a_collection_rejects_further_operations() {
        let coll = open();
        coll.close();
        assert_eq!(coll.insert(json!({"_id": "doc1"})).unwrap_err().kind(), crate::error::ErrorKind::Closed);
    }
}
