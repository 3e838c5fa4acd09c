// src/database.rs
//! Database: owns every open [`Collection`] by name behind one shared
//! [`KvStore`], handles the collection-open-triggers-migration rule, and
//! does cross-collection export/import/backup as a dump of every collection
//! it knows about.
//!
//! A concrete on-disk `KvStore` is an external collaborator; this module is
//! storage-agnostic and works the same way against `MemoryKv` or a
//! production adapter.

use crate::collection::{Collection, CollectionDump, CollectionOptions, ImportMode};
use crate::error::{Error, Result};
use crate::kv::{require, KvStore};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Construction-time knobs for a [`Database`]. `password` and
/// `graph_options` are accepted for external-config-surface compatibility,
/// but neither does anything here: per-field encryption is wired
/// per-collection via [`CollectionOptions`], and a graph sidecar is out of
/// scope for this crate.
#[derive(Debug, Clone, Default)]
pub struct DatabaseOptions {
    pub name: String,
    pub path: PathBuf,
    pub password: Option<String>,
    pub graph_options: Option<Value>,
}

/// A full database snapshot: every collection's [`CollectionDump`], keyed by
/// collection name. The unit `Database::backup`/`restore` round-trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseDump {
    pub name: String,
    pub collections: HashMap<String, CollectionDump>,
}

struct OpenCollection {
    schema: Schema,
    handle: Arc<Collection>,
}

/// Owns a set of named collections sharing one [`KvStore`]. Opening the same
/// name twice with a changed schema reconciles drift (running migration) on
/// the already-open collection rather than creating a second one.
///
/// Holds a process-local leader lock: `acquire_leader`/`release_leader`
/// only arbitrate between callers sharing this one `Database` instance,
/// never across processes - cross-process coordination is out of scope
/// for this crate.
pub struct Database {
    options: DatabaseOptions,
    kv: Arc<dyn KvStore>,
    collections: parking_lot::RwLock<HashMap<String, OpenCollection>>,
    leader: AtomicBool,
    closed: AtomicBool,
}

impl Database {
    pub fn open(kv: Arc<dyn KvStore>, options: DatabaseOptions) -> Self {
        Database {
            options,
            kv,
            collections: parking_lot::RwLock::new(HashMap::new()),
            leader: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn path(&self) -> &PathBuf {
        &self.options.path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed("database is closed"));
        }
        Ok(())
    }

    /// Open (first call) or fetch (subsequent calls) the named collection
    /// against `schema`. Repeat calls with a schema that drifts from the one
    /// the collection is currently running reconcile it in place, exactly
    /// like re-opening it against a new definition would.
    pub fn collection(&self, name: &str, schema: Schema) -> Result<Arc<Collection>> {
        self.collection_with_options(name, schema, CollectionOptions::default())
    }

    pub fn collection_with_options(&self, name: &str, schema: Schema, options: CollectionOptions) -> Result<Arc<Collection>> {
        self.ensure_open()?;
        {
            let collections = self.collections.read();
            if let Some(existing) = collections.get(name) {
                if schema_matches(&existing.schema, &schema) {
                    return Ok(existing.handle.clone());
                }
            }
        }

        let mut collections = self.collections.write();
        if let Some(existing) = collections.get_mut(name) {
            existing.handle.reconcile_schema(schema.clone())?;
            existing.schema = schema;
            return Ok(existing.handle.clone());
        }

        let handle = Collection::open(self.kv.clone(), name.to_string(), schema.clone(), options)?;
        collections.insert(name.to_string(), OpenCollection { schema, handle: handle.clone() });
        Ok(handle)
    }

    /// The currently-open collection by name, without touching its schema.
    pub fn get_collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.ensure_open()?;
        require(
            self.collections.read().get(name).map(|c| c.handle.clone()),
            format!("collection '{name}' is not open"),
        )
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    /// Closes a single collection so `Database` no longer tracks it; the
    /// underlying KV buckets are untouched. A later `collection()` call with
    /// the same name opens it fresh.
    pub fn close_collection(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.collections.write().remove(name);
        Ok(())
    }

    /// Irreversibly drops every bucket belonging to `name`: documents, every
    /// declared index, attachments, and metadata.
    pub fn destroy_collection(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let schema = require(
            self.collections.write().remove(name).map(|c| c.schema),
            format!("collection '{name}' is not open"),
        )?;
        self.kv.clear_bucket(name)?;
        self.kv.clear_bucket(&format!("{name}_attachments"))?;
        self.kv.clear_bucket(&format!("{name}_meta"))?;
        for index in &schema.indexes {
            self.kv.clear_bucket(&format!("{name}_idx_{}", index.name))?;
        }
        Ok(())
    }

    /// A best-effort in-process leader lock: only one caller holds it at a
    /// time. Does not coordinate across separate `Database` instances or
    /// processes.
    pub fn acquire_leader(&self) -> bool {
        self.leader.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub fn release_leader(&self) {
        self.leader.store(false, Ordering::SeqCst);
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Snapshot every open collection's documents and attachments.
    /// Collections that were never opened via `collection()`
    /// in this process are not included even if their buckets still hold
    /// data.
    pub fn backup(&self) -> Result<DatabaseDump> {
        self.ensure_open()?;
        let collections = self.collections.read();
        let mut dump = HashMap::with_capacity(collections.len());
        for (name, entry) in collections.iter() {
            dump.insert(name.clone(), entry.handle.dump()?);
        }
        Ok(DatabaseDump { name: self.options.name.clone(), collections: dump })
    }

    /// Restore a [`DatabaseDump`] into already-open collections, keyed by
    /// name. A collection named in the dump but not currently open is
    /// skipped rather than silently fabricated with a default schema - call
    /// `collection()` to open it with the right schema first.
    pub fn restore(&self, dump: DatabaseDump, mode: ImportMode) -> Result<()> {
        self.ensure_open()?;
        let collections = self.collections.read();
        for (name, collection_dump) in dump.collections {
            let Some(entry) = collections.get(&name) else {
                continue;
            };
            entry.handle.import_dump(collection_dump, mode)?;
        }
        Ok(())
    }

    /// Closes every open collection's change bus so pending `changes()`
    /// subscribers unblock, then marks the database closed. Buckets are
    /// left intact; a fresh `Database::open` against the same `kv` can
    /// reopen them.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.collections.write().drain() {
            entry.1.handle.close();
        }
    }
}

fn schema_matches(a: &Schema, b: &Schema) -> bool {
    a.version == b.version
        && a.primary_key == b.primary_key
        && a.rev_field == b.rev_field
        && a.indexes == b.indexes
        && a.encrypted_fields == b.encrypted_fields
}
