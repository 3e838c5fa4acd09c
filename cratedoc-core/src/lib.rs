// src/lib.rs
//! cratedoc-core: an embedded, single-process, multi-collection document
//! database. Revisioned CRUD, a reactive change bus, Mango-subset queries
//! with index-routed execution, schema-version migration, and
//! cross-collection atomicity of bulk operations, all layered over a
//! pluggable [`kv::KvStore`].
//!
//! [`Database`] owns named [`Collection`]s; a collection is opened against a
//! [`Schema`] and runs migration automatically if the stored schema has
//! drifted. Everything below `Database`/`Collection` - the
//! revision engine, index manager, change bus, query engine, migration
//! engine, hook registry, validator and codec seams - is usable standalone
//! for callers who want finer control than the two top-level types give.

pub mod attachment;
pub mod change_bus;
pub mod codec;
pub mod collection;
pub mod database;
pub mod document;
pub mod document_handle;
pub mod error;
pub mod hooks;
pub mod index;
pub mod kv;
pub mod logging;
pub mod migration;
pub mod query;
pub mod revision;
pub mod schema;
pub mod value_utils;

pub use attachment::AttachmentRecord;
pub use change_bus::{ChangeBus, ChangeEvent, ChangeKind, FilteredSubscription, Subscription};
pub use codec::{FieldCodec, PlaintextCodec};
pub use collection::{Collection, CollectionDump, CollectionOptions, ImportMode};
pub use database::{Database, DatabaseDump, DatabaseOptions};
pub use document::Document;
pub use document_handle::DocumentHandle;
pub use error::{Error, ErrorKind, Result};
pub use hooks::{HookPoint, HookRegistry, PostHook, PreHook};
pub use index::{IndexDef, IndexKey, IndexManager};
pub use kv::{BatchOp, KvStore, MemoryKv};
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use migration::{MigrationEngine, MigrationStrategy};
pub use query::{FindOptions, Query, QueryObserver, SortField};
pub use revision::{initial, next, parse, RevisionParts};
pub use schema::{CompiledSchema, JsonSchemaValidator, Schema, SchemaSnapshot, Validator};
