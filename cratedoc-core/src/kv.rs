// src/kv.rs
//! The key-value store contract the engine is built against.
//!
//! Production deployments plug in a real engine (LMDB, RocksDB, a custom
//! log-structured store, ...); this module only defines the seam and ships
//! `MemoryKv`, an in-process reference implementation used by tests and by
//! callers who don't need persistence across process restarts.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;

/// A single write within a [`Batch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    Set {
        bucket: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        bucket: String,
        key: Vec<u8>,
    },
}

/// Bucketed byte-level storage: get, set, delete, iterate, atomic batch, path.
///
/// All operations are bucket-scoped; bucket names are the collection/index/
/// attachment/meta namespaces a collection carves out for itself.
/// Implementations must be `Send + Sync` since collections may be driven
/// from multiple threads.
pub trait KvStore: Send + Sync {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, bucket: &str, key: &[u8]) -> Result<()>;

    /// Visit every (key, value) pair in a bucket. Order is unspecified but
    /// stable within one call (no entries reordered mid-iteration).
    fn iterate(&self, bucket: &str, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()>;

    /// Apply a set of operations atomically: either all of them land, or
    /// none do. May span multiple buckets.
    fn batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Drop every key in a bucket. Used by index rebuild and migration.
    fn clear_bucket(&self, bucket: &str) -> Result<()>;

    /// Filesystem path auxiliary indexes (full-text, vector) can colocate
    /// under. In-memory implementations return an empty path.
    fn path(&self) -> PathBuf;
}

/// Reference `KvStore`: an `ahash`-hashed map of buckets, each a map of raw
/// byte keys to byte values, behind one `parking_lot::RwLock`.
///
/// Batch atomicity here is "genuinely atomic" because everything is behind
/// a single lock acquisition - a production KV adapter backed by a real
/// storage engine must uphold the same all-or-nothing contract through its
/// own transaction mechanism, not by copying this implementation.
pub struct MemoryKv {
    buckets: parking_lot::RwLock<HashMap<String, HashMap<Vec<u8>, Vec<u8>>>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv {
            buckets: parking_lot::RwLock::new(HashMap::default()),
        }
    }
}

impl KvStore for MemoryKv {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned())
    }

    fn set(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &[u8]) -> Result<()> {
        if let Some(b) = self.buckets.write().get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    fn iterate(&self, bucket: &str, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let guard = self.buckets.read();
        if let Some(b) = guard.get(bucket) {
            for (k, v) in b.iter() {
                f(k, v)?;
            }
        }
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut guard = self.buckets.write();
        for op in ops {
            match op {
                BatchOp::Set {
                    bucket,
                    key,
                    value,
                } => {
                    guard.entry(bucket).or_default().insert(key, value);
                }
                BatchOp::Delete { bucket, key } => {
                    if let Some(b) = guard.get_mut(&bucket) {
                        b.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn clear_bucket(&self, bucket: &str) -> Result<()> {
        self.buckets.write().remove(bucket);
        Ok(())
    }

    fn path(&self) -> PathBuf {
        PathBuf::new()
    }
}

/// Helper used throughout the engine to turn a missing key into a `NotFound`.
pub fn require<T>(value: Option<T>, message: impl Into<String>) -> Result<T> {
    value.ok_or_else(|| Error::not_found(message))
}
