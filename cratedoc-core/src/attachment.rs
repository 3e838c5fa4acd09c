// src/attachment.rs
//! Attachment records (spec §4.6): binary blobs attached to a document,
//! keyed `<docId>/<attachmentId>` in a collection's own attachment bucket.
//! Bytes are stored as a plain JSON byte array rather than base64 - spec §3
//! allows either; this reference implementation favors not adding a
//! dependency purely for a wire-format choice the KV layer treats as opaque
//! bytes either way.

use ahash::AHasher;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub size: usize,
    pub digest: String,
    pub created: String,
    pub modified: String,
}

impl AttachmentRecord {
    /// Build a fresh record, computing `digest` from the content and
    /// stamping `created`/`modified` to now. Used by `put_attachment`, which
    /// always treats the call as replacing whatever was there.
    pub fn new(name: String, mime_type: String, bytes: Vec<u8>, created: Option<String>) -> Self {
        let digest = digest_hex(&bytes);
        let now = Utc::now().to_rfc3339();
        AttachmentRecord {
            name,
            mime_type,
            size: bytes.len(),
            bytes,
            digest,
            created: created.unwrap_or_else(|| now.clone()),
            modified: now,
        }
    }
}

/// Default content digest when the caller supplies none: a 16-hex-char
/// `ahash` digest, matching the style already used for revision hashes
/// (spec's §4.6 note: "defaults to an ahash hex digest").
pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = AHasher::default();
    hasher.write(bytes);
    format!("{:016x}", hasher.finish())
}

pub fn attachment_key(doc_id: &str, attachment_id: &str) -> Vec<u8> {
    format!("{doc_id}/{attachment_id}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_computes_digest_and_size() {
        let rec = AttachmentRecord::new("a.txt".into(), "text/plain".into(), b"hello".to_vec(), None);
        assert_eq!(rec.size, 5);
        assert_eq!(rec.digest, digest_hex(b"hello"));
        assert_eq!(rec.created, rec.modified);
    }

    #[test]
    fn key_joins_doc_and_attachment_id() {
        assert_eq!(attachment_key("doc1", "photo"), b"doc1/photo".to_vec());
    }
}
