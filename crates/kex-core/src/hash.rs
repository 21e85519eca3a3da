//! Content hashing and deterministic identifiers
//!
//! Every id the pipeline assigns to a mention, entity, relation, or evidence
//! row is derived from its inputs, so re-running an activity produces the
//! same ids and persistence can upsert on them.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Namespace for kex v5 identifiers
const KEX_NAMESPACE: Uuid = Uuid::from_u128(0x6b65_785f_6e73_4a8e_9c1d_5f3b_2e7a_0c41);

/// SHA-256 of `text`, lowercase hex
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic UUIDv5 over the given parts
///
/// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn stable_id(parts: &[&str]) -> Uuid {
    let mut buf = Vec::new();
    for part in parts {
        buf.extend_from_slice(&(part.len() as u64).to_le_bytes());
        buf.extend_from_slice(part.as_bytes());
    }
    Uuid::new_v5(&KEX_NAMESPACE, &buf)
}
