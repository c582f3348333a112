//! Operation signatures
//!
//! A signature names one operation for duplicate detection. Which inputs
//! go into it decides what counts as "the same operation", so the
//! registry takes the strategy as a pluggable trait object.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::registry::State;

/// Derives the signature the loop breaker tracks for an operation.
pub trait SignatureStrategy: Send + Sync {
    fn signature(&self, id: &str, kind: &str, version: u64, patch: &State) -> String;
}

/// SHA-256 over `id`, `kind`, `version` and the patch content.
///
/// Two different field-level edits published at the same version produce
/// different signatures, so only true retransmissions look like
/// duplicates. Patch keys are hashed in sorted order; fields are
/// separated by a NUL byte.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContentHashSignature;

impl SignatureStrategy for ContentHashSignature {
    fn signature(&self, id: &str, kind: &str, version: u64, patch: &State) -> String {
        let sorted: BTreeMap<&String, &serde_json::Value> = patch.iter().collect();
        let body = serde_json::to_vec(&sorted).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(version.to_be_bytes());
        hasher.update([0u8]);
        hasher.update(&body);
        hex::encode(hasher.finalize())
    }
}

/// `"{id}:{kind}:{version}"`, ignoring the patch.
///
/// Suppresses every repeat at a version, including distinct edits. Only
/// suitable when producers never publish two different patches under one
/// version.
#[derive(Clone, Copy, Debug, Default)]
pub struct VersionSignature;

impl SignatureStrategy for VersionSignature {
    fn signature(&self, id: &str, kind: &str, version: u64, _patch: &State) -> String {
        format!("{}:{}:{}", id, kind, version)
    }
}
