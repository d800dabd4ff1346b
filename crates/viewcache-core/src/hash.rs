//! Content fingerprints for cached payloads.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Computes a stable fingerprint of a JSON payload.
///
/// Object keys are serialized in sorted order (serde_json's default map), so
/// two payloads that compare equal always hash equal regardless of the key
/// order the server sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeHasher;

impl ChangeHasher {
    pub fn fingerprint(payload: &Value) -> String {
        let mut hasher = Sha256::new();
        // Writing a Value into a Vec cannot fail.
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }

    pub fn unchanged(previous: Option<&str>, payload: &Value) -> bool {
        previous.is_some_and(|hash| hash == Self::fingerprint(payload))
    }
}
