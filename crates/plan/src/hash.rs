//! Deterministic content hashing over heterogeneous step inputs.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::error;

/// Sentinel returned when hashing fails. It collides with itself on purpose:
/// a step whose inputs cannot be hashed appears unchanged and is not retried.
pub const HASH_ERROR: &str = "hasherror";

/// Lowercase hex fingerprint of `value`, stable across process restarts and
/// insensitive to map iteration order (objects are canonicalized through
/// `serde_json::Value`, which keeps keys sorted).
pub fn content_hash<T: Serialize>(value: &T) -> String {
    match canonical_bytes(value) {
        Ok(bytes) => hex::encode(Sha256::digest(&bytes)),
        Err(e) => {
            error!(error = %e, "content hash");
            HASH_ERROR.to_string()
        }
    }
}

fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    serde_json::to_vec(&v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn equal_inputs_hash_equal() {
        let a = content_hash(&("abc", 1, vec!["x", "y"]));
        let b = content_hash(&("abc", 1, vec!["x", "y"]));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(a, a.to_lowercase());
    }

    #[test]
    fn different_inputs_hash_different() {
        assert_ne!(content_hash(&("abc",)), content_hash(&("abd",)));
        assert_ne!(content_hash(&("abc",)), content_hash(&("abc", "")));
    }

    #[test]
    fn map_insertion_order_does_not_matter() {
        let mut m1 = HashMap::new();
        m1.insert("a", 1);
        m1.insert("b", 2);
        m1.insert("c", 3);
        let mut m2 = HashMap::new();
        m2.insert("c", 3);
        m2.insert("a", 1);
        m2.insert("b", 2);
        assert_eq!(content_hash(&m1), content_hash(&m2));
    }

    #[test]
    fn unhashable_input_yields_sentinel() {
        // Maps with non-string keys cannot become JSON objects.
        let mut weird = HashMap::new();
        weird.insert(vec![1u8], "x");
        assert_eq!(content_hash(&weird), HASH_ERROR);
    }
}
