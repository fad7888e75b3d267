//! Hashing utilities for minivol
//!
//! - BLAKE3 for content checksums and ETags
//! - SHA-256 for certificate fingerprints and API key digests

use blake3::Hasher;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Compute BLAKE3 hash incrementally (for streaming)
pub struct Blake3Hasher {
    hasher: Hasher,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> String {
        let hash = self.hasher.finalize();
        format!("{}", hash)
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// ETag over a serializable tuple of the mutable fields of a resource
pub fn etag<T: Serialize>(fields: &T) -> crate::Result<String> {
    let encoded = serde_json::to_vec(fields)?;
    Ok(blake3_hash(&encoded))
}

/// Lowercase hex SHA-256
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
