//! Cache keys shared by the memory and disk tiers

use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic identity of a decoded image
///
/// A key is the concatenation of the canonical source identity, an optional
/// `"{w}x{h}"` size suffix and an optional transformation key. Two requests
/// with equal keys are expected to produce the same pixels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-composed key string
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Compose a key from its three components
    pub fn compose(
        source_identity: &str,
        override_size: Option<(u32, u32)>,
        transform_key: Option<&str>,
    ) -> Self {
        let mut key = String::with_capacity(source_identity.len() + 16);
        key.push_str(source_identity);
        if let Some((width, height)) = override_size {
            key.push_str(&format!("{}x{}", width, height));
        }
        if let Some(transform) = transform_key {
            key.push_str(transform);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex-encoded SHA-256 digest of the key, used as the disk file name
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}
