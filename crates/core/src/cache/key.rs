//! Deterministic cache-key derivation
//!
//! A key is a SHA-256 digest over the endpoint path plus the parameter map
//! with keys sorted lexicographically, so two requests that differ only in
//! parameter insertion order map to the same key while semantically
//! different requests cannot collide short of a digest collision.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

/// Opaque cache key derived from a request signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// The namespaced store key for the distributed tier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the cache key for an endpoint and parameter map
///
/// Parameters are folded in sorted order with explicit separators so that
/// `("a", "bc")` and `("ab", "c")` hash differently.
pub fn derive_key<I, K, V>(endpoint: &str, params: I) -> CacheKey
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let sorted: BTreeMap<String, String> = params
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update([0u8]);
    for (k, v) in &sorted {
        hasher.update(k.as_bytes());
        hasher.update([0x1e]);
        hasher.update(v.as_bytes());
        hasher.update([0x1f]);
    }

    CacheKey(format!("fetchguard:cache:{}", hex::encode(hasher.finalize())))
}
