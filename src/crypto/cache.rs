//! Content-addressed plaintext cache.
//!
//! A ciphertext string is hashed once; repeated occurrences of the same
//! ciphertext are served from here without touching the crypto unit. Entries
//! are immutable once inserted and are never evicted.

use dashmap::DashMap;
use sha2::{Digest as _, Sha256};

/// SHA-256 of the full marked ciphertext string.
pub type ContentDigest = [u8; 32];

pub fn content_digest(content: &str) -> ContentDigest {
    Sha256::digest(content.as_bytes()).into()
}

#[derive(Default)]
pub struct DecryptCache {
    entries: DashMap<ContentDigest, String>,
}

impl DecryptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, digest: &ContentDigest) -> Option<String> {
        self.entries.get(digest).map(|entry| entry.clone())
    }

    /// First write wins: a digest never changes its mapped plaintext.
    pub fn insert(&self, digest: ContentDigest, plaintext: String) {
        self.entries.entry(digest).or_insert(plaintext);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(content_digest("ENC:abc"), content_digest("ENC:abc"));
        assert_ne!(content_digest("ENC:abc"), content_digest("ENC:abd"));
    }

    #[test]
    fn insert_then_get() {
        let cache = DecryptCache::new();
        let digest = content_digest("ENC:payload");
        assert!(cache.get(&digest).is_none());

        cache.insert(digest, "plain".into());
        assert_eq!(cache.get(&digest).as_deref(), Some("plain"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn first_insert_wins() {
        let cache = DecryptCache::new();
        let digest = content_digest("ENC:payload");
        cache.insert(digest, "first".into());
        cache.insert(digest, "second".into());
        assert_eq!(cache.get(&digest).as_deref(), Some("first"));
    }
}
