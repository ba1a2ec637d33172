//! Per-message decryption fan-out.
//!
//! Every message content becomes one task (encrypted contents go through
//! the cache and the worker pool, plain contents complete immediately) and
//! the results are joined back in input order. A failed decryption degrades
//! to the original ciphertext string; it never fails the request.

use futures_util::future::join_all;
use tracing::{debug, warn};

use super::cache::{content_digest, DecryptCache};
use super::{CryptoPool, DecryptError, Decryptor};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Marker prefixing base64 ciphertext in a message content.
pub const ENC_MARKER: &str = "ENC:";

pub fn is_encrypted(content: &str) -> bool {
    content.starts_with(ENC_MARKER)
}

pub struct DecryptPipeline {
    cache: DecryptCache,
    pool: CryptoPool,
}

impl DecryptPipeline {
    pub fn new(workers: usize) -> Self {
        Self {
            cache: DecryptCache::new(),
            pool: CryptoPool::new(workers),
        }
    }

    pub fn cache(&self) -> &DecryptCache {
        &self.cache
    }

    /// Resolve the contents of one request, preserving length and order.
    ///
    /// `None` entries (messages without a textual content field) pass
    /// through untouched.
    pub async fn resolve_contents(
        &self,
        decryptor: Option<&Decryptor>,
        contents: Vec<Option<String>>,
    ) -> Vec<Option<String>> {
        let tasks = contents
            .into_iter()
            .map(|content| self.resolve_one(decryptor, content));
        join_all(tasks).await
    }

    async fn resolve_one(
        &self,
        decryptor: Option<&Decryptor>,
        content: Option<String>,
    ) -> Option<String> {
        match content {
            Some(text) if is_encrypted(&text) => {
                Some(self.resolve_encrypted(decryptor, text).await)
            }
            other => other,
        }
    }

    async fn resolve_encrypted(&self, decryptor: Option<&Decryptor>, content: String) -> String {
        let digest = content_digest(&content);
        if let Some(plaintext) = self.cache.get(&digest) {
            debug!("decryption cache hit");
            return plaintext;
        }

        match self.decrypt(decryptor, &content).await {
            Ok(plaintext) => {
                self.cache.insert(digest, plaintext.clone());
                plaintext
            }
            Err(err) => {
                warn!(error = %err, "decryption failed, forwarding content unchanged");
                content
            }
        }
    }

    async fn decrypt(
        &self,
        decryptor: Option<&Decryptor>,
        content: &str,
    ) -> Result<String, DecryptError> {
        let decryptor = decryptor.ok_or(DecryptError::NoKey)?.clone();
        let encoded = content.strip_prefix(ENC_MARKER).unwrap_or(content);
        let ciphertext = BASE64.decode(encoded.trim().as_bytes())?;

        let plaintext = self
            .pool
            .run(move || decryptor.decrypt(&ciphertext))
            .await??;
        Ok(String::from_utf8(plaintext)?)
    }
}
