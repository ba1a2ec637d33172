//! Asymmetric decryption of message contents.
//!
//! The crypto unit is a thin wrapper over an RSA private key. Actual
//! decryption is CPU-bound and runs on the blocking thread pool, gated by
//! [`CryptoPool`] so a burst of encrypted messages cannot monopolise it.

pub mod cache;
pub mod pipeline;

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("no private key configured")]
    NoKey,

    #[error("invalid private key: {0}")]
    KeyParse(#[from] rsa::pkcs8::Error),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("rsa decryption failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("plaintext is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("decryption task failed: {0}")]
    Offload(String),
}

/// Wraps the configured RSA private key. One ciphertext in, one plaintext
/// out; safe to share and call concurrently from multiple pipeline tasks.
#[derive(Clone)]
pub struct Decryptor {
    key: RsaPrivateKey,
}

impl Decryptor {
    /// Build a decryptor from the key material carried in the configuration
    /// source: either a PEM-armored PKCS#8 key or its bare base64 DER body
    /// (the armor and line breaks are commonly stripped before the key is
    /// stored in a JSON file).
    pub fn from_key_material(material: &str) -> Result<Self, DecryptError> {
        let trimmed = material.trim();
        let key = if trimmed.contains("BEGIN") {
            RsaPrivateKey::from_pkcs8_pem(trimmed)?
        } else {
            let compact: String = trimmed.split_whitespace().collect();
            let der = BASE64.decode(compact.as_bytes())?;
            RsaPrivateKey::from_pkcs8_der(&der)?
        };
        Ok(Self { key })
    }

    /// OAEP with SHA-256 for both the message digest and the MGF1 mask.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        Ok(self.key.decrypt(Oaep::new::<Sha256>(), ciphertext)?)
    }
}

impl From<RsaPrivateKey> for Decryptor {
    fn from(key: RsaPrivateKey) -> Self {
        Self { key }
    }
}

impl fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print key material
        f.debug_struct("Decryptor").finish_non_exhaustive()
    }
}

/// Bounded pool for offloading CPU-bound decryption to blocking threads.
///
/// The permit count caps how many decryptions run at once across all
/// requests; waiting for a permit is the pipeline's backpressure point.
pub struct CryptoPool {
    permits: Arc<Semaphore>,
}

impl CryptoPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Sized to the machine: one worker per available core.
    pub fn default_size() -> usize {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(2)
    }

    pub async fn run<T, F>(&self, job: F) -> Result<T, DecryptError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DecryptError::Offload("worker pool closed".into()))?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|err| DecryptError::Offload(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;

    fn test_key() -> RsaPrivateKey {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, 1024).expect("generate test key")
    }

    fn encrypt_with(key: &RsaPrivateKey, plaintext: &[u8]) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        key.to_public_key()
            .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
            .expect("encrypt test payload")
    }

    #[test]
    fn decrypts_what_the_public_key_encrypted() {
        let key = test_key();
        let ciphertext = encrypt_with(&key, b"hello");
        let decryptor = Decryptor::from(key);
        assert_eq!(decryptor.decrypt(&ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn parses_bare_base64_der_key_material() {
        let key = test_key();
        let der = key.to_pkcs8_der().unwrap();
        let material = BASE64.encode(der.as_bytes());

        let decryptor = Decryptor::from_key_material(&material).unwrap();
        let ciphertext = encrypt_with(&key, b"roundtrip");
        assert_eq!(decryptor.decrypt(&ciphertext).unwrap(), b"roundtrip");
    }

    #[test]
    fn parses_pem_armored_key_material() {
        let key = test_key();
        let pem = key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();

        let decryptor = Decryptor::from_key_material(&pem).unwrap();
        let ciphertext = encrypt_with(&key, b"pem");
        assert_eq!(decryptor.decrypt(&ciphertext).unwrap(), b"pem");
    }

    #[test]
    fn rejects_garbage_key_material() {
        assert!(Decryptor::from_key_material("not a key").is_err());
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let ciphertext = encrypt_with(&test_key(), b"secret");
        let other = Decryptor::from(test_key());
        assert!(matches!(
            other.decrypt(&ciphertext),
            Err(DecryptError::Rsa(_))
        ));
    }

    #[tokio::test]
    async fn pool_runs_jobs_and_returns_results() {
        let pool = CryptoPool::new(2);
        let out = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(out, 42);
    }
}
