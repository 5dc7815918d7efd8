//! Authenticated encryption of credential strings
//!
//! Every call to [`EncryptionEngine::encrypt`] draws a fresh salt and nonce,
//! stretches the master key with PBKDF2-HMAC-SHA256 and seals the plaintext
//! with AES-256-GCM. The resulting blob is self-describing:
//!
//! ```text
//! base64( salt[32] || nonce[12] || tag[16] || ciphertext )
//! ```
//!
//! so any engine holding the same master key can open it without a lookup.

use crate::error::CryptoError;
use crate::metrics;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD as Base64Engine;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Size of the PBKDF2 salt in bytes
pub const SALT_SIZE: usize = 32;

/// Size of AES-GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Smallest decoded blob that can be authenticated
pub const MIN_PAYLOAD_SIZE: usize = SALT_SIZE + NONCE_SIZE + TAG_SIZE;

/// Minimum accepted master key length in bytes
pub const MIN_MASTER_KEY_LEN: usize = 32;

/// Minimum PBKDF2 iteration count accepted
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

const HEALTH_CHECK_PROBE: &str = "credential-guard-health-probe";

/// Snapshot of engine activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityMetrics {
    pub encryption_count: u64,
    pub decryption_count: u64,
    pub failure_count: u64,
    pub pbkdf2_iterations: u32,
    pub algorithm: &'static str,
    pub key_derivation: &'static str,
}

/// AES-256-GCM engine keyed by a process-wide master key
pub struct EncryptionEngine {
    master_key: Zeroizing<Vec<u8>>,
    iterations: u32,
    encryption_count: AtomicU64,
    decryption_count: AtomicU64,
    failure_count: AtomicU64,
}

impl fmt::Debug for EncryptionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionEngine")
            .field("master_key", &"<redacted>")
            .field("iterations", &self.iterations)
            .finish()
    }
}

impl EncryptionEngine {
    /// Create an engine with the minimum iteration count
    pub fn new(master_key: &str) -> Result<Self, CryptoError> {
        Self::with_iterations(master_key, MIN_PBKDF2_ITERATIONS)
    }

    /// Create an engine with an explicit PBKDF2 iteration count
    pub fn with_iterations(master_key: &str, iterations: u32) -> Result<Self, CryptoError> {
        if master_key.is_empty() {
            return Err(CryptoError::MissingMasterKey);
        }
        if master_key.len() < MIN_MASTER_KEY_LEN {
            return Err(CryptoError::WeakMasterKey {
                len: master_key.len(),
            });
        }
        if iterations < MIN_PBKDF2_ITERATIONS {
            return Err(CryptoError::KeyDerivation(format!(
                "iteration count {} is below the minimum of {}",
                iterations, MIN_PBKDF2_ITERATIONS
            )));
        }

        Ok(Self {
            master_key: Zeroizing::new(master_key.as_bytes().to_vec()),
            iterations,
            encryption_count: AtomicU64::new(0),
            decryption_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        })
    }

    /// Encrypt a secret, returning a base64 blob
    ///
    /// `context` only labels metrics and logs; it is not bound into the
    /// ciphertext.
    pub fn encrypt(&self, plaintext: &str, context: &str) -> Result<String, CryptoError> {
        match self.seal(plaintext) {
            Ok(blob) => {
                self.encryption_count.fetch_add(1, Ordering::Relaxed);
                metrics::ENCRYPTIONS.with_label_values(&[context]).inc();
                debug!(context, "Encrypted credential");
                Ok(blob)
            }
            Err(e) => {
                self.record_failure("encrypt", context, &e);
                Err(e)
            }
        }
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt)
    ///
    /// Never returns unauthenticated plaintext: any tag mismatch yields
    /// [`CryptoError::Integrity`].
    pub fn decrypt(&self, blob: &str, context: &str) -> Result<String, CryptoError> {
        match self.open(blob) {
            Ok(plaintext) => {
                self.decryption_count.fetch_add(1, Ordering::Relaxed);
                metrics::DECRYPTIONS.with_label_values(&[context]).inc();
                debug!(context, "Decrypted credential");
                Ok(plaintext)
            }
            Err(e) => {
                self.record_failure("decrypt", context, &e);
                Err(e)
            }
        }
    }

    /// Encrypt every entry independently; failed entries are left out
    pub fn encrypt_batch(
        &self,
        entries: &HashMap<String, String>,
        context: &str,
    ) -> HashMap<String, String> {
        entries
            .iter()
            .filter_map(|(name, value)| match self.encrypt(value, context) {
                Ok(blob) => Some((name.clone(), blob)),
                Err(_) => {
                    debug!(context, entry = %name, "Dropping batch entry that failed to encrypt");
                    None
                }
            })
            .collect()
    }

    /// Decrypt every entry independently; failed entries are left out
    pub fn decrypt_batch(
        &self,
        entries: &HashMap<String, String>,
        context: &str,
    ) -> HashMap<String, String> {
        entries
            .iter()
            .filter_map(|(name, blob)| match self.decrypt(blob, context) {
                Ok(plaintext) => Some((name.clone(), plaintext)),
                Err(_) => {
                    debug!(context, entry = %name, "Dropping batch entry that failed to decrypt");
                    None
                }
            })
            .collect()
    }

    /// Current counters and algorithm parameters
    pub fn security_metrics(&self) -> SecurityMetrics {
        SecurityMetrics {
            encryption_count: self.encryption_count.load(Ordering::Relaxed),
            decryption_count: self.decryption_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            pbkdf2_iterations: self.iterations,
            algorithm: "AES-256-GCM",
            key_derivation: "PBKDF2-HMAC-SHA256",
        }
    }

    /// Round-trip a fixed probe string
    pub fn is_healthy(&self) -> bool {
        let result = self
            .encrypt(HEALTH_CHECK_PROBE, "health_check")
            .and_then(|blob| self.decrypt(&blob, "health_check"));

        match result {
            Ok(plaintext) => plaintext == HEALTH_CHECK_PROBE,
            Err(e) => {
                warn!(error = %e, "Encryption health check failed");
                false
            }
        }
    }

    fn record_failure(&self, operation: &str, context: &str, error: &CryptoError) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        metrics::CRYPTO_FAILURES
            .with_label_values(&[operation])
            .inc();
        warn!(context, operation, error = %error, "Credential {} failed", operation);
    }

    fn derive_key(&self, salt: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        pbkdf2_hmac::<Sha256>(&self.master_key, salt, self.iterations, &mut key[..]);
        key
    }

    fn cipher_for(&self, salt: &[u8]) -> Result<Aes256Gcm, CryptoError> {
        let key = self.derive_key(salt);
        Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
    }

    fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.trim().is_empty() {
            return Err(CryptoError::EmptyInput);
        }

        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = self.cipher_for(&salt)?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption("AES-GCM seal failed".to_string()))?;

        // aes-gcm appends the tag; the wire format carries it ahead of the ciphertext
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        let mut payload = Vec::with_capacity(MIN_PAYLOAD_SIZE + ciphertext.len());
        payload.extend_from_slice(&salt);
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(tag);
        payload.extend_from_slice(ciphertext);

        Ok(Base64Engine.encode(payload))
    }

    fn open(&self, blob: &str) -> Result<String, CryptoError> {
        let blob = blob.trim();
        if blob.is_empty() {
            return Err(CryptoError::EmptyInput);
        }

        let payload = Base64Engine
            .decode(blob)
            .map_err(|_| CryptoError::InvalidEncoding)?;
        if payload.len() < MIN_PAYLOAD_SIZE {
            return Err(CryptoError::MalformedPayload { len: payload.len() });
        }

        let (salt, rest) = payload.split_at(SALT_SIZE);
        let (nonce, rest) = rest.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let cipher = self.cipher_for(salt)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), sealed.as_slice())
                .map_err(|_| CryptoError::Integrity)?,
        );

        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::MalformedPayload {
            len: payload.len(),
        })
    }
}
