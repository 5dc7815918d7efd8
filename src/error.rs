//! Error types for Credential Guard
//!
//! This module defines all error types that can occur in the credential
//! security subsystem. Admission denials are not errors; they are reported
//! through `AdmissionResult`.

use thiserror::Error;

/// Errors raised by the encryption engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Plaintext or blob was empty (or whitespace only)
    #[error("Input must not be empty")]
    EmptyInput,

    /// Blob is not valid base64
    #[error("Payload is not valid base64")]
    InvalidEncoding,

    /// Blob decoded but is shorter than salt + nonce + tag
    #[error("Malformed payload: {len} bytes after decoding")]
    MalformedPayload { len: usize },

    /// Authentication tag did not verify (tampering, wrong key or corruption)
    #[error("Integrity check failed: payload was tampered with or encrypted under a different key")]
    Integrity,

    /// No master key was supplied at construction
    #[error("Master key is not configured")]
    MissingMasterKey,

    /// Master key is too short to carry 256 bits of entropy
    #[error("Master key too short: {len} bytes, at least 32 required")]
    WeakMasterKey { len: usize },

    /// Key derivation failed
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Cipher failure while sealing
    #[error("Encryption error: {0}")]
    Encryption(String),
}

impl CryptoError {
    /// Whether the caller handed over unusable input
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            CryptoError::EmptyInput
                | CryptoError::InvalidEncoding
                | CryptoError::MalformedPayload { .. }
        )
    }

    /// Whether the payload failed authentication
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, CryptoError::Integrity)
    }
}

/// Main error type for Credential Guard operations
#[derive(Error, Debug)]
pub enum GuardError {
    /// Encryption engine errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration errors (parsing, validation)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Audit log errors other than raw IO
    #[error("Audit error: {0}")]
    Audit(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for other cases
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        GuardError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GuardError {
    fn from(err: toml::de::Error) -> Self {
        GuardError::Configuration(err.to_string())
    }
}

/// Type alias for Results using GuardError
pub type Result<T> = std::result::Result<T, GuardError>;
