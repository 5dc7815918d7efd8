//! Configuration system for Credential Guard
//!
//! This module provides configuration management with TOML file parsing and
//! environment variable override support. The master key is only ever taken
//! from the environment.

use crate::crypto::MIN_PBKDF2_ITERATIONS;
use crate::error::{CryptoError, GuardError, Result};
use crate::security::RateLimiterConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable holding the master key
pub const MASTER_KEY_ENV: &str = "CREDENTIAL_GUARD_MASTER_KEY";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Encryption engine settings
    #[serde(default)]
    pub encryption: EncryptionConfig,
    /// Admission control settings
    #[serde(default)]
    pub rate_limit: RateLimiterConfig,
    /// Audit log settings
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Encryption engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// PBKDF2-HMAC-SHA256 iteration count
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: default_pbkdf2_iterations(),
        }
    }
}

fn default_pbkdf2_iterations() -> u32 {
    MIN_PBKDF2_ITERATIONS
}

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory holding active and rotated audit files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Rotation threshold for the active file in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Gzip level for rotated files (0-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    /// Retention used when the scheduler does not pass one explicitly
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            max_file_size: default_max_file_size(),
            compression_level: default_compression_level(),
            retention_days: default_retention_days(),
        }
    }
}

impl AuditConfig {
    /// Create an audit configuration rooted at `log_dir`
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            ..Default::default()
        }
    }

    /// Set the rotation threshold
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    /// Set the gzip level used for rotated files
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.log_dir.as_os_str().is_empty() {
            return Err(GuardError::Configuration(
                "Audit log directory cannot be empty".to_string(),
            ));
        }
        if self.max_file_size == 0 {
            return Err(GuardError::Configuration(
                "Audit max file size must be greater than 0".to_string(),
            ));
        }
        if self.compression_level > 9 {
            return Err(GuardError::Configuration(
                "Audit compression level must be between 0 and 9".to_string(),
            ));
        }
        if self.retention_days == 0 {
            return Err(GuardError::Configuration(
                "Audit retention days must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./audit-logs")
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_compression_level() -> u32 {
    6
}

fn default_retention_days() -> u32 {
    90
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GuardError::Configuration(format!("Failed to read config file: {}", e))
        })?;

        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text, then apply env overrides and validate
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default configuration with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Read the master key from the environment
    pub fn master_key(&self) -> Result<String> {
        match std::env::var(MASTER_KEY_ENV) {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => Err(CryptoError::MissingMasterKey.into()),
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Some(iterations) = env_parse("CREDENTIAL_GUARD_PBKDF2_ITERATIONS") {
            self.encryption.pbkdf2_iterations = iterations;
        }

        if let Some(enabled) = env_parse("CREDENTIAL_GUARD_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = enabled;
        }
        if let Some(max_requests) = env_parse("CREDENTIAL_GUARD_MAX_REQUESTS") {
            self.rate_limit.max_requests = max_requests;
        }
        if let Some(window_secs) = env_parse("CREDENTIAL_GUARD_WINDOW_SECS") {
            self.rate_limit.window_secs = window_secs;
        }
        if let Some(burst_limit) = env_parse("CREDENTIAL_GUARD_BURST_LIMIT") {
            self.rate_limit.burst_limit = burst_limit;
        }
        if let Some(cooldown_secs) = env_parse("CREDENTIAL_GUARD_COOLDOWN_SECS") {
            self.rate_limit.cooldown_secs = cooldown_secs;
        }

        if let Ok(dir) = std::env::var("CREDENTIAL_GUARD_AUDIT_LOG_DIR") {
            self.audit.log_dir = PathBuf::from(dir);
        }
        if let Some(size) = env_parse("CREDENTIAL_GUARD_AUDIT_MAX_FILE_SIZE") {
            self.audit.max_file_size = size;
        }
        if let Some(days) = env_parse("CREDENTIAL_GUARD_AUDIT_RETENTION_DAYS") {
            self.audit.retention_days = days;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.encryption.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(GuardError::Configuration(format!(
                "PBKDF2 iterations must be at least {}",
                MIN_PBKDF2_ITERATIONS
            )));
        }

        self.rate_limit
            .validate()
            .map_err(GuardError::Configuration)?;

        self.audit.validate()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}
