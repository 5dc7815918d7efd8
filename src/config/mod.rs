//! Configuration module for the credential security subsystem
//!
//! This module contains the configuration system for the encryption engine,
//! admission controller and audit log.

mod settings;

pub use settings::{AuditConfig, Config, EncryptionConfig, MASTER_KEY_ENV};
