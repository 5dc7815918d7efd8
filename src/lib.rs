//! Credential Guard
//!
//! Security subsystem for stored provider credentials: authenticated
//! encryption at rest, per-provider admission control with anomaly blocking,
//! and a durable, searchable audit trail.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod security;
pub mod services;

pub use audit::{AuditEvent, AuditEventType, AuditLogger, RequestContext, SearchQuery, Severity};
pub use config::Config;
pub use crypto::EncryptionEngine;
pub use error::{CryptoError, GuardError, Result};
pub use security::{AdmissionController, AdmissionResult, RateLimiterConfig};
pub use services::{HealthReport, SecurityServices};
