//! Audit trail for credential operations
//!
//! This module provides:
//! - The on-disk event schema (one JSON object per line)
//! - An append-only logger with size-based rotation and gzip archival
//! - Filtered search and retention cleanup over the log directory, usable
//!   without opening a log for writing

pub mod archive;
pub mod event;
pub mod logger;
pub mod search;

pub use archive::AuditArchive;
pub use event::{AuditEvent, AuditEventType, RequestContext, Severity, EVENT_SCHEMA_VERSION};
pub use logger::{AuditLogger, AuditMetrics};
pub use search::{SearchQuery, DEFAULT_SEARCH_LIMIT};
