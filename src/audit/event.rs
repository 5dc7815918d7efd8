//! Audit event schema
//!
//! Field names and the string tables for `event_type` and `severity` are the
//! on-disk contract; historical files must stay readable, so entries are only
//! ever added to these tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Version of the event schema written by this build
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Kind of security-relevant operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuditEventType {
    CredentialCreated,
    CredentialUpdated,
    CredentialDeleted,
    CredentialValidated,
    CredentialEncrypted,
    CredentialDecrypted,
    RateLimitExceeded,
    AnomalyDetected,
    AccessGranted,
    AccessDenied,
    ProviderBlocked,
    ProviderUnblocked,
}

impl AuditEventType {
    /// Every event type, in schema order
    pub const ALL: [AuditEventType; 12] = [
        AuditEventType::CredentialCreated,
        AuditEventType::CredentialUpdated,
        AuditEventType::CredentialDeleted,
        AuditEventType::CredentialValidated,
        AuditEventType::CredentialEncrypted,
        AuditEventType::CredentialDecrypted,
        AuditEventType::RateLimitExceeded,
        AuditEventType::AnomalyDetected,
        AuditEventType::AccessGranted,
        AuditEventType::AccessDenied,
        AuditEventType::ProviderBlocked,
        AuditEventType::ProviderUnblocked,
    ];

    /// Get event name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::CredentialCreated => "credential_created",
            AuditEventType::CredentialUpdated => "credential_updated",
            AuditEventType::CredentialDeleted => "credential_deleted",
            AuditEventType::CredentialValidated => "credential_validated",
            AuditEventType::CredentialEncrypted => "credential_encrypted",
            AuditEventType::CredentialDecrypted => "credential_decrypted",
            AuditEventType::RateLimitExceeded => "rate_limit_exceeded",
            AuditEventType::AnomalyDetected => "anomaly_detected",
            AuditEventType::AccessGranted => "access_granted",
            AuditEventType::AccessDenied => "access_denied",
            AuditEventType::ProviderBlocked => "provider_blocked",
            AuditEventType::ProviderUnblocked => "provider_unblocked",
        }
    }
}

/// Event severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Unrecognised string for a closed enumeration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl FromStr for AuditEventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|variant| variant.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "event type",
                value: s.to_string(),
            })
    }
}

impl FromStr for Severity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|variant| variant.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "severity",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AuditEventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuditEventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Caller attribution passed through unchanged from the request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

fn current_schema_version() -> u32 {
    EVENT_SCHEMA_VERSION
}

/// One immutable audit record, stored as a single JSON line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,
    pub event_id: String,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AuditEvent {
    /// Create an event with a fresh id and the current time
    pub fn new(
        event_type: AuditEventType,
        user_id: impl Into<String>,
        provider: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            event_id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            user_id: user_id.into(),
            provider: provider.into(),
            credential_type: None,
            severity,
            details: BTreeMap::new(),
            ip_address: None,
            user_agent: None,
            session_id: None,
            correlation_id: None,
        }
    }

    pub fn with_credential_type(mut self, credential_type: impl Into<String>) -> Self {
        self.credential_type = Some(credential_type.into());
        self
    }

    /// Add one entry to `details`
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_details(mut self, details: BTreeMap<String, Value>) -> Self {
        self.details.extend(details);
        self
    }

    /// Copy caller attribution onto the event
    pub fn with_context(mut self, context: &RequestContext) -> Self {
        self.ip_address = context.ip_address.clone();
        self.user_agent = context.user_agent.clone();
        self.session_id = context.session_id.clone();
        self.correlation_id = context.correlation_id.clone();
        self
    }
}
