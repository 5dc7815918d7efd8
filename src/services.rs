//! Composition root for the security components
//!
//! The three components are independent; callers that want all of them
//! build a [`SecurityServices`] once and share it.

use crate::audit::AuditLogger;
use crate::config::Config;
use crate::crypto::EncryptionEngine;
use crate::error::{GuardError, Result};
use crate::metrics;
use crate::security::AdmissionController;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Health of each component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub encryption: bool,
    pub admission: bool,
    pub audit: bool,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.encryption && self.admission && self.audit
    }
}

/// Shared handles to the encryption engine, admission controller and audit log
#[derive(Clone)]
pub struct SecurityServices {
    pub encryption: Arc<EncryptionEngine>,
    pub admission: Arc<AdmissionController>,
    pub audit: Arc<AuditLogger>,
}

impl SecurityServices {
    /// Build every component from `config`, taking the master key from the environment
    pub async fn from_config(config: &Config) -> Result<Self> {
        let master_key = config.master_key()?;
        Self::with_master_key(config, &master_key).await
    }

    /// Build every component with an explicitly supplied master key
    pub async fn with_master_key(config: &Config, master_key: &str) -> Result<Self> {
        metrics::init_metrics();

        let encryption =
            EncryptionEngine::with_iterations(master_key, config.encryption.pbkdf2_iterations)?;
        let admission = AdmissionController::new(config.rate_limit.clone())
            .map_err(GuardError::Configuration)?;
        let audit = AuditLogger::new(config.audit.clone()).await?;

        info!(
            pbkdf2_iterations = config.encryption.pbkdf2_iterations,
            rate_limit_enabled = config.rate_limit.enabled,
            audit_dir = %config.audit.log_dir.display(),
            "Security services initialized"
        );

        Ok(Self {
            encryption: Arc::new(encryption),
            admission: Arc::new(admission),
            audit: Arc::new(audit),
        })
    }

    /// Run every component's health check
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            encryption: self.encryption.is_healthy(),
            admission: self.admission.is_healthy().await,
            audit: self.audit.is_healthy().await,
        }
    }

    pub async fn all_healthy(&self) -> bool {
        self.health().await.all_healthy()
    }
}
