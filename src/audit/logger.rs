//! Append-only audit log with size-based rotation
//!
//! Events are appended as JSON lines to a single active file. A writer lock
//! serializes appends, so lines never interleave and the rotation decision is
//! atomic with the write that follows it. Rotated files are gzip-compressed on
//! the blocking pool while new events go to the fresh active file.

use crate::audit::archive::{compress_file, AuditArchive, ACTIVE_EXTENSION, FILE_PREFIX};
use crate::audit::event::{AuditEvent, AuditEventType, RequestContext, Severity};
use crate::audit::search::SearchQuery;
use crate::config::AuditConfig;
use crate::error::{GuardError, Result};
use crate::metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SYSTEM_USER: &str = "system";

/// Running totals since process start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditMetrics {
    pub total_events: u64,
    pub events_by_type: BTreeMap<String, u64>,
    pub events_by_severity: BTreeMap<String, u64>,
    pub write_failures: u64,
    pub rotations: u64,
    /// Lines skipped by searches because they did not parse
    pub malformed_lines: u64,
    pub active_file: PathBuf,
    pub active_file_size: u64,
}

#[derive(Debug, Default)]
struct EventCounts {
    total: u64,
    by_type: BTreeMap<AuditEventType, u64>,
    by_severity: BTreeMap<Severity, u64>,
}

struct ActiveFile {
    path: PathBuf,
    file: File,
    size: u64,
}

/// Durable audit trail with rotation, retention and search
pub struct AuditLogger {
    config: AuditConfig,
    archive: AuditArchive,
    active: Mutex<ActiveFile>,
    compressions: Mutex<Vec<JoinHandle<()>>>,
    counts: RwLock<EventCounts>,
    write_failures: AtomicU64,
    rotations: AtomicU64,
}

impl AuditLogger {
    /// Create the log directory if needed and open a fresh active file
    pub async fn new(config: AuditConfig) -> Result<Self> {
        let archive = AuditArchive::open(&config)?;
        tokio::fs::create_dir_all(&config.log_dir).await?;
        let active = open_active_file(&config.log_dir).await?;
        info!(path = %active.path.display(), "Audit log opened");

        Ok(Self {
            config,
            archive,
            active: Mutex::new(active),
            compressions: Mutex::new(Vec::new()),
            counts: RwLock::new(EventCounts::default()),
            write_failures: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Append an event, returning the error instead of swallowing it
    pub async fn try_log_event(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        {
            let mut active = self.active.lock().await;
            if active.size >= self.config.max_file_size {
                self.rotate(&mut active).await?;
            }
            active.file.write_all(&line).await?;
            active.file.flush().await?;
            active.size += line.len() as u64;
        }

        let mut counts = self.counts.write().await;
        counts.total += 1;
        *counts.by_type.entry(event.event_type).or_insert(0) += 1;
        *counts.by_severity.entry(event.severity).or_insert(0) += 1;
        drop(counts);

        metrics::AUDIT_EVENTS
            .with_label_values(&[event.event_type.as_str()])
            .inc();
        Ok(())
    }

    /// Append an event on a best-effort basis
    ///
    /// A failed write is reported through tracing and counted, never
    /// propagated, so it cannot abort the operation being audited. Returns the
    /// event id.
    pub async fn log_event(&self, event: AuditEvent) -> String {
        if let Err(e) = self.try_log_event(&event).await {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            metrics::AUDIT_WRITE_FAILURES.inc();
            error!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                provider = %event.provider,
                error = %e,
                "Failed to write audit event"
            );
        }
        event.event_id
    }

    async fn rotate(&self, active: &mut ActiveFile) -> Result<()> {
        let next = open_active_file(&self.config.log_dir).await?;
        let finished = std::mem::replace(active, next);

        if let Err(e) = finished.file.sync_all().await {
            warn!(path = %finished.path.display(), error = %e, "Failed to sync rotated audit file");
        }
        drop(finished.file);

        self.rotations.fetch_add(1, Ordering::Relaxed);
        metrics::AUDIT_ROTATIONS.inc();
        info!(
            rotated = %finished.path.display(),
            size = finished.size,
            active = %active.path.display(),
            "Rotated audit log"
        );

        self.queue_compression(finished.path).await;
        Ok(())
    }

    async fn queue_compression(&self, path: PathBuf) {
        let level = self.config.compression_level;
        let handle = tokio::task::spawn_blocking(move || match compress_file(&path, level) {
            Ok(archived) => debug!(path = %archived.display(), "Compressed rotated audit file"),
            Err(e) => error!(path = %path.display(), error = %e, "Failed to compress audit file"),
        });

        let mut compressions = self.compressions.lock().await;
        compressions.retain(|handle| !handle.is_finished());
        compressions.push(handle);
    }

    /// Wait until every queued compression has finished
    pub async fn wait_for_compressions(&self) {
        let handles = std::mem::take(&mut *self.compressions.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Audit compression task failed");
            }
        }
    }

    /// Events matching every filter in `query`, oldest file first
    ///
    /// See [`AuditArchive::search_events`].
    pub async fn search_events(&self, query: &SearchQuery) -> Result<Vec<AuditEvent>> {
        self.archive.search_events(query).await
    }

    /// Delete audit files last modified more than `retention_days` ago
    ///
    /// The active file is never deleted. Returns the number of files removed.
    pub async fn cleanup_old_logs(&self, retention_days: u32) -> Result<usize> {
        let active_path = self.active.lock().await.path.clone();
        self.archive.cleanup_except(retention_days, &active_path).await
    }

    /// Running totals accumulated since construction
    pub async fn get_metrics(&self) -> AuditMetrics {
        let (active_file, active_file_size) = {
            let active = self.active.lock().await;
            (active.path.clone(), active.size)
        };
        let counts = self.counts.read().await;

        AuditMetrics {
            total_events: counts.total,
            events_by_type: counts
                .by_type
                .iter()
                .map(|(kind, count)| (kind.as_str().to_string(), *count))
                .collect(),
            events_by_severity: counts
                .by_severity
                .iter()
                .map(|(severity, count)| (severity.as_str().to_string(), *count))
                .collect(),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            malformed_lines: self.archive.malformed_lines(),
            active_file,
            active_file_size,
        }
    }

    /// Write a synthetic low-severity event; healthy iff it lands
    pub async fn is_healthy(&self) -> bool {
        let probe = AuditEvent::new(
            AuditEventType::AccessGranted,
            SYSTEM_USER,
            "audit_health_check",
            Severity::Low,
        )
        .with_detail("health_check", true);

        match self.try_log_event(&probe).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Audit health check failed");
                false
            }
        }
    }

    pub async fn log_credential_created(
        &self,
        user_id: &str,
        provider: &str,
        credential_type: &str,
        context: &RequestContext,
    ) -> String {
        self.log_event(
            AuditEvent::new(AuditEventType::CredentialCreated, user_id, provider, Severity::High)
                .with_credential_type(credential_type)
                .with_context(context),
        )
        .await
    }

    pub async fn log_credential_updated(
        &self,
        user_id: &str,
        provider: &str,
        credential_type: &str,
        context: &RequestContext,
    ) -> String {
        self.log_event(
            AuditEvent::new(AuditEventType::CredentialUpdated, user_id, provider, Severity::High)
                .with_credential_type(credential_type)
                .with_context(context),
        )
        .await
    }

    pub async fn log_credential_deleted(
        &self,
        user_id: &str,
        provider: &str,
        credential_type: &str,
        context: &RequestContext,
    ) -> String {
        self.log_event(
            AuditEvent::new(AuditEventType::CredentialDeleted, user_id, provider, Severity::High)
                .with_credential_type(credential_type)
                .with_context(context),
        )
        .await
    }

    /// Validation outcome: low severity when valid, medium otherwise
    pub async fn log_credential_validated(
        &self,
        user_id: &str,
        provider: &str,
        credential_type: &str,
        valid: bool,
        context: &RequestContext,
    ) -> String {
        let severity = if valid { Severity::Low } else { Severity::Medium };
        self.log_event(
            AuditEvent::new(AuditEventType::CredentialValidated, user_id, provider, severity)
                .with_credential_type(credential_type)
                .with_detail("valid", valid)
                .with_context(context),
        )
        .await
    }

    pub async fn log_credential_encrypted(
        &self,
        user_id: &str,
        provider: &str,
        context: &RequestContext,
    ) -> String {
        self.log_event(
            AuditEvent::new(AuditEventType::CredentialEncrypted, user_id, provider, Severity::Low)
                .with_context(context),
        )
        .await
    }

    pub async fn log_credential_decrypted(
        &self,
        user_id: &str,
        provider: &str,
        context: &RequestContext,
    ) -> String {
        self.log_event(
            AuditEvent::new(
                AuditEventType::CredentialDecrypted,
                user_id,
                provider,
                Severity::Medium,
            )
            .with_context(context),
        )
        .await
    }

    pub async fn log_rate_limit_exceeded(
        &self,
        user_id: &str,
        provider: &str,
        retry_after: Option<Duration>,
        context: &RequestContext,
    ) -> String {
        let mut event =
            AuditEvent::new(AuditEventType::RateLimitExceeded, user_id, provider, Severity::Medium)
                .with_context(context);
        if let Some(retry_after) = retry_after {
            event = event.with_detail("retry_after_secs", retry_after.as_secs_f64());
        }
        self.log_event(event).await
    }

    pub async fn log_anomaly_detected(
        &self,
        user_id: &str,
        provider: &str,
        description: &str,
        context: &RequestContext,
    ) -> String {
        self.log_event(
            AuditEvent::new(AuditEventType::AnomalyDetected, user_id, provider, Severity::High)
                .with_detail("description", description)
                .with_context(context),
        )
        .await
    }

    pub async fn log_provider_blocked(
        &self,
        provider: &str,
        cooldown: Duration,
        reason: &str,
        context: &RequestContext,
    ) -> String {
        self.log_event(
            AuditEvent::new(AuditEventType::ProviderBlocked, SYSTEM_USER, provider, Severity::High)
                .with_detail("cooldown_secs", cooldown.as_secs())
                .with_detail("reason", reason)
                .with_context(context),
        )
        .await
    }

    pub async fn log_provider_unblocked(
        &self,
        user_id: &str,
        provider: &str,
        context: &RequestContext,
    ) -> String {
        self.log_event(
            AuditEvent::new(
                AuditEventType::ProviderUnblocked,
                user_id,
                provider,
                Severity::Medium,
            )
            .with_context(context),
        )
        .await
    }

    pub async fn log_access_granted(
        &self,
        user_id: &str,
        provider: &str,
        context: &RequestContext,
    ) -> String {
        self.log_event(
            AuditEvent::new(AuditEventType::AccessGranted, user_id, provider, Severity::Low)
                .with_context(context),
        )
        .await
    }

    pub async fn log_access_denied(
        &self,
        user_id: &str,
        provider: &str,
        reason: &str,
        context: &RequestContext,
    ) -> String {
        self.log_event(
            AuditEvent::new(AuditEventType::AccessDenied, user_id, provider, Severity::Medium)
                .with_detail("reason", reason)
                .with_context(context),
        )
        .await
    }
}

/// Open a new, uniquely named active file stamped with the current time
async fn open_active_file(dir: &Path) -> Result<ActiveFile> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%6f").to_string();

    for attempt in 0..100u32 {
        let name = if attempt == 0 {
            format!("{}{}{}", FILE_PREFIX, stamp, ACTIVE_EXTENSION)
        } else {
            // '_' sorts after '.', keeping name order equal to creation order
            format!("{}{}_{:02}{}", FILE_PREFIX, stamp, attempt, ACTIVE_EXTENSION)
        };
        let path = dir.join(name);

        match OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok(ActiveFile { path, file, size: 0 }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(GuardError::Audit(format!(
        "could not allocate a new audit file name in {}",
        dir.display()
    )))
}
