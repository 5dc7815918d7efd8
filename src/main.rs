//! Credential Guard - operator CLI
//!
//! Encrypts and decrypts credentials through admission control, searches and
//! prunes the audit trail, and reports component health and metrics.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use credential_guard::audit::{AuditArchive, AuditEventType, RequestContext, SearchQuery, Severity};
use credential_guard::config::Config;
use credential_guard::logging::{generate_correlation_id, init_logging, LogConfig, LogFormat};
use credential_guard::metrics;
use credential_guard::security::DenialReason;
use credential_guard::SecurityServices;
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn, Level};

/// Credential Guard - credential encryption, admission control and audit
#[derive(Parser, Debug)]
#[command(name = "credential-guard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Credential security toolkit", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: Level,

    /// Emit diagnostics as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encrypt a credential and print the blob
    Encrypt {
        /// Provider the credential belongs to
        #[arg(long)]
        context: String,
        /// User recorded in the audit trail
        #[arg(long, default_value = "cli")]
        user: String,
        value: String,
    },
    /// Decrypt a blob and print the credential
    Decrypt {
        /// Provider the credential belongs to
        #[arg(long)]
        context: String,
        /// User recorded in the audit trail
        #[arg(long, default_value = "cli")]
        user: String,
        blob: String,
    },
    /// Search the audit trail
    Search {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        severity: Option<Severity>,
        /// May be repeated; matches any of the given types
        #[arg(long = "event-type")]
        event_types: Vec<AuditEventType>,
        /// RFC 3339 lower bound
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// RFC 3339 upper bound
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long)]
        limit: Option<usize>,
        /// Also scan compressed, rotated files
        #[arg(long)]
        include_archived: bool,
    },
    /// Delete audit files older than the retention period
    Cleanup {
        /// Overrides the configured retention
        #[arg(long)]
        retention_days: Option<u32>,
    },
    /// Run every component health check
    Health,
    /// Print component metrics
    Metrics {
        /// Print the Prometheus exposition instead of JSON
        #[arg(long)]
        prometheus: bool,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Console
    };
    let _guard = init_logging(LogConfig::new(cli.log_level, format))
        .context("Failed to initialize logging")?;

    let config = load_config(&cli)?;

    match cli.command {
        Command::Encrypt {
            context,
            user,
            value,
        } => {
            let services = SecurityServices::from_config(&config).await?;
            let request = RequestContext::new().with_correlation_id(generate_correlation_id());
            admit(&services, &user, &context, &request).await?;

            let outcome = services.encryption.encrypt(&value, &context);
            match outcome {
                Ok(blob) => {
                    services
                        .audit
                        .log_credential_encrypted(&user, &context, &request)
                        .await;
                    println!("{}", blob);
                }
                Err(e) => {
                    services
                        .audit
                        .log_access_denied(&user, &context, &e.to_string(), &request)
                        .await;
                    services.audit.wait_for_compressions().await;
                    bail!("Encryption failed: {}", e);
                }
            }
            services.audit.wait_for_compressions().await;
        }
        Command::Decrypt {
            context,
            user,
            blob,
        } => {
            let services = SecurityServices::from_config(&config).await?;
            let request = RequestContext::new().with_correlation_id(generate_correlation_id());
            admit(&services, &user, &context, &request).await?;

            let outcome = services.encryption.decrypt(&blob, &context);
            match outcome {
                Ok(plaintext) => {
                    services
                        .audit
                        .log_credential_decrypted(&user, &context, &request)
                        .await;
                    println!("{}", plaintext);
                }
                Err(e) => {
                    if e.is_integrity_failure() {
                        services
                            .audit
                            .log_anomaly_detected(&user, &context, "integrity check failed", &request)
                            .await;
                    }
                    services
                        .audit
                        .log_access_denied(&user, &context, &e.to_string(), &request)
                        .await;
                    services.audit.wait_for_compressions().await;
                    bail!("Decryption failed: {}", e);
                }
            }
            services.audit.wait_for_compressions().await;
        }
        Command::Search {
            provider,
            user,
            severity,
            event_types,
            since,
            until,
            limit,
            include_archived,
        } => {
            let mut query = SearchQuery::new().include_archived(include_archived);
            query.provider = provider;
            query.user_id = user;
            query.severity = severity;
            query.start_time = since;
            query.end_time = until;
            if !event_types.is_empty() {
                query = query.event_types(event_types);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }

            let archive = AuditArchive::open(&config.audit)?;
            for event in archive.search_events(&query).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::Cleanup { retention_days } => {
            let retention_days = retention_days.unwrap_or(config.audit.retention_days);
            let archive = AuditArchive::open(&config.audit)?;
            let removed = archive.cleanup_old_logs(retention_days).await?;
            info!(removed, retention_days, "Audit cleanup finished");
            println!("Removed {} audit file(s) older than {} day(s)", removed, retention_days);
        }
        Command::Health => {
            let services = SecurityServices::from_config(&config).await?;
            let report = services.health().await;
            services.audit.wait_for_compressions().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_healthy() {
                bail!("One or more components are unhealthy");
            }
        }
        Command::Metrics { prometheus } => {
            let services = SecurityServices::from_config(&config).await?;
            // Populate counters with one probe per component
            let report = services.health().await;
            services.audit.wait_for_compressions().await;

            if prometheus {
                print!("{}", metrics::gather_metrics());
            } else {
                let snapshot = json!({
                    "health": report,
                    "encryption": services.encryption.security_metrics(),
                    "admission": services.admission.get_metrics().await,
                    "audit": services.audit.get_metrics().await,
                });
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
        }
    }

    Ok(())
}

/// Load configuration from file or environment
fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            let path = path
                .to_str()
                .with_context(|| format!("Config path {:?} is not valid UTF-8", path))?;
            Ok(Config::from_file(path)?)
        }
        None => Ok(Config::from_env()?),
    }
}

/// Run the admission check for `provider`, auditing any denial
async fn admit(
    services: &SecurityServices,
    user: &str,
    provider: &str,
    request: &RequestContext,
) -> Result<()> {
    let result = services.admission.check_admission(provider, None).await;
    if result.allowed {
        services
            .audit
            .log_access_granted(user, provider, request)
            .await;
        return Ok(());
    }

    match result.reason {
        Some(DenialReason::RateLimitExceeded) => {
            services
                .audit
                .log_rate_limit_exceeded(user, provider, result.retry_after, request)
                .await;
        }
        Some(DenialReason::ProviderBlocked) | None => {
            services
                .audit
                .log_access_denied(user, provider, "provider blocked", request)
                .await;
        }
    }
    if result.anomaly_detected {
        services
            .audit
            .log_anomaly_detected(user, provider, "request burst", request)
            .await;
        services
            .audit
            .log_provider_blocked(
                provider,
                services.admission.config().cooldown(),
                "request burst",
                request,
            )
            .await;
    }

    warn!(provider, reason = ?result.reason, "Request denied");
    bail!(
        "Request for {} denied ({}), retry after {}s",
        provider,
        result.reason.map(|r| r.as_str()).unwrap_or("denied"),
        result.retry_after_secs().unwrap_or(0)
    )
}
