//! Diagnostic logging setup and correlation IDs
//!
//! Operational logs go through the tracing framework. This is the side
//! channel components use for their own diagnostics; the security audit
//! trail itself lives in `crate::audit`.
use std::io;
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable console output
    Console,
    /// JSON structured logs
    Json,
}

/// Log configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Directory for daily-rolling log files, if any
    pub log_dir: Option<PathBuf>,
    /// Log file prefix
    pub log_file_prefix: String,
    /// Enable console logging
    pub enable_console: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Console,
            log_dir: None,
            log_file_prefix: "credential-guard".to_string(),
            enable_console: true,
        }
    }
}

impl LogConfig {
    /// Create a new log configuration with custom settings
    pub fn new(level: Level, format: LogFormat) -> Self {
        Self {
            level,
            format,
            ..Default::default()
        }
    }

    /// Enable file logging with daily rotation
    pub fn with_file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    /// Set log file prefix
    pub fn with_file_prefix(mut self, prefix: &str) -> Self {
        self.log_file_prefix = prefix.to_string();
        self
    }

    /// Disable console logging
    pub fn without_console(mut self) -> Self {
        self.enable_console = false;
        self
    }
}

fn format_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Console => fmt::layer().with_writer(writer).with_ansi(ansi).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
    }
}

/// Initialize logging system with the given configuration
///
/// Returns a WorkerGuard when file logging is enabled. It must be kept alive
/// for the duration of the program; dropping it stops file output.
pub fn init_logging(config: LogConfig) -> io::Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);

    let console_layer = config
        .enable_console
        .then(|| format_layer(config.format, io::stderr, true));

    let mut guard = None;
    let file_layer = match &config.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, &config.log_file_prefix);
            let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(worker_guard);
            Some(format_layer(config.format, non_blocking, false))
        }
        None => None,
    };

    registry.with(console_layer).with(file_layer).init();

    Ok(guard)
}

/// Generate a correlation ID linking several audit events to one operation
pub fn generate_correlation_id() -> String {
    let timestamp = chrono::Utc::now().timestamp_micros().max(0) as u128;
    format!("{:x}-{:x}", timestamp, fastrand::u64(..))
}
