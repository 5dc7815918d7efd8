//! Read side of the audit directory
//!
//! Search and retention cleanup only need the directory listing, so they live
//! on [`AuditArchive`], which never opens an active file. [`AuditLogger`]
//! wraps one for its own searches; operator tooling can open one directly
//! without leaving an empty log file behind.
//!
//! [`AuditLogger`]: crate::audit::AuditLogger

use crate::audit::event::AuditEvent;
use crate::audit::search::SearchQuery;
use crate::config::AuditConfig;
use crate::error::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// File name prefix shared by active and rotated audit files
pub const FILE_PREFIX: &str = "audit-";

/// Extension of active (uncompressed) audit files
pub const ACTIVE_EXTENSION: &str = ".jsonl";

/// Extension of rotated, compressed audit files
pub const ARCHIVED_EXTENSION: &str = ".jsonl.gz";

/// Extension of a compression that has not been renamed into place yet
pub const PARTIAL_EXTENSION: &str = ".jsonl.gz.partial";

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogFileKind {
    Plain,
    Archived,
    /// Left over from an interrupted compression; never searched
    Partial,
}

pub(crate) fn classify(path: &Path) -> Option<LogFileKind> {
    let name = path.file_name()?.to_str()?;
    if !name.starts_with(FILE_PREFIX) {
        return None;
    }
    if name.ends_with(PARTIAL_EXTENSION) {
        Some(LogFileKind::Partial)
    } else if name.ends_with(ARCHIVED_EXTENSION) {
        Some(LogFileKind::Archived)
    } else if name.ends_with(ACTIVE_EXTENSION) {
        Some(LogFileKind::Plain)
    } else {
        None
    }
}

pub(crate) fn archived_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".gz.partial");
    PathBuf::from(name)
}

/// Search and retention over an audit directory
pub struct AuditArchive {
    log_dir: PathBuf,
    malformed_lines: AtomicU64,
}

impl AuditArchive {
    /// Open the directory named by `config` without creating anything
    pub fn open(config: &AuditConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            log_dir: config.log_dir.clone(),
            malformed_lines: AtomicU64::new(0),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Lines skipped by searches because they did not parse
    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines.load(Ordering::Relaxed)
    }

    /// Events matching every filter in `query`, oldest file first
    ///
    /// Archived files are only scanned when `query.include_archived` is set.
    /// Malformed lines, including ones naming an unknown event type or
    /// severity, are skipped.
    pub async fn search_events(&self, query: &SearchQuery) -> Result<Vec<AuditEvent>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let files = self.list_log_files().await?;
        Ok(self.search_files(files, query).await)
    }

    async fn search_files(
        &self,
        files: Vec<(PathBuf, LogFileKind)>,
        query: &SearchQuery,
    ) -> Vec<AuditEvent> {
        let mut results = Vec::new();
        let plain: HashSet<PathBuf> = files
            .iter()
            .filter(|(_, kind)| *kind == LogFileKind::Plain)
            .map(|(path, _)| archived_path(path))
            .collect();

        for (path, kind) in files {
            let contents = match kind {
                LogFileKind::Plain => read_plain(&path, query.include_archived).await,
                LogFileKind::Archived => {
                    // Compression still finishing: the plain copy is authoritative
                    if !query.include_archived || plain.contains(&path) {
                        continue;
                    }
                    read_gzip(path.clone()).await
                }
                LogFileKind::Partial => continue,
            };

            let contents = match contents {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable audit file");
                    continue;
                }
            };

            for line in String::from_utf8_lossy(&contents).lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEvent>(line) {
                    Ok(event) => {
                        if query.matches(&event) {
                            results.push(event);
                            if results.len() >= query.limit {
                                return results;
                            }
                        }
                    }
                    Err(e) => {
                        self.malformed_lines.fetch_add(1, Ordering::Relaxed);
                        debug!(path = %path.display(), error = %e, "Skipping malformed audit line");
                    }
                }
            }
        }

        results
    }

    /// Delete audit files last modified more than `retention_days` ago
    ///
    /// Another process may still be appending to the newest plain file, so it
    /// is never deleted. Returns the number of files removed.
    pub async fn cleanup_old_logs(&self, retention_days: u32) -> Result<usize> {
        let files = self.list_log_files().await?;
        let newest = files
            .iter()
            .filter(|(_, kind)| *kind == LogFileKind::Plain)
            .map(|(path, _)| path.clone())
            .last();
        Ok(remove_expired(files, retention_days, newest.as_deref()).await)
    }

    /// Like [`cleanup_old_logs`](Self::cleanup_old_logs), sparing `active`
    pub(crate) async fn cleanup_except(&self, retention_days: u32, active: &Path) -> Result<usize> {
        let files = self.list_log_files().await?;
        Ok(remove_expired(files, retention_days, Some(active)).await)
    }

    pub(crate) async fn list_log_files(&self) -> Result<Vec<(PathBuf, LogFileKind)>> {
        let mut entries = match tokio::fs::read_dir(&self.log_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(kind) = classify(&path) {
                files.push((path, kind));
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}

async fn remove_expired(
    files: Vec<(PathBuf, LogFileKind)>,
    retention_days: u32,
    keep: Option<&Path>,
) -> usize {
    let retention = Duration::from_secs(u64::from(retention_days) * SECONDS_PER_DAY);
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for (path, _) in files {
        if keep == Some(path.as_path()) {
            continue;
        }
        let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping audit file during cleanup");
                continue;
            }
        };
        if modified < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    info!(path = %path.display(), "Deleted expired audit file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete audit file"),
            }
        }
    }
    removed
}

/// Read a plain file, following it to its archive if it was compressed
/// after the directory was listed
async fn read_plain(path: &Path, include_archived: bool) -> std::io::Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && include_archived => {
            debug!(path = %path.display(), "Audit file archived during search");
            read_gzip(archived_path(path)).await
        }
        other => other,
    }
}

async fn read_gzip(path: PathBuf) -> std::io::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(BufReader::new(std::fs::File::open(path)?));
        let mut contents = Vec::new();
        decoder.read_to_end(&mut contents)?;
        Ok(contents)
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// Gzip `path` next to itself, then remove the original
///
/// On failure the partial output is removed and the original kept.
pub(crate) fn compress_file(path: &Path, level: u32) -> std::io::Result<PathBuf> {
    let archived = archived_path(path);
    let partial = partial_path(path);

    if let Err(e) = write_gzip(path, &partial, level) {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }
    if let Err(e) = std::fs::rename(&partial, &archived) {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }
    std::fs::remove_file(path)?;
    Ok(archived)
}

fn write_gzip(source: &Path, target: &Path, level: u32) -> std::io::Result<()> {
    let mut reader = BufReader::new(std::fs::File::open(source)?);
    let writer = BufWriter::new(std::fs::File::create(target)?);
    let mut encoder = GzEncoder::new(writer, Compression::new(level));
    std::io::copy(&mut reader, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()
}
