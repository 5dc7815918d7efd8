//! Integration tests for the audit log
//!
//! Covers rotation and archival, filtered search across files, retention
//! cleanup, and tolerance of damaged lines.

use credential_guard::audit::{
    AuditArchive, AuditEvent, AuditEventType, AuditLogger, RequestContext, SearchQuery, Severity,
};
use credential_guard::config::AuditConfig;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.to_string_lossy().ends_with(suffix))
        .collect();
    files.sort();
    files
}

fn age_file(path: &Path, days: u64) {
    let when = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(when)
        .unwrap();
}

#[tokio::test]
async fn test_rotation_happens_once_and_archives() {
    let dir = TempDir::new().unwrap();
    let logger = AuditLogger::new(AuditConfig::new(dir.path()).with_max_file_size(1))
        .await
        .unwrap();
    let context = RequestContext::new();

    let first = logger.log_credential_created("alice", "openai", "api_key", &context).await;
    let second = logger.log_credential_deleted("alice", "openai", "api_key", &context).await;
    logger.wait_for_compressions().await;

    let metrics = logger.get_metrics().await;
    assert_eq!(metrics.rotations, 1);
    assert_eq!(files_with_suffix(dir.path(), ".jsonl.gz").len(), 1);
    assert_eq!(files_with_suffix(dir.path(), ".jsonl").len(), 1);
    assert!(files_with_suffix(dir.path(), ".partial").is_empty());

    // Archived files are opt-in
    let live = logger.search_events(&SearchQuery::new()).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].event_id, second);

    let all = logger
        .search_events(&SearchQuery::new().include_archived(true))
        .await
        .unwrap();
    let ids: Vec<&str> = all.iter().map(|event| event.event_id.as_str()).collect();
    assert_eq!(ids, vec![first.as_str(), second.as_str()]);
}

#[tokio::test]
async fn test_search_filters_across_rotated_files() {
    let dir = TempDir::new().unwrap();
    let logger = AuditLogger::new(AuditConfig::new(dir.path()).with_max_file_size(600))
        .await
        .unwrap();
    let context = RequestContext::new().with_ip_address("192.0.2.10");

    for i in 0..30 {
        let provider = if i % 2 == 0 { "openai" } else { "github" };
        let user = if i % 3 == 0 { "alice" } else { "bob" };
        logger
            .log_credential_validated(user, provider, "api_key", i % 5 != 0, &context)
            .await;
    }
    logger.wait_for_compressions().await;
    assert!(logger.get_metrics().await.rotations > 0);

    let query = SearchQuery::new()
        .provider("openai")
        .user_id("alice")
        .severity(Severity::Medium)
        .include_archived(true);
    let results = logger.search_events(&query).await.unwrap();

    // i in 0..30 with i % 2 == 0, i % 3 == 0 and i % 5 == 0
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].details["valid"], serde_json::json!(false));
    assert_eq!(results[0].ip_address.as_deref(), Some("192.0.2.10"));

    let limited = logger
        .search_events(&SearchQuery::new().include_archived(true).limit(7))
        .await
        .unwrap();
    assert_eq!(limited.len(), 7);
}

#[tokio::test]
async fn test_search_by_time_and_type() {
    let dir = TempDir::new().unwrap();
    let logger = AuditLogger::new(AuditConfig::new(dir.path())).await.unwrap();

    let before = chrono::Utc::now() - chrono::Duration::seconds(1);
    logger.log_access_granted("u", "p", &RequestContext::new()).await;
    logger
        .log_access_denied("u", "p", "provider blocked", &RequestContext::new())
        .await;
    let after = chrono::Utc::now() + chrono::Duration::seconds(1);

    let denied = logger
        .search_events(
            &SearchQuery::new()
                .since(before)
                .until(after)
                .event_types([AuditEventType::AccessDenied]),
        )
        .await
        .unwrap();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].details["reason"], serde_json::json!("provider blocked"));

    let future = logger
        .search_events(&SearchQuery::new().since(after))
        .await
        .unwrap();
    assert!(future.is_empty());
}

#[tokio::test]
async fn test_damaged_lines_are_skipped() {
    let dir = TempDir::new().unwrap();
    let good = AuditEvent::new(AuditEventType::CredentialUpdated, "u", "p", Severity::High);
    let unknown_type = serde_json::to_string(&good)
        .unwrap()
        .replace("credential_updated", "credential_teleported");

    let seeded = dir.path().join("audit-20000101T000000000000.jsonl");
    let contents = format!(
        "{}\nnot json at all\n{}\n\n{{\"event_id\":\"trunc",
        serde_json::to_string(&good).unwrap(),
        unknown_type
    );
    std::fs::write(&seeded, contents).unwrap();

    let logger = AuditLogger::new(AuditConfig::new(dir.path())).await.unwrap();
    let results = logger.search_events(&SearchQuery::new()).await.unwrap();
    assert_eq!(results, vec![good]);
    assert_eq!(logger.get_metrics().await.malformed_lines, 3);
}

#[tokio::test]
async fn test_half_compressed_file_is_read_once() {
    let dir = TempDir::new().unwrap();
    let event = AuditEvent::new(AuditEventType::AccessGranted, "u", "p", Severity::Low);
    let line = format!("{}\n", serde_json::to_string(&event).unwrap());

    let plain = dir.path().join("audit-20000101T000000000000.jsonl");
    std::fs::write(&plain, &line).unwrap();
    let mut encoder = GzEncoder::new(
        std::fs::File::create(dir.path().join("audit-20000101T000000000000.jsonl.gz")).unwrap(),
        Compression::default(),
    );
    encoder.write_all(line.as_bytes()).unwrap();
    encoder.finish().unwrap();

    let logger = AuditLogger::new(AuditConfig::new(dir.path())).await.unwrap();
    let results = logger
        .search_events(&SearchQuery::new().include_archived(true))
        .await
        .unwrap();
    assert_eq!(results, vec![event]);
}

#[tokio::test]
async fn test_cleanup_respects_retention_and_active_file() {
    let dir = TempDir::new().unwrap();
    let logger = AuditLogger::new(AuditConfig::new(dir.path()).with_max_file_size(1))
        .await
        .unwrap();
    for _ in 0..3 {
        logger.log_access_granted("u", "p", &RequestContext::new()).await;
    }
    logger.wait_for_compressions().await;

    let archived = files_with_suffix(dir.path(), ".jsonl.gz");
    assert_eq!(archived.len(), 2);
    age_file(&archived[0], 120);
    age_file(&archived[1], 10);

    let active = logger.get_metrics().await.active_file;
    age_file(&active, 365);

    // Unrelated files are left alone
    let foreign = dir.path().join("notes.txt");
    std::fs::write(&foreign, "keep").unwrap();
    age_file(&foreign, 365);

    assert_eq!(logger.cleanup_old_logs(90).await.unwrap(), 1);
    assert!(!archived[0].exists());
    assert!(archived[1].exists());
    assert!(active.exists());
    assert!(foreign.exists());

    assert_eq!(logger.cleanup_old_logs(90).await.unwrap(), 0);
}

#[tokio::test]
async fn test_cleanup_removes_abandoned_partials() {
    let dir = TempDir::new().unwrap();
    let stale = dir.path().join("audit-20000101T000000000000.jsonl.gz.partial");
    std::fs::write(&stale, b"half written").unwrap();
    age_file(&stale, 120);
    let fresh = dir.path().join("audit-20000102T000000000000.jsonl.gz.partial");
    std::fs::write(&fresh, b"still compressing").unwrap();

    let logger = AuditLogger::new(AuditConfig::new(dir.path())).await.unwrap();
    let found = logger
        .search_events(&SearchQuery::new().include_archived(true))
        .await
        .unwrap();
    assert!(found.is_empty());

    assert_eq!(logger.cleanup_old_logs(90).await.unwrap(), 1);
    assert!(!stale.exists());
    assert!(fresh.exists());
}

#[tokio::test]
async fn test_archive_reads_without_creating_files() {
    let dir = TempDir::new().unwrap();
    let config = AuditConfig::new(dir.path()).with_max_file_size(1);
    let logger = AuditLogger::new(config.clone()).await.unwrap();
    let context = RequestContext::new();
    let first = logger.log_access_granted("u", "p", &context).await;
    let second = logger.log_access_granted("u", "p", &context).await;
    logger.wait_for_compressions().await;
    drop(logger);

    let archived = files_with_suffix(dir.path(), ".jsonl.gz");
    let plain = files_with_suffix(dir.path(), ".jsonl");
    assert_eq!(archived.len(), 1);
    assert_eq!(plain.len(), 1);
    age_file(&archived[0], 120);
    age_file(&plain[0], 120);

    let archive = AuditArchive::open(&config).unwrap();
    let found = archive
        .search_events(&SearchQuery::new().include_archived(true))
        .await
        .unwrap();
    let ids: Vec<&str> = found.iter().map(|event| event.event_id.as_str()).collect();
    assert_eq!(ids, vec![first.as_str(), second.as_str()]);

    // The newest plain file may belong to a running logger
    assert_eq!(archive.cleanup_old_logs(90).await.unwrap(), 1);
    assert!(!archived[0].exists());
    assert_eq!(files_with_suffix(dir.path(), ".jsonl"), plain);
    assert!(files_with_suffix(dir.path(), ".jsonl.gz").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_never_interleave() {
    let dir = TempDir::new().unwrap();
    let logger = Arc::new(
        AuditLogger::new(AuditConfig::new(dir.path()).with_max_file_size(2048))
            .await
            .unwrap(),
    );

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let logger = Arc::clone(&logger);
            tokio::spawn(async move {
                let event = AuditEvent::new(
                    AuditEventType::CredentialEncrypted,
                    format!("user-{}", i),
                    "openai",
                    Severity::Low,
                )
                .with_detail("payload", "x".repeat(64));
                logger.log_event(event).await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    logger.wait_for_compressions().await;

    let found = logger
        .search_events(&SearchQuery::new().include_archived(true).limit(1000))
        .await
        .unwrap();
    assert_eq!(found.len(), 40);
    for id in &ids {
        assert!(found.iter().any(|event| &event.event_id == id));
    }

    let metrics = logger.get_metrics().await;
    assert_eq!(metrics.total_events, 40);
    assert_eq!(metrics.write_failures, 0);
    assert_eq!(metrics.malformed_lines, 0);
}
