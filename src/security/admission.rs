//! Admission control for credential providers
//!
//! Combines a per-provider token bucket with burst-based anomaly detection.
//! A provider is in one of two orthogonal states at any time: how many
//! tokens it has, and whether it is serving a cooldown block. All per-provider
//! state lives in one map behind a single lock, so the read-refill-decide-write
//! sequence of a check is atomic and two concurrent callers can never spend
//! the same token.

use crate::metrics;
use crate::security::rate_limit::{RateLimiterConfig, TokenBucket, MAX_PERIOD_SECS};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Requests remembered per provider for anomaly detection
pub const HISTORY_CAPACITY: usize = 100;

/// Look-back window for anomaly detection
pub const ANOMALY_WINDOW: Duration = Duration::from_secs(60);

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_millis(100);

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DenialReason {
    #[serde(rename = "provider blocked")]
    ProviderBlocked,
    #[serde(rename = "rate limit exceeded")]
    RateLimitExceeded,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::ProviderBlocked => "provider blocked",
            DenialReason::RateLimitExceeded => "rate limit exceeded",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionResult {
    pub allowed: bool,
    /// Whole tokens left after this request
    pub remaining: u32,
    /// Wall-clock time at which another token will be available
    pub reset_time: DateTime<Utc>,
    /// How long a denied caller should wait before retrying
    pub retry_after: Option<Duration>,
    pub reason: Option<DenialReason>,
    /// Set on the single denial that tripped an anomaly block
    pub anomaly_detected: bool,
}

impl AdmissionResult {
    fn allowed(remaining: u32, reset_in: Duration) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_time: wall_clock_after(reset_in),
            retry_after: None,
            reason: None,
            anomaly_detected: false,
        }
    }

    fn denied(reason: DenialReason, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_time: wall_clock_after(retry_after),
            retry_after: Some(retry_after),
            reason: Some(reason),
            anomaly_detected: false,
        }
    }

    /// `retry_after` rounded up to whole seconds, for headers and CLIs
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| {
            let secs = d.as_secs();
            if d.subsec_nanos() > 0 {
                secs + 1
            } else {
                secs
            }
        })
    }
}

/// Read-only view of one provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub remaining: u32,
    pub capacity: u32,
    pub blocked: bool,
    /// Cooldown left when blocked
    pub blocked_for: Option<Duration>,
    /// Requests seen within the anomaly window
    pub recent_requests: usize,
}

/// Aggregate counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionMetrics {
    pub total_requests: u64,
    /// Every denied request, whatever the reason
    pub blocked_requests: u64,
    /// Denials caused by an empty bucket
    pub rate_limited_requests: u64,
    pub anomalies_detected: u64,
    /// Providers with live state
    pub active_providers: usize,
    pub blocked_providers: usize,
}

#[derive(Debug, Clone)]
struct RequestRecord {
    at: Instant,
    client_ip: Option<String>,
}

#[derive(Debug)]
struct ProviderState {
    bucket: TokenBucket,
    blocked_until: Option<Instant>,
    history: VecDeque<RequestRecord>,
}

impl ProviderState {
    fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::new(config.max_requests, config.refill_rate(), now),
            blocked_until: None,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    fn record_request(&mut self, now: Instant, client_ip: Option<&str>) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(RequestRecord {
            at: now,
            client_ip: client_ip.map(str::to_string),
        });
    }

    fn recent(&self, now: Instant) -> impl Iterator<Item = &RequestRecord> {
        self.history
            .iter()
            .filter(move |record| now.duration_since(record.at) < ANOMALY_WINDOW)
    }

    fn block_remaining(&self, now: Instant) -> Option<Duration> {
        self.blocked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

/// Per-provider rate limiter with anomaly blocking
pub struct AdmissionController {
    config: RateLimiterConfig,
    providers: RwLock<HashMap<String, ProviderState>>,
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
    rate_limited_requests: AtomicU64,
    anomalies_detected: AtomicU64,
}

impl AdmissionController {
    /// Create a new admission controller
    pub fn new(config: RateLimiterConfig) -> Result<Self, String> {
        config.validate()?;
        Ok(Self {
            config,
            providers: RwLock::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            rate_limited_requests: AtomicU64::new(0),
            anomalies_detected: AtomicU64::new(0),
        })
    }

    /// Get configuration
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Decide whether a request for `provider` may proceed
    pub async fn check_admission(&self, provider: &str, client_ip: Option<&str>) -> AdmissionResult {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        metrics::ADMISSION_REQUESTS.inc();

        if !self.config.enabled {
            return AdmissionResult::allowed(self.config.max_requests, Duration::ZERO);
        }

        let now = Instant::now();
        let mut providers = self.providers.write().await;

        if let Some(state) = providers.get_mut(provider) {
            if let Some(remaining) = state.block_remaining(now) {
                drop(providers);
                debug!(provider, "Rejecting request for blocked provider");
                return self.deny(AdmissionResult::denied(
                    DenialReason::ProviderBlocked,
                    remaining,
                ));
            }
            if state.blocked_until.take().is_some() {
                info!(provider, "Provider block expired");
            }
        }

        let state = providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderState::new(&self.config, now));
        state.record_request(now, client_ip);

        if state.bucket.try_consume(now) {
            return AdmissionResult::allowed(
                state.bucket.available(now),
                state.bucket.time_per_token(),
            );
        }

        let mut result =
            AdmissionResult::denied(DenialReason::RateLimitExceeded, state.bucket.time_to_full());
        result.anomaly_detected = self.detect_anomaly(provider, state, now);
        drop(providers);

        self.rate_limited_requests.fetch_add(1, Ordering::Relaxed);
        warn!(provider, client_ip, "Rate limit exceeded");
        self.deny(result)
    }

    fn deny(&self, result: AdmissionResult) -> AdmissionResult {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(reason) = result.reason {
            metrics::ADMISSION_DENIED
                .with_label_values(&[reason.as_str()])
                .inc();
        }
        result
    }

    /// Block the provider if the last minute holds more than twice the burst limit
    fn detect_anomaly(&self, provider: &str, state: &mut ProviderState, now: Instant) -> bool {
        let recent: Vec<&RequestRecord> = state.recent(now).collect();
        let threshold = 2 * self.config.burst_limit as usize;
        if recent.len() <= threshold {
            return false;
        }

        let distinct_ips = recent
            .iter()
            .filter_map(|record| record.client_ip.as_deref())
            .collect::<HashSet<_>>()
            .len();
        let recent_requests = recent.len();

        let until = now
            .checked_add(self.config.cooldown())
            .or_else(|| now.checked_add(Duration::from_secs(MAX_PERIOD_SECS)))
            .unwrap_or(now);
        state.blocked_until = Some(until);
        self.anomalies_detected.fetch_add(1, Ordering::Relaxed);
        metrics::ANOMALIES.inc();

        warn!(
            provider,
            recent_requests,
            threshold,
            distinct_ips,
            cooldown_secs = self.config.cooldown_secs,
            "Anomalous request burst, blocking provider"
        );
        true
    }

    /// Whether `provider` is currently serving a cooldown
    pub async fn is_provider_blocked(&self, provider: &str) -> bool {
        let now = Instant::now();
        let providers = self.providers.read().await;
        providers
            .get(provider)
            .and_then(|state| state.block_remaining(now))
            .is_some()
    }

    /// Current state of `provider`, computed without refilling or consuming
    pub async fn get_status(&self, provider: &str) -> ProviderStatus {
        let now = Instant::now();
        let providers = self.providers.read().await;

        match providers.get(provider) {
            Some(state) => {
                let blocked_for = state.block_remaining(now);
                ProviderStatus {
                    provider: provider.to_string(),
                    remaining: state.bucket.available(now),
                    capacity: state.bucket.capacity(),
                    blocked: blocked_for.is_some(),
                    blocked_for,
                    recent_requests: state.recent(now).count(),
                }
            }
            None => ProviderStatus {
                provider: provider.to_string(),
                remaining: self.config.max_requests,
                capacity: self.config.max_requests,
                blocked: false,
                blocked_for: None,
                recent_requests: 0,
            },
        }
    }

    /// Forget the bucket, block and history of `provider`
    ///
    /// Returns whether any state existed. Resetting an unknown provider is a
    /// no-op.
    pub async fn reset(&self, provider: &str) -> bool {
        let removed = self.providers.write().await.remove(provider).is_some();
        if removed {
            info!(provider, "Admission state reset");
        }
        removed
    }

    /// Aggregate counters since construction
    pub async fn get_metrics(&self) -> AdmissionMetrics {
        let now = Instant::now();
        let providers = self.providers.read().await;
        let blocked_providers = providers
            .values()
            .filter(|state| state.block_remaining(now).is_some())
            .count();

        AdmissionMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            rate_limited_requests: self.rate_limited_requests.load(Ordering::Relaxed),
            anomalies_detected: self.anomalies_detected.load(Ordering::Relaxed),
            active_providers: providers.len(),
            blocked_providers,
        }
    }

    /// Healthy while the state lock can be taken promptly
    pub async fn is_healthy(&self) -> bool {
        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.providers.read())
            .await
            .is_ok()
    }
}

fn wall_clock_after(duration: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::advance;

    fn controller(max_requests: u32, window_secs: u64, burst: u32, cooldown: u64) -> AdmissionController {
        let config = RateLimiterConfig::new(max_requests, window_secs)
            .with_burst_limit(burst)
            .with_cooldown_secs(cooldown);
        AdmissionController::new(config).unwrap()
    }

    #[test]
    fn test_denial_reason_strings() {
        assert_eq!(DenialReason::ProviderBlocked.to_string(), "provider blocked");
        assert_eq!(
            serde_json::to_string(&DenialReason::RateLimitExceeded).unwrap(),
            "\"rate limit exceeded\""
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RateLimiterConfig::new(0, 60);
        assert!(AdmissionController::new(config).is_err());
    }

    #[test]
    fn test_retry_after_secs_rounds_up() {
        let result = AdmissionResult::denied(
            DenialReason::RateLimitExceeded,
            Duration::from_millis(1500),
        );
        assert_eq!(result.retry_after_secs(), Some(2));
        assert_eq!(AdmissionResult::allowed(1, Duration::from_secs(1)).retry_after_secs(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_exhaustion() {
        let limiter = controller(5, 60, 5, 300);

        for expected_remaining in (0..5).rev() {
            let result = limiter.check_admission("openai", None).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
        }

        let result = limiter.check_admission("openai", None).await;
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.reason, Some(DenialReason::RateLimitExceeded));
        assert_eq!(result.retry_after, Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_admits_exactly_one() {
        let limiter = controller(5, 60, 5, 300);
        for _ in 0..5 {
            assert!(limiter.check_admission("openai", None).await.allowed);
        }
        assert!(!limiter.check_admission("openai", None).await.allowed);

        advance(Duration::from_secs(12)).await;

        assert!(limiter.check_admission("openai", None).await.allowed);
        assert!(!limiter.check_admission("openai", None).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_anomaly_blocks_provider() {
        let limiter = controller(5, 60, 2, 120);

        let mut reasons = Vec::new();
        for _ in 0..10 {
            let result = limiter.check_admission("burst", Some("10.0.0.1")).await;
            if let Some(reason) = result.reason {
                reasons.push(reason);
            }
        }

        // 6th call is the first denial and trips the block
        assert_eq!(reasons[0], DenialReason::RateLimitExceeded);
        assert!(reasons[1..]
            .iter()
            .all(|reason| *reason == DenialReason::ProviderBlocked));
        assert!(limiter.is_provider_blocked("burst").await);

        let status = limiter.get_status("burst").await;
        assert!(status.blocked);
        assert_eq!(status.blocked_for, Some(Duration::from_secs(120)));

        // Blocked regardless of tokens
        advance(Duration::from_secs(60)).await;
        let result = limiter.check_admission("burst", None).await;
        assert_eq!(result.reason, Some(DenialReason::ProviderBlocked));
        assert_eq!(result.retry_after, Some(Duration::from_secs(60)));

        let metrics = limiter.get_metrics().await;
        assert_eq!(metrics.anomalies_detected, 1);
        assert_eq!(metrics.blocked_providers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires_lazily() {
        let limiter = controller(2, 60, 0, 30);

        assert!(limiter.check_admission("p", None).await.allowed);
        assert!(limiter.check_admission("p", None).await.allowed);
        let tripped = limiter.check_admission("p", None).await;
        assert!(tripped.anomaly_detected);
        assert!(limiter.is_provider_blocked("p").await);

        advance(Duration::from_secs(31)).await;
        assert!(!limiter.is_provider_blocked("p").await);

        // 31s of refill at 2/60 per second gives one token
        let result = limiter.check_admission("p", None).await;
        assert!(result.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_check_leaves_bucket_untouched() {
        let limiter = controller(3, 60, 1, 30);
        for _ in 0..4 {
            limiter.check_admission("p", None).await;
        }
        assert!(limiter.is_provider_blocked("p").await);
        let before = limiter.get_status("p").await.recent_requests;

        limiter.check_admission("p", None).await;
        let after = limiter.get_status("p").await.recent_requests;
        assert_eq!(before, after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_ring_is_bounded() {
        let limiter = controller(500, 1, 250, 30);
        for _ in 0..(HISTORY_CAPACITY + 20) {
            assert!(limiter.check_admission("busy", None).await.allowed);
        }
        let status = limiter.get_status("busy").await;
        assert_eq!(status.recent_requests, HISTORY_CAPACITY);
    }

    #[tokio::test]
    async fn test_providers_are_independent() {
        let limiter = controller(2, 60, 2, 30);
        assert!(limiter.check_admission("a", None).await.allowed);
        assert!(limiter.check_admission("a", None).await.allowed);
        assert!(!limiter.check_admission("a", None).await.allowed);

        assert!(limiter.check_admission("b", None).await.allowed);
        assert_eq!(limiter.get_status("b").await.remaining, 1);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let limiter = controller(1, 60, 1, 30);
        assert!(!limiter.reset("never-seen").await);
        assert!(!limiter.reset("never-seen").await);

        assert!(limiter.check_admission("p", None).await.allowed);
        assert!(!limiter.check_admission("p", None).await.allowed);

        assert!(limiter.reset("p").await);
        assert!(!limiter.reset("p").await);
        assert!(limiter.check_admission("p", None).await.allowed);
        assert_eq!(limiter.get_metrics().await.active_providers, 1);
    }

    #[tokio::test]
    async fn test_unknown_provider_status() {
        let limiter = controller(7, 60, 1, 30);
        let status = limiter.get_status("ghost").await;
        assert_eq!(status.remaining, 7);
        assert_eq!(status.capacity, 7);
        assert!(!status.blocked);
        assert_eq!(limiter.get_metrics().await.active_providers, 0);
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_everything() {
        let limiter = AdmissionController::new(RateLimiterConfig::disabled()).unwrap();
        for _ in 0..500 {
            assert!(limiter.check_admission("p", None).await.allowed);
        }
        assert_eq!(limiter.get_metrics().await.active_providers, 0);
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_share_tokens() {
        let limiter = Arc::new(controller(10, 3600, 10, 30));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.check_admission("shared", None).await.allowed })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_longest_periods_do_not_overflow() {
        let limiter = controller(1, MAX_PERIOD_SECS, 0, MAX_PERIOD_SECS);

        assert!(limiter.check_admission("slow", None).await.allowed);
        let tripped = limiter.check_admission("slow", None).await;
        assert!(!tripped.allowed);
        assert!(tripped.anomaly_detected);
        let retry_after = tripped.retry_after.unwrap();
        assert!(retry_after >= Duration::from_secs(MAX_PERIOD_SECS - 1));
        assert!(retry_after <= Duration::from_secs(MAX_PERIOD_SECS + 1));

        let blocked = limiter.check_admission("slow", None).await;
        assert_eq!(blocked.reason, Some(DenialReason::ProviderBlocked));
        assert!(blocked.reset_time > Utc::now());
    }

    #[test]
    fn test_wall_clock_saturates() {
        assert_eq!(wall_clock_after(Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert!(wall_clock_after(Duration::from_secs(60)) > Utc::now());
    }

    #[tokio::test]
    async fn test_health_check() {
        let limiter = controller(10, 60, 1, 30);
        assert!(limiter.is_healthy().await);
    }
}
