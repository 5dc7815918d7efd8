//! Security module for admission control
//!
//! This module provides:
//! - Token bucket rate limiting per provider
//! - Burst-based anomaly detection with cooldown blocks

pub mod admission;
pub mod rate_limit;

pub use admission::{
    AdmissionController, AdmissionMetrics, AdmissionResult, DenialReason, ProviderStatus,
};
pub use rate_limit::{RateLimiterConfig, MAX_PERIOD_SECS};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_module_structure() {
        let config = RateLimiterConfig::default();
        assert!(AdmissionController::new(config).is_ok());
    }
}
