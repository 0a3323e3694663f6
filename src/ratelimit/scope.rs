//! Scope configuration: how many requests a subject may make, and for how long it
//! is shut out once it goes over.

use std::time::Duration;

use crate::error::{RatekeeperError, Result};

/// Limits applied to every subject that resolves to a scope.
///
/// Built only through [`ScopeConfig::new`], which rejects a zero request limit or a
/// zero window. Fields are read-only afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeConfig {
    request_limit: u64,
    window: Duration,
    block_duration: Duration,
}

impl ScopeConfig {
    /// Create a validated scope configuration.
    ///
    /// `block_duration` may be zero, in which case exceeding the limit denies only
    /// the offending request and no block is kept.
    pub fn new(request_limit: u64, window: Duration, block_duration: Duration) -> Result<Self> {
        if request_limit == 0 {
            return Err(RatekeeperError::InvalidScope(
                "request limit must be at least 1".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(RatekeeperError::InvalidScope(
                "window duration must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            request_limit,
            window,
            block_duration,
        })
    }

    /// Maximum requests allowed per window.
    pub fn request_limit(&self) -> u64 {
        self.request_limit
    }

    /// Length of a counting window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// How long a subject stays blocked after exceeding the limit.
    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    /// Whether a post-increment count is over the limit.
    pub fn is_exceeded_by(&self, count: u64) -> bool {
        count > self.request_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_scope() {
        let scope = ScopeConfig::new(5, Duration::from_secs(1), Duration::from_secs(60)).unwrap();
        assert_eq!(scope.request_limit(), 5);
        assert_eq!(scope.window(), Duration::from_secs(1));
        assert_eq!(scope.block_duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let err = ScopeConfig::new(0, Duration::from_secs(1), Duration::ZERO).unwrap_err();
        assert!(matches!(err, RatekeeperError::InvalidScope(_)));
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = ScopeConfig::new(1, Duration::ZERO, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RatekeeperError::InvalidScope(_)));
    }

    #[test]
    fn test_zero_block_duration_allowed() {
        assert!(ScopeConfig::new(1, Duration::from_secs(1), Duration::ZERO).is_ok());
    }

    #[test]
    fn test_limit_is_strictly_greater_than() {
        let scope = ScopeConfig::new(3, Duration::from_secs(1), Duration::ZERO).unwrap();
        assert!(!scope.is_exceeded_by(3));
        assert!(scope.is_exceeded_by(4));
    }
}
