//! Retry ceiling and exponential backoff

use std::time::Duration;

use shared_types::SyncItem;

pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_MIN_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Whether an item may be attempted again
pub fn should_retry(item: &SyncItem, max_retries: u32) -> bool {
    item.retry_count < max_retries
}

/// `min(min_ms * 2^retry_count, max_ms)`.
///
/// The exponent stops growing at the first value that reaches the cap, so
/// large retry counts never overflow. `min_ms` is raised to at least 1 and `max_ms`
/// to at least `min_ms`.
pub fn calculate_backoff(retry_count: u32, min_ms: u64, max_ms: u64) -> u64 {
    let min_ms = min_ms.max(1);
    let max_ms = max_ms.max(min_ms);

    // Doubling stops at the cap, so the loop runs at most 64 times
    let mut delay = min_ms;
    for _ in 0..retry_count {
        if delay >= max_ms {
            break;
        }
        delay = delay.saturating_mul(2);
    }
    delay.min(max_ms)
}

/// Retry settings for the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            min_backoff_ms: DEFAULT_MIN_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, item: &SyncItem) -> bool {
        should_retry(item, self.max_retries)
    }

    /// Delay before the next attempt of an item that has failed
    /// `retry_count` times before this failure
    pub fn backoff(&self, retry_count: u32) -> Duration {
        Duration::from_millis(calculate_backoff(
            retry_count,
            self.min_backoff_ms,
            self.max_backoff_ms,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn item(retry_count: u32) -> SyncItem {
        SyncItem {
            id: "q1".into(),
            session_id: "sess-1".into(),
            field_id: None,
            signature_data: "{}".into(),
            timestamp: 0,
            retry_count,
        }
    }

    #[test]
    fn test_backoff_known_values() {
        assert_eq!(calculate_backoff(0, 1000, 30000), 1000);
        assert_eq!(calculate_backoff(1, 1000, 30000), 2000);
        assert_eq!(calculate_backoff(4, 1000, 30000), 16000);
        assert_eq!(calculate_backoff(5, 1000, 30000), 30000);
    }

    #[test]
    fn test_backoff_huge_retry_count_is_capped() {
        assert_eq!(calculate_backoff(u32::MAX, 1000, 30000), 30000);
        assert_eq!(calculate_backoff(200, 1, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_should_retry_ceiling() {
        assert!(should_retry(&item(0), DEFAULT_MAX_RETRIES));
        assert!(should_retry(&item(9), DEFAULT_MAX_RETRIES));
        assert!(!should_retry(&item(10), DEFAULT_MAX_RETRIES));
        assert!(!should_retry(&item(0), 0));
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 10);
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(30), Duration::from_secs(30));
    }

    // ============================================================
    // Backoff Properties
    // ============================================================

    proptest! {
        #[test]
        fn backoff_within_bounds(
            retry in 0u32..10_000,
            min_ms in 1u64..100_000,
            span in 0u64..10_000_000,
        ) {
            let max_ms = min_ms + span;
            let delay = calculate_backoff(retry, min_ms, max_ms);
            prop_assert!(delay >= min_ms);
            prop_assert!(delay <= max_ms);
        }

        #[test]
        fn backoff_non_decreasing(retry in 0u32..1_000, min_ms in 1u64..10_000, span in 0u64..1_000_000) {
            let max_ms = min_ms + span;
            prop_assert!(calculate_backoff(retry + 1, min_ms, max_ms) >= calculate_backoff(retry, min_ms, max_ms));
        }

        #[test]
        fn backoff_doubles_below_cap(retry in 0u32..20, min_ms in 1u64..1_000) {
            let max_ms = u64::MAX;
            prop_assert_eq!(
                calculate_backoff(retry + 1, min_ms, max_ms),
                2 * calculate_backoff(retry, min_ms, max_ms)
            );
        }
    }
}
