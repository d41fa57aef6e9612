//! Backoff arithmetic shared by reconnection and task retries.

use std::time::Duration;

/// Delay before reconnect attempt number `attempt` (zero based):
/// `min(2^attempt, cap)` seconds.
pub fn reconnect_delay(attempt: u32, cap: Duration) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(cap)
}

/// Delay before republishing a task that has failed `retry` times:
/// `base * 2^retry`, saturating.
pub fn retry_backoff(retry: u32, base: Duration) -> Duration {
    let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_doubles_up_to_cap() {
        let cap = Duration::from_secs(30);
        let delays: Vec<u64> = (0..7).map(|a| reconnect_delay(a, cap).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(reconnect_delay(200, cap), cap);
    }

    #[test]
    fn test_retry_backoff_is_exponential() {
        let base = Duration::from_secs(1);
        assert_eq!(retry_backoff(1, base), Duration::from_secs(2));
        assert_eq!(retry_backoff(2, base), Duration::from_secs(4));
        assert_eq!(retry_backoff(3, base), Duration::from_secs(8));
        assert_eq!(
            retry_backoff(1, Duration::from_millis(10)),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_retry_backoff_saturates() {
        let huge = retry_backoff(64, Duration::from_secs(1));
        assert!(huge >= Duration::from_secs(u32::MAX as u64));
    }
}
