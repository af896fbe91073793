//! Exponential backoff schedule for task retries.

use std::time::Duration;

/// Base delay for the first retry.
const BASE_SECS: u64 = 30;

/// Delay before the `attempt`-th retry: `30 * 2^(attempt - 1)` seconds,
/// capped at `ceiling`.
///
/// `attempt` is 1-indexed (the first retry is attempt 1).
pub fn backoff_for_attempt(attempt: i32, ceiling: Duration) -> Duration {
    let attempt = attempt.max(1) as u32;
    let secs = BASE_SECS.saturating_mul(1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX));
    Duration::from_secs(secs).min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_few_attempts_follow_doubling_schedule() {
        let ceiling = Duration::from_secs(u64::MAX / 2);
        assert_eq!(backoff_for_attempt(1, ceiling), Duration::from_secs(30));
        assert_eq!(backoff_for_attempt(2, ceiling), Duration::from_secs(60));
        assert_eq!(backoff_for_attempt(3, ceiling), Duration::from_secs(120));
        assert_eq!(backoff_for_attempt(4, ceiling), Duration::from_secs(240));
    }

    #[test]
    fn caps_at_ceiling() {
        let ceiling = Duration::from_secs(300);
        assert_eq!(backoff_for_attempt(10, ceiling), ceiling);
    }
}
