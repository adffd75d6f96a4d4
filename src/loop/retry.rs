//! Exponential backoff for retrying backend failures.

use std::time::Duration;

/// Default base backoff delay in milliseconds.
pub const RETRY_BACKOFF_BASE_MS: u64 = 2000;

/// Default maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Multiplier for exponential backoff.
pub const BACKOFF_MULTIPLIER: u64 = 2;

/// Calculate the exponential backoff delay for a given attempt number.
///
/// `attempt` is 1-indexed; the first attempt waits `base_ms`. The delay
/// doubles on each attempt and never exceeds `max_ms`.
///
/// # Example
///
/// ```
/// use autopatch::r#loop::retry::calculate_backoff;
/// use std::time::Duration;
///
/// assert_eq!(calculate_backoff(1, 2000, 30_000), Duration::from_millis(2000));
/// assert_eq!(calculate_backoff(2, 2000, 30_000), Duration::from_millis(4000));
/// assert_eq!(calculate_backoff(5, 2000, 30_000), Duration::from_millis(30_000));
/// ```
#[must_use]
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let multiplier = BACKOFF_MULTIPLIER.saturating_pow(exponent);
    let delay = base_ms.saturating_mul(multiplier);
    Duration::from_millis(delay.min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(
            calculate_backoff(1, RETRY_BACKOFF_BASE_MS, MAX_BACKOFF_MS),
            Duration::from_millis(2000)
        );
        assert_eq!(
            calculate_backoff(3, RETRY_BACKOFF_BASE_MS, MAX_BACKOFF_MS),
            Duration::from_millis(8000)
        );
        assert_eq!(
            calculate_backoff(4, RETRY_BACKOFF_BASE_MS, MAX_BACKOFF_MS),
            Duration::from_millis(16000)
        );
    }

    #[test]
    fn test_backoff_capped() {
        assert_eq!(
            calculate_backoff(5, RETRY_BACKOFF_BASE_MS, MAX_BACKOFF_MS),
            Duration::from_millis(MAX_BACKOFF_MS)
        );
        assert_eq!(
            calculate_backoff(u32::MAX, RETRY_BACKOFF_BASE_MS, MAX_BACKOFF_MS),
            Duration::from_millis(MAX_BACKOFF_MS)
        );
    }

    #[test]
    fn test_attempt_zero_uses_base() {
        assert_eq!(calculate_backoff(0, 100, 1000), Duration::from_millis(100));
    }
}
