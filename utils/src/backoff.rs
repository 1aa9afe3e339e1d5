//! Exponential backoff schedule shared by the download, report and
//! reauthorization retry paths.

use std::time::Duration;

/// Number of consecutive attempts spent at each interval before doubling.
const PER_INTERVAL_ATTEMPTS: u32 = 3;

/// The default smallest retry unit.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(60);

/// Returned once three attempts at the maximum interval have been spent.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("reached maximum number of retry attempts")]
pub struct TooManyRetries;

/// Compute the wait before retry number `tried` (zero-based).
///
/// Each interval is used for three consecutive attempts before doubling,
/// so the delay grows as `smallest_unit * 2^(tried / 3)`, capped at
/// `max_interval`. Three attempts at the cap exhaust the budget. A
/// `max_interval` below `smallest_unit` behaves as if it were
/// `smallest_unit`.
pub fn exponential_backoff_time(
    tried: u32,
    max_interval: Duration,
    smallest_unit: Duration,
) -> Result<Duration, TooManyRetries> {
    let mut interval;
    let mut next_interval = smallest_unit;
    let mut c = 0u32;
    loop {
        interval = next_interval;
        next_interval = next_interval.saturating_mul(2);
        if interval >= max_interval {
            if tried - c >= PER_INTERVAL_ATTEMPTS {
                return Err(TooManyRetries);
            }
            return Ok(max_interval.max(smallest_unit));
        }
        c += PER_INTERVAL_ATTEMPTS;
        if c > tried {
            break;
        }
    }
    Ok(interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_backoff_doubles_every_three_attempts() {
        let max = 10 * MINUTE;
        for (tried, expected) in [
            (0, MINUTE),
            (1, MINUTE),
            (2, MINUTE),
            (3, 2 * MINUTE),
            (5, 2 * MINUTE),
            (6, 4 * MINUTE),
            (9, 8 * MINUTE),
            (12, 10 * MINUTE),
        ] {
            assert_eq!(
                exponential_backoff_time(tried, max, MINUTE).unwrap(),
                expected,
                "tried={tried}"
            );
        }
    }

    #[test]
    fn test_backoff_exhausts_after_three_capped_attempts() {
        let max = 5 * MINUTE;
        // 1m x3, 2m x3, 4m x3, then the cap
        assert_eq!(exponential_backoff_time(9, max, MINUTE).unwrap(), max);
        assert_eq!(exponential_backoff_time(10, max, MINUTE).unwrap(), max);
        assert_eq!(exponential_backoff_time(11, max, MINUTE).unwrap(), max);
        assert_eq!(exponential_backoff_time(12, max, MINUTE), Err(TooManyRetries));
    }

    #[test]
    fn test_backoff_is_monotonic_up_to_the_cap() {
        let max = 16 * MINUTE;
        let mut prev = Duration::ZERO;
        let mut tried = 0;
        while let Ok(cur) = exponential_backoff_time(tried, max, MINUTE) {
            assert!(cur >= prev, "tried={tried}");
            assert!(cur <= max);
            prev = cur;
            tried += 1;
        }
    }

    #[test]
    fn test_backoff_max_below_unit() {
        let max = Duration::from_secs(1);
        assert_eq!(exponential_backoff_time(0, max, MINUTE).unwrap(), MINUTE);
        assert_eq!(exponential_backoff_time(2, max, MINUTE).unwrap(), MINUTE);
        assert_eq!(exponential_backoff_time(3, max, MINUTE), Err(TooManyRetries));
    }
}
