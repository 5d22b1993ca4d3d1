//! Retry delays of a KVNR

use std::time::Duration;

const BASE: u64 = 3;
const MINUTE: Duration = Duration::from_secs(60);

/// Delay before the next pass of a KVNR that failed `retry_count` times
///
/// `3^retry_count` minutes, at least one minute. Negative counts are
/// treated as 0 and large counts saturate instead of overflowing.
pub fn backoff(retry_count: i32) -> Duration {
    let exponent = u32::try_from(retry_count.max(0)).unwrap_or(0);
    let minutes = BASE.saturating_pow(exponent).max(1);
    MINUTE.saturating_mul(u32::try_from(minutes).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(-5, 1 ; "negative count")]
    #[test_case(0, 1 ; "first retry")]
    #[test_case(1, 3 ; "second retry")]
    #[test_case(2, 9 ; "third retry")]
    #[test_case(3, 27 ; "fourth retry")]
    #[test_case(10, 59049 ; "eleventh retry")]
    fn test_backoff_minutes(retry_count: i32, minutes: u64) {
        assert_eq!(backoff(retry_count), Duration::from_secs(minutes * 60));
    }

    #[test]
    fn test_backoff_is_non_decreasing() {
        let mut previous = Duration::ZERO;
        for retry_count in -2..100 {
            let delay = backoff(retry_count);
            assert!(delay >= previous, "backoff({retry_count}) decreased");
            assert!(delay >= Duration::from_secs(60));
            previous = delay;
        }
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(backoff(i32::MAX), backoff(i32::MAX - 1));
    }
}
