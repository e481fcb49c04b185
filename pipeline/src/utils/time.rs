//! Time helpers

use chrono::Utc;

/// Current wall-clock time in epoch milliseconds.
///
/// All persisted timestamps (envelope timestamps, claim times, ack times)
/// use this representation so they compare across process restarts.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_positive_and_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(a > 1_600_000_000_000);
        assert!(b >= a);
    }
}
