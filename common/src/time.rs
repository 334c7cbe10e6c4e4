//! Time utilities and constants for the settlement core.

use chrono::{DateTime, Duration, Utc};

/// Timing constants.
pub mod constants {
    use super::Duration;

    /// Rolling window for the daily wallet debit limit.
    pub fn daily_limit_window() -> Duration {
        Duration::hours(24)
    }

    /// Rolling window for the monthly wallet debit limit.
    pub fn monthly_limit_window() -> Duration {
        Duration::days(30)
    }
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Start of a rolling window of `length` ending at `at`.
pub fn window_start(at: Timestamp, length: Duration) -> Timestamp {
    at - length
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start() {
        let at = now();
        let start = window_start(at, constants::daily_limit_window());
        assert_eq!(at - start, Duration::hours(24));
    }
}
