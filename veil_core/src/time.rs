//! Functions to work with time.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Return number of seconds that have elapsed since Unix epoch.
pub fn unix_time(time: SystemTime) -> u64 {
    let since_the_epoch = time
        .duration_since(UNIX_EPOCH)
        .expect("Current time is earlier than Unix epoch");
    since_the_epoch.as_secs()
}

/// Returns an `Instant` corresponding to "now". Should be used instead of
/// `Instant::now()` to be able to mock time in tests.
pub fn clock_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Returns the amount of time elapsed since this instant was created. Should
/// be used instead of `Instant::elapsed` to be able to mock time in tests.
pub fn clock_elapsed(time: Instant) -> Duration {
    clock_now().saturating_duration_since(time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_time_epoch() {
        assert_eq!(unix_time(UNIX_EPOCH), 0);
        assert_eq!(unix_time(UNIX_EPOCH + Duration::from_secs(42)), 42);
    }

    #[tokio::test]
    async fn clock_advances_with_mock_time() {
        tokio::time::pause();

        let start = clock_now();
        tokio::time::advance(Duration::from_secs(42)).await;

        assert_eq!(clock_elapsed(start), Duration::from_secs(42));
    }
}
