//! Injectable clock, per spec.md §9's design note: "ambient logging/DI
//! container → logger+clock passed explicitly". Every timer in the
//! poller and writer goes through a `Clock` so tests can run retry
//! and backoff schedules without real sleeps.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

/// Source of wall-clock time and sleeps, injected into components
/// that need either so tests can substitute a deterministic fake.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Sleep for the given duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// `Clock` backed by the system clock and Tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_clock_now_is_monotonic_nondecreasing() {
        let clock = SystemClock;
        let a = clock.now();
        clock.sleep(Duration::from_millis(1)).await;
        let b = clock.now();
        assert!(b >= a);
    }
}
