use crate::metrics::Metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Admission control for inbound calls: a per-second token counter.
///
/// A background tick publishes the window to the calls-per-second gauge
/// and resets the counter every second. A rate of -1 disables the limit
/// while the gauge keeps ticking.
pub struct CallLimiter {
    rate: i64,
    count: Mutex<i64>,
}

impl CallLimiter {
    pub fn new(rate: i64) -> Arc<Self> {
        Arc::new(Self {
            rate,
            count: Mutex::new(0),
        })
    }

    /// Spawn the one second reset tick
    pub fn start(self: &Arc<Self>, metrics: Metrics) {
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tick.tick().await;

                let mut count = limiter.count.lock();
                metrics.calls_per_second.set(*count);
                *count = 0;
            }
        });
    }

    /// Whether a new inbound call may be attempted right now
    pub fn accept_new_call(&self) -> bool {
        let mut count = self.count.lock();

        if self.rate == -1 || *count < self.rate {
            *count += 1;
            return true;
        }

        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn limit_applies_within_window() {
        let limiter = CallLimiter::new(2);

        assert!(limiter.accept_new_call());
        assert!(limiter.accept_new_call());
        assert!(!limiter.accept_new_call());
    }

    #[test]
    fn unlimited() {
        let limiter = CallLimiter::new(-1);

        for _ in 0..1000 {
            assert!(limiter.accept_new_call());
        }
    }
}
