//! Retry pacing on top of `backoff::ExponentialBackoff`.

use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::time::Instant;

/// Random spread applied to each delay, as a fraction of the nominal interval.
pub const RANDOMIZATION_FACTOR: f64 = 0.1;

/// Doubling schedule from `initial` up to `max` that never gives up on its
/// own; callers bound the number of attempts.
pub fn exponential(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_interval(max.max(initial))
        .with_multiplier(2.0)
        .with_randomization_factor(RANDOMIZATION_FACTOR)
        .with_max_elapsed_time(None)
        .build()
}

/// Send gate for one unreachable peer.
///
/// Each failure pulls the next delay from the schedule; sends resume once it
/// has passed. A successful send resets the schedule.
pub struct PeerBackoff {
    schedule: ExponentialBackoff,
    attempts: u32,
    retry_at: Option<Instant>,
}

impl PeerBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            schedule: exponential(initial, max),
            attempts: 0,
            retry_at: None,
        }
    }

    /// Record a failed send at `now` and return the delay before the next one.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let delay = self
            .schedule
            .next_backoff()
            .unwrap_or(self.schedule.max_interval);
        self.retry_at = Some(now + delay);
        delay
    }

    pub fn should_retry(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }

    pub fn reset(&mut self) {
        self.schedule.reset();
        self.attempts = 0;
        self.retry_at = None;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within_jitter(delay: Duration, nominal_ms: u64) -> bool {
        let nominal = nominal_ms as f64;
        let ms = delay.as_secs_f64() * 1_000.0;
        ms >= nominal * (1.0 - RANDOMIZATION_FACTOR) - 1.0
            && ms <= nominal * (1.0 + RANDOMIZATION_FACTOR) + 1.0
    }

    #[test]
    fn test_schedule_doubles_then_caps() {
        let mut schedule = exponential(Duration::from_millis(100), Duration::from_millis(400));
        for nominal in [100, 200, 400, 400, 400] {
            let delay = schedule.next_backoff().unwrap();
            assert!(within_jitter(delay, nominal), "{delay:?} vs {nominal}ms");
        }
    }

    #[test]
    fn test_schedule_never_expires() {
        let mut schedule = exponential(Duration::from_millis(1), Duration::from_millis(2));
        for _ in 0..1_000 {
            assert!(schedule.next_backoff().is_some());
        }
    }

    #[test]
    fn test_peer_gate_holds_until_delay_passes() {
        let mut gate = PeerBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let start = Instant::now();
        assert!(gate.should_retry(start));

        let delay = gate.record_failure(start);
        assert!(within_jitter(delay, 100));
        assert!(!gate.should_retry(start + Duration::from_millis(50)));
        assert!(gate.should_retry(start + delay));

        let second = gate.record_failure(start + delay);
        assert!(within_jitter(second, 200));
        assert_eq!(gate.attempt_count(), 2);
    }

    #[test]
    fn test_peer_gate_reset() {
        let mut gate = PeerBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let start = Instant::now();
        gate.record_failure(start);
        gate.record_failure(start);
        gate.reset();

        assert_eq!(gate.attempt_count(), 0);
        assert!(gate.should_retry(start));
        assert!(within_jitter(gate.record_failure(start), 100));
    }
}
