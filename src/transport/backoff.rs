//! Reconnect backoff state for the transport worker.

use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng, rngs::StdRng};

/// Capped exponential backoff parameters.
///
/// Retries continue indefinitely; transient transport failures are never
/// fatal. `reset_after` is the sustained streaming uptime that returns the
/// delay to `base`.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub reset_after: Duration,
}

/// Default base delay between reconnect attempts.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Default ceiling for the reconnect delay.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Default streaming uptime that resets the delay to its base.
pub const DEFAULT_BACKOFF_RESET: Duration = Duration::from_secs(60);

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
            reset_after: DEFAULT_BACKOFF_RESET,
        }
    }
}

/// Tracks reconnection attempts and produces jittered delays.
pub struct BackoffState {
    policy: BackoffPolicy,
    current: Duration,
    streaming_since: Option<Instant>,
    rng: StdRng,
}

const MIN_SLEEP_MS: u64 = 10;

impl BackoffState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.base,
            streaming_since: None,
            rng: StdRng::from_entropy(),
            policy,
        }
    }

    /// The nominal delay the next failure will wait, before jitter.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Produce the delay for a failed attempt and escalate towards the cap.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.current;
        self.current = self.current.saturating_mul(2).min(self.policy.cap);

        let max_ms = nominal.as_millis().min(u128::from(u64::MAX)) as u64;
        let sleep_ms = match max_ms {
            0 => MIN_SLEEP_MS,
            1..=MIN_SLEEP_MS => max_ms,
            _ => self.rng.gen_range(MIN_SLEEP_MS..=max_ms),
        };
        Duration::from_millis(sleep_ms)
    }

    /// Note that a connection reached the streaming state.
    pub fn connection_established(&mut self, now: Instant) {
        self.streaming_since = Some(now);
    }

    /// Note a successful write; sustained uptime resets the delay to base.
    pub fn write_succeeded(&mut self, now: Instant) {
        if let Some(since) = self.streaming_since
            && now.duration_since(since) >= self.policy.reset_after
        {
            self.current = self.policy.base;
        }
    }

    /// Note that the connection dropped.
    pub fn connection_lost(&mut self) {
        self.streaming_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, cap_ms: u64, reset_secs: u64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
            reset_after: Duration::from_secs(reset_secs),
        }
    }

    #[test]
    fn nominal_delay_doubles_up_to_the_cap() {
        let mut backoff = BackoffState::new(policy(500, 30_000, 60));
        let mut previous = Duration::ZERO;
        for _ in 0..10 {
            let nominal = backoff.current();
            assert!(nominal >= previous, "delay must never shrink mid-outage");
            previous = nominal;
            backoff.next_delay();
        }
        assert_eq!(backoff.current(), Duration::from_millis(30_000));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let mut backoff = BackoffState::new(policy(500, 30_000, 60));
        for _ in 0..20 {
            let nominal = backoff.current();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(MIN_SLEEP_MS));
            assert!(delay <= nominal);
        }
    }

    #[test]
    fn zero_base_still_sleeps_a_minimum() {
        let mut backoff = BackoffState::new(policy(0, 0, 60));
        assert!(backoff.next_delay() >= Duration::from_millis(MIN_SLEEP_MS));
    }

    #[test]
    fn sustained_streaming_resets_to_base() {
        let mut backoff = BackoffState::new(policy(500, 30_000, 60));
        for _ in 0..8 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current(), Duration::from_millis(30_000));

        let start = Instant::now();
        backoff.connection_established(start);
        backoff.write_succeeded(start + Duration::from_secs(30));
        assert_eq!(
            backoff.current(),
            Duration::from_millis(30_000),
            "short uptime must not reset"
        );
        backoff.write_succeeded(start + Duration::from_secs(61));
        assert_eq!(backoff.current(), Duration::from_millis(500));
    }

    #[test]
    fn reconnect_before_sustained_uptime_keeps_escalation() {
        let mut backoff = BackoffState::new(policy(500, 30_000, 60));
        backoff.next_delay();
        backoff.next_delay();
        let escalated = backoff.current();

        let start = Instant::now();
        backoff.connection_established(start);
        backoff.connection_lost();
        backoff.write_succeeded(start + Duration::from_secs(120));
        assert_eq!(backoff.current(), escalated);
    }
}
