use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with subtractive jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Fraction of each delay that may be shaved off at random (0 disables jitter).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        self.attempts = self.attempts.saturating_add(1);
        let base = (self.policy.initial.as_secs_f64() * self.policy.factor.powi(exponent))
            .min(self.policy.max.as_secs_f64());
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let scale = if jitter > 0.0 {
            1.0 - rand::thread_rng().gen_range(0.0..jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(base * scale)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Log level for the n-th consecutive failed connection attempt: the first three are
/// errors, then every 12th is a warning, the rest are debug.
pub fn reconnect_log_level(attempt: u32) -> log::Level {
    if attempt <= 3 {
        log::Level::Error
    } else if attempt % 12 == 0 {
        log::Level::Warn
    } else {
        log::Level::Debug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn delays_double_until_capped() {
        let mut backoff = Backoff::new(policy(0.0));
        let delays: Vec<u128> = (0..7).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000]);
        assert_eq!(backoff.attempts(), 7);
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(policy(0.0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_only_shortens() {
        let mut backoff = Backoff::new(policy(0.5));
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(1000));
            assert!(delay > Duration::from_millis(49));
        }
    }

    #[test]
    fn huge_attempt_counts_stay_capped() {
        let mut backoff = Backoff::new(policy(0.0));
        for _ in 0..5000 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn reconnect_logging_is_rate_limited() {
        assert_eq!(reconnect_log_level(1), log::Level::Error);
        assert_eq!(reconnect_log_level(3), log::Level::Error);
        assert_eq!(reconnect_log_level(4), log::Level::Debug);
        assert_eq!(reconnect_log_level(12), log::Level::Warn);
        assert_eq!(reconnect_log_level(13), log::Level::Debug);
        assert_eq!(reconnect_log_level(24), log::Level::Warn);
    }
}
