//! Reconnect pacing for the proxy link

use std::time::Duration;

use cf_core::config::BackoffConfig;

/// Exponential backoff with jitter between link attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    multiplier: f64,
    /// Fraction of each delay added at random (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the next attempt; advances the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay + Duration::from_secs_f64(jitter_amount)
    }

    /// Back to the initial delay after a link came up
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_capped() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(20), Duration::from_secs(60), 2.0, 0.0);

        assert_eq!(backoff.next_delay(), Duration::from_secs(20));
        assert_eq!(backoff.next_delay(), Duration::from_secs(40));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 0.0);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(4), Duration::from_secs(60), 1.0, 0.5);
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_secs(6));
        }
    }
}
