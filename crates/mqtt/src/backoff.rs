//! Retry delays for the connection kernel.
//!
//! Two schedules are used:
//! - a fixed delay between initial connect attempts (the attempt budget is
//!   counted by the connection manager, not here)
//! - an exponential delay between automatic reconnect attempts once a session
//!   has existed; the reconnect watchdog bounds the total time spent
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```

use std::time::Duration;

/// Delay schedule between connection attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    /// Exponential schedule. There is no attempt limit.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max.max(initial),
            multiplier: multiplier.max(1.0),
            attempt: 0,
        }
    }

    /// Constant delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0)
    }

    /// Starts the schedule over; called after every successful CONNACK.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the next sleep duration and advances the schedule.
    pub fn next_sleep(&mut self) -> Duration {
        self.attempt += 1;
        let sleep = self.current_delay;
        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = next.min(self.max_delay);
        sleep
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for Backoff {
    /// 1s growing by 10% per attempt, capped at 60s.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 1.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        let mut backoff = Backoff::default();

        let delay1 = backoff.next_sleep();
        assert_eq!(delay1, Duration::from_secs(1));

        let delay2 = backoff.next_sleep();
        assert!(delay2 > delay1);
        assert!(delay2 < Duration::from_secs_f64(1.2));
    }

    #[test]
    fn test_backoff_respects_max_delay() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 2.0);
        for _ in 0..20 {
            assert!(backoff.next_sleep() <= Duration::from_secs(10));
        }
        assert_eq!(backoff.attempt(), 20);
    }

    #[test]
    fn test_fixed_schedule() {
        let mut backoff = Backoff::fixed(Duration::from_secs(5));
        for _ in 0..5 {
            assert_eq!(backoff.next_sleep(), Duration::from_secs(5));
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();
        backoff.next_sleep();
        backoff.next_sleep();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_sleep(), Duration::from_secs(1));
    }

    #[test]
    fn test_degenerate_multiplier_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10), 0.5);
        assert_eq!(backoff.next_sleep(), Duration::from_secs(2));
        assert_eq!(backoff.next_sleep(), Duration::from_secs(2));
    }
}
