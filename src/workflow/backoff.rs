//! Bounded exponential backoff between step retries.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the `retry`-th retry (1-based). Never exceeds `max`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31) as i32;
        let millis = self.base.as_millis() as f64 * 2f64.powi(exponent);
        let delay = Duration::from_millis(millis.min(self.max.as_millis() as f64) as u64);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            Duration::from_millis((delay.as_millis() as f64 * factor) as u64).min(self.max)
        } else {
            delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_and_bounded() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1000));
        assert_eq!(backoff.delay(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff =
            Backoff::new(Duration::from_millis(400), Duration::from_millis(1000)).with_jitter(true);
        for _ in 0..50 {
            let d = backoff.delay(1);
            assert!(d >= Duration::from_millis(300) && d <= Duration::from_millis(500));
            assert!(backoff.delay(3) <= Duration::from_millis(1000));
        }
    }
}
