use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter for store connectivity retries.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Fractional randomization: 0.1 multiplies the delay by a value in
    /// [0.9, 1.1).
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.factor.powi(attempt as i32) * self.initial.as_secs_f64();
        delay = delay.min(self.max.as_secs_f64());

        let r: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        delay *= 1.0 + self.jitter * r;

        Duration::from_secs_f64(delay.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let backoff = Backoff {
            jitter: 0.0,
            ..Backoff::default()
        };

        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        // 2^20 seconds would exceed the cap.
        assert_eq!(backoff.delay(20), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::default();
        for attempt in 0..10 {
            let base = 2.0_f64.powi(attempt).min(300.0);
            let d = backoff.delay(attempt as u32).as_secs_f64();
            assert!(d >= base * 0.9 - 1e-6 && d <= base * 1.1 + 1e-6);
        }
    }
}
