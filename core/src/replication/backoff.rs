//! Retry policy for replication senders

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`, with ±25% jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, rand::thread_rng().gen_range(-1.0..=1.0))
    }

    /// Delay with a fixed jitter factor in `[-1, 1]`, scaled to ±25%
    pub fn delay_with_jitter(&self, attempt: u32, factor: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let capped = self.capped_ms(attempt);
        let jitter = (capped / 4) as f64 * factor.clamp(-1.0, 1.0);
        Duration::from_millis((capped as f64 + jitter).max(1.0) as u64)
    }

    /// Delay without jitter
    pub fn capped_ms(&self, attempt: u32) -> u64 {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let shift = attempt.clamp(1, 32) - 1;
        let exp = base_ms.saturating_mul(1u64.checked_shl(shift).unwrap_or(u64::MAX));
        exp.min(max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Backoff {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(5))
    }

    #[test]
    fn test_doubles_until_cap() {
        let backoff = policy();
        assert_eq!(backoff.capped_ms(1), 100);
        assert_eq!(backoff.capped_ms(2), 200);
        assert_eq!(backoff.capped_ms(3), 400);
        assert_eq!(backoff.capped_ms(6), 3_200);
        assert_eq!(backoff.capped_ms(7), 5_000);
        assert_eq!(backoff.capped_ms(60), 5_000);
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = policy();
        assert_eq!(backoff.delay_with_jitter(3, -1.0), Duration::from_millis(300));
        assert_eq!(backoff.delay_with_jitter(3, 0.0), Duration::from_millis(400));
        assert_eq!(backoff.delay_with_jitter(3, 1.0), Duration::from_millis(500));

        for _ in 0..100 {
            let d = backoff.delay(4).as_millis() as u64;
            assert!((600..=1_000).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn test_no_delay_before_first_failure() {
        assert_eq!(policy().delay(0), Duration::ZERO);
    }

    #[test]
    fn test_max_never_below_base() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.capped_ms(5), 2_000);
    }
}
