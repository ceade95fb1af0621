use rand::Rng;
use std::time::Duration;

use crate::config::RunnerCfg;

/// Exponential backoff with uniform jitter. `attempt` is 1-based.
pub fn backoff_ms(attempt: u32, base_ms: u64, factor: f64, jitter_ms: u64) -> u64 {
    let pow = factor.powi((attempt.saturating_sub(1)) as i32);
    let core = (base_ms as f64 * pow).round() as u64;
    let jitter = if jitter_ms > 0 { rand::rng().random_range(0..=jitter_ms) } else { 0 };
    core + jitter
}

/// How often and how patiently a rate-limited model call is retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub factor: f64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    pub fn from_cfg(cfg: &RunnerCfg) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_ms: cfg.backoff_base_ms,
            factor: cfg.backoff_factor,
            jitter_ms: cfg.backoff_jitter_ms,
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self { max_attempts: max_attempts.max(1), base_ms: 0, factor: 1.0, jitter_ms: 0 }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(backoff_ms(attempt, self.base_ms, self.factor, self.jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_without_jitter() {
        assert_eq!(backoff_ms(1, 500, 2.0, 0), 500);
        assert_eq!(backoff_ms(2, 500, 2.0, 0), 1000);
        assert_eq!(backoff_ms(4, 500, 2.0, 0), 4000);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..50 {
            let ms = backoff_ms(1, 100, 2.0, 25);
            assert!((100..=125).contains(&ms));
        }
    }

    #[test]
    fn policy_never_allows_zero_attempts() {
        let cfg = RunnerCfg { max_attempts: 0, ..RunnerCfg::default() };
        assert_eq!(RetryPolicy::from_cfg(&cfg).max_attempts, 1);
        assert_eq!(RetryPolicy::immediate(3).delay(3), Duration::ZERO);
    }
}
