use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
    /// Dead-lettering for queues that have no explicit policy row.
    pub dead_letter_default: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: 2,
            max_seconds: 15 * 60,
            jitter_pct: 0.10,
            dead_letter_default: true,
        }
    }
}

/// Result of a failed execution (or an abandoned claim).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Retries remain; `attempt` is the new attempt counter.
    Retry { attempt: i32 },
    /// Retries exhausted; the task becomes terminal.
    Fail,
}

/// `attempt` counts failures that were retried. A task with
/// `max_retries = N` is executed at most N+1 times.
pub fn decide_outcome(attempt: i32, max_retries: i32) -> Outcome {
    if attempt < max_retries {
        Outcome::Retry {
            attempt: attempt + 1,
        }
    } else {
        Outcome::Fail
    }
}

/// Exponential backoff for the retry numbered `attempt` (1-based):
/// `base * 2^(attempt-1)`, capped, with symmetric jitter.
pub fn backoff_delay(attempt: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let attempt = attempt.max(1) as u32;
    let exp = attempt.saturating_sub(1);

    let pow2 = 1_i64.checked_shl(exp).unwrap_or(i64::MAX);
    let delay = cfg.base_seconds.max(0).saturating_mul(pow2).min(cfg.max_seconds);

    if cfg.jitter_pct <= 0.0 || delay == 0 {
        return Duration::from_secs(delay as u64);
    }

    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = rng.gen_range(-jitter_range..=jitter_range);
    let jittered = (delay as f64 + jitter).clamp(0.0, cfg.max_seconds as f64);

    Duration::from_secs_f64(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            base_seconds: 2,
            max_seconds: 60,
            jitter_pct: 0.0,
            dead_letter_default: true,
        }
    }

    #[test]
    fn max_retries_two_allows_three_executions() {
        assert_eq!(decide_outcome(0, 2), Outcome::Retry { attempt: 1 });
        assert_eq!(decide_outcome(1, 2), Outcome::Retry { attempt: 2 });
        assert_eq!(decide_outcome(2, 2), Outcome::Fail);
    }

    #[test]
    fn zero_retries_fails_immediately() {
        assert_eq!(decide_outcome(0, 0), Outcome::Fail);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let cfg = no_jitter();
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<u64> = (1..=7)
            .map(|a| backoff_delay(a, &cfg, &mut rng).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let cfg = no_jitter();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(backoff_delay(500, &cfg, &mut rng).as_secs(), 60);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cfg = RetryConfig {
            jitter_pct: 0.5,
            ..no_jitter()
        };
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let d = backoff_delay(3, &cfg, &mut rng).as_secs_f64();
            assert!((4.0..=12.0).contains(&d), "delay {d} out of range");
        }
    }
}
