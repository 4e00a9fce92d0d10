//! Exponential retry backoff with jitter.

use crate::config::SyncConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Delay schedule: `min(base * 2^failures, max)` plus up to
/// `jitter_ratio` of that delay on top.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            jitter_ratio: config.backoff_jitter_ratio,
        }
    }

    /// Delay before jitter for the given number of consecutive failures
    /// (counting the one being scheduled).
    pub fn capped_delay_ms(&self, failures: u32) -> u64 {
        let exponent = failures.saturating_sub(1).min(63);
        self.base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_ms)
    }
}

/// Stateful backoff counter owned by the coordinator.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
    rng: StdRng,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            policy,
            failures: 0,
            rng,
        }
    }

    /// Records one more failure and returns the delay before the next try.
    pub fn next_delay_ms(&mut self) -> u64 {
        self.failures = self.failures.saturating_add(1);
        let delay = self.policy.capped_delay_ms(self.failures);
        let jitter_max = (delay as f64 * self.policy.jitter_ratio) as u64;
        let jitter = if jitter_max == 0 {
            0
        } else {
            self.rng.gen_range(0..=jitter_max)
        };
        delay.saturating_add(jitter)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::{Backoff, BackoffPolicy};

    fn policy(jitter_ratio: f64) -> BackoffPolicy {
        BackoffPolicy {
            base_ms: 100,
            max_ms: 1_000,
            jitter_ratio,
        }
    }

    #[test]
    fn delay_doubles_until_cap() {
        let mut backoff = Backoff::new(policy(0.0), Some(1));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay_ms()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.failures(), 6);
    }

    #[test]
    fn jitter_stays_within_ratio_and_never_undershoots() {
        let mut backoff = Backoff::new(policy(0.5), Some(42));
        for failures in 1..=8u32 {
            let delay = backoff.next_delay_ms();
            let capped = policy(0.5).capped_delay_ms(failures);
            assert!(delay >= capped, "delay {delay} below {capped}");
            assert!(delay <= capped + capped / 2, "delay {delay} above jitter bound");
        }
    }

    #[test]
    fn same_seed_gives_same_sequence() {
        let mut first = Backoff::new(policy(0.3), Some(9));
        let mut second = Backoff::new(policy(0.3), Some(9));
        for _ in 0..5 {
            assert_eq!(first.next_delay_ms(), second.next_delay_ms());
        }
    }

    #[test]
    fn reset_restarts_from_base() {
        let mut backoff = Backoff::new(policy(0.0), None);
        backoff.next_delay_ms();
        backoff.next_delay_ms();
        backoff.reset();
        assert_eq!(backoff.next_delay_ms(), 100);
    }

    #[test]
    fn huge_failure_counts_saturate() {
        assert_eq!(policy(0.0).capped_delay_ms(u32::MAX), 1_000);
    }
}
