//! Learning loop configuration.

use std::time::Duration;

/// Configuration for the learning loop and the verification pipeline.
#[derive(Debug, Clone)]
pub struct LearningConfig {
    /// Pause between background learning cycles.
    pub interval: Duration,

    /// Deadline for one gossip request to a teacher.
    pub fetch_timeout: Duration,

    /// Deadline for one interactive network verification.
    pub network_timeout: Duration,

    /// Deadline for one staking ledger read.
    pub stake_timeout: Duration,

    /// Budget for the verification phase of one cycle.
    pub cycle_budget: Duration,

    /// Gossip blobs processed per cycle; the rest waits in the backlog.
    pub max_records_per_cycle: usize,

    /// Blobs kept for later cycles. Oldest are dropped beyond this.
    pub max_backlog: usize,

    /// Metadata-valid peers network-verified per cycle to grow the teacher pool.
    pub verification_sample: usize,

    /// Upper bound on cycles run by one inline blocking wait.
    pub max_inline_cycles: usize,

    /// Turn repeated teacher failures into loop termination.
    pub abort_on_learning_error: bool,

    /// Consecutive teacher failures that trigger the abort.
    pub max_consecutive_failures: u32,

    /// First demotion period for a failing teacher. Doubles per failure.
    pub teacher_backoff: Duration,

    /// Longest demotion period.
    pub max_teacher_backoff: Duration,

    /// How long an insufficient-stake verdict is trusted before re-reading the ledger.
    pub stake_recheck_ttl: Duration,

    /// Evict peers not seen for this long. `None` keeps every peer.
    pub node_ttl: Option<Duration>,

    /// Minimum bonded stake for `StakeVerified`.
    pub min_stake: u128,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(10),
            network_timeout: Duration::from_secs(10),
            stake_timeout: Duration::from_secs(15),
            cycle_budget: Duration::from_secs(30),
            max_records_per_cycle: 512,
            max_backlog: 8192,
            verification_sample: 1,
            max_inline_cycles: 64,
            abort_on_learning_error: false,
            max_consecutive_failures: 5,
            teacher_backoff: Duration::from_secs(2),
            max_teacher_backoff: Duration::from_secs(300),
            stake_recheck_ttl: Duration::from_secs(3600),
            node_ttl: None,
            min_stake: 1,
        }
    }
}

impl LearningConfig {
    /// Short timeouts and intervals for tests and local fleets.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            interval: Duration::from_millis(10),
            fetch_timeout: Duration::from_secs(1),
            network_timeout: Duration::from_secs(1),
            stake_timeout: Duration::from_secs(1),
            cycle_budget: Duration::from_secs(2),
            teacher_backoff: Duration::from_millis(10),
            max_teacher_backoff: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_stake_timeout(mut self, timeout: Duration) -> Self {
        self.stake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cycle_budget(mut self, budget: Duration) -> Self {
        self.cycle_budget = budget;
        self
    }

    #[must_use]
    pub fn with_max_records_per_cycle(mut self, max: usize) -> Self {
        self.max_records_per_cycle = max.max(1);
        self
    }

    #[must_use]
    pub fn with_max_backlog(mut self, max: usize) -> Self {
        self.max_backlog = max;
        self
    }

    #[must_use]
    pub fn with_verification_sample(mut self, sample: usize) -> Self {
        self.verification_sample = sample;
        self
    }

    #[must_use]
    pub fn with_max_inline_cycles(mut self, cycles: usize) -> Self {
        self.max_inline_cycles = cycles.max(1);
        self
    }

    /// Abort the loop after `max_failures` consecutive teacher failures.
    #[must_use]
    pub fn abort_on_learning_error(mut self, max_failures: u32) -> Self {
        self.abort_on_learning_error = true;
        self.max_consecutive_failures = max_failures.max(1);
        self
    }

    #[must_use]
    pub fn with_teacher_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.teacher_backoff = initial;
        self.max_teacher_backoff = max.max(initial);
        self
    }

    #[must_use]
    pub fn with_stake_recheck_ttl(mut self, ttl: Duration) -> Self {
        self.stake_recheck_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_node_ttl(mut self, ttl: Duration) -> Self {
        self.node_ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_min_stake(mut self, min_stake: u128) -> Self {
        self.min_stake = min_stake;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_verification_lazy() {
        let config = LearningConfig::default();
        assert!(config.verification_sample <= 1);
        assert!(!config.abort_on_learning_error);
        assert!(config.node_ttl.is_none());
    }

    #[test]
    fn builders_clamp_degenerate_values() {
        let config = LearningConfig::fast()
            .with_max_records_per_cycle(0)
            .with_max_inline_cycles(0)
            .abort_on_learning_error(0)
            .with_teacher_backoff(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(config.max_records_per_cycle, 1);
        assert_eq!(config.max_inline_cycles, 1);
        assert_eq!(config.max_consecutive_failures, 1);
        assert!(config.abort_on_learning_error);
        assert_eq!(config.max_teacher_backoff, Duration::from_secs(5));
    }
}
