//! Runtime sizing and scheduling parameters.
//!
//! Controls the fixed tables a runtime context allocates up front:
//! - Pool, queue, poll-source and worker tables
//! - Scheduler priority levels and batch size
//! - Per-worker cache bounds and spin policy

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{ConfigError, PoolConfig};

/// How spinning threads back off after a lost race or an empty poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Busy-spin with exponential pause hints.
    Spin,
    /// Give the core away on every retry.
    Yield,
    /// Spin briefly, then start yielding.
    #[default]
    Adaptive,
}

/// Runtime table sizes and scheduler tuning.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Pool table size, including the scheduler's command pool.
    #[validate(range(min = 2, max = 255))]
    pub max_pools: usize,

    /// Queue table size, including one distribution queue per priority.
    #[validate(range(min = 2, max = 65536))]
    pub max_queues: usize,

    /// Device poll sources that may be registered at once.
    #[validate(range(max = 4096))]
    pub max_poll_sources: usize,

    /// Worker threads that may be attached at once.
    #[validate(range(min = 1, max = 4096))]
    pub max_workers: usize,

    /// Number of scheduler priority levels (0 is highest).
    #[validate(range(min = 1, max = 64))]
    pub sched_priorities: usize,

    /// Events dequeued from a queue per scheduling decision.
    #[validate(range(min = 1, max = 256))]
    pub sched_batch: usize,

    /// Upper bound for one multi-enqueue or multi-dequeue call.
    #[validate(range(min = 1, max = 1024))]
    pub queue_multi_max: usize,

    /// Buffers a worker may cache per pool before spilling half back.
    #[validate(range(min = 1, max = 65536))]
    pub local_cache_limit: usize,

    pub backoff: BackoffStrategy,

    /// Pools created with the context; these cannot be destroyed.
    #[validate(nested)]
    pub pools: Vec<PoolConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_pools: 16,
            max_queues: 1024,
            max_poll_sources: 32,
            max_workers: num_cpus::get().max(16),
            sched_priorities: 8,
            sched_batch: 4,
            queue_multi_max: 8,
            local_cache_limit: 256,
            backoff: BackoffStrategy::default(),
            pools: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Field ranges plus [`RuntimeConfig::check_limits`].
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        self.check_limits()
    }

    /// Cross-field checks that `validator` ranges cannot express.
    pub fn check_limits(&self) -> Result<(), ConfigError> {
        if self.max_queues <= self.sched_priorities {
            return Err(ConfigError::Limits(format!(
                "max_queues ({}) must exceed sched_priorities ({})",
                self.max_queues, self.sched_priorities
            )));
        }
        // one slot is taken by the scheduler command pool
        if self.pools.len() + 1 > self.max_pools {
            return Err(ConfigError::Limits(format!(
                "{} predefined pools do not fit in max_pools ({})",
                self.pools.len(),
                self.max_pools
            )));
        }
        let mut seen = HashSet::new();
        for pool in &self.pools {
            if !seen.insert(pool.name.as_str()) {
                return Err(ConfigError::Limits(format!(
                    "duplicate pool name '{}'",
                    pool.name
                )));
            }
        }
        Ok(())
    }
}
