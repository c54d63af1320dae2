//! Pluggable spin policy for CAS retries and idle scheduling loops.

use crossbeam::utils::Backoff;
use kvarn_config::BackoffStrategy;

/// Per-call backoff state driven by a [`BackoffStrategy`].
pub struct Spinner {
    strategy: BackoffStrategy,
    inner: Backoff,
}

impl Spinner {
    #[inline]
    pub fn new(strategy: BackoffStrategy) -> Self {
        Self {
            strategy,
            inner: Backoff::new(),
        }
    }

    /// Back off after losing a compare-and-swap race.
    #[inline]
    pub fn retry(&self) {
        match self.strategy {
            BackoffStrategy::Spin | BackoffStrategy::Adaptive => self.inner.spin(),
            BackoffStrategy::Yield => std::thread::yield_now(),
        }
    }

    /// Back off while waiting on another thread (publication, empty scan).
    #[inline]
    pub fn wait(&self) {
        match self.strategy {
            BackoffStrategy::Spin => self.inner.spin(),
            BackoffStrategy::Yield => std::thread::yield_now(),
            BackoffStrategy::Adaptive => self.inner.snooze(),
        }
    }

    #[inline]
    pub fn reset(&self) {
        self.inner.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_strategy_returns() {
        for strategy in [
            BackoffStrategy::Spin,
            BackoffStrategy::Yield,
            BackoffStrategy::Adaptive,
        ] {
            let spinner = Spinner::new(strategy);
            for _ in 0..32 {
                spinner.retry();
                spinner.wait();
            }
            spinner.reset();
        }
    }
}
