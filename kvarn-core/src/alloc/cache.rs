//! Per-worker free-slot cache.
//!
//! A cache is owned by exactly one worker and never shared, so it is a plain
//! intrusive stack threaded through the slots' `free_next` links. The pool
//! only tracks the aggregate `cached` count for conservation checks.

use super::buffer::{PoolId, NIL_INDEX};

#[derive(Debug)]
pub struct LocalCache {
    worker: u32,
    bound: Option<PoolId>,
    pub(crate) head: u32,
    pub(crate) count: usize,
}

impl LocalCache {
    /// Empty cache stamped with the owning worker's id.
    pub fn new(worker: u32) -> Self {
        Self {
            worker,
            bound: None,
            head: NIL_INDEX,
            count: 0,
        }
    }

    #[inline]
    pub fn worker(&self) -> u32 {
        self.worker
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether this cache may hold slots of `pool`.
    ///
    /// An empty cache rebinds to whichever pool uses it next.
    #[inline]
    pub(crate) fn accepts(&mut self, pool: PoolId) -> bool {
        match self.bound {
            Some(bound) if bound == pool => true,
            _ if self.count == 0 => {
                self.bound = Some(pool);
                true
            }
            _ => false,
        }
    }

    #[inline]
    pub(crate) fn serves(&self, pool: PoolId) -> bool {
        self.count > 0 && self.bound == Some(pool)
    }
}
