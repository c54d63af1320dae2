//! ## kvarn-core::worker
//! **Per-thread runtime attachment**
//!
//! A [`Worker`] is the thread-local half of the runtime: it owns one local
//! cache per pool slot and the scheduler state (pre-scheduled stash, atomic
//! hold, pause flag). It is `Send` so it can be built on one thread and
//! moved into the thread that runs it, but it is never shared.
//!
//! ```no_run
//! use kvarn_config::RuntimeConfig;
//! use kvarn_core::prelude::*;
//!
//! let ctx = RuntimeContext::new(RuntimeConfig::default())?;
//! let mut worker = Worker::new(&ctx)?;
//! let mut events = Vec::new();
//! while let Some(queue) = worker.schedule(Wait::Forever, 16, &mut events) {
//!     for event in events.drain(..) {
//!         // handle `event` from `queue`, then free or forward it
//!         worker.free(event)?;
//!     }
//!     let _ = queue;
//! }
//! # Ok::<(), kvarn_core::CoreError>(())
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::alloc::{Buffer, LocalCache, PoolId};
use crate::backoff::Spinner;
use crate::context::RuntimeContext;
use crate::error::{CoreError, Result};
use crate::queue::{Discipline, QueueHandle, SchedDequeue};
use crate::sched::{fatal, Command, Hold, PollOutcome, SchedLocal, Wait};

pub struct Worker {
    ctx: Arc<RuntimeContext>,
    id: u32,
    caches: Vec<LocalCache>,
    sched: SchedLocal,
}

impl Worker {
    /// Attaches the calling thread to `ctx`, claiming a worker id.
    pub fn new(ctx: &Arc<RuntimeContext>) -> Result<Self> {
        let id = ctx.claim_worker()?;
        let caches = (0..ctx.pool_slots()).map(|_| LocalCache::new(id)).collect();
        debug!(worker = id, "worker attached");
        Ok(Self {
            ctx: Arc::clone(ctx),
            id,
            caches,
            sched: SchedLocal::new(ctx.config().sched_batch),
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    /// Allocates from `pool` through this worker's local cache.
    pub fn alloc(&mut self, pool: PoolId, size: usize) -> Result<Buffer> {
        let pool = self.ctx.pool(pool)?;
        pool.alloc(&mut self.caches[pool.id().slot()], size)
    }

    /// Frees a buffer of any pool through this worker's local cache.
    pub fn free(&mut self, buf: Buffer) -> Result<()> {
        let pool = self.ctx.pool(buf.pool_id())?;
        pool.free(&mut self.caches[pool.id().slot()], buf)
    }

    /// Buffers of `pool` parked in this worker's cache.
    pub fn cached(&self, pool: PoolId) -> usize {
        self.caches.get(pool.slot()).map_or(0, LocalCache::len)
    }

    /// Returns every cached slot of `pool` to its shared list.
    pub fn flush_local_cache(&mut self, pool: PoolId) -> Result<usize> {
        let pool = self.ctx.pool(pool)?;
        Ok(pool.flush_cache(&mut self.caches[pool.id().slot()]))
    }

    pub fn flush_all_caches(&mut self) -> usize {
        let mut flushed = 0;
        for (slot, cache) in self.caches.iter_mut().enumerate() {
            if cache.is_empty() {
                continue;
            }
            if let Some(pool) = self.ctx.pool_at(slot) {
                flushed += pool.flush_cache(cache);
            }
        }
        flushed
    }

    /// Destroys `pool` after flushing this worker's own cache of it.
    pub fn destroy_pool(&mut self, pool: PoolId) -> Result<()> {
        let cache = self.caches.get_mut(pool.slot()).ok_or(CoreError::StaleHandle)?;
        self.ctx.destroy_pool_with(pool, Some(cache))
    }

    /// Waits for events from the scheduler.
    ///
    /// Moves up to `max_events` (at least one) events into `out` and returns
    /// the queue they came from, or `None` when `wait` ran out or the worker
    /// is paused with nothing pre-scheduled.
    pub fn schedule(&mut self, wait: Wait, max_events: usize, out: &mut Vec<Buffer>) -> Option<QueueHandle> {
        let deadline = match wait {
            Wait::Timeout(timeout) => Some(Instant::now() + timeout),
            Wait::NoWait | Wait::Forever => None,
        };
        let spinner = Spinner::new(self.ctx.config().backoff);

        loop {
            if let Some(queue) = self.schedule_once(max_events, out) {
                return Some(queue);
            }
            if self.sched.paused {
                return None;
            }
            match (wait, deadline) {
                (Wait::NoWait, _) => return None,
                (_, Some(deadline)) if Instant::now() >= deadline => return None,
                _ => spinner.wait(),
            }
        }
    }

    /// Single-event form of [`Worker::schedule`].
    pub fn schedule_one(&mut self, wait: Wait) -> Option<(QueueHandle, Buffer)> {
        let mut out = std::mem::take(&mut self.sched.single);
        let queue = self.schedule(wait, 1, &mut out);
        let event = out.pop();
        self.sched.single = out;
        queue.zip(event)
    }

    /// Hands a held atomic queue back to the scheduler.
    ///
    /// Only possible once the pre-scheduled events are consumed; returns
    /// whether a hold was released.
    pub fn release_atomic(&mut self) -> bool {
        if !self.sched.stash.is_empty() {
            return false;
        }
        match self.sched.hold.take() {
            Some(Hold { level, token }) => {
                self.ctx.publish(level, token);
                true
            }
            None => false,
        }
    }

    /// Stops taking new work; pre-scheduled events are still delivered.
    pub fn pause(&mut self) {
        self.sched.paused = true;
    }

    pub fn resume(&mut self) {
        self.sched.paused = false;
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.sched.paused
    }

    /// Events pre-scheduled to this worker and not yet returned.
    #[inline]
    pub fn pending(&self) -> usize {
        self.sched.stash.len()
    }

    /// Detaches cleanly: fails while pre-scheduled events remain, otherwise
    /// releases any hold and flushes every local cache.
    pub fn terminate(&mut self) -> Result<()> {
        if !self.sched.stash.is_empty() {
            return Err(CoreError::PendingEvents(self.sched.stash.len()));
        }
        self.release_atomic();
        self.flush_all_caches();
        Ok(())
    }

    fn schedule_once(&mut self, max_events: usize, out: &mut Vec<Buffer>) -> Option<QueueHandle> {
        if !self.sched.stash.is_empty() {
            return self.drain_stash(max_events, out);
        }
        self.release_atomic();
        if self.sched.paused {
            return None;
        }

        let ctx = Arc::clone(&self.ctx);
        for level in 0..ctx.num_priorities() {
            // each registered resource is visited at most once per pass
            for _ in 0..ctx.resources_at(level) {
                let Some(token) = ctx.pop_token(level) else {
                    break;
                };
                match ctx.decode(&token) {
                    Command::Poll { source } => self.poll(&ctx, level, source, token),
                    Command::Dequeue { queue } => {
                        if self.dequeue_token(&ctx, level, queue, token) {
                            return self.drain_stash(max_events, out);
                        }
                    }
                }
            }
        }
        None
    }

    fn poll(&mut self, ctx: &Arc<RuntimeContext>, level: usize, source: u32, token: Buffer) {
        let Some(mut callback) = ctx.take_poll(source) else {
            fatal(&format!("poll token {source} has no registered source"));
        };
        ctx.metrics().inc_device_poll();
        match callback(self) {
            PollOutcome::Stop => {
                ctx.stop_poll(source, token);
            }
            PollOutcome::Idle | PollOutcome::Produced(_) => {
                ctx.restore_poll(source, callback);
                ctx.publish(level, token);
            }
        }
    }

    /// Pulls a batch through a queue token; true when events were stashed.
    fn dequeue_token(&mut self, ctx: &Arc<RuntimeContext>, level: usize, queue: u32, token: Buffer) -> bool {
        let mut batch = std::mem::take(&mut self.sched.scratch);
        let drained = ctx.sched_dequeue(queue, token, &mut batch);
        self.sched.stash.extend(batch.drain(..));
        self.sched.scratch = batch;

        match drained {
            SchedDequeue::Events {
                handle,
                discipline,
                token,
            } => {
                match discipline {
                    Discipline::Atomic => {
                        ctx.metrics().inc_atomic_hold();
                        self.sched.hold = Some(Hold { level, token });
                    }
                    Discipline::None | Discipline::Ordered => ctx.publish(level, token),
                }
                self.sched.source = Some(handle);
                !self.sched.stash.is_empty()
            }
            SchedDequeue::Finalized { token, level } => {
                ctx.finalize_queue(queue, level, token);
                false
            }
            SchedDequeue::Idle => false,
        }
    }

    fn drain_stash(&mut self, max_events: usize, out: &mut Vec<Buffer>) -> Option<QueueHandle> {
        let n = max_events.max(1).min(self.sched.stash.len());
        out.extend(self.sched.stash.drain(..n));
        self.ctx.metrics().add_scheduled_events(n);
        self.sched.source
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.sched.stash.is_empty() {
            warn!(
                worker = self.id,
                pending = self.sched.stash.len(),
                "worker dropped with pre-scheduled events, freeing them"
            );
            let leftovers: Vec<Buffer> = self.sched.stash.drain(..).collect();
            for buf in leftovers {
                if let Err(e) = self.free(buf) {
                    warn!(worker = self.id, error = %e, "cannot free pre-scheduled event");
                }
            }
        }
        self.release_atomic();
        self.flush_all_caches();
        self.ctx.release_worker(self.id);
        debug!(worker = self.id, "worker detached");
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pending", &self.sched.stash.len())
            .field("holding", &self.sched.hold.is_some())
            .field("paused", &self.sched.paused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::PoolParams;
    use crate::queue::QueueParams;
    use kvarn_config::RuntimeConfig;

    #[test]
    fn scheduling_reuses_the_worker_buffers() {
        let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        let pool = ctx.create_pool(PoolParams::buffer("one", 8, 8)).unwrap();
        let queue = ctx
            .create_queue(QueueParams::scheduled("one", Discipline::None, 0))
            .unwrap();
        let mut worker = Worker::new(&ctx).unwrap();
        let scratch = worker.sched.scratch.as_ptr();
        let single = worker.sched.single.as_ptr();

        for round in 0..3 {
            for _ in 0..4 {
                let buf = worker.alloc(pool, 1).unwrap();
                ctx.enqueue(queue, buf).unwrap();
            }
            for _ in 0..4 {
                let (source, event) = worker.schedule_one(Wait::NoWait).unwrap();
                assert_eq!(source, queue);
                worker.free(event).unwrap();
            }
            assert_eq!(worker.sched.scratch.as_ptr(), scratch, "round {round}");
            assert_eq!(worker.sched.single.as_ptr(), single, "round {round}");
        }
        assert!(worker.schedule_one(Wait::NoWait).is_none());
    }
}
