//! ## kvarn-core::context
//! **Runtime context**
//!
//! One [`RuntimeContext`] owns every shared table of a runtime instance:
//! pools, queues, the scheduler's levels and poll sources, and the worker id
//! map. Nothing is global; several contexts can live side by side (tests do
//! exactly that), and every [`Worker`](crate::worker::Worker) holds an `Arc`
//! to the context it is attached to.
//!
//! ### Construction order
//! 1. predefined pools from [`RuntimeConfig::pools`]
//! 2. the scheduler command pool (one token per queue or poll source)
//! 3. the queue table and one distribution queue per priority level

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kvarn_config::{KvarnConfig, PoolKind, RuntimeConfig};
use kvarn_telemetry::MetricsRecorder;
use tracing::{debug, info, warn};

use crate::alloc::{Buffer, LocalCache, Pool, PoolId, PoolInfo, PoolParams, PoolTable, PoolTuning};
use crate::error::{CoreError, Rejected, Result};
use crate::queue::{
    Publish, QueueContext, QueueHandle, QueueInfo, QueueKind, QueueParams, QueueTable, SchedDequeue,
    Teardown,
};
use crate::sched::{fatal, Command, PollFn, PollOutcome, PollSourceId, Scheduler, COMMAND_LEN, COMMAND_POOL};
use crate::worker::Worker;

const DEFAULT_NAMESPACE: &str = "kvarn";

pub struct RuntimeContext {
    config: RuntimeConfig,
    pools: PoolTable,
    queues: QueueTable,
    scheduler: Scheduler,
    workers: Box<[AtomicBool]>,
    metrics: Arc<MetricsRecorder>,
}

impl RuntimeContext {
    /// Builds a context with its own metrics registry.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        let metrics = Arc::new(MetricsRecorder::new(DEFAULT_NAMESPACE)?);
        Self::with_metrics(config, metrics)
    }

    /// Builds a context from a loaded configuration, using its metrics namespace.
    pub fn from_config(config: &KvarnConfig) -> Result<Arc<Self>> {
        let metrics = Arc::new(MetricsRecorder::new(&config.telemetry.metrics_namespace)?);
        Self::with_metrics(config.runtime.clone(), metrics)
    }

    pub fn with_metrics(config: RuntimeConfig, metrics: Arc<MetricsRecorder>) -> Result<Arc<Self>> {
        config.check()?;

        let pools = PoolTable::new(config.max_pools);
        let predefined = PoolTuning {
            local_cache_limit: config.local_cache_limit,
            backoff: config.backoff,
            predefined: true,
        };
        for pool in &config.pools {
            pools.create(PoolParams::from(pool), predefined, &metrics)?;
        }

        let tokens = config.max_queues + config.max_poll_sources;
        let cmd_pool = pools.create(
            PoolParams::buffer(COMMAND_POOL, tokens, COMMAND_LEN),
            predefined,
            &metrics,
        )?;

        let queues = QueueTable::new(config.max_queues, config.queue_multi_max);
        let scheduler = Scheduler::new(&queues, cmd_pool, &config)?;

        info!(
            pools = config.pools.len(),
            max_queues = config.max_queues,
            priorities = config.sched_priorities,
            max_workers = config.max_workers,
            "runtime context ready"
        );

        Ok(Arc::new(Self {
            workers: (0..config.max_workers).map(|_| AtomicBool::new(false)).collect(),
            config,
            pools,
            queues,
            scheduler,
            metrics,
        }))
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    // ---- pools ----

    pub fn create_pool(&self, params: PoolParams) -> Result<PoolId> {
        let tuning = PoolTuning {
            local_cache_limit: self.config.local_cache_limit,
            backoff: self.config.backoff,
            predefined: false,
        };
        Ok(self.pools.create(params, tuning, &self.metrics)?.id())
    }

    pub fn pool(&self, id: PoolId) -> Result<Arc<Pool>> {
        self.pools.get(id)
    }

    pub fn lookup_pool(&self, name: &str) -> Option<PoolId> {
        self.pools.lookup(name)
    }

    pub fn pool_info(&self, id: PoolId) -> Result<PoolInfo> {
        Ok(self.pools.get(id)?.info())
    }

    /// Destroys a pool whose buffers are all back on its shared list.
    ///
    /// Buffers sitting in a worker's local cache count as outstanding; call
    /// [`Worker::destroy_pool`] from a worker to flush its own cache first.
    pub fn destroy_pool(&self, id: PoolId) -> Result<()> {
        self.destroy_pool_with(id, None)
    }

    pub(crate) fn destroy_pool_with(&self, id: PoolId, cache: Option<&mut LocalCache>) -> Result<()> {
        self.pools.destroy(id, cache).inspect_err(|e| {
            warn!(%id, error = %e, "pool destroy refused");
        })
    }

    #[inline]
    pub(crate) fn pool_slots(&self) -> usize {
        self.pools.len()
    }

    #[inline]
    pub(crate) fn pool_at(&self, slot: usize) -> Option<Arc<Pool>> {
        self.pools.at(slot)
    }

    // ---- queues ----

    /// Creates a queue; a scheduled queue is registered with its priority level.
    pub fn create_queue(&self, params: QueueParams) -> Result<QueueHandle> {
        if params.kind == QueueKind::Plain {
            let name = params.name.clone();
            let handle = self.queues.create(params)?;
            info!(queue = %name, index = handle.index(), "queue created");
            return Ok(handle);
        }

        self.scheduler.check_priority(params.priority)?;
        let name = params.name.clone();
        let level = params.priority;
        let discipline = params.discipline;
        let handle = self.queues.create(params)?;

        let token = match self
            .scheduler
            .alloc_token(Command::Dequeue { queue: handle.index() }, &name)
        {
            Ok(token) => token,
            Err(e) => {
                self.queues.release(handle);
                return Err(e);
            }
        };
        self.scheduler.pri_set(level);
        match self.queues.attach_token(handle, token) {
            Ok(publish) => self.publish_opt(publish),
            Err(Rejected { error, buffer }) => {
                self.scheduler.free_token(buffer);
                self.scheduler.pri_clr(level);
                return Err(error);
            }
        }

        info!(queue = %name, index = handle.index(), priority = level, ?discipline, "queue created");
        Ok(handle)
    }

    /// Destroys an empty queue.
    ///
    /// A scheduled queue whose token is circulating is only marked; the
    /// worker that next pops the token finishes the teardown.
    pub fn destroy_queue(&self, handle: QueueHandle) -> Result<()> {
        let teardown = self.queues.destroy(handle).inspect_err(|e| {
            warn!(index = handle.index(), error = %e, "queue destroy refused");
        })?;
        match teardown {
            Teardown::Done => {}
            Teardown::ReleaseToken { token, level } => {
                self.scheduler.free_token(token);
                self.scheduler.pri_clr(level);
            }
            Teardown::Deferred => {
                debug!(index = handle.index(), "queue teardown deferred to scheduler");
                return Ok(());
            }
        }
        info!(index = handle.index(), "queue destroyed");
        Ok(())
    }

    /// Appends one buffer. On failure the buffer is handed back in [`Rejected`].
    pub fn enqueue(&self, queue: QueueHandle, buf: Buffer) -> std::result::Result<(), Rejected> {
        let publish = self.queues.enqueue(&self.pools, queue, buf).inspect_err(|r| {
            warn!(index = queue.index(), error = %r.error, "enqueue rejected");
        })?;
        self.publish_opt(publish);
        Ok(())
    }

    /// Appends up to `queue_multi_max` buffers from the front of `bufs`,
    /// returning how many were taken.
    pub fn enqueue_multi(&self, queue: QueueHandle, bufs: &mut Vec<Buffer>) -> Result<usize> {
        let (n, publish) = self
            .queues
            .enqueue_multi(&self.pools, queue, bufs)
            .inspect_err(|e| warn!(index = queue.index(), error = %e, "enqueue rejected"))?;
        self.publish_opt(publish);
        Ok(n)
    }

    pub fn dequeue(&self, queue: QueueHandle) -> Result<Option<Buffer>> {
        self.queues.dequeue(&self.pools, queue)
    }

    pub fn dequeue_multi(&self, queue: QueueHandle, out: &mut Vec<Buffer>, max: usize) -> Result<usize> {
        self.queues.dequeue_multi(&self.pools, queue, out, max)
    }

    pub fn set_queue_context(&self, queue: QueueHandle, context: Option<QueueContext>) -> Result<()> {
        self.queues.set_context(queue, context)
    }

    pub fn queue_context(&self, queue: QueueHandle) -> Result<Option<QueueContext>> {
        self.queues.context(queue)
    }

    pub fn lookup_queue(&self, name: &str) -> Option<QueueHandle> {
        self.queues.lookup(name)
    }

    pub fn queue_info(&self, queue: QueueHandle) -> Result<QueueInfo> {
        self.queues.info(queue)
    }

    // ---- scheduler ----

    #[inline]
    pub fn num_priorities(&self) -> usize {
        self.scheduler.num_priorities()
    }

    /// Scheduled queues and poll sources registered at `priority`.
    #[inline]
    pub fn resources_at(&self, priority: usize) -> usize {
        self.scheduler.level_count(priority)
    }

    /// Registers a device poll callback at `priority`; it becomes eligible at once.
    pub fn register_poll_source<F>(&self, name: &str, priority: usize, callback: F) -> Result<PollSourceId>
    where
        F: FnMut(&mut Worker) -> PollOutcome + Send + 'static,
    {
        let callback: PollFn = Box::new(callback);
        let (id, token) = self.scheduler.register_poll(name, priority, callback)?;
        self.publish(priority, token);
        Ok(id)
    }

    fn publish_opt(&self, publish: Option<Publish>) {
        if let Some(Publish { token, level }) = publish {
            self.publish(level, token);
        }
    }

    pub(crate) fn publish(&self, level: usize, token: Buffer) {
        self.scheduler.publish(&self.queues, &self.pools, level, token);
    }

    pub(crate) fn pop_token(&self, level: usize) -> Option<Buffer> {
        self.scheduler.pop_token(&self.queues, &self.pools, level)
    }

    pub(crate) fn decode(&self, token: &Buffer) -> Command {
        self.scheduler.decode(token)
    }

    pub(crate) fn take_poll(&self, source: u32) -> Option<PollFn> {
        self.scheduler.take_poll(source)
    }

    pub(crate) fn restore_poll(&self, source: u32, callback: PollFn) {
        self.scheduler.restore_poll(source, callback);
    }

    /// Deregisters a poll source that asked to stop.
    pub(crate) fn stop_poll(&self, source: u32, token: Buffer) {
        self.scheduler.free_token(token);
        if let Some(level) = self.scheduler.remove_poll(source) {
            self.scheduler.pri_clr(level);
        }
    }

    pub(crate) fn sched_dequeue(&self, queue: u32, token: Buffer, out: &mut Vec<Buffer>) -> SchedDequeue {
        match self
            .queues
            .sched_dequeue(&self.pools, queue, token, out, self.scheduler.batch())
        {
            Ok(drained) => drained,
            Err(e) => fatal(&format!("command token for queue slot {queue} is orphaned: {e}")),
        }
    }

    /// Completes the teardown of a queue destroyed while its token circulated.
    pub(crate) fn finalize_queue(&self, queue: u32, level: usize, token: Buffer) {
        self.scheduler.free_token(token);
        self.scheduler.pri_clr(level);
        self.metrics.inc_finalized_queue();
        debug!(index = queue, "destroyed queue finalized");
    }

    // ---- workers ----

    pub(crate) fn claim_worker(&self) -> Result<u32> {
        self.workers
            .iter()
            .position(|slot| {
                slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .map(|id| id as u32)
            .ok_or(CoreError::WorkerTableFull(self.workers.len()))
    }

    pub(crate) fn release_worker(&self, id: u32) {
        if let Some(slot) = self.workers.get(id as usize) {
            slot.store(false, Ordering::Release);
        }
    }

    /// Workers currently attached.
    pub fn worker_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire))
            .count()
    }

    /// Pools whose kind is `kind`.
    pub fn pools_of_kind(&self, kind: PoolKind) -> Vec<PoolId> {
        (0..self.pools.len())
            .filter_map(|slot| self.pools.at(slot))
            .filter(|pool| pool.kind() == kind)
            .map(|pool| pool.id())
            .collect()
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("priorities", &self.scheduler.num_priorities())
            .field("workers", &self.worker_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Discipline, QueueStatus};
    use kvarn_config::PoolConfig;

    fn small() -> RuntimeConfig {
        RuntimeConfig {
            max_pools: 4,
            max_queues: 8,
            max_poll_sources: 2,
            max_workers: 2,
            sched_priorities: 2,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let config = RuntimeConfig {
            max_queues: 2,
            sched_priorities: 2,
            ..small()
        };
        assert!(matches!(
            RuntimeContext::new(config),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn predefined_pools_are_created_and_protected() {
        let config = RuntimeConfig {
            pools: vec![PoolConfig::default()],
            ..small()
        };
        let ctx = RuntimeContext::new(config).unwrap();
        let id = ctx.lookup_pool("packets").unwrap();
        assert!(ctx.pool_info(id).unwrap().predefined);
        assert!(matches!(
            ctx.destroy_pool(id),
            Err(CoreError::PoolPredefined(_))
        ));
        assert!(ctx.lookup_pool(COMMAND_POOL).is_some());
        assert_eq!(ctx.pools_of_kind(PoolKind::Packet), vec![id]);
    }

    #[test]
    fn worker_ids_are_bounded_and_recycled() {
        let ctx = RuntimeContext::new(small()).unwrap();
        let a = Worker::new(&ctx).unwrap();
        let b = Worker::new(&ctx).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(matches!(
            Worker::new(&ctx),
            Err(CoreError::WorkerTableFull(2))
        ));
        let freed = a.id();
        drop(a);
        assert_eq!(Worker::new(&ctx).unwrap().id(), freed);
        assert_eq!(ctx.worker_count(), 1);
    }

    #[test]
    fn scheduled_queue_registers_with_its_level() {
        let ctx = RuntimeContext::new(small()).unwrap();
        let q = ctx
            .create_queue(QueueParams::scheduled("rx", Discipline::Atomic, 1))
            .unwrap();
        assert_eq!(ctx.resources_at(1), 1);
        assert_eq!(ctx.resources_at(0), 0);
        assert!(matches!(
            ctx.create_queue(QueueParams::scheduled("bad", Discipline::None, 2)),
            Err(CoreError::InvalidPriority(2, 2))
        ));

        ctx.destroy_queue(q).unwrap();
        assert_eq!(ctx.resources_at(1), 0);
        assert!(ctx.lookup_queue("rx").is_none());
    }

    #[test]
    fn queue_slots_are_shared_with_distribution_queues() {
        // 8 slots, 2 taken by the priority levels
        let ctx = RuntimeContext::new(RuntimeConfig {
            max_poll_sources: 0,
            ..small()
        })
        .unwrap();
        let mut handles = Vec::new();
        for i in 0..6 {
            handles.push(
                ctx.create_queue(QueueParams::scheduled(format!("q{i}"), Discipline::None, 0))
                    .unwrap(),
            );
        }
        assert!(matches!(
            ctx.create_queue(QueueParams::plain("overflow")),
            Err(CoreError::QueueTableFull(8))
        ));
        ctx.destroy_queue(handles.pop().unwrap()).unwrap();
        let again = ctx
            .create_queue(QueueParams::scheduled("again", Discipline::None, 0))
            .unwrap();
        assert_eq!(ctx.queue_info(again).unwrap().status, QueueStatus::NotScheduled);
    }

    #[test]
    fn enqueue_into_plain_queue_via_context() {
        let ctx = RuntimeContext::new(small()).unwrap();
        let pool = ctx.create_pool(PoolParams::buffer("b", 4, 16)).unwrap();
        let q = ctx.create_queue(QueueParams::plain("p")).unwrap();

        let mut worker = Worker::new(&ctx).unwrap();
        let buf = worker.alloc(pool, 4).unwrap();
        ctx.enqueue(q, buf).unwrap();
        let buf = ctx.dequeue(q).unwrap().unwrap();
        worker.free(buf).unwrap();

        assert!(matches!(
            ctx.destroy_pool(pool),
            Err(CoreError::PoolBusy { outstanding: 1, .. })
        ));
        worker.destroy_pool(pool).unwrap();
        assert!(ctx.lookup_pool("b").is_none());
    }
}
