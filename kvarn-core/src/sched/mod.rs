//! ## kvarn-core::sched
//! **Cooperative priority scheduler**
//!
//! Every schedulable resource (a scheduled queue or a poll source) owns one
//! command token. A resource is eligible exactly while its token sits in the
//! distribution queue of its priority level; the worker that pops the token
//! is the only one acting on that resource until it re-publishes the token.
//!
//! - Queue tokens: the popping worker drains up to `sched_batch` events into
//!   its local stash. Under `Atomic` the token is held until the stash is
//!   empty and the worker asks for more work; otherwise it goes straight back.
//! - Poll tokens: the popping worker runs the poll callback and re-publishes
//!   the token unless the callback asked to stop.
//!
//! The scan loop itself lives on [`Worker`](crate::worker::Worker), which owns
//! the per-thread state.

pub(crate) mod command;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kvarn_config::RuntimeConfig;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::alloc::{Buffer, Pool, PoolTable};
use crate::error::{CoreError, Result};
use crate::queue::{QueueHandle, QueueParams, QueueTable};
use crate::worker::Worker;

pub(crate) use command::{Command, COMMAND_LEN};

/// Name of the predefined pool holding command tokens.
pub const COMMAND_POOL: &str = "kvarn_sched_cmd";

/// How long [`Worker::schedule`] may wait for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Return after one empty scan.
    NoWait,
    /// Keep scanning until something arrives.
    Forever,
    /// Keep scanning until the deadline passes.
    Timeout(Duration),
}

/// Result of one poll callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing arrived.
    Idle,
    /// This many events were produced into queues.
    Produced(usize),
    /// Deregister the source.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollSourceId(pub(crate) u32);

/// Device poll callback; runs on whichever worker popped the source's token.
pub type PollFn = Box<dyn FnMut(&mut Worker) -> PollOutcome + Send>;

struct PollSlot {
    name: String,
    level: usize,
    callback: Option<PollFn>,
}

/// Atomic queue access retained between two `schedule` calls.
#[derive(Debug)]
pub(crate) struct Hold {
    pub(crate) level: usize,
    pub(crate) token: Buffer,
}

/// Scheduler state private to one worker.
///
/// Buffers are sized once at attach time; scheduling never grows them.
#[derive(Debug)]
pub(crate) struct SchedLocal {
    pub(crate) stash: VecDeque<Buffer>,
    pub(crate) source: Option<QueueHandle>,
    pub(crate) hold: Option<Hold>,
    pub(crate) paused: bool,
    /// Landing area for one queue dequeue.
    pub(crate) scratch: Vec<Buffer>,
    /// Output of `schedule_one`.
    pub(crate) single: Vec<Buffer>,
}

impl SchedLocal {
    pub(crate) fn new(batch: usize) -> Self {
        Self {
            stash: VecDeque::with_capacity(batch),
            source: None,
            hold: None,
            paused: false,
            scratch: Vec::with_capacity(batch),
            single: Vec::with_capacity(1),
        }
    }
}

/// Logs and aborts; used when scheduler bookkeeping can no longer be trusted.
#[cold]
pub(crate) fn fatal(msg: &str) -> ! {
    error!("fatal scheduler error: {}", msg);
    std::process::abort()
}

pub(crate) struct Scheduler {
    levels: Box<[QueueHandle]>,
    counts: Box<[AtomicU32]>,
    cmd_pool: Arc<Pool>,
    polls: Box<[Mutex<Option<PollSlot>>]>,
    batch: usize,
}

impl Scheduler {
    /// Creates one plain distribution queue per priority level.
    pub(crate) fn new(queues: &QueueTable, cmd_pool: Arc<Pool>, config: &RuntimeConfig) -> Result<Self> {
        let levels = (0..config.sched_priorities)
            .map(|level| queues.create(QueueParams::plain(format!("kvarn_prio{level:02}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            levels: levels.into_boxed_slice(),
            counts: (0..config.sched_priorities).map(|_| AtomicU32::new(0)).collect(),
            cmd_pool,
            polls: (0..config.max_poll_sources).map(|_| Mutex::new(None)).collect(),
            batch: config.sched_batch,
        })
    }

    #[inline]
    pub(crate) fn num_priorities(&self) -> usize {
        self.levels.len()
    }

    #[inline]
    pub(crate) fn batch(&self) -> usize {
        self.batch
    }

    /// Resources registered at `level`, whether their token is queued or not.
    #[inline]
    pub(crate) fn level_count(&self, level: usize) -> usize {
        self.counts
            .get(level)
            .map_or(0, |count| count.load(Ordering::Acquire) as usize)
    }

    pub(crate) fn check_priority(&self, priority: usize) -> Result<()> {
        if priority < self.levels.len() {
            Ok(())
        } else {
            Err(CoreError::InvalidPriority(priority, self.levels.len()))
        }
    }

    #[inline]
    pub(crate) fn pri_set(&self, level: usize) {
        self.counts[level].fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn pri_clr(&self, level: usize) {
        self.counts[level].fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn alloc_token(&self, command: Command, owner: &str) -> Result<Buffer> {
        let mut token = self
            .cmd_pool
            .alloc_shared(COMMAND_LEN)
            .map_err(|_| CoreError::SchedulerSlotsExhausted(owner.to_owned()))?;
        let written = self
            .cmd_pool
            .data_mut(&mut token)
            .map(|data| data.copy_from_slice(&command.encode()));
        if let Err(e) = written {
            self.free_token(token);
            return Err(e);
        }
        Ok(token)
    }

    pub(crate) fn free_token(&self, token: Buffer) {
        if let Err(e) = self.cmd_pool.free_shared(token) {
            fatal(&format!("cannot release command token: {e}"));
        }
    }

    pub(crate) fn decode(&self, token: &Buffer) -> Command {
        match self.cmd_pool.data(token).ok().and_then(Command::decode) {
            Some(command) => command,
            None => fatal(&format!("corrupt command token {token:?}")),
        }
    }

    /// Makes a resource eligible again by appending its token to `level`.
    pub(crate) fn publish(&self, queues: &QueueTable, pools: &PoolTable, level: usize, token: Buffer) {
        if let Err(rejected) = queues.enqueue(pools, self.levels[level], token) {
            fatal(&format!(
                "cannot re-publish command token to level {level}: {}",
                rejected.error
            ));
        }
    }

    pub(crate) fn pop_token(&self, queues: &QueueTable, pools: &PoolTable, level: usize) -> Option<Buffer> {
        match queues.dequeue(pools, self.levels[level]) {
            Ok(token) => token,
            Err(e) => fatal(&format!("distribution queue {level} unusable: {e}")),
        }
    }

    /// Stores a poll callback and returns the token to publish.
    pub(crate) fn register_poll(
        &self,
        name: &str,
        priority: usize,
        callback: PollFn,
    ) -> Result<(PollSourceId, Buffer)> {
        self.check_priority(priority)?;
        for (index, slot) in self.polls.iter().enumerate() {
            let mut slot = slot.lock();
            if slot.is_some() {
                continue;
            }
            let source = index as u32;
            let token = self.alloc_token(Command::Poll { source }, name)?;
            *slot = Some(PollSlot {
                name: name.to_owned(),
                level: priority,
                callback: Some(callback),
            });
            self.pri_set(priority);
            info!(source = %name, priority, "poll source registered");
            return Ok((PollSourceId(source), token));
        }
        Err(CoreError::PollTableFull(self.polls.len()))
    }

    /// Takes the callback out for the duration of one poll.
    pub(crate) fn take_poll(&self, source: u32) -> Option<PollFn> {
        self.polls
            .get(source as usize)
            .and_then(|slot| slot.lock().as_mut().and_then(|s| s.callback.take()))
    }

    pub(crate) fn restore_poll(&self, source: u32, callback: PollFn) {
        if let Some(slot) = self.polls.get(source as usize) {
            if let Some(slot) = slot.lock().as_mut() {
                slot.callback = Some(callback);
            }
        }
    }

    /// Frees a poll slot, returning its level.
    pub(crate) fn remove_poll(&self, source: u32) -> Option<usize> {
        let slot = self.polls.get(source as usize)?.lock().take()?;
        info!(source = %slot.name, "poll source stopped");
        Some(slot.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{PoolParams, PoolTuning};
    use kvarn_telemetry::MetricsRecorder;

    fn scheduler(polls: usize) -> (PoolTable, QueueTable, Scheduler) {
        let pools = PoolTable::new(2);
        let metrics = Arc::new(MetricsRecorder::new("kvarn").unwrap());
        let cmd = pools
            .create(
                PoolParams::buffer(COMMAND_POOL, 4, COMMAND_LEN),
                PoolTuning::default(),
                &metrics,
            )
            .unwrap();
        let queues = QueueTable::new(8, 8);
        let config = RuntimeConfig {
            sched_priorities: 3,
            max_poll_sources: polls,
            ..Default::default()
        };
        let sched = Scheduler::new(&queues, cmd, &config).unwrap();
        (pools, queues, sched)
    }

    #[test]
    fn creates_one_distribution_queue_per_level() {
        let (_, queues, sched) = scheduler(1);
        assert_eq!(sched.num_priorities(), 3);
        assert!(queues.lookup("kvarn_prio00").is_some());
        assert!(queues.lookup("kvarn_prio02").is_some());
        assert!(matches!(
            sched.check_priority(3),
            Err(CoreError::InvalidPriority(3, 3))
        ));
    }

    #[test]
    fn tokens_circulate_through_levels() {
        let (pools, queues, sched) = scheduler(1);
        let token = sched.alloc_token(Command::Dequeue { queue: 5 }, "q").unwrap();
        sched.pri_set(1);
        sched.publish(&queues, &pools, 1, token);

        assert!(sched.pop_token(&queues, &pools, 0).is_none());
        let token = sched.pop_token(&queues, &pools, 1).unwrap();
        assert_eq!(sched.decode(&token), Command::Dequeue { queue: 5 });
        assert_eq!(sched.level_count(1), 1);

        sched.free_token(token);
        sched.pri_clr(1);
        assert_eq!(sched.level_count(1), 0);
    }

    #[test]
    fn command_pool_exhaustion_is_reported() {
        let (_, _, sched) = scheduler(0);
        let held: Vec<Buffer> = (0..4)
            .map(|i| sched.alloc_token(Command::Dequeue { queue: i }, "q").unwrap())
            .collect();
        assert!(matches!(
            sched.alloc_token(Command::Dequeue { queue: 9 }, "late"),
            Err(CoreError::SchedulerSlotsExhausted(name)) if name == "late"
        ));
        for token in held {
            sched.free_token(token);
        }
    }

    #[test]
    fn poll_table_bounds() {
        let (_, _, sched) = scheduler(1);
        let (id, token) = sched
            .register_poll("dev0", 2, Box::new(|_| PollOutcome::Idle))
            .unwrap();
        assert_eq!(sched.decode(&token), Command::Poll { source: id.0 });
        assert!(matches!(
            sched.register_poll("dev1", 0, Box::new(|_| PollOutcome::Idle)),
            Err(CoreError::PollTableFull(1))
        ));

        let callback = sched.take_poll(id.0).unwrap();
        assert!(sched.take_poll(id.0).is_none());
        sched.restore_poll(id.0, callback);
        assert_eq!(sched.remove_poll(id.0), Some(2));
        sched.free_token(token);
    }
}
