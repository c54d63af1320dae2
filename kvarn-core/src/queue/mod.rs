//! ## kvarn-core::queue
//! **Event queues with a synchronization discipline and a status machine**
//!
//! A queue is an intrusive singly linked list threaded through the `next`
//! link of each buffer's slot metadata, guarded by a per-queue mutex.
//!
//! ### Status machine
//! - plain queues: `Free → Ready → Free`
//! - scheduled queues: `Free → NotScheduled ⇄ Scheduled → Destroyed → Free`
//!
//! A scheduled queue owns exactly one command token. While the queue is idle
//! the token is parked in the queue state; the enqueue that flips the queue
//! to `Scheduled` takes it out and hands it to the scheduler, after the queue
//! lock is released.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::alloc::buffer::NIL_RAW;
use crate::alloc::{Buffer, Pool, PoolId, PoolTable};
use crate::error::{CoreError, Rejected, Result};

const NAME_LEN_MAX: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Accessed only through explicit enqueue/dequeue.
    Plain,
    /// Registered with the scheduler and handed to workers as events arrive.
    Scheduled,
}

/// Concurrency contract of a scheduled queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Discipline {
    /// Any worker, any order.
    None,
    /// One worker at a time, strict FIFO.
    #[default]
    Atomic,
    /// Declared for API compatibility; currently scheduled exactly like `None`.
    Ordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueStatus {
    Free = 0,
    Ready = 1,
    NotScheduled = 2,
    Scheduled = 3,
    Destroyed = 4,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Free => "free",
            QueueStatus::Ready => "ready",
            QueueStatus::NotScheduled => "not scheduled",
            QueueStatus::Scheduled => "scheduled",
            QueueStatus::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueParams {
    pub name: String,
    pub kind: QueueKind,
    pub discipline: Discipline,
    pub priority: usize,
    /// Scheduling group; recorded and reported, not used for filtering.
    pub group: u32,
}

impl QueueParams {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: QueueKind::Plain,
            discipline: Discipline::None,
            priority: 0,
            group: 0,
        }
    }

    pub fn scheduled(name: impl Into<String>, discipline: Discipline, priority: usize) -> Self {
        Self {
            kind: QueueKind::Scheduled,
            discipline,
            priority,
            ..Self::plain(name)
        }
    }

    pub fn with_group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }
}

/// Generation-tagged reference to a queue table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    index: u32,
    generation: u32,
}

impl QueueHandle {
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }
}

/// Opaque per-queue user context.
pub type QueueContext = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub handle: QueueHandle,
    pub name: String,
    pub kind: QueueKind,
    pub discipline: Discipline,
    pub priority: usize,
    pub group: u32,
    pub status: QueueStatus,
    pub len: usize,
}

/// Token the caller must publish to the scheduler level `level`.
#[derive(Debug)]
pub(crate) struct Publish {
    pub(crate) token: Buffer,
    pub(crate) level: usize,
}

/// Result of the scheduler draining a queue through its command token.
#[derive(Debug)]
pub(crate) enum SchedDequeue {
    /// Events were moved out; the token goes back to the scheduler.
    Events {
        handle: QueueHandle,
        discipline: Discipline,
        token: Buffer,
    },
    /// Queue was empty; the token is parked in the queue again.
    Idle,
    /// Queue had been destroyed; the slot is free and the token must be released.
    Finalized { token: Buffer, level: usize },
}

/// What the caller still has to do after [`QueueTable::destroy`].
#[derive(Debug)]
pub(crate) enum Teardown {
    Done,
    ReleaseToken { token: Buffer, level: usize },
    Deferred,
}

struct QueueState {
    status: QueueStatus,
    generation: u32,
    params: QueueParams,
    head: u64,
    tail: u64,
    count: usize,
    token: Option<Buffer>,
}

impl QueueState {
    fn vacant() -> Self {
        Self {
            status: QueueStatus::Free,
            generation: 0,
            params: QueueParams::plain(""),
            head: NIL_RAW,
            tail: NIL_RAW,
            count: 0,
            token: None,
        }
    }
}

struct QueueEntry {
    /// Lock-free mirror of `state.status` for scanning.
    hint: AtomicU8,
    state: Mutex<QueueState>,
    context: RwLock<Option<QueueContext>>,
}

impl QueueEntry {
    fn set_status(&self, state: &mut QueueState, status: QueueStatus) {
        state.status = status;
        self.hint.store(status as u8, Ordering::Release);
    }
}

/// Resolves buffer pools while walking queue links, caching the last pool.
struct Linker<'a> {
    pools: &'a PoolTable,
    last: Option<Arc<Pool>>,
}

impl<'a> Linker<'a> {
    fn new(pools: &'a PoolTable) -> Self {
        Self { pools, last: None }
    }

    fn pool(&mut self, raw: u64) -> Result<&Pool> {
        let id = PoolId((raw >> 48) as u16);
        if self.last.as_ref().map(|p| p.id()) != Some(id) {
            self.last = Some(self.pools.get(id)?);
        }
        self.last.as_deref().ok_or(CoreError::StaleHandle)
    }

    fn next(&mut self, raw: u64) -> Result<u64> {
        self.pool(raw)?.link(raw)
    }

    fn set_next(&mut self, raw: u64, next: u64) -> Result<()> {
        self.pool(raw)?.set_link(raw, next)
    }
}

pub(crate) struct QueueTable {
    entries: Box<[QueueEntry]>,
    multi_max: usize,
    control: Mutex<()>,
}

impl QueueTable {
    pub(crate) fn new(size: usize, multi_max: usize) -> Self {
        Self {
            entries: (0..size)
                .map(|_| QueueEntry {
                    hint: AtomicU8::new(QueueStatus::Free as u8),
                    state: Mutex::new(QueueState::vacant()),
                    context: RwLock::new(None),
                })
                .collect(),
            multi_max,
            control: Mutex::new(()),
        }
    }

    fn locked(&self, handle: QueueHandle) -> Result<(&QueueEntry, MutexGuard<'_, QueueState>)> {
        let entry = self
            .entries
            .get(handle.index as usize)
            .ok_or(CoreError::StaleHandle)?;
        let state = entry.state.lock();
        if state.generation != handle.generation || state.status == QueueStatus::Free {
            return Err(CoreError::StaleHandle);
        }
        Ok((entry, state))
    }

    /// Claims a free slot. Scheduled queues start `NotScheduled` without a
    /// token; see [`QueueTable::attach_token`].
    pub(crate) fn create(&self, params: QueueParams) -> Result<QueueHandle> {
        if params.name.is_empty() || params.name.len() > NAME_LEN_MAX {
            return Err(CoreError::InvalidQueueParams(format!(
                "name '{}' must be 1..={} bytes",
                params.name, NAME_LEN_MAX
            )));
        }
        let _control = self.control.lock();
        if self.lookup(&params.name).is_some() {
            return Err(CoreError::InvalidQueueParams(format!(
                "queue name '{}' already in use",
                params.name
            )));
        }
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.hint.load(Ordering::Acquire) != QueueStatus::Free as u8 {
                continue;
            }
            let mut state = entry.state.lock();
            if state.status != QueueStatus::Free {
                continue;
            }
            let status = match params.kind {
                QueueKind::Plain => QueueStatus::Ready,
                QueueKind::Scheduled => QueueStatus::NotScheduled,
            };
            state.params = params;
            state.head = NIL_RAW;
            state.tail = NIL_RAW;
            state.count = 0;
            state.token = None;
            *entry.context.write() = None;
            entry.set_status(&mut state, status);
            return Ok(QueueHandle {
                index: index as u32,
                generation: state.generation,
            });
        }
        Err(CoreError::QueueTableFull(self.entries.len()))
    }

    /// Parks the command token of a freshly created scheduled queue.
    pub(crate) fn attach_token(
        &self,
        handle: QueueHandle,
        token: Buffer,
    ) -> std::result::Result<Option<Publish>, Rejected> {
        let (_, mut state) = match self.locked(handle) {
            Ok(locked) => locked,
            Err(error) => {
                return Err(Rejected {
                    error,
                    buffer: token,
                })
            }
        };
        // an enqueue may already have flipped the queue while it had no token
        if state.status == QueueStatus::Scheduled {
            return Ok(Some(Publish {
                token,
                level: state.params.priority,
            }));
        }
        state.token = Some(token);
        Ok(None)
    }

    /// Returns a slot whose creation could not be completed.
    pub(crate) fn release(&self, handle: QueueHandle) {
        if let Ok((entry, mut state)) = self.locked(handle) {
            Self::finalize(entry, &mut state);
        }
    }

    fn finalize(entry: &QueueEntry, state: &mut QueueState) {
        state.generation = state.generation.wrapping_add(1);
        state.params.name.clear();
        state.head = NIL_RAW;
        state.tail = NIL_RAW;
        state.count = 0;
        *entry.context.write() = None;
        entry.set_status(state, QueueStatus::Free);
    }

    fn check_open(state: &QueueState) -> Result<()> {
        match state.status {
            QueueStatus::Ready | QueueStatus::NotScheduled | QueueStatus::Scheduled => Ok(()),
            status => Err(CoreError::BadQueueStatus {
                name: state.params.name.clone(),
                status: status.as_str(),
            }),
        }
    }

    /// Appends an already linked chain `first ..= last` of `n` buffers.
    fn splice(
        entry: &QueueEntry,
        state: &mut QueueState,
        linker: &mut Linker<'_>,
        first: u64,
        last: u64,
        n: usize,
    ) -> Result<Option<Publish>> {
        if state.tail == NIL_RAW {
            state.head = first;
        } else {
            linker.set_next(state.tail, first)?;
        }
        state.tail = last;
        state.count += n;

        if state.status == QueueStatus::NotScheduled {
            entry.set_status(state, QueueStatus::Scheduled);
            return Ok(state.token.take().map(|token| Publish {
                token,
                level: state.params.priority,
            }));
        }
        Ok(None)
    }

    pub(crate) fn enqueue(
        &self,
        pools: &PoolTable,
        handle: QueueHandle,
        buf: Buffer,
    ) -> std::result::Result<Option<Publish>, Rejected> {
        let reject = |error, buffer| Rejected { error, buffer };
        let (entry, mut state) = match self.locked(handle) {
            Ok(locked) => locked,
            Err(e) => return Err(reject(e, buf)),
        };
        if let Err(e) = Self::check_open(&state) {
            return Err(reject(e, buf));
        }
        let mut linker = Linker::new(pools);
        let raw = buf.raw();
        if let Err(e) = linker.set_next(raw, NIL_RAW) {
            return Err(reject(e, buf));
        }
        match Self::splice(entry, &mut state, &mut linker, raw, raw, 1) {
            Ok(publish) => {
                let _ = buf.into_raw();
                Ok(publish)
            }
            Err(e) => Err(reject(e, buf)),
        }
    }

    /// Moves up to `queue_multi_max` buffers from the front of `bufs`.
    pub(crate) fn enqueue_multi(
        &self,
        pools: &PoolTable,
        handle: QueueHandle,
        bufs: &mut Vec<Buffer>,
    ) -> Result<(usize, Option<Publish>)> {
        let n = bufs.len().min(self.multi_max);
        if n == 0 {
            return Ok((0, None));
        }
        let (entry, mut state) = self.locked(handle)?;
        Self::check_open(&state)?;

        let mut linker = Linker::new(pools);
        for i in 0..n {
            let next = if i + 1 < n { bufs[i + 1].raw() } else { NIL_RAW };
            linker.set_next(bufs[i].raw(), next)?;
        }
        let publish = Self::splice(
            entry,
            &mut state,
            &mut linker,
            bufs[0].raw(),
            bufs[n - 1].raw(),
            n,
        )?;
        drop(state);

        for buf in bufs.drain(..n) {
            let _ = buf.into_raw();
        }
        Ok((n, publish))
    }

    fn take(
        state: &mut QueueState,
        linker: &mut Linker<'_>,
        max: usize,
        mut push: impl FnMut(Buffer),
    ) -> Result<usize> {
        let mut n = 0;
        while n < max && state.head != NIL_RAW {
            let raw = state.head;
            state.head = linker.next(raw)?;
            state.count -= 1;
            // SAFETY: the raw word came from `Buffer::into_raw` at enqueue
            push(unsafe { Buffer::from_raw(raw) });
            n += 1;
        }
        if state.head == NIL_RAW {
            state.tail = NIL_RAW;
        }
        Ok(n)
    }

    pub(crate) fn dequeue(&self, pools: &PoolTable, handle: QueueHandle) -> Result<Option<Buffer>> {
        let mut out = None;
        self.dequeue_with(pools, handle, 1, |buf| out = Some(buf))?;
        Ok(out)
    }

    pub(crate) fn dequeue_multi(
        &self,
        pools: &PoolTable,
        handle: QueueHandle,
        out: &mut Vec<Buffer>,
        max: usize,
    ) -> Result<usize> {
        self.dequeue_with(pools, handle, max, |buf| out.push(buf))
    }

    fn dequeue_with(
        &self,
        pools: &PoolTable,
        handle: QueueHandle,
        max: usize,
        push: impl FnMut(Buffer),
    ) -> Result<usize> {
        let (entry, mut state) = self.locked(handle)?;
        if state.status == QueueStatus::Destroyed {
            return Err(CoreError::QueueDestroyed);
        }
        let mut linker = Linker::new(pools);
        let n = Self::take(&mut state, &mut linker, max.min(self.multi_max), push)?;
        if state.count == 0 && state.status == QueueStatus::Scheduled {
            entry.set_status(&mut state, QueueStatus::NotScheduled);
        }
        Ok(n)
    }

    /// Drains up to `max` events on behalf of the queue's command token.
    pub(crate) fn sched_dequeue(
        &self,
        pools: &PoolTable,
        index: u32,
        token: Buffer,
        out: &mut Vec<Buffer>,
        max: usize,
    ) -> Result<SchedDequeue> {
        let entry = self
            .entries
            .get(index as usize)
            .ok_or(CoreError::StaleHandle)?;
        let mut state = entry.state.lock();
        match state.status {
            QueueStatus::Destroyed => {
                let level = state.params.priority;
                Self::finalize(entry, &mut state);
                return Ok(SchedDequeue::Finalized { token, level });
            }
            QueueStatus::NotScheduled | QueueStatus::Scheduled => {}
            QueueStatus::Free | QueueStatus::Ready => return Err(CoreError::StaleHandle),
        }

        if state.count == 0 {
            entry.set_status(&mut state, QueueStatus::NotScheduled);
            state.token = Some(token);
            return Ok(SchedDequeue::Idle);
        }

        let mut linker = Linker::new(pools);
        Self::take(&mut state, &mut linker, max, |buf| out.push(buf))?;
        if state.count == 0 {
            entry.set_status(&mut state, QueueStatus::NotScheduled);
        }
        Ok(SchedDequeue::Events {
            handle: QueueHandle {
                index,
                generation: state.generation,
            },
            discipline: state.params.discipline,
            token,
        })
    }

    pub(crate) fn destroy(&self, handle: QueueHandle) -> Result<Teardown> {
        let (entry, mut state) = self.locked(handle)?;
        if state.status == QueueStatus::Destroyed {
            return Err(CoreError::BadQueueStatus {
                name: state.params.name.clone(),
                status: QueueStatus::Destroyed.as_str(),
            });
        }
        if state.count > 0 {
            return Err(CoreError::QueueNotEmpty(state.params.name.clone()));
        }
        match state.status {
            QueueStatus::Ready => {
                Self::finalize(entry, &mut state);
                Ok(Teardown::Done)
            }
            _ => match state.token.take() {
                Some(token) => {
                    let level = state.params.priority;
                    Self::finalize(entry, &mut state);
                    Ok(Teardown::ReleaseToken { token, level })
                }
                None => {
                    entry.set_status(&mut state, QueueStatus::Destroyed);
                    Ok(Teardown::Deferred)
                }
            },
        }
    }

    pub(crate) fn set_context(&self, handle: QueueHandle, context: Option<QueueContext>) -> Result<()> {
        let (entry, _state) = self.locked(handle)?;
        *entry.context.write() = context;
        Ok(())
    }

    pub(crate) fn context(&self, handle: QueueHandle) -> Result<Option<QueueContext>> {
        let (entry, _state) = self.locked(handle)?;
        let context = entry.context.read().clone();
        Ok(context)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<QueueHandle> {
        self.entries.iter().enumerate().find_map(|(index, entry)| {
            let hint = entry.hint.load(Ordering::Acquire);
            if hint == QueueStatus::Free as u8 || hint == QueueStatus::Destroyed as u8 {
                return None;
            }
            let state = entry.state.lock();
            let live = !matches!(state.status, QueueStatus::Free | QueueStatus::Destroyed);
            (live && state.params.name == name).then_some(QueueHandle {
                index: index as u32,
                generation: state.generation,
            })
        })
    }

    pub(crate) fn info(&self, handle: QueueHandle) -> Result<QueueInfo> {
        let (_, state) = self.locked(handle)?;
        Ok(QueueInfo {
            handle,
            name: state.params.name.clone(),
            kind: state.params.kind,
            discipline: state.params.discipline,
            priority: state.params.priority,
            group: state.params.group,
            status: state.status,
            len: state.count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{LocalCache, PoolParams, PoolTuning};
    use kvarn_telemetry::MetricsRecorder;

    struct Fixture {
        pools: PoolTable,
        pool: Arc<Pool>,
        queues: QueueTable,
        cache: LocalCache,
    }

    impl Fixture {
        fn new() -> Self {
            let pools = PoolTable::new(2);
            let metrics = Arc::new(MetricsRecorder::new("kvarn").unwrap());
            let pool = pools
                .create(PoolParams::buffer("q", 32, 8), PoolTuning::default(), &metrics)
                .unwrap();
            Self {
                pools,
                pool,
                queues: QueueTable::new(4, 8),
                cache: LocalCache::new(0),
            }
        }

        fn buf(&mut self, tag: u8) -> Buffer {
            let mut buf = self.pool.alloc(&mut self.cache, 1).unwrap();
            self.pool.data_mut(&mut buf).unwrap()[0] = tag;
            buf
        }

        fn tag(&self, buf: &Buffer) -> u8 {
            self.pool.data(buf).unwrap()[0]
        }
    }

    #[test]
    fn plain_queue_is_fifo() {
        let mut fx = Fixture::new();
        let q = fx.queues.create(QueueParams::plain("fifo")).unwrap();

        let mut bufs: Vec<Buffer> = (0..5).map(|i| fx.buf(i)).collect();
        let (n, publish) = fx.queues.enqueue_multi(&fx.pools, q, &mut bufs).unwrap();
        assert_eq!(n, 5);
        assert!(publish.is_none());
        let extra = fx.buf(5);
        fx.queues.enqueue(&fx.pools, q, extra).unwrap();
        assert_eq!(fx.queues.info(q).unwrap().len, 6);

        let mut out = Vec::new();
        assert_eq!(fx.queues.dequeue_multi(&fx.pools, q, &mut out, 4).unwrap(), 4);
        while let Some(buf) = fx.queues.dequeue(&fx.pools, q).unwrap() {
            out.push(buf);
        }
        let tags: Vec<u8> = out.iter().map(|b| fx.tag(b)).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(fx.queues.info(q).unwrap().len, 0);
    }

    #[test]
    fn multi_enqueue_is_clamped() {
        let mut fx = Fixture::new();
        let q = fx.queues.create(QueueParams::plain("clamp")).unwrap();
        let mut bufs: Vec<Buffer> = (0..10).map(|i| fx.buf(i)).collect();
        let (n, _) = fx.queues.enqueue_multi(&fx.pools, q, &mut bufs).unwrap();
        assert_eq!(n, 8);
        assert_eq!(bufs.len(), 2);
        assert_eq!(fx.tag(&bufs[0]), 8);
    }

    #[test]
    fn first_enqueue_publishes_parked_token() {
        let mut fx = Fixture::new();
        let q = fx
            .queues
            .create(QueueParams::scheduled("s", Discipline::Atomic, 3))
            .unwrap();
        assert_eq!(fx.queues.info(q).unwrap().status, QueueStatus::NotScheduled);
        let token = fx.buf(0xEE);
        assert!(fx.queues.attach_token(q, token).unwrap().is_none());

        let first = fx.buf(1);
        let publish = fx.queues.enqueue(&fx.pools, q, first).unwrap().unwrap();
        assert_eq!(publish.level, 3);
        assert_eq!(fx.tag(&publish.token), 0xEE);
        assert_eq!(fx.queues.info(q).unwrap().status, QueueStatus::Scheduled);

        // already scheduled: no second publication
        let second = fx.buf(2);
        assert!(fx.queues.enqueue(&fx.pools, q, second).unwrap().is_none());

        let mut out = Vec::new();
        match fx
            .queues
            .sched_dequeue(&fx.pools, q.index(), publish.token, &mut out, 8)
            .unwrap()
        {
            SchedDequeue::Events { handle, discipline, token } => {
                assert_eq!(handle, q);
                assert_eq!(discipline, Discipline::Atomic);
                assert_eq!(out.len(), 2);
                // empty again: the next pass parks the token
                assert!(matches!(
                    fx.queues.sched_dequeue(&fx.pools, q.index(), token, &mut out, 8).unwrap(),
                    SchedDequeue::Idle
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.queues.info(q).unwrap().status, QueueStatus::NotScheduled);
    }

    #[test]
    fn destroy_rules() {
        let mut fx = Fixture::new();

        let plain = fx.queues.create(QueueParams::plain("p")).unwrap();
        let buf = fx.buf(1);
        fx.queues.enqueue(&fx.pools, plain, buf).unwrap();
        assert!(matches!(
            fx.queues.destroy(plain),
            Err(CoreError::QueueNotEmpty(_))
        ));
        let buf = fx.queues.dequeue(&fx.pools, plain).unwrap().unwrap();
        fx.pool.free(&mut fx.cache, buf).unwrap();
        assert!(matches!(fx.queues.destroy(plain).unwrap(), Teardown::Done));
        assert!(matches!(fx.queues.destroy(plain), Err(CoreError::StaleHandle)));

        // idle scheduled queue hands its token back at once
        let idle = fx
            .queues
            .create(QueueParams::scheduled("idle", Discipline::None, 1))
            .unwrap();
        let token = fx.buf(0);
        fx.queues.attach_token(idle, token).unwrap();
        match fx.queues.destroy(idle).unwrap() {
            Teardown::ReleaseToken { token, level } => {
                assert_eq!(level, 1);
                fx.pool.free(&mut fx.cache, token).unwrap();
            }
            other => panic!("unexpected {other:?}"),
        }

        // token in circulation: teardown waits for it
        let busy = fx
            .queues
            .create(QueueParams::scheduled("busy", Discipline::Atomic, 0))
            .unwrap();
        let token = fx.buf(0);
        fx.queues.attach_token(busy, token).unwrap();
        let ev = fx.buf(9);
        let publish = fx.queues.enqueue(&fx.pools, busy, ev).unwrap().unwrap();
        let ev = fx.queues.dequeue(&fx.pools, busy).unwrap().unwrap();
        fx.pool.free(&mut fx.cache, ev).unwrap();
        assert!(matches!(fx.queues.destroy(busy).unwrap(), Teardown::Deferred));
        assert!(fx.queues.lookup("busy").is_none());

        let late = fx.buf(3);
        let rejected = fx.queues.enqueue(&fx.pools, busy, late).unwrap_err();
        assert!(matches!(rejected.error, CoreError::BadQueueStatus { .. }));
        fx.pool.free(&mut fx.cache, rejected.buffer).unwrap();
        assert!(matches!(
            fx.queues.dequeue(&fx.pools, busy),
            Err(CoreError::QueueDestroyed)
        ));
        assert!(matches!(
            fx.queues.destroy(busy),
            Err(CoreError::BadQueueStatus { .. })
        ));

        let mut out = Vec::new();
        match fx
            .queues
            .sched_dequeue(&fx.pools, busy.index(), publish.token, &mut out, 4)
            .unwrap()
        {
            SchedDequeue::Finalized { token, level } => {
                assert_eq!(level, 0);
                fx.pool.free(&mut fx.cache, token).unwrap();
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(fx.queues.info(busy), Err(CoreError::StaleHandle)));
    }

    #[test]
    fn table_full_and_slot_reuse() {
        let fx = Fixture::new();
        let handles: Vec<QueueHandle> = (0..4)
            .map(|i| fx.queues.create(QueueParams::plain(format!("q{i}"))).unwrap())
            .collect();
        assert!(matches!(
            fx.queues.create(QueueParams::plain("extra")),
            Err(CoreError::QueueTableFull(4))
        ));

        fx.queues.destroy(handles[2]).unwrap();
        let reused = fx.queues.create(QueueParams::plain("again")).unwrap();
        assert_eq!(reused.index(), handles[2].index());
        assert_ne!(reused, handles[2]);
        assert!(matches!(fx.queues.info(handles[2]), Err(CoreError::StaleHandle)));
        assert_eq!(fx.queues.lookup("again"), Some(reused));
    }

    #[test]
    fn names_are_unique_among_live_queues() {
        let fx = Fixture::new();
        let q = fx.queues.create(QueueParams::plain("rx")).unwrap();
        assert!(matches!(
            fx.queues.create(QueueParams::plain("rx")),
            Err(CoreError::InvalidQueueParams(_))
        ));
        assert!(matches!(
            fx.queues
                .create(QueueParams::scheduled("rx", Discipline::Atomic, 0)),
            Err(CoreError::InvalidQueueParams(_))
        ));
        assert_eq!(fx.queues.lookup("rx"), Some(q));

        // a destroyed queue frees its name
        fx.queues.destroy(q).unwrap();
        let again = fx.queues.create(QueueParams::plain("rx")).unwrap();
        assert_eq!(fx.queues.lookup("rx"), Some(again));
    }

    #[test]
    fn context_round_trip() {
        let fx = Fixture::new();
        let q = fx.queues.create(QueueParams::plain("ctx")).unwrap();
        assert!(fx.queues.context(q).unwrap().is_none());

        fx.queues.set_context(q, Some(Arc::new(17u32))).unwrap();
        let ctx = fx.queues.context(q).unwrap().unwrap();
        assert_eq!(ctx.downcast_ref::<u32>(), Some(&17));

        fx.queues.destroy(q).unwrap();
        let next = fx.queues.create(QueueParams::plain("ctx")).unwrap();
        assert!(fx.queues.context(next).unwrap().is_none());
    }
}
