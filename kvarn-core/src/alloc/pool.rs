//! ## kvarn-core::alloc::pool
//! **Fixed-arena buffer pool with a lock-free shared free list**
//!
//! ### Layout
//! - One contiguous data arena of `capacity` slots, each `stride` bytes
//! - One optional user-area arena of `capacity × uarea_size` bytes
//! - One [`SlotMeta`] per slot, carrying all links and per-buffer state
//!
//! ### Free list
//! The shared list head is a single `AtomicU64` packing `tag << 32 | index`.
//! Every successful pop or push bumps the tag, so a pop that read a stale
//! `free_next` fails its CAS instead of corrupting the list (ABA).
//!
//! ### Watermarks
//! `high = capacity / 2`, `low = capacity / 4`, measured on the shared free
//! count. "low" fires once when the count drops to `low`; "cleared" fires once
//! when it climbs back to `high`. While low is asserted, frees bypass the
//! local caches so cached buffers do not starve other workers.
//!
//! ### Destroy
//! `prepare_destroy` raises the `destroyed` flag before it counts the free
//! list; alloc re-reads the flag after taking its slots. Either the allocation
//! backs off or the destroy sees the missing slot, never neither. A destroyed
//! pool refuses every further alloc and free, even through an `Arc` obtained
//! before the destroy. An allocation that meets a destroy attempt which later
//! fails reports `PoolDestroyed` once; frees of live buffers always succeed.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use kvarn_config::{BackoffStrategy, PoolConfig, PoolKind};
use kvarn_telemetry::metrics::{EDGE_CLEARED, EDGE_LOW};
use kvarn_telemetry::MetricsRecorder;
use tracing::{debug, warn};

use super::buffer::{
    Buffer, PoolId, SlotMeta, MAX_SEGMENTS, NIL_INDEX, NIL_RAW, OWNER_FREE, OWNER_SHARED,
};
use super::cache::LocalCache;
use super::stats::{PoolStats, PoolStatsSnapshot};
use crate::backoff::Spinner;
use crate::error::{CoreError, Result};

/// Default packet headroom.
pub const PACKET_HEADROOM: usize = 64;
/// Default packet tailroom.
pub const PACKET_TAILROOM: usize = 8;
/// Packet segments are never shorter than this.
pub const PACKET_SEG_LEN_MIN: usize = 64;

const SLOT_ALIGN: usize = 16;
const NAME_LEN_MAX: usize = 32;

/// Parameters fixed at pool creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolParams {
    pub name: String,
    pub kind: PoolKind,
    pub capacity: usize,
    pub seg_size: usize,
    pub headroom: usize,
    pub tailroom: usize,
    pub zeroize: bool,
    pub uarea_size: usize,
}

impl PoolParams {
    /// Unsegmented buffers of up to `size` bytes.
    pub fn buffer(name: impl Into<String>, capacity: usize, size: usize) -> Self {
        Self {
            name: name.into(),
            kind: PoolKind::Buffer,
            capacity,
            seg_size: size,
            headroom: 0,
            tailroom: 0,
            zeroize: false,
            uarea_size: 0,
        }
    }

    /// Packets of up to [`MAX_SEGMENTS`] segments of `seg_size` bytes.
    pub fn packet(name: impl Into<String>, capacity: usize, seg_size: usize) -> Self {
        Self {
            kind: PoolKind::Packet,
            headroom: PACKET_HEADROOM,
            tailroom: PACKET_TAILROOM,
            ..Self::buffer(name, capacity, seg_size)
        }
    }

    pub fn timeout(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            kind: PoolKind::Timeout,
            ..Self::buffer(name, capacity, 0)
        }
    }

    pub fn with_zeroize(mut self, zeroize: bool) -> Self {
        self.zeroize = zeroize;
        self
    }

    pub fn with_uarea(mut self, size: usize) -> Self {
        self.uarea_size = size;
        self
    }

    pub fn with_room(mut self, headroom: usize, tailroom: usize) -> Self {
        self.headroom = headroom;
        self.tailroom = tailroom;
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CoreError::InvalidPoolParams(msg));
        if self.name.is_empty() || self.name.len() > NAME_LEN_MAX {
            return invalid(format!("name '{}' must be 1..={} bytes", self.name, NAME_LEN_MAX));
        }
        if self.capacity == 0 || self.capacity >= NIL_INDEX as usize {
            return invalid(format!("capacity {} out of range", self.capacity));
        }
        match self.kind {
            PoolKind::Buffer if self.seg_size == 0 => invalid("buffer pools need a size".into()),
            PoolKind::Packet
                if self.headroom + self.tailroom
                    >= self.seg_size.max(PACKET_SEG_LEN_MIN) * MAX_SEGMENTS =>
            {
                invalid(format!(
                    "headroom {} + tailroom {} leave no room for data",
                    self.headroom, self.tailroom
                ))
            }
            _ => Ok(()),
        }
    }
}

impl From<&PoolConfig> for PoolParams {
    fn from(config: &PoolConfig) -> Self {
        Self {
            name: config.name.clone(),
            kind: config.kind,
            capacity: config.capacity,
            seg_size: config.seg_size,
            headroom: config.headroom,
            tailroom: config.tailroom,
            zeroize: config.zeroize,
            uarea_size: config.uarea_size,
        }
    }
}

/// Runtime-wide knobs applied to every pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolTuning {
    pub local_cache_limit: usize,
    pub backoff: BackoffStrategy,
    pub predefined: bool,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            local_cache_limit: 256,
            backoff: BackoffStrategy::default(),
            predefined: false,
        }
    }
}

/// Backpressure state derived from the watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    Normal,
    Low,
}

#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub id: PoolId,
    pub name: String,
    pub kind: PoolKind,
    pub capacity: usize,
    pub seg_size: usize,
    pub headroom: usize,
    pub tailroom: usize,
    pub uarea_size: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub predefined: bool,
}

pub struct Pool {
    id: PoolId,
    params: PoolParams,
    tuning: PoolTuning,
    stride: usize,
    arena: Box<[UnsafeCell<u8>]>,
    uarea: Box<[UnsafeCell<u8>]>,
    slots: Box<[SlotMeta]>,
    head: CachePadded<AtomicU64>,
    shared_free: CachePadded<AtomicUsize>,
    outstanding: AtomicUsize,
    cached: AtomicUsize,
    high_wm: usize,
    low_wm: usize,
    low_asserted: AtomicBool,
    destroyed: AtomicBool,
    stats: PoolStats,
    metrics: Option<Arc<MetricsRecorder>>,
}

// SAFETY: arena bytes are only reached through a live `Buffer` (exclusive by
// construction) or while a slot is being freed by its sole owner.
unsafe impl Sync for Pool {}

#[inline]
fn pack(tag: u32, index: u32) -> u64 {
    (tag as u64) << 32 | index as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

fn zeroed_cells(len: usize) -> Result<Box<[UnsafeCell<u8>]>> {
    let mut cells = Vec::new();
    cells
        .try_reserve_exact(len)
        .map_err(|_| CoreError::OutOfMemory(len))?;
    cells.resize_with(len, || UnsafeCell::new(0));
    Ok(cells.into_boxed_slice())
}

impl Pool {
    /// Carves a pool and links every slot into the shared free list.
    pub fn new(id: PoolId, mut params: PoolParams, tuning: PoolTuning) -> Result<Self> {
        params.validate()?;
        match params.kind {
            PoolKind::Packet => params.seg_size = params.seg_size.max(PACKET_SEG_LEN_MIN),
            PoolKind::Buffer | PoolKind::Timeout => {
                params.headroom = 0;
                params.tailroom = 0;
            }
        }

        let capacity = params.capacity;
        let stride = params.seg_size.div_ceil(SLOT_ALIGN) * SLOT_ALIGN;
        let arena_len = capacity
            .checked_mul(stride)
            .ok_or(CoreError::OutOfMemory(usize::MAX))?;
        let uarea_len = capacity
            .checked_mul(params.uarea_size)
            .ok_or(CoreError::OutOfMemory(usize::MAX))?;
        let arena = zeroed_cells(arena_len)?;
        let uarea = zeroed_cells(uarea_len)?;

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| CoreError::OutOfMemory(capacity * std::mem::size_of::<SlotMeta>()))?;
        slots.extend((0..capacity).map(|i| {
            let next = if i + 1 < capacity {
                (i + 1) as u32
            } else {
                NIL_INDEX
            };
            SlotMeta::new(next)
        }));

        Ok(Self {
            id,
            stride,
            arena,
            uarea,
            slots: slots.into_boxed_slice(),
            head: CachePadded::new(AtomicU64::new(pack(0, 0))),
            shared_free: CachePadded::new(AtomicUsize::new(capacity)),
            outstanding: AtomicUsize::new(0),
            cached: AtomicUsize::new(0),
            high_wm: capacity / 2,
            low_wm: capacity / 4,
            low_asserted: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            stats: PoolStats::new(),
            metrics: None,
            params,
            tuning,
        })
    }

    pub(crate) fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[inline]
    pub fn id(&self) -> PoolId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.params.name
    }

    #[inline]
    pub fn kind(&self) -> PoolKind {
        self.params.kind
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.params.capacity
    }

    #[inline]
    pub fn is_predefined(&self) -> bool {
        self.tuning.predefined
    }

    /// Slots on the shared free list.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.shared_free.load(Ordering::Acquire)
    }

    /// Slots held by buffers that are allocated (segments included).
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Slots parked in workers' local caches.
    #[inline]
    pub fn cached(&self) -> usize {
        self.cached.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn watermark(&self) -> Watermark {
        if self.low_asserted.load(Ordering::Acquire) {
            Watermark::Low
        } else {
            Watermark::Normal
        }
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            id: self.id,
            name: self.params.name.clone(),
            kind: self.params.kind,
            capacity: self.params.capacity,
            seg_size: self.params.seg_size,
            headroom: self.params.headroom,
            tailroom: self.params.tailroom,
            uarea_size: self.params.uarea_size,
            high_watermark: self.high_wm,
            low_watermark: self.low_wm,
            predefined: self.tuning.predefined,
        }
    }

    /// Largest `size` accepted by [`Pool::alloc`].
    pub fn max_alloc(&self) -> usize {
        match self.params.kind {
            PoolKind::Packet => {
                self.params.seg_size * MAX_SEGMENTS - self.params.headroom - self.params.tailroom
            }
            PoolKind::Buffer | PoolKind::Timeout => self.params.seg_size,
        }
    }

    /// Allocates through the caller's local cache, falling back to the
    /// shared free list.
    pub fn alloc(&self, cache: &mut LocalCache, size: usize) -> Result<Buffer> {
        let owner = cache.worker();
        self.alloc_from(Some(cache), owner, size)
    }

    /// Allocates straight from the shared free list.
    pub fn alloc_shared(&self, size: usize) -> Result<Buffer> {
        self.alloc_from(None, OWNER_SHARED, size)
    }

    /// Returns a buffer to the caller's local cache, or to the shared list
    /// while the low watermark is asserted.
    pub fn free(&self, cache: &mut LocalCache, buf: Buffer) -> Result<()> {
        self.free_into(Some(cache), buf)
    }

    pub fn free_shared(&self, buf: Buffer) -> Result<()> {
        self.free_into(None, buf)
    }

    /// Moves every slot in `cache` back to the shared list.
    pub fn flush_cache(&self, cache: &mut LocalCache) -> usize {
        if !cache.serves(self.id) {
            return 0;
        }
        let n = cache.count;
        self.spill(cache, n);
        n
    }

    /// Fails unless every slot is back on the shared list. Flushes `cache` first.
    pub(crate) fn prepare_destroy(&self, cache: Option<&mut LocalCache>) -> Result<()> {
        if self.tuning.predefined {
            return Err(CoreError::PoolPredefined(self.params.name.clone()));
        }
        if let Some(cache) = cache {
            self.flush_cache(cache);
        }
        if self
            .destroyed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Err(CoreError::PoolDestroyed(self.params.name.clone()));
        }
        let free = self.shared_free.load(Ordering::SeqCst);
        if free != self.params.capacity {
            self.destroyed.store(false, Ordering::SeqCst);
            return Err(CoreError::PoolBusy {
                name: self.params.name.clone(),
                outstanding: self.params.capacity - free,
            });
        }
        Ok(())
    }

    fn destroyed_error(&self) -> CoreError {
        warn!(pool = %self.params.name, id = %self.id, "access to destroyed pool");
        CoreError::PoolDestroyed(self.params.name.clone())
    }

    fn alloc_from(
        &self,
        mut cache: Option<&mut LocalCache>,
        owner: u32,
        size: usize,
    ) -> Result<Buffer> {
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }
        let segs = self.segments_for(size)?;
        let mut taken = [NIL_INDEX; MAX_SEGMENTS];
        for k in 0..segs {
            match self.take_slot(cache.as_deref_mut()) {
                Some(index) => taken[k] = index,
                None => {
                    for &index in &taken[..k] {
                        self.release_slot(index, cache.as_deref_mut());
                    }
                    return Err(self.exhausted());
                }
            }
        }
        if self.destroyed.load(Ordering::SeqCst) {
            // lost the race with a destroy; hand the slots back untouched
            for &index in &taken[..segs] {
                self.push_shared(index);
            }
            return Err(self.destroyed_error());
        }
        Ok(self.stamp(&taken[..segs], owner, size))
    }

    fn segments_for(&self, size: usize) -> Result<usize> {
        let limit = self.max_alloc();
        if size > limit {
            self.stats.increment_rejected();
            return Err(CoreError::Oversized {
                requested: size,
                limit,
            });
        }
        match self.params.kind {
            PoolKind::Packet => {
                let total = self.params.headroom + size + self.params.tailroom;
                Ok(total.div_ceil(self.params.seg_size).max(1))
            }
            PoolKind::Buffer | PoolKind::Timeout => Ok(1),
        }
    }

    fn exhausted(&self) -> CoreError {
        self.stats.increment_empty();
        if let Some(metrics) = &self.metrics {
            metrics.inc_alloc_failure(&self.params.name);
        }
        CoreError::PoolExhausted(self.params.name.clone())
    }

    fn stamp(&self, indices: &[u32], owner: u32, size: usize) -> Buffer {
        for (k, &index) in indices.iter().enumerate() {
            let slot = &self.slots[index as usize];
            slot.owner.store(owner, Ordering::Relaxed);
            let next = indices.get(k + 1).copied().unwrap_or(NIL_INDEX);
            slot.seg_next.store(next, Ordering::Relaxed);
        }

        let head = indices[0];
        let meta = &self.slots[head as usize];
        let generation = meta.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        meta.segcount.store(indices.len() as u32, Ordering::Relaxed);
        meta.offset.store(self.params.headroom as u32, Ordering::Relaxed);
        meta.len.store(size as u32, Ordering::Relaxed);
        meta.next.store(NIL_RAW, Ordering::Relaxed);
        meta.user_ctx.store(0, Ordering::Relaxed);

        self.outstanding.fetch_add(indices.len(), Ordering::AcqRel);
        self.stats.increment_allocs();
        Buffer::new(self.id, head, generation)
    }

    fn free_into(&self, mut cache: Option<&mut LocalCache>, buf: Buffer) -> Result<()> {
        // a live buffer keeps any destroy from completing, so only handles
        // that fail validation can meet a destroyed pool here
        let head = match self.check(&buf) {
            Ok(head) => head,
            Err(_) if self.is_destroyed() => return Err(self.destroyed_error()),
            Err(e) => return Err(e),
        };
        let meta = &self.slots[head];
        if meta.owner.swap(OWNER_FREE, Ordering::AcqRel) == OWNER_FREE {
            if self.is_destroyed() {
                return Err(self.destroyed_error());
            }
            warn!(pool = %self.params.name, index = head, "double free");
            return Err(CoreError::DoubleFree(buf.into_raw()));
        }

        let segs = meta.segcount.load(Ordering::Relaxed) as usize;
        let mut index = head as u32;
        let mut released = 0;
        while index != NIL_INDEX && released < segs {
            let slot = &self.slots[index as usize];
            let next = slot.seg_next.swap(NIL_INDEX, Ordering::Relaxed);
            slot.owner.store(OWNER_FREE, Ordering::Relaxed);
            if self.params.zeroize {
                // SAFETY: the slot is owned by this call until released below
                unsafe { std::ptr::write_bytes(self.slot_ptr(index), 0, self.stride) };
            }
            self.release_slot(index, cache.as_deref_mut());
            index = next;
            released += 1;
        }

        self.outstanding.fetch_sub(released, Ordering::AcqRel);
        self.stats.increment_frees();
        Ok(())
    }

    fn check(&self, buf: &Buffer) -> Result<usize> {
        let index = buf.index() as usize;
        match self.slots.get(index) {
            Some(meta) if buf.pool_id() == self.id && meta.matches(buf) => Ok(index),
            Some(_) if buf.pool_id() == self.id => {
                warn!(pool = %self.params.name, index, "stale buffer handle");
                Err(CoreError::StaleHandle)
            }
            _ => {
                warn!(pool = %self.params.name, buffer = ?buf, "buffer of another pool");
                Err(CoreError::ForeignBuffer(buf.raw()))
            }
        }
    }

    fn take_slot(&self, cache: Option<&mut LocalCache>) -> Option<u32> {
        if let Some(cache) = cache {
            if cache.serves(self.id) {
                let index = cache.head;
                cache.head = self.slots[index as usize].free_next.load(Ordering::Relaxed);
                cache.count -= 1;
                self.cached.fetch_sub(1, Ordering::AcqRel);
                return Some(index);
            }
        }
        self.pop_shared()
    }

    fn release_slot(&self, index: u32, cache: Option<&mut LocalCache>) {
        if !self.low_asserted.load(Ordering::Acquire) {
            if let Some(cache) = cache {
                if cache.accepts(self.id) {
                    self.slots[index as usize]
                        .free_next
                        .store(cache.head, Ordering::Relaxed);
                    cache.head = index;
                    cache.count += 1;
                    self.cached.fetch_add(1, Ordering::AcqRel);
                    if cache.count > self.tuning.local_cache_limit {
                        let half = cache.count / 2;
                        self.spill(cache, half);
                    }
                    return;
                }
            }
        }
        self.push_shared(index);
    }

    fn spill(&self, cache: &mut LocalCache, n: usize) {
        for _ in 0..n.min(cache.count) {
            let index = cache.head;
            cache.head = self.slots[index as usize].free_next.load(Ordering::Relaxed);
            cache.count -= 1;
            self.cached.fetch_sub(1, Ordering::AcqRel);
            self.push_shared(index);
        }
    }

    fn pop_shared(&self) -> Option<u32> {
        let spinner = Spinner::new(self.tuning.backoff);
        let mut current = self.head.load(Ordering::Acquire);
        let index = loop {
            let (tag, index) = unpack(current);
            if index == NIL_INDEX {
                return None;
            }
            let next = self.slots[index as usize].free_next.load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                current,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break index,
                Err(actual) => {
                    current = actual;
                    spinner.retry();
                }
            }
        };

        // decremented only after the CAS, so the count never underflows
        let free = self.shared_free.fetch_sub(1, Ordering::SeqCst) - 1;
        if free <= self.low_wm
            && self
                .low_asserted
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.on_low(free);
        }
        Some(index)
    }

    fn push_shared(&self, index: u32) {
        let free = self.shared_free.fetch_add(1, Ordering::SeqCst) + 1;
        let spinner = Spinner::new(self.tuning.backoff);
        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            let (tag, head) = unpack(current);
            self.slots[index as usize]
                .free_next
                .store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                current,
                pack(tag.wrapping_add(1), index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => {
                    current = actual;
                    spinner.retry();
                }
            }
        }

        if free >= self.high_wm
            && self
                .low_asserted
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.on_cleared(free);
        }
    }

    fn on_low(&self, free: usize) {
        self.stats.increment_low_wm();
        debug!(pool = %self.params.name, free, "pool reached low watermark");
        if let Some(metrics) = &self.metrics {
            metrics.inc_watermark_edge(&self.params.name, EDGE_LOW);
        }
    }

    fn on_cleared(&self, free: usize) {
        self.stats.increment_high_wm();
        debug!(pool = %self.params.name, free, "pool low watermark cleared");
        if let Some(metrics) = &self.metrics {
            metrics.inc_watermark_edge(&self.params.name, EDGE_CLEARED);
        }
    }

    // ---- data access -------------------------------------------------------

    #[inline]
    fn slot_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: index < capacity, so the offset stays inside the arena
        unsafe { UnsafeCell::raw_get(self.arena.as_ptr().add(index as usize * self.stride)) }
    }

    /// Metadata of a live handle; foreign, stale and freed handles are refused.
    fn meta(&self, buf: &Buffer) -> Result<&SlotMeta> {
        let meta = &self.slots[self.check(buf)?];
        if meta.owner.load(Ordering::Acquire) == OWNER_FREE {
            warn!(pool = %self.params.name, index = buf.index(), "access to a freed buffer");
            return Err(CoreError::StaleHandle);
        }
        Ok(meta)
    }

    /// Slot holding segment `seg` and the payload byte range inside it.
    fn segment_span(&self, buf: &Buffer, seg: usize) -> Option<(u32, usize, usize)> {
        let meta = self.meta(buf).ok()?;
        if seg >= meta.segcount.load(Ordering::Relaxed) as usize {
            return None;
        }
        let mut index = buf.index();
        for _ in 0..seg {
            index = self.slots[index as usize].seg_next.load(Ordering::Relaxed);
        }

        let size = self.params.seg_size;
        let start = meta.offset.load(Ordering::Relaxed) as usize;
        let end = start + meta.len.load(Ordering::Relaxed) as usize;
        let base = seg * size;
        let lo = start.clamp(base, base + size);
        let hi = end.clamp(lo, base + size);
        Some((index, lo - base, hi - base))
    }

    /// Payload length in bytes.
    pub fn len(&self, buf: &Buffer) -> Result<usize> {
        Ok(self.meta(buf)?.len.load(Ordering::Relaxed) as usize)
    }

    pub fn segment_count(&self, buf: &Buffer) -> Result<usize> {
        Ok(self.meta(buf)?.segcount.load(Ordering::Relaxed) as usize)
    }

    /// Allocating worker id, or [`OWNER_SHARED`].
    pub fn owner(&self, buf: &Buffer) -> Result<u32> {
        Ok(self.meta(buf)?.owner.load(Ordering::Relaxed))
    }

    /// Payload bytes stored in segment `seg`; `None` past the last segment
    /// or for a handle this pool does not own.
    pub fn segment<'a>(&'a self, buf: &'a Buffer, seg: usize) -> Option<&'a [u8]> {
        let (index, lo, hi) = self.segment_span(buf, seg)?;
        // SAFETY: `buf` is a live handle; nothing else can write this slot
        Some(unsafe { std::slice::from_raw_parts(self.slot_ptr(index).add(lo), hi - lo) })
    }

    pub fn segment_mut<'a>(&'a self, buf: &'a mut Buffer, seg: usize) -> Option<&'a mut [u8]> {
        let (index, lo, hi) = self.segment_span(buf, seg)?;
        // SAFETY: `&mut Buffer` grants exclusive access to the slot
        Some(unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(index).add(lo), hi - lo) })
    }

    /// Payload of the first segment (all of it for unsegmented pools).
    pub fn data<'a>(&'a self, buf: &'a Buffer) -> Result<&'a [u8]> {
        self.meta(buf)?;
        Ok(self.segment(buf, 0).unwrap_or(&[]))
    }

    pub fn data_mut<'a>(&'a self, buf: &'a mut Buffer) -> Result<&'a mut [u8]> {
        self.meta(buf)?;
        Ok(match self.segment_mut(buf, 0) {
            Some(data) => data,
            None => &mut [],
        })
    }

    /// Scatters `bytes` over the payload, returning how many fit.
    pub fn copy_in(&self, buf: &mut Buffer, bytes: &[u8]) -> Result<usize> {
        let mut written = 0;
        for seg in 0..self.segment_count(buf)? {
            let Some(dst) = self.segment_mut(buf, seg) else {
                break;
            };
            let n = dst.len().min(bytes.len() - written);
            dst[..n].copy_from_slice(&bytes[written..written + n]);
            written += n;
        }
        Ok(written)
    }

    /// Gathers the payload across segments.
    pub fn copy_out(&self, buf: &Buffer) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len(buf)?);
        for seg in 0..self.segment_count(buf)? {
            if let Some(src) = self.segment(buf, seg) {
                out.extend_from_slice(src);
            }
        }
        Ok(out)
    }

    /// Bytes available in front of the payload.
    pub fn headroom(&self, buf: &Buffer) -> Result<usize> {
        Ok(self.meta(buf)?.offset.load(Ordering::Relaxed) as usize)
    }

    /// Bytes available behind the payload in the allocated segments.
    pub fn tailroom(&self, buf: &Buffer) -> Result<usize> {
        let meta = self.meta(buf)?;
        let span = meta.segcount.load(Ordering::Relaxed) as usize * self.params.seg_size;
        let used = meta.offset.load(Ordering::Relaxed) as usize + meta.len.load(Ordering::Relaxed) as usize;
        Ok(span - used)
    }

    /// Grows the payload into the headroom.
    pub fn push_head(&self, buf: &mut Buffer, n: usize) -> Result<()> {
        let room = self.headroom(buf)?;
        if n > room {
            return Err(CoreError::NoRoom {
                requested: n,
                available: room,
            });
        }
        let meta = self.meta(buf)?;
        meta.offset.fetch_sub(n as u32, Ordering::Relaxed);
        meta.len.fetch_add(n as u32, Ordering::Relaxed);
        Ok(())
    }

    /// Strips `n` bytes from the front of the payload.
    pub fn pull_head(&self, buf: &mut Buffer, n: usize) -> Result<()> {
        let len = self.len(buf)?;
        if n > len {
            return Err(CoreError::NoRoom {
                requested: n,
                available: len,
            });
        }
        let meta = self.meta(buf)?;
        meta.offset.fetch_add(n as u32, Ordering::Relaxed);
        meta.len.fetch_sub(n as u32, Ordering::Relaxed);
        Ok(())
    }

    pub fn push_tail(&self, buf: &mut Buffer, n: usize) -> Result<()> {
        let room = self.tailroom(buf)?;
        if n > room {
            return Err(CoreError::NoRoom {
                requested: n,
                available: room,
            });
        }
        self.meta(buf)?.len.fetch_add(n as u32, Ordering::Relaxed);
        Ok(())
    }

    pub fn pull_tail(&self, buf: &mut Buffer, n: usize) -> Result<()> {
        let len = self.len(buf)?;
        if n > len {
            return Err(CoreError::NoRoom {
                requested: n,
                available: len,
            });
        }
        self.meta(buf)?.len.fetch_sub(n as u32, Ordering::Relaxed);
        Ok(())
    }

    pub fn user_area<'a>(&'a self, buf: &'a Buffer) -> Result<&'a [u8]> {
        let start = self.uarea_start(buf)?;
        // SAFETY: shared borrow of a live handle's own user area
        Ok(unsafe {
            std::slice::from_raw_parts(
                UnsafeCell::raw_get(self.uarea.as_ptr().add(start)),
                self.params.uarea_size,
            )
        })
    }

    pub fn user_area_mut<'a>(&'a self, buf: &'a mut Buffer) -> Result<&'a mut [u8]> {
        let start = self.uarea_start(buf)?;
        // SAFETY: exclusive borrow of a live handle's own user area
        Ok(unsafe {
            std::slice::from_raw_parts_mut(
                UnsafeCell::raw_get(self.uarea.as_ptr().add(start)),
                self.params.uarea_size,
            )
        })
    }

    pub fn user_ctx(&self, buf: &Buffer) -> Result<u64> {
        Ok(self.meta(buf)?.user_ctx.load(Ordering::Relaxed))
    }

    pub fn set_user_ctx(&self, buf: &mut Buffer, ctx: u64) -> Result<()> {
        self.meta(buf)?.user_ctx.store(ctx, Ordering::Relaxed);
        Ok(())
    }

    #[inline]
    fn uarea_start(&self, buf: &Buffer) -> Result<usize> {
        self.meta(buf)?;
        Ok(buf.index() as usize * self.params.uarea_size)
    }

    // ---- queue links -------------------------------------------------------

    #[inline]
    fn link_slot(&self, buf_raw: u64) -> Result<&SlotMeta> {
        self.slots
            .get(buf_raw as u32 as usize)
            .ok_or(CoreError::ForeignBuffer(buf_raw))
    }

    #[inline]
    pub(crate) fn link(&self, buf_raw: u64) -> Result<u64> {
        Ok(self.link_slot(buf_raw)?.next.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_link(&self, buf_raw: u64, next: u64) -> Result<()> {
        self.link_slot(buf_raw)?.next.store(next, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("name", &self.params.name)
            .field("capacity", &self.params.capacity)
            .field("live", &self.live_count())
            .field("cached", &self.cached())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
