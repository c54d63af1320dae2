//! Buffer handles and per-slot metadata.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Maximum number of segments chained into one packet buffer.
pub const MAX_SEGMENTS: usize = 4;

/// Index terminator for free lists and segment chains.
pub(crate) const NIL_INDEX: u32 = u32::MAX;

/// Raw terminator for queue links.
pub(crate) const NIL_RAW: u64 = u64::MAX;

/// `owner` value of a slot sitting on a free list or in a local cache.
pub(crate) const OWNER_FREE: u32 = u32::MAX;

/// `owner` value of a slot allocated by a thread that is not a worker.
pub const OWNER_SHARED: u32 = u32::MAX - 1;

/// Pool identity: `incarnation << 8 | slot`.
///
/// The incarnation is bumped every time a table slot is vacated, so ids and
/// buffers of a destroyed pool never resolve to the pool that reuses its slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub(crate) u16);

impl PoolId {
    #[inline]
    pub(crate) fn new(slot: usize, incarnation: u8) -> Self {
        Self((incarnation as u16) << 8 | (slot as u16 & 0xFF))
    }

    /// Index into the pool table.
    #[inline]
    pub fn slot(self) -> usize {
        (self.0 & 0xFF) as usize
    }

    #[inline]
    pub fn incarnation(self) -> u8 {
        (self.0 >> 8) as u8
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}.{}", self.slot(), self.incarnation())
    }
}

/// Owning handle to one allocated buffer.
///
/// Packs `pool | generation | index` into one word. The handle is move-only:
/// freeing or enqueueing a buffer consumes it, so a live `Buffer` is the proof
/// of exclusive access to the slot's data.
#[must_use = "dropping a Buffer leaks its pool slot; free or enqueue it"]
#[derive(PartialEq, Eq, Hash)]
pub struct Buffer {
    raw: u64,
}

impl Buffer {
    #[inline]
    pub(crate) fn new(pool: PoolId, index: u32, generation: u32) -> Self {
        let raw = (pool.0 as u64) << 48 | ((generation & 0xFFFF) as u64) << 32 | index as u64;
        Self { raw }
    }

    #[inline]
    pub fn pool_id(&self) -> PoolId {
        PoolId((self.raw >> 48) as u16)
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.raw as u32
    }

    #[inline]
    pub(crate) fn generation(&self) -> u16 {
        (self.raw >> 32) as u16
    }

    #[inline]
    pub(crate) fn raw(&self) -> u64 {
        self.raw
    }

    /// Gives up ownership, returning the packed handle word.
    #[inline]
    pub fn into_raw(self) -> u64 {
        self.raw
    }

    /// Rebuilds a handle from [`Buffer::into_raw`].
    ///
    /// # Safety
    /// `raw` must come from `into_raw` and be rebuilt at most once; two live
    /// handles to one slot alias its data.
    #[inline]
    pub unsafe fn from_raw(raw: u64) -> Self {
        Self { raw }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("pool", &self.pool_id())
            .field("index", &self.index())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Bookkeeping for one arena slot.
///
/// Every field is atomic: `free_next` is read speculatively by concurrent
/// poppers of the shared free list, the rest is written by the slot's current
/// owner and published through the free list or a queue lock.
pub(crate) struct SlotMeta {
    pub(crate) free_next: AtomicU32,
    pub(crate) seg_next: AtomicU32,
    pub(crate) next: AtomicU64,
    pub(crate) generation: AtomicU32,
    pub(crate) owner: AtomicU32,
    pub(crate) segcount: AtomicU32,
    pub(crate) offset: AtomicU32,
    pub(crate) len: AtomicU32,
    pub(crate) user_ctx: AtomicU64,
}

impl SlotMeta {
    pub(crate) fn new(free_next: u32) -> Self {
        Self {
            free_next: AtomicU32::new(free_next),
            seg_next: AtomicU32::new(NIL_INDEX),
            next: AtomicU64::new(NIL_RAW),
            generation: AtomicU32::new(0),
            owner: AtomicU32::new(OWNER_FREE),
            segcount: AtomicU32::new(0),
            offset: AtomicU32::new(0),
            len: AtomicU32::new(0),
            user_ctx: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn matches(&self, buf: &Buffer) -> bool {
        self.generation.load(Ordering::Acquire) as u16 == buf.generation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_pool_generation_and_index() {
        let buf = Buffer::new(PoolId(7), 0xDEAD_BEEF, 0x1_0003);
        assert_eq!(buf.pool_id(), PoolId(7));
        assert_eq!(buf.index(), 0xDEAD_BEEF);
        assert_eq!(buf.generation(), 3);

        let raw = buf.into_raw();
        let back = unsafe { Buffer::from_raw(raw) };
        assert_eq!(back.index(), 0xDEAD_BEEF);
    }

    #[test]
    fn pool_id_separates_slot_and_incarnation() {
        let first = PoolId::new(3, 0);
        let reused = PoolId::new(3, 1);
        assert_eq!(first.slot(), reused.slot());
        assert_ne!(first, reused);
        assert_eq!(reused.incarnation(), 1);
        assert_eq!(reused.to_string(), "pool#3.1");

        let buf = Buffer::new(reused, 9, 1);
        assert_eq!(buf.pool_id(), reused);
        let _ = buf.into_raw();
    }

    #[test]
    fn nil_raw_is_never_a_valid_pool() {
        let nil = unsafe { Buffer::from_raw(NIL_RAW) };
        // max_pools is at most 255, so slot 255 is never handed out
        assert_eq!(nil.pool_id().slot(), 255);
        let _ = nil.into_raw();
    }
}
