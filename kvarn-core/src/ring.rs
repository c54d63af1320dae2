//! ## kvarn-core::ring
//! **Lock-free bounded MPMC ring**
//!
//! Moves owned items (typically [`Buffer`](crate::alloc::Buffer) handles)
//! between any number of producers and consumers. Each side keeps two
//! monotonically increasing cursors:
//! - `*_head`: how far threads on that side have *claimed*
//! - `*_tail`: how far claims have been *published* to the other side
//!
//! A thread claims a window by CAS on its head, fills or drains the window
//! without synchronization, then waits until the tail reaches the start of its
//! window before moving the tail to the window end. Windows are therefore
//! disjoint and publication is gap-free.
//!
//! Nothing here blocks: a full or empty ring returns fewer items, possibly
//! zero, and the caller decides how to retry.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use kvarn_config::BackoffStrategy;

use crate::backoff::Spinner;
use crate::error::{CoreError, Result};

/// Cache-line aligned atomic counter to prevent false sharing
#[repr(align(64))]
struct AlignedCounter(AtomicU64);

impl AlignedCounter {
    #[inline]
    fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    #[inline]
    fn load(&self, order: Ordering) -> u64 {
        self.0.load(order)
    }
}

/// Cursor range `[start, start + len)` claimed by one `write_window` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: u64,
    pub len: usize,
}

impl Window {
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.len as u64
    }
}

pub struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: u64,
    prod_head: AlignedCounter,
    prod_tail: AlignedCounter,
    cons_head: AlignedCounter,
    cons_tail: AlignedCounter,
    backoff: BackoffStrategy,
}

// SAFETY: a slot is touched only by the thread whose claimed window covers it,
// and windows are handed over through acquire/release cursor updates.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Creates a ring holding up to `capacity` items.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Must be a power of two for mask indexing.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::with_backoff(capacity, BackoffStrategy::default())
    }

    pub fn with_backoff(capacity: usize, backoff: BackoffStrategy) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(CoreError::InvalidCapacity);
        }

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slots,
            mask: capacity as u64 - 1,
            prod_head: AlignedCounter::new(0),
            prod_tail: AlignedCounter::new(0),
            cons_head: AlignedCounter::new(0),
            cons_tail: AlignedCounter::new(0),
            backoff,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Items published and not yet consumed.
    #[inline]
    pub fn count(&self) -> usize {
        let cons = self.cons_tail.load(Ordering::Acquire);
        let prod = self.prod_tail.load(Ordering::Acquire);
        prod.saturating_sub(cons) as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Moves up to `items.len()` items from the front of `items` into the
    /// ring. Returns how many were committed; the rest stay in `items`.
    pub fn reserve_and_write(&self, items: &mut Vec<T>) -> usize {
        self.write_window(items).len
    }

    /// Same as [`Ring::reserve_and_write`], reporting the cursor window used.
    pub fn write_window(&self, items: &mut Vec<T>) -> Window {
        let spinner = Spinner::new(self.backoff);
        let capacity = self.capacity() as u64;

        let (start, len) = loop {
            let head = self.prod_head.load(Ordering::Relaxed);
            let cons_tail = self.cons_tail.load(Ordering::Acquire);
            let free = capacity.saturating_sub(head.saturating_sub(cons_tail));
            let len = (items.len() as u64).min(free);
            if len == 0 {
                return Window { start: head, len: 0 };
            }
            match self.prod_head.0.compare_exchange_weak(
                head,
                head + len,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break (head, len as usize),
                Err(_) => spinner.retry(),
            }
        };

        for (offset, item) in items.drain(..len).enumerate() {
            let idx = ((start + offset as u64) & self.mask) as usize;
            // SAFETY: [start, start + len) is exclusively ours until published
            unsafe { (*self.slots[idx].get()).write(item) };
        }

        spinner.reset();
        while self.prod_tail.load(Ordering::Acquire) != start {
            spinner.wait();
        }
        self.prod_tail
            .0
            .store(start + len as u64, Ordering::Release);

        Window { start, len }
    }

    /// Moves up to `max` items out of the ring onto the end of `out`.
    pub fn reserve_and_read(&self, out: &mut Vec<T>, max: usize) -> usize {
        let spinner = Spinner::new(self.backoff);

        let (start, len) = loop {
            let head = self.cons_head.load(Ordering::Relaxed);
            let prod_tail = self.prod_tail.load(Ordering::Acquire);
            let len = (max as u64).min(prod_tail.saturating_sub(head));
            if len == 0 {
                return 0;
            }
            match self.cons_head.0.compare_exchange_weak(
                head,
                head + len,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break (head, len as usize),
                Err(_) => spinner.retry(),
            }
        };

        out.reserve(len);
        for offset in 0..len as u64 {
            let idx = ((start + offset) & self.mask) as usize;
            // SAFETY: the slot was published by prod_tail and is claimed only by us
            out.push(unsafe { (*self.slots[idx].get()).assume_init_read() });
        }

        spinner.reset();
        while self.cons_tail.load(Ordering::Acquire) != start {
            spinner.wait();
        }
        self.cons_tail
            .0
            .store(start + len as u64, Ordering::Release);

        len
    }

    /// Single-item convenience; hands the item back when the ring is full.
    pub fn push(&self, item: T) -> std::result::Result<(), T> {
        let mut batch = vec![item];
        self.reserve_and_write(&mut batch);
        match batch.pop() {
            Some(item) => Err(item),
            None => Ok(()),
        }
    }

    pub fn pop(&self) -> Option<T> {
        let mut out = Vec::with_capacity(1);
        self.reserve_and_read(&mut out, 1);
        out.pop()
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let start = *self.cons_tail.0.get_mut();
        let end = *self.prod_tail.0.get_mut();
        for pos in start..end {
            let idx = (pos & self.mask) as usize;
            // SAFETY: published, unconsumed slots hold initialized items
            unsafe { self.slots[idx].get_mut().assume_init_drop() };
        }
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("prod_head", &self.prod_head.load(Ordering::Relaxed))
            .field("prod_tail", &self.prod_tail.load(Ordering::Relaxed))
            .field("cons_head", &self.cons_head.load(Ordering::Relaxed))
            .field("cons_tail", &self.cons_tail.load(Ordering::Relaxed))
            .finish()
    }
}
