//! ## kvarn-core::alloc
//! **Buffer pools and the pool table**
//!
//! ### Expectations (Production):
//! - No heap allocation after pool creation
//! - No lock on the alloc/free hot path
//! - Conservation: `live + cached + outstanding == capacity` at every quiescent point
//!
//! ### Key Submodules:
//! - `buffer/`: move-only buffer handles and slot metadata
//! - `pool/`: arena, shared free list, watermarks, packet layout
//! - `cache/`: per-worker free-slot caches
//! - `stats/`: allocation counters

pub mod buffer;
pub mod cache;
pub mod pool;
pub mod stats;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use kvarn_telemetry::MetricsRecorder;
use parking_lot::{Mutex, RwLock};
use tracing::info;

pub use buffer::{Buffer, PoolId, MAX_SEGMENTS, OWNER_SHARED};
pub use cache::LocalCache;
pub use pool::{Pool, PoolInfo, PoolParams, PoolTuning, Watermark};
pub use stats::{PoolStats, PoolStatsSnapshot};

use crate::error::{CoreError, Result};

/// Fixed table of pools owned by a runtime context.
///
/// Each slot carries an incarnation that moves on when its pool is
/// destroyed; lookups compare the full [`PoolId`], so an id from an earlier
/// incarnation is stale.
pub(crate) struct PoolTable {
    slots: Box<[RwLock<Option<Arc<Pool>>>]>,
    incarnations: Box<[AtomicU8]>,
    control: Mutex<()>,
}

impl PoolTable {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| RwLock::new(None)).collect(),
            incarnations: (0..size).map(|_| AtomicU8::new(0)).collect(),
            control: Mutex::new(()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn create(
        &self,
        params: PoolParams,
        tuning: PoolTuning,
        metrics: &Arc<MetricsRecorder>,
    ) -> Result<Arc<Pool>> {
        let _control = self.control.lock();

        if self.find(&params.name).is_some() {
            return Err(CoreError::InvalidPoolParams(format!(
                "pool name '{}' already in use",
                params.name
            )));
        }
        let slot = self
            .slots
            .iter()
            .position(|slot| slot.read().is_none())
            .ok_or(CoreError::PoolTableFull(self.slots.len()))?;

        let id = PoolId::new(slot, self.incarnations[slot].load(Ordering::Acquire));
        let pool = Arc::new(Pool::new(id, params, tuning)?.with_metrics(Arc::clone(metrics)));
        *self.slots[slot].write() = Some(Arc::clone(&pool));

        let info = pool.info();
        info!(
            pool = %info.name,
            %id,
            kind = ?info.kind,
            capacity = info.capacity,
            seg_size = info.seg_size,
            "pool created"
        );
        Ok(pool)
    }

    pub(crate) fn get(&self, id: PoolId) -> Result<Arc<Pool>> {
        self.at(id.slot())
            .filter(|pool| pool.id() == id)
            .ok_or(CoreError::StaleHandle)
    }

    /// Current occupant of a table slot, whatever its incarnation.
    pub(crate) fn at(&self, slot: usize) -> Option<Arc<Pool>> {
        self.slots.get(slot).and_then(|slot| slot.read().clone())
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<PoolId> {
        self.find(name)
    }

    fn find(&self, name: &str) -> Option<PoolId> {
        self.slots.iter().find_map(|slot| {
            slot.read()
                .as_ref()
                .filter(|pool| pool.name() == name)
                .map(|pool| pool.id())
        })
    }

    /// Removes a pool whose slots are all back on its shared list.
    pub(crate) fn destroy(&self, id: PoolId, cache: Option<&mut LocalCache>) -> Result<()> {
        let _control = self.control.lock();
        let slot = self.slots.get(id.slot()).ok_or(CoreError::StaleHandle)?;
        let mut entry = slot.write();
        let pool = entry
            .as_ref()
            .filter(|pool| pool.id() == id)
            .ok_or(CoreError::StaleHandle)?;
        pool.prepare_destroy(cache)?;
        info!(pool = %pool.name(), %id, "pool destroyed");
        *entry = None;
        self.incarnations[id.slot()].fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
