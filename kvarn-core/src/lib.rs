//! # kvarn-core
//!
//! Event-driven packet-processing runtime: fixed-size buffer pools, event
//! queues with per-queue synchronization disciplines, a cooperative priority
//! scheduler and a lock-free MPMC ring.
//!
//! ### Expectations (Production):
//! - No heap allocation on the alloc/free, enqueue/dequeue and schedule paths
//! - Lock-free pool free lists and ring cursors; one short lock per queue
//! - Exclusive, strictly ordered delivery for `Atomic` queues
//!
//! ### Key Submodules:
//! - `alloc`: buffer pools, local caches, packet layout
//! - `queue`: intrusive event queues and their status machine
//! - `sched`: priority levels, command tokens, poll sources
//! - `worker`: per-thread scheduling loop and caches
//! - `context`: the runtime context owning every table
//! - `ring`: bounded MPMC ring with batch reserve
//!
//! ### Future:
//! - Order restoration for `Ordered` queues
//! - Scheduling groups as a worker filter

pub mod alloc;
pub mod backoff;
pub mod context;
pub mod error;
pub mod queue;
pub mod ring;
pub mod sched;
pub mod worker;

pub mod prelude {
    pub use crate::alloc::{Buffer, Pool, PoolId, PoolInfo, PoolParams, Watermark};
    pub use crate::context::RuntimeContext;
    pub use crate::error::{CoreError, Rejected, Result};
    pub use crate::queue::{Discipline, QueueHandle, QueueInfo, QueueKind, QueueParams, QueueStatus};
    pub use crate::ring::Ring;
    pub use crate::sched::{PollOutcome, PollSourceId, Wait};
    pub use crate::worker::Worker;
}

pub use error::CoreError;
