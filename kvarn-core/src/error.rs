use thiserror::Error;

use crate::alloc::Buffer;

/// Errors reported by pools, queues, the scheduler and workers.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("pool table full ({0} slots)")]
    PoolTableFull(usize),

    #[error("queue table full ({0} slots)")]
    QueueTableFull(usize),

    #[error("worker table full ({0} slots)")]
    WorkerTableFull(usize),

    #[error("poll source table full ({0} slots)")]
    PollTableFull(usize),

    #[error("invalid pool parameters: {0}")]
    InvalidPoolParams(String),

    #[error("invalid capacity (must be a non-zero power of two)")]
    InvalidCapacity,

    #[error("priority {0} out of range (levels: {1})")]
    InvalidPriority(usize, usize),

    #[error("handle refers to a released or reused slot")]
    StaleHandle,

    #[error("cannot reserve {0} bytes of pool memory")]
    OutOfMemory(usize),

    #[error("pool '{name}' still has {outstanding} buffers outside its free list")]
    PoolBusy { name: String, outstanding: usize },

    #[error("pool '{0}' is predefined and cannot be destroyed")]
    PoolPredefined(String),

    #[error("pool '{0}' was destroyed")]
    PoolDestroyed(String),

    #[error("pool '{0}' is exhausted")]
    PoolExhausted(String),

    #[error("requested {requested} bytes, pool limit is {limit}")]
    Oversized { requested: usize, limit: usize },

    #[error("buffer {0:#x} freed twice")]
    DoubleFree(u64),

    #[error("buffer {0:#x} does not belong to this pool")]
    ForeignBuffer(u64),

    #[error("cannot adjust packet by {requested} bytes, {available} available")]
    NoRoom { requested: usize, available: usize },

    #[error("invalid queue parameters: {0}")]
    InvalidQueueParams(String),

    #[error("queue '{0}' is not empty")]
    QueueNotEmpty(String),

    #[error("queue '{name}' is {status}")]
    BadQueueStatus { name: String, status: &'static str },

    #[error("queue was destroyed")]
    QueueDestroyed,

    #[error("scheduler command pool exhausted while registering '{0}'")]
    SchedulerSlotsExhausted(String),

    #[error("{0} pre-scheduled events still pending")]
    PendingEvents(usize),

    #[error(transparent)]
    Config(#[from] kvarn_config::ConfigError),

    #[error(transparent)]
    Telemetry(#[from] kvarn_telemetry::TelemetryError),
}

/// A buffer that could not be enqueued, handed back to the caller.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct Rejected {
    #[source]
    pub error: CoreError,
    pub buffer: Buffer,
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
