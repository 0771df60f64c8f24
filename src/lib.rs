//! A tiered memory-pool allocator for storage I/O buffer management.
//!
//! Memory is acquired up front, carved into chunks of a few fixed sizes, and
//! handed out whole. Chunks live in three tiers:
//!
//!   * per-core **fast pools**, each behind its own spin lock, serving the
//!     lock-contention-free common case;
//!   * a shared **bulk pool** behind the global lock, feeding fast-path
//!     misses and the wait queue;
//!   * a **reserved pool** drawn on only by the single I/O that currently
//!     holds the deadlock-avoidance reservation.
//!
//! Requests name a size class (or a combined control + data pair), a
//! priority between 0 and 127, and a core affinity. A request that cannot be
//! admitted immediately waits in a strict-priority FIFO queue drained by a
//! background dispatcher; a queue stalled past the configured window
//! escalates through the reserved pool so one I/O can always run to
//! completion and release what the rest are waiting for.
//!
//! # Example
//!
//! ```no_run
//! use tierpool::{ChunkClass, MemoryRequest, ObjectCounts, PoolAllocator, PoolConfig, PoolId};
//!
//! # fn main() -> Result<(), tierpool::PoolError> {
//! let pool = PoolAllocator::new(PoolConfig::default())?;
//! let req = MemoryRequest::build(
//!     ChunkClass::Single(PoolId::Packet),
//!     ObjectCounts::single(2),
//!     10,   // priority
//!     0,    // core affinity
//!     None, // io master
//!     None, // completion callback
//! )?;
//! pool.submit(&req)?;
//! req.wait_ready();
//! for idx in req.chain() {
//!     let _buf = pool.chunk_data(idx);
//! }
//! pool.release(&req)?;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

mod alloc;
mod chunk;
mod class;
mod config;
mod dispatch;
mod pool;
mod request;
mod stats;


pub use crate::alloc::PoolAllocator;
pub use crate::chunk::{ChunkIndex, FixedRegion, MemorySource, NativeSource};
pub use crate::class::{
    ChunkClass, ObjectCounts, PoolId, BLOCK_1_CHUNK_BYTES, BLOCK_64_CHUNK_BYTES, MAIN_CHUNK_BYTES,
    PACKET_CHUNK_BYTES, POOL_COUNT,
};
pub use crate::config::{PoolConfig, TierParams};
pub use crate::request::{CompletionFn, IoMaster, MemoryRequest, RequestState, Source};
pub use crate::stats::{CoreStatistics, PoolCounts, PoolStatistics};

/// Number of request priority levels.
pub const PRIORITY_LEVELS: usize = 128;

/// Outcome of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// Chunks were attached on the submitting thread.
    Granted,
    /// The request joined the wait queue; completion arrives later.
    Pending,
    /// The request was aborted before admission.
    Aborted,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("request is still owned by a prior submission (state {0:?})")]
    RequestInUse(RequestState),
    #[error("request is not in a state that allows this operation (state {0:?})")]
    RequestNotReady(RequestState),
    #[error("priority {0} is outside the supported range")]
    InvalidPriority(u8),
    #[error("requested chunk class is not provisioned")]
    InvalidClass,
    #[error("memory source could not provide the requested slabs")]
    SourceExhausted,
    #[error("main pool was already expanded")]
    AlreadyExpanded,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to start dispatcher thread: {0}")]
    Dispatcher(#[from] std::io::Error),
}
