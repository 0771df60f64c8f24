//! Read-only statistics snapshots.

use crate::class::POOL_COUNT;

/// Total/free pair for one free stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub total: u64,
    pub free: u64,
}

/// One core's fast pool, as observed at snapshot time.
#[derive(Debug, Clone, Default)]
pub struct CoreStatistics {
    pub fast: [PoolCounts; POOL_COUNT],
    pub fast_data: [PoolCounts; POOL_COUNT],
    pub requests: [u64; POOL_COUNT],
    pub data_requests: [u64; POOL_COUNT],
    pub deferred: [u64; POOL_COUNT],
    pub data_deferred: [u64; POOL_COUNT],
    pub fast_requests: [u64; POOL_COUNT],
    pub fast_data_requests: [u64; POOL_COUNT],
    pub deadlock_escalations: u64,
}

/// Allocator-wide snapshot filled by `PoolAllocator::fill_statistics`. Pure
/// projection of the gauges and event counters; taking it never perturbs
/// allocation state.
#[derive(Debug, Clone, Default)]
pub struct PoolStatistics {
    /// Uncarved main chunks still held for one-time expansion carving.
    pub main_free: u64,
    pub bulk: [PoolCounts; POOL_COUNT],
    pub bulk_data: [PoolCounts; POOL_COUNT],
    pub reserved: [PoolCounts; POOL_COUNT],
    pub reserved_data: [PoolCounts; POOL_COUNT],
    pub cores: Vec<CoreStatistics>,
    pub queued_requests: u64,
    pub aborted_requests: u64,
}
