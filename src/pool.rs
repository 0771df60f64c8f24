//! Free stacks, tier sets, gauges, and the per-core fast pools.
//!
//! Every (size class, purpose, tier) owns a LIFO free stack plus a pair of
//! counters. The counters are mirrored as atomics so the balancer and the
//! dispatcher can pre-screen a tier without taking its lock; all decisions
//! are re-validated under the owning lock before chunks move.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::chunk::{ChunkArena, ChunkIndex, ChunkTag};
use crate::class::{Demand, PoolId, POOL_COUNT};

/// Which plane a chunk was granted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Purpose {
    Control,
    Data,
}

/// Lock-free mirror of one free stack's counters.
#[derive(Default)]
pub(crate) struct PoolGauge {
    total: AtomicU64,
    free: AtomicU64,
}

impl PoolGauge {
    #[inline]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn free(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }

    pub fn add_total(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
        self.free.fetch_add(n, Ordering::Relaxed);
    }

    pub fn take(&self, n: u64) {
        self.free.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn put(&self, n: u64) {
        self.free.fetch_add(n, Ordering::Relaxed);
    }
}

/// Gauges for one tier, split by purpose. When the data tier was never
/// provisioned, data-purpose routing falls through to the control gauges.
#[derive(Default)]
pub(crate) struct TierGauges {
    pub control: [PoolGauge; POOL_COUNT],
    pub data: [PoolGauge; POOL_COUNT],
}

impl TierGauges {
    #[inline]
    pub fn for_purpose(&self, purpose: Purpose, data_provisioned: bool, pool: PoolId) -> &PoolGauge {
        match purpose {
            Purpose::Control => &self.control[pool.index()],
            Purpose::Data if data_provisioned => &self.data[pool.index()],
            Purpose::Data => &self.control[pool.index()],
        }
    }
}

/// The free stacks for one tier. Indexed by pool, split by purpose; the data
/// stacks stay empty when no data tier was configured.
#[derive(Default)]
pub(crate) struct TierSet {
    pub control: [Vec<ChunkIndex>; POOL_COUNT],
    pub data: [Vec<ChunkIndex>; POOL_COUNT],
}

impl TierSet {
    #[inline]
    pub fn stack_mut(
        &mut self,
        purpose: Purpose,
        data_provisioned: bool,
        pool: PoolId,
    ) -> &mut Vec<ChunkIndex> {
        match purpose {
            Purpose::Control => &mut self.control[pool.index()],
            Purpose::Data if data_provisioned => &mut self.data[pool.index()],
            Purpose::Data => &mut self.control[pool.index()],
        }
    }
}

/// Per-core event counters, updated without the core lock.
#[derive(Default)]
pub(crate) struct CoreStats {
    pub requests: [AtomicU64; POOL_COUNT],
    pub data_requests: [AtomicU64; POOL_COUNT],
    pub deferred: [AtomicU64; POOL_COUNT],
    pub data_deferred: [AtomicU64; POOL_COUNT],
    pub fast_requests: [AtomicU64; POOL_COUNT],
    pub fast_data_requests: [AtomicU64; POOL_COUNT],
    pub deadlock_escalations: AtomicU64,
}

impl CoreStats {
    pub fn bump(arr: &[AtomicU64; POOL_COUNT], pool: PoolId) {
        arr[pool.index()].fetch_add(1, Ordering::Relaxed);
    }
}

/// One core's fast pool: its free stacks behind a spin lock plus the mirror
/// gauges and event counters read outside it.
pub(crate) struct FastPool {
    pub set: spin::Mutex<TierSet>,
    pub gauges: TierGauges,
    pub stats: CoreStats,
}

impl FastPool {
    pub fn new() -> Self {
        FastPool {
            set: spin::Mutex::new(TierSet::default()),
            gauges: TierGauges::default(),
            stats: CoreStats::default(),
        }
    }
}

/// Locked sufficiency check: can `set` satisfy every side of `demand` at once?
/// The merged variant folds both sides into the control stack when the data
/// tier is unprovisioned and both sides share a pool.
pub(crate) fn set_can_satisfy(set: &TierSet, demand: &Demand, data_provisioned: bool) -> bool {
    if let Some((pool, n)) = demand.merged(data_provisioned) {
        return set.control[pool.index()].len() >= n as usize;
    }
    if let Some((pool, n)) = demand.control {
        if set.control[pool.index()].len() < n as usize {
            return false;
        }
    }
    if let Some((pool, n)) = demand.data {
        let stack = if data_provisioned {
            &set.data[pool.index()]
        } else {
            &set.control[pool.index()]
        };
        if stack.len() < n as usize {
            return false;
        }
    }
    true
}

/// Unlocked pre-screen over the mirror gauges. A true result still needs the
/// locked re-check.
pub(crate) fn gauges_can_satisfy(
    gauges: &TierGauges,
    demand: &Demand,
    data_provisioned: bool,
) -> bool {
    if let Some((pool, n)) = demand.merged(data_provisioned) {
        return gauges.control[pool.index()].free() >= u64::from(n);
    }
    if let Some((pool, n)) = demand.control {
        if gauges.control[pool.index()].free() < u64::from(n) {
            return false;
        }
    }
    if let Some((pool, n)) = demand.data {
        if gauges
            .for_purpose(Purpose::Data, data_provisioned, pool)
            .free()
            < u64::from(n)
        {
            return false;
        }
    }
    true
}

/// Donor eligibility for the balancer: after giving up the demand, each
/// touched stack must keep at least one eighth of its total capacity free.
pub(crate) fn gauges_have_headroom(
    gauges: &TierGauges,
    demand: &Demand,
    data_provisioned: bool,
) -> bool {
    let check = |gauge: &PoolGauge, n: u64| {
        let free = gauge.free();
        free >= n && free - n >= (gauge.total() >> 3)
    };
    if let Some((pool, n)) = demand.merged(data_provisioned) {
        return check(&gauges.control[pool.index()], u64::from(n));
    }
    if let Some((pool, n)) = demand.control {
        if !check(&gauges.control[pool.index()], u64::from(n)) {
            return false;
        }
    }
    if let Some((pool, n)) = demand.data {
        if !check(
            gauges.for_purpose(Purpose::Data, data_provisioned, pool),
            u64::from(n),
        ) {
            return false;
        }
    }
    true
}

/// Pop `demand` out of `set` into the request chains, tagging each chunk and
/// settling the gauges. Caller holds the tier lock and has already verified
/// sufficiency.
pub(crate) fn fill_request(
    set: &mut TierSet,
    gauges: &TierGauges,
    arena: &ChunkArena,
    demand: &Demand,
    data_provisioned: bool,
    chain: &mut Vec<ChunkIndex>,
    data_chain: &mut Vec<ChunkIndex>,
) {
    // Data side first so a combined grant's data chunks sit deepest in a
    // shared stack's reuse order.
    if let Some((pool, n)) = demand.data {
        let stack = set.stack_mut(Purpose::Data, data_provisioned, pool);
        for _ in 0..n {
            let idx = stack.pop().unwrap();
            arena.slot(idx).set_tag(ChunkTag::Data);
            data_chain.push(idx);
        }
        gauges
            .for_purpose(Purpose::Data, data_provisioned, pool)
            .take(u64::from(n));
    }
    if let Some((pool, n)) = demand.control {
        let stack = set.stack_mut(Purpose::Control, data_provisioned, pool);
        for _ in 0..n {
            let idx = stack.pop().unwrap();
            arena.slot(idx).set_tag(ChunkTag::Control);
            chain.push(idx);
        }
        gauges.control[pool.index()].take(u64::from(n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::NativeSource;
    use crate::class::{ChunkClass, ObjectCounts};

    fn arena_with(pool: PoolId, chunks: usize) -> (ChunkArena, Vec<ChunkIndex>) {
        let mut arena = ChunkArena::new(std::sync::Arc::new(NativeSource));
        let mut indices = Vec::new();
        let regions = arena.acquire_main(1, false).unwrap();
        for region in regions {
            indices.extend(arena.carve(region, pool));
        }
        indices.truncate(chunks);
        (arena, indices)
    }

    #[test]
    fn headroom_boundary_is_exactly_one_eighth() {
        let gauges = TierGauges::default();
        gauges.control[PoolId::Block64.index()].add_total(16);
        let demand = Demand::resolve(ChunkClass::Single(PoolId::Block64), ObjectCounts::single(14));
        // 16 free, total 16: donating 14 leaves 2 == 16 >> 3.
        assert!(gauges_have_headroom(&gauges, &demand, false));
        let too_much =
            Demand::resolve(ChunkClass::Single(PoolId::Block64), ObjectCounts::single(15));
        assert!(!gauges_have_headroom(&gauges, &too_much, false));
    }

    #[test]
    fn merged_demand_checks_one_stack() {
        let (_arena, indices) = arena_with(PoolId::Block64, 8);
        let mut set = TierSet::default();
        set.control[PoolId::Block64.index()].extend(indices);
        let demand = Demand::resolve(
            ChunkClass::Combined {
                control: PoolId::Block64,
                data: PoolId::Block64,
            },
            ObjectCounts::split(3, 5),
        );
        assert!(set_can_satisfy(&set, &demand, false));
        let over = Demand::resolve(
            ChunkClass::Combined {
                control: PoolId::Block64,
                data: PoolId::Block64,
            },
            ObjectCounts::split(4, 5),
        );
        assert!(!set_can_satisfy(&set, &over, false));
    }

    #[test]
    fn fill_pops_lifo_and_tags() {
        let (arena, indices) = arena_with(PoolId::Packet, 4);
        let last = *indices.last().unwrap();
        let mut set = TierSet::default();
        set.control[PoolId::Packet.index()].extend(indices);
        let gauges = TierGauges::default();
        gauges.control[PoolId::Packet.index()].add_total(4);

        let demand = Demand::resolve(ChunkClass::Single(PoolId::Packet), ObjectCounts::single(2));
        let mut chain = Vec::new();
        let mut data_chain = Vec::new();
        fill_request(&mut set, &gauges, &arena, &demand, false, &mut chain, &mut data_chain);

        assert_eq!(chain[0], last);
        assert_eq!(arena.slot(chain[0]).tag(), ChunkTag::Control);
        assert_eq!(gauges.control[PoolId::Packet.index()].free(), 2);
        assert!(data_chain.is_empty());
    }
}
