//! The allocator context object.
//!
//! `PoolAllocator` owns the chunk arena, the per-core fast pools, the shared
//! bulk and reserved tiers, and the wait queue. All shared-tier state lives
//! behind one global mutex; per-core state is spin-locked independently so
//! the fast path never contends with the dispatcher.
//!
//! Lock order is global shared, then a fast-pool lock, then a request's
//! inner lock, then the arena read lock. Paths that skip a level keep the
//! relative order.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use log::{debug, error, info, trace, warn};

use crate::chunk::{ChunkArena, ChunkIndex, ChunkTag, MainRegion, MemorySource, NativeSource};
use crate::class::{Demand, PoolId, POOL_COUNT};
use crate::config::{PoolConfig, TierParams};
use crate::dispatch::{spawn_dispatcher, DispatchEvent, WaitQueue};
use crate::pool::{
    fill_request, gauges_have_headroom, set_can_satisfy, CoreStats, FastPool, PoolGauge, Purpose,
    TierGauges, TierSet,
};
use crate::request::{IoMaster, MemoryRequest, RequestState, Source};
use crate::stats::{CoreStatistics, PoolCounts, PoolStatistics};
use crate::{PoolError, SubmitStatus};

/// Everything guarded by the global lock.
pub(crate) struct Shared {
    pub bulk: TierSet,
    pub reserved: TierSet,
    /// Uncarved control-tier main chunks.
    pub main: Vec<MainRegion>,
    /// Uncarved data-tier main chunks.
    pub main_data: Vec<MainRegion>,
    pub wait: WaitQueue,
    pub reserved_holder: Option<Arc<IoMaster>>,
    pub stall_since: Option<Instant>,
    pub expanded: bool,
}

pub struct PoolAllocator {
    pub(crate) config: PoolConfig,
    pub(crate) data_provisioned: bool,
    pub(crate) cores: Vec<FastPool>,
    pub(crate) arena: spin::RwLock<ChunkArena>,
    pub(crate) shared: Mutex<Shared>,
    pub(crate) bulk_gauges: TierGauges,
    pub(crate) reserved_gauges: TierGauges,
    pub(crate) main_free: AtomicU64,
    /// Mirror of `wait.count` for the submit-path priority gate.
    pub(crate) queued: AtomicU64,
    /// Mirror of `wait.watermark`.
    pub(crate) watermark: AtomicU8,
    pub(crate) balance_enabled: AtomicBool,
    pub(crate) abort_pending: AtomicBool,
    pub(crate) aborted_total: AtomicU64,
    pub(crate) event: Arc<DispatchEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PoolAllocator {
    /// Build an allocator backed by the process heap.
    pub fn new(config: PoolConfig) -> Result<Arc<PoolAllocator>, PoolError> {
        Self::with_source(config, Arc::new(NativeSource))
    }

    /// Build an allocator over a caller-supplied memory source.
    pub fn with_source(
        config: PoolConfig,
        source: Arc<dyn MemorySource>,
    ) -> Result<Arc<PoolAllocator>, PoolError> {
        Self::build(config, source, true)
    }

    pub(crate) fn build(
        config: PoolConfig,
        source: Arc<dyn MemorySource>,
        spawn_worker: bool,
    ) -> Result<Arc<PoolAllocator>, PoolError> {
        config.validate()?;
        let data_provisioned = config.data.is_some();
        let mut arena = ChunkArena::new(source);
        let cores: Vec<FastPool> = (0..config.cores).map(|_| FastPool::new()).collect();
        let bulk_gauges = TierGauges::default();
        let reserved_gauges = TierGauges::default();
        let mut shared = Shared {
            bulk: TierSet::default(),
            reserved: TierSet::default(),
            main: Vec::new(),
            main_data: Vec::new(),
            wait: WaitQueue::new(),
            reserved_holder: None,
            stall_since: None,
            expanded: false,
        };

        carve_tier(
            &mut arena,
            config.retry_forever,
            &config.control,
            false,
            &mut shared,
            &bulk_gauges,
            &reserved_gauges,
            &cores,
        )?;
        if let Some(data) = &config.data {
            carve_tier(
                &mut arena,
                config.retry_forever,
                data,
                true,
                &mut shared,
                &bulk_gauges,
                &reserved_gauges,
                &cores,
            )?;
        }
        info!(
            "pool initialized: {} cores, {} chunks carved, {} main chunks held back",
            config.cores,
            arena.chunk_count(),
            shared.main.len() + shared.main_data.len()
        );

        let main_free = (shared.main.len() + shared.main_data.len()) as u64;
        let event = DispatchEvent::new();
        let alloc = Arc::new(PoolAllocator {
            config,
            data_provisioned,
            cores,
            arena: spin::RwLock::new(arena),
            shared: Mutex::new(shared),
            bulk_gauges,
            reserved_gauges,
            main_free: AtomicU64::new(main_free),
            queued: AtomicU64::new(0),
            watermark: AtomicU8::new(0),
            balance_enabled: AtomicBool::new(true),
            abort_pending: AtomicBool::new(false),
            aborted_total: AtomicU64::new(0),
            event,
            worker: Mutex::new(None),
        });
        if spawn_worker {
            let handle = spawn_dispatcher(&alloc, Arc::clone(&alloc.event))?;
            *alloc.worker.lock().unwrap() = Some(handle);
        }
        Ok(alloc)
    }

    /// Submit a built request. Returns `Granted` when chunks were attached on
    /// this thread, `Pending` when the request joined the wait queue.
    pub fn submit(self: &Arc<Self>, req: &Arc<MemoryRequest>) -> Result<SubmitStatus, PoolError> {
        match req.state() {
            RequestState::Initialized => req.set_state(RequestState::Submitted),
            RequestState::Aborted => return Ok(SubmitStatus::Aborted),
            state => {
                error!("submit of a request in state {:?}", state);
                return Err(PoolError::RequestInUse(state));
            }
        }
        let (demand, priority, affinity, io_master) = {
            let inner = req.inner.lock().unwrap();
            (
                Demand::resolve(inner.class, inner.counts),
                inner.priority,
                inner.affinity % self.cores.len(),
                inner.io_master.clone(),
            )
        };
        if demand.total() == 0 {
            error!("submit of a request with zero chunk demand");
            return Err(PoolError::InvalidClass);
        }
        self.note_arrival(affinity, &demand);

        // Queued work at equal or higher priority bypasses the fast path so
        // the wait queue cannot be starved by fresh arrivals.
        let gated = self.queued.load(Ordering::Acquire) > 0
            && self.watermark.load(Ordering::Acquire) >= priority;
        if !gated {
            if self.try_fast_grant(req, &demand, affinity) {
                self.note_fast_grant(affinity, &demand);
                req.complete(RequestState::GrantedImmediately);
                return Ok(SubmitStatus::Granted);
            }
            if self.balance_enabled.load(Ordering::Relaxed) && self.try_balance(req, &demand, affinity)
            {
                self.note_fast_grant(affinity, &demand);
                req.complete(RequestState::GrantedImmediately);
                return Ok(SubmitStatus::Granted);
            }
        }

        self.note_deferred(affinity, &demand);
        self.admit_or_queue(req, &demand, priority, io_master)
    }

    /// Lock-scoped check-and-take on one core's fast pool.
    fn try_fast_grant(&self, req: &Arc<MemoryRequest>, demand: &Demand, core: usize) -> bool {
        let dp = self.data_provisioned;
        let fast = &self.cores[core];
        let mut set = fast.set.lock();
        if !set_can_satisfy(&set, demand, dp) {
            return false;
        }
        let arena = self.arena.read();
        let mut inner = req.inner.lock().unwrap();
        let (chain, data_chain) = inner.chains_mut();
        fill_request(&mut set, &fast.gauges, &arena, demand, dp, chain, data_chain);
        inner.source = Some(Source::FastPool { core });
        true
    }

    /// Borrow from another core's fast pool. A donor must keep an eighth of
    /// its capacity free after the grant; a full miss disables balancing
    /// until a release refills some pool past half.
    fn try_balance(&self, req: &Arc<MemoryRequest>, demand: &Demand, affinity: usize) -> bool {
        let dp = self.data_provisioned;
        for offset in 1..self.cores.len() {
            let core = (affinity + offset) % self.cores.len();
            let fast = &self.cores[core];
            if !gauges_have_headroom(&fast.gauges, demand, dp) {
                continue;
            }
            let mut set = fast.set.lock();
            if !set_can_satisfy(&set, demand, dp) {
                continue;
            }
            let arena = self.arena.read();
            let mut inner = req.inner.lock().unwrap();
            let (chain, data_chain) = inner.chains_mut();
            fill_request(&mut set, &fast.gauges, &arena, demand, dp, chain, data_chain);
            inner.source = Some(Source::FastPool { core });
            inner.affinity = core;
            inner.balanced = true;
            trace!("balanced grant from core {} for core {}", core, affinity);
            return true;
        }
        debug!("no balance donor found, disabling balancing");
        self.balance_enabled.store(false, Ordering::Relaxed);
        false
    }

    /// Shared-tier admission under the global lock: bulk when nothing of
    /// equal or higher priority waits, the reserved pool for the current
    /// reservation holder, otherwise the wait queue.
    fn admit_or_queue(
        self: &Arc<Self>,
        req: &Arc<MemoryRequest>,
        demand: &Demand,
        priority: u8,
        io_master: Option<Arc<IoMaster>>,
    ) -> Result<SubmitStatus, PoolError> {
        let dp = self.data_provisioned;
        let mut shared = self.shared.lock().unwrap();

        if (shared.wait.is_empty() || shared.wait.watermark < priority)
            && set_can_satisfy(&shared.bulk, demand, dp)
        {
            let arena = self.arena.read();
            let mut inner = req.inner.lock().unwrap();
            let (chain, data_chain) = inner.chains_mut();
            fill_request(
                &mut shared.bulk,
                &self.bulk_gauges,
                &arena,
                demand,
                dp,
                chain,
                data_chain,
            );
            inner.source = Some(Source::Bulk);
            drop(inner);
            drop(arena);
            Self::charge_io_master(io_master.as_deref(), demand, false);
            self.publish_queue_gauges(&shared);
            drop(shared);
            req.complete(RequestState::GrantedImmediately);
            return Ok(SubmitStatus::Granted);
        }

        let is_holder = match (&io_master, &shared.reserved_holder) {
            (Some(io), Some(holder)) => Arc::ptr_eq(io, holder),
            _ => false,
        };
        if is_holder && set_can_satisfy(&shared.reserved, demand, dp) {
            let arena = self.arena.read();
            let mut inner = req.inner.lock().unwrap();
            let (chain, data_chain) = inner.chains_mut();
            fill_request(
                &mut shared.reserved,
                &self.reserved_gauges,
                &arena,
                demand,
                dp,
                chain,
                data_chain,
            );
            inner.source = Some(Source::Reserved);
            drop(inner);
            drop(arena);
            Self::charge_io_master(io_master.as_deref(), demand, true);
            self.publish_queue_gauges(&shared);
            drop(shared);
            req.complete(RequestState::GrantedImmediately);
            return Ok(SubmitStatus::Granted);
        }

        req.set_state(RequestState::Queued);
        shared.wait.push(Arc::clone(req), priority);
        self.publish_queue_gauges(&shared);
        trace!("request queued at priority {}", priority);
        Ok(SubmitStatus::Pending)
    }

    /// Return a granted request's chunks to their sourcing tier. A request
    /// with no chunks attached is a no-op; release is safe to repeat.
    pub fn release(&self, req: &Arc<MemoryRequest>) -> Result<(), PoolError> {
        let (chain, data_chain, source, io_master) = {
            let mut inner = req.inner.lock().unwrap();
            if inner.chain.is_empty() && inner.data_chain.is_empty() {
                // An abort that landed before any grant leaves nothing to
                // return; the request still has to reach Released so it can
                // be rebuilt.
                if req.state() == RequestState::Aborted {
                    inner.source = None;
                    req.set_state(RequestState::Released);
                } else {
                    warn!("release of a request with no chunks attached");
                }
                return Ok(());
            }
            (
                std::mem::take(&mut inner.chain),
                std::mem::take(&mut inner.data_chain),
                inner.source.take(),
                inner.io_master.clone(),
            )
        };
        let Some(source) = source else {
            let mut inner = req.inner.lock().unwrap();
            inner.chain = chain;
            inner.data_chain = data_chain;
            error!("release of a request with chunks but no recorded source");
            return Err(PoolError::RequestNotReady(req.state()));
        };

        match source {
            Source::FastPool { core } => self.release_fast(core, &chain, &data_chain),
            Source::Bulk => self.release_shared(&chain, &data_chain, io_master, false),
            Source::Reserved => self.release_shared(&chain, &data_chain, io_master, true),
        }

        req.set_state(RequestState::Released);
        if self.queued.load(Ordering::Acquire) > 0 {
            self.event.signal();
        }
        Ok(())
    }

    fn release_fast(&self, core: usize, chain: &[ChunkIndex], data_chain: &[ChunkIndex]) {
        let dp = self.data_provisioned;
        let fast = &self.cores[core];
        let mut control_counts = [0u64; POOL_COUNT];
        let mut data_counts = [0u64; POOL_COUNT];
        {
            let arena = self.arena.read();
            let mut set = fast.set.lock();
            for &idx in chain {
                let slot = arena.slot(idx);
                slot.set_tag(ChunkTag::Free);
                set.stack_mut(Purpose::Control, dp, slot.pool()).push(idx);
                control_counts[slot.pool().index()] += 1;
            }
            for &idx in data_chain {
                let slot = arena.slot(idx);
                slot.set_tag(ChunkTag::Free);
                set.stack_mut(Purpose::Data, dp, slot.pool()).push(idx);
                data_counts[slot.pool().index()] += 1;
            }
        }
        for pool in PoolId::ALL {
            let i = pool.index();
            if control_counts[i] > 0 {
                fast.gauges.control[i].put(control_counts[i]);
            }
            if data_counts[i] > 0 {
                fast.gauges
                    .for_purpose(Purpose::Data, dp, pool)
                    .put(data_counts[i]);
            }
            // A pool refilled past half of its capacity makes this core a
            // plausible donor again.
            let gauge = &fast.gauges.control[i];
            if (control_counts[i] > 0 || (data_counts[i] > 0 && !dp))
                && gauge.free() > gauge.total() / 2
            {
                self.balance_enabled.store(true, Ordering::Relaxed);
            }
            if dp && data_counts[i] > 0 {
                let gauge = &fast.gauges.data[i];
                if gauge.free() > gauge.total() / 2 {
                    self.balance_enabled.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    fn release_shared(
        &self,
        chain: &[ChunkIndex],
        data_chain: &[ChunkIndex],
        io_master: Option<Arc<IoMaster>>,
        reserved: bool,
    ) {
        let dp = self.data_provisioned;
        let mut released = [0u32; POOL_COUNT];
        let mut shared = self.shared.lock().unwrap();
        {
            let arena = self.arena.read();
            let (set, gauges) = if reserved {
                (&mut shared.reserved, &self.reserved_gauges)
            } else {
                (&mut shared.bulk, &self.bulk_gauges)
            };
            for &idx in chain {
                let slot = arena.slot(idx);
                slot.set_tag(ChunkTag::Free);
                set.stack_mut(Purpose::Control, dp, slot.pool()).push(idx);
                gauges.control[slot.pool().index()].put(1);
                released[slot.pool().index()] += 1;
            }
            for &idx in data_chain {
                let slot = arena.slot(idx);
                slot.set_tag(ChunkTag::Free);
                set.stack_mut(Purpose::Data, dp, slot.pool()).push(idx);
                gauges.for_purpose(Purpose::Data, dp, slot.pool()).put(1);
                released[slot.pool().index()] += 1;
            }
        }

        if let Some(io) = io_master {
            let drained = {
                let mut inner = io.inner.lock();
                let counters = if reserved {
                    &mut inner.reserved
                } else {
                    &mut inner.chunk
                };
                for (i, &n) in released.iter().enumerate() {
                    if counters[i] < n {
                        warn!("io master released more chunks than it was charged");
                        counters[i] = 0;
                    } else {
                        counters[i] -= n;
                    }
                }
                inner.holds_reservation && inner.is_drained()
            };
            if drained {
                io.inner.lock().holds_reservation = false;
                if shared
                    .reserved_holder
                    .as_ref()
                    .map_or(false, |holder| Arc::ptr_eq(holder, &io))
                {
                    shared.reserved_holder = None;
                    info!("reservation cleared, holder drained");
                }
            }
        }
    }

    /// Cancel a queued request. The dispatcher removes it from the queue and
    /// delivers the aborted completion.
    pub fn abort(&self, req: &Arc<MemoryRequest>) -> Result<(), PoolError> {
        if req.try_abort() {
            self.abort_pending.store(true, Ordering::Release);
            self.event.signal();
            Ok(())
        } else {
            Err(PoolError::RequestNotReady(req.state()))
        }
    }

    /// One-time growth: acquire each tier's initial main-chunk budget again
    /// and carve the bulk share of it, holding the rest uncarved.
    pub fn expand_main_pool(&self) -> Result<(), PoolError> {
        let mut shared = self.shared.lock().unwrap();
        if shared.expanded {
            return Err(PoolError::AlreadyExpanded);
        }
        let mut arena = self.arena.write();

        expand_tier(
            &mut arena,
            &self.config.control,
            false,
            &mut shared,
            &self.bulk_gauges,
        )?;
        if let Some(data) = self.config.data.clone() {
            expand_tier(&mut arena, &data, true, &mut shared, &self.bulk_gauges)?;
        }
        shared.expanded = true;
        self.main_free.store(
            (shared.main.len() + shared.main_data.len()) as u64,
            Ordering::Relaxed,
        );
        info!("main pool expanded, {} chunks total", arena.chunk_count());
        drop(arena);
        drop(shared);
        self.event.signal();
        Ok(())
    }

    /// Snapshot of every gauge and counter. Never perturbs allocation state.
    pub fn fill_statistics(&self) -> PoolStatistics {
        let counts = |gauge: &PoolGauge| PoolCounts {
            total: gauge.total(),
            free: gauge.free(),
        };
        let loads = |arr: &[AtomicU64; POOL_COUNT]| {
            [
                arr[0].load(Ordering::Relaxed),
                arr[1].load(Ordering::Relaxed),
                arr[2].load(Ordering::Relaxed),
            ]
        };
        let mut stats = PoolStatistics {
            main_free: self.main_free.load(Ordering::Relaxed),
            queued_requests: self.queued.load(Ordering::Relaxed),
            aborted_requests: self.aborted_total.load(Ordering::Relaxed),
            ..PoolStatistics::default()
        };
        for pool in PoolId::ALL {
            let i = pool.index();
            stats.bulk[i] = counts(&self.bulk_gauges.control[i]);
            stats.bulk_data[i] = counts(&self.bulk_gauges.data[i]);
            stats.reserved[i] = counts(&self.reserved_gauges.control[i]);
            stats.reserved_data[i] = counts(&self.reserved_gauges.data[i]);
        }
        for fast in &self.cores {
            let mut core = CoreStatistics {
                requests: loads(&fast.stats.requests),
                data_requests: loads(&fast.stats.data_requests),
                deferred: loads(&fast.stats.deferred),
                data_deferred: loads(&fast.stats.data_deferred),
                fast_requests: loads(&fast.stats.fast_requests),
                fast_data_requests: loads(&fast.stats.fast_data_requests),
                deadlock_escalations: fast.stats.deadlock_escalations.load(Ordering::Relaxed),
                ..CoreStatistics::default()
            };
            for pool in PoolId::ALL {
                let i = pool.index();
                core.fast[i] = counts(&fast.gauges.control[i]);
                core.fast_data[i] = counts(&fast.gauges.data[i]);
            }
            stats.cores.push(core);
        }
        stats
    }

    /// Memory of one granted chunk.
    pub fn chunk_data(&self, idx: ChunkIndex) -> NonNull<u8> {
        self.arena.read().slot(idx).data()
    }

    /// Byte length of one granted chunk.
    pub fn chunk_len(&self, idx: ChunkIndex) -> usize {
        self.arena.read().slot(idx).bytes()
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    fn note_arrival(&self, core: usize, demand: &Demand) {
        let stats = &self.cores[core].stats;
        if let Some((pool, _)) = demand.control {
            CoreStats::bump(&stats.requests, pool);
        }
        if let Some((pool, _)) = demand.data {
            CoreStats::bump(&stats.data_requests, pool);
        }
    }

    fn note_fast_grant(&self, core: usize, demand: &Demand) {
        let stats = &self.cores[core].stats;
        if let Some((pool, _)) = demand.control {
            CoreStats::bump(&stats.fast_requests, pool);
        }
        if let Some((pool, _)) = demand.data {
            CoreStats::bump(&stats.fast_data_requests, pool);
        }
    }

    fn note_deferred(&self, core: usize, demand: &Demand) {
        let stats = &self.cores[core].stats;
        if let Some((pool, _)) = demand.control {
            CoreStats::bump(&stats.deferred, pool);
        }
        if let Some((pool, _)) = demand.data {
            CoreStats::bump(&stats.data_deferred, pool);
        }
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        self.event.request_stop();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Initial provisioning for one tier: bulk and reserved stacks are filled
/// whole main chunks at a time; fast chunks are dealt round-robin across the
/// cores so every core starts with an equal share.
#[allow(clippy::too_many_arguments)]
fn carve_tier(
    arena: &mut ChunkArena,
    retry_forever: bool,
    params: &TierParams,
    data: bool,
    shared: &mut Shared,
    bulk_gauges: &TierGauges,
    reserved_gauges: &TierGauges,
    cores: &[FastPool],
) -> Result<(), PoolError> {
    let mut regions = arena.acquire_main(params.main_chunks, retry_forever)?;

    for pool in PoolId::ALL {
        let i = pool.index();

        let mut bulk_count = 0u64;
        for region in regions.drain(..params.bulk[i]).collect::<Vec<_>>() {
            for idx in arena.carve(region, pool) {
                let stack = if data {
                    &mut shared.bulk.data[i]
                } else {
                    &mut shared.bulk.control[i]
                };
                stack.push(idx);
                bulk_count += 1;
            }
        }
        if bulk_count > 0 {
            tier_gauge(bulk_gauges, data, i).add_total(bulk_count);
        }

        let mut reserved_count = 0u64;
        for region in regions.drain(..params.reserved[i]).collect::<Vec<_>>() {
            for idx in arena.carve(region, pool) {
                let stack = if data {
                    &mut shared.reserved.data[i]
                } else {
                    &mut shared.reserved.control[i]
                };
                stack.push(idx);
                reserved_count += 1;
            }
        }
        if reserved_count > 0 {
            tier_gauge(reserved_gauges, data, i).add_total(reserved_count);
        }

        let mut per_core = vec![0u64; cores.len()];
        let mut dealt = 0usize;
        for region in regions.drain(..params.fast[i]).collect::<Vec<_>>() {
            for idx in arena.carve(region, pool) {
                let core = dealt % cores.len();
                let mut set = cores[core].set.lock();
                let stack = if data {
                    &mut set.data[i]
                } else {
                    &mut set.control[i]
                };
                stack.push(idx);
                per_core[core] += 1;
                dealt += 1;
            }
        }
        for (core, &n) in per_core.iter().enumerate() {
            if n > 0 {
                tier_gauge(&cores[core].gauges, data, i).add_total(n);
            }
        }
    }

    if data {
        shared.main_data.extend(regions);
    } else {
        shared.main.extend(regions);
    }
    Ok(())
}

/// Expansion carves only the bulk share of the new budget; the remainder
/// stays uncarved in the main pool.
fn expand_tier(
    arena: &mut ChunkArena,
    params: &TierParams,
    data: bool,
    shared: &mut Shared,
    bulk_gauges: &TierGauges,
) -> Result<(), PoolError> {
    let mut regions = arena.acquire_main(params.main_chunks, false)?;
    for pool in PoolId::ALL {
        let i = pool.index();
        let take = params.bulk[i].min(regions.len());
        let mut count = 0u64;
        for region in regions.drain(..take).collect::<Vec<_>>() {
            for idx in arena.carve(region, pool) {
                let stack = if data {
                    &mut shared.bulk.data[i]
                } else {
                    &mut shared.bulk.control[i]
                };
                stack.push(idx);
                count += 1;
            }
        }
        if count > 0 {
            tier_gauge(bulk_gauges, data, i).add_total(count);
        }
    }
    if data {
        shared.main_data.extend(regions);
    } else {
        shared.main.extend(regions);
    }
    Ok(())
}

fn tier_gauge(gauges: &TierGauges, data: bool, index: usize) -> &PoolGauge {
    if data {
        &gauges.data[index]
    } else {
        &gauges.control[index]
    }
}
