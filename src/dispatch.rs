//! Priority wait queue, dispatcher thread, and deadlock escalation.
//!
//! Requests that cannot be admitted synchronously wait in 128 FIFO levels.
//! A background thread drains the queue in strict priority order whenever
//! chunks come back, stopping at the first request it cannot satisfy. When
//! the head of the queue stalls past the configured window the dispatcher
//! escalates through the reserved pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::alloc::{PoolAllocator, Shared};
use crate::class::Demand;
use crate::pool::{fill_request, gauges_can_satisfy, set_can_satisfy};
use crate::request::{IoMaster, MemoryRequest, RequestState, Source};
use crate::PRIORITY_LEVELS;

/// FIFO-per-priority wait queue. Owned by the allocator's global lock; the
/// watermark caches the highest priority currently queued so the submit path
/// can gate on it without walking the levels.
pub(crate) struct WaitQueue {
    levels: Vec<VecDeque<Arc<MemoryRequest>>>,
    pub watermark: u8,
    pub count: usize,
}

impl WaitQueue {
    pub fn new() -> Self {
        WaitQueue {
            levels: (0..PRIORITY_LEVELS).map(|_| VecDeque::new()).collect(),
            watermark: 0,
            count: 0,
        }
    }

    pub fn push(&mut self, req: Arc<MemoryRequest>, priority: u8) {
        if priority > self.watermark {
            self.watermark = priority;
        }
        self.levels[usize::from(priority)].push_back(req);
        self.count += 1;
    }

    pub fn level_mut(&mut self, priority: usize) -> &mut VecDeque<Arc<MemoryRequest>> {
        &mut self.levels[priority]
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Drop the watermark to the highest non-empty level.
    pub fn settle_watermark(&mut self) {
        let mut level = usize::from(self.watermark);
        loop {
            if !self.levels[level].is_empty() {
                self.watermark = level as u8;
                return;
            }
            if level == 0 {
                self.watermark = 0;
                return;
            }
            level -= 1;
        }
    }
}

/// Wakeup channel between releases and the dispatcher thread.
pub(crate) struct DispatchEvent {
    flag: Mutex<bool>,
    cv: Condvar,
    stop: AtomicBool,
}

impl DispatchEvent {
    pub fn new() -> Arc<DispatchEvent> {
        Arc::new(DispatchEvent {
            flag: Mutex::new(false),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
        })
    }

    pub fn signal(&self) {
        *self.flag.lock().unwrap() = true;
        self.cv.notify_one();
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.signal();
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Wait until signaled or `timeout` elapses, consuming the signal.
    pub fn wait(&self, timeout: Duration) {
        let mut flag = self.flag.lock().unwrap();
        if !*flag {
            let (f, _) = self.cv.wait_timeout(flag, timeout).unwrap();
            flag = f;
        }
        *flag = false;
    }
}

/// Periodic wakeup so stalls are detected even when no release arrives.
pub(crate) const DISPATCH_PERIOD: Duration = Duration::from_millis(200);

pub(crate) fn spawn_dispatcher(
    alloc: &Arc<PoolAllocator>,
    event: Arc<DispatchEvent>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let weak: Weak<PoolAllocator> = Arc::downgrade(alloc);
    std::thread::Builder::new()
        .name("tierpool-dispatch".to_string())
        .spawn(move || {
            info!("dispatcher started");
            loop {
                event.wait(DISPATCH_PERIOD);
                if event.stopped() {
                    break;
                }
                let Some(alloc) = weak.upgrade() else { break };
                alloc.dispatch_once();
            }
            info!("dispatcher stopped");
        })
}

impl PoolAllocator {
    /// One dispatcher pass: drain aborts, then grant queued requests in
    /// strict priority order until the first one the pools cannot satisfy.
    /// Completions run after the global lock is dropped.
    pub(crate) fn dispatch_once(self: &Arc<Self>) {
        let mut grants: Vec<Arc<MemoryRequest>> = Vec::new();
        let mut aborts: Vec<Arc<MemoryRequest>> = Vec::new();

        {
            let mut shared = self.shared.lock().unwrap();
            self.sweep_aborted(&mut shared, &mut aborts);

            let mut out_of_memory = false;
            let mut level = usize::from(shared.wait.watermark);
            'walk: loop {
                while let Some(front) = shared.wait.level_mut(level).front().cloned() {
                    if front.state() == RequestState::Aborted {
                        shared.wait.level_mut(level).pop_front();
                        shared.wait.count -= 1;
                        self.aborted_total.fetch_add(1, Ordering::Relaxed);
                        self.release_drained_reservation(&mut shared, &front);
                        aborts.push(front);
                        continue;
                    }
                    if self.try_allocate_queued(&mut shared, &front) {
                        shared.wait.level_mut(level).pop_front();
                        shared.wait.count -= 1;
                        grants.push(front);
                    } else {
                        out_of_memory = true;
                        break 'walk;
                    }
                }
                if level == 0 {
                    break;
                }
                level -= 1;
            }
            shared.wait.settle_watermark();

            if out_of_memory && grants.is_empty() && !shared.wait.is_empty() {
                let now = Instant::now();
                match shared.stall_since {
                    None => shared.stall_since = Some(now),
                    Some(since) if now.duration_since(since) >= self.stall_window() => {
                        warn!(
                            "wait queue stalled for {:?} with {} requests, escalating",
                            now.duration_since(since),
                            shared.wait.count
                        );
                        self.escalate(&mut shared, &mut grants);
                        shared.wait.settle_watermark();
                        shared.stall_since = Some(now);
                    }
                    Some(_) => {}
                }
            } else {
                shared.stall_since = None;
            }

            self.publish_queue_gauges(&shared);
        }

        for req in grants {
            trace!("dispatcher grant, priority {}", req.priority());
            req.complete_grant();
        }
        for req in aborts {
            req.complete(RequestState::Aborted);
        }
    }

    fn sweep_aborted(&self, shared: &mut Shared, aborts: &mut Vec<Arc<MemoryRequest>>) {
        if !self.abort_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        for level in 0..PRIORITY_LEVELS {
            let queue = shared.wait.level_mut(level);
            let mut kept = VecDeque::with_capacity(queue.len());
            for req in queue.drain(..) {
                if req.state() == RequestState::Aborted {
                    aborts.push(req);
                } else {
                    kept.push_back(req);
                }
            }
            *shared.wait.level_mut(level) = kept;
        }
        shared.wait.count -= aborts.len();
        shared.wait.settle_watermark();
        self.aborted_total
            .fetch_add(aborts.len() as u64, Ordering::Relaxed);
        for req in aborts.iter() {
            self.release_drained_reservation(shared, req);
        }
    }

    /// An aborted request may have been the reservation holder's last piece
    /// of work. If its io master holds the reservation with nothing
    /// outstanding, free the slot so a later stall can escalate again.
    fn release_drained_reservation(&self, shared: &mut Shared, req: &Arc<MemoryRequest>) {
        let Some(io) = req.inner.lock().unwrap().io_master.clone() else {
            return;
        };
        let is_holder = shared
            .reserved_holder
            .as_ref()
            .map_or(false, |holder| Arc::ptr_eq(holder, &io));
        if !is_holder {
            return;
        }
        let drained = {
            let mut inner = io.inner.lock();
            if inner.is_drained() {
                inner.holds_reservation = false;
                true
            } else {
                false
            }
        };
        if drained {
            shared.reserved_holder = None;
            info!("reservation released, holder's queued request was aborted");
        }
    }

    /// Generalized admission for a queued request: any core's fast pool,
    /// then the bulk pool, then the reserved pool when the request's io
    /// master holds the reservation.
    fn try_allocate_queued(&self, shared: &mut Shared, req: &Arc<MemoryRequest>) -> bool {
        let (demand, io_master) = {
            let inner = req.inner.lock().unwrap();
            (
                Demand::resolve(inner.class, inner.counts),
                inner.io_master.clone(),
            )
        };
        let dp = self.data_provisioned;

        for (core, fast) in self.cores.iter().enumerate() {
            if !gauges_can_satisfy(&fast.gauges, &demand, dp) {
                continue;
            }
            let mut set = fast.set.lock();
            if !set_can_satisfy(&set, &demand, dp) {
                continue;
            }
            let arena = self.arena.read();
            let mut inner = req.inner.lock().unwrap();
            let (chain, data_chain) = inner.chains_mut();
            fill_request(&mut set, &fast.gauges, &arena, &demand, dp, chain, data_chain);
            inner.source = Some(Source::FastPool { core });
            inner.balanced = core != inner.affinity;
            return true;
        }

        if set_can_satisfy(&shared.bulk, &demand, dp) {
            let arena = self.arena.read();
            let mut inner = req.inner.lock().unwrap();
            let (chain, data_chain) = inner.chains_mut();
            fill_request(
                &mut shared.bulk,
                &self.bulk_gauges,
                &arena,
                &demand,
                dp,
                chain,
                data_chain,
            );
            inner.source = Some(Source::Bulk);
            drop(arena);
            Self::charge_io_master(io_master.as_deref(), &demand, false);
            return true;
        }

        let is_holder = match (&io_master, &shared.reserved_holder) {
            (Some(io), Some(holder)) => Arc::ptr_eq(io, holder),
            _ => false,
        };
        if is_holder && set_can_satisfy(&shared.reserved, &demand, dp) {
            let arena = self.arena.read();
            let mut inner = req.inner.lock().unwrap();
            let (chain, data_chain) = inner.chains_mut();
            fill_request(
                &mut shared.reserved,
                &self.reserved_gauges,
                &arena,
                &demand,
                dp,
                chain,
                data_chain,
            );
            inner.source = Some(Source::Reserved);
            drop(arena);
            Self::charge_io_master(io_master.as_deref(), &demand, true);
            return true;
        }

        false
    }

    /// Record a shared-tier grant against the io master's outstanding
    /// counters. Fast-pool grants never reach here.
    pub(crate) fn charge_io_master(io_master: Option<&IoMaster>, demand: &Demand, reserved: bool) {
        let Some(io) = io_master else { return };
        let mut inner = io.inner.lock();
        let counters = if reserved {
            &mut inner.reserved
        } else {
            &mut inner.chunk
        };
        if let Some((pool, n)) = demand.control {
            counters[pool.index()] += n;
        }
        if let Some((pool, n)) = demand.data {
            counters[pool.index()] += n;
        }
    }

    /// Stall response. The candidate is the highest-priority queued request
    /// carrying an io master. A free reservation goes to it outright; a held
    /// reservation is preempted only by a strictly higher priority, and an
    /// equal-priority candidate instead pushes the holder's own queued
    /// requests through the reserved pool.
    fn escalate(self: &Arc<Self>, shared: &mut Shared, grants: &mut Vec<Arc<MemoryRequest>>) {
        let mut candidate: Option<(Arc<MemoryRequest>, Arc<IoMaster>, u8)> = None;
        let mut level = usize::from(shared.wait.watermark);
        'scan: loop {
            for req in shared.wait.level_mut(level).iter() {
                if req.state() == RequestState::Aborted {
                    continue;
                }
                let inner = req.inner.lock().unwrap();
                if let Some(io) = inner.io_master.clone() {
                    let priority = inner.priority;
                    drop(inner);
                    candidate = Some((req.clone(), io, priority));
                    break 'scan;
                }
            }
            if level == 0 {
                break;
            }
            level -= 1;
        }
        let Some((candidate, io, priority)) = candidate else {
            debug!("stall without an io-master request, nothing to escalate");
            return;
        };

        match shared.reserved_holder.clone() {
            None => {
                self.grant_reservation(shared, &io, priority, &candidate);
                self.drain_holder_requests(shared, grants);
            }
            Some(holder) if Arc::ptr_eq(&holder, &io) => {
                self.drain_holder_requests(shared, grants);
            }
            Some(holder) => {
                let holder_priority = holder.inner.lock().priority;
                if holder_priority < priority {
                    info!(
                        "revoking reservation (holder priority {} < candidate {})",
                        holder_priority, priority
                    );
                    holder.inner.lock().holds_reservation = false;
                    self.grant_reservation(shared, &io, priority, &candidate);
                    self.drain_holder_requests(shared, grants);
                } else if holder_priority == priority {
                    self.drain_holder_requests(shared, grants);
                }
            }
        }
    }

    fn grant_reservation(
        &self,
        shared: &mut Shared,
        io: &Arc<IoMaster>,
        priority: u8,
        candidate: &Arc<MemoryRequest>,
    ) {
        {
            let mut inner = io.inner.lock();
            inner.holds_reservation = true;
            inner.priority = priority;
        }
        shared.reserved_holder = Some(Arc::clone(io));
        let affinity = candidate.inner.lock().unwrap().affinity;
        let core = affinity % self.cores.len();
        self.cores[core]
            .stats
            .deadlock_escalations
            .fetch_add(1, Ordering::Relaxed);
        info!("reservation granted at priority {}", priority);
    }

    /// Grant every queued request belonging to the reservation holder that
    /// the reserved pool can satisfy.
    fn drain_holder_requests(&self, shared: &mut Shared, grants: &mut Vec<Arc<MemoryRequest>>) {
        let Some(holder) = shared.reserved_holder.clone() else {
            return;
        };
        let dp = self.data_provisioned;
        let mut level = usize::from(shared.wait.watermark);
        loop {
            let mut remaining = VecDeque::new();
            while let Some(req) = shared.wait.level_mut(level).pop_front() {
                let (demand, is_holder) = {
                    let inner = req.inner.lock().unwrap();
                    let owned = inner
                        .io_master
                        .as_ref()
                        .map_or(false, |io| Arc::ptr_eq(io, &holder));
                    (Demand::resolve(inner.class, inner.counts), owned)
                };
                if is_holder
                    && req.state() != RequestState::Aborted
                    && set_can_satisfy(&shared.reserved, &demand, dp)
                {
                    let arena = self.arena.read();
                    let mut inner = req.inner.lock().unwrap();
                    let (chain, data_chain) = inner.chains_mut();
                    fill_request(
                        &mut shared.reserved,
                        &self.reserved_gauges,
                        &arena,
                        &demand,
                        dp,
                        chain,
                        data_chain,
                    );
                    inner.source = Some(Source::Reserved);
                    drop(inner);
                    drop(arena);
                    Self::charge_io_master(Some(&holder), &demand, true);
                    shared.wait.count -= 1;
                    grants.push(req);
                } else {
                    remaining.push_back(req);
                }
            }
            *shared.wait.level_mut(level) = remaining;
            if level == 0 {
                break;
            }
            level -= 1;
        }
    }

    fn stall_window(&self) -> Duration {
        Duration::from_millis(self.config.stall_window_ms)
    }

    pub(crate) fn publish_queue_gauges(&self, shared: &Shared) {
        self.queued
            .store(shared.wait.count as u64, Ordering::Release);
        self.watermark
            .store(shared.wait.watermark, Ordering::Release);
    }
}
