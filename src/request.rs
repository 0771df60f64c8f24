//! Memory requests, their state machine, and io masters.
//!
//! A request is built once, submitted, and either granted immediately, queued
//! for the dispatcher, or aborted. Completion is delivered through an optional
//! callback; callers without one block in [`MemoryRequest::wait_ready`]. The
//! same request object is reusable after release.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::error;

use crate::chunk::ChunkIndex;
use crate::class::{ChunkClass, ObjectCounts, POOL_COUNT};
use crate::{PoolError, PRIORITY_LEVELS};

/// Request lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    Initialized = 0,
    Submitted = 1,
    GrantedImmediately = 2,
    Queued = 3,
    Granted = 4,
    Aborted = 5,
    Released = 6,
}

impl RequestState {
    fn from_u8(v: u8) -> RequestState {
        match v {
            1 => RequestState::Submitted,
            2 => RequestState::GrantedImmediately,
            3 => RequestState::Queued,
            4 => RequestState::Granted,
            5 => RequestState::Aborted,
            6 => RequestState::Released,
            _ => RequestState::Initialized,
        }
    }
}

/// Tier a granted request drew its chunks from, recorded once at grant time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    FastPool { core: usize },
    Bulk,
    Reserved,
}

pub type CompletionFn = Box<dyn FnOnce(&Arc<MemoryRequest>) + Send>;

pub(crate) struct RequestInner {
    pub class: ChunkClass,
    pub counts: ObjectCounts,
    pub priority: u8,
    pub affinity: usize,
    pub source: Option<Source>,
    pub chain: Vec<ChunkIndex>,
    pub data_chain: Vec<ChunkIndex>,
    pub io_master: Option<Arc<IoMaster>>,
    pub completion: Option<CompletionFn>,
    pub balanced: bool,
}

impl RequestInner {
    pub fn chains_mut(&mut self) -> (&mut Vec<ChunkIndex>, &mut Vec<ChunkIndex>) {
        (&mut self.chain, &mut self.data_chain)
    }
}

/// One buffer-acquisition request.
pub struct MemoryRequest {
    state: AtomicU8,
    pub(crate) inner: Mutex<RequestInner>,
    done: Condvar,
}

impl MemoryRequest {
    /// Build a fresh request in the `Initialized` state. Fails when the
    /// priority is out of range or the class shape is not provisioned.
    pub fn build(
        class: ChunkClass,
        counts: ObjectCounts,
        priority: u8,
        affinity: usize,
        io_master: Option<Arc<IoMaster>>,
        completion: Option<CompletionFn>,
    ) -> Result<Arc<MemoryRequest>, PoolError> {
        class.validate()?;
        if usize::from(priority) >= PRIORITY_LEVELS {
            error!("request priority {} out of range", priority);
            return Err(PoolError::InvalidPriority(priority));
        }
        Ok(Arc::new(MemoryRequest {
            state: AtomicU8::new(RequestState::Initialized as u8),
            inner: Mutex::new(RequestInner {
                class,
                counts,
                priority,
                affinity,
                source: None,
                chain: Vec::new(),
                data_chain: Vec::new(),
                io_master,
                completion,
                balanced: false,
            }),
            done: Condvar::new(),
        }))
    }

    /// Rearm a released request for another submission with fresh parameters.
    pub fn rebuild(
        self: &Arc<Self>,
        class: ChunkClass,
        counts: ObjectCounts,
        priority: u8,
        affinity: usize,
        completion: Option<CompletionFn>,
    ) -> Result<(), PoolError> {
        class.validate()?;
        if usize::from(priority) >= PRIORITY_LEVELS {
            error!("request priority {} out of range", priority);
            return Err(PoolError::InvalidPriority(priority));
        }
        if self.is_in_use() {
            error!("rebuild of an in-flight request (state {:?})", self.state());
            return Err(PoolError::RequestInUse(self.state()));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.class = class;
        inner.counts = counts;
        inner.priority = priority;
        inner.affinity = affinity;
        inner.source = None;
        inner.completion = completion;
        inner.balanced = false;
        debug_assert!(inner.chain.is_empty() && inner.data_chain.is_empty());
        self.state
            .store(RequestState::Initialized as u8, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: RequestState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The request is owned by the allocator between submission and release.
    pub fn is_in_use(&self) -> bool {
        !matches!(
            self.state(),
            RequestState::Initialized | RequestState::Released
        )
    }

    /// Chunks are attached and the request is usable by the client.
    pub fn is_allocation_complete(&self) -> bool {
        matches!(
            self.state(),
            RequestState::GrantedImmediately | RequestState::Granted
        )
    }

    /// The grant happened on the submitting thread, before `submit` returned.
    pub fn is_immediate(&self) -> bool {
        self.state() == RequestState::GrantedImmediately
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == RequestState::Aborted
    }

    pub fn priority(&self) -> u8 {
        self.inner.lock().unwrap().priority
    }

    /// Number of chunks on the control chain.
    pub fn chain_len(&self) -> usize {
        self.inner.lock().unwrap().chain.len()
    }

    /// Number of chunks on the data chain.
    pub fn data_chain_len(&self) -> usize {
        self.inner.lock().unwrap().data_chain.len()
    }

    /// Chain head, the chunk clients treat as the request's master buffer.
    pub fn chain_head(&self) -> Option<ChunkIndex> {
        self.inner.lock().unwrap().chain.first().copied()
    }

    /// Snapshot of the control chain in grant order.
    pub fn chain(&self) -> Vec<ChunkIndex> {
        self.inner.lock().unwrap().chain.clone()
    }

    /// Snapshot of the data chain in grant order.
    pub fn data_chain(&self) -> Vec<ChunkIndex> {
        self.inner.lock().unwrap().data_chain.clone()
    }

    pub fn source(&self) -> Option<Source> {
        self.inner.lock().unwrap().source
    }

    /// True when the grant came from a core other than the submitted
    /// affinity.
    pub fn was_balanced(&self) -> bool {
        self.inner.lock().unwrap().balanced
    }

    /// Block until the request leaves the pending states.
    pub fn wait_ready(self: &Arc<Self>) -> RequestState {
        let mut guard = self.inner.lock().unwrap();
        loop {
            match self.state() {
                RequestState::Submitted | RequestState::Queued => {
                    guard = self.done.wait(guard).unwrap();
                }
                state => return state,
            }
        }
    }

    /// Like [`wait_ready`](Self::wait_ready) with an upper bound; returns the
    /// current state either way.
    pub fn wait_ready_timeout(self: &Arc<Self>, timeout: Duration) -> RequestState {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.inner.lock().unwrap();
        loop {
            match self.state() {
                RequestState::Submitted | RequestState::Queued => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return self.state();
                    }
                    let (g, _) = self.done.wait_timeout(guard, deadline - now).unwrap();
                    guard = g;
                }
                state => return state,
            }
        }
    }

    /// Finish the request: publish `state`, wake waiters, then run the
    /// completion callback outside the request lock.
    pub(crate) fn complete(self: &Arc<Self>, state: RequestState) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            self.set_state(state);
            inner.completion.take()
        };
        self.done.notify_all();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    /// Queued -> Aborted, only from the queued state.
    pub(crate) fn try_abort(&self) -> bool {
        self.state
            .compare_exchange(
                RequestState::Queued as u8,
                RequestState::Aborted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Finish a dispatcher grant. The transition is conditional so an abort
    /// that raced the grant keeps the aborted state; the chunks stay attached
    /// either way and the callback observes whichever state won.
    pub(crate) fn complete_grant(self: &Arc<Self>) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            let _ = self.state.compare_exchange(
                RequestState::Queued as u8,
                RequestState::Granted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            inner.completion.take()
        };
        self.done.notify_all();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    /// Reconcile an abort that raced a grant: valid only when the request is
    /// aborted yet carries chunks, in which case it becomes granted and the
    /// caller owns the chunks again.
    pub fn mark_aborted_complete(self: &Arc<Self>) -> Result<(), PoolError> {
        let inner = self.inner.lock().unwrap();
        if self.state() != RequestState::Aborted
            || (inner.chain.is_empty() && inner.data_chain.is_empty())
        {
            error!(
                "mark_aborted_complete on state {:?} with {} chunks",
                self.state(),
                inner.chain.len() + inner.data_chain.len()
            );
            return Err(PoolError::RequestNotReady(self.state()));
        }
        self.set_state(RequestState::Granted);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct IoMasterInner {
    /// Outstanding chunks per class granted from the bulk pool.
    pub chunk: [u32; POOL_COUNT],
    /// Outstanding chunks per class granted from the reserved pool.
    pub reserved: [u32; POOL_COUNT],
    pub holds_reservation: bool,
    pub priority: u8,
}

impl IoMasterInner {
    pub fn is_drained(&self) -> bool {
        self.chunk.iter().all(|&c| c == 0) && self.reserved.iter().all(|&c| c == 0)
    }
}

/// Accounting identity for one client I/O. Tracks outstanding shared-tier
/// chunks so the reservation can be granted to exactly one master and cleared
/// when it drains. Mutated only under the allocator's global lock.
pub struct IoMaster {
    pub(crate) inner: spin::Mutex<IoMasterInner>,
}

impl IoMaster {
    pub fn new() -> Arc<IoMaster> {
        Arc::new(IoMaster {
            inner: spin::Mutex::new(IoMasterInner::default()),
        })
    }

    pub fn holds_reservation(&self) -> bool {
        self.inner.lock().holds_reservation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::PoolId;

    fn simple_request() -> Arc<MemoryRequest> {
        MemoryRequest::build(
            ChunkClass::Single(PoolId::Packet),
            ObjectCounts::single(1),
            10,
            0,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn build_rejects_bad_priority() {
        let err = MemoryRequest::build(
            ChunkClass::Single(PoolId::Packet),
            ObjectCounts::single(1),
            128,
            0,
            None,
            None,
        )
        .err();
        assert!(matches!(err, Some(PoolError::InvalidPriority(128))));
    }

    #[test]
    fn rebuild_rejects_in_flight() {
        let req = simple_request();
        assert_eq!(req.state(), RequestState::Initialized);
        assert!(!req.is_in_use());

        req.set_state(RequestState::Queued);
        assert!(req.is_in_use());
        let err = req
            .rebuild(
                ChunkClass::Single(PoolId::Packet),
                ObjectCounts::single(1),
                1,
                0,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, PoolError::RequestInUse(RequestState::Queued)));
    }

    #[test]
    fn mark_aborted_complete_needs_chunks() {
        let req = simple_request();
        req.set_state(RequestState::Aborted);
        assert!(req.mark_aborted_complete().is_err());

        req.inner.lock().unwrap().chain.push(ChunkIndex(0));
        req.mark_aborted_complete().unwrap();
        assert_eq!(req.state(), RequestState::Granted);
    }

    #[test]
    fn completion_runs_after_state_publish() {
        let observed = Arc::new(std::sync::Mutex::new(None));
        let obs = Arc::clone(&observed);
        let req = MemoryRequest::build(
            ChunkClass::Single(PoolId::Packet),
            ObjectCounts::single(1),
            0,
            0,
            None,
            Some(Box::new(move |r: &Arc<MemoryRequest>| {
                *obs.lock().unwrap() = Some(r.state());
            })),
        )
        .unwrap();
        req.complete(RequestState::Granted);
        assert_eq!(*observed.lock().unwrap(), Some(RequestState::Granted));
    }
}
