//! Chunk arena and slab acquisition.
//!
//! All chunk memory is acquired up front from a [`MemorySource`] as large
//! slabs, split into main chunks, and carved into class-sized chunks when the
//! tier queues are populated. Chunks are addressed by [`ChunkIndex`] from then
//! on; the arena owns the backing slabs for the lifetime of the allocator and
//! returns them through the source on drop.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use log::{debug, warn};

use crate::class::{PoolId, MAIN_CHUNK_BYTES};
use crate::PoolError;

/// Stable handle for one carved chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkIndex(pub(crate) u32);

impl ChunkIndex {
    #[inline]
    pub(crate) fn arr(self) -> usize {
        self.0 as usize
    }
}

/// Validity tag on a chunk slot. Transitions only while the owning tier lock
/// is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ChunkTag {
    Free = 0,
    Control = 1,
    Data = 2,
}

impl ChunkTag {
    fn from_u8(v: u8) -> ChunkTag {
        match v {
            1 => ChunkTag::Control,
            2 => ChunkTag::Data,
            _ => ChunkTag::Free,
        }
    }
}

/// One carved chunk: its memory, size class, and current validity tag.
pub(crate) struct ChunkSlot {
    data: NonNull<u8>,
    bytes: u32,
    pool: PoolId,
    tag: AtomicU8,
}

impl ChunkSlot {
    #[inline]
    pub fn data(&self) -> NonNull<u8> {
        self.data
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes as usize
    }

    #[inline]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    #[inline]
    pub fn tag(&self) -> ChunkTag {
        ChunkTag::from_u8(self.tag.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_tag(&self, tag: ChunkTag) {
        self.tag.store(tag as u8, Ordering::Release);
    }
}

/// Provider of backing memory for the arena. The native source uses the
/// process heap; embedders hand the pool a fixed region or their own carved
/// memory instead.
pub trait MemorySource: Send + Sync {
    /// Acquire `bytes` of chunk-aligned backing memory, or `None` when the
    /// source cannot currently provide that much.
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// Return a slab previously handed out by `allocate`.
    ///
    /// # Safety
    /// `ptr`/`bytes` must name exactly one prior `allocate` result, and no
    /// chunk carved from it may be referenced afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize);
}

/// Process-heap source used when no external region is supplied.
pub struct NativeSource;

impl MemorySource for NativeSource {
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(bytes, 4096).ok()?;
        // Zeroing keeps freshly carved control chunks inert until first use.
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        let layout = Layout::from_size_align_unchecked(bytes, 4096);
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// Bump source over one caller-supplied region. Never releases; the embedder
/// owns the region's lifetime.
pub struct FixedRegion {
    base: NonNull<u8>,
    bytes: usize,
    used: spin::Mutex<usize>,
}

impl FixedRegion {
    /// # Safety
    /// `base..base+bytes` must be valid, writable, and unused by anything else
    /// for the lifetime of the allocator built over this region.
    pub unsafe fn new(base: NonNull<u8>, bytes: usize) -> Self {
        FixedRegion {
            base,
            bytes,
            used: spin::Mutex::new(0),
        }
    }
}

unsafe impl Send for FixedRegion {}
unsafe impl Sync for FixedRegion {}

impl MemorySource for FixedRegion {
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let mut used = self.used.lock();
        if self.bytes - *used < bytes {
            return None;
        }
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(*used)) };
        *used += bytes;
        Some(ptr)
    }

    unsafe fn release(&self, _ptr: NonNull<u8>, _bytes: usize) {}
}

/// One uncarved main chunk.
pub(crate) struct MainRegion {
    ptr: NonNull<u8>,
}

unsafe impl Send for MainRegion {}

struct Slab {
    ptr: NonNull<u8>,
    bytes: usize,
}

/// Owner of all slabs and carved chunk slots.
pub(crate) struct ChunkArena {
    slots: Vec<ChunkSlot>,
    slabs: Vec<Slab>,
    source: std::sync::Arc<dyn MemorySource>,
}

unsafe impl Send for ChunkArena {}
unsafe impl Sync for ChunkArena {}

impl ChunkArena {
    pub fn new(source: std::sync::Arc<dyn MemorySource>) -> Self {
        ChunkArena {
            slots: Vec::new(),
            slabs: Vec::new(),
            source,
        }
    }

    #[inline]
    pub fn slot(&self, idx: ChunkIndex) -> &ChunkSlot {
        &self.slots[idx.arr()]
    }

    /// Acquire at least `main_chunks` main chunks' worth of backing memory,
    /// halving the slab request on each source refusal. With `retry_forever`
    /// the final fallback is a single main chunk; otherwise everything
    /// acquired so far is returned to the source and the call fails.
    pub fn acquire_main(
        &mut self,
        main_chunks: usize,
        retry_forever: bool,
    ) -> Result<Vec<MainRegion>, PoolError> {
        let mut regions = Vec::with_capacity(main_chunks);
        let mut acquired_slabs: Vec<Slab> = Vec::new();
        let mut remaining = main_chunks;

        while remaining > 0 {
            let mut ask = remaining;
            let ptr = loop {
                match self.source.allocate(ask * MAIN_CHUNK_BYTES) {
                    Some(p) => break Some(p),
                    None if ask > 1 => {
                        ask /= 2;
                        debug!("slab acquisition refused, retrying with {} main chunks", ask);
                    }
                    None if retry_forever => {
                        // Accept running degraded on whatever single chunk the
                        // source eventually yields.
                        std::thread::yield_now();
                    }
                    None => break None,
                }
            };
            let Some(ptr) = ptr else {
                warn!(
                    "memory source exhausted with {} of {} main chunks outstanding",
                    remaining, main_chunks
                );
                for slab in acquired_slabs {
                    unsafe { self.source.release(slab.ptr, slab.bytes) };
                }
                return Err(PoolError::SourceExhausted);
            };

            let bytes = ask * MAIN_CHUNK_BYTES;
            for i in 0..ask {
                let chunk = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(i * MAIN_CHUNK_BYTES)) };
                regions.push(MainRegion { ptr: chunk });
            }
            acquired_slabs.push(Slab { ptr, bytes });
            remaining -= ask;
        }

        self.slabs.extend(acquired_slabs);
        Ok(regions)
    }

    /// Carve one main chunk into chunks of `pool`'s size, returning the new
    /// indices. The remainder of the main chunk past the last whole chunk is
    /// left unused.
    pub fn carve(&mut self, region: MainRegion, pool: PoolId) -> Vec<ChunkIndex> {
        let chunk_bytes = pool.chunk_bytes();
        let per_main = MAIN_CHUNK_BYTES / chunk_bytes;
        let mut out = Vec::with_capacity(per_main);
        for i in 0..per_main {
            let data = unsafe { NonNull::new_unchecked(region.ptr.as_ptr().add(i * chunk_bytes)) };
            let idx = ChunkIndex(self.slots.len() as u32);
            self.slots.push(ChunkSlot {
                data,
                bytes: chunk_bytes as u32,
                pool,
                tag: AtomicU8::new(ChunkTag::Free as u8),
            });
            out.push(idx);
        }
        out
    }

    pub fn chunk_count(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for ChunkArena {
    fn drop(&mut self) {
        for slab in self.slabs.drain(..) {
            unsafe { self.source.release(slab.ptr, slab.bytes) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carve_yields_whole_chunks_only() {
        let mut arena = ChunkArena::new(std::sync::Arc::new(NativeSource));
        let regions = arena.acquire_main(1, false).unwrap();
        let mut it = regions.into_iter();
        let chunks = arena.carve(it.next().unwrap(), PoolId::Block64);
        assert_eq!(chunks.len(), MAIN_CHUNK_BYTES / PoolId::Block64.chunk_bytes());
        for idx in &chunks {
            assert_eq!(arena.slot(*idx).pool(), PoolId::Block64);
            assert_eq!(arena.slot(*idx).tag(), ChunkTag::Free);
        }
    }

    #[test]
    fn halving_retry_falls_back_to_smaller_slabs() {
        struct Stingy {
            max: usize,
        }
        impl MemorySource for Stingy {
            fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
                if bytes > self.max {
                    return None;
                }
                NativeSource.allocate(bytes)
            }
            unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
                NativeSource.release(ptr, bytes)
            }
        }

        let mut arena = ChunkArena::new(std::sync::Arc::new(Stingy {
            max: 2 * MAIN_CHUNK_BYTES,
        }));
        let regions = arena.acquire_main(7, false).unwrap();
        assert_eq!(regions.len(), 7);
    }

    #[test]
    fn fixed_region_refuses_past_capacity() {
        let mut backing = vec![0u8; 2 * MAIN_CHUNK_BYTES];
        let base = NonNull::new(backing.as_mut_ptr()).unwrap();
        let region = unsafe { FixedRegion::new(base, backing.len()) };
        assert!(region.allocate(MAIN_CHUNK_BYTES).is_some());
        assert!(region.allocate(MAIN_CHUNK_BYTES).is_some());
        assert!(region.allocate(MAIN_CHUNK_BYTES).is_none());
    }
}
