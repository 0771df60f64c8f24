//! Size classes and request demand resolution.
//!
//! The allocator hands out whole chunks of a small fixed set of sizes. A
//! request names either a single class (all chunks serve the control plane)
//! or a combined class with separate control and data sizes. Demand for a
//! combined request is always admitted as one atomic unit.

use crate::PoolError;

/// Number of distinct chunk sizes (and therefore free lists per purpose and
/// tier).
pub const POOL_COUNT: usize = 3;

/// Bytes in one packet-sized chunk.
pub const PACKET_CHUNK_BYTES: usize = 2 * 1024;
/// Bytes in one 64-block-I/O chunk.
pub const BLOCK_64_CHUNK_BYTES: usize = 32 * 1024;
/// Bytes in one 1-block-I/O chunk.
pub const BLOCK_1_CHUNK_BYTES: usize = 1024;

/// Bytes in one main-pool carve unit. Slabs acquired from the memory source
/// are split into main chunks first; main chunks are carved into class-sized
/// chunks when the tier queues are populated.
pub const MAIN_CHUNK_BYTES: usize = 1024 * 1024;

/// One of the fixed chunk sizes, used to index the per-class free lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum PoolId {
    /// Packet-sized chunks (control structures, transport packets).
    Packet = 0,
    /// Chunks sized for a 64-block I/O.
    Block64 = 1,
    /// Chunks sized for a single-block I/O.
    Block1 = 2,
}

impl PoolId {
    pub const ALL: [PoolId; POOL_COUNT] = [PoolId::Packet, PoolId::Block64, PoolId::Block1];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn chunk_bytes(self) -> usize {
        match self {
            PoolId::Packet => PACKET_CHUNK_BYTES,
            PoolId::Block64 => BLOCK_64_CHUNK_BYTES,
            PoolId::Block1 => BLOCK_1_CHUNK_BYTES,
        }
    }
}

/// The size-class selector carried by a request.
///
/// `Single` requests draw every chunk from one control-purpose pool.
/// `Combined` requests carry separate control and data demand, possibly at
/// different sizes; only the packet and 64-block sizes participate in
/// combined classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkClass {
    Single(PoolId),
    Combined { control: PoolId, data: PoolId },
}

impl ChunkClass {
    /// Rejects class shapes the pool system does not provision.
    pub(crate) fn validate(self) -> Result<(), PoolError> {
        match self {
            ChunkClass::Single(_) => Ok(()),
            ChunkClass::Combined { control, data } => {
                if control == PoolId::Block1 || data == PoolId::Block1 {
                    Err(PoolError::InvalidClass)
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Packed per-request object counts: how many control chunks and how many
/// data chunks one admission must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectCounts {
    pub control: u16,
    pub data: u16,
}

impl ObjectCounts {
    /// Counts for a single-class request.
    pub fn single(control: u16) -> Self {
        ObjectCounts { control, data: 0 }
    }

    /// Counts for a combined-class request.
    pub fn split(control: u16, data: u16) -> Self {
        ObjectCounts { control, data }
    }
}

/// A request's demand resolved against its class: which pool each side draws
/// from and how many chunks it needs. Sides with zero demand are dropped so
/// the admission checks never see them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Demand {
    pub control: Option<(PoolId, u32)>,
    pub data: Option<(PoolId, u32)>,
}

impl Demand {
    pub fn resolve(class: ChunkClass, counts: ObjectCounts) -> Demand {
        match class {
            ChunkClass::Single(pool) => Demand {
                control: (counts.control > 0).then(|| (pool, u32::from(counts.control))),
                data: None,
            },
            ChunkClass::Combined { control, data } => Demand {
                control: (counts.control > 0).then(|| (control, u32::from(counts.control))),
                data: (counts.data > 0).then(|| (data, u32::from(counts.data))),
            },
        }
    }

    /// When the data tier was never provisioned, combined demand whose two
    /// sides name the same pool is checked against the control tier as one
    /// merged quantity. Returns that merged quantity, or `None` when the
    /// per-side checks already cover the request.
    pub fn merged(&self, data_provisioned: bool) -> Option<(PoolId, u32)> {
        if data_provisioned {
            return None;
        }
        match (self.control, self.data) {
            (Some((cp, c)), Some((dp, d))) if cp == dp => Some((cp, c + d)),
            _ => None,
        }
    }

    pub fn total(&self) -> u32 {
        self.control.map_or(0, |(_, n)| n) + self.data.map_or(0, |(_, n)| n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_block_1_is_rejected() {
        let class = ChunkClass::Combined {
            control: PoolId::Block1,
            data: PoolId::Packet,
        };
        assert!(class.validate().is_err());
    }

    #[test]
    fn zero_sides_are_dropped() {
        let d = Demand::resolve(
            ChunkClass::Combined {
                control: PoolId::Packet,
                data: PoolId::Block64,
            },
            ObjectCounts::split(3, 0),
        );
        assert_eq!(d.control, Some((PoolId::Packet, 3)));
        assert!(d.data.is_none());
    }

    #[test]
    fn merged_only_without_data_tier_and_same_pool() {
        let d = Demand::resolve(
            ChunkClass::Combined {
                control: PoolId::Block64,
                data: PoolId::Block64,
            },
            ObjectCounts::split(2, 5),
        );
        assert_eq!(d.merged(false), Some((PoolId::Block64, 7)));
        assert_eq!(d.merged(true), None);

        let mixed = Demand::resolve(
            ChunkClass::Combined {
                control: PoolId::Packet,
                data: PoolId::Block64,
            },
            ObjectCounts::split(2, 5),
        );
        assert_eq!(mixed.merged(false), None);
    }
}
