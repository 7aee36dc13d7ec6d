//! Core index types shared across the depot.

use serde::{Deserialize, Serialize};

/// Physical block number: a 64-bit index into the underlying device.
/// `Pbn::ZERO_BLOCK` names the all-zero data pattern and is never allocated
/// or freed.
pub type Pbn = u64;

/// PBN 0 is the reserved zero block.
pub const ZERO_BLOCK: Pbn = 0;

pub fn is_zero_block(pbn: Pbn) -> bool {
    pbn == ZERO_BLOCK
}

/// Index of a slab within the depot's dense slab array.
pub type SlabNumber = u64;

/// Index of a physical zone; slab `S` belongs to zone `S mod zone_count`.
pub type ZoneNumber = u32;

/// A recovery-journal sequence number.
pub type SequenceNumber = u64;

/// A slab's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlabState {
    /// Not yet examined at load time.
    Unrecovered,
    /// Summary says clean; ref-counts are trusted without replay.
    Clean,
    /// Currently the allocator's `open_slab`.
    Open,
    /// Has uncommitted journal entries that must be scrubbed.
    Dirty,
    /// Being brought back from suspension.
    Resuming,
    /// Drained and idle.
    Quiescent,
}

/// A single ref-count mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceOperation {
    Increment,
    Decrement,
    BlockMapIncrement,
}

pub fn zone_of(slab_number: SlabNumber, zone_count: ZoneNumber) -> ZoneNumber {
    (slab_number % zone_count as u64) as ZoneNumber
}
