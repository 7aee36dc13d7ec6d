//! Per-slab reference-count array.
//!
//! Sentinel values: `0` free, `1..253` referenced, `254` saturated (pinned,
//! never decremented), `255` provisional (reserved, uncommitted). Preserve
//! these exactly -- existing disks depend on them.

use crate::error::{DepotError, Result};
use crate::types::ReferenceOperation;

pub const FREE: u8 = 0;
pub const SATURATED: u8 = 254;
pub const PROVISIONAL: u8 = 255;

#[derive(Debug, Clone)]
pub struct RefCounts {
    counts: Vec<u8>,
    free_count: u64,
}

impl RefCounts {
    pub fn new(data_blocks: u64) -> Self {
        Self {
            counts: vec![FREE; data_blocks as usize],
            free_count: data_blocks,
        }
    }

    /// Reconstruct from a persisted byte array, recomputing `free_count`
    /// (keeping the free-count invariant intact).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let free_count = bytes.iter().filter(|&&b| b == FREE).count() as u64;
        Self {
            counts: bytes,
            free_count,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.counts
    }

    pub fn data_blocks(&self) -> u64 {
        self.counts.len() as u64
    }

    pub fn free_count(&self) -> u64 {
        self.free_count
    }

    pub fn get(&self, index: u64) -> u8 {
        self.counts[index as usize]
    }

    /// `reserve_free`: pick a free counter and set it to `PROVISIONAL`.
    /// Returns the index reserved, or `NoSpace` if the slab is full.
    pub fn reserve_free(&mut self) -> Result<u64> {
        let index = self
            .counts
            .iter()
            .position(|&b| b == FREE)
            .ok_or(DepotError::NoSpace)?;
        self.counts[index] = PROVISIONAL;
        self.free_count -= 1;
        Ok(index as u64)
    }

    /// Apply a ref-count mutation to `index`, per the transition table of
    /// the ref-count transition table. The caller is responsible for appending the matching
    /// slab-journal entry before calling this.
    pub fn modify(&mut self, index: u64, op: ReferenceOperation) -> Result<()> {
        let current = self.counts[index as usize];
        let next = match (op, current) {
            (ReferenceOperation::BlockMapIncrement, _) => SATURATED,
            (ReferenceOperation::Increment, PROVISIONAL) => 1,
            (ReferenceOperation::Increment, SATURATED) => SATURATED,
            (ReferenceOperation::Increment, n) => n.saturating_add(1).min(SATURATED),
            (ReferenceOperation::Decrement, PROVISIONAL) => FREE,
            (ReferenceOperation::Decrement, FREE) => {
                return Err(DepotError::Corrupt(format!(
                    "decrement of already-free block at index {index}"
                )))
            }
            (ReferenceOperation::Decrement, SATURATED) => SATURATED,
            (ReferenceOperation::Decrement, n) => n - 1,
        };
        if next == FREE && current != FREE {
            self.free_count += 1;
        } else if next != FREE && current == FREE {
            self.free_count -= 1;
        }
        self.counts[index as usize] = next;
        Ok(())
    }

    /// Reserve a specific, known-free index (used by journal replay during
    /// scrubbing, where the index to mark provisional is dictated by the
    /// journal entry's PBN rather than chosen by the allocator).
    pub fn reserve_at(&mut self, index: u64) {
        if self.counts[index as usize] == FREE {
            self.counts[index as usize] = PROVISIONAL;
            self.free_count -= 1;
        }
    }

    /// Abort path: a reservation was never confirmed. Returns the block to
    /// `FREE` directly.
    pub fn release_provisional(&mut self, index: u64) {
        if self.counts[index as usize] == PROVISIONAL {
            self.counts[index as usize] = FREE;
            self.free_count += 1;
        }
    }

    /// Check that `free_count == |{ i : ref[i] == 0 }|`.
    #[cfg(any(test, feature = "self-check"))]
    pub fn check_free_count_invariant(&self) -> bool {
        let actual = self.counts.iter().filter(|&&b| b == FREE).count() as u64;
        actual == self.free_count
    }
}
