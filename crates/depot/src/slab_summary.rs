//! Per-zone slab summary.
//!
//! Physically one object, partitioned by zone; each zone's entries are
//! mutated only by its owning thread. Updates are
//! write-through but coalesced: a slab can be `update`d many times between
//! flushes and only the latest value is ever written.

use std::collections::BTreeMap;

use crate::codec::SlabSummaryEntry;
use crate::types::SlabNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabStatus {
    pub slab_number: SlabNumber,
    pub entry: SlabSummaryEntry,
}

pub struct SlabSummaryZone {
    zone: u32,
    committed: BTreeMap<SlabNumber, SlabSummaryEntry>,
    pending: BTreeMap<SlabNumber, SlabSummaryEntry>,
}

impl SlabSummaryZone {
    pub fn new(zone: u32) -> Self {
        Self {
            zone,
            committed: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn zone(&self) -> u32 {
        self.zone
    }

    /// Load a persisted entry directly into the committed map (used when
    /// decoding an on-disk summary block at depot load time).
    pub fn load_entry(&mut self, slab_number: SlabNumber, entry: SlabSummaryEntry) {
        self.committed.insert(slab_number, entry);
    }

    /// `update`: stage a new entry for `slab_number`. Multiple updates to
    /// the same slab before a `drain()` coalesce into the last one written.
    pub fn update(
        &mut self,
        slab_number: SlabNumber,
        tail_block_offset: u16,
        is_clean: bool,
        load_ref_counts: bool,
        free_blocks_hint: u8,
    ) {
        self.pending.insert(
            slab_number,
            SlabSummaryEntry {
                tail_block_offset,
                is_clean,
                load_ref_counts,
                free_blocks_hint,
            },
        );
    }

    /// `drain`: flush pending writes, making them visible to
    /// `read_all_statuses`. In this core, "I/O" is represented by the
    /// `MetadataIoDriver` seam (see `io.rs`); this method performs the
    /// in-memory half of that write-through.
    pub fn drain(&mut self) {
        for (slab, entry) in self.pending.drain() {
            self.committed.insert(slab, entry);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// `read_all_statuses`: used at load to sort slabs for scrubbing.
    pub fn read_all_statuses(&self) -> Vec<SlabStatus> {
        self.committed
            .iter()
            .map(|(&slab_number, &entry)| SlabStatus { slab_number, entry })
            .collect()
    }

    pub fn get(&self, slab_number: SlabNumber) -> Option<SlabSummaryEntry> {
        self.committed.get(&slab_number).copied()
    }
}
