//! Background journal replayer.
//!
//! Two priority queues: high (blocks `prepare_to_allocate`) and normal.
//! Runs on the same zone thread as allocation, between allocation requests,
//! never blocking the data path.

use std::collections::VecDeque;

use crate::error::{DepotError, Result};
use crate::types::{ReferenceOperation, SlabNumber};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubPriority {
    High,
    Normal,
}

pub struct SlabScrubber {
    high: VecDeque<SlabNumber>,
    normal: VecDeque<SlabNumber>,
}

impl Default for SlabScrubber {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabScrubber {
    pub fn new() -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, slab_number: SlabNumber, priority: ScrubPriority) {
        match priority {
            ScrubPriority::High => self.high.push_back(slab_number),
            ScrubPriority::Normal => self.normal.push_back(slab_number),
        }
    }

    pub fn high_priority_queue_empty(&self) -> bool {
        self.high.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty()
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    fn dequeue_next(&mut self) -> Option<SlabNumber> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }

    /// `scrub_next`: pick the next slab, replay its journal against its
    /// ref-counts via `apply`, then report it clean. `apply` is supplied by
    /// the caller (the owning `BlockAllocator`/`Slab`) because the scrubber
    /// itself holds no slab state -- it is purely the priority-ordering
    /// policy, under the same zone-ownership rule as everything else here.
    ///
    /// Returns the slab number that was scrubbed, or `None` if both queues
    /// are empty. Propagates `ReadOnly`-worthy corruption from `apply` as
    /// `DepotError::Corrupt`.
    pub fn scrub_next(
        &mut self,
        mut apply: impl FnMut(SlabNumber) -> Result<()>,
    ) -> Result<Option<SlabNumber>> {
        let Some(slab_number) = self.dequeue_next() else {
            return Ok(None);
        };
        apply(slab_number)?;
        Ok(Some(slab_number))
    }
}

/// Replay a slab's journal entries against its ref-counts, skipping
/// whatever the summary says is already reflected. Free function rather
/// than a `SlabScrubber` method because it needs joint access to a
/// `Slab`'s journal and ref-counts, which `SlabScrubber` does not own.
pub fn replay_journal_into_refcounts(slab: &mut crate::slab::Slab) -> Result<()> {
    let entries: Vec<_> = {
        let mut collected = Vec::new();
        slab.journal.replay(|e| collected.push(*e));
        collected
    };
    for entry in entries {
        let Some(index) = slab.index_for_pbn(entry.pbn) else {
            return Err(DepotError::Corrupt(format!(
                "journal entry references pbn {} outside slab",
                entry.pbn
            )));
        };
        // Replay targets blocks already reserved at the bare minimum;
        // corruption (e.g. decrementing an untouched free block) surfaces
        // as Corrupt rather than panicking, forcing the depot read-only
        // instead of silently miscounting.
        match entry.op {
            ReferenceOperation::Increment | ReferenceOperation::BlockMapIncrement => {
                if slab.ref_counts.get(index) == crate::refcounts::FREE {
                    // first touch during replay: treat as a fresh reservation
                    slab.ref_counts.reserve_at(index);
                }
                slab.ref_counts.modify(index, entry.op)?;
            }
            ReferenceOperation::Decrement => {
                slab.ref_counts.modify(index, entry.op)?;
            }
        }
    }
    Ok(())
}
