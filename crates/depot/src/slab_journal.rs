//! Per-slab circular write-ahead log.
//!
//! The in-memory log is a fixed-capacity ring, sized to
//! `slab_journal_blocks * JOURNAL_ENTRIES_PER_BLOCK`; once full, appends
//! fail with `NoSpace` until the tail commits and entries are released.

use std::collections::VecDeque;

use crate::codec::SlabJournalEntry;
use crate::config::JOURNAL_ENTRIES_PER_BLOCK;
use crate::error::{DepotError, Result};
use crate::types::{Pbn, ReferenceOperation, SequenceNumber};

/// One logical entry plus the sequence number it was appended at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalRecord {
    pub sequence: SequenceNumber,
    pub entry: SlabJournalEntry,
}

/// Lifecycle of the current tail block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    Clean,
    Dirty,
    Committed,
}

pub struct SlabJournal {
    capacity: u64,
    ring: VecDeque<JournalRecord>,
    head: SequenceNumber,
    tail: SequenceNumber,
    tail_state: TailState,
    /// Recovery-journal block number of the oldest un-committed entry, if
    /// any; this is the lock the slab journal holds against the recovery
    /// journal.
    locked_recovery_block: Option<u64>,
    in_flight_write: bool,
}

impl SlabJournal {
    pub fn new(slab_journal_blocks: u64) -> Self {
        Self {
            capacity: slab_journal_blocks * JOURNAL_ENTRIES_PER_BLOCK,
            ring: VecDeque::new(),
            head: 0,
            tail: 0,
            tail_state: TailState::Clean,
            locked_recovery_block: None,
            in_flight_write: false,
        }
    }

    pub fn head(&self) -> SequenceNumber {
        self.head
    }

    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    pub fn is_full(&self) -> bool {
        self.tail - self.head >= self.capacity
    }

    pub fn locked_recovery_block(&self) -> Option<u64> {
        self.locked_recovery_block
    }

    /// `append`: add a mutation entry, parking (returning `NoSpace`, in this
    /// synchronous core) if the journal is full -- the caller is expected to
    /// park the operation on a waiter queue drained when the tail flushes.
    pub fn append(&mut self, op: ReferenceOperation, pbn: Pbn, recovery_block: u64) -> Result<SequenceNumber> {
        if self.is_full() {
            return Err(DepotError::NoSpace);
        }
        let sequence = self.tail;
        self.ring.push_back(JournalRecord {
            sequence,
            entry: SlabJournalEntry {
                op,
                pbn,
                recovery_sequence: recovery_block,
            },
        });
        self.tail += 1;
        self.tail_state = TailState::Dirty;
        if self.locked_recovery_block.is_none() {
            self.locked_recovery_block = Some(recovery_block);
        }
        // invariant (iv): tail - head never exceeds the journal capacity
        debug_assert!(self.tail - self.head <= self.capacity);
        Ok(sequence)
    }

    /// `flush_tail`: mark the current tail block as issued for write. At
    /// most one tail write is ever in flight.
    pub fn flush_tail(&mut self) -> Result<()> {
        if self.in_flight_write {
            return Ok(()); // already flushing; idempotent from the caller's view
        }
        if self.tail_state == TailState::Dirty {
            self.in_flight_write = true;
        }
        Ok(())
    }

    /// Called when the tail write I/O completes.
    pub fn tail_write_completed(&mut self) {
        self.in_flight_write = false;
        self.tail_state = TailState::Committed;
    }

    /// `commit_dirty_tail_blocks_locking_recovery_block`: the recovery
    /// journal wants to advance past `recovery_block`. Any dirty tail whose
    /// oldest entry references it (or an older block) must flush first.
    pub fn commit_dirty_tail_blocks_locking_recovery_block(
        &mut self,
        recovery_block: u64,
    ) -> Result<()> {
        if let Some(locked) = self.locked_recovery_block {
            if locked <= recovery_block {
                self.flush_tail()?;
            }
        }
        Ok(())
    }

    /// Release the recovery-journal lock once all entries up to `sequence`
    /// have been reflected in ref-counts and the summary. Enforces
    /// invariant (i): never reports released while entries remain
    /// un-committed for that sequence.
    pub fn release_up_to(&mut self, sequence: SequenceNumber) -> Result<()> {
        while let Some(front) = self.ring.front() {
            if front.sequence >= sequence {
                break;
            }
            self.ring.pop_front();
            self.head += 1;
        }
        if self.ring.is_empty() {
            self.locked_recovery_block = None;
        } else {
            self.locked_recovery_block = Some(self.ring.front().unwrap().entry.recovery_sequence);
        }
        Ok(())
    }

    /// `replay`: used by the scrubber to walk un-reflected entries in order.
    pub fn replay(&self, mut apply_fn: impl FnMut(&SlabJournalEntry)) {
        for record in &self.ring {
            apply_fn(&record.entry);
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.ring.is_empty()
    }

    pub fn is_blank(&self) -> bool {
        self.ring.is_empty() && self.tail == 0
    }
}
