//! Per-zone block allocator: the allocation path, the
//! priority function, and the "waiting for clean slab" list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::admin::AdminState;
use crate::error::{DepotError, Result};
use crate::pbn_lock::{AcquireOutcome, LockType, PbnLockPool};
use crate::priority_table::PriorityTable;
use crate::slab::Slab;
use crate::slab_scrubber::{ScrubPriority, SlabScrubber};
use crate::types::{Pbn, ReferenceOperation, SequenceNumber, SlabNumber, SlabState, ZoneNumber};

/// `1 + floor(log2((data_blocks*3)/4))`, the priority assigned to a slab
/// that has never been opened.
pub fn unopened_slab_priority(data_blocks: u64) -> usize {
    let threshold = data_blocks * 3 / 4;
    1 + log2_floor(threshold.max(1))
}

fn log2_floor(n: u64) -> usize {
    if n == 0 {
        0
    } else {
        63 - n.leading_zeros() as usize
    }
}

/// The priority score a slab contributes to the bucketed selection table.
pub fn priority(free_blocks: u64, data_blocks: u64, ever_opened: bool, journal_blank: bool) -> usize {
    if free_blocks == 0 {
        return 0;
    }
    let unopened = unopened_slab_priority(data_blocks);
    if !ever_opened && journal_blank {
        return unopened;
    }
    let p = 1 + log2_floor(free_blocks);
    if p >= unopened {
        p + 1
    } else {
        p
    }
}

/// A write parked because every zone returned `NoSpace`. The zone walk and
/// wakeup protocol live on `BlockAllocator`; what a waiter actually *does*
/// on wakeup (retry the walk) is the caller's concern, modeled here as an
/// opaque token so the allocator core has no dependency on the write-path
/// type the outer dm layer uses.
pub struct Waiter {
    pub token: u64,
}

pub struct AllocatorStats {
    pub allocated_blocks: AtomicI64,
    pub allocations: AtomicU64,
    pub no_space_count: AtomicU64,
}

impl Default for AllocatorStats {
    fn default() -> Self {
        Self {
            allocated_blocks: AtomicI64::new(0),
            allocations: AtomicU64::new(0),
            no_space_count: AtomicU64::new(0),
        }
    }
}

pub struct BlockAllocator {
    pub zone_number: ZoneNumber,
    slabs: Vec<Slab>,
    /// Index into `slabs` for slab numbers owned by this zone, keyed by
    /// `slab_number / zone_count` (slabs are dense per zone).
    open_slab: Option<usize>,
    priority_queue: PriorityTable,
    pub pbn_locks: PbnLockPool,
    pub scrubber: SlabScrubber,
    pub admin_state: AdminState,
    waiting_for_clean_slab: VecDeque<Waiter>,
    pub stats: AllocatorStats,
}

impl BlockAllocator {
    pub fn new(zone_number: ZoneNumber, slabs: Vec<Slab>, max_priority: usize) -> Self {
        let mut queue = PriorityTable::new(max_priority);
        for (i, slab) in slabs.iter().enumerate() {
            let p = priority(
                slab.free_blocks(),
                slab.data_blocks(),
                slab.ever_opened,
                slab.journal_is_blank(),
            );
            if p > 0 {
                queue.enqueue(i as SlabNumber, p);
            }
        }
        Self {
            zone_number,
            slabs,
            open_slab: None,
            priority_queue: queue,
            pbn_locks: PbnLockPool::new(),
            scrubber: SlabScrubber::new(),
            admin_state: AdminState::Normal,
            waiting_for_clean_slab: VecDeque::new(),
            stats: AllocatorStats::default(),
        }
    }

    pub fn slab(&self, index: usize) -> &Slab {
        &self.slabs[index]
    }

    pub fn slab_mut(&mut self, index: usize) -> &mut Slab {
        &mut self.slabs[index]
    }

    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    fn reprioritize(&mut self, index: usize) {
        let slab = &self.slabs[index];
        let p = priority(
            slab.free_blocks(),
            slab.data_blocks(),
            slab.ever_opened,
            slab.journal_is_blank(),
        );
        if p > 0 {
            self.priority_queue.enqueue(index as SlabNumber, p);
        }
    }

    /// `allocate_block`: find the best available slab, lock a free block
    /// inside it, and hand back the pbn.
    pub fn allocate_block(&mut self) -> Result<Pbn> {
        if self.admin_state.is_quiescent() {
            return Err(DepotError::Quiescent);
        }

        if let Some(open_index) = self.open_slab {
            match self.slabs[open_index].ref_counts.reserve_free() {
                Ok(local_index) => {
                    let pbn = self.slabs[open_index].pbn_for_index(local_index);
                    self.slabs[open_index].ever_opened = true;
                    self.pbn_locks.assign_new_write_lock(pbn)?;
                    self.pbn_locks.assign_provisional(pbn);
                    self.stats.allocated_blocks.fetch_add(1, Ordering::Relaxed);
                    self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                    return Ok(pbn);
                }
                Err(DepotError::NoSpace) => {
                    // step 2: re-enqueue at the new (lower) priority
                    self.reprioritize(open_index);
                    self.open_slab = None;
                }
                Err(other) => return Err(other),
            }
        }

        // step 3: dequeue the highest-priority slab and make it open, skipping
        // any slab still waiting on scrub replay -- it was pulled off the
        // allocation path by `apply_load_classification` or a crash-recovery
        // journal, and only `queue_slab` (on scrub completion) puts it back.
        let next = loop {
            match self.priority_queue.dequeue_highest() {
                Some(candidate) if self.slabs[candidate as usize].state == SlabState::Dirty => {
                    continue;
                }
                Some(candidate) => break Some(candidate),
                None => break None,
            }
        };
        let Some(next) = next else {
            self.stats.no_space_count.fetch_add(1, Ordering::Relaxed);
            return Err(DepotError::NoSpace);
        };
        self.open_slab = Some(next as usize);

        // step 4: retry once on the new open slab
        let open_index = next as usize;
        match self.slabs[open_index].ref_counts.reserve_free() {
            Ok(local_index) => {
                let pbn = self.slabs[open_index].pbn_for_index(local_index);
                self.slabs[open_index].ever_opened = true;
                self.pbn_locks.assign_new_write_lock(pbn)?;
                self.pbn_locks.assign_provisional(pbn);
                self.stats.allocated_blocks.fetch_add(1, Ordering::Relaxed);
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                Ok(pbn)
            }
            Err(DepotError::NoSpace) => {
                self.stats.no_space_count.fetch_add(1, Ordering::Relaxed);
                Err(DepotError::NoSpace)
            }
            Err(other) => Err(other),
        }
    }

    /// `release_allocation_lock` for the never-confirmed case: roll the
    /// reservation back to `FREE` and release the lock.
    pub fn release_unconfirmed(&mut self, pbn: Pbn) -> Result<()> {
        let had_provisional = self.pbn_locks.release(pbn);
        if had_provisional {
            if let Some((index, local)) = self.locate(pbn) {
                self.slabs[index].ref_counts.release_provisional(local);
                self.reprioritize(index);
                self.stats.allocated_blocks.fetch_sub(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// The normal write-path commit: append the mutation to the owning
    /// slab's journal *before* updating the in-memory ref-count, clear the PBN lock's provisional bit, and
    /// return the journal sequence number plus the slab's post-commit free
    /// count so the caller can update the slab summary.
    pub fn confirm_allocation(
        &mut self,
        pbn: Pbn,
        op: ReferenceOperation,
        recovery_block: u64,
    ) -> Result<(SlabNumber, SequenceNumber, u64)> {
        let (index, local) = self
            .locate(pbn)
            .ok_or_else(|| DepotError::Corrupt(format!("confirm of unknown pbn {pbn}")))?;
        let sequence = self.slabs[index].journal.append(op, pbn, recovery_block)?;
        self.slabs[index].ref_counts.modify(local, op)?;
        self.pbn_locks.clear_provisional(pbn);
        self.slabs[index].state = crate::types::SlabState::Dirty;
        Ok((
            self.slabs[index].slab_number,
            sequence,
            self.slabs[index].free_blocks(),
        ))
    }

    fn locate(&self, pbn: Pbn) -> Option<(usize, u64)> {
        self.slabs
            .iter()
            .enumerate()
            .find_map(|(i, s)| s.index_for_pbn(pbn).map(|local| (i, local)))
    }

    pub fn acquire_read_lock(&mut self, pbn: Pbn) -> AcquireOutcome {
        self.pbn_locks.attempt_acquire(pbn, LockType::Read)
    }

    /// Park a waiter until a slab becomes clean via scrubbing
    /// Best-effort: a second full zone walk after scrubbing may still
    /// find nothing, in which case the waiter stays parked.
    pub fn enqueue_waiter_for_clean_slab(&mut self, waiter: Waiter) {
        self.waiting_for_clean_slab.push_back(waiter);
    }

    pub fn wake_one_waiter(&mut self) -> Option<Waiter> {
        self.waiting_for_clean_slab.pop_front()
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiting_for_clean_slab.is_empty()
    }

    /// Re-admit a scrubbed slab for allocation (`SlabScrubber::scrub_next`'s
    /// `queue_slab` callback).
    pub fn queue_slab(&mut self, index: usize) {
        self.reprioritize(index);
    }

    /// Apply a load-time classification derived from the slab summary:
    /// `dirty` slabs are marked for scrub replay and removed from the
    /// allocation path until `scrub_one` clears them; `clean` slabs
    /// (including ones the summary never recorded) are admitted.
    pub fn apply_load_classification(&mut self, dirty: &[usize], clean: &[usize]) {
        for &index in dirty {
            self.slabs[index].state = SlabState::Dirty;
            self.scrubber.enqueue(index as SlabNumber, ScrubPriority::High);
        }
        for &index in clean {
            self.slabs[index].state = SlabState::Clean;
            self.queue_slab(index);
        }
    }

    pub fn allocated_blocks(&self) -> i64 {
        self.stats.allocated_blocks.load(Ordering::Relaxed)
    }

    /// `use_new_slabs`: append freshly-grown slabs to this zone's array and
    /// admit each for allocation, preserving every pre-existing slab's state
    /// and counters untouched.
    pub fn append_slabs(&mut self, new_slabs: Vec<Slab>) {
        let start = self.slabs.len();
        self.slabs.extend(new_slabs);
        for index in start..self.slabs.len() {
            self.reprioritize(index);
        }
    }

    /// Scrub the next dirty slab, if any, replaying its journal into its
    /// ref-counts and re-admitting it for allocation. Split into disjoint
    /// field borrows (`scrubber`, `slabs`) so the replay closure never needs
    /// to capture all of `self`.
    pub fn scrub_one(&mut self) -> Result<Option<SlabNumber>> {
        let scrubber = &mut self.scrubber;
        let slabs = &mut self.slabs;
        let scrubbed = scrubber.scrub_next(|slab_number| {
            let slab = &mut slabs[slab_number as usize];
            crate::slab_scrubber::replay_journal_into_refcounts(slab)?;
            slab.state = crate::types::SlabState::Clean;
            Ok(())
        })?;
        if let Some(slab_number) = scrubbed {
            self.queue_slab(slab_number as usize);
        }
        Ok(scrubbed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_is_zero_when_full() {
        assert_eq!(priority(0, 100, true, false), 0);
    }

    #[test]
    fn unopened_slab_gets_unopened_priority() {
        let data_blocks = 100;
        let p = priority(data_blocks, data_blocks, false, true);
        assert_eq!(p, unopened_slab_priority(data_blocks));
    }

    #[test]
    fn previously_opened_slabs_preferred_until_three_quarters_full() {
        let data_blocks = 100;
        let unopened_p = unopened_slab_priority(data_blocks);
        // Free blocks near full data_blocks on a previously opened slab:
        // priority should be unopened_p + 1 (strictly preferred).
        let opened_p = priority(data_blocks, data_blocks, true, false);
        assert_eq!(opened_p, unopened_p + 1);
        assert!(opened_p > unopened_p);
    }

    fn new_test_allocator(num_slabs: u64, data_blocks: u64) -> BlockAllocator {
        let slabs: Vec<Slab> = (0..num_slabs)
            .map(|i| Slab::new(i, 0, i * data_blocks, data_blocks, 16))
            .collect();
        BlockAllocator::new(0, slabs, 32)
    }

    #[test]
    fn allocates_until_zone_exhausted_then_no_space() {
        let mut alloc = new_test_allocator(2, 4);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..8 {
            let pbn = alloc.allocate_block().unwrap();
            assert!(seen.insert(pbn), "pbn {pbn} allocated twice");
        }
        assert!(matches!(alloc.allocate_block(), Err(DepotError::NoSpace)));
    }

    #[test]
    fn abort_restores_allocated_blocks_counter_and_pbn_is_reused() {
        let mut alloc = new_test_allocator(1, 4);
        let before = alloc.allocated_blocks();
        let pbn = alloc.allocate_block().unwrap();
        alloc.release_unconfirmed(pbn).unwrap();
        assert_eq!(alloc.allocated_blocks(), before);
        let pbn2 = alloc.allocate_block().unwrap();
        assert_eq!(pbn, pbn2);
    }

    #[test]
    fn confirm_allocation_journals_then_finalizes_the_ref_count() {
        let mut alloc = new_test_allocator(1, 4);
        let pbn = alloc.allocate_block().unwrap();
        let (slab_number, sequence, free_blocks) = alloc
            .confirm_allocation(pbn, ReferenceOperation::Increment, 0)
            .unwrap();
        assert_eq!(slab_number, 0);
        assert_eq!(sequence, 0);
        assert_eq!(free_blocks, 3);
        let (index, local) = alloc.locate(pbn).unwrap();
        assert_eq!(alloc.slab(index).ref_counts.get(local), 1);
        assert!(!alloc.slab(index).journal_is_blank());
    }

    #[test]
    fn full_slab_never_opened_returns_no_space_without_opening() {
        let mut alloc = new_test_allocator(1, 1);
        // drain the only block
        let _ = alloc.allocate_block().unwrap();
        assert!(alloc.open_slab.is_some());
        assert!(matches!(alloc.allocate_block(), Err(DepotError::NoSpace)));
    }

    #[test]
    fn load_classification_skips_dirty_slabs_until_scrubbed() {
        let mut alloc = new_test_allocator(2, 4);
        alloc.apply_load_classification(&[0], &[1]);
        assert_eq!(alloc.slab(0).state, crate::types::SlabState::Dirty);
        assert_eq!(alloc.slab(1).state, crate::types::SlabState::Clean);

        // Slab 0 is dirty and must not be handed out for allocation even
        // though it has free blocks; only slab 1 is eligible.
        for _ in 0..4 {
            let pbn = alloc.allocate_block().unwrap();
            let (index, _) = alloc.locate(pbn).unwrap();
            assert_eq!(index, 1);
        }
        assert!(matches!(alloc.allocate_block(), Err(DepotError::NoSpace)));

        // Scrubbing slab 0 replays its (empty) journal, marks it clean, and
        // re-admits it for allocation.
        let scrubbed = alloc.scrub_one().unwrap();
        assert_eq!(scrubbed, Some(0));
        let pbn = alloc.allocate_block().unwrap();
        let (index, _) = alloc.locate(pbn).unwrap();
        assert_eq!(index, 0);
    }
}
