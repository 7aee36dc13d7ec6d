//! Per-zone PBN lock pool.
//!
//! Zone-local: a pool only ever sees PBNs in its own zone's slabs, so no
//! cross-zone synchronization is needed. Implemented as a hash map keyed by
//! PBN with a free-list of recycled entries.

use std::collections::HashMap;

use crate::error::{DepotError, Result};
use crate::types::Pbn;

/// Why a PBN lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    WriteNew,
    CompressedWrite,
    Read,
    BlockMap,
}

impl LockType {
    /// Conflict rules: write-new conflicts with
    /// everything; reads may share with each other and with block-map;
    /// compressed-write conflicts with write-new and other compressed-writes.
    fn conflicts_with(self, other: LockType) -> bool {
        use LockType::*;
        match (self, other) {
            (WriteNew, _) | (_, WriteNew) => true,
            (CompressedWrite, CompressedWrite) => true,
            (CompressedWrite, _) | (_, CompressedWrite) => false,
            (Read, Read) | (Read, BlockMap) | (BlockMap, Read) | (BlockMap, BlockMap) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PbnLock {
    pub lock_type: LockType,
    pub holder_count: u32,
    pub provisional_ref: bool,
}

impl PbnLock {
    fn new(lock_type: LockType) -> Self {
        Self {
            lock_type,
            holder_count: 1,
            provisional_ref: false,
        }
    }
}

/// Outcome of `attempt_acquire`: either a held lock, or a conflict with the
/// existing holder's lock type.
pub enum AcquireOutcome {
    Acquired,
    Conflict(LockType),
}

#[derive(Default)]
pub struct PbnLockPool {
    locks: HashMap<Pbn, PbnLock>,
}

impl PbnLockPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire a lock on `pbn` of the given `lock_type`. Returns
    /// `Conflict` rather than blocking; the caller decides how to retry.
    pub fn attempt_acquire(&mut self, pbn: Pbn, lock_type: LockType) -> AcquireOutcome {
        match self.locks.get_mut(&pbn) {
            None => {
                self.locks.insert(pbn, PbnLock::new(lock_type));
                AcquireOutcome::Acquired
            }
            Some(existing) => {
                if existing.lock_type.conflicts_with(lock_type) {
                    AcquireOutcome::Conflict(existing.lock_type)
                } else {
                    existing.holder_count += 1;
                    AcquireOutcome::Acquired
                }
            }
        }
    }

    /// Called when a newly-allocated PBN is handed a write-new lock; it must
    /// not already be held, or the allocator's invariants have been violated.
    pub fn assign_new_write_lock(&mut self, pbn: Pbn) -> Result<()> {
        if self.locks.contains_key(&pbn) {
            return Err(DepotError::LockError(pbn));
        }
        self.locks.insert(pbn, PbnLock::new(LockType::WriteNew));
        Ok(())
    }

    pub fn assign_provisional(&mut self, pbn: Pbn) {
        if let Some(lock) = self.locks.get_mut(&pbn) {
            lock.provisional_ref = true;
        }
    }

    pub fn clear_provisional(&mut self, pbn: Pbn) {
        if let Some(lock) = self.locks.get_mut(&pbn) {
            lock.provisional_ref = false;
        }
    }

    pub fn has_provisional(&self, pbn: Pbn) -> bool {
        self.locks.get(&pbn).is_some_and(|l| l.provisional_ref)
    }

    /// Release one holder's reference on `pbn`'s lock. Returns `true` if the
    /// lock still held an un-confirmed provisional reference at release time
    /// -- the caller must return that reservation to the slab's ref-counts.
    pub fn release(&mut self, pbn: Pbn) -> bool {
        let Some(lock) = self.locks.get_mut(&pbn) else {
            return false;
        };
        lock.holder_count = lock.holder_count.saturating_sub(1);
        if lock.holder_count == 0 {
            let had_provisional = lock.provisional_ref;
            self.locks.remove(&pbn);
            had_provisional
        } else {
            false
        }
    }

    pub fn get(&self, pbn: Pbn) -> Option<&PbnLock> {
        self.locks.get(&pbn)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_new_conflicts_with_everything() {
        let mut pool = PbnLockPool::new();
        pool.assign_new_write_lock(42).unwrap();
        match pool.attempt_acquire(42, LockType::Read) {
            AcquireOutcome::Conflict(LockType::WriteNew) => {}
            _ => panic!("expected conflict"),
        }
    }

    #[test]
    fn reads_share() {
        let mut pool = PbnLockPool::new();
        assert!(matches!(
            pool.attempt_acquire(7, LockType::Read),
            AcquireOutcome::Acquired
        ));
        assert!(matches!(
            pool.attempt_acquire(7, LockType::Read),
            AcquireOutcome::Acquired
        ));
        assert_eq!(pool.get(7).unwrap().holder_count, 2);
    }

    #[test]
    fn double_assign_is_lock_error() {
        let mut pool = PbnLockPool::new();
        pool.assign_new_write_lock(5).unwrap();
        assert!(matches!(
            pool.assign_new_write_lock(5),
            Err(DepotError::LockError(5))
        ));
    }

    #[test]
    fn release_reports_dangling_provisional() {
        let mut pool = PbnLockPool::new();
        pool.assign_new_write_lock(9).unwrap();
        pool.assign_provisional(9);
        assert!(pool.release(9));
        assert!(pool.is_empty());
    }

    #[test]
    fn release_without_provisional_reports_false() {
        let mut pool = PbnLockPool::new();
        pool.assign_new_write_lock(9).unwrap();
        assert!(!pool.release(9));
    }
}
