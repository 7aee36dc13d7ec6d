//! Stateless per-write zone selector.

use std::sync::atomic::{AtomicU32, Ordering};

pub struct Selector {
    zone_count: u32,
    /// Per-logical-zone starting offset, so concurrent logical zones do not
    /// all start their round-robin walk at physical zone 0.
    next_offset: AtomicU32,
}

impl Selector {
    pub fn new(zone_count: u32) -> Self {
        Self {
            zone_count,
            next_offset: AtomicU32::new(0),
        }
    }

    /// `next_zone`: rotate round-robin across `Z` zones.
    pub fn next_zone(&self) -> u32 {
        let offset = self.next_offset.fetch_add(1, Ordering::Relaxed);
        offset % self.zone_count
    }

    pub fn zone_count(&self) -> u32 {
        self.zone_count
    }
}
