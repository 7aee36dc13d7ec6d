//! Depot and slab configuration.
//!
//! `SlabConfig` mirrors the persisted `slab_depot_state_2_0` super-block
//! component; `DepotConfig` adds runtime-only knobs (zone count, vio pool
//! size) that are never written to disk, kept as a separate struct so the
//! persisted fields stay a straightforward codec mirror.

use serde::{Deserialize, Serialize};

/// The persisted slab geometry, identical in field layout to the on-disk
/// `slab_config` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabConfig {
    pub slab_blocks: u64,
    pub data_blocks: u64,
    pub ref_count_blocks: u64,
    pub slab_journal_blocks: u64,
    pub slab_journal_flushing_threshold: u64,
    pub slab_journal_blocking_threshold: u64,
    pub slab_journal_scrubbing_threshold: u64,
}

impl SlabConfig {
    /// A reasonable small configuration used by tests and the scenarios in
    /// for small test fixtures (e.g. 8 data blocks per slab).
    pub fn for_data_blocks(data_blocks: u64) -> Self {
        let slab_journal_blocks = 16;
        Self {
            slab_blocks: data_blocks + 2,
            data_blocks,
            ref_count_blocks: 1,
            slab_journal_blocks,
            slab_journal_flushing_threshold: slab_journal_blocks * 3 / 4,
            slab_journal_blocking_threshold: slab_journal_blocks - 1,
            slab_journal_scrubbing_threshold: slab_journal_blocks / 2,
        }
    }
}

/// Default number of entries a `SlabJournal` ring buffer holds per block;
/// not itself persisted, derived from `slab_journal_blocks` at depot
/// construction time.
pub const JOURNAL_ENTRIES_PER_BLOCK: u64 = 256;

fn default_zone_count() -> u32 {
    1
}

fn default_vio_pool_size() -> usize {
    32
}

/// Runtime configuration for a `SlabDepot`: the persisted geometry plus the
/// zone fan-out and resource knobs that are decided fresh on every load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepotConfig {
    pub slab_config: SlabConfig,
    pub slab_count: u64,
    pub first_block: u64,
    #[serde(default = "default_zone_count")]
    pub zone_count: u32,
    #[serde(default = "default_vio_pool_size")]
    pub vio_pool_size: usize,
}

impl DepotConfig {
    pub fn last_block(&self) -> u64 {
        self.first_block + self.slab_count * self.slab_config.slab_blocks
    }
}
