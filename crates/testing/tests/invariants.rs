//! Property-based invariant checks driven by `depot_testing::strategies`.
//! Each case builds a fresh depot, replays a generated operation sequence,
//! and checks invariants that must hold after every step.

use std::sync::Arc;

use depot_core::config::{DepotConfig, SlabConfig};
use depot_core::io::{InMemoryIoDriver, MetadataIoDriver};
use depot_core::types::is_zero_block;
use depot_core::{DepotError, SlabDepot};
use depot_testing::strategies::{allocation_sequence, DepotOp};
use proptest::prelude::*;

fn config(zone_count: u32, slabs_per_zone: u64, data_blocks: u64) -> DepotConfig {
    DepotConfig {
        slab_config: SlabConfig::for_data_blocks(data_blocks),
        slab_count: zone_count as u64 * slabs_per_zone,
        first_block: 1,
        zone_count,
        vio_pool_size: 8,
    }
}

/// Every pbn `allocate` returns is a real data-block pbn, and pbn 0 is
/// never handed out (boundary behavior).
fn check_returned_pbn_is_a_real_data_block(pbn: u64, depot: &mut SlabDepot) {
    assert!(!is_zero_block(pbn));
    assert!(depot.get_slab(pbn).is_some());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Replaying a generated allocate/release history never lets
    /// `allocated_blocks` run negative or exceed total capacity, and every
    /// release-without-confirm is a precise rollback.
    #[test]
    fn allocate_release_history_keeps_counters_in_range(ops in allocation_sequence(40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let io: Arc<dyn MetadataIoDriver> = Arc::new(InMemoryIoDriver::new(4096));
            let mut depot = SlabDepot::new(config(2, 3, 8), io).unwrap();
            let capacity = depot.slab_count() as i64 * 8;

            let mut outstanding: Vec<(u64, u32)> = Vec::new();
            for op in ops {
                match op {
                    DepotOp::Allocate => match depot.allocate().await {
                        Ok((pbn, zone)) => {
                            check_returned_pbn_is_a_real_data_block(pbn, &mut depot);
                            outstanding.push((pbn, zone));
                        }
                        Err(DepotError::NoSpace) => {}
                        Err(other) => panic!("unexpected error: {other:?}"),
                    },
                    DepotOp::ReleaseUnconfirmed { pick } => {
                        if !outstanding.is_empty() {
                            let (pbn, zone) = outstanding.remove(pick % outstanding.len());
                            depot.release_allocation_lock(zone, pbn).await.unwrap();
                        }
                    }
                }
                let allocated = depot.allocated_blocks().await;
                prop_assert!(allocated >= 0);
                prop_assert!(allocated <= capacity);
            }
            prop_assert_eq!(depot.allocated_blocks().await, outstanding.len() as i64);
            depot.shutdown().await;
            Ok(())
        })?;
    }
}

/// Boundary behavior: pbn 0 is always rejected by `get_slab`.
#[tokio::test]
async fn zero_block_is_never_a_data_slab() {
    let io: Arc<dyn MetadataIoDriver> = Arc::new(InMemoryIoDriver::new(4096));
    let mut depot = SlabDepot::new(config(1, 1, 4), io).unwrap();
    assert_eq!(depot.get_slab(0), None);
    assert!(!depot.is_read_only());
    depot.shutdown().await;
}

/// Boundary behavior: an allocator with every slab full returns `NoSpace`
/// without ever needing to open a fresh slab (mirrored here at the depot
/// level across every zone).
#[tokio::test]
async fn full_depot_returns_no_space_after_one_round() {
    let io: Arc<dyn MetadataIoDriver> = Arc::new(InMemoryIoDriver::new(4096));
    let mut depot = SlabDepot::new(config(2, 1, 2), io).unwrap();
    for _ in 0..4 {
        depot.allocate().await.unwrap();
    }
    assert!(matches!(depot.allocate().await, Err(DepotError::NoSpace)));
    depot.shutdown().await;
}
