//! Property-test strategies for the slab depot: generated sequences of
//! allocator operations, used to drive invariant checks over many random
//! histories rather than a handful of hand-picked ones.

use proptest::prelude::*;

/// One step of a randomly generated allocate/release history. `Release`
/// references a previously allocated slot by index into the test's
/// bookkeeping vector (modulo its current length), so every generated
/// sequence is replayable without the strategy needing to know how many
/// allocations actually succeeded.
#[derive(Debug, Clone, Copy)]
pub enum DepotOp {
    Allocate,
    ReleaseUnconfirmed { pick: usize },
}

fn depot_op() -> impl Strategy<Value = DepotOp> {
    prop_oneof![
        3 => Just(DepotOp::Allocate),
        1 => (0usize..1000).prop_map(|pick| DepotOp::ReleaseUnconfirmed { pick }),
    ]
}

/// A bounded sequence of allocate/release operations to run against a fresh
/// depot. Weighted 3:1 toward `Allocate` so most histories actually reach
/// `NoSpace` at least once, which is where the interesting invariants live.
pub fn allocation_sequence(max_ops: usize) -> impl Strategy<Value = Vec<DepotOp>> {
    prop::collection::vec(depot_op(), 1..=max_ops)
}

/// Small depot shapes worth sweeping: zone count, slabs per zone, data
/// blocks per slab. Kept small since each case spins up real `tokio` tasks.
pub fn small_depot_shape() -> impl Strategy<Value = (u32, u64, u64)> {
    (1u32..=3, 1u64..=4, 2u64..=16)
}
