//! Error types for the slab depot core.

use thiserror::Error;

/// Errors surfaced by the allocator core.
///
/// `NoSpace` and `Quiescent` are routine and are not logged as errors by
/// callers; `LockError`, `Corrupt`, and repeated `Io` failures are fatal and
/// force the owning allocator (and, via the read-only notifier, the whole
/// depot) into `AdminState::ReadOnly`.
#[derive(Error, Debug)]
pub enum DepotError {
    /// The allocator (or the whole zone) could not satisfy an allocation.
    #[error("no space available")]
    NoSpace,

    /// A PBN-lock invariant was violated: a newly-allocated PBN was found
    /// already held. This is corruption and forces read-only.
    #[error("lock invariant violated for pbn {0}")]
    LockError(u64),

    /// On-disk state failed validation.
    #[error("corrupt on-disk state: {0}")]
    Corrupt(String),

    /// An illegal admin-state transition was attempted.
    #[error("illegal admin transition: {from:?} -> {to:?}")]
    BadState {
        from: crate::admin::AdminState,
        to: crate::admin::AdminState,
    },

    /// The underlying metadata read/write failed.
    #[error("metadata io error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was issued to a draining or suspended allocator.
    #[error("allocator is quiescent")]
    Quiescent,

    /// Transient allocation failure; propagated without state change.
    #[error("out of memory")]
    OutOfMemory,

    /// The depot has entered read-only mode; every waiting journal write is
    /// completed with this error by the read-only notifier, and all further
    /// mutation is refused until a fresh load.
    #[error("depot is read-only")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, DepotError>;
