//! Shared error type and property-test strategies for the slab depot suite.
//! Integration tests live under `tests/`; this crate only holds what they
//! share.

pub mod strategies;

#[derive(thiserror::Error, Debug)]
pub enum TestError {
    #[error("depot operation failed: {0}")]
    Depot(#[from] depot_core::DepotError),

    #[error("invariant violated: {0}")]
    InvariantViolated(String),
}

pub type TestResult<T> = Result<T, TestError>;
