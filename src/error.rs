//! Error taxonomy for the task store.
//!
//! Preconditions are recovered locally and reported as an aggregate;
//! everything else either aborts the in-flight operation or is fatal at
//! `open()`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// One or more preconditions on an `update` failed. No mutation was
    /// applied. The inner vector holds one message per failing condition.
    #[error("precondition failed: {}", .0.join("; "))]
    PreconditionFailed(Vec<String>),

    /// A journal append or fsync failed.
    #[error("durability failed: {0}")]
    DurabilityFailed(String),

    /// The snapshot driver could not encode or rename the snapshot file.
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    /// The store was used after `close()` or before `open()` completed.
    #[error("store is not open")]
    NotOpen,

    /// The advisory lock on the journal directory could not be acquired.
    #[error("journal directory is already locked")]
    AlreadyLocked,

    /// A completed snapshot or journal segment could not be decoded in a
    /// way that is not covered by the one-trailing-partial-record tolerance.
    #[error("recovery corruption: {0}")]
    RecoveryCorruption(String),

    /// A requested claim could not be satisfied for one of the groups.
    #[error("no eligible task in group {0:?}")]
    NoEligibleTask(String),

    /// Low-level I/O error not otherwise classified above.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
