//! A durable, in-process task store: tasks grouped by named queues, atomic
//! multi-task updates, owner-based exclusive claims with time-based leases,
//! and survival across process restart through an append-only journal with
//! periodic snapshots.
//!
//! All mutation of the in-memory state happens inside a single serializer
//! task reached only through message passing ([`store::TaskStore`]).
//!
//! An HTTP service boundary, CLI entry point, client library, and
//! configuration-file loading are deliberately out of scope — this crate
//! is embedded, not run standalone.

pub mod error;
pub mod fs;
pub mod index;
pub mod journal;
pub mod store;
pub mod task;

pub use error::{Result, StoreError};
pub use store::{ChangeTask, NewTask, StoreOptions, TaskStore};
pub use task::Task;
