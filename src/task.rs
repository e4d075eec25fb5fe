//! Core data model: tasks, diffs, and transactions.
//!
//! A [`Task`] is immutable once it has been handed back to a caller. It is
//! never mutated in place; "changing" a task produces a brand new task with
//! a fresh, strictly greater identifier and deletes the old one in the same
//! [`Transaction`].

use serde::{Deserialize, Serialize};

/// Identifier reserved for "please assign a fresh identifier".
pub const UNASSIGNED_ID: u64 = 0;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub owner: u64,
    pub group: String,
    /// Milliseconds since the Unix epoch (UTC) after which the task becomes
    /// eligible to be claimed.
    pub availability: u64,
    pub payload: Vec<u8>,
}

impl Task {
    /// A task is owned at wall-clock time `now` iff its availability is
    /// strictly in the future.
    pub fn is_owned_at(&self, now: u64) -> bool {
        self.availability > now
    }

    /// Whether `owner` may change or delete this task at time `now`: either
    /// the lease has expired, or `owner` holds it.
    pub fn may_be_mutated_by(&self, owner: u64, now: u64) -> bool {
        !self.is_owned_at(now) || self.owner == owner
    }
}

/// One element of a [`Transaction`]: either a replacement or a deletion of
/// whatever task previously lived at `old` (0 for pure additions).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diff {
    pub old: u64,
    pub kind: DiffKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DiffKind {
    Put(Task),
    Delete,
}

/// An ordered sequence of diffs that must be applied atomically.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub diffs: Vec<Diff>,
}

impl Transaction {
    pub fn new() -> Self {
        Self { diffs: Vec::new() }
    }

    pub fn push(&mut self, diff: Diff) {
        self.diffs.push(diff);
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ownership_predicate() {
        let t = Task { id: 1, owner: 11, group: "g".into(), availability: 1000, payload: vec![] };
        assert!(t.is_owned_at(500));
        assert!(!t.is_owned_at(1000));
        assert!(!t.is_owned_at(1500));
        assert!(t.may_be_mutated_by(11, 500));
        assert!(!t.may_be_mutated_by(12, 500));
        assert!(t.may_be_mutated_by(12, 1500));
    }
}
