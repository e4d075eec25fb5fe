//! Per-group priority index.
//!
//! A hand-rolled binary min-heap over [`Task::availability`], with an
//! auxiliary identifier-to-heap-position map so that an arbitrary task can
//! be removed in `O(log n)` (`pop_by_key`) instead of the `O(n)` scan a
//! `std::collections::BinaryHeap` would force. This is also what lets
//! `peek_at` expose raw heap-array positions and what lets
//! `pop_random_available` walk the heap structure directly.
//!
//! All mutation here happens inside the single serializer handler (see
//! `store::handler`), so nothing in this module needs to be `Sync`; the
//! per-index RNG is a plain `SmallRng`, not a thread-safe source.

use std::collections::HashMap;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::task::Task;

pub struct GroupIndex {
    heap: Vec<Task>,
    pos: HashMap<u64, usize>,
    rng: SmallRng,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            pos: HashMap::new(),
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pos.contains_key(&id)
    }

    pub fn peek(&self) -> Option<&Task> {
        self.heap.first()
    }

    /// Returns the task at raw heap array position `i`, if any. Positions
    /// are only meaningful between mutations.
    pub fn peek_at(&self, i: usize) -> Option<&Task> {
        self.heap.get(i)
    }

    /// Iterate tasks in the heap's internal array order (not sorted).
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.heap.iter()
    }

    pub fn push(&mut self, task: Task) {
        let id = task.id;
        let idx = self.heap.len();
        self.heap.push(task);
        self.pos.insert(id, idx);
        self.sift_up(idx);
    }

    pub fn pop(&mut self) -> Option<Task> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    pub fn pop_by_key(&mut self, id: u64) -> Option<Task> {
        let idx = *self.pos.get(&id)?;
        Some(self.remove_at(idx))
    }

    /// Remove and return the task at heap index `idx`, repairing the heap
    /// and the position side map.
    fn remove_at(&mut self, idx: usize) -> Task {
        let last = self.heap.len() - 1;
        self.heap.swap(idx, last);
        let removed = self.heap.pop().expect("checked non-empty by caller");
        self.pos.remove(&removed.id);

        if idx < self.heap.len() {
            self.pos.insert(self.heap[idx].id, idx);
            // the element that took `idx`'s place may need to move either way
            if !self.sift_up(idx) {
                self.sift_down(idx);
            }
        }

        removed
    }

    fn sift_up(&mut self, mut idx: usize) -> bool {
        let mut moved = false;
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[idx].availability < self.heap[parent].availability {
                self.swap(idx, parent);
                idx = parent;
                moved = true;
            } else {
                break;
            }
        }
        moved
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < len && self.heap[left].availability < self.heap[smallest].availability {
                smallest = left;
            }
            if right < len && self.heap[right].availability < self.heap[smallest].availability {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.pos.insert(self.heap[a].id, a);
        self.pos.insert(self.heap[b].id, b);
    }

    /// Root-biased random draw among tasks whose availability is at or
    /// before `deadline`. Descends from the root by random choice among the
    /// current node and whichever of its two children also satisfy the
    /// deadline, stopping when the current node is picked or no child
    /// qualifies. Returns `None` if the heap is empty or the root itself is
    /// past the deadline (a min-heap guarantees no descendant can then
    /// qualify either).
    pub fn pop_random_available(&mut self, deadline: u64) -> Option<Task> {
        if self.heap.is_empty() || self.heap[0].availability > deadline {
            return None;
        }

        let mut idx = 0usize;
        loop {
            let mut candidates = vec![idx];
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            if left < self.heap.len() && self.heap[left].availability <= deadline {
                candidates.push(left);
            }
            if right < self.heap.len() && self.heap[right].availability <= deadline {
                candidates.push(right);
            }

            let choice = candidates[self.rng.gen_range(0..candidates.len())];
            if choice == idx {
                break;
            }
            idx = choice;
        }

        Some(self.remove_at(idx))
    }
}

impl Default for GroupIndex {
    fn default() -> Self {
        Self::new()
    }
}
