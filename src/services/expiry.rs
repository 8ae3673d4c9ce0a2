//! Deadline queue for ephemeral signals.
//!
//! DESIGN
//! ======
//! A binary min-heap of `(deadline, generation)` plus a map from key to the
//! generation that is currently live. Renewing a key pushes a new heap entry
//! and bumps its generation; the superseded entry is discarded lazily when it
//! reaches the top. Schedule/renew/cancel are O(log n).
//!
//! The heap is rebuilt from the live map whenever stale entries outnumber
//! live ones, so memory tracks active signals rather than signal history.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

use tokio::time::Instant;

const COMPACT_SLACK: usize = 32;

struct HeapEntry<K> {
    deadline: Instant,
    generation: u64,
    key: K,
}

impl<K> PartialEq for HeapEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl<K> Eq for HeapEntry<K> {}

impl<K> PartialOrd for HeapEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for HeapEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.generation.cmp(&other.generation))
    }
}

pub struct ExpiryQueue<K> {
    heap: BinaryHeap<Reverse<HeapEntry<K>>>,
    live: HashMap<K, (Instant, u64)>,
    next_generation: u64,
}

impl<K> Default for ExpiryQueue<K> {
    fn default() -> Self {
        Self { heap: BinaryHeap::new(), live: HashMap::new(), next_generation: 0 }
    }
}

impl<K: Clone + Eq + Hash> ExpiryQueue<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key` to expire at `deadline`, replacing any earlier schedule.
    pub fn schedule(&mut self, key: K, deadline: Instant) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.live.insert(key.clone(), (deadline, generation));
        self.heap
            .push(Reverse(HeapEntry { deadline, generation, key }));
        self.maybe_compact();
    }

    /// Cancel a pending expiry. Returns whether one was live.
    pub fn cancel(&mut self, key: &K) -> bool {
        let removed = self.live.remove(key).is_some();
        if removed {
            self.maybe_compact();
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    /// Earliest live deadline, discarding stale heap entries on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.is_live(top) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if !self.is_live(top) {
                self.heap.pop();
                continue;
            }
            if top.deadline > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                self.live.remove(&entry.key);
                expired.push(entry.key);
            }
        }
        expired
    }

    /// Number of live (scheduled, not cancelled) keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn is_live(&self, entry: &HeapEntry<K>) -> bool {
        self.live
            .get(&entry.key)
            .is_some_and(|(_, generation)| *generation == entry.generation)
    }

    fn maybe_compact(&mut self) {
        if self.heap.len() <= self.live.len() * 2 + COMPACT_SLACK {
            return;
        }
        self.heap = self
            .live
            .iter()
            .map(|(key, (deadline, generation))| {
                Reverse(HeapEntry { deadline: *deadline, generation: *generation, key: key.clone() })
            })
            .collect();
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
#[path = "expiry_test.rs"]
mod tests;
