// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Per-table LRU eviction over chunk keys.
//!
//! The policy holds keys only. How many pages a chunk occupies is accounted
//! in [`TableEvictionTracker`], not here.

use std::collections::{BTreeMap, HashMap};

use crate::chunk::ChunkKey;

/// LRU queue over chunk keys. Recency is a monotone counter: the queue maps
/// counter -> key and the side map records each key's current counter, so
/// touch, remove and evict are all logarithmic.
#[derive(Default)]
pub struct LruEvictionPolicy {
    queue: BTreeMap<u64, ChunkKey>,
    positions: HashMap<ChunkKey, u64>,
    clock: u64,
}

impl LruEvictionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `key` to the most-recent position, inserting it if absent.
    pub fn touch_chunk(&mut self, key: &ChunkKey) {
        if let Some(position) = self.positions.remove(key) {
            self.queue.remove(&position);
        }
        self.clock += 1;
        self.queue.insert(self.clock, key.clone());
        self.positions.insert(key.clone(), self.clock);
    }

    /// Removes and returns the least-recently used key.
    pub fn evict_next_chunk(&mut self) -> Option<ChunkKey> {
        let (&position, _) = self.queue.iter().next()?;
        let key = self.queue.remove(&position)?;
        self.positions.remove(&key);
        Some(key)
    }

    /// Excises `key`. No-op if absent.
    pub fn remove_chunk(&mut self, key: &ChunkKey) {
        if let Some(position) = self.positions.remove(key) {
            self.queue.remove(&position);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dump_eviction_queue(&self) -> String {
        use itertools::Itertools;
        format!(
            "eviction queue: [{}]\n",
            self.queue
                .values()
                .map(crate::chunk::show_chunk)
                .join(", ")
        )
    }
}

/// Eviction bookkeeping for one table: the LRU queue of resident chunk keys
/// and the pages those chunks occupy.
#[derive(Default)]
pub struct TableEvictionTracker {
    pub eviction_alg: LruEvictionPolicy,
    pub num_pages: u64,
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;

    fn key(c: i32) -> ChunkKey {
        smallvec![1, 1, c, 0]
    }

    #[test]
    fn lru_touch_order() {
        let mut policy = LruEvictionPolicy::new();
        policy.touch_chunk(&key(1));
        policy.touch_chunk(&key(2));
        policy.touch_chunk(&key(1));
        assert_eq!(policy.evict_next_chunk(), Some(key(2)));
        assert_eq!(policy.evict_next_chunk(), Some(key(1)));
        assert_eq!(policy.evict_next_chunk(), None);
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let mut policy = LruEvictionPolicy::new();
        policy.touch_chunk(&key(1));
        policy.remove_chunk(&key(2));
        policy.remove_chunk(&key(1));
        assert!(policy.is_empty());
        assert_eq!(policy.evict_next_chunk(), None);
    }

    #[test]
    fn touch_after_evict_reinserts() {
        let mut policy = LruEvictionPolicy::new();
        policy.touch_chunk(&key(1));
        assert_eq!(policy.evict_next_chunk(), Some(key(1)));
        policy.touch_chunk(&key(1));
        assert_eq!(policy.evict_next_chunk(), Some(key(1)));
    }
}
