//! Segmented concurrent map
//!
//! Keys are spread over a fixed number of segments by hash. Each segment is a
//! plain `HashMap` behind its own reader/writer lock, so operations on keys in
//! different segments never contend.

use parking_lot::RwLock;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

/// Segment count used by the cache unless told otherwise.
pub const DEFAULT_SEGMENTS: usize = 16;

/// Pick the segment for `key`. Shared with [`super::ShardedIndex`].
pub(crate) fn segment_index<Q: Hash + ?Sized>(hasher: &RandomState, key: &Q, segments: usize) -> usize {
    (hasher.hash_one(key) as usize) % segments
}

pub struct ShardedStore<K, V> {
    segments: Box<[RwLock<HashMap<K, V>>]>,
    hasher: RandomState,
}

impl<K, V> ShardedStore<K, V>
where
    K: Hash + Eq,
{
    /// Create a store with `segments` independently locked partitions.
    ///
    /// A segment count of zero is bumped to one.
    pub fn new(segments: usize) -> Self {
        let segments = segments.max(1);
        Self {
            segments: (0..segments).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn segment(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        &self.segments[segment_index(&self.hasher, key, self.segments.len())]
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn has(&self, key: &K) -> bool {
        self.segment(key).read().contains_key(key)
    }

    /// Insert or wholesale replace, returning the previous value.
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.segment(&key).write().insert(key, value)
    }

    pub fn delete(&self, key: &K) -> Option<V> {
        self.segment(key).write().remove(key)
    }

    /// Total entries, summed segment by segment.
    ///
    /// Segments are read one after another, so the result is only a snapshot
    /// while writers are active.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|segment| segment.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|segment| segment.read().is_empty())
    }
}

impl<K, V> ShardedStore<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<V> {
        self.segment(key).read().get(key).cloned()
    }
}

impl<K: Hash + Eq, V> Default for ShardedStore<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENTS)
    }
}
