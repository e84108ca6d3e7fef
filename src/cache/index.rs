//! Parent id -> child id set, segmented the same way as [`super::ShardedStore`]

use parking_lot::RwLock;
use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use super::store::{segment_index, DEFAULT_SEGMENTS};

pub struct ShardedIndex<P, C> {
    segments: Box<[RwLock<HashMap<P, HashSet<C>>>]>,
    hasher: RandomState,
}

impl<P, C> ShardedIndex<P, C>
where
    P: Hash + Eq,
    C: Hash + Eq + Clone,
{
    pub fn new(segments: usize) -> Self {
        let segments = segments.max(1);
        Self {
            segments: (0..segments).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn segment(&self, parent: &P) -> &RwLock<HashMap<P, HashSet<C>>> {
        &self.segments[segment_index(&self.hasher, parent, self.segments.len())]
    }

    /// Returns whether `child` was newly added.
    pub fn add(&self, parent: P, child: C) -> bool {
        self.segment(&parent)
            .write()
            .entry(parent)
            .or_default()
            .insert(child)
    }

    /// Removes `child`; the parent entry goes away with its last child.
    pub fn remove(&self, parent: &P, child: &C) -> bool {
        let mut segment = self.segment(parent).write();

        let Some(children) = segment.get_mut(parent) else {
            return false;
        };

        let removed = children.remove(child);

        if children.is_empty() {
            segment.remove(parent);
        }

        removed
    }

    /// Copy of the child set.
    pub fn get(&self, parent: &P) -> Option<HashSet<C>> {
        self.segment(parent).read().get(parent).cloned()
    }

    /// Drop the parent entry, handing back its children for cascading deletes.
    pub fn delete(&self, parent: &P) -> Option<HashSet<C>> {
        self.segment(parent).write().remove(parent)
    }

    pub fn contains(&self, parent: &P, child: &C) -> bool {
        self.segment(parent)
            .read()
            .get(parent)
            .is_some_and(|children| children.contains(child))
    }

    pub fn count(&self, parent: &P) -> usize {
        self.segment(parent).read().get(parent).map_or(0, HashSet::len)
    }

    /// Number of parents with at least one child.
    pub fn parents(&self) -> usize {
        self.segments.iter().map(|segment| segment.read().len()).sum()
    }
}

impl<P, C> Default for ShardedIndex<P, C>
where
    P: Hash + Eq,
    C: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENTS)
    }
}
