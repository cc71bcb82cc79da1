//! Bounded loop-suppression set. An unbounded `HashSet` would grow
//! forever on a long-lived node (`spec.md` §9 "Global mutable seen-set");
//! this caps at a configurable entry count via an LRU, evicting the
//! least-recently-marked id once full.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

const DEFAULT_CAPACITY: usize = 100_000;

pub struct SeenSet {
    cache: Mutex<LruCache<String, ()>>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cache.lock().contains(id)
    }

    /// Mark `id` as seen. Returns `true` if it was newly inserted, `false`
    /// if it was already present.
    pub fn mark(&self, id: &str) -> bool {
        let mut guard = self.cache.lock();
        if guard.contains(id) {
            guard.promote(id);
            false
        } else {
            guard.put(id.to_string(), ());
            true
        }
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_id_is_not_contained() {
        let seen = SeenSet::new();
        assert!(!seen.contains("m1"));
    }

    #[test]
    fn mark_then_contains_is_true() {
        let seen = SeenSet::new();
        assert!(seen.mark("m1"));
        assert!(seen.contains("m1"));
    }

    #[test]
    fn marking_twice_returns_false_second_time() {
        let seen = SeenSet::new();
        assert!(seen.mark("m1"));
        assert!(!seen.mark("m1"));
    }

    #[test]
    fn capacity_eviction_drops_oldest() {
        let seen = SeenSet::with_capacity(2);
        seen.mark("a");
        seen.mark("b");
        seen.mark("c");
        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
        assert!(seen.contains("c"));
    }
}
