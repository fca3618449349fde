//! Duplicate suppression for flooded broadcast frames.

use lru::LruCache;
use std::num::NonZeroUsize;
use tapmesh_wire::MacAddr;

/// Default number of `(origin, stamp)` pairs remembered.
///
/// Needs to exceed peers times the expected burst of broadcasts in flight;
/// a few thousand entries is far beyond what a mesh segment produces.
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

/// LRU set of broadcast identifiers already seen
///
/// Flooding delivers the same broadcast along every edge of the mesh, so a
/// node with more than one link will see duplicates. The first `(origin,
/// stamp)` pair wins; replays are reported for the caller to drop.
#[derive(Debug)]
pub struct BroadcastDedup {
    seen: LruCache<(MacAddr, i64), ()>,
}

impl BroadcastDedup {
    /// Create a dedup set with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DEDUP_CAPACITY)
    }

    /// Create a dedup set remembering at most `capacity` pairs.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            seen: LruCache::new(capacity),
        }
    }

    /// Record a broadcast identifier.
    ///
    /// Returns `true` when the pair was not seen before (the broadcast is
    /// fresh and should be delivered and re-flooded).
    pub fn insert(&mut self, origin: MacAddr, stamp: i64) -> bool {
        self.seen.put((origin, stamp), ()).is_none()
    }

    /// Number of remembered pairs.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for BroadcastDedup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_first_insert_is_fresh() {
        let mut dedup = BroadcastDedup::new();
        let origin = mac("aa:aa:aa:aa:aa:aa");

        assert!(dedup.insert(origin, 1));
        assert!(!dedup.insert(origin, 1));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_distinct_stamps_are_distinct_entries() {
        let mut dedup = BroadcastDedup::new();
        let origin = mac("aa:aa:aa:aa:aa:aa");

        assert!(dedup.insert(origin, 1));
        assert!(dedup.insert(origin, 2));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_same_stamp_different_origins() {
        let mut dedup = BroadcastDedup::new();

        assert!(dedup.insert(mac("aa:aa:aa:aa:aa:aa"), 7));
        assert!(dedup.insert(mac("bb:bb:bb:bb:bb:bb"), 7));
    }

    #[test]
    fn test_lru_eviction() {
        let mut dedup = BroadcastDedup::with_capacity(2);
        let origin = mac("aa:aa:aa:aa:aa:aa");

        assert!(dedup.insert(origin, 1));
        assert!(dedup.insert(origin, 2));
        assert!(dedup.insert(origin, 3)); // evicts stamp 1
        assert_eq!(dedup.len(), 2);

        // The evicted pair reads as fresh again; capacity bounds memory, not
        // correctness, because live floods finish long before eviction.
        assert!(dedup.insert(origin, 1));
    }
}
