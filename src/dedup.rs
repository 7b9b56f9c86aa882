//! Packet deduplication (§4.7 step 1, §4.9): the first side-effecting
//! step on every inbound packet, so a duplicate arriving after its
//! twin is dropped silently before any crypto or dispatch work runs.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// A 64-bit hash over `(sender_id, payload bytes, timestamp_ms)` —
/// the glossary's "dedup id".
pub fn dedup_id(sender_id: [u8; 8], payload: &[u8], timestamp_ms: u64) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    sender_id.hash(&mut hasher);
    payload.hash(&mut hasher);
    timestamp_ms.hash(&mut hasher);
    hasher.finish()
}

/// A bounded set of recently seen dedup ids, capacity-limited with
/// oldest-first eviction and a time-based retention sweep.
pub struct DedupSet {
    capacity: usize,
    seen: HashMap<u64, Instant>,
    order: VecDeque<u64>,
}

impl DedupSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Inserts `id` if not already present. Returns `true` if this is
    /// the first time `id` has been admitted (so the caller should
    /// dispatch/relay it); `false` if it's a duplicate to drop.
    pub fn admit(&mut self, id: u64) -> bool {
        if self.seen.contains_key(&id) {
            return false;
        }
        self.seen.insert(id, Instant::now());
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: u64) -> bool {
        self.seen.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Drops entries older than `retention`.
    pub fn gc(&mut self, retention: Duration) {
        let now = Instant::now();
        while let Some(&oldest) = self.order.front() {
            match self.seen.get(&oldest) {
                Some(&inserted_at) if now.duration_since(inserted_at) > retention => {
                    self.order.pop_front();
                    self.seen.remove(&oldest);
                }
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_is_idempotent() {
        let mut set = DedupSet::new(10);
        let id = dedup_id(*b"AAAAAAAA", b"hi", 1);
        assert!(set.admit(id));
        assert!(!set.admit(id));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut set = DedupSet::new(2);
        set.admit(1);
        set.admit(2);
        set.admit(3);
        assert_eq!(set.len(), 2);
        assert!(!set.contains(1));
        assert!(set.contains(2));
        assert!(set.contains(3));
    }

    #[test]
    fn gc_drops_entries_older_than_retention() {
        let mut set = DedupSet::new(10);
        set.admit(1);
        set.gc(Duration::from_secs(0));
        assert!(set.is_empty());
    }

    #[test]
    fn different_fields_produce_different_ids() {
        let a = dedup_id(*b"AAAAAAAA", b"hi", 1);
        let b = dedup_id(*b"AAAAAAAA", b"hi", 2);
        assert_ne!(a, b);
    }
}
