//! Store-and-forward buffer (§4.8): a neutral per-peer queue with two
//! retention classes, draining a peer's queue when it re-announces.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// A message parked for a peer that was absent when it was generated.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub sender_id: [u8; 8],
    pub recipient_id: Option<[u8; 8]>,
    pub channel: Option<String>,
    pub content_or_ciphertext: Vec<u8>,
    pub timestamp_ms: u64,
    pub is_private: bool,
    pub is_signed: bool,
    inserted_at: Instant,
}

impl StoredMessage {
    pub fn new(
        id: String,
        sender_id: [u8; 8],
        recipient_id: Option<[u8; 8]>,
        channel: Option<String>,
        content_or_ciphertext: Vec<u8>,
        timestamp_ms: u64,
        is_private: bool,
        is_signed: bool,
    ) -> Self {
        Self {
            id,
            sender_id,
            recipient_id,
            channel,
            content_or_ciphertext,
            timestamp_ms,
            is_private,
            is_signed,
            inserted_at: Instant::now(),
        }
    }
}

/// Which retention class a stored message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionClass {
    /// 12 hour retention.
    Regular,
    /// 168 hour retention, for peers explicitly marked as favorites.
    Favorites,
}

/// Two maps, `regular` and `favorites`, each `peer_id -> queue`. Not
/// backed by `DashMap`: store-and-forward mutation always happens
/// from the single coordinator task, so a plain `HashMap` behind the
/// coordinator's ownership is enough.
pub struct StoreForward {
    regular: HashMap<[u8; 8], VecDeque<StoredMessage>>,
    favorites: HashMap<[u8; 8], VecDeque<StoredMessage>>,
    regular_retention: Duration,
    favorites_retention: Duration,
}

impl StoreForward {
    pub fn new(regular_retention: Duration, favorites_retention: Duration) -> Self {
        Self {
            regular: HashMap::new(),
            favorites: HashMap::new(),
            regular_retention,
            favorites_retention,
        }
    }

    fn queue_for(&mut self, class: RetentionClass) -> &mut HashMap<[u8; 8], VecDeque<StoredMessage>> {
        match class {
            RetentionClass::Regular => &mut self.regular,
            RetentionClass::Favorites => &mut self.favorites,
        }
    }

    pub fn enqueue(&mut self, peer_id: [u8; 8], class: RetentionClass, message: StoredMessage) {
        self.queue_for(class)
            .entry(peer_id)
            .or_default()
            .push_back(message);
    }

    /// Drains and returns every message queued for `peer_id`, in FIFO
    /// insertion order, across both retention classes, favorites first.
    pub fn drain(&mut self, peer_id: [u8; 8]) -> Vec<StoredMessage> {
        let mut drained = Vec::new();
        if let Some(queue) = self.favorites.remove(&peer_id) {
            drained.extend(queue);
        }
        if let Some(queue) = self.regular.remove(&peer_id) {
            drained.extend(queue);
        }
        drained
    }

    pub fn has_pending(&self, peer_id: [u8; 8]) -> bool {
        self.favorites.get(&peer_id).is_some_and(|q| !q.is_empty())
            || self.regular.get(&peer_id).is_some_and(|q| !q.is_empty())
    }

    /// Drops messages older than their class's retention window.
    pub fn gc(&mut self) {
        let regular_retention = self.regular_retention;
        gc_queues(&mut self.regular, regular_retention);
        let favorites_retention = self.favorites_retention;
        gc_queues(&mut self.favorites, favorites_retention);
    }
}

fn gc_queues(queues: &mut HashMap<[u8; 8], VecDeque<StoredMessage>>, retention: Duration) {
    let now = Instant::now();
    queues.retain(|_, queue| {
        queue.retain(|message| now.duration_since(message.inserted_at) <= retention);
        !queue.is_empty()
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> StoredMessage {
        StoredMessage::new(
            id.to_string(),
            *b"AAAAAAAA",
            Some(*b"CCCCCCCC"),
            None,
            b"hi".to_vec(),
            0,
            true,
            true,
        )
    }

    #[test]
    fn drain_returns_fifo_order_and_empties_the_queue() {
        let mut buffer = StoreForward::new(Duration::from_secs(3600), Duration::from_secs(3600));
        buffer.enqueue(*b"CCCCCCCC", RetentionClass::Favorites, sample("m1"));
        buffer.enqueue(*b"CCCCCCCC", RetentionClass::Favorites, sample("m2"));

        let drained = buffer.drain(*b"CCCCCCCC");
        assert_eq!(drained.iter().map(|m| m.id.clone()).collect::<Vec<_>>(), vec!["m1", "m2"]);
        assert!(!buffer.has_pending(*b"CCCCCCCC"));
    }

    #[test]
    fn gc_drops_expired_entries_only() {
        let mut buffer = StoreForward::new(Duration::from_secs(0), Duration::from_secs(3600));
        buffer.enqueue(*b"CCCCCCCC", RetentionClass::Regular, sample("m1"));
        buffer.enqueue(*b"DDDDDDDD", RetentionClass::Favorites, sample("m2"));

        buffer.gc();
        assert!(!buffer.has_pending(*b"CCCCCCCC"));
        assert!(buffer.has_pending(*b"DDDDDDDD"));
    }
}
