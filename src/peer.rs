//! The peer table (§4.9): every neighbor this node has heard from,
//! discovered via advertisement, `ANNOUNCE`, or any inbound packet.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// A neighbor known to this node.
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: [u8; 8],
    pub nickname: String,
    pub rssi: Option<i16>,
    pub last_seen: Instant,
    pub online: bool,
    pub x25519_public: Option<[u8; 32]>,
    pub ed25519_signing_public: Option<[u8; 32]>,
    pub identity_public: Option<[u8; 32]>,
    pub has_session_key: bool,
    pub is_favorite: bool,
}

impl Peer {
    fn new(peer_id: [u8; 8]) -> Self {
        Self {
            peer_id,
            nickname: String::new(),
            rssi: None,
            last_seen: Instant::now(),
            online: true,
            x25519_public: None,
            ed25519_signing_public: None,
            identity_public: None,
            has_session_key: false,
            is_favorite: false,
        }
    }
}

/// Every neighbor this node currently tracks, keyed by peer id.
///
/// Mutated only through the coordinator's handlers (§5's single-writer
/// rule) — `DashMap` gives the facade's read-only snapshot queries
/// lock-free access without a second copy of the state.
pub struct PeerTable {
    peers: DashMap<[u8; 8], Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Inserts a newly discovered peer, or refreshes `last_seen`/online
    /// status for one already known. Returns `true` if this is the
    /// first time the peer has been seen.
    pub fn sight(&self, peer_id: [u8; 8]) -> bool {
        if let Some(mut peer) = self.peers.get_mut(&peer_id) {
            peer.last_seen = Instant::now();
            peer.online = true;
            false
        } else {
            self.peers.insert(peer_id, Peer::new(peer_id));
            true
        }
    }

    pub fn set_nickname(&self, peer_id: [u8; 8], nickname: String) {
        self.peers
            .entry(peer_id)
            .or_insert_with(|| Peer::new(peer_id))
            .nickname = nickname;
    }

    pub fn set_rssi(&self, peer_id: [u8; 8], rssi: i16) {
        if let Some(mut peer) = self.peers.get_mut(&peer_id) {
            peer.rssi = Some(rssi);
        }
    }

    pub fn set_keys(
        &self,
        peer_id: [u8; 8],
        x25519_public: [u8; 32],
        ed25519_signing_public: [u8; 32],
        identity_public: [u8; 32],
    ) {
        let mut peer = self.peers.entry(peer_id).or_insert_with(|| Peer::new(peer_id));
        peer.x25519_public = Some(x25519_public);
        peer.ed25519_signing_public = Some(ed25519_signing_public);
        peer.identity_public = Some(identity_public);
        peer.has_session_key = true;
    }

    pub fn mark_offline(&self, peer_id: [u8; 8]) {
        if let Some(mut peer) = self.peers.get_mut(&peer_id) {
            peer.online = false;
        }
    }

    pub fn set_favorite(&self, peer_id: [u8; 8], favorite: bool) {
        if let Some(mut peer) = self.peers.get_mut(&peer_id) {
            peer.is_favorite = favorite;
        }
    }

    pub fn get(&self, peer_id: [u8; 8]) -> Option<Peer> {
        self.peers.get(&peer_id).map(|entry| entry.clone())
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Drops every known peer, as happens on `Node::stop()`.
    pub fn clear(&self) {
        self.peers.clear();
    }

    /// Evicts every peer not sighted within `eviction_window`,
    /// returning the evicted peer ids.
    pub fn evict_stale(&self, eviction_window: Duration) -> Vec<[u8; 8]> {
        let now = Instant::now();
        let stale: Vec<[u8; 8]> = self
            .peers
            .iter()
            .filter(|entry| now.duration_since(entry.last_seen) > eviction_window)
            .map(|entry| *entry.key())
            .collect();
        for peer_id in &stale {
            self.peers.remove(peer_id);
        }
        stale
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_reports_new_and_later_ones_do_not() {
        let table = PeerTable::new();
        assert!(table.sight(*b"AAAAAAAA"));
        assert!(!table.sight(*b"AAAAAAAA"));
    }

    #[test]
    fn leave_marks_offline_without_evicting() {
        let table = PeerTable::new();
        table.sight(*b"AAAAAAAA");
        table.mark_offline(*b"AAAAAAAA");
        let peer = table.get(*b"AAAAAAAA").unwrap();
        assert!(!peer.online);
    }

    #[test]
    fn stale_peers_are_evicted_after_the_window() {
        let table = PeerTable::new();
        table.sight(*b"AAAAAAAA");
        let evicted = table.evict_stale(Duration::from_secs(0));
        assert_eq!(evicted, vec![*b"AAAAAAAA"]);
        assert!(table.get(*b"AAAAAAAA").is_none());
    }
}
