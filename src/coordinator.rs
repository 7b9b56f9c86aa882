//! The mesh coordinator (§4.5): a single event loop owning every piece
//! of mutable state — peer table, dedup set, session keys,
//! store-and-forward queues, fragment buffers — and dispatching
//! transport events, timer fires, and outbound send requests in the
//! order they arrive. Nothing outside this task mutates that state,
//! matching the single-writer rule the rest of the engine relies on.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::codec::packet::{decode_wire_payload, prepare_wire_payload};
use crate::codec::{MessageRecord, Packet, PacketType};
use crate::config::NodeConfig;
use crate::crypto::KeyStore;
use crate::dedup::{dedup_id, DedupSet};
use crate::error::{CryptoError, FacadeError, FacadeResult};
use crate::fragment::{decode_fragment_payload, split_into_fragments, FragmentReassembler};
use crate::peer::PeerTable;
use crate::status::Status;
use crate::store_forward::{RetentionClass, StoreForward, StoredMessage};
use crate::transport::{Transport, TransportEvent};

/// Events the public facade surfaces to whoever is listening.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Message {
        sender_id: [u8; 8],
        sender_nickname: String,
        content: String,
        is_private: bool,
        channel: Option<String>,
    },
    PeerDiscovered {
        peer_id: [u8; 8],
    },
    PeerUpdated {
        peer_id: [u8; 8],
        nickname: String,
        online: bool,
    },
    StatusChanged(Status),
    Log {
        level: log::Level,
        message: String,
    },
}

/// One outbound request submitted through the facade, carrying a
/// one-shot channel the coordinator reports success or failure on.
pub enum SendRequest {
    Broadcast {
        text: String,
        ack: oneshot::Sender<FacadeResult<()>>,
    },
    Private {
        peer_id: [u8; 8],
        text: String,
        ack: oneshot::Sender<FacadeResult<()>>,
    },
    Channel {
        name: String,
        text: String,
        ack: oneshot::Sender<FacadeResult<()>>,
    },
    JoinChannel {
        name: String,
        ack: oneshot::Sender<FacadeResult<()>>,
    },
    LeaveChannel {
        name: String,
        ack: oneshot::Sender<FacadeResult<()>>,
    },
    /// Broadcasts a `LEAVE` packet announcing this node is departing
    /// the mesh, so neighbors mark it offline immediately rather than
    /// waiting out the peer eviction window.
    Leave {
        ack: oneshot::Sender<FacadeResult<()>>,
    },
}

/// Everything that can wake the coordinator's event loop, besides its
/// own timers.
pub enum CoordinatorMsg {
    Transport(TransportEvent),
    Send(SendRequest),
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn random_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// The coordinator's owned state. Constructed once per `Node::start`
/// call and dropped on `stop()`, which wipes every piece of state it
/// holds.
pub struct Coordinator {
    own_peer_id: [u8; 8],
    own_nickname: String,
    config: NodeConfig,
    transport: std::sync::Arc<dyn Transport>,
    keys: std::sync::Arc<KeyStore>,
    peers: std::sync::Arc<PeerTable>,
    dedup: DedupSet,
    store_forward: StoreForward,
    fragments: FragmentReassembler,
    handshaken: HashSet<[u8; 8]>,
    joined_channels: HashSet<String>,
    events_out: mpsc::Sender<NodeEvent>,
}

impl Coordinator {
    /// `peers` and `keys` are shared with the owning [`crate::Node`] so
    /// read-only facade queries (peer snapshots, own fingerprint) never
    /// have to round-trip through the coordinator's message channel —
    /// `DashMap`/`parking_lot` make both safe to read concurrently with
    /// the coordinator's single-writer mutations.
    pub fn new(
        own_peer_id: [u8; 8],
        own_nickname: String,
        config: NodeConfig,
        transport: std::sync::Arc<dyn Transport>,
        keys: std::sync::Arc<KeyStore>,
        peers: std::sync::Arc<PeerTable>,
        events_out: mpsc::Sender<NodeEvent>,
    ) -> Self {
        let fragment_timeout = config.fragment_timeout;
        let fragment_cap_per_peer = config.fragment_cap_per_peer;
        let store_forward_retention = config.store_forward_retention;
        let favorites_retention = config.favorites_retention;
        let dedup_capacity = config.dedup_capacity;
        Self {
            own_peer_id,
            own_nickname,
            config,
            transport,
            keys,
            peers,
            dedup: DedupSet::new(dedup_capacity),
            store_forward: StoreForward::new(store_forward_retention, favorites_retention),
            fragments: FragmentReassembler::with_cap(fragment_timeout, fragment_cap_per_peer),
            handshaken: HashSet::new(),
            joined_channels: HashSet::new(),
            events_out,
        }
    }

    fn emit_event(&self, event: NodeEvent) {
        if self.events_out.try_send(event).is_err() {
            debug!("event stream full or closed, dropping one event");
        }
    }

    /// Runs until `msgs` closes (i.e. `Node::stop` drops its sender
    /// side), firing the announce and gc timers as configured.
    pub async fn run(mut self, mut msgs: mpsc::Receiver<CoordinatorMsg>) {
        let mut announce_timer = time::interval(self.config.announce_interval);
        let mut gc_timer = time::interval(self.config.gc_interval);
        self.broadcast_announce().await;

        loop {
            tokio::select! {
                _ = announce_timer.tick() => {
                    self.broadcast_announce().await;
                }
                _ = gc_timer.tick() => {
                    self.run_gc();
                }
                msg = msgs.recv() => {
                    match msg {
                        Some(CoordinatorMsg::Transport(event)) => self.handle_transport_event(event).await,
                        Some(CoordinatorMsg::Send(request)) => self.handle_send_request(request).await,
                        None => break,
                    }
                }
            }
        }

        debug!("coordinator event loop exiting");
    }

    fn run_gc(&mut self) {
        debug!("running gc sweep");
        self.dedup.gc(self.config.dedup_retention);
        self.fragments.gc();
        self.store_forward.gc();
        let evicted = self.peers.evict_stale(self.config.peer_eviction);
        for peer_id in evicted {
            debug!("evicted stale peer {}", hex::encode(peer_id));
        }
    }

    async fn broadcast_announce(&mut self) {
        let packet = Packet::new(
            PacketType::Announce,
            self.own_peer_id,
            self.own_nickname.clone().into_bytes(),
        );
        if let Err(e) = self.emit_packet(&packet).await {
            warn!("failed to broadcast announce: {e}");
        }
    }

    async fn broadcast_leave(&mut self) -> FacadeResult<()> {
        let packet = Packet::new(PacketType::Leave, self.own_peer_id, Vec::new());
        self.emit_packet(&packet).await
    }

    async fn send_key_exchange(&mut self, peer_id: [u8; 8]) {
        let packet = Packet::new(
            PacketType::KeyExchange,
            self.own_peer_id,
            self.keys.own_combined_public().to_vec(),
        )
        .with_recipient(peer_id);
        if let Err(e) = self.emit_packet(&packet).await {
            warn!("failed to send key exchange to {}: {e}", hex::encode(peer_id));
        }
    }

    /// Encodes and transmits `packet`, splitting into
    /// `FRAGMENT_START`/`CONTINUE`/`END` packets when the encoded form
    /// exceeds the configured MTU budget. Admits every wire packet's
    /// dedup id as it goes out, so a neighbor echoing it straight back
    /// is treated as a duplicate rather than re-dispatched.
    async fn emit_packet(&mut self, packet: &Packet) -> FacadeResult<()> {
        let encoded = packet.encode()?;
        if encoded.len() <= self.config.mtu_budget {
            self.dedup.admit(dedup_id(packet.sender_id, &packet.payload, packet.timestamp_ms));
            self.transport
                .emit(packet.recipient_id, encoded)
                .await
                .map_err(|e| FacadeError::Network(e.to_string()))?;
            return Ok(());
        }

        if packet.payload.len() > self.config.fragment_cap_per_peer {
            return Err(FacadeError::MessageTooLarge {
                size: packet.payload.len(),
                budget: self.config.fragment_cap_per_peer,
            });
        }

        let id = random_id();
        let chunk_size = self.config.mtu_budget.saturating_sub(96).max(1);
        let chunks = split_into_fragments(&id, &packet.payload, chunk_size, packet.is_compressed, packet.signature);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk_payload) in chunks.into_iter().enumerate() {
            let packet_type = if i == 0 {
                PacketType::FragmentStart
            } else if i == last {
                PacketType::FragmentEnd
            } else {
                PacketType::FragmentContinue
            };
            let mut fragment = Packet::new(packet_type, packet.sender_id, chunk_payload);
            if let Some(recipient) = packet.recipient_id {
                fragment = fragment.with_recipient(recipient);
            }
            let bytes = fragment.encode()?;
            self.dedup
                .admit(dedup_id(fragment.sender_id, &fragment.payload, fragment.timestamp_ms));
            self.transport
                .emit(fragment.recipient_id, bytes)
                .await
                .map_err(|e| FacadeError::Network(e.to_string()))?;
        }
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerDiscovered { peer_id, rssi, .. } => {
                let first_seen = self.peers.sight(peer_id);
                if let Some(rssi) = rssi {
                    self.peers.set_rssi(peer_id, rssi);
                }
                if first_seen {
                    info!("peer {} discovered", hex::encode(peer_id));
                    self.emit_event(NodeEvent::PeerDiscovered { peer_id });
                }
                if !self.keys.has_session_key(peer_id) {
                    self.send_key_exchange(peer_id).await;
                }
            }
            TransportEvent::BytesReceived { peer_id, bytes } => {
                self.handle_inbound(peer_id, bytes).await;
            }
            TransportEvent::PeerLost { peer_id } => {
                self.peers.mark_offline(peer_id);
                info!("peer {} lost", hex::encode(peer_id));
                self.emit_event(NodeEvent::PeerUpdated {
                    peer_id,
                    nickname: self.peers.get(peer_id).map(|p| p.nickname).unwrap_or_default(),
                    online: false,
                });
            }
        }
    }

    async fn handle_inbound(&mut self, source_link: [u8; 8], bytes: Vec<u8>) {
        let packet = match Packet::decode(&bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("dropping undecodable packet from {}: {e}", hex::encode(source_link));
                return;
            }
        };

        let id = dedup_id(packet.sender_id, &packet.payload, packet.timestamp_ms);
        if !self.dedup.admit(id) {
            debug!("dropping duplicate packet from {}", hex::encode(packet.sender_id));
            return;
        }

        debug!(
            "admitted {:?} from {} (ttl={})",
            packet.packet_type,
            hex::encode(packet.sender_id),
            packet.ttl
        );

        self.dispatch(&packet).await;

        if let Some(relayed) = packet.decrement_ttl() {
            let mut relayed = relayed;
            relayed.is_compressed = false;
            match relayed.encode() {
                Ok(bytes) => {
                    if let Err(e) = self.transport.emit(relayed.recipient_id, bytes).await {
                        warn!("relay failed: {e}");
                    }
                }
                Err(e) => warn!("failed to re-encode packet for relay: {e}"),
            }
        }
    }

    async fn dispatch(&mut self, packet: &Packet) {
        match packet.packet_type {
            PacketType::Announce => self.on_announce(packet).await,
            PacketType::KeyExchange => self.on_key_exchange(packet).await,
            PacketType::Leave => self.on_leave(packet),
            PacketType::Message => self.on_message(packet.sender_id, packet.recipient_id, &packet.payload, packet.signature).await,
            PacketType::FragmentStart | PacketType::FragmentContinue | PacketType::FragmentEnd => {
                self.on_fragment(packet).await;
            }
            PacketType::ChannelAnnounce
            | PacketType::ChannelRetention
            | PacketType::DeliveryAck
            | PacketType::DeliveryStatusRequest
            | PacketType::ReadReceipt
            | PacketType::Unknown(_) => {
                // Not (yet) understood, but still relayed by the ttl
                // check in `handle_inbound` — forward-compat with
                // later protocol revisions.
                debug!("{:?} from {} ({} byte payload)", packet.packet_type, hex::encode(packet.sender_id), packet.payload.len());
            }
        }
    }

    async fn on_announce(&mut self, packet: &Packet) {
        let nickname = String::from_utf8_lossy(&packet.payload).into_owned();
        self.peers.sight(packet.sender_id);
        self.peers.set_nickname(packet.sender_id, nickname.clone());
        info!("{} announced as {}", hex::encode(packet.sender_id), nickname);
        self.emit_event(NodeEvent::PeerUpdated {
            peer_id: packet.sender_id,
            nickname,
            online: true,
        });

        if self.store_forward.has_pending(packet.sender_id) {
            let pending = self.store_forward.drain(packet.sender_id);
            for message in pending {
                self.redeliver_stored(message).await;
            }
        }
    }

    async fn redeliver_stored(&mut self, message: StoredMessage) {
        let Some(recipient_id) = message.recipient_id else {
            return;
        };
        let (wire_payload, is_compressed) = prepare_wire_payload(&message.content_or_ciphertext);
        let signature = self.keys.sign(&wire_payload);
        let mut packet = Packet::new(PacketType::Message, message.sender_id, wire_payload)
            .with_recipient(recipient_id)
            .with_signature(signature);
        packet.is_compressed = is_compressed;
        if let Err(e) = self.emit_packet(&packet).await {
            warn!("failed to redeliver stored message to {}: {e}", hex::encode(recipient_id));
        }
    }

    async fn on_key_exchange(&mut self, packet: &Packet) {
        let Ok(combined_public) = <[u8; 96]>::try_from(packet.payload.as_slice()) else {
            warn!("malformed key exchange payload from {}", hex::encode(packet.sender_id));
            return;
        };
        if self.keys.add_peer_key(packet.sender_id, &combined_public).is_err() {
            warn!("failed to derive session key with {}", hex::encode(packet.sender_id));
            return;
        }
        self.peers.set_keys(
            packet.sender_id,
            combined_public[0..32].try_into().unwrap(),
            combined_public[32..64].try_into().unwrap(),
            combined_public[64..96].try_into().unwrap(),
        );
        if self.handshaken.insert(packet.sender_id) {
            self.send_key_exchange(packet.sender_id).await;
        }
        info!("key exchange complete with {}", hex::encode(packet.sender_id));
    }

    fn on_leave(&mut self, packet: &Packet) {
        self.peers.mark_offline(packet.sender_id);
        info!("{} left", hex::encode(packet.sender_id));
        self.emit_event(NodeEvent::PeerUpdated {
            peer_id: packet.sender_id,
            nickname: self.peers.get(packet.sender_id).map(|p| p.nickname).unwrap_or_default(),
            online: false,
        });
    }

    async fn on_message(
        &mut self,
        sender_id: [u8; 8],
        recipient_id: Option<[u8; 8]>,
        payload: &[u8],
        signature: Option<[u8; 64]>,
    ) {
        // §3: a signature covers the payload bytes exactly as they
        // appear on the wire. `payload` here is already decompressed
        // (by `Packet::decode`, or by fragment reassembly), so verify
        // against its wire-exact form rather than the plaintext —
        // deterministically reproduced by re-running the same
        // compression heuristic the sender signed.
        let wire_payload = prepare_wire_payload(payload).0;

        match recipient_id {
            None => {
                if let Some(signature) = signature {
                    if self.keys.has_session_key(sender_id) && !self.keys.verify(&wire_payload, &signature, sender_id) {
                        warn!("dropping broadcast with bad signature from {}", hex::encode(sender_id));
                        return;
                    }
                }
                self.deliver_record(sender_id, payload, false);
            }
            Some(recipient_id) if recipient_id == self.own_peer_id => {
                let Some(signature) = signature else {
                    warn!("dropping unsigned private message from {}", hex::encode(sender_id));
                    return;
                };
                if !self.keys.verify(&wire_payload, &signature, sender_id) {
                    warn!("dropping private message with bad signature from {}", hex::encode(sender_id));
                    return;
                }
                let Ok(padded) = self.keys.decrypt(payload, sender_id) else {
                    warn!("dropping private message we could not decrypt from {}", hex::encode(sender_id));
                    return;
                };
                let record_bytes = crate::codec::pad::unpad(&padded);
                self.deliver_record(sender_id, &record_bytes, true);
            }
            Some(_) => {
                // Addressed to a third party: we have no key, only relay.
            }
        }
    }

    fn deliver_record(&mut self, sender_id: [u8; 8], record_bytes: &[u8], is_private: bool) {
        let record = match MessageRecord::decode(record_bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!("dropping malformed message record from {}: {e}", hex::encode(sender_id));
                return;
            }
        };
        let content = String::from_utf8_lossy(&record.content).into_owned();
        self.emit_event(NodeEvent::Message {
            sender_id,
            sender_nickname: record.sender_nickname,
            content,
            is_private,
            channel: record.channel,
        });
    }

    async fn on_fragment(&mut self, packet: &Packet) {
        let is_end = packet.packet_type == PacketType::FragmentEnd;
        let Ok((id, index, chunk, end_is_compressed, end_signature)) =
            decode_fragment_payload(&packet.payload, is_end)
        else {
            warn!("dropping malformed fragment from {}", hex::encode(packet.sender_id));
            return;
        };
        let Some((reassembled, is_compressed, signature)) = self.fragments.accept(
            packet.sender_id,
            id,
            index,
            chunk,
            is_end,
            end_is_compressed,
            end_signature,
        ) else {
            return;
        };
        match decode_wire_payload(&reassembled, is_compressed) {
            Ok(payload) => {
                self.on_message(packet.sender_id, packet.recipient_id, &payload, signature).await;
            }
            Err(e) => warn!(
                "dropping reassembled message with bad compression framing from {}: {e}",
                hex::encode(packet.sender_id)
            ),
        }
    }

    async fn handle_send_request(&mut self, request: SendRequest) {
        match request {
            SendRequest::Broadcast { text, ack } => {
                let result = self.send_broadcast(text).await;
                let _ = ack.send(result);
            }
            SendRequest::Private { peer_id, text, ack } => {
                let result = self.send_private(peer_id, text).await;
                let _ = ack.send(result);
            }
            SendRequest::Channel { name, text, ack } => {
                let result = self.send_channel(name, text).await;
                let _ = ack.send(result);
            }
            SendRequest::JoinChannel { name, ack } => {
                self.joined_channels.insert(name);
                let _ = ack.send(Ok(()));
            }
            SendRequest::LeaveChannel { name, ack } => {
                self.joined_channels.remove(&name);
                let _ = ack.send(Ok(()));
            }
            SendRequest::Leave { ack } => {
                let result = self.broadcast_leave().await;
                let _ = ack.send(result);
            }
        }
    }

    async fn send_broadcast(&mut self, text: String) -> FacadeResult<()> {
        let mut record = MessageRecord::new(random_id(), self.own_nickname.clone(), text.into_bytes());
        record.timestamp_ms = now_ms();
        let record_bytes = record.encode()?;
        let (wire_payload, is_compressed) = prepare_wire_payload(&record_bytes);
        let signature = self.keys.sign(&wire_payload);
        let mut packet = Packet::new(PacketType::Message, self.own_peer_id, wire_payload).with_signature(signature);
        packet.is_compressed = is_compressed;
        self.emit_packet(&packet).await
    }

    async fn send_channel(&mut self, name: String, text: String) -> FacadeResult<()> {
        let mut record = MessageRecord::new(random_id(), self.own_nickname.clone(), text.into_bytes());
        record.timestamp_ms = now_ms();
        record.channel = Some(name);
        let record_bytes = record.encode()?;
        let (wire_payload, is_compressed) = prepare_wire_payload(&record_bytes);
        let signature = self.keys.sign(&wire_payload);
        let mut packet = Packet::new(PacketType::Message, self.own_peer_id, wire_payload).with_signature(signature);
        packet.is_compressed = is_compressed;
        self.emit_packet(&packet).await
    }

    async fn send_private(&mut self, peer_id: [u8; 8], text: String) -> FacadeResult<()> {
        if !self.keys.has_session_key(peer_id) {
            self.send_key_exchange(peer_id).await;
            return Err(FacadeError::Encryption(CryptoError::NoSharedSecret));
        }

        let mut record = MessageRecord::new(random_id(), self.own_nickname.clone(), text.into_bytes());
        record.timestamp_ms = now_ms();
        record.is_private = true;
        record.is_encrypted = true;
        record.sender_peer_id = Some(hex::encode(self.own_peer_id));
        if let Some(peer) = self.peers.get(peer_id) {
            if !peer.nickname.is_empty() {
                record.recipient_nickname = Some(peer.nickname);
            }
        }
        let record_bytes = record.encode()?;

        let target = crate::codec::pad::optimal_block_size(record_bytes.len());
        let padded = crate::codec::pad::pad(&record_bytes, target);
        let ciphertext = self.keys.encrypt(&padded, peer_id)?;

        let online = self.peers.get(peer_id).map(|p| p.online).unwrap_or(false);
        let (wire_payload, is_compressed) = prepare_wire_payload(&ciphertext);
        let signature = self.keys.sign(&wire_payload);
        let mut packet = Packet::new(PacketType::Message, self.own_peer_id, wire_payload)
            .with_recipient(peer_id)
            .with_signature(signature);
        packet.is_compressed = is_compressed;

        if online {
            self.emit_packet(&packet).await
        } else {
            let favorite = self.peers.get(peer_id).map(|p| p.is_favorite).unwrap_or(false);
            let class = if favorite { RetentionClass::Favorites } else { RetentionClass::Regular };
            self.store_forward.enqueue(
                peer_id,
                class,
                StoredMessage::new(
                    random_id(),
                    self.own_peer_id,
                    Some(peer_id),
                    None,
                    ciphertext,
                    now_ms(),
                    true,
                    true,
                ),
            );
            Ok(())
        }
    }
}
