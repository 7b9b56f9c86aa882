//! The public facade (§6.4): an owned value constructed with
//! `Node::new(config, transport)`, not a process-wide singleton like
//! the teacher's service layer.

use std::sync::Arc;

use log::info;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::NodeConfig;
use crate::coordinator::{Coordinator, CoordinatorMsg, SendRequest};
use crate::crypto::KeyStore;
use crate::error::{FacadeError, FacadeResult};
use crate::peer::{Peer, PeerTable};
use crate::status::Status;
use crate::transport::{Transport, TransportEvent};

pub use crate::coordinator::NodeEvent;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COORDINATOR_CHANNEL_CAPACITY: usize = 256;
const TRANSPORT_EVENT_CAPACITY: usize = 256;

/// The engine's public entry point. Owns a transport and, once
/// started, the `tokio` task running the mesh coordinator.
///
/// `keys` and `peers` are shared with the coordinator task via `Arc`
/// rather than round-tripped through a channel, so read-only queries
/// like [`Node::peers`] and [`Node::fingerprint`] never block on the
/// event loop.
pub struct Node {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    status: Mutex<Status>,
    coordinator_tx: Mutex<Option<mpsc::Sender<CoordinatorMsg>>>,
    keys: Arc<KeyStore>,
    peers: Arc<PeerTable>,
}

impl Node {
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            status: Mutex::new(Status::Stopped),
            coordinator_tx: Mutex::new(None),
            keys: Arc::new(KeyStore::new()),
            peers: Arc::new(PeerTable::new()),
        }
    }

    pub async fn status(&self) -> Status {
        *self.status.lock().await
    }

    /// Marks the node as initializing. Present for parity with the
    /// documented `init()/start()/stop()` lifecycle; this crate's
    /// `start()` does not require a separate init step, so this is a
    /// no-op transition check.
    pub async fn init(&self) -> FacadeResult<()> {
        let mut status = self.status.lock().await;
        if !status.can_transition_to(Status::Initializing) {
            return Err(FacadeError::NotInitialized);
        }
        *status = Status::Initializing;
        Ok(())
    }

    /// Starts the mesh coordinator and the transport, returning the
    /// receiving half of the event stream. Only permitted from
    /// `Stopped` (§6.5) — a node left in `Error` must be `stop()`-ed
    /// back to `Stopped` before it can be started again.
    pub async fn start(&self, peer_id: [u8; 8], nickname: String) -> FacadeResult<mpsc::Receiver<NodeEvent>> {
        {
            let mut status = self.status.lock().await;
            if !status.can_transition_to(Status::Initializing) {
                return Err(FacadeError::NotInitialized);
            }
            *status = Status::Initializing;
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (transport_events_tx, mut transport_events_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let (coordinator_tx, coordinator_rx) = mpsc::channel(COORDINATOR_CHANNEL_CAPACITY);

        if let Err(e) = self.transport.start(transport_events_tx).await {
            let mut status = self.status.lock().await;
            *status = Status::Error;
            return Err(FacadeError::PermissionDenied(e.to_string()));
        }

        let forward_tx = coordinator_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = transport_events_rx.recv().await {
                if forward_tx.send(CoordinatorMsg::Transport(event)).await.is_err() {
                    break;
                }
            }
        });

        self.keys.reset();
        self.peers.clear();

        let coordinator = Coordinator::new(
            peer_id,
            nickname,
            self.config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.keys),
            Arc::clone(&self.peers),
            events_tx,
        );
        tokio::spawn(coordinator.run(coordinator_rx));

        *self.coordinator_tx.lock().await = Some(coordinator_tx);
        *self.status.lock().await = Status::Running;
        info!("node {} started", hex::encode(peer_id));
        Ok(events_rx)
    }

    /// Stops the node. Permitted from `Running` (the normal case) or
    /// `Error` (§6.5's only way back to `Stopped`, e.g. after a failed
    /// `start()`).
    pub async fn stop(&self) -> FacadeResult<()> {
        let mut status = self.status.lock().await;
        if !status.can_transition_to(Status::Stopped) {
            return Err(FacadeError::NotRunning);
        }

        // Best-effort: tell neighbors we're departing before tearing
        // the coordinator down. A transport already gone silently
        // drops this, same as any other send failure on shutdown.
        let _ = self.send(|ack| SendRequest::Leave { ack }).await;

        *self.coordinator_tx.lock().await = None;
        self.transport.stop().await.map_err(|e| FacadeError::Network(e.to_string()))?;
        self.keys.reset();
        self.peers.clear();
        *status = Status::Stopped;
        Ok(())
    }

    async fn send(&self, request_factory: impl FnOnce(oneshot::Sender<FacadeResult<()>>) -> SendRequest) -> FacadeResult<()> {
        let tx = self.coordinator_tx.lock().await.clone().ok_or(FacadeError::NotRunning)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(request_factory(ack_tx))
            .await
            .map_err(|_| FacadeError::NotRunning)?;
        ack_rx.await.map_err(|_| FacadeError::NotRunning)?
    }

    pub async fn send_broadcast(&self, text: impl Into<String>) -> FacadeResult<()> {
        let text = text.into();
        self.send(|ack| SendRequest::Broadcast { text, ack }).await
    }

    pub async fn send_private(&self, peer_id: [u8; 8], text: impl Into<String>) -> FacadeResult<()> {
        let text = text.into();
        self.send(|ack| SendRequest::Private { peer_id, text, ack }).await
    }

    pub async fn send_channel(&self, name: impl Into<String>, text: impl Into<String>) -> FacadeResult<()> {
        let name = name.into();
        let text = text.into();
        self.send(|ack| SendRequest::Channel { name, text, ack }).await
    }

    pub async fn join_channel(&self, name: impl Into<String>) -> FacadeResult<()> {
        let name = name.into();
        self.send(|ack| SendRequest::JoinChannel { name, ack }).await
    }

    pub async fn leave_channel(&self, name: impl Into<String>) -> FacadeResult<()> {
        let name = name.into();
        self.send(|ack| SendRequest::LeaveChannel { name, ack }).await
    }

    /// A read-only snapshot of every peer currently tracked, for a
    /// caller building a peer list UI. Does not touch the coordinator's
    /// event loop.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.snapshot()
    }

    /// Marks (or unmarks) `peer_id` as a favorite, moving any future
    /// store-and-forward enqueue for it onto the long-retention queue
    /// (§4.8). A higher layer (contacts/favorites UI) owns when this
    /// is called; the engine only acts on the flag it sets.
    pub fn set_favorite(&self, peer_id: [u8; 8], favorite: bool) {
        self.peers.set_favorite(peer_id, favorite);
    }

    /// This session's own identity fingerprint (a hex-encoded SHA-256
    /// digest of the identity public key), stable for as long as the
    /// node stays started.
    pub fn fingerprint(&self) -> String {
        self.keys.own_fingerprint()
    }

    /// A JSON summary of current peers and this node's fingerprint,
    /// for an operator surface to log or display — never the wire
    /// format, which stays the binary codec in [`crate::codec`].
    pub async fn stats_json(&self) -> serde_json::Value {
        let peers: Vec<serde_json::Value> = self
            .peers()
            .into_iter()
            .map(|peer| {
                serde_json::json!({
                    "peerId": hex::encode(peer.peer_id),
                    "nickname": peer.nickname,
                    "online": peer.online,
                    "rssi": peer.rssi,
                    "hasSessionKey": peer.has_session_key,
                })
            })
            .collect();
        serde_json::json!({
            "status": format!("{:?}", self.status().await),
            "fingerprint": self.fingerprint(),
            "peerCount": peers.len(),
            "peers": peers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc as tokio_mpsc;

    // A minimal transport used only to exercise `Node::start`/`stop`
    // lifecycle transitions.
    struct NullTransport {
        started: AtomicBool,
    }

    impl NullTransport {
        fn new() -> Self {
            Self { started: AtomicBool::new(false) }
        }
    }

    #[async_trait::async_trait]
    impl Transport for NullTransport {
        async fn start(&self, _events: tokio_mpsc::Sender<TransportEvent>) -> anyhow::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.started.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn emit(&self, _peer_id: Option<[u8; 8]>, _bytes: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Records every packet handed to `emit`, so a test can inspect
    /// what the coordinator actually put on the wire.
    #[derive(Default)]
    struct RecordingTransport {
        emitted: tokio::sync::Mutex<Vec<(Option<[u8; 8]>, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn start(&self, _events: tokio_mpsc::Sender<TransportEvent>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn emit(&self, peer_id: Option<[u8; 8]>, bytes: Vec<u8>) -> anyhow::Result<()> {
            self.emitted.lock().await.push((peer_id, bytes));
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_broadcasts_a_leave_packet() {
        let transport = Arc::new(RecordingTransport::default());
        let node = Node::new(NodeConfig::default(), transport.clone());
        let _events = node.start(*b"AAAAAAAA", "Alice".into()).await.unwrap();
        node.stop().await.unwrap();

        let emitted = transport.emitted.lock().await;
        let last = emitted.last().expect("at least the leave packet should be emitted");
        let decoded = crate::codec::Packet::decode(&last.1).unwrap();
        assert_eq!(decoded.packet_type, crate::codec::PacketType::Leave);
        assert_eq!(last.0, None);
    }

    #[tokio::test]
    async fn start_then_stop_transitions_status() {
        let node = Node::new(NodeConfig::default(), Arc::new(NullTransport::new()));
        assert_eq!(node.status().await, Status::Stopped);

        let _events = node.start(*b"AAAAAAAA", "Alice".into()).await.unwrap();
        assert_eq!(node.status().await, Status::Running);

        node.stop().await.unwrap();
        assert_eq!(node.status().await, Status::Stopped);
    }

    #[tokio::test]
    async fn send_before_start_fails_not_running() {
        let node = Node::new(NodeConfig::default(), Arc::new(NullTransport::new()));
        assert!(matches!(node.send_broadcast("hi").await, Err(FacadeError::NotRunning)));
    }
}
