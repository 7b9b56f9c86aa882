//! The driver contract (§6.3) the coordinator depends on: anything
//! that can move bytes between peers, whether a real BLE radio or an
//! in-memory stand-in used by tests.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Something the coordinator learns about a neighbor through the
/// transport, independent of any packet content.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer came within range. `digest` is the manufacturer-data
    /// public-key digest when the platform exposes one.
    PeerDiscovered {
        peer_id: [u8; 8],
        digest: Option<[u8; 32]>,
        rssi: Option<i16>,
    },
    /// Raw bytes arrived from `peer_id` (already de-fragmented at the
    /// link layer, if the transport does that itself; the wire
    /// payload is still an encoded packet).
    BytesReceived { peer_id: [u8; 8], bytes: Vec<u8> },
    /// A previously discovered peer dropped out of range or
    /// disconnected.
    PeerLost { peer_id: [u8; 8] },
}

/// The contract a transport driver satisfies for the coordinator.
///
/// Object-safe and `async_trait`-annotated so a real `btleplug`-backed
/// implementation and an in-memory loopback used only in tests can
/// both be handed to the same coordinator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts the driver's background work (scanning, advertising,
    /// connection management) and begins delivering [`TransportEvent`]s
    /// on `events`. Returns once the driver is up and listening, not
    /// once it stops.
    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> anyhow::Result<()>;

    /// Stops all background work and releases any underlying radio
    /// resources.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Sends `bytes` to `peer_id`, or broadcasts to every connected
    /// neighbor when `peer_id` is `None`.
    async fn emit(&self, peer_id: Option<[u8; 8]>, bytes: Vec<u8>) -> anyhow::Result<()>;
}
