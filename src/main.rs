//! A minimal command-line driver for `bitchat-core`.
//!
//! This binary exists to exercise the engine end to end against a
//! real Bluetooth LE adapter; it owns none of the protocol logic
//! itself. UI, chat history, and configuration loading remain an
//! external collaborator's job per the crate's scope — this is a
//! thin `tokio` entry point, not a client application.

use std::sync::Arc;

use bitchat_core::{Node, NodeConfig};
use log::{error, info};

fn parse_peer_id(raw: &str) -> anyhow::Result<[u8; 8]> {
    let bytes = raw.as_bytes();
    if bytes.len() != 8 {
        anyhow::bail!("peer id must be exactly 8 bytes, got {}", bytes.len());
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(bytes);
    Ok(id)
}

#[cfg(feature = "ble")]
fn build_transport() -> anyhow::Result<Arc<dyn bitchat_core::Transport>> {
    Ok(Arc::new(bitchat_core::bluetooth::BleTransport::new()?))
}

#[cfg(not(feature = "ble"))]
fn build_transport() -> anyhow::Result<Arc<dyn bitchat_core::Transport>> {
    anyhow::bail!("this binary was built without the \"ble\" feature; no transport driver is available")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let peer_id = args.next().unwrap_or_else(|| "AAAAAAAA".to_string());
    let nickname = args.next().unwrap_or_else(|| "anon".to_string());
    let peer_id = parse_peer_id(&peer_id)?;

    info!("=== bitchat-core: Bluetooth LE mesh chat node ===");
    info!("peer id {peer_id:?}, nickname {nickname}");

    let transport = build_transport()?;
    let node = Node::new(NodeConfig::default(), transport);

    let mut events = match node.start(peer_id, nickname).await {
        Ok(events) => events,
        Err(e) => {
            error!("failed to start node: {e}");
            return Err(e.into());
        }
    };

    info!("node running; press Ctrl-C to stop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                info!("event: {event:?}");
            }
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }

    node.stop().await?;
    Ok(())
}
