//! `bitchat-core`: the protocol engine behind a peer-to-peer mesh chat
//! node — binary packet codec, X25519/Ed25519/AES-256-GCM handshake
//! and session keys, the inner message record format, the TTL/dedup
//! relay state machine, and the peer lifecycle, all driven from a
//! transport-agnostic [`Transport`] the caller supplies.
//!
//! The BLE transport, UI, chat-history persistence, configuration
//! loading, and OS permission prompts are external collaborators this
//! crate does not implement — see [`transport`] for the boundary it
//! consumes instead.

pub mod bluetooth;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod dedup;
pub mod error;
pub mod fragment;
pub mod node;
pub mod peer;
pub mod status;
pub mod store_forward;
pub mod transport;

pub use config::NodeConfig;
pub use coordinator::NodeEvent;
pub use error::{FacadeError, FacadeResult};
pub use node::Node;
pub use status::Status;
pub use transport::{Transport, TransportEvent};
