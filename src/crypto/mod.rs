//! Cryptographic primitives: X25519 key agreement, HKDF-SHA256
//! derivation, AES-256-GCM authenticated encryption, and Ed25519
//! signatures (§4.3).

pub mod identity;
pub mod store;

pub use identity::SessionIdentity;
pub use store::{KeyStore, PeerKeys};
