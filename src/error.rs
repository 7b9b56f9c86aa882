//! Typed error enums for each fallible boundary in the engine.
//!
//! Internal layers (codec, crypto) return their own narrow `thiserror`
//! enums. The facade composes them into [`FacadeError`], which is the
//! only error type a caller of the public API ever has to match on;
//! callers that don't care about the specific variant can wrap it in
//! `anyhow::Error` instead.

use thiserror::Error;

/// Errors from encoding/decoding the outer packet or the inner message
/// record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("input too short to contain a packet header")]
    Truncated,
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("declared length does not match available bytes")]
    BadLength,
    #[error("reserved flag bits set")]
    ReservedFlag,
    #[error("failed to decompress payload")]
    DecompressFailed,
    #[error("failed to encode: {0}")]
    Encode(String),
    #[error("malformed message record: {0}")]
    BadRecord(String),
}

/// Errors from the crypto primitives layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no shared secret established with this peer")]
    NoSharedSecret,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("signature verification failed")]
    SignatureFailed,
    #[error("invalid key material")]
    InvalidKeyMaterial,
}

/// Errors surfaced at the public facade.
#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("node has not been initialized")]
    NotInitialized,
    #[error("node is not running")]
    NotRunning,
    #[error("transport refused to start: {0}")]
    PermissionDenied(String),
    #[error("invalid peer id: {0}")]
    InvalidPeer(String),
    #[error("message too large: {size} bytes exceeds the {budget}-byte MTU budget")]
    MessageTooLarge { size: usize, budget: usize },
    #[error("encryption failed: {0}")]
    Encryption(#[from] CryptoError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("transport error: {0}")]
    Network(String),
}

pub type CodecResult<T> = Result<T, CodecError>;
pub type CryptoResult<T> = Result<T, CryptoError>;
pub type FacadeResult<T> = Result<T, FacadeError>;
