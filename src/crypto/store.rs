//! Per-peer key bookkeeping: deriving and holding the AES-256-GCM
//! session key negotiated with each peer, and the primitives
//! (encrypt/decrypt/sign/verify) built on top of it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::PublicKey;

use crate::error::{CryptoError, CryptoResult};

use super::identity::SessionIdentity;

/// HKDF salt fixed by the protocol (see glossary: "Session key").
const HKDF_SALT: &[u8] = b"bitchat-v1";
const NONCE_LEN: usize = 12;

/// The three public subkeys recorded for a peer once its
/// `KEY_EXCHANGE` packet has been processed, plus the symmetric key
/// this node derived for talking to it.
#[derive(Clone)]
pub struct PeerKeys {
    pub x25519_public: [u8; 32],
    pub signing_public: [u8; 32],
    pub identity_public: [u8; 32],
    derived_key: [u8; 32],
}

/// Holds this node's own ephemeral [`SessionIdentity`] plus every
/// peer's negotiated keys. Constructed once per running session;
/// replacing it (as `Node::stop`/`start` do) wipes all prior key
/// material.
pub struct KeyStore {
    own: RwLock<SessionIdentity>,
    peers: DashMap<[u8; 8], PeerKeys>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            own: RwLock::new(SessionIdentity::generate()),
            peers: DashMap::new(),
        }
    }

    /// Replaces the own session identity and clears every peer's
    /// derived key, as happens on `Node::stop()` followed by a later
    /// `start()`.
    pub fn reset(&self) {
        *self.own.write() = SessionIdentity::generate();
        self.peers.clear();
    }

    pub fn own_combined_public(&self) -> [u8; 96] {
        self.own.read().combined_public()
    }

    pub fn own_fingerprint(&self) -> String {
        self.own.read().fingerprint()
    }

    pub fn has_session_key(&self, peer_id: [u8; 8]) -> bool {
        self.peers.contains_key(&peer_id)
    }

    /// Slices a peer's 96-byte combined public key into its three
    /// subkeys, runs X25519 agreement against our own secret, and
    /// derives the AES-256-GCM key via HKDF-SHA256. A peer that
    /// already has a derived key keeps it — repeated `KEY_EXCHANGE`
    /// packets from the same sender never rotate an established key.
    pub fn add_peer_key(&self, peer_id: [u8; 8], combined_public: &[u8; 96]) -> CryptoResult<()> {
        if self.peers.contains_key(&peer_id) {
            return Ok(());
        }

        let mut x25519_public = [0u8; 32];
        x25519_public.copy_from_slice(&combined_public[0..32]);
        let mut signing_public = [0u8; 32];
        signing_public.copy_from_slice(&combined_public[32..64]);
        let mut identity_public = [0u8; 32];
        identity_public.copy_from_slice(&combined_public[64..96]);

        let peer_x25519 = PublicKey::from(x25519_public);
        let shared_secret = self.own.read().x25519_secret().diffie_hellman(&peer_x25519);

        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret.as_bytes());
        let mut derived_key = [0u8; 32];
        hkdf.expand(&[], &mut derived_key)
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;

        self.peers.insert(
            peer_id,
            PeerKeys {
                x25519_public,
                signing_public,
                identity_public,
                derived_key,
            },
        );
        Ok(())
    }

    /// Encrypts `plaintext` under the session key shared with
    /// `peer_id`, returning `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8], peer_id: [u8; 8]) -> CryptoResult<Vec<u8>> {
        let peer = self.peers.get(&peer_id).ok_or(CryptoError::NoSharedSecret)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&peer.derived_key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Reverses [`KeyStore::encrypt`]. Fails `DecryptionFailed` on a
    /// too-short input, a wrong key, or an authentication tag
    /// mismatch — never panics on hostile input.
    pub fn decrypt(&self, data: &[u8], peer_id: [u8; 8]) -> CryptoResult<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let peer = self.peers.get(&peer_id).ok_or(CryptoError::NoSharedSecret)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&peer.derived_key));

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Signs `bytes` with this node's own Ed25519 signing key.
    pub fn sign(&self, bytes: &[u8]) -> [u8; 64] {
        use ed25519_dalek::Signer;
        self.own.read().signing_key().sign(bytes).to_bytes()
    }

    /// Verifies `signature` over `bytes` against `peer_id`'s signing
    /// public key. An unknown peer verifies as `false` rather than
    /// erroring — a hostile or not-yet-handshaken neighbor must never
    /// be able to crash the verifier.
    pub fn verify(&self, bytes: &[u8], signature: &[u8; 64], peer_id: [u8; 8]) -> bool {
        let Some(peer) = self.peers.get(&peer_id) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&peer.signing_public) else {
            return false;
        };
        let signature = Signature::from_bytes(signature);
        verifying_key.verify(bytes, &signature).is_ok()
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(a: &KeyStore, a_id: [u8; 8], b: &KeyStore, b_id: [u8; 8]) {
        a.add_peer_key(b_id, &b.own_combined_public()).unwrap();
        b.add_peer_key(a_id, &a.own_combined_public()).unwrap();
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let a = KeyStore::new();
        let b = KeyStore::new();
        handshake(&a, *b"AAAAAAAA", &b, *b"BBBBBBBB");

        let ciphertext = a.encrypt(b"secret", *b"BBBBBBBB").unwrap();
        let plaintext = b.decrypt(&ciphertext, *b"AAAAAAAA").unwrap();
        assert_eq!(plaintext, b"secret");
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let a = KeyStore::new();
        let b = KeyStore::new();
        let c = KeyStore::new();
        handshake(&a, *b"AAAAAAAA", &b, *b"BBBBBBBB");
        handshake(&a, *b"AAAAAAAA", &c, *b"CCCCCCCC");

        let ciphertext = a.encrypt(b"secret", *b"BBBBBBBB").unwrap();
        // C never shares A's secret for this conversation from A's
        // perspective keyed on B, so using C's store under A's id fails.
        assert!(c.decrypt(&ciphertext, *b"AAAAAAAA").is_err());
    }

    #[test]
    fn encrypt_without_handshake_fails() {
        let a = KeyStore::new();
        assert!(matches!(
            a.encrypt(b"hi", *b"BBBBBBBB"),
            Err(CryptoError::NoSharedSecret)
        ));
    }

    #[test]
    fn sign_then_verify_succeeds_only_for_matching_key() {
        let a = KeyStore::new();
        let b = KeyStore::new();
        handshake(&a, *b"AAAAAAAA", &b, *b"BBBBBBBB");

        let signature = a.sign(b"hello mesh");
        assert!(b.verify(b"hello mesh", &signature, *b"AAAAAAAA"));
        assert!(!b.verify(b"tampered", &signature, *b"AAAAAAAA"));
    }

    #[test]
    fn verify_against_unknown_peer_is_false_not_a_panic() {
        let a = KeyStore::new();
        let signature = a.sign(b"hello");
        assert!(!a.verify(b"hello", &signature, *b"ZZZZZZZZ"));
    }

    #[test]
    fn repeated_key_exchange_does_not_rotate_established_key() {
        let a = KeyStore::new();
        let b = KeyStore::new();
        handshake(&a, *b"AAAAAAAA", &b, *b"BBBBBBBB");

        let before = a.encrypt(b"first", *b"BBBBBBBB").unwrap();
        // A second, different peer keypair under the same peer_id must
        // not replace the already-established key.
        let impostor = KeyStore::new();
        a.add_peer_key(*b"BBBBBBBB", &impostor.own_combined_public()).unwrap();

        let after = b.decrypt(&before, *b"AAAAAAAA");
        assert!(after.is_ok(), "original key should still be in effect");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn encrypt_then_decrypt_round_trips_for_arbitrary_plaintext(
                plaintext in proptest::collection::vec(any::<u8>(), 0..500),
            ) {
                let a = KeyStore::new();
                let b = KeyStore::new();
                handshake(&a, *b"AAAAAAAA", &b, *b"BBBBBBBB");

                let ciphertext = a.encrypt(&plaintext, *b"BBBBBBBB").unwrap();
                let decrypted = b.decrypt(&ciphertext, *b"AAAAAAAA").unwrap();
                prop_assert_eq!(decrypted, plaintext);
            }

            #[test]
            fn decrypt_never_panics_on_arbitrary_bytes(
                data in proptest::collection::vec(any::<u8>(), 0..300),
            ) {
                let a = KeyStore::new();
                let b = KeyStore::new();
                handshake(&a, *b"AAAAAAAA", &b, *b"BBBBBBBB");
                let _ = b.decrypt(&data, *b"AAAAAAAA");
            }
        }
    }
}
