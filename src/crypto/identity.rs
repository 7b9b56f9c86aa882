//! A node's own ephemeral key material for one running session.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Own ephemeral keys generated fresh at session start: an X25519 pair
/// for key agreement, an Ed25519 pair for signing outgoing messages,
/// and a second Ed25519 pair serving as a longer-lived identity
/// (its public half is what [`SessionIdentity::fingerprint`] hashes).
///
/// All three private keys are wiped on drop so they do not linger in
/// freed memory past `stop()`.
pub struct SessionIdentity {
    x25519_secret: StaticSecret,
    x25519_public: PublicKey,
    signing_key: SigningKey,
    identity_key: SigningKey,
}

impl SessionIdentity {
    pub fn generate() -> Self {
        let x25519_secret = StaticSecret::random_from_rng(OsRng);
        let x25519_public = PublicKey::from(&x25519_secret);
        let signing_key = SigningKey::generate(&mut OsRng);
        let identity_key = SigningKey::generate(&mut OsRng);

        Self {
            x25519_secret,
            x25519_public,
            signing_key,
            identity_key,
        }
    }

    pub fn x25519_secret(&self) -> &StaticSecret {
        &self.x25519_secret
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// The 96-byte combined public key advertised to peers:
    /// `x25519_pub || ed25519_signing_pub || identity_pub`.
    pub fn combined_public(&self) -> [u8; 96] {
        let mut out = [0u8; 96];
        out[0..32].copy_from_slice(self.x25519_public.as_bytes());
        out[32..64].copy_from_slice(self.signing_key.verifying_key().as_bytes());
        out[64..96].copy_from_slice(self.identity_key.verifying_key().as_bytes());
        out
    }

    pub fn identity_public(&self) -> VerifyingKey {
        self.identity_key.verifying_key()
    }

    /// Hex-encoded SHA-256 digest of the identity public key, used as
    /// a human-verifiable fingerprint.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(self.identity_key.verifying_key().as_bytes());
        hex::encode(digest)
    }
}

impl Drop for SessionIdentity {
    fn drop(&mut self) {
        let mut scalar_bytes = self.x25519_secret.to_bytes();
        scalar_bytes.zeroize();
        let mut signing_bytes = self.signing_key.to_bytes();
        signing_bytes.zeroize();
        let mut identity_bytes = self.identity_key.to_bytes();
        identity_bytes.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_public_is_96_bytes_of_the_three_subkeys() {
        let identity = SessionIdentity::generate();
        let combined = identity.combined_public();
        assert_eq!(&combined[0..32], x25519_dalek::PublicKey::from(&identity.x25519_secret).as_bytes());
        assert_eq!(&combined[32..64], identity.signing_key.verifying_key().as_bytes());
        assert_eq!(&combined[64..96], identity.identity_key.verifying_key().as_bytes());
    }

    #[test]
    fn fingerprint_is_stable_for_the_same_identity() {
        let identity = SessionIdentity::generate();
        assert_eq!(identity.fingerprint(), identity.fingerprint());
    }
}
