//! # Session Identity Keys
//!
//! Every ClaimJoin session begins with a fresh X25519 keypair. The public
//! half is the identifier a node is known by for the duration of the
//! session — it appears in envelopes, the routing table, and the roster.
//! It is deliberately *not* the node's long-term network identity: a new
//! key per session means a claim observed on-chain cannot be linked back
//! to a Lightning node id by anyone who only saw the coordination traffic.
//!
//! X25519 rather than a signing curve because the only thing these keys do
//! is Diffie-Hellman for the sealed channel (see [`super::ecies`]). There
//! are no protocol signatures to make.
//!
//! ## Security considerations
//!
//! - Secret keys come from `OsRng` and are persisted only through the
//!   dedicated snapshot path, never through `Debug` or `Display`.
//! - Key bytes are never logged. If you add logging to this module,
//!   you will be asked to leave.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::config::SESSION_KEY_LENGTH;

/// Errors that can occur during key handling.
///
/// Deliberately vague about *why* something failed — leaking details about
/// key material through error messages is a classic footgun.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes: wrong length")]
    InvalidSecretKey,

    #[error("invalid session public key: wrong length or malformed encoding")]
    InvalidPublicKey,
}

/// The X25519 keypair identifying this node within one ClaimJoin session.
///
/// Regenerated every time a node starts or joins a session, and persisted
/// (via [`secret_bytes`](Self::secret_bytes)) so a restart resumes with the
/// same identity. Discarded on session end.
pub struct SessionKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

/// The public half of a session identity, safe to share with the world.
///
/// This is what peers route by, encrypt to, and list in rosters. 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPublicKey {
    bytes: [u8; SESSION_KEY_LENGTH],
}

impl SessionKeypair {
    /// Generate a fresh keypair from the OS cryptographic RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct a keypair from raw 32-byte secret key material, e.g.
    /// loaded from the session snapshot after a restart.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; SESSION_KEY_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        let secret = StaticSecret::from(arr);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// The public key peers know this session by.
    pub fn public_key(&self) -> SessionPublicKey {
        SessionPublicKey {
            bytes: self.public.to_bytes(),
        }
    }

    /// Export the raw secret key for the session snapshot.
    ///
    /// **Handle with care.** Whoever holds these bytes can read every
    /// coordination message addressed to this session.
    pub fn secret_bytes(&self) -> [u8; SESSION_KEY_LENGTH] {
        self.secret.to_bytes()
    }

    /// Diffie-Hellman against a peer's public key. Used by the ECIES
    /// decryption path; the encryption path uses a one-shot ephemeral key
    /// instead.
    pub(crate) fn diffie_hellman(&self, peer: &SessionPublicKey) -> SharedSecret {
        self.secret.diffie_hellman(&PublicKey::from(peer.bytes))
    }
}

impl Clone for SessionKeypair {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret.clone(),
            public: self.public,
        }
    }
}

impl fmt::Debug for SessionKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret material, not even "partially".
        write!(f, "SessionKeypair(pub={})", self.public_key().short())
    }
}

// ---------------------------------------------------------------------------
// SessionPublicKey
// ---------------------------------------------------------------------------

impl SessionPublicKey {
    /// Wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LENGTH]) -> Self {
        Self { bytes }
    }

    /// Length-checked construction from a byte slice.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; SESSION_KEY_LENGTH] =
            slice.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.bytes
    }

    /// Hex encoding — the transport-agnostic form that crosses process
    /// boundaries (store keys, status lines, host UIs).
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Parse a hex-encoded session key.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::try_from_slice(&bytes)
    }

    /// First eight hex characters, for log lines where the full 64 would
    /// drown the message.
    pub fn short(&self) -> String {
        hex::encode(&self.bytes[..4])
    }
}

impl Hash for SessionPublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Display for SessionPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for SessionPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionPublicKey({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_distinct_keys() {
        let a = SessionKeypair::generate();
        let b = SessionKeypair::generate();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn secret_bytes_roundtrip() {
        let kp = SessionKeypair::generate();
        let restored = SessionKeypair::from_secret_bytes(&kp.secret_bytes()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_from_secret_bytes_rejects_wrong_length() {
        assert!(SessionKeypair::from_secret_bytes(&[0u8; 16]).is_err());
        assert!(SessionKeypair::from_secret_bytes(&[0u8; 33]).is_err());
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let pk = SessionKeypair::generate().public_key();
        let recovered = SessionPublicKey::from_hex(&pk.to_hex()).unwrap();
        assert_eq!(pk, recovered);
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!(SessionPublicKey::from_hex("deadbeef").is_err());
        assert!(SessionPublicKey::from_hex("not-hex-at-all").is_err());
    }

    #[test]
    fn test_dh_is_symmetric() {
        let a = SessionKeypair::generate();
        let b = SessionKeypair::generate();
        let ab = a.diffie_hellman(&b.public_key());
        let ba = b.diffie_hellman(&a.public_key());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let kp = SessionKeypair::generate();
        let debug_str = format!("{:?}", kp);
        assert!(debug_str.starts_with("SessionKeypair(pub="));
        assert!(!debug_str.contains(&hex::encode(kp.secret_bytes())));
    }
}
