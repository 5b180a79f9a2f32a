//! # Sealed Coordination Channel (ECIES)
//!
//! Point-to-point encryption between two session public keys, carried over
//! an untrusted relay mesh. Any peer on the path can read the envelope
//! headers (it has to, to route), but only the holder of the destination
//! secret key can open the payload.
//!
//! ## Construction
//!
//! Classic ECIES with one-shot keys:
//!
//! 1. Generate a fresh ephemeral X25519 keypair for this message.
//! 2. ECDH the ephemeral secret against the receiver's session public key.
//! 3. Run the shared secret through HKDF-SHA256 (no salt, no info) to get
//!    a uniform 256-bit AES key. Raw DH output is a curve point with
//!    algebraic structure — never key a cipher with it directly.
//! 4. Seal the plaintext with AES-256-GCM under a random 96-bit nonce.
//!
//! ## Wire format
//!
//! ```text
//! ephemeral_pubkey (32) || nonce (12) || aead_ciphertext (len + 16)
//! ```
//!
//! Decryption reverses the steps with the receiver's static secret. Every
//! failure mode — short input, degenerate ephemeral point, authentication
//! failure — comes back as an [`EciesError`]. The caller drops the message
//! and logs; retrying the same ciphertext can never succeed, so it doesn't.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH, ECIES_OVERHEAD, SESSION_KEY_LENGTH};
use crate::crypto::keys::{SessionKeypair, SessionPublicKey};

/// Errors from the sealed channel.
///
/// Kept coarse on purpose: distinguishing "wrong key" from "tampered
/// ciphertext" tells an attacker more than it tells us.
#[derive(Debug, Error)]
pub enum EciesError {
    #[error("ciphertext too short: need at least {ECIES_OVERHEAD} bytes")]
    CiphertextTooShort,

    #[error("invalid ephemeral public key encoding")]
    InvalidEphemeralKey,

    #[error("key agreement produced a degenerate shared secret")]
    DegenerateSharedSecret,

    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptFailed,
}

/// Seal `plaintext` so that only the holder of `receiver`'s secret key can
/// open it.
///
/// A fresh ephemeral keypair is generated per call, so encrypting the same
/// plaintext twice yields unrelated ciphertexts.
pub fn encrypt(receiver: &SessionPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, EciesError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&PublicKey::from(*receiver.as_bytes()));
    if !shared.was_contributory() {
        // A low-order receiver key collapses the shared secret to a known
        // constant. Refuse to encrypt to it.
        return Err(EciesError::DegenerateSharedSecret);
    }

    let key = derive_key(shared.as_bytes());
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| EciesError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| EciesError::EncryptFailed)?;

    let mut out = Vec::with_capacity(SESSION_KEY_LENGTH + AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(ephemeral_pub.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed message with this session's secret key.
///
/// # Errors
///
/// Fails on truncated input, a degenerate ephemeral key, or any tampering
/// with the ciphertext — GCM authentication covers the whole payload.
pub fn decrypt(keypair: &SessionKeypair, data: &[u8]) -> Result<Vec<u8>, EciesError> {
    if data.len() < ECIES_OVERHEAD {
        return Err(EciesError::CiphertextTooShort);
    }

    let (eph_bytes, rest) = data.split_at(SESSION_KEY_LENGTH);
    let (nonce_bytes, ciphertext) = rest.split_at(AES_NONCE_LENGTH);

    let ephemeral_pub = SessionPublicKey::try_from_slice(eph_bytes)
        .map_err(|_| EciesError::InvalidEphemeralKey)?;

    let shared = keypair.diffie_hellman(&ephemeral_pub);
    if !shared.was_contributory() {
        return Err(EciesError::DegenerateSharedSecret);
    }

    let key = derive_key(shared.as_bytes());
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| EciesError::DecryptFailed)?;
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EciesError::DecryptFailed)
}

/// HKDF-SHA256 over the raw shared secret, no salt, no info — the extract
/// step alone makes the output uniform; domain separation comes from the
/// keys only ever being used for this one channel.
fn derive_key(shared_secret: &[u8; 32]) -> [u8; AES_KEY_LENGTH] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; AES_KEY_LENGTH];
    // Expanding 32 bytes out of SHA-256-based HKDF cannot fail.
    hk.expand(&[], &mut key)
        .expect("HKDF expand of one block is infallible");
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let receiver = SessionKeypair::generate();
        let plaintext = b"two inputs, three outputs, one fee";

        let sealed = encrypt(&receiver.public_key(), plaintext).unwrap();
        let recovered = decrypt(&receiver, &sealed).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_empty_plaintext() {
        let receiver = SessionKeypair::generate();
        let sealed = encrypt(&receiver.public_key(), b"").unwrap();
        assert_eq!(sealed.len(), ECIES_OVERHEAD);
        assert!(decrypt(&receiver, &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_receiver_fails() {
        let receiver = SessionKeypair::generate();
        let eavesdropper = SessionKeypair::generate();
        let sealed = encrypt(&receiver.public_key(), b"roster update").unwrap();
        assert!(decrypt(&eavesdropper, &sealed).is_err());
    }

    #[test]
    fn test_tampering_any_byte_fails() {
        // Flip each byte of the sealed message in turn; every position must
        // cause a decryption failure. Covers the ephemeral key, the nonce,
        // the ciphertext body, and the tag.
        let receiver = SessionKeypair::generate();
        let sealed = encrypt(&receiver.public_key(), b"sign input 2").unwrap();

        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(
                decrypt(&receiver, &tampered).is_err(),
                "tampering byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn test_truncated_input_rejected() {
        let receiver = SessionKeypair::generate();
        let sealed = encrypt(&receiver.public_key(), b"x").unwrap();
        assert!(matches!(
            decrypt(&receiver, &sealed[..ECIES_OVERHEAD - 1]),
            Err(EciesError::CiphertextTooShort)
        ));
        assert!(decrypt(&receiver, &[]).is_err());
    }

    #[test]
    fn test_same_plaintext_distinct_ciphertexts() {
        // Fresh ephemeral key + fresh nonce per call: identical messages
        // must not produce identical wire bytes.
        let receiver = SessionKeypair::generate();
        let a = encrypt(&receiver.public_key(), b"repeat").unwrap();
        let b = encrypt(&receiver.public_key(), b"repeat").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_large_payload() {
        // Drafts with ten peg-in inputs run to tens of kilobytes.
        let receiver = SessionKeypair::generate();
        let plaintext = vec![0xAB; 200_000];
        let sealed = encrypt(&receiver.public_key(), &plaintext).unwrap();
        assert_eq!(decrypt(&receiver, &sealed).unwrap(), plaintext);
    }
}
