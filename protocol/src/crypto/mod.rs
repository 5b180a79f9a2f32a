//! # Cryptography Module
//!
//! The two primitives ClaimJoin needs and nothing else:
//!
//! - **keys** — the per-session X25519 identity keypair. The public half is
//!   the session identifier peers exchange; the private half never leaves
//!   the node.
//! - **ecies** — the sealed point-to-point channel: ephemeral ECDH per
//!   message, HKDF-SHA256 key derivation, AES-256-GCM payload encryption.
//!
//! Everything rides on audited implementations (`x25519-dalek`, `hkdf`,
//! `aes-gcm`). No hand-rolled primitives here, ever.

pub mod ecies;
pub mod keys;

pub use ecies::{decrypt, encrypt, EciesError};
pub use keys::{KeyError, SessionKeypair, SessionPublicKey};
