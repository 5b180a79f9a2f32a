//! # Wire Format
//!
//! The only protocol-level contract ClaimJoin has with remote peers: the
//! envelope that crosses the peer transport, and the coordination message
//! sealed inside it.
//!
//! Envelopes are bincode-encoded. Headers (memo, sender, destination,
//! timestamp) travel in the clear because relays need them to route; the
//! payload is either an ECIES ciphertext (`Process`), a bincode
//! [`Announcement`] (`Broadcast`), the unreachable destination key
//! (`Unable`), or a plaintext peg-in txid (`Poll`).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::WIRE_PROTOCOL_VERSION;
use crate::crypto::keys::SessionPublicKey;
use crate::session::party::ClaimParty;

/// Errors turning messages into bytes and back.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("unsupported wire version {0} (this node speaks {WIRE_PROTOCOL_VERSION})")]
    UnsupportedVersion(u16),
}

// ---------------------------------------------------------------------------
// Memo
// ---------------------------------------------------------------------------

/// What kind of traffic an envelope carries, visible to relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Memo {
    /// Session start/end announcement, flooded to every connected peer.
    Broadcast,
    /// Point-to-point encrypted coordination, relayed toward its
    /// destination key.
    Process,
    /// Relay failure notice: the destination of a previous envelope is
    /// unknown to the peer that sent this.
    Unable,
    /// Liveness probe from a party that has lost contact with its
    /// initiator. Payload is the plaintext peg-in txid.
    Poll,
}

impl fmt::Display for Memo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => write!(f, "broadcast"),
            Self::Process => write!(f, "process"),
            Self::Unable => write!(f, "unable"),
            Self::Poll => write!(f, "poll"),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The unit of transport between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Wire protocol version. Envelopes with an unknown version are
    /// dropped, not guessed at.
    pub version: u16,
    /// Traffic kind.
    pub memo: Memo,
    /// Sender's session public key.
    pub sender: SessionPublicKey,
    /// Destination session key; `None` for broadcasts.
    pub destination: Option<SessionPublicKey>,
    /// Creation time, ms since epoch. The initiator-collision tie-break
    /// compares these, so senders stamp honestly or lose the tie-break
    /// games they try to play.
    pub timestamp_ms: u64,
    /// Contextual number. Session-start broadcasts carry the join deadline
    /// height here; everything else leaves it zero.
    pub amount: u64,
    /// Opaque payload; interpretation depends on `memo`.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// A flooded announcement (no destination).
    pub fn broadcast(
        sender: SessionPublicKey,
        timestamp_ms: u64,
        amount: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: WIRE_PROTOCOL_VERSION,
            memo: Memo::Broadcast,
            sender,
            destination: None,
            timestamp_ms,
            amount,
            payload,
        }
    }

    /// A point-to-point envelope of the given kind.
    pub fn directed(
        memo: Memo,
        sender: SessionPublicKey,
        destination: SessionPublicKey,
        timestamp_ms: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: WIRE_PROTOCOL_VERSION,
            memo,
            sender,
            destination: Some(destination),
            timestamp_ms,
            amount: 0,
            payload,
        }
    }

    /// Serialize for the transport.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        bincode::serialize(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Parse bytes from the transport, rejecting unknown versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let envelope: Envelope =
            bincode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))?;
        if envelope.version != WIRE_PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }

    /// Short content fingerprint for log lines.
    pub fn fingerprint(&self) -> String {
        let bytes = bincode::serialize(self).unwrap_or_default();
        hex::encode(&blake3::hash(&bytes).as_bytes()[..4])
    }
}

// ---------------------------------------------------------------------------
// Announcement
// ---------------------------------------------------------------------------

/// Payload of a `Broadcast` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Announcement {
    /// A session opened. The envelope's `amount` carries the join deadline
    /// height.
    Started,
    /// A session closed. `txid` names the broadcast claim on success and
    /// is empty on failure; `reason` is human-readable either way.
    Ended { txid: String, reason: String },
}

impl Announcement {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        bincode::serialize(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        bincode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Coordination
// ---------------------------------------------------------------------------

/// The membership/orchestration verbs sealed inside `Process` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinationAction {
    /// Candidate asks the initiator for a roster slot.
    Add,
    /// Initiator admits the candidate (also used for roster status
    /// updates to existing members).
    ConfirmAdd,
    /// Initiator declines the candidate, with a reason in `status`.
    RefuseAdd,
    /// A joiner removes itself from the session.
    Remove,
    /// Process the attached draft: blind your pending output, or sign your
    /// input once everything is blinded. Also the action on the reply
    /// carrying the processed draft back.
    Process,
    /// Like `Process`, but the sender knows your blind completes the set:
    /// blind and immediately sign in one round trip.
    Process2,
}

impl fmt::Display for CoordinationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::ConfirmAdd => write!(f, "confirm_add"),
            Self::RefuseAdd => write!(f, "refuse_add"),
            Self::Remove => write!(f, "remove"),
            Self::Process => write!(f, "process"),
            Self::Process2 => write!(f, "process2"),
        }
    }
}

/// A coordination message between two session members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordination {
    /// What the sender wants.
    pub action: CoordinationAction,
    /// Party descriptor: the candidate on `Add`, the recipient's own
    /// updated entry (fee share included) on `ConfirmAdd` and
    /// delegations.
    pub joiner: Option<ClaimParty>,
    /// The session's current claim height as the sender knows it.
    pub claim_block_height: u32,
    /// Human-readable status/reason line.
    pub status: String,
    /// Serialized draft, present on delegations and their replies.
    pub pset: Option<Vec<u8>>,
}

impl Coordination {
    /// A bare coordination message with no party descriptor or draft.
    pub fn new(action: CoordinationAction, claim_block_height: u32, status: impl Into<String>) -> Self {
        Self {
            action,
            joiner: None,
            claim_block_height,
            status: status.into(),
            pset: None,
        }
    }

    pub fn with_joiner(mut self, joiner: ClaimParty) -> Self {
        self.joiner = Some(joiner);
        self
    }

    pub fn with_pset(mut self, pset: Vec<u8>) -> Self {
        self.pset = Some(pset);
        self
    }

    /// Serialize for sealing into an envelope payload.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        bincode::serialize(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Parse a decrypted envelope payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        bincode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }
}
