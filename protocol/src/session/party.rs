//! One participant's contribution to a batched claim.
//!
//! A `ClaimParty` is what travels inside `add` and `confirm_add`
//! coordination messages and what the initiator keeps one of per roster
//! slot. Everything in it is consensus-relevant for the draft build except
//! the delivery bookkeeping at the bottom, which exists so the initiator
//! can tell a slow peer from a dead one.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::SessionPublicKey;

/// The host-provided description of this node's own pending peg-in.
///
/// Where these values come from (wallet RPC, saved swap state) is the
/// host's business; the protocol only needs the claim ingredients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeginContext {
    /// Bitcoin txid of the peg-in transaction.
    pub txid: String,
    /// Output index of the peg-in within that transaction.
    pub vout: u32,
    /// Hex-encoded claim script.
    pub claim_script: String,
    /// Confidential Liquid address the claimed funds should land on.
    pub destination_address: String,
    /// Bitcoin confirmation height at which the peg-in becomes claimable.
    pub claimable_height: u32,
    /// Peg-in amount in satoshis.
    pub amount_sats: u64,
}

/// One participant of a ClaimJoin roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimParty {
    /// Bitcoin txid of the party's peg-in.
    pub pegin_txid: String,
    /// Output index of the peg-in.
    pub pegin_vout: u32,
    /// Hex-encoded claim script. Unique within a roster — two parties with
    /// the same script would be the same peg-in.
    pub claim_script: String,
    /// The party's confidential destination address.
    pub destination_address: String,
    /// Height at which this peg-in becomes claimable.
    pub claimable_height: u32,
    /// Raw peg-in transaction bytes.
    pub raw_tx: Vec<u8>,
    /// Merkle inclusion proof for the peg-in.
    pub proof: Vec<u8>,
    /// Claimed amount in satoshis.
    pub amount_sats: u64,
    /// This party's share of the claim fee, assigned by the initiator for
    /// the current draft. Zero until a draft exists.
    pub fee_share_sats: u64,
    /// The party's session public key.
    pub pubkey: SessionPublicKey,

    // --- delivery bookkeeping -------------------------------------------
    /// Sends of the current outstanding request with no reply yet.
    /// Zero when nothing is owed.
    pub sent_count: u32,
    /// When the outstanding request was last handed to the transport
    /// (ms since epoch). Zero if never.
    pub last_sent_ms: u64,
}

impl ClaimParty {
    /// Build a roster entry from a local peg-in plus the chain artifacts
    /// the other parties will need to validate and spend it.
    pub fn from_pegin(
        pegin: &PeginContext,
        raw_tx: Vec<u8>,
        proof: Vec<u8>,
        pubkey: SessionPublicKey,
    ) -> Self {
        Self {
            pegin_txid: pegin.txid.clone(),
            pegin_vout: pegin.vout,
            claim_script: pegin.claim_script.clone(),
            destination_address: pegin.destination_address.clone(),
            claimable_height: pegin.claimable_height,
            raw_tx,
            proof,
            amount_sats: pegin.amount_sats,
            fee_share_sats: 0,
            pubkey,
            sent_count: 0,
            last_sent_ms: 0,
        }
    }

    /// The amount this party's destination output should carry under the
    /// current fee split.
    pub fn expected_output_sats(&self) -> u64 {
        self.amount_sats.saturating_sub(self.fee_share_sats)
    }

    /// Record that the outstanding request was (re)sent now.
    pub fn note_sent(&mut self, now_ms: u64) {
        self.sent_count += 1;
        self.last_sent_ms = now_ms;
    }

    /// A reply of any kind settles the outstanding request.
    pub fn note_reply(&mut self) {
        self.sent_count = 0;
        self.last_sent_ms = 0;
    }

    /// Strip delivery bookkeeping for embedding in a coordination message.
    /// Counters are local observations, not protocol state.
    pub fn for_wire(&self) -> Self {
        Self {
            sent_count: 0,
            last_sent_ms: 0,
            ..self.clone()
        }
    }
}
