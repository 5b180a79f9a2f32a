//! # External Service Contracts
//!
//! ClaimJoin consumes four external systems — the Lightning peer transport,
//! the Bitcoin chain view, the Liquid wallet/transaction service, and a
//! durable key-value store — and produces nothing beyond its own wire
//! format. This module defines those boundaries as narrow traits with
//! strongly-typed request/response structs.
//!
//! The traits stay synchronous: the session state has a single logical
//! owner and every mutation happens inside one message or tick callback.
//! Hosts that talk to their nodes over async RPC block inside their trait
//! impls; the protocol core neither knows nor cares.
//!
//! Like the rest of the crate, nothing here performs I/O itself — real
//! implementations live in the host process, and in-memory stand-ins for
//! tests and simulation live in [`crate::devnet`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wire::Envelope;

/// Stable network identity of a directly connected peer (for Lightning,
/// the remote node id). Distinct from the per-session public key.
pub type PeerId = String;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure to hand an envelope to the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    PeerUnavailable(PeerId),

    #[error("transport rejected the message: {0}")]
    Rejected(String),
}

/// Failure querying the Bitcoin chain view.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("transaction {0} not found")]
    TxNotFound(String),

    #[error("no inclusion proof available for {0}")]
    ProofUnavailable(String),

    #[error("no output of the expected amount in the raw transaction")]
    OutputNotFound,

    #[error("chain backend error: {0}")]
    Backend(String),
}

/// Failure in the Liquid wallet/transaction service.
#[derive(Debug, Error)]
pub enum LiquidError {
    #[error("malformed PSET: {0}")]
    MalformedPset(String),

    #[error("PSET is not ready to finalize: {0}")]
    NotFinalizable(String),

    #[error("transaction rejected by the network: {0}")]
    BroadcastRejected(String),

    #[error("unknown address {0}")]
    UnknownAddress(String),

    #[error("liquid backend error: {0}")]
    Backend(String),
}

/// Failure in the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("corrupt value under {namespace}/{key}")]
    Corrupt { namespace: String, key: String },
}

// ---------------------------------------------------------------------------
// Peer Transport & Directory
// ---------------------------------------------------------------------------

/// Point-to-point authenticated delivery to a directly connected peer.
///
/// Inbound delivery is a callback the host wires to
/// [`crate::coordinator::ClaimCoordinator::on_envelope`]; the trait only
/// covers the outbound half.
pub trait PeerTransport {
    /// Deliver one envelope to one directly connected peer.
    fn send(&self, peer: &PeerId, envelope: &Envelope) -> Result<(), TransportError>;
}

/// Enumeration of currently connected peers, used when flooding
/// announcements.
pub trait PeerDirectory {
    fn list_connected_peers(&self) -> Vec<PeerId>;
}

// ---------------------------------------------------------------------------
// Chain Facts
// ---------------------------------------------------------------------------

/// Read-only view of the Bitcoin chain, scoped to exactly what peg-in
/// claims need.
pub trait ChainFacts {
    /// Current confirmation height as seen by the Bitcoin node.
    fn current_confirmation_height(&self) -> Result<u32, ChainError>;

    /// Raw serialized transaction bytes for a txid.
    fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, ChainError>;

    /// Merkle inclusion proof for a confirmed transaction. Proofs go stale
    /// when blocks are pruned or reorganized, so callers re-fetch rather
    /// than cache.
    fn get_inclusion_proof(&self, txid: &str) -> Result<Vec<u8>, ChainError>;

    /// Index of the output carrying `amount_sats` within a raw transaction.
    fn find_output_index(&self, raw_tx: &[u8], amount_sats: u64) -> Result<u32, ChainError>;
}

// ---------------------------------------------------------------------------
// Liquid Transaction Service
// ---------------------------------------------------------------------------

/// One input of a claim draft: the peg-in being swept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsetInput {
    /// Bitcoin txid of the peg-in transaction.
    pub pegin_txid: String,
    /// Output index of the peg-in within that transaction.
    pub pegin_vout: u32,
    /// Hex-encoded claim script committing to the destination.
    pub claim_script: String,
    /// Raw peg-in transaction bytes.
    pub raw_tx: Vec<u8>,
    /// Merkle inclusion proof for the peg-in.
    pub proof: Vec<u8>,
    /// Peg-in amount in satoshis.
    pub amount_sats: u64,
}

/// One output of a claim draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PsetOutput {
    /// A party's destination: a confidential address and its share.
    Destination { address: String, amount_sats: u64 },
    /// The explicit fee output Liquid transactions carry.
    Fee { amount_sats: u64 },
    /// A data (OP_RETURN) output with a fixed payload.
    Data { script_hex: String },
}

/// Request to assemble a fresh unsigned, unblinded claim draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePsetRequest {
    pub inputs: Vec<PsetInput>,
    pub outputs: Vec<PsetOutput>,
}

/// Structural view of a draft, as decoded by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsetSummary {
    pub inputs: Vec<PsetInputInfo>,
    pub outputs: Vec<PsetOutputInfo>,
}

/// Decoded state of one draft input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsetInputInfo {
    pub pegin_txid: String,
    pub pegin_vout: u32,
    pub claim_script: String,
    pub amount_sats: u64,
    pub signed: bool,
}

/// Decoded state of one draft output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsetOutputInfo {
    /// Confidential destination address; `None` for fee and data outputs.
    pub address: Option<String>,
    pub amount_sats: u64,
    pub is_fee: bool,
    pub is_data: bool,
    /// Whether this output's amount/asset are already hidden under
    /// commitments. Fee and data outputs are always explicit and report
    /// `true` here so progress scans can skip them.
    pub blinded: bool,
}

impl PsetSummary {
    /// Outputs that require blinding (destinations), in blinder-index
    /// (ascending output) order.
    pub fn blindable_outputs(&self) -> impl Iterator<Item = (usize, &PsetOutputInfo)> {
        self.outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| !o.is_fee && !o.is_data)
    }
}

/// Progress view of a draft: which steps remain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsetAnalysis {
    /// Per-input signature status, in input order.
    pub inputs_signed: Vec<bool>,
    /// Per-output blinding status, in output order. Fee/data outputs are
    /// reported as blinded (nothing to do).
    pub outputs_blinded: Vec<bool>,
}

impl PsetAnalysis {
    pub fn fully_blinded(&self) -> bool {
        self.outputs_blinded.iter().all(|b| *b)
    }

    pub fn fully_signed(&self) -> bool {
        self.inputs_signed.iter().all(|s| *s)
    }
}

/// A finalized transaction, decoded for fee accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalTx {
    pub txid: String,
    /// Weight metric with the confidential-data discount applied; the
    /// basis of Liquid fee calculation.
    pub discounted_vsize: u64,
    /// Fee actually paid by the explicit fee output.
    pub fee_sats: u64,
}

/// Result of handing a finalized transaction to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// Accepted into the mempool.
    Accepted { txid: String },
    /// The node already knows this transaction from the chain. Treated as
    /// success by callers — somebody beat us to the broadcast, which is
    /// exactly the outcome we wanted.
    AlreadyInChain,
}

/// The Liquid wallet/transaction service, scoped to one wallet. Blinding
/// and signing act on whatever pieces of the draft this wallet owns.
pub trait LiquidService {
    /// Assemble a fresh draft from typed inputs/outputs.
    fn create_pset(&self, request: &CreatePsetRequest) -> Result<Vec<u8>, LiquidError>;

    /// Decode a draft's structure.
    fn decode_pset(&self, pset: &[u8]) -> Result<PsetSummary, LiquidError>;

    /// Report blinding/signing progress.
    fn analyze_pset(&self, pset: &[u8]) -> Result<PsetAnalysis, LiquidError>;

    /// Blind this wallet's pending outputs; once every output in the draft
    /// is blinded, also sign this wallet's inputs. Returns the updated
    /// draft.
    fn process_pset(&self, pset: &[u8]) -> Result<Vec<u8>, LiquidError>;

    /// Extract the final raw transaction from a fully blinded and signed
    /// draft.
    fn finalize_pset(&self, pset: &[u8]) -> Result<Vec<u8>, LiquidError>;

    /// Decode a finalized transaction: txid, discounted vsize, fee.
    fn decode_final_tx(&self, raw_tx: &[u8]) -> Result<FinalTx, LiquidError>;

    /// Submit the finalized transaction to the network.
    fn broadcast(&self, raw_tx: &[u8]) -> Result<BroadcastOutcome, LiquidError>;

    /// Resolve a confidential address to its unconfidential form, for
    /// output-ownership comparison.
    fn unconfidential(&self, address: &str) -> Result<String, LiquidError>;
}

// ---------------------------------------------------------------------------
// Durable Store
// ---------------------------------------------------------------------------

/// Namespaced durable key-value storage. Every session mutation is written
/// through this before or after the network action that triggered it, so a
/// crash mid-protocol resumes from the last committed step.
pub trait Store {
    fn save(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
    /// All keys currently present in a namespace.
    fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError>;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for envelope timestamps, resend cooldowns, and the
/// initiator-collision tie-break. A trait so tests and the simulator can
/// drive time deterministically.
pub trait Clock {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time. What production uses.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }
}
