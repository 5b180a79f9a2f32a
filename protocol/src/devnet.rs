//! # Devnet Harness
//!
//! In-memory implementations of every external contract in [`crate::rpc`],
//! faithful enough to run a complete multi-party ClaimJoin without a
//! Bitcoin node, a Liquid node, or a Lightning node in sight. The
//! integration tests and the `claimjoin-node simulate` subcommand both run
//! on top of this module.
//!
//! Components:
//!
//! - [`MemoryHub`] / [`HubEndpoint`] — point-to-point envelope delivery
//!   over an explicit adjacency graph, so relay and flood behavior are
//!   exercised for real (a line topology forces multi-hop routing).
//! - [`MemoryChain`] — a tickable confirmation height plus a registry of
//!   peg-in transactions with raw bytes and inclusion proofs.
//! - [`LiquidHub`] / [`MemoryLiquid`] — a miniature PSET engine with
//!   per-wallet blind/sign ownership, conservation checking at finalize,
//!   deterministic discounted-vsize accounting, and broadcast dedup (a
//!   second broadcast of the same txid reports "already in chain").
//! - [`MemoryStore`] — the durable store as a hash map.
//! - [`MemoryClock`] — a hand-cranked clock for deterministic cooldown and
//!   tie-break tests.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::rpc::{
    BroadcastOutcome, ChainError, ChainFacts, Clock, CreatePsetRequest, FinalTx, LiquidError,
    LiquidService, PeerDirectory, PeerId, PeerTransport, PsetAnalysis, PsetInputInfo, PsetOutput,
    PsetOutputInfo, PsetSummary, Store, StoreError, TransportError,
};
use crate::session::party::PeginContext;
use crate::wire::Envelope;

// ---------------------------------------------------------------------------
// MemoryClock
// ---------------------------------------------------------------------------

/// A clock that moves when told to. Cooldowns and timestamp tie-breaks
/// become deterministic instead of flaky.
#[derive(Debug)]
pub struct MemoryClock {
    now_ms: AtomicU64,
}

impl MemoryClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for MemoryClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// The durable store, minus the durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn save(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.data
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .data
            .lock()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        if let Some(ns) = self.data.lock().get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .data
            .lock()
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// MemoryHub (peer transport + directory)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct HubInner {
    mailboxes: DashMap<PeerId, VecDeque<(PeerId, Vec<u8>)>>,
    links: Mutex<HashMap<PeerId, Vec<PeerId>>>,
}

/// A message switch between named peers. Delivery is queued, not instant:
/// envelopes sit in the receiver's mailbox until the harness drains it,
/// which is exactly how an event-driven host behaves. Cloning yields
/// another handle on the same switch.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect two peers bidirectionally.
    pub fn link(&self, a: &str, b: &str) {
        let mut links = self.inner.links.lock();
        links.entry(a.to_string()).or_default().push(b.to_string());
        links.entry(b.to_string()).or_default().push(a.to_string());
        self.inner.mailboxes.entry(a.to_string()).or_default();
        self.inner.mailboxes.entry(b.to_string()).or_default();
    }

    /// This peer's view of the hub.
    pub fn endpoint(&self, me: &str) -> HubEndpoint {
        self.inner.mailboxes.entry(me.to_string()).or_default();
        HubEndpoint {
            hub: self.clone(),
            me: me.to_string(),
        }
    }

    fn neighbors(&self, of: &str) -> Vec<PeerId> {
        self.inner.links.lock().get(of).cloned().unwrap_or_default()
    }
}

/// One peer's handle: outbound sends, the peer directory, and the inbound
/// mailbox.
#[derive(Debug, Clone)]
pub struct HubEndpoint {
    hub: MemoryHub,
    me: PeerId,
}

impl HubEndpoint {
    /// Drain every queued envelope: `(delivering_peer, envelope)` pairs.
    /// Undecodable mailbox entries are dropped, mirroring a transport that
    /// hands the host garbage.
    pub fn drain(&self) -> Vec<(PeerId, Envelope)> {
        let mut out = Vec::new();
        if let Some(mut mailbox) = self.hub.inner.mailboxes.get_mut(&self.me) {
            while let Some((from, bytes)) = mailbox.pop_front() {
                if let Ok(envelope) = Envelope::decode(&bytes) {
                    out.push((from, envelope));
                }
            }
        }
        out
    }

    /// Whether anything is waiting.
    pub fn has_mail(&self) -> bool {
        self.hub
            .inner
            .mailboxes
            .get(&self.me)
            .map(|m| !m.is_empty())
            .unwrap_or(false)
    }
}

impl PeerTransport for HubEndpoint {
    fn send(&self, peer: &PeerId, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.hub.neighbors(&self.me).contains(peer) {
            return Err(TransportError::PeerUnavailable(peer.clone()));
        }
        let bytes = envelope
            .encode()
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.hub
            .inner
            .mailboxes
            .entry(peer.clone())
            .or_default()
            .push_back((self.me.clone(), bytes));
        Ok(())
    }
}

impl PeerDirectory for HubEndpoint {
    fn list_connected_peers(&self) -> Vec<PeerId> {
        self.hub.neighbors(&self.me)
    }
}

// ---------------------------------------------------------------------------
// MemoryChain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PeginRecord {
    raw_tx: Vec<u8>,
    proof: Vec<u8>,
    vout: u32,
    amount_sats: u64,
}

/// The Bitcoin chain view: a height and a registry of peg-ins.
#[derive(Debug, Default)]
pub struct MemoryChain {
    height: AtomicU32,
    pegins: Mutex<HashMap<String, PeginRecord>>,
}

impl MemoryChain {
    pub fn new(height: u32) -> Self {
        Self {
            height: AtomicU32::new(height),
            pegins: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::SeqCst);
    }

    /// Mine one block.
    pub fn tick(&self) -> u32 {
        self.height.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a peg-in so lookups and proofs work. Returns the raw
    /// transaction bytes the "chain" fabricated for it.
    pub fn register_pegin(&self, pegin: &PeginContext) -> Vec<u8> {
        let raw_tx = bincode::serialize(&(&pegin.txid, pegin.vout, pegin.amount_sats))
            .expect("serializing a tuple cannot fail");
        let proof = blake3::hash(&raw_tx).as_bytes().to_vec();
        self.pegins.lock().insert(
            pegin.txid.clone(),
            PeginRecord {
                raw_tx: raw_tx.clone(),
                proof,
                vout: pegin.vout,
                amount_sats: pegin.amount_sats,
            },
        );
        raw_tx
    }

    /// Simulate a reorg refreshing a peg-in's proof bytes.
    pub fn rotate_proof(&self, txid: &str) {
        let mut pegins = self.pegins.lock();
        if let Some(record) = pegins.get_mut(txid) {
            let mut salted = record.proof.clone();
            salted.push(0x01);
            record.proof = blake3::hash(&salted).as_bytes().to_vec();
        }
    }
}

impl ChainFacts for MemoryChain {
    fn current_confirmation_height(&self) -> Result<u32, ChainError> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, ChainError> {
        self.pegins
            .lock()
            .get(txid)
            .map(|r| r.raw_tx.clone())
            .ok_or_else(|| ChainError::TxNotFound(txid.to_string()))
    }

    fn get_inclusion_proof(&self, txid: &str) -> Result<Vec<u8>, ChainError> {
        self.pegins
            .lock()
            .get(txid)
            .map(|r| r.proof.clone())
            .ok_or_else(|| ChainError::ProofUnavailable(txid.to_string()))
    }

    fn find_output_index(&self, raw_tx: &[u8], amount_sats: u64) -> Result<u32, ChainError> {
        self.pegins
            .lock()
            .values()
            .find(|r| r.raw_tx == raw_tx && r.amount_sats == amount_sats)
            .map(|r| r.vout)
            .ok_or(ChainError::OutputNotFound)
    }
}

// ---------------------------------------------------------------------------
// MemoryLiquid
// ---------------------------------------------------------------------------

/// Serialized draft format of the miniature PSET engine. Private to the
/// harness; the protocol only ever sees opaque bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FakePset {
    inputs: Vec<FakeInput>,
    outputs: Vec<FakeOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FakeInput {
    pegin_txid: String,
    pegin_vout: u32,
    claim_script: String,
    amount_sats: u64,
    signed_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FakeOutput {
    /// Destination address; `None` for fee and data outputs.
    address: Option<String>,
    amount_sats: u64,
    is_fee: bool,
    is_data: bool,
    blinded: bool,
}

/// Deterministic discounted-vsize model: a base plus per-element costs,
/// with peg-in witnesses dominating — close enough in shape to the real
/// thing for the fee-convergence loop to behave realistically.
fn discounted_vsize(pset: &FakePset) -> u64 {
    let destinations = pset
        .outputs
        .iter()
        .filter(|o| !o.is_fee && !o.is_data)
        .count() as u64;
    let data = pset.outputs.iter().filter(|o| o.is_data).count() as u64;
    40 + 275 * pset.inputs.len() as u64 + 90 * destinations + 10 + 15 * data
}

#[derive(Debug)]
struct WalletInfo {
    claim_script: String,
    confidential: String,
    unconfidential: String,
}

/// Shared Liquid "network": wallet registry and broadcast set.
#[derive(Debug, Default)]
pub struct LiquidWorld {
    wallets: Mutex<HashMap<String, WalletInfo>>,
    broadcasts: Mutex<HashMap<String, Vec<u8>>>,
}

/// Handle on the shared world, used to mint per-wallet service instances.
#[derive(Debug, Clone, Default)]
pub struct LiquidHub {
    world: Arc<LiquidWorld>,
}

impl LiquidHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The service instance scoped to `name`'s wallet, creating the wallet
    /// (claim script + address pair) on first use.
    pub fn wallet(&self, name: &str) -> MemoryLiquid {
        self.world.ensure_wallet(name);
        MemoryLiquid {
            world: Arc::clone(&self.world),
            wallet: name.to_string(),
        }
    }

    /// Raw bytes of a broadcast transaction, if any, by txid.
    pub fn broadcast_raw(&self, txid: &str) -> Option<Vec<u8>> {
        self.world.broadcasts.lock().get(txid).cloned()
    }

    /// Txids of every broadcast transaction.
    pub fn broadcast_txids(&self) -> Vec<String> {
        self.world.broadcasts.lock().keys().cloned().collect()
    }

    /// Number of transactions broadcast so far.
    pub fn broadcast_count(&self) -> usize {
        self.world.broadcasts.lock().len()
    }
}

impl LiquidWorld {
    fn ensure_wallet(&self, name: &str) {
        let mut wallets = self.wallets.lock();
        wallets.entry(name.to_string()).or_insert_with(|| WalletInfo {
            claim_script: format!("0014{}", hex::encode(name.as_bytes())),
            confidential: format!("lq1qq{}", name),
            unconfidential: format!("ex1q{}", name),
        });
    }

    fn address_owner(&self, address: &str) -> Option<String> {
        self.wallets
            .lock()
            .iter()
            .find(|(_, info)| info.confidential == address || info.unconfidential == address)
            .map(|(name, _)| name.clone())
    }

    fn script_owner(&self, claim_script: &str) -> Option<String> {
        self.wallets
            .lock()
            .iter()
            .find(|(_, info)| info.claim_script == claim_script)
            .map(|(name, _)| name.clone())
    }
}

/// The Liquid service scoped to one wallet.
#[derive(Debug, Clone)]
pub struct MemoryLiquid {
    world: Arc<LiquidWorld>,
    wallet: String,
}

impl MemoryLiquid {
    /// A fresh world with this one wallet in it. Convenience for tests
    /// that start from a single node.
    pub fn shared() -> LiquidHub {
        LiquidHub::new()
    }

    /// Another wallet's service instance in the same world.
    pub fn world_wallet(&self, name: &str) -> MemoryLiquid {
        self.world.ensure_wallet(name);
        MemoryLiquid {
            world: Arc::clone(&self.world),
            wallet: name.to_string(),
        }
    }

    /// The shared world handle.
    pub fn world(&self) -> LiquidHub {
        LiquidHub {
            world: Arc::clone(&self.world),
        }
    }

    /// This wallet's claim script.
    pub fn claim_script(&self) -> String {
        self.info(|i| i.claim_script.clone())
    }

    /// This wallet's confidential address.
    pub fn confidential_address(&self) -> String {
        self.info(|i| i.confidential.clone())
    }

    fn info<T>(&self, f: impl FnOnce(&WalletInfo) -> T) -> T {
        let wallets = self.world.wallets.lock();
        f(wallets.get(&self.wallet).expect("wallet registered"))
    }

    fn parse(pset: &[u8]) -> Result<FakePset, LiquidError> {
        bincode::deserialize(pset).map_err(|e| LiquidError::MalformedPset(e.to_string()))
    }

    fn serialize(pset: &FakePset) -> Vec<u8> {
        bincode::serialize(pset).expect("serializing the draft cannot fail")
    }

    fn txid_of(raw_tx: &[u8]) -> String {
        hex::encode(blake3::hash(raw_tx).as_bytes())
    }

    // -- adversarial test helpers ---------------------------------------

    /// A copy of the draft with its last output removed. For tests that
    /// need a counterpart mangling the structure.
    pub fn test_drop_last_output(&self, pset: &[u8]) -> Vec<u8> {
        let mut parsed = Self::parse(pset).expect("test draft parses");
        parsed.outputs.pop();
        Self::serialize(&parsed)
    }

    /// A copy of the draft with `delta` sats shaved off the destination
    /// output paying `address`. For fee-stealing tests.
    pub fn test_cut_destination(&self, pset: &[u8], address: &str, delta: u64) -> Vec<u8> {
        let mut parsed = Self::parse(pset).expect("test draft parses");
        for output in &mut parsed.outputs {
            if output.address.as_deref() == Some(address) {
                output.amount_sats = output.amount_sats.saturating_sub(delta);
            }
        }
        Self::serialize(&parsed)
    }
}

impl LiquidService for MemoryLiquid {
    fn create_pset(&self, request: &CreatePsetRequest) -> Result<Vec<u8>, LiquidError> {
        if request.inputs.is_empty() {
            return Err(LiquidError::MalformedPset("no inputs".to_string()));
        }
        let inputs = request
            .inputs
            .iter()
            .map(|i| FakeInput {
                pegin_txid: i.pegin_txid.clone(),
                pegin_vout: i.pegin_vout,
                claim_script: i.claim_script.clone(),
                amount_sats: i.amount_sats,
                signed_by: None,
            })
            .collect();
        let outputs = request
            .outputs
            .iter()
            .map(|o| match o {
                PsetOutput::Destination { address, amount_sats } => FakeOutput {
                    address: Some(address.clone()),
                    amount_sats: *amount_sats,
                    is_fee: false,
                    is_data: false,
                    blinded: false,
                },
                PsetOutput::Fee { amount_sats } => FakeOutput {
                    address: None,
                    amount_sats: *amount_sats,
                    is_fee: true,
                    is_data: false,
                    blinded: true,
                },
                PsetOutput::Data { .. } => FakeOutput {
                    address: None,
                    amount_sats: 0,
                    is_fee: false,
                    is_data: true,
                    blinded: true,
                },
            })
            .collect();
        Ok(Self::serialize(&FakePset { inputs, outputs }))
    }

    fn decode_pset(&self, pset: &[u8]) -> Result<PsetSummary, LiquidError> {
        let parsed = Self::parse(pset)?;
        Ok(PsetSummary {
            inputs: parsed
                .inputs
                .iter()
                .map(|i| PsetInputInfo {
                    pegin_txid: i.pegin_txid.clone(),
                    pegin_vout: i.pegin_vout,
                    claim_script: i.claim_script.clone(),
                    amount_sats: i.amount_sats,
                    signed: i.signed_by.is_some(),
                })
                .collect(),
            outputs: parsed
                .outputs
                .iter()
                .map(|o| PsetOutputInfo {
                    address: o.address.clone(),
                    amount_sats: o.amount_sats,
                    is_fee: o.is_fee,
                    is_data: o.is_data,
                    blinded: o.blinded,
                })
                .collect(),
        })
    }

    fn analyze_pset(&self, pset: &[u8]) -> Result<PsetAnalysis, LiquidError> {
        let parsed = Self::parse(pset)?;
        Ok(PsetAnalysis {
            inputs_signed: parsed.inputs.iter().map(|i| i.signed_by.is_some()).collect(),
            outputs_blinded: parsed.outputs.iter().map(|o| o.blinded).collect(),
        })
    }

    fn process_pset(&self, pset: &[u8]) -> Result<Vec<u8>, LiquidError> {
        let mut parsed = Self::parse(pset)?;

        // Blind our own pending outputs.
        for output in &mut parsed.outputs {
            if output.blinded {
                continue;
            }
            let Some(address) = output.address.as_deref() else {
                continue;
            };
            if self.world.address_owner(address).as_deref() == Some(&self.wallet) {
                output.blinded = true;
            }
        }

        // A wallet cannot produce a valid signature until every output is
        // committed; with blinding complete, sign our own inputs.
        if parsed.outputs.iter().all(|o| o.blinded) {
            for input in &mut parsed.inputs {
                if input.signed_by.is_none()
                    && self.world.script_owner(&input.claim_script).as_deref()
                        == Some(&self.wallet)
                {
                    input.signed_by = Some(self.wallet.clone());
                }
            }
        }

        Ok(Self::serialize(&parsed))
    }

    fn finalize_pset(&self, pset: &[u8]) -> Result<Vec<u8>, LiquidError> {
        let parsed = Self::parse(pset)?;
        if !parsed.outputs.iter().all(|o| o.blinded) {
            return Err(LiquidError::NotFinalizable("unblinded outputs".to_string()));
        }
        if !parsed.inputs.iter().all(|i| i.signed_by.is_some()) {
            return Err(LiquidError::NotFinalizable("unsigned inputs".to_string()));
        }
        let in_total: u64 = parsed.inputs.iter().map(|i| i.amount_sats).sum();
        let out_total: u64 = parsed.outputs.iter().map(|o| o.amount_sats).sum();
        if in_total != out_total {
            return Err(LiquidError::NotFinalizable(format!(
                "unbalanced: {} in, {} out",
                in_total, out_total
            )));
        }
        // The "raw transaction" is just the settled draft re-serialized.
        Ok(Self::serialize(&parsed))
    }

    fn decode_final_tx(&self, raw_tx: &[u8]) -> Result<FinalTx, LiquidError> {
        let parsed = Self::parse(raw_tx)?;
        let fee_sats = parsed
            .outputs
            .iter()
            .find(|o| o.is_fee)
            .map(|o| o.amount_sats)
            .unwrap_or(0);
        Ok(FinalTx {
            txid: Self::txid_of(raw_tx),
            discounted_vsize: discounted_vsize(&parsed),
            fee_sats,
        })
    }

    fn broadcast(&self, raw_tx: &[u8]) -> Result<BroadcastOutcome, LiquidError> {
        // Refuse obvious garbage like a real node would.
        Self::parse(raw_tx)?;
        let txid = Self::txid_of(raw_tx);
        let mut broadcasts = self.world.broadcasts.lock();
        if broadcasts.contains_key(&txid) {
            return Ok(BroadcastOutcome::AlreadyInChain);
        }
        broadcasts.insert(txid.clone(), raw_tx.to_vec());
        Ok(BroadcastOutcome::Accepted { txid })
    }

    fn unconfidential(&self, address: &str) -> Result<String, LiquidError> {
        let wallets = self.world.wallets.lock();
        for info in wallets.values() {
            if info.confidential == address || info.unconfidential == address {
                return Ok(info.unconfidential.clone());
            }
        }
        Err(LiquidError::UnknownAddress(address.to_string()))
    }
}
