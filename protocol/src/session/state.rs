//! # Session State
//!
//! The owned aggregate for everything this node knows about its current
//! ClaimJoin. One instance per node, mutated only from message-arrival and
//! block-tick callbacks, persisted as a single bincode snapshot around
//! every network action.
//!
//! The role and per-round progress are explicit typed state; the status
//! string is write-only display for the host UI and never branched on.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::config::{JOIN_HEIGHT_OFFSET, KEY_SNAPSHOT, MAX_PARTIES, NS_SESSION};
use crate::crypto::keys::SessionPublicKey;
use crate::rpc::{Store, StoreError};
use crate::session::party::ClaimParty;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// This node's part in the current session.
///
/// Transitions: `None → Initiator` on local roster creation;
/// `None → Joiner` on an accepted `confirm_add`; anything `→ None` on
/// session end, refusal, removal, or irrecoverable failure. `None` is the
/// terminal/reset state and the only state a fresh node can be in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Not part of any session.
    #[default]
    None,
    /// Coordinating a session: owns the roster and drives construction.
    Initiator,
    /// Committed member of someone else's session.
    Joiner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Initiator => write!(f, "initiator"),
            Self::Joiner => write!(f, "joiner"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons a candidate cannot enter the roster.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("roster is full ({MAX_PARTIES} parties)")]
    Full,

    #[error("claim script already present in the roster")]
    DuplicateScript,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// All session state owned by one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// This node's role.
    pub role: Role,
    /// Earliest height at which the joint claim becomes valid: the max of
    /// the roster's claimable heights.
    pub claim_block_height: u32,
    /// Deadline after which no new joiner is admitted. One block before
    /// the claim height.
    pub join_block_height: u32,
    /// Human-readable progress line for the host UI. Derived display only.
    pub status: String,
    /// The roster. Index 0 is self for an initiator; a joiner holds only
    /// its own entry.
    pub parties: Vec<ClaimParty>,
    /// The in-progress serialized claim draft, if one exists.
    pub claim_pset: Option<Vec<u8>>,
    /// Join attempts made in this node's lifetime as a candidate. Bounded
    /// by `MAX_JOIN_ATTEMPTS`.
    pub join_counter: u32,
    /// Full draft rebuilds within the current claim attempt (fee
    /// convergence). Bounded by `MAX_REBUILDS`.
    pub rebuild_counter: u32,
    /// Total fee the current draft targets. Replaced by the exact figure
    /// once a finalized transaction reveals its discounted vsize.
    pub target_fee_sats: u64,
    /// When this node announced (or agreed to join) the session, ms since
    /// epoch. The initiator-collision tie-break compares these.
    pub started_at_ms: u64,
    /// The initiator's session key, from a joiner's (or candidate's) point
    /// of view. `None` while idle and for the initiator itself.
    pub initiator: Option<SessionPublicKey>,
    /// Last time anything arrived from the initiator (ms since epoch).
    /// Drives the liveness poll.
    pub last_heard_ms: u64,
}

impl Session {
    /// A fresh idle session. Role `None`, everything zeroed.
    pub fn new() -> Self {
        Self {
            status: "idle".to_string(),
            ..Default::default()
        }
    }

    /// Reset to the idle state. Safe to call at any time, any number of
    /// times — resetting an already-idle session is a no-op that yields
    /// the identical idle state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Whether this node is currently part of (or coordinating) a session.
    pub fn is_active(&self) -> bool {
        self.role != Role::None
    }

    // -- lifecycle -----------------------------------------------------------

    /// Become the initiator of a new session with self as the first roster
    /// entry.
    pub fn begin_initiator(&mut self, self_party: ClaimParty, now_ms: u64) {
        self.reset();
        self.role = Role::Initiator;
        self.parties = vec![self_party];
        self.started_at_ms = now_ms;
        self.recompute_heights();
        self.set_status("initiated session, waiting for joiners");
    }

    /// Record that we asked to join `initiator`'s session with
    /// `self_entry` as our candidate descriptor. Role stays `None` until
    /// the `confirm_add` arrives; the entry is kept so the confirmation
    /// can be validated against what we actually offered, and the
    /// session's announcement timestamp so a competing start can be
    /// compared against it.
    pub fn note_join_requested(
        &mut self,
        initiator: SessionPublicKey,
        self_entry: ClaimParty,
        announced_at_ms: u64,
        now_ms: u64,
    ) {
        self.initiator = Some(initiator);
        self.parties = vec![self_entry];
        self.join_counter += 1;
        self.started_at_ms = announced_at_ms;
        self.last_heard_ms = now_ms;
        self.set_status("requested to join session");
    }

    /// Accepted: become a joiner. `self_entry` is our own roster entry as
    /// the initiator sees it (fee share included).
    pub fn become_joiner(
        &mut self,
        initiator: SessionPublicKey,
        self_entry: ClaimParty,
        claim_block_height: u32,
        now_ms: u64,
    ) {
        self.role = Role::Joiner;
        self.initiator = Some(initiator);
        self.parties = vec![self_entry];
        self.claim_block_height = claim_block_height;
        self.join_block_height = claim_block_height.saturating_sub(JOIN_HEIGHT_OFFSET);
        self.started_at_ms = now_ms;
        self.last_heard_ms = now_ms;
        self.set_status("joined session");
    }

    // -- roster --------------------------------------------------------------

    /// Admit a candidate. Enforces the size cap and claim-script
    /// uniqueness, then raises the claim height to cover the newcomer.
    pub fn add_party(&mut self, party: ClaimParty) -> Result<(), RosterError> {
        if self.parties.len() >= MAX_PARTIES {
            return Err(RosterError::Full);
        }
        if self
            .parties
            .iter()
            .any(|p| p.claim_script == party.claim_script)
        {
            return Err(RosterError::DuplicateScript);
        }
        self.parties.push(party);
        self.recompute_heights();
        Ok(())
    }

    /// Erase a party, recompute heights over the remainder, and invalidate
    /// any in-progress draft — its inputs no longer match the roster.
    pub fn remove_party(&mut self, key: &SessionPublicKey) -> Option<ClaimParty> {
        let idx = self.parties.iter().position(|p| &p.pubkey == key)?;
        let removed = self.parties.remove(idx);
        self.recompute_heights();
        self.invalidate_draft();
        Some(removed)
    }

    /// Roster entry by session key.
    pub fn party(&self, key: &SessionPublicKey) -> Option<&ClaimParty> {
        self.parties.iter().find(|p| &p.pubkey == key)
    }

    /// Mutable roster entry by session key.
    pub fn party_mut(&mut self, key: &SessionPublicKey) -> Option<&mut ClaimParty> {
        self.parties.iter_mut().find(|p| &p.pubkey == key)
    }

    /// Roster entry by claim script.
    pub fn party_by_script(&self, claim_script: &str) -> Option<&ClaimParty> {
        self.parties.iter().find(|p| p.claim_script == claim_script)
    }

    /// The claim height is the max over the roster; the join deadline sits
    /// one block before it.
    pub fn recompute_heights(&mut self) {
        self.claim_block_height = self
            .parties
            .iter()
            .map(|p| p.claimable_height)
            .max()
            .unwrap_or(0);
        self.join_block_height = self.claim_block_height.saturating_sub(JOIN_HEIGHT_OFFSET);
    }

    /// Drop the in-progress draft so the next tick rebuilds from scratch.
    pub fn invalidate_draft(&mut self) {
        self.claim_pset = None;
    }

    /// Split `total_fee` across the roster: equal integer shares, with the
    /// last party absorbing the indivisible remainder.
    pub fn assign_fee_shares(&mut self, total_fee: u64) {
        let n = self.parties.len() as u64;
        if n == 0 {
            return;
        }
        let share = total_fee / n;
        for party in &mut self.parties {
            party.fee_share_sats = share;
        }
        if let Some(last) = self.parties.last_mut() {
            last.fee_share_sats = total_fee - share * (n - 1);
        }
        self.target_fee_sats = total_fee;
    }

    // -- display -------------------------------------------------------------

    /// Update the status line.
    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
        debug!(role = %self.role, status = %self.status, "session status");
    }

    /// Snapshot of the fields a host UI cares about.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            role: self.role,
            status: self.status.clone(),
            party_count: self.parties.len(),
            claim_block_height: self.claim_block_height,
            join_block_height: self.join_block_height,
            target_fee_sats: self.target_fee_sats,
            has_draft: self.claim_pset.is_some(),
        }
    }

    // -- persistence ---------------------------------------------------------

    /// Write the snapshot through the durable store.
    pub fn persist(&self, store: &dyn Store) -> Result<(), StoreError> {
        let bytes = bincode::serialize(self).map_err(|e| StoreError::Backend(e.to_string()))?;
        store.save(NS_SESSION, KEY_SNAPSHOT, &bytes)
    }

    /// Load the last committed snapshot, if any.
    pub fn restore(store: &dyn Store) -> Result<Option<Self>, StoreError> {
        match store.load(NS_SESSION, KEY_SNAPSHOT)? {
            None => Ok(None),
            Some(bytes) => {
                let session =
                    bincode::deserialize(&bytes).map_err(|_| StoreError::Corrupt {
                        namespace: NS_SESSION.to_string(),
                        key: KEY_SNAPSHOT.to_string(),
                    })?;
                Ok(Some(session))
            }
        }
    }
}

/// Host-facing view of the session, cheap to serialize and log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub role: Role,
    pub status: String,
    pub party_count: usize,
    pub claim_block_height: u32,
    pub join_block_height: u32,
    pub target_fee_sats: u64,
    pub has_draft: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SessionKeypair;
    use crate::session::party::PeginContext;

    fn make_party(script: &str, height: u32, amount: u64) -> ClaimParty {
        ClaimParty::from_pegin(
            &PeginContext {
                txid: format!("{:0>64}", script),
                vout: 0,
                claim_script: script.to_string(),
                destination_address: format!("lq1q{}", script),
                claimable_height: height,
                amount_sats: amount,
            },
            vec![0u8; 64],
            vec![0u8; 32],
            SessionKeypair::generate().public_key(),
        )
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut session = Session::new();
        session.begin_initiator(make_party("aa", 120, 100_000), 1_000);
        session.reset();
        let after_one = session.clone();
        session.reset();
        assert_eq!(session, after_one);
        assert_eq!(session.role, Role::None);
        assert!(session.parties.is_empty());
    }

    #[test]
    fn test_begin_initiator_sets_heights() {
        let mut session = Session::new();
        session.begin_initiator(make_party("aa", 150, 100_000), 42);
        assert_eq!(session.role, Role::Initiator);
        assert_eq!(session.claim_block_height, 150);
        assert_eq!(session.join_block_height, 149);
        assert_eq!(session.started_at_ms, 42);
    }

    #[test]
    fn test_add_party_raises_claim_height() {
        let mut session = Session::new();
        session.begin_initiator(make_party("aa", 150, 100_000), 0);
        session.add_party(make_party("bb", 175, 50_000)).unwrap();
        assert_eq!(session.claim_block_height, 175);
        assert_eq!(session.join_block_height, 174);

        // A lower candidate does not pull the height back down.
        session.add_party(make_party("cc", 120, 25_000)).unwrap();
        assert_eq!(session.claim_block_height, 175);
    }

    #[test]
    fn test_duplicate_claim_script_rejected() {
        let mut session = Session::new();
        session.begin_initiator(make_party("aa", 150, 100_000), 0);
        let err = session.add_party(make_party("aa", 160, 77)).unwrap_err();
        assert_eq!(err, RosterError::DuplicateScript);
        assert_eq!(session.parties.len(), 1);
    }

    #[test]
    fn test_roster_cap() {
        let mut session = Session::new();
        session.begin_initiator(make_party("p0", 100, 1_000), 0);
        for i in 1..MAX_PARTIES {
            session
                .add_party(make_party(&format!("p{}", i), 100, 1_000))
                .unwrap();
        }
        let err = session.add_party(make_party("pX", 100, 1_000)).unwrap_err();
        assert_eq!(err, RosterError::Full);
    }

    #[test]
    fn test_remove_party_recomputes_and_invalidates() {
        let mut session = Session::new();
        session.begin_initiator(make_party("aa", 150, 100_000), 0);
        let high = make_party("bb", 200, 50_000);
        let high_key = high.pubkey;
        session.add_party(high).unwrap();
        session.claim_pset = Some(vec![1, 2, 3]);

        let removed = session.remove_party(&high_key).unwrap();
        assert_eq!(removed.claim_script, "bb");
        assert_eq!(session.claim_block_height, 150);
        assert!(session.claim_pset.is_none());
    }

    #[test]
    fn test_fee_shares_conserve_total() {
        let mut session = Session::new();
        session.begin_initiator(make_party("aa", 100, 100_000), 0);
        session.add_party(make_party("bb", 100, 60_000)).unwrap();
        session.add_party(make_party("cc", 100, 40_000)).unwrap();

        // 100 does not divide by 3; the last party absorbs the remainder.
        session.assign_fee_shares(100);
        let shares: Vec<u64> = session.parties.iter().map(|p| p.fee_share_sats).collect();
        assert_eq!(shares, vec![33, 33, 34]);
        assert_eq!(shares.iter().sum::<u64>(), 100);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        use crate::devnet::MemoryStore;

        let store = MemoryStore::new();
        let mut session = Session::new();
        session.begin_initiator(make_party("aa", 150, 100_000), 7_777);
        session.claim_pset = Some(vec![9, 9, 9]);
        session.persist(&store).unwrap();

        let restored = Session::restore(&store).unwrap().unwrap();
        assert_eq!(restored, session);
    }

    #[test]
    fn test_restore_empty_store() {
        use crate::devnet::MemoryStore;
        let store = MemoryStore::new();
        assert!(Session::restore(&store).unwrap().is_none());
    }
}
