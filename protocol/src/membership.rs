//! # Membership State Machine
//!
//! Everything that changes *who* is in the session: join requests,
//! confirmations, refusals, removals, and the ejection policy for peers
//! that stop answering.
//!
//! The handlers mutate the [`Session`] aggregate directly — they *are* the
//! state machine — but perform no I/O. Each returns a list of
//! [`MembershipOutcome`]s describing the replies to send and routes to
//! drop; the coordinator executes those and persists the session around
//! them.
//!
//! ## Delivery policy
//!
//! Every delegation that expects a reply bumps the counterpart's
//! unacked-send counter; any coordination message from that counterpart
//! resets it. Resends respect a cooldown so a slow peer is not buried in
//! duplicates, and a peer that eats [`MAX_SENDS_BEFORE_KICK`] sends
//! without a word is ejected: told directly, announced to the rest of the
//! roster, and its slot's inputs removed from the draft (by invalidating
//! the draft entirely).

use tracing::{info, warn};

use crate::config::{
    estimated_fee_sats, MAX_FEE_SHARE_SATS, MAX_SENDS_BEFORE_KICK, RESEND_COOLDOWN,
};
use crate::crypto::keys::SessionPublicKey;
use crate::rpc::ChainFacts;
use crate::session::party::ClaimParty;
use crate::session::state::{Role, RosterError, Session};
use crate::wire::{Coordination, CoordinationAction};

/// I/O the coordinator should perform after a membership handler ran.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipOutcome {
    /// Send a coordination message to a session key.
    Reply {
        to: SessionPublicKey,
        coordination: Coordination,
    },
    /// We are now a committed joiner.
    Joined,
    /// We left (or were thrown out of) the session; state already reset.
    /// The named route, if any, should be forgotten.
    Left {
        forget: Option<SessionPublicKey>,
        reason: String,
    },
    /// The initiator removed a party from the roster.
    Removed { party: Box<ClaimParty> },
}

// ---------------------------------------------------------------------------
// add
// ---------------------------------------------------------------------------

/// Initiator-side handling of an `Add` request.
pub fn handle_add(
    session: &mut Session,
    from: &SessionPublicKey,
    coordination: &Coordination,
    chain: &dyn ChainFacts,
) -> Vec<MembershipOutcome> {
    if session.role != Role::Initiator {
        return vec![refuse(from, session, "not an initiator")];
    }

    let Some(candidate) = coordination.joiner.clone() else {
        warn!(from = %from.short(), "add request without a candidate descriptor");
        return vec![refuse(from, session, "missing candidate descriptor")];
    };

    if &candidate.pubkey != from {
        // Parties ask for themselves. A descriptor under someone else's
        // key is either a bug or an impersonation attempt.
        return vec![refuse(from, session, "candidate key does not match sender")];
    }

    let mut candidate = candidate;
    candidate.note_reply(); // wire copies carry no counters, but be sure

    match validate_pegin(&mut candidate, chain) {
        Ok(()) => {}
        Err(reason) => {
            info!(from = %from.short(), reason, "refusing join: peg-in validation failed");
            return vec![refuse(from, session, reason)];
        }
    }

    match session.add_party(candidate) {
        Ok(()) => {}
        Err(RosterError::Full) => return vec![refuse(from, session, "roster limit reached")],
        Err(RosterError::DuplicateScript) => {
            return vec![refuse(from, session, "peg-in already in the roster")]
        }
    }

    // Roster changed: refresh the estimated fee split and drop any draft
    // built for the old roster.
    session.assign_fee_shares(estimated_fee_sats(session.parties.len()));
    session.invalidate_draft();
    session.set_status(format!(
        "{} parties, claiming at height {}",
        session.parties.len(),
        session.claim_block_height
    ));

    info!(
        joiner = %from.short(),
        parties = session.parties.len(),
        claim_height = session.claim_block_height,
        "admitted party"
    );

    vec![confirm_to(session, from)]
}

/// Fetch fresh chain artifacts for the candidate's peg-in. A stale proof
/// or raw transaction is silently refreshed as long as the txid and claim
/// script still check out; a peg-in the chain view cannot substantiate is
/// a refusal.
fn validate_pegin(candidate: &mut ClaimParty, chain: &dyn ChainFacts) -> Result<(), &'static str> {
    let raw_tx = chain
        .get_raw_transaction(&candidate.pegin_txid)
        .map_err(|_| "peg-in transaction not found")?;
    let proof = chain
        .get_inclusion_proof(&candidate.pegin_txid)
        .map_err(|_| "peg-in inclusion proof unavailable")?;
    let vout = chain
        .find_output_index(&raw_tx, candidate.amount_sats)
        .map_err(|_| "peg-in amount does not match any output")?;

    if vout != candidate.pegin_vout {
        return Err("peg-in output index mismatch");
    }

    // Refresh rather than reject: the candidate may have fetched its proof
    // before a reorg settled.
    candidate.raw_tx = raw_tx;
    candidate.proof = proof;
    Ok(())
}

// ---------------------------------------------------------------------------
// confirm_add / refuse_add
// ---------------------------------------------------------------------------

/// Candidate/joiner-side handling of a `ConfirmAdd`.
pub fn handle_confirm_add(
    session: &mut Session,
    from: &SessionPublicKey,
    coordination: &Coordination,
    now_ms: u64,
) -> Vec<MembershipOutcome> {
    if session.initiator != Some(*from) {
        // A confirmation from someone we never asked. Drop it.
        return Vec::new();
    }

    let Some(entry) = coordination.joiner.clone() else {
        warn!(from = %from.short(), "confirm_add without our roster entry");
        return Vec::new();
    };

    // The entry must still describe *our* peg-in, and the fee split must
    // be sane. An initiator rewriting amounts or loading us with the whole
    // fee does not get a committed joiner out of it.
    let Some(ours) = session.parties.first() else {
        return Vec::new();
    };
    if entry.claim_script != ours.claim_script
        || entry.pegin_txid != ours.pegin_txid
        || entry.amount_sats != ours.amount_sats
    {
        warn!(from = %from.short(), "confirm_add rewrote our peg-in; leaving session");
        session.reset();
        return vec![MembershipOutcome::Left {
            forget: Some(*from),
            reason: "initiator tampered with our roster entry".to_string(),
        }];
    }
    if entry.fee_share_sats > MAX_FEE_SHARE_SATS {
        warn!(
            from = %from.short(),
            fee_share = entry.fee_share_sats,
            "confirm_add with an abusive fee share; leaving session"
        );
        session.reset();
        return vec![MembershipOutcome::Left {
            forget: Some(*from),
            reason: "fee share exceeds acceptable bound".to_string(),
        }];
    }

    match session.role {
        Role::None => {
            session.become_joiner(*from, entry.for_wire(), coordination.claim_block_height, now_ms);
            session.set_status(coordination.status.clone());
            info!(initiator = %from.short(), "join confirmed");
            vec![MembershipOutcome::Joined]
        }
        Role::Joiner => {
            // Roster/status refresh from the initiator.
            session.parties = vec![entry.for_wire()];
            session.claim_block_height = coordination.claim_block_height;
            session.last_heard_ms = now_ms;
            session.set_status(coordination.status.clone());
            Vec::new()
        }
        Role::Initiator => Vec::new(),
    }
}

/// Candidate/joiner-side handling of a `RefuseAdd`.
pub fn handle_refuse_add(
    session: &mut Session,
    from: &SessionPublicKey,
    coordination: &Coordination,
) -> Vec<MembershipOutcome> {
    if session.role == Role::Initiator || session.initiator != Some(*from) {
        return Vec::new();
    }

    let reason = if coordination.status.is_empty() {
        "join refused".to_string()
    } else {
        coordination.status.clone()
    };
    info!(initiator = %from.short(), reason = %reason, "join refused");

    // Keep the join counter across the reset so a refusing initiator
    // cannot be asked forever.
    let join_counter = session.join_counter;
    session.reset();
    session.join_counter = join_counter;

    vec![MembershipOutcome::Left {
        // The refusing session is no longer trusted; drop its route.
        forget: Some(*from),
        reason,
    }]
}

// ---------------------------------------------------------------------------
// remove
// ---------------------------------------------------------------------------

/// Handling of a `Remove`: a joiner pulling itself out (initiator side),
/// or the initiator expelling us (joiner side).
pub fn handle_remove(
    session: &mut Session,
    from: &SessionPublicKey,
    coordination: &Coordination,
) -> Vec<MembershipOutcome> {
    match session.role {
        Role::Initiator => {
            let Some(removed) = session.remove_party(from) else {
                return Vec::new();
            };
            if !session.parties.is_empty() {
                session.assign_fee_shares(estimated_fee_sats(session.parties.len()));
            }
            session.set_status(format!(
                "party left ({}), {} remaining",
                coordination.status,
                session.parties.len()
            ));
            info!(party = %from.short(), remaining = session.parties.len(), "party removed itself");

            let mut outcomes = vec![MembershipOutcome::Removed {
                party: Box::new(removed),
            }];
            outcomes.extend(notify_roster(session));
            outcomes
        }
        Role::Joiner if session.initiator == Some(*from) => {
            let reason = if coordination.status.is_empty() {
                "removed by initiator".to_string()
            } else {
                coordination.status.clone()
            };
            session.reset();
            vec![MembershipOutcome::Left {
                forget: Some(*from),
                reason,
            }]
        }
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Ejection
// ---------------------------------------------------------------------------

/// Initiator-side ejection of a misbehaving or unresponsive party: remove
/// it, tell it directly, and bring the remaining roster up to date. The
/// draft is already invalidated by the removal.
pub fn eject(
    session: &mut Session,
    key: &SessionPublicKey,
    reason: &str,
) -> Vec<MembershipOutcome> {
    let Some(removed) = session.remove_party(key) else {
        return Vec::new();
    };
    if !session.parties.is_empty() {
        session.assign_fee_shares(estimated_fee_sats(session.parties.len()));
    }
    session.set_status(format!(
        "ejected a party ({}), {} remaining",
        reason,
        session.parties.len()
    ));
    warn!(party = %key.short(), reason, "ejecting party");

    // The refusal must go out before the route to the kicked party is
    // dropped, so `Removed` comes last.
    let mut outcomes = vec![MembershipOutcome::Reply {
        to: *key,
        coordination: Coordination::new(
            CoordinationAction::RefuseAdd,
            session.claim_block_height,
            format!("removed from session: {}", reason),
        ),
    }];
    outcomes.extend(notify_roster(session));
    outcomes.push(MembershipOutcome::Removed {
        party: Box::new(removed),
    });
    outcomes
}

/// `ConfirmAdd` refreshes for every remote roster member, carrying their
/// updated entries and the current claim height.
fn notify_roster(session: &Session) -> Vec<MembershipOutcome> {
    session
        .parties
        .iter()
        .skip(1) // index 0 is the initiator itself
        .map(|p| MembershipOutcome::Reply {
            to: p.pubkey,
            coordination: Coordination::new(
                CoordinationAction::ConfirmAdd,
                session.claim_block_height,
                session.status.clone(),
            )
            .with_joiner(p.for_wire()),
        })
        .collect()
}

fn refuse(to: &SessionPublicKey, session: &Session, reason: &str) -> MembershipOutcome {
    MembershipOutcome::Reply {
        to: *to,
        coordination: Coordination::new(
            CoordinationAction::RefuseAdd,
            session.claim_block_height,
            reason,
        ),
    }
}

fn confirm_to(session: &Session, to: &SessionPublicKey) -> MembershipOutcome {
    let entry = session
        .party(to)
        .map(|p| p.for_wire())
        .expect("confirm_to called for a roster member");
    MembershipOutcome::Reply {
        to: *to,
        coordination: Coordination::new(
            CoordinationAction::ConfirmAdd,
            session.claim_block_height,
            session.status.clone(),
        )
        .with_joiner(entry),
    }
}

// ---------------------------------------------------------------------------
// Resend policy
// ---------------------------------------------------------------------------

/// What to do about a party whose reply we are still waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendDecision {
    /// Hand (or re-hand) the request to the transport.
    Send,
    /// Within the cooldown window; skip this tick.
    Wait,
    /// Out of patience: eject.
    Kick,
}

/// Apply the delivery policy to a party's counters.
pub fn resend_decision(party: &ClaimParty, now_ms: u64) -> ResendDecision {
    if party.sent_count >= MAX_SENDS_BEFORE_KICK {
        return ResendDecision::Kick;
    }
    if party.sent_count == 0 {
        return ResendDecision::Send;
    }
    if now_ms.saturating_sub(party.last_sent_ms) < RESEND_COOLDOWN.as_millis() as u64 {
        return ResendDecision::Wait;
    }
    ResendDecision::Send
}
