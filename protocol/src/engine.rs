//! # Transaction Orchestration Engine
//!
//! Drives the joint claim from roster to broadcast: draft construction,
//! the blinding round, the signing round, finalization, fee convergence,
//! and the end-of-session announcement.
//!
//! The initiator's side runs once per confirmation-height tick (and again
//! after each delegation reply) as a bounded loop to a fixed point:
//!
//! 1. No draft? Build one — an input per party, a destination output per
//!    party (amount minus fee share, last party absorbs the remainder,
//!    order randomly permuted), the explicit fee output, and a marker
//!    output when more than one party claims together.
//! 2. Check the draft's shape. A wrong count means the roster changed
//!    under it; rebuild.
//! 3. Blind outputs in ascending order. Our own: blind locally and keep
//!    scanning. A remote party's: send the draft with `Process`
//!    (`Process2` when their blind completes the set and their signature
//!    can ride the same round trip), then suspend until the reply.
//! 4. Once every output is blinded, sign inputs in *descending* order so
//!    the initiator at index 0 signs last. Same local/delegate split.
//! 5. Finalize, recompute the exact fee from the discounted vsize, and
//!    either rebuild with the exact fee (bounded by `MAX_REBUILDS`) or
//!    broadcast. "Already in the chain" counts as success.
//!
//! The engine never blocks: a delegation persists state and returns; the
//! next inbound reply or tick resumes exactly where it left off. It also
//! never performs I/O beyond the service traits — sends are returned as
//! [`EngineEvent`]s for the coordinator to execute.
//!
//! The joiner's side is one function: verify the incoming draft, blind
//! and/or sign the pieces this wallet owns, and hand the draft back.

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config::{
    exact_fee_sats, estimated_fee_sats, FEE_SHARE_TOLERANCE_SATS, MARKER_SCRIPT_HEX,
    MAX_FEE_SHARE_SATS, MAX_PARTIES, MAX_REBUILDS,
};
use crate::crypto::keys::SessionPublicKey;
use crate::membership::{resend_decision, ResendDecision};
use crate::rpc::{
    BroadcastOutcome, ChainFacts, Clock, CreatePsetRequest, LiquidService, PsetInput, PsetOutput,
    PsetSummary,
};
use crate::session::state::{Role, Session};
use crate::wire::{Coordination, CoordinationAction};

// ---------------------------------------------------------------------------
// Context & Results
// ---------------------------------------------------------------------------

/// Borrowed collaborators the engine works against.
pub struct EngineCtx<'a> {
    pub my_key: SessionPublicKey,
    pub chain: &'a dyn ChainFacts,
    pub liquid: &'a dyn LiquidService,
    pub clock: &'a dyn Clock,
}

/// I/O for the coordinator to execute after an engine call.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Seal and send a coordination message to a session key.
    SendCoordination {
        to: SessionPublicKey,
        coordination: Coordination,
    },
    /// Eject this party (run the membership ejection, which notifies it
    /// and the rest of the roster).
    Kick {
        key: SessionPublicKey,
        reason: String,
    },
    /// Flood the end-of-session announcement, then reset.
    AnnounceEnd { txid: String, reason: String },
    /// We (a joiner) removed ourselves; session already reset. Forget the
    /// named route after the accompanying sends went out.
    LeftSession {
        forget: Option<SessionPublicKey>,
        reason: String,
    },
}

/// Where the per-tick driver landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do (wrong role, or no roster).
    Idle,
    /// The claim height has not arrived yet.
    WaitingForHeight,
    /// A delegation is outstanding; resume on reply or next tick.
    Suspended,
    /// The claim transaction is on the network.
    Completed { txid: String },
    /// Unrecoverable failure; session is being torn down.
    Aborted { reason: String },
}

/// Result of one driver invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TickResult {
    pub events: Vec<EngineEvent>,
    pub outcome: TickOutcome,
}

impl TickResult {
    fn idle() -> Self {
        Self {
            events: Vec::new(),
            outcome: TickOutcome::Idle,
        }
    }
}

/// One step of the fixed-point loop.
enum Step {
    /// State advanced locally; keep looping.
    Advanced,
    /// A remote party must act next.
    Delegate {
        to: SessionPublicKey,
        process2: bool,
    },
    /// Draft complete: finalized and decoded.
    Finalized {
        raw_tx: Vec<u8>,
        txid: String,
        discounted_vsize: u64,
        fee_sats: u64,
    },
    /// Unrecoverable; abort the session with this reason.
    Abort { reason: String },
}

// ---------------------------------------------------------------------------
// Initiator driver
// ---------------------------------------------------------------------------

/// Drive the initiator's construction loop to its fixed point for this
/// tick. Call on every new confirmation height and after every accepted
/// delegation reply.
pub fn drive(session: &mut Session, ctx: &EngineCtx) -> TickResult {
    if session.role != Role::Initiator {
        return TickResult::idle();
    }
    if session.parties.is_empty() {
        return abort(session, "roster is empty");
    }

    let height = match ctx.chain.current_confirmation_height() {
        Ok(h) => h,
        Err(e) => {
            // Transient: the chain view will be back. Keep the session.
            warn!(error = %e, "chain view unavailable, skipping tick");
            return TickResult::idle();
        }
    };
    if height < session.claim_block_height {
        session.set_status(format!(
            "waiting for claim height {} (now {})",
            session.claim_block_height, height
        ));
        return TickResult {
            events: Vec::new(),
            outcome: TickOutcome::WaitingForHeight,
        };
    }

    // Bounded fixed-point loop: every iteration either makes local
    // progress, suspends on a remote party, rebuilds (counted), or ends
    // the session. The bound is generous; hitting it means a logic bug,
    // and aborting beats spinning.
    let step_bound = 2 * MAX_PARTIES as u32 + MAX_REBUILDS + 8;
    for _ in 0..step_bound {
        match step(session, ctx) {
            Step::Advanced => continue,
            Step::Abort { reason } => return abort(session, &reason),
            Step::Delegate { to, process2 } => return delegate(session, ctx, to, process2),
            Step::Finalized {
                raw_tx,
                txid,
                discounted_vsize,
                fee_sats,
            } => {
                let exact = exact_fee_sats(discounted_vsize);
                if fee_sats != exact {
                    // The draft paid the estimate; now we know the real
                    // figure. Rebuild from scratch with the exact fee.
                    session.rebuild_counter += 1;
                    if session.rebuild_counter > MAX_REBUILDS {
                        return abort(session, "fee did not converge");
                    }
                    debug!(
                        paid = fee_sats,
                        exact,
                        rebuild = session.rebuild_counter,
                        "fee mismatch, rebuilding draft"
                    );
                    session.target_fee_sats = exact;
                    session.invalidate_draft();
                    continue;
                }

                return match ctx.liquid.broadcast(&raw_tx) {
                    Ok(BroadcastOutcome::Accepted { txid }) => complete(session, txid),
                    // Someone raced us to the mempool with our own
                    // transaction. That is a success wearing a trench coat.
                    Ok(BroadcastOutcome::AlreadyInChain) => complete(session, txid),
                    Err(e) => abort(session, &format!("broadcast failed: {}", e)),
                };
            }
        }
    }

    abort(session, "construction loop did not settle")
}

/// One pass over the draft: build it, check it, find the next pending
/// blind or signature, or finalize.
fn step(session: &mut Session, ctx: &EngineCtx) -> Step {
    if session.claim_pset.is_none() {
        return build_draft(session, ctx);
    }
    let pset = session.claim_pset.clone().expect("checked above");

    let summary = match ctx.liquid.decode_pset(&pset) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "draft undecodable, rebuilding");
            return count_rebuild(session, "draft undecodable");
        }
    };
    if let Err(reason) = check_shape(session, &summary) {
        warn!(reason, "draft shape invalid, rebuilding");
        return count_rebuild(session, reason);
    }

    let analysis = match ctx.liquid.analyze_pset(&pset) {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "draft unanalyzable, rebuilding");
            return count_rebuild(session, "draft unanalyzable");
        }
    };

    // Blinding round: ascending output order. The analysis is trusted no
    // further than its length; a short vector reads as "done".
    let pending_blinds: Vec<usize> = summary
        .blindable_outputs()
        .filter(|(i, _)| !analysis.outputs_blinded.get(*i).copied().unwrap_or(true))
        .map(|(i, _)| i)
        .collect();

    if let Some(&idx) = pending_blinds.first() {
        let owner = match output_owner(session, ctx, &summary, idx) {
            Ok(owner) => owner,
            Err(reason) => return count_rebuild(session, reason),
        };
        if owner == ctx.my_key {
            return process_locally(session, ctx, "blind own output");
        }
        // Process2 when this blind completes the set and the same party
        // still owes a signature: one round trip instead of two.
        let process2 = pending_blinds.len() == 1 && party_owes_signature(&summary, session, &owner);
        return Step::Delegate { to: owner, process2 };
    }

    // Signing round: descending input order, initiator (index 0) last.
    let pending_sign = summary
        .inputs
        .iter()
        .enumerate()
        .rev()
        .find(|(i, info)| {
            !info.signed && !analysis.inputs_signed.get(*i).copied().unwrap_or(true)
        });

    if let Some((idx, info)) = pending_sign {
        let Some(owner) = session.party_by_script(&info.claim_script).map(|p| p.pubkey) else {
            return count_rebuild(session, "input owned by no roster member");
        };
        if owner == ctx.my_key {
            debug!(input = idx, "signing own input");
            return process_locally(session, ctx, "sign own input");
        }
        return Step::Delegate {
            to: owner,
            process2: false,
        };
    }

    // Everything blinded and signed: extract the final transaction.
    let raw_tx = match ctx.liquid.finalize_pset(&pset) {
        Ok(raw) => raw,
        Err(e) => {
            return Step::Abort {
                reason: format!("cannot finalize claim transaction: {}", e),
            }
        }
    };
    match ctx.liquid.decode_final_tx(&raw_tx) {
        Ok(decoded) => Step::Finalized {
            raw_tx,
            txid: decoded.txid,
            discounted_vsize: decoded.discounted_vsize,
            fee_sats: decoded.fee_sats,
        },
        Err(e) => Step::Abort {
            reason: format!("cannot decode finalized transaction: {}", e),
        },
    }
}

/// Assemble a fresh draft for the current roster and persist it into the
/// session.
fn build_draft(session: &mut Session, ctx: &EngineCtx) -> Step {
    let n = session.parties.len();
    let total_fee = if session.target_fee_sats == 0 {
        estimated_fee_sats(n)
    } else {
        session.target_fee_sats
    };
    session.assign_fee_shares(total_fee);

    let inputs: Vec<PsetInput> = session
        .parties
        .iter()
        .map(|p| PsetInput {
            pegin_txid: p.pegin_txid.clone(),
            pegin_vout: p.pegin_vout,
            claim_script: p.claim_script.clone(),
            raw_tx: p.raw_tx.clone(),
            proof: p.proof.clone(),
            amount_sats: p.amount_sats,
        })
        .collect();

    let mut destinations: Vec<PsetOutput> = session
        .parties
        .iter()
        .map(|p| PsetOutput::Destination {
            address: p.destination_address.clone(),
            amount_sats: p.expected_output_sats(),
        })
        .collect();
    // Output-index privacy: a fixed party→index mapping would let anyone
    // who knows one party's slot deanonymize the rest.
    destinations.shuffle(&mut rand::thread_rng());

    let mut outputs = destinations;
    outputs.push(PsetOutput::Fee {
        amount_sats: total_fee,
    });
    if n > 1 {
        outputs.push(PsetOutput::Data {
            script_hex: MARKER_SCRIPT_HEX.to_string(),
        });
    }

    match ctx.liquid.create_pset(&CreatePsetRequest { inputs, outputs }) {
        Ok(pset) => {
            session.claim_pset = Some(pset);
            session.set_status(format!(
                "built claim draft: {} parties, {} sat fee",
                n, total_fee
            ));
            Step::Advanced
        }
        Err(e) => Step::Abort {
            reason: format!("cannot build claim draft: {}", e),
        },
    }
}

/// Structural validation: one input per party, one destination output per
/// party, the fee output, and the marker when more than one party claims.
fn check_shape(session: &Session, summary: &PsetSummary) -> Result<(), &'static str> {
    let n = session.parties.len();
    if summary.inputs.len() != n {
        return Err("input count does not match roster");
    }
    let expected_outputs = n + 1 + usize::from(n > 1);
    if summary.outputs.len() != expected_outputs {
        return Err("output count does not match roster");
    }
    if summary.blindable_outputs().count() != n {
        return Err("destination output count does not match roster");
    }
    if summary.outputs.iter().filter(|o| o.is_fee).count() != 1 {
        return Err("draft must carry exactly one fee output");
    }
    Ok(())
}

/// Which roster member owns the destination output at `idx`, by
/// unconfidential address comparison.
fn output_owner(
    session: &Session,
    ctx: &EngineCtx,
    summary: &PsetSummary,
    idx: usize,
) -> Result<SessionPublicKey, &'static str> {
    let Some(address) = summary.outputs[idx].address.as_deref() else {
        return Err("blindable output without an address");
    };
    let unconf = ctx
        .liquid
        .unconfidential(address)
        .map_err(|_| "output address does not resolve")?;
    for party in &session.parties {
        let party_unconf = ctx
            .liquid
            .unconfidential(&party.destination_address)
            .map_err(|_| "party address does not resolve")?;
        if party_unconf == unconf {
            return Ok(party.pubkey);
        }
    }
    Err("output owned by no roster member")
}

/// Whether `owner` still has an unsigned input in the draft.
fn party_owes_signature(summary: &PsetSummary, session: &Session, owner: &SessionPublicKey) -> bool {
    summary.inputs.iter().any(|input| {
        !input.signed
            && session
                .party_by_script(&input.claim_script)
                .map(|p| &p.pubkey == owner)
                .unwrap_or(false)
    })
}

/// Blind/sign our own pieces and keep going.
fn process_locally(session: &mut Session, ctx: &EngineCtx, what: &str) -> Step {
    let pset = session.claim_pset.clone().expect("draft exists");
    match ctx.liquid.process_pset(&pset) {
        Ok(updated) => {
            session.claim_pset = Some(updated);
            debug!(what, "processed draft locally");
            Step::Advanced
        }
        Err(e) => Step::Abort {
            reason: format!("local {} failed: {}", what, e),
        },
    }
}

/// Send (or resend, or give up on) a delegation to a remote party.
fn delegate(
    session: &mut Session,
    ctx: &EngineCtx,
    to: SessionPublicKey,
    process2: bool,
) -> TickResult {
    let now = ctx.clock.now_ms();
    let claim_height = session.claim_block_height;
    let pset = session.claim_pset.clone().expect("draft exists");

    let Some(party) = session.party_mut(&to) else {
        // Roster changed while deciding; next tick rebuilds.
        return TickResult {
            events: Vec::new(),
            outcome: TickOutcome::Suspended,
        };
    };

    match resend_decision(party, now) {
        ResendDecision::Wait => TickResult {
            events: Vec::new(),
            outcome: TickOutcome::Suspended,
        },
        ResendDecision::Kick => TickResult {
            events: vec![EngineEvent::Kick {
                key: to,
                reason: "no response after 5 sends".to_string(),
            }],
            outcome: TickOutcome::Suspended,
        },
        ResendDecision::Send => {
            party.note_sent(now);
            let attempt = party.sent_count;
            let entry = party.for_wire();
            let action = if process2 {
                CoordinationAction::Process2
            } else {
                CoordinationAction::Process
            };
            let verb = if process2 { "blind and sign" } else { "process" };
            session.set_status(format!(
                "waiting for {} to {} (send {})",
                to.short(),
                verb,
                attempt
            ));
            info!(party = %to.short(), %action, attempt, "delegating draft");
            TickResult {
                events: vec![EngineEvent::SendCoordination {
                    to,
                    coordination: Coordination::new(action, claim_height, verb)
                        .with_joiner(entry)
                        .with_pset(pset),
                }],
                outcome: TickOutcome::Suspended,
            }
        }
    }
}

fn count_rebuild(session: &mut Session, reason: &str) -> Step {
    session.rebuild_counter += 1;
    if session.rebuild_counter > MAX_REBUILDS {
        return Step::Abort {
            reason: format!("draft rebuilt too many times ({})", reason),
        };
    }
    session.invalidate_draft();
    Step::Advanced
}

fn complete(session: &mut Session, txid: String) -> TickResult {
    session.set_status(format!("claim broadcast: {}", txid));
    info!(%txid, parties = session.parties.len(), "joint claim broadcast");
    TickResult {
        events: vec![EngineEvent::AnnounceEnd {
            txid: txid.clone(),
            reason: String::new(),
        }],
        outcome: TickOutcome::Completed { txid },
    }
}

fn abort(session: &mut Session, reason: &str) -> TickResult {
    session.set_status(format!("session failed: {}", reason));
    warn!(reason, "aborting session");
    TickResult {
        events: vec![EngineEvent::AnnounceEnd {
            txid: String::new(),
            reason: reason.to_string(),
        }],
        outcome: TickOutcome::Aborted {
            reason: reason.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Initiator: delegation replies
// ---------------------------------------------------------------------------

/// Initiator-side handling of a `Process` reply carrying the counterpart's
/// processed draft. Verifies per the contract — structure unchanged, our
/// own output untouched — and either adopts the draft or ejects the
/// sender.
pub fn handle_process_reply(
    session: &mut Session,
    ctx: &EngineCtx,
    from: &SessionPublicKey,
    coordination: &Coordination,
) -> Vec<EngineEvent> {
    if session.role != Role::Initiator {
        return Vec::new();
    }
    let Some(party) = session.party_mut(from) else {
        debug!(from = %from.short(), "process reply from non-member");
        return Vec::new();
    };
    party.note_reply();

    let Some(returned) = coordination.pset.as_deref() else {
        return vec![EngineEvent::Kick {
            key: *from,
            reason: "reply without a draft".to_string(),
        }];
    };
    let Some(ours) = session.claim_pset.as_deref() else {
        // Draft was invalidated while the request was in flight (roster
        // change). The reply is stale; ignore it and let the tick rebuild.
        return Vec::new();
    };

    if let Err(reason) = verify_counterpart_pset(session, ctx, ours, returned) {
        return vec![EngineEvent::Kick {
            key: *from,
            reason,
        }];
    }

    session.claim_pset = Some(returned.to_vec());
    session.set_status(format!("received processed draft from {}", from.short()));
    Vec::new()
}

/// The §-contract for an initiator accepting a counterpart's draft:
/// input/output counts unchanged, own destination output present at its
/// unconfidential address with no more than rounding shaved off.
fn verify_counterpart_pset(
    session: &Session,
    ctx: &EngineCtx,
    ours: &[u8],
    theirs: &[u8],
) -> Result<(), String> {
    let before = ctx
        .liquid
        .decode_pset(ours)
        .map_err(|e| format!("own draft undecodable: {}", e))?;
    let after = ctx
        .liquid
        .decode_pset(theirs)
        .map_err(|e| format!("returned draft undecodable: {}", e))?;

    if before.inputs.len() != after.inputs.len() {
        return Err("returned draft changed the input count".to_string());
    }
    if before.outputs.len() != after.outputs.len() {
        return Err("returned draft changed the output count".to_string());
    }

    verify_own_output(session, ctx, &after)
}

/// Locate our own destination output in a draft and check its amount.
/// Shared by both roles: each party only ever vouches for its own money.
pub fn verify_own_output(
    session: &Session,
    ctx: &EngineCtx,
    summary: &PsetSummary,
) -> Result<(), String> {
    let Some(me) = session.party(&ctx.my_key) else {
        return Err("own roster entry missing".to_string());
    };
    let my_unconf = ctx
        .liquid
        .unconfidential(&me.destination_address)
        .map_err(|e| format!("own address does not resolve: {}", e))?;

    let expected = me.expected_output_sats();
    let floor = expected.saturating_sub(FEE_SHARE_TOLERANCE_SATS);

    for output in summary.outputs.iter().filter(|o| !o.is_fee && !o.is_data) {
        let Some(address) = output.address.as_deref() else {
            continue;
        };
        let Ok(unconf) = ctx.liquid.unconfidential(address) else {
            continue;
        };
        if unconf == my_unconf {
            if output.amount_sats < floor {
                return Err(format!(
                    "own output underpaid: {} sat, expected at least {}",
                    output.amount_sats, floor
                ));
            }
            return Ok(());
        }
    }
    Err("own destination output missing from draft".to_string())
}

// ---------------------------------------------------------------------------
// Joiner: delegations
// ---------------------------------------------------------------------------

/// Joiner-side handling of a `Process`/`Process2` delegation: verify the
/// draft, blind/sign what this wallet owns, and return it. Any
/// verification or local processing failure removes us from the session
/// and tells the initiator why.
pub fn handle_delegation(
    session: &mut Session,
    ctx: &EngineCtx,
    from: &SessionPublicKey,
    coordination: &Coordination,
) -> Vec<EngineEvent> {
    if session.role != Role::Joiner || session.initiator != Some(*from) {
        return Vec::new();
    }
    session.last_heard_ms = ctx.clock.now_ms();
    session.claim_block_height = coordination.claim_block_height;

    // Adopt our refreshed roster entry (fee share moves as the roster and
    // fee estimate do), refusing the same rewrites a confirm would.
    if let Some(entry) = coordination.joiner.as_ref() {
        let ours = &session.parties[0];
        if entry.claim_script != ours.claim_script
            || entry.pegin_txid != ours.pegin_txid
            || entry.amount_sats != ours.amount_sats
            || entry.fee_share_sats > MAX_FEE_SHARE_SATS
        {
            return self_remove(session, from, "initiator tampered with our roster entry");
        }
        session.parties[0] = entry.for_wire();
    }

    let Some(pset) = coordination.pset.as_deref() else {
        debug!("delegation without a draft, ignoring");
        return Vec::new();
    };

    let summary = match ctx.liquid.decode_pset(pset) {
        Ok(s) => s,
        Err(_) => return self_remove(session, from, "received an undecodable draft"),
    };
    if let Err(reason) = verify_own_output(session, ctx, &summary) {
        return self_remove(session, from, &reason);
    }

    let updated = match ctx.liquid.process_pset(pset) {
        Ok(u) => u,
        Err(e) => {
            return self_remove(session, from, &format!("local blind/sign failed: {}", e))
        }
    };

    session.claim_pset = Some(updated.clone());
    session.set_status(coordination.status.clone());
    debug!(initiator = %from.short(), action = %coordination.action, "processed delegation");

    vec![EngineEvent::SendCoordination {
        to: *from,
        coordination: Coordination::new(
            CoordinationAction::Process,
            session.claim_block_height,
            "processed",
        )
        .with_pset(updated),
    }]
}

/// A joiner walking away: notify the initiator, reset, drop the route.
fn self_remove(
    session: &mut Session,
    initiator: &SessionPublicKey,
    reason: &str,
) -> Vec<EngineEvent> {
    warn!(reason, "removing ourselves from the session");
    let claim_height = session.claim_block_height;
    session.reset();
    vec![
        EngineEvent::SendCoordination {
            to: *initiator,
            coordination: Coordination::new(CoordinationAction::Remove, claim_height, reason),
        },
        EngineEvent::LeftSession {
            forget: Some(*initiator),
            reason: reason.to_string(),
        },
    ]
}
