//! # Announcement Layer
//!
//! Session start/end announcements flood the peer graph: every node
//! forwards to all its directly connected peers except the one the
//! announcement arrived from, exactly once. The once-ness comes from the
//! routing table instead of sequence numbers — a start is forwarded only
//! while its sender key is still unknown, an end only while the key is
//! still mapped. Each announcement therefore crosses every edge a bounded
//! number of times and then dies out.
//!
//! The same code path resolves dueling initiators: when an active
//! initiator sees a competing start with a strictly earlier timestamp, it
//! yields and becomes a candidate for the older session. Earliest
//! timestamp wins on both sides, so the network converges on one
//! initiator deterministically.
//!
//! This module decides; it does not act. Handlers return
//! [`AnnounceAction`] lists and the coordinator performs the sends,
//! routing-table writes, and session mutations. Keeping the decisions pure
//! makes every branch unit-testable without a transport.

use tracing::trace;

use crate::config::MAX_JOIN_ATTEMPTS;
use crate::crypto::keys::SessionPublicKey;
use crate::routing::RoutingTable;
use crate::rpc::PeerId;
use crate::session::state::{Role, Session};
use crate::wire::Envelope;

/// What the coordinator should do with an announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceAction {
    /// Map the announcement's sender key to the delivering peer.
    LearnRoute {
        key: SessionPublicKey,
        peer: PeerId,
    },
    /// Drop the sender key's route (session ended).
    ForgetRoute { key: SessionPublicKey },
    /// Re-flood the envelope to every connected peer except `from`.
    ForwardExcept { from: PeerId },
    /// Ask the announcing initiator for a roster slot.
    AttemptJoin {
        initiator: SessionPublicKey,
        join_deadline: u32,
    },
    /// Competing initiator with an earlier start: abandon our session.
    YieldSession { competitor: SessionPublicKey },
    /// Our session's initiator announced the end. `txid` is empty on
    /// failure.
    SessionEnded { txid: String, reason: String },
}

/// Handle a session-start announcement delivered by `from`.
///
/// `current_height` gates the join deadline; `has_pending_pegin` is the
/// host's word that this node actually has something to contribute.
pub fn handle_start(
    session: &Session,
    routing: &RoutingTable,
    envelope: &Envelope,
    from: &PeerId,
    my_key: &SessionPublicKey,
    current_height: u32,
    has_pending_pegin: bool,
) -> Vec<AnnounceAction> {
    let sender = envelope.sender;
    if &sender == my_key {
        // Our own flood came back around the graph. The suppression rule
        // would catch it too, but there is nothing to learn from ourselves.
        return Vec::new();
    }

    let mut actions = Vec::new();
    let first_sighting = !routing.contains(&sender);

    if first_sighting {
        actions.push(AnnounceAction::LearnRoute {
            key: sender,
            peer: from.clone(),
        });
        actions.push(AnnounceAction::ForwardExcept { from: from.clone() });
    } else {
        trace!(session = %sender.short(), "suppressing already-seen session start");
    }

    match session.role {
        Role::Joiner => {
            // Already committed to a session. Single-membership is
            // idempotent: every further start is noise.
        }
        Role::Initiator => {
            if envelope.timestamp_ms < session.started_at_ms {
                // The competitor was first. Yield and go ask for a slot in
                // their roster instead.
                actions.push(AnnounceAction::YieldSession { competitor: sender });
                if has_pending_pegin {
                    actions.push(AnnounceAction::AttemptJoin {
                        initiator: sender,
                        join_deadline: envelope.amount as u32,
                    });
                }
            }
        }
        Role::None => {
            let join_deadline = envelope.amount as u32;
            let already_asked = session.initiator == Some(sender);
            // A pending request binds us unless the new session is
            // strictly older — the same earliest-wins rule the initiators
            // apply, so candidates converge with them.
            let displaces_pending = session.initiator.is_none()
                || envelope.timestamp_ms < session.started_at_ms;
            if has_pending_pegin
                && !already_asked
                && displaces_pending
                && session.join_counter < MAX_JOIN_ATTEMPTS
                && current_height <= join_deadline
            {
                actions.push(AnnounceAction::AttemptJoin {
                    initiator: sender,
                    join_deadline,
                });
            }
        }
    }

    actions
}

/// Handle a session-end announcement delivered by `from`.
pub fn handle_end(
    session: &Session,
    routing: &RoutingTable,
    envelope: &Envelope,
    from: &PeerId,
    my_key: &SessionPublicKey,
    txid: &str,
    reason: &str,
) -> Vec<AnnounceAction> {
    let sender = envelope.sender;
    if &sender == my_key {
        return Vec::new();
    }

    if !routing.contains(&sender) {
        // Already cleaned up: this copy of the end has looped back to us.
        trace!(session = %sender.short(), "suppressing already-forgotten session end");
        return Vec::new();
    }

    let mut actions = vec![
        AnnounceAction::ForgetRoute { key: sender },
        AnnounceAction::ForwardExcept { from: from.clone() },
    ];

    // Only the initiator we are actually following can end our session.
    // Ends from strangers clean their route and nothing else.
    if session.initiator == Some(sender) {
        actions.push(AnnounceAction::SessionEnded {
            txid: txid.to_string(),
            reason: reason.to_string(),
        });
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SessionKeypair;
    use crate::devnet::MemoryStore;
    use crate::session::party::{ClaimParty, PeginContext};
    use crate::wire::{Announcement, Envelope};

    fn key() -> SessionPublicKey {
        SessionKeypair::generate().public_key()
    }

    fn self_party(pubkey: SessionPublicKey) -> ClaimParty {
        ClaimParty::from_pegin(
            &PeginContext {
                txid: "cc".repeat(32),
                vout: 0,
                claim_script: "0014self".to_string(),
                destination_address: "lq1qself".to_string(),
                claimable_height: 150,
                amount_sats: 100_000,
            },
            vec![],
            vec![],
            pubkey,
        )
    }

    fn start_envelope(sender: SessionPublicKey, ts: u64, deadline: u64) -> Envelope {
        Envelope::broadcast(sender, ts, deadline, Announcement::Started.encode().unwrap())
    }

    #[test]
    fn test_first_start_learns_and_forwards_then_suppresses() {
        let store = MemoryStore::new();
        let mut routing = RoutingTable::new();
        let session = Session::new();
        let me = key();
        let sender = key();
        let envelope = start_envelope(sender, 1_000, 200);

        let actions = handle_start(
            &session,
            &routing,
            &envelope,
            &"peer-1".to_string(),
            &me,
            100,
            false,
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::LearnRoute { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::ForwardExcept { .. })));

        // Apply the learn, then see the same start again from another peer.
        routing.learn(sender, "peer-1".to_string(), &store).unwrap();
        let again = handle_start(
            &session,
            &routing,
            &envelope,
            &"peer-2".to_string(),
            &me,
            100,
            false,
        );
        assert!(!again
            .iter()
            .any(|a| matches!(a, AnnounceAction::ForwardExcept { .. })));
    }

    #[test]
    fn test_own_announcement_ignored() {
        let routing = RoutingTable::new();
        let session = Session::new();
        let me = key();
        let envelope = start_envelope(me, 1_000, 200);
        let actions = handle_start(
            &session,
            &routing,
            &envelope,
            &"peer-1".to_string(),
            &me,
            100,
            true,
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn test_idle_node_with_pegin_joins() {
        let routing = RoutingTable::new();
        let session = Session::new();
        let me = key();
        let initiator = key();
        let envelope = start_envelope(initiator, 1_000, 200);

        let actions = handle_start(
            &session,
            &routing,
            &envelope,
            &"peer-1".to_string(),
            &me,
            100,
            true,
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            AnnounceAction::AttemptJoin { initiator: i, join_deadline: 200 } if *i == initiator
        )));
    }

    #[test]
    fn test_join_deadline_passed_no_join() {
        let routing = RoutingTable::new();
        let session = Session::new();
        let envelope = start_envelope(key(), 1_000, 200);
        let actions = handle_start(
            &session,
            &routing,
            &envelope,
            &"peer-1".to_string(),
            &key(),
            201, // one past the deadline
            true,
        );
        assert!(!actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::AttemptJoin { .. })));
    }

    #[test]
    fn test_join_attempts_exhausted_no_join() {
        let routing = RoutingTable::new();
        let mut session = Session::new();
        session.join_counter = MAX_JOIN_ATTEMPTS;
        let envelope = start_envelope(key(), 1_000, 200);
        let actions = handle_start(
            &session,
            &routing,
            &envelope,
            &"peer-1".to_string(),
            &key(),
            100,
            true,
        );
        assert!(!actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::AttemptJoin { .. })));
    }

    #[test]
    fn test_pending_request_only_displaced_by_earlier_start() {
        let routing = RoutingTable::new();
        let me = key();
        let first_initiator = key();
        let mut session = Session::new();
        // We already asked to join a session announced at t=1_000.
        session.note_join_requested(first_initiator, self_party(me), 1_000, 1_100);

        // A later competing start does not move us.
        let later = start_envelope(key(), 1_500, 300);
        let actions = handle_start(
            &session,
            &routing,
            &later,
            &"peer-1".to_string(),
            &me,
            100,
            true,
        );
        assert!(!actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::AttemptJoin { .. })));

        // A strictly earlier one does.
        let earlier = start_envelope(key(), 999, 300);
        let actions = handle_start(
            &session,
            &routing,
            &earlier,
            &"peer-1".to_string(),
            &me,
            100,
            true,
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::AttemptJoin { .. })));
    }

    #[test]
    fn test_committed_joiner_ignores_starts() {
        let routing = RoutingTable::new();
        let me = key();
        let mut session = Session::new();
        session.become_joiner(key(), self_party(me), 200, 1_000);

        let envelope = start_envelope(key(), 500, 300);
        let actions = handle_start(
            &session,
            &routing,
            &envelope,
            &"peer-1".to_string(),
            &me,
            100,
            true,
        );
        // Flood bookkeeping still happens; membership does not change.
        assert!(!actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::AttemptJoin { .. })));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::YieldSession { .. })));
    }

    #[test]
    fn test_initiator_yields_to_strictly_earlier_start() {
        let routing = RoutingTable::new();
        let me = key();
        let mut session = Session::new();
        session.begin_initiator(self_party(me), 1_000);

        let competitor = key();
        let earlier = start_envelope(competitor, 999, 200);
        let actions = handle_start(
            &session,
            &routing,
            &earlier,
            &"peer-1".to_string(),
            &me,
            100,
            true,
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::YieldSession { competitor: c } if *c == competitor)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::AttemptJoin { .. })));
    }

    #[test]
    fn test_initiator_keeps_session_against_later_start() {
        let routing = RoutingTable::new();
        let me = key();
        let mut session = Session::new();
        session.begin_initiator(self_party(me), 1_000);

        // Equal timestamps also keep: the rule is *strictly* earlier.
        for ts in [1_000, 1_001] {
            let envelope = start_envelope(key(), ts, 200);
            let actions = handle_start(
                &session,
                &routing,
                &envelope,
                &"peer-1".to_string(),
                &me,
                100,
                true,
            );
            assert!(
                !actions
                    .iter()
                    .any(|a| matches!(a, AnnounceAction::YieldSession { .. })),
                "yielded to ts={}",
                ts
            );
        }
    }

    #[test]
    fn test_end_forgets_forwards_then_suppresses() {
        let store = MemoryStore::new();
        let mut routing = RoutingTable::new();
        let me = key();
        let initiator = key();
        routing
            .learn(initiator, "peer-1".to_string(), &store)
            .unwrap();

        let mut session = Session::new();
        session.become_joiner(initiator, self_party(me), 200, 1_000);

        let envelope = Envelope::broadcast(
            initiator,
            2_000,
            0,
            Announcement::Ended {
                txid: "ff".repeat(32),
                reason: String::new(),
            }
            .encode()
            .unwrap(),
        );

        let actions = handle_end(
            &session,
            &routing,
            &envelope,
            &"peer-1".to_string(),
            &me,
            &"ff".repeat(32),
            "",
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::ForgetRoute { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::ForwardExcept { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::SessionEnded { .. })));

        // After the forget is applied, the looped-back copy is suppressed.
        routing.forget(&initiator, &store).unwrap();
        let again = handle_end(
            &session,
            &routing,
            &envelope,
            &"peer-2".to_string(),
            &me,
            &"ff".repeat(32),
            "",
        );
        assert!(again.is_empty());
    }

    #[test]
    fn test_end_from_stranger_cleans_route_only() {
        let store = MemoryStore::new();
        let mut routing = RoutingTable::new();
        let me = key();
        let stranger = key();
        routing
            .learn(stranger, "peer-3".to_string(), &store)
            .unwrap();

        let session = Session::new();
        let envelope = Envelope::broadcast(
            stranger,
            2_000,
            0,
            Announcement::Ended {
                txid: String::new(),
                reason: "gave up".to_string(),
            }
            .encode()
            .unwrap(),
        );

        let actions = handle_end(
            &session,
            &routing,
            &envelope,
            &"peer-3".to_string(),
            &me,
            "",
            "gave up",
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::ForgetRoute { .. })));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, AnnounceAction::SessionEnded { .. })));
    }
}
