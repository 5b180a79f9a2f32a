//! # Claim Coordinator
//!
//! The node-level object that owns the session aggregate, the routing
//! table, and the collaborator handles, and wires the decision engines to
//! actual I/O. Hosts drive it from exactly two entry points:
//!
//! - [`on_envelope`](ClaimCoordinator::on_envelope) — an envelope arrived
//!   from a directly connected peer;
//! - [`on_block`](ClaimCoordinator::on_block) — a new Bitcoin
//!   confirmation height was observed.
//!
//! Both entry points take `&mut self`: the session has a single logical
//! owner and every mutation is sequential. Hosts that receive messages on
//! multiple threads put the coordinator behind a mutex; nothing in here
//! blocks on the network beyond the synchronous collaborator calls.
//!
//! Persistence discipline: the session snapshot is written after every
//! entry point that may have mutated state, and the routing table writes
//! through on every change, so a crash between a send and its reply
//! resumes the same round on the next trigger.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::announce::{self, AnnounceAction};
use crate::config::{KEY_IDENTITY, NS_SESSION, POLL_SILENCE};
use crate::crypto::{ecies, keys::KeyError, SessionKeypair, SessionPublicKey};
use crate::engine::{self, EngineCtx, EngineEvent, TickOutcome};
use crate::membership::{self, MembershipOutcome};
use crate::routing::RoutingTable;
use crate::rpc::{
    ChainError, ChainFacts, Clock, LiquidService, PeerDirectory, PeerId, PeerTransport, Store,
    StoreError,
};
use crate::session::party::{ClaimParty, PeginContext};
use crate::session::state::{Role, Session, SessionSummary};
use crate::wire::{
    Announcement, Coordination, CoordinationAction, Envelope, Memo, WireError,
};

/// The external systems a coordinator runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn PeerTransport + Send + Sync>,
    pub directory: Arc<dyn PeerDirectory + Send + Sync>,
    pub chain: Arc<dyn ChainFacts + Send + Sync>,
    pub liquid: Arc<dyn LiquidService + Send + Sync>,
    pub store: Arc<dyn Store + Send + Sync>,
    pub clock: Arc<dyn Clock + Send + Sync>,
}

/// Errors a coordinator entry point can surface to the host. Protocol
/// misbehavior never lands here — that degrades to logs and session
/// resets. These are infrastructure failures the host may want to see.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("identity error: {0}")]
    Key(#[from] KeyError),

    #[error("no pending peg-in to claim")]
    NoPegin,

    #[error("a session is already active")]
    SessionActive,
}

/// The per-node protocol driver.
pub struct ClaimCoordinator {
    keypair: SessionKeypair,
    session: Session,
    routing: RoutingTable,
    pegin: Option<PeginContext>,
    deps: Collaborators,
}

impl ClaimCoordinator {
    /// A fresh coordinator with a newly generated session identity.
    pub fn new(deps: Collaborators) -> Result<Self, CoordinatorError> {
        let keypair = SessionKeypair::generate();
        deps.store
            .save(NS_SESSION, KEY_IDENTITY, &keypair.secret_bytes())?;
        let session = Session::new();
        session.persist(deps.store.as_ref())?;
        Ok(Self {
            keypair,
            session,
            routing: RoutingTable::new(),
            pegin: None,
            deps,
        })
    }

    /// Resume from the durable store after a restart. `pegin_still_pending`
    /// is the host's observation of whether our own peg-in remains
    /// unclaimed; a session whose peg-in already resolved is force-reset.
    pub fn restore(
        deps: Collaborators,
        pegin_still_pending: bool,
    ) -> Result<Self, CoordinatorError> {
        let keypair = match deps.store.load(NS_SESSION, KEY_IDENTITY)? {
            Some(bytes) => SessionKeypair::from_secret_bytes(&bytes)?,
            None => {
                let kp = SessionKeypair::generate();
                deps.store.save(NS_SESSION, KEY_IDENTITY, &kp.secret_bytes())?;
                kp
            }
        };
        let mut session = Session::restore(deps.store.as_ref())?.unwrap_or_else(Session::new);
        let mut routing = RoutingTable::restore(deps.store.as_ref())?;

        if session.is_active() && !pegin_still_pending {
            info!("restored session but the peg-in already resolved; resetting");
            session.reset();
            routing.clear(deps.store.as_ref())?;
        }
        session.persist(deps.store.as_ref())?;

        info!(
            role = %session.role,
            parties = session.parties.len(),
            routes = routing.len(),
            "session restored"
        );
        Ok(Self {
            keypair,
            session,
            routing,
            pegin: None,
            deps,
        })
    }

    /// Tell the coordinator about (or clear) this node's pending peg-in.
    pub fn set_pegin(&mut self, pegin: Option<PeginContext>) {
        self.pegin = pegin;
    }

    /// This session's public identity.
    pub fn public_key(&self) -> SessionPublicKey {
        self.keypair.public_key()
    }

    /// Host-facing state snapshot.
    pub fn summary(&self) -> SessionSummary {
        self.session.summary()
    }

    /// The human-readable status line.
    pub fn status(&self) -> String {
        self.session.status.clone()
    }

    /// Read-only view of the session, for tests and diagnostics.
    pub fn session(&self) -> &Session {
        &self.session
    }

    // -----------------------------------------------------------------
    // Session start
    // -----------------------------------------------------------------

    /// Open a new session with ourselves as initiator and announce it to
    /// the network. Call when our peg-in has confirmed and no session is
    /// active.
    pub fn start_initiator(&mut self) -> Result<(), CoordinatorError> {
        if self.session.is_active() {
            return Err(CoordinatorError::SessionActive);
        }
        let pegin = self.pegin.clone().ok_or(CoordinatorError::NoPegin)?;
        let party = self.own_party(&pegin)?;
        let now = self.now_ms();

        self.session.begin_initiator(party, now);
        self.persist()?;

        let envelope = Envelope::broadcast(
            self.public_key(),
            now,
            self.session.join_block_height as u64,
            Announcement::Started.encode()?,
        );
        self.flood(&envelope, None);
        info!(
            session = %self.public_key().short(),
            claim_height = self.session.claim_block_height,
            "announced new session"
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Inbound envelopes
    // -----------------------------------------------------------------

    /// Handle one envelope delivered by the peer transport.
    pub fn on_envelope(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
    ) -> Result<(), CoordinatorError> {
        match envelope.destination {
            None => match envelope.memo {
                Memo::Broadcast => self.on_broadcast(from, &envelope)?,
                Memo::Poll => self.on_poll(from, &envelope)?,
                _ => debug!(memo = %envelope.memo, "directed memo without destination, dropping"),
            },
            Some(dest) if dest == self.public_key() => match envelope.memo {
                Memo::Process => self.on_sealed(from, &envelope)?,
                Memo::Unable => self.on_unable(&envelope)?,
                _ => debug!(memo = %envelope.memo, "unexpected directed memo, dropping"),
            },
            Some(dest) => self.relay(from, &envelope, &dest)?,
        }
        self.persist()?;
        Ok(())
    }

    fn on_broadcast(&mut self, from: &PeerId, envelope: &Envelope) -> Result<(), CoordinatorError> {
        let announcement = match Announcement::decode(&envelope.payload) {
            Ok(a) => a,
            Err(e) => {
                debug!(error = %e, "undecodable announcement, dropping");
                return Ok(());
            }
        };
        let height = self
            .deps
            .chain
            .current_confirmation_height()
            .unwrap_or(u32::MAX);
        let my_key = self.public_key();

        let actions = match &announcement {
            Announcement::Started => announce::handle_start(
                &self.session,
                &self.routing,
                envelope,
                from,
                &my_key,
                height,
                self.pegin.is_some(),
            ),
            Announcement::Ended { txid, reason } => announce::handle_end(
                &self.session,
                &self.routing,
                envelope,
                from,
                &my_key,
                txid,
                reason,
            ),
        };
        self.execute_announce(actions, envelope)
    }

    fn execute_announce(
        &mut self,
        actions: Vec<AnnounceAction>,
        envelope: &Envelope,
    ) -> Result<(), CoordinatorError> {
        for action in actions {
            match action {
                AnnounceAction::LearnRoute { key, peer } => {
                    self.routing.learn(key, peer, self.deps.store.as_ref())?;
                }
                AnnounceAction::ForgetRoute { key } => {
                    self.routing.forget(&key, self.deps.store.as_ref())?;
                }
                AnnounceAction::ForwardExcept { from } => {
                    self.flood(envelope, Some(&from));
                }
                AnnounceAction::AttemptJoin { initiator, .. } => {
                    self.attempt_join(initiator, envelope.timestamp_ms)?;
                }
                AnnounceAction::YieldSession { competitor } => {
                    info!(
                        competitor = %competitor.short(),
                        "competing session started earlier; yielding"
                    );
                    // Keep the routing table: the route to the competitor
                    // is how we ask to join their session next.
                    self.session.reset();
                    self.session.set_status("yielded to an earlier session");
                }
                AnnounceAction::SessionEnded { txid, reason } => {
                    self.session.reset();
                    self.routing.clear(self.deps.store.as_ref())?;
                    if txid.is_empty() {
                        info!(reason = %reason, "session ended without a claim");
                        self.session.set_status(format!("session ended: {}", reason));
                    } else {
                        info!(%txid, "session completed");
                        self.session
                            .set_status(format!("claim completed in {}", txid));
                        // Our peg-in went with it.
                        self.pegin = None;
                    }
                }
            }
        }
        Ok(())
    }

    fn on_poll(&mut self, from: &PeerId, envelope: &Envelope) -> Result<(), CoordinatorError> {
        let sender = envelope.sender;
        if sender == self.public_key() {
            return Ok(());
        }

        // Polls flood like session starts: forward on first sighting only.
        if !self.routing.contains(&sender) {
            self.routing
                .learn(sender, from.clone(), self.deps.store.as_ref())?;
            self.flood(envelope, Some(from));
        }

        // An initiator answers a roster member's poll with its current
        // state; the member may have restarted and lost the thread.
        if self.session.role == Role::Initiator {
            if let Some(party) = self.session.party_mut(&sender) {
                party.note_reply();
                let entry = party.for_wire();
                let coordination = Coordination::new(
                    CoordinationAction::ConfirmAdd,
                    self.session.claim_block_height,
                    self.session.status.clone(),
                )
                .with_joiner(entry);
                debug!(party = %sender.short(), "answering poll with roster refresh");
                self.send_coordination(sender, coordination)?;
            }
        }
        Ok(())
    }

    fn on_sealed(&mut self, from: &PeerId, envelope: &Envelope) -> Result<(), CoordinatorError> {
        let plaintext = match ecies::decrypt(&self.keypair, &envelope.payload) {
            Ok(p) => p,
            Err(e) => {
                // Crypto failures drop the message; the same bytes can
                // never decrypt on a second try.
                warn!(error = %e, from = %envelope.sender.short(), "dropping undecryptable envelope");
                return Ok(());
            }
        };
        let coordination = match Coordination::decode(&plaintext) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "dropping malformed coordination message");
                return Ok(());
            }
        };

        let sender = envelope.sender;
        // Reply routing is asymmetric: remember which peer speaks for this
        // key, whatever the message was.
        self.routing
            .learn(sender, from.clone(), self.deps.store.as_ref())?;
        // Any word from a counterpart settles its outstanding request.
        if let Some(party) = self.session.party_mut(&sender) {
            party.note_reply();
        }
        if self.session.initiator == Some(sender) {
            self.session.last_heard_ms = self.now_ms();
        }

        debug!(
            action = %coordination.action,
            from = %sender.short(),
            "coordination message"
        );
        self.dispatch(sender, coordination)
    }

    fn dispatch(
        &mut self,
        sender: SessionPublicKey,
        coordination: Coordination,
    ) -> Result<(), CoordinatorError> {
        match coordination.action {
            CoordinationAction::Add => {
                let outcomes = membership::handle_add(
                    &mut self.session,
                    &sender,
                    &coordination,
                    self.deps.chain.as_ref(),
                );
                self.execute_membership(outcomes)
            }
            CoordinationAction::ConfirmAdd => {
                let now = self.now_ms();
                let outcomes =
                    membership::handle_confirm_add(&mut self.session, &sender, &coordination, now);
                self.execute_membership(outcomes)
            }
            CoordinationAction::RefuseAdd => {
                let outcomes =
                    membership::handle_refuse_add(&mut self.session, &sender, &coordination);
                self.execute_membership(outcomes)
            }
            CoordinationAction::Remove => {
                let outcomes = membership::handle_remove(&mut self.session, &sender, &coordination);
                self.execute_membership(outcomes)
            }
            CoordinationAction::Process | CoordinationAction::Process2 => {
                match self.session.role {
                    Role::Initiator => {
                        let events = self.with_ctx(|session, ctx| {
                            engine::handle_process_reply(session, ctx, &sender, &coordination)
                        });
                        self.execute_engine(events)?;
                        // The reply may have unblocked the next round;
                        // keep driving instead of waiting for a tick.
                        self.drive()?;
                        Ok(())
                    }
                    Role::Joiner => {
                        let events = self.with_ctx(|session, ctx| {
                            engine::handle_delegation(session, ctx, &sender, &coordination)
                        });
                        self.execute_engine(events)
                    }
                    Role::None => Ok(()),
                }
            }
        }
    }

    fn on_unable(&mut self, envelope: &Envelope) -> Result<(), CoordinatorError> {
        let Ok(key) = SessionPublicKey::try_from_slice(&envelope.payload) else {
            debug!("unable notice without a valid key, dropping");
            return Ok(());
        };
        warn!(unreachable = %key.short(), "peer reported destination unreachable");
        self.handle_unreachable(key)
    }

    /// Shared failure path for "this session key cannot be reached":
    /// forget the stale route, then either eject the party (initiator) or
    /// reset (the unreachable party was our initiator).
    fn handle_unreachable(&mut self, key: SessionPublicKey) -> Result<(), CoordinatorError> {
        self.routing.forget(&key, self.deps.store.as_ref())?;
        match self.session.role {
            Role::Initiator => {
                if self.session.party(&key).is_some() {
                    let outcomes =
                        membership::eject(&mut self.session, &key, "peer unreachable");
                    self.execute_membership(outcomes)?;
                }
            }
            _ => {
                if self.session.initiator == Some(key) {
                    info!("initiator unreachable; leaving session");
                    self.session.reset();
                    self.session.set_status("initiator unreachable");
                }
            }
        }
        Ok(())
    }

    /// Forward an envelope addressed to someone else. Unknown destinations
    /// earn the sender an `Unable` notice along the reverse path.
    fn relay(
        &mut self,
        from: &PeerId,
        envelope: &Envelope,
        dest: &SessionPublicKey,
    ) -> Result<(), CoordinatorError> {
        // Learn the reverse path first so the reply can come back through
        // us.
        self.routing
            .learn(envelope.sender, from.clone(), self.deps.store.as_ref())?;

        match self.routing.resolve(dest).cloned() {
            Some(next_hop) => {
                debug!(dest = %dest.short(), via = %next_hop, "relaying envelope");
                if let Err(e) = self.deps.transport.send(&next_hop, envelope) {
                    warn!(error = %e, "relay hop failed; notifying sender");
                    self.routing.forget(dest, self.deps.store.as_ref())?;
                    self.send_unable(from, &envelope.sender, dest)?;
                }
            }
            None => {
                debug!(dest = %dest.short(), "no route for destination; notifying sender");
                self.send_unable(from, &envelope.sender, dest)?;
            }
        }
        Ok(())
    }

    fn send_unable(
        &mut self,
        via: &PeerId,
        to: &SessionPublicKey,
        unreachable: &SessionPublicKey,
    ) -> Result<(), CoordinatorError> {
        let notice = Envelope::directed(
            Memo::Unable,
            self.public_key(),
            *to,
            self.now_ms(),
            unreachable.as_bytes().to_vec(),
        );
        if let Err(e) = self.deps.transport.send(via, &notice) {
            debug!(error = %e, "could not deliver unable notice");
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Block ticks
    // -----------------------------------------------------------------

    /// A new confirmation height was observed. Drives the initiator's
    /// construction loop; joiners use the tick for liveness polling.
    pub fn on_block(&mut self) -> Result<TickOutcome, CoordinatorError> {
        let outcome = match self.session.role {
            Role::Initiator => self.drive()?,
            Role::Joiner => {
                self.maybe_poll()?;
                TickOutcome::Idle
            }
            Role::None => TickOutcome::Idle,
        };
        self.persist()?;
        Ok(outcome)
    }

    fn drive(&mut self) -> Result<TickOutcome, CoordinatorError> {
        if self.session.role != Role::Initiator {
            return Ok(TickOutcome::Idle);
        }
        let result = self.with_ctx(engine::drive);
        self.execute_engine(result.events)?;
        self.persist()?;
        Ok(result.outcome)
    }

    /// A joiner that has heard nothing for too long floods a poll so the
    /// initiator (wherever it is now) can re-establish contact.
    fn maybe_poll(&mut self) -> Result<(), CoordinatorError> {
        let now = self.now_ms();
        let silence = now.saturating_sub(self.session.last_heard_ms);
        if silence < POLL_SILENCE.as_millis() as u64 {
            return Ok(());
        }
        let Some(pegin) = self.pegin.as_ref() else {
            return Ok(());
        };
        info!(silence_ms = silence, "initiator silent; polling");
        self.session.set_status("polling for the initiator");
        self.session.last_heard_ms = now; // rate-limit the polls
        let envelope = Envelope {
            memo: Memo::Poll,
            ..Envelope::broadcast(self.public_key(), now, 0, pegin.txid.clone().into_bytes())
        };
        self.flood(&envelope, None);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Join path
    // -----------------------------------------------------------------

    fn attempt_join(
        &mut self,
        initiator: SessionPublicKey,
        announced_at_ms: u64,
    ) -> Result<(), CoordinatorError> {
        let Some(pegin) = self.pegin.clone() else {
            return Ok(());
        };
        let party = match self.own_party(&pegin) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "cannot assemble our claim party; not joining");
                return Ok(());
            }
        };
        let now = self.now_ms();
        self.session
            .note_join_requested(initiator, party.clone(), announced_at_ms, now);
        self.persist()?;

        let coordination = Coordination::new(
            CoordinationAction::Add,
            pegin.claimable_height,
            "requesting to join",
        )
        .with_joiner(party.for_wire());
        info!(initiator = %initiator.short(), attempt = self.session.join_counter, "asking to join");
        self.send_coordination(initiator, coordination)
    }

    /// Our own roster entry, with fresh chain artifacts.
    fn own_party(&self, pegin: &PeginContext) -> Result<ClaimParty, CoordinatorError> {
        let raw_tx = self.deps.chain.get_raw_transaction(&pegin.txid)?;
        let proof = self.deps.chain.get_inclusion_proof(&pegin.txid)?;
        Ok(ClaimParty::from_pegin(pegin, raw_tx, proof, self.public_key()))
    }

    // -----------------------------------------------------------------
    // Outcome execution
    // -----------------------------------------------------------------

    fn execute_membership(
        &mut self,
        outcomes: Vec<MembershipOutcome>,
    ) -> Result<(), CoordinatorError> {
        for outcome in outcomes {
            match outcome {
                MembershipOutcome::Reply { to, coordination } => {
                    self.send_coordination(to, coordination)?;
                }
                MembershipOutcome::Joined => {
                    info!(initiator = ?self.session.initiator.map(|k| k.short()), "joined session");
                }
                MembershipOutcome::Left { forget, reason } => {
                    info!(reason = %reason, "left session");
                    if let Some(key) = forget {
                        self.routing.forget(&key, self.deps.store.as_ref())?;
                    }
                }
                MembershipOutcome::Removed { party } => {
                    self.routing
                        .forget(&party.pubkey, self.deps.store.as_ref())?;
                }
            }
        }
        Ok(())
    }

    fn execute_engine(&mut self, events: Vec<EngineEvent>) -> Result<(), CoordinatorError> {
        for event in events {
            match event {
                EngineEvent::SendCoordination { to, coordination } => {
                    self.send_coordination(to, coordination)?;
                }
                EngineEvent::Kick { key, reason } => {
                    let outcomes = membership::eject(&mut self.session, &key, &reason);
                    self.execute_membership(outcomes)?;
                    self.routing.forget(&key, self.deps.store.as_ref())?;
                }
                EngineEvent::AnnounceEnd { txid, reason } => {
                    self.announce_end(&txid, &reason)?;
                }
                EngineEvent::LeftSession { forget, reason } => {
                    info!(reason = %reason, "left session");
                    if let Some(key) = forget {
                        self.routing.forget(&key, self.deps.store.as_ref())?;
                    }
                }
            }
        }
        Ok(())
    }

    fn announce_end(&mut self, txid: &str, reason: &str) -> Result<(), CoordinatorError> {
        let envelope = Envelope::broadcast(
            self.public_key(),
            self.now_ms(),
            0,
            Announcement::Ended {
                txid: txid.to_string(),
                reason: reason.to_string(),
            }
            .encode()?,
        );
        self.flood(&envelope, None);

        if !txid.is_empty() {
            // Our peg-in is claimed; a future session would have nothing
            // to contribute.
            self.pegin = None;
        }
        let status = self.session.status.clone();
        self.session.reset();
        self.session.set_status(status); // keep the last word visible
        self.routing.clear(self.deps.store.as_ref())?;
        self.persist()?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------

    /// Run an engine call with borrowed collaborators.
    fn with_ctx<R>(&mut self, f: impl FnOnce(&mut Session, &EngineCtx) -> R) -> R {
        let chain = Arc::clone(&self.deps.chain);
        let liquid = Arc::clone(&self.deps.liquid);
        let clock = Arc::clone(&self.deps.clock);
        let ctx = EngineCtx {
            my_key: self.keypair.public_key(),
            chain: chain.as_ref(),
            liquid: liquid.as_ref(),
            clock: clock.as_ref(),
        };
        f(&mut self.session, &ctx)
    }

    /// Seal a coordination message to a session key and send it along the
    /// learned route.
    fn send_coordination(
        &mut self,
        to: SessionPublicKey,
        coordination: Coordination,
    ) -> Result<(), CoordinatorError> {
        let plaintext = coordination.encode()?;
        let payload = match ecies::encrypt(&to, &plaintext) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, to = %to.short(), "cannot seal message; dropping");
                return Ok(());
            }
        };
        let envelope = Envelope::directed(
            Memo::Process,
            self.public_key(),
            to,
            self.now_ms(),
            payload,
        );

        let Some(peer) = self.routing.resolve(&to).cloned() else {
            warn!(to = %to.short(), "no route for coordination message");
            return Ok(());
        };
        if let Err(e) = self.deps.transport.send(&peer, &envelope) {
            warn!(error = %e, to = %to.short(), via = %peer, "send failed");
            self.handle_unreachable(to)?;
        }
        Ok(())
    }

    /// Send an envelope to every connected peer, optionally skipping the
    /// one it came from.
    fn flood(&self, envelope: &Envelope, except: Option<&PeerId>) {
        for peer in self.deps.directory.list_connected_peers() {
            if Some(&peer) == except {
                continue;
            }
            if let Err(e) = self.deps.transport.send(&peer, envelope) {
                debug!(peer = %peer, error = %e, "flood send failed");
            }
        }
    }

    fn persist(&self) -> Result<(), CoordinatorError> {
        self.session.persist(self.deps.store.as_ref())?;
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.deps.clock.now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devnet::{HubEndpoint, LiquidHub, MemoryChain, MemoryClock, MemoryHub, MemoryStore};

    fn collaborators(
        endpoint: HubEndpoint,
        chain: Arc<MemoryChain>,
        liquid: &LiquidHub,
        wallet: &str,
        clock: Arc<MemoryClock>,
    ) -> Collaborators {
        Collaborators {
            transport: Arc::new(endpoint.clone()),
            directory: Arc::new(endpoint),
            chain,
            liquid: Arc::new(liquid.wallet(wallet)),
            store: Arc::new(MemoryStore::new()),
            clock,
        }
    }

    fn pegin_for(liquid: &LiquidHub, wallet: &str, height: u32, amount: u64) -> PeginContext {
        let handle = liquid.wallet(wallet);
        PeginContext {
            txid: format!("{:0>64}", wallet),
            vout: 0,
            claim_script: handle.claim_script(),
            destination_address: handle.confidential_address(),
            claimable_height: height,
            amount_sats: amount,
        }
    }

    #[test]
    fn test_start_requires_pegin_and_idle_session() {
        let hub = MemoryHub::new();
        hub.link("a", "b");
        let chain = Arc::new(MemoryChain::new(100));
        let liquid = LiquidHub::new();
        let clock = Arc::new(MemoryClock::new(1_000));

        let mut coordinator = ClaimCoordinator::new(collaborators(
            hub.endpoint("a"),
            Arc::clone(&chain),
            &liquid,
            "alice",
            clock,
        ))
        .unwrap();

        assert!(matches!(
            coordinator.start_initiator(),
            Err(CoordinatorError::NoPegin)
        ));

        let pegin = pegin_for(&liquid, "alice", 150, 100_000);
        chain.register_pegin(&pegin);
        coordinator.set_pegin(Some(pegin));
        coordinator.start_initiator().unwrap();
        assert_eq!(coordinator.session().role, Role::Initiator);

        assert!(matches!(
            coordinator.start_initiator(),
            Err(CoordinatorError::SessionActive)
        ));

        // The announcement reached the only neighbor.
        let b_mail = hub.endpoint("b").drain();
        assert_eq!(b_mail.len(), 1);
        assert_eq!(b_mail[0].1.memo, Memo::Broadcast);
    }

    #[test]
    fn test_relay_unknown_destination_sends_unable() {
        let hub = MemoryHub::new();
        hub.link("a", "b");
        let chain = Arc::new(MemoryChain::new(100));
        let liquid = LiquidHub::new();
        let clock = Arc::new(MemoryClock::new(1_000));

        let mut relay_node = ClaimCoordinator::new(collaborators(
            hub.endpoint("a"),
            chain,
            &liquid,
            "relay",
            clock,
        ))
        .unwrap();

        let sender = SessionKeypair::generate();
        let nowhere = SessionKeypair::generate().public_key();
        let envelope = Envelope::directed(
            Memo::Process,
            sender.public_key(),
            nowhere,
            1_000,
            vec![1, 2, 3],
        );

        relay_node.on_envelope(&"b".to_string(), envelope).unwrap();

        // The unable notice went back to b, naming the unreachable key.
        let mail = hub.endpoint("b").drain();
        assert_eq!(mail.len(), 1);
        let notice = &mail[0].1;
        assert_eq!(notice.memo, Memo::Unable);
        assert_eq!(notice.destination, Some(sender.public_key()));
        assert_eq!(
            SessionPublicKey::try_from_slice(&notice.payload).unwrap(),
            nowhere
        );
    }

    #[test]
    fn test_garbage_ciphertext_is_dropped_quietly() {
        let hub = MemoryHub::new();
        hub.link("a", "b");
        let chain = Arc::new(MemoryChain::new(100));
        let liquid = LiquidHub::new();
        let clock = Arc::new(MemoryClock::new(1_000));

        let mut coordinator = ClaimCoordinator::new(collaborators(
            hub.endpoint("a"),
            chain,
            &liquid,
            "alice",
            clock,
        ))
        .unwrap();
        let me = coordinator.public_key();

        let envelope = Envelope::directed(
            Memo::Process,
            SessionKeypair::generate().public_key(),
            me,
            1_000,
            vec![0xFF; 64], // not a valid sealed message
        );
        // No panic, no state change.
        coordinator.on_envelope(&"b".to_string(), envelope).unwrap();
        assert_eq!(coordinator.session().role, Role::None);
    }
}
