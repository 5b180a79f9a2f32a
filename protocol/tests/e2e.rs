//! End-to-end integration tests for ClaimJoin.
//!
//! These run complete multi-party sessions over the devnet harness: real
//! envelopes through a line-topology hub (so relaying actually happens),
//! real ECIES sealing, real flood suppression, the full blinding/signing
//! ceremony, fee convergence, and the end-of-session teardown.
//!
//! Each test builds its own network with its own stores and clock. No
//! shared state between tests, no ordering dependencies.

use std::sync::Arc;

use claimjoin_protocol::config::{FEE_SHARE_TOLERANCE_SATS, RESEND_COOLDOWN};
use claimjoin_protocol::coordinator::{ClaimCoordinator, Collaborators};
use claimjoin_protocol::devnet::{
    HubEndpoint, LiquidHub, MemoryChain, MemoryClock, MemoryHub, MemoryStore,
};
use claimjoin_protocol::rpc::LiquidService;
use claimjoin_protocol::session::party::PeginContext;
use claimjoin_protocol::session::state::Role;

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

struct Node {
    name: String,
    endpoint: HubEndpoint,
    store: Arc<MemoryStore>,
    coordinator: ClaimCoordinator,
    /// Dead nodes keep receiving mail but never process it.
    alive: bool,
}

struct Network {
    chain: Arc<MemoryChain>,
    liquid: LiquidHub,
    clock: Arc<MemoryClock>,
    nodes: Vec<Node>,
}

impl Network {
    /// A line topology (`names[0] - names[1] - ...`) with one registered
    /// peg-in per node. `pegins` gives each node's (claimable_height,
    /// amount).
    fn line(names: &[&str], start_height: u32, pegins: &[(u32, u64)]) -> Self {
        assert_eq!(names.len(), pegins.len());
        let hub = MemoryHub::new();
        for pair in names.windows(2) {
            hub.link(pair[0], pair[1]);
        }
        let chain = Arc::new(MemoryChain::new(start_height));
        let liquid = LiquidHub::new();
        let clock = Arc::new(MemoryClock::new(1_000_000));

        let mut nodes = Vec::new();
        for (name, (height, amount)) in names.iter().zip(pegins) {
            let endpoint = hub.endpoint(name);
            let store = Arc::new(MemoryStore::new());
            let deps = Collaborators {
                transport: Arc::new(endpoint.clone()),
                directory: Arc::new(endpoint.clone()),
                chain: chain.clone(),
                liquid: Arc::new(liquid.wallet(name)),
                store: store.clone(),
                clock: clock.clone(),
            };
            let mut coordinator = ClaimCoordinator::new(deps).expect("coordinator");

            let pegin = PeginContext {
                txid: format!("{:0>64}", name),
                vout: 0,
                claim_script: liquid.wallet(name).claim_script(),
                destination_address: liquid.wallet(name).confidential_address(),
                claimable_height: *height,
                amount_sats: *amount,
            };
            chain.register_pegin(&pegin);
            coordinator.set_pegin(Some(pegin));

            nodes.push(Node {
                name: name.to_string(),
                endpoint,
                store,
                coordinator,
                alive: true,
            });
        }

        Self {
            chain,
            liquid,
            clock,
            nodes,
        }
    }

    fn node(&mut self, name: &str) -> &mut Node {
        self.nodes
            .iter_mut()
            .find(|n| n.name == name)
            .expect("known node")
    }

    /// Deliver queued mail once. Returns whether anything was processed.
    fn pump(&mut self) -> bool {
        let mut moved = false;
        for node in &mut self.nodes {
            let mail = node.endpoint.drain();
            if !node.alive {
                continue; // mail discarded: the node is "offline"
            }
            for (from, envelope) in mail {
                moved = true;
                node.coordinator
                    .on_envelope(&from, envelope)
                    .expect("envelope handling");
            }
        }
        moved
    }

    /// Pump until the network goes quiet.
    fn settle(&mut self) {
        for _ in 0..100 {
            if !self.pump() {
                return;
            }
        }
        panic!("network did not settle");
    }

    /// Tick every live node at the current height.
    fn tick_timers(&mut self) {
        for node in &mut self.nodes {
            if node.alive {
                node.coordinator.on_block().expect("tick");
            }
        }
        self.settle();
    }

    fn broadcast_txid(&self) -> Option<String> {
        let txids = self.liquid.broadcast_txids();
        assert!(txids.len() <= 1, "more than one claim broadcast");
        txids.first().cloned()
    }
}

// ---------------------------------------------------------------------------
// 1. Two-Party End-to-End
// ---------------------------------------------------------------------------

#[test]
fn two_party_session_claims_jointly() {
    let mut net = Network::line(&["alice", "bob"], 100, &[(150, 100_000), (140, 60_000)]);

    net.node("alice").coordinator.start_initiator().unwrap();
    net.settle();

    // Bob asked to join and was admitted.
    assert_eq!(net.node("bob").coordinator.session().role, Role::Joiner);
    assert_eq!(net.node("alice").coordinator.session().parties.len(), 2);
    assert_eq!(
        net.node("alice").coordinator.session().claim_block_height,
        150
    );

    // Mine to the claim height; the ceremony cascades through replies.
    net.chain.set_height(150);
    net.tick_timers();

    let txid = net.broadcast_txid().expect("claim was broadcast");
    assert!(!txid.is_empty());

    // Both nodes tore down to the idle state, remembering the claim.
    for name in ["alice", "bob"] {
        let node = net.node(name);
        assert_eq!(node.coordinator.session().role, Role::None);
        assert!(
            node.coordinator.status().contains(&txid),
            "{} status should name the claim: {}",
            name,
            node.coordinator.status()
        );
    }

    // Shape: 2 inputs, 2 destinations + fee + marker.
    let probe = net.liquid.wallet("probe");
    let raw = net.liquid.broadcast_raw(&txid).unwrap();
    let summary = probe.decode_pset(&raw).unwrap();
    assert_eq!(summary.inputs.len(), 2);
    assert_eq!(summary.outputs.len(), 4);

    // Fee exactness and conservation.
    let decoded = probe.decode_final_tx(&raw).unwrap();
    assert_eq!(
        decoded.fee_sats,
        claimjoin_protocol::config::exact_fee_sats(decoded.discounted_vsize)
    );
    let in_total: u64 = summary.inputs.iter().map(|i| i.amount_sats).sum();
    let out_total: u64 = summary.outputs.iter().map(|o| o.amount_sats).sum();
    assert_eq!(in_total, out_total);
    assert_eq!(in_total, 160_000);
}

// ---------------------------------------------------------------------------
// 2. Three Parties over a Relay
// ---------------------------------------------------------------------------

#[test]
fn three_party_session_relays_through_the_middle() {
    // carol has no direct channel to alice: every coordination message
    // between them relays through bob.
    let mut net = Network::line(
        &["alice", "bob", "carol"],
        100,
        &[(150, 100_000), (140, 60_000), (120, 40_000)],
    );

    net.node("alice").coordinator.start_initiator().unwrap();
    net.settle();

    assert_eq!(net.node("alice").coordinator.session().parties.len(), 3);
    assert_eq!(net.node("bob").coordinator.session().role, Role::Joiner);
    assert_eq!(net.node("carol").coordinator.session().role, Role::Joiner);

    net.chain.set_height(150);
    net.tick_timers();

    let txid = net.broadcast_txid().expect("claim was broadcast");
    let probe = net.liquid.wallet("probe");
    let raw = net.liquid.broadcast_raw(&txid).unwrap();
    let summary = probe.decode_pset(&raw).unwrap();

    // 3 inputs; 3 destinations + fee + marker.
    assert_eq!(summary.inputs.len(), 3);
    assert_eq!(summary.outputs.len(), 5);

    // Every destination landed within rounding of its share.
    for (name, amount) in [("alice", 100_000u64), ("bob", 60_000), ("carol", 40_000)] {
        let unconf = probe
            .unconfidential(&net.liquid.wallet(name).confidential_address())
            .unwrap();
        let output = summary
            .outputs
            .iter()
            .find(|o| {
                o.address
                    .as_deref()
                    .map(|a| probe.unconfidential(a).unwrap() == unconf)
                    .unwrap_or(false)
            })
            .unwrap_or_else(|| panic!("{} output missing", name));
        let fee_upper = decoded_fee(&net) / 3 + FEE_SHARE_TOLERANCE_SATS;
        assert!(output.amount_sats >= amount - fee_upper);
        assert!(output.amount_sats < amount);
    }

    for name in ["alice", "bob", "carol"] {
        assert_eq!(net.node(name).coordinator.session().role, Role::None);
    }
}

fn decoded_fee(net: &Network) -> u64 {
    let probe = net.liquid.wallet("probe");
    let txid = net.liquid.broadcast_txids()[0].clone();
    let raw = net.liquid.broadcast_raw(&txid).unwrap();
    probe.decode_final_tx(&raw).unwrap().fee_sats
}

// ---------------------------------------------------------------------------
// 3. Initiator Collision
// ---------------------------------------------------------------------------

#[test]
fn competing_initiators_converge_on_the_earlier_session() {
    let mut net = Network::line(
        &["alice", "bob", "carol"],
        100,
        &[(150, 100_000), (140, 60_000), (120, 40_000)],
    );

    // Alice announces first, carol a moment later. Neither flood has been
    // delivered yet when the second session opens — a genuine collision.
    net.node("alice").coordinator.start_initiator().unwrap();
    net.clock.advance(500);
    net.node("carol").coordinator.start_initiator().unwrap();
    net.settle();

    // Earliest timestamp wins: alice stays initiator, carol yielded and
    // joined (so did bob).
    assert_eq!(net.node("alice").coordinator.session().role, Role::Initiator);
    assert_eq!(net.node("carol").coordinator.session().role, Role::Joiner);
    assert_eq!(net.node("bob").coordinator.session().role, Role::Joiner);
    assert_eq!(net.node("alice").coordinator.session().parties.len(), 3);

    // And the surviving session claims normally.
    net.chain.set_height(150);
    net.tick_timers();
    assert!(net.broadcast_txid().is_some());
}

// ---------------------------------------------------------------------------
// 4. Unresponsive Joiner Is Ejected
// ---------------------------------------------------------------------------

#[test]
fn silent_joiner_is_kicked_and_the_claim_proceeds_without_it() {
    let mut net = Network::line(&["alice", "bob"], 100, &[(150, 100_000), (140, 60_000)]);

    net.node("alice").coordinator.start_initiator().unwrap();
    net.settle();
    assert_eq!(net.node("alice").coordinator.session().parties.len(), 2);

    // Bob goes dark before the ceremony starts.
    net.node("bob").alive = false;

    net.chain.set_height(150);
    let cooldown = RESEND_COOLDOWN.as_millis() as u64;
    for _ in 0..8 {
        net.tick_timers();
        if net.liquid.broadcast_count() > 0 {
            break;
        }
        net.clock.advance(cooldown);
    }

    // Alice gave up on bob and claimed alone.
    let txid = net.broadcast_txid().expect("claim was broadcast");
    let probe = net.liquid.wallet("probe");
    let raw = net.liquid.broadcast_raw(&txid).unwrap();
    let summary = probe.decode_pset(&raw).unwrap();
    assert_eq!(summary.inputs.len(), 1);
    // Single party: destination + fee, no marker.
    assert_eq!(summary.outputs.len(), 2);
    assert_eq!(net.node("alice").coordinator.session().role, Role::None);
}

// ---------------------------------------------------------------------------
// 5. Crash and Restore Mid-Session
// ---------------------------------------------------------------------------

#[test]
fn joiner_survives_a_restart_and_the_claim_completes() {
    let mut net = Network::line(&["alice", "bob"], 100, &[(150, 100_000), (140, 60_000)]);

    net.node("alice").coordinator.start_initiator().unwrap();
    net.settle();
    assert_eq!(net.node("bob").coordinator.session().role, Role::Joiner);
    let bob_key_before = net.node("bob").coordinator.public_key();

    // Bob's process dies and comes back from its store.
    {
        let chain = Arc::clone(&net.chain);
        let liquid = net.liquid.clone();
        let clock = Arc::clone(&net.clock);
        let bob = net.node("bob");
        let deps = Collaborators {
            transport: Arc::new(bob.endpoint.clone()),
            directory: Arc::new(bob.endpoint.clone()),
            chain,
            liquid: Arc::new(liquid.wallet("bob")),
            store: bob.store.clone(),
            clock,
        };
        let mut restored = ClaimCoordinator::restore(deps, true).unwrap();
        restored.set_pegin(Some(PeginContext {
            txid: format!("{:0>64}", "bob"),
            vout: 0,
            claim_script: liquid.wallet("bob").claim_script(),
            destination_address: liquid.wallet("bob").confidential_address(),
            claimable_height: 140,
            amount_sats: 60_000,
        }));
        bob.coordinator = restored;
    }

    // Same identity, same role, same roster entry.
    let bob = net.node("bob");
    assert_eq!(bob.coordinator.public_key(), bob_key_before);
    assert_eq!(bob.coordinator.session().role, Role::Joiner);

    net.chain.set_height(150);
    net.tick_timers();
    assert!(net.broadcast_txid().is_some());
    assert_eq!(net.node("bob").coordinator.session().role, Role::None);
}

#[test]
fn restore_with_resolved_pegin_force_resets() {
    let mut net = Network::line(&["alice", "bob"], 100, &[(150, 100_000), (140, 60_000)]);
    net.node("alice").coordinator.start_initiator().unwrap();
    net.settle();
    assert_eq!(net.node("bob").coordinator.session().role, Role::Joiner);

    let chain = Arc::clone(&net.chain);
    let liquid = net.liquid.clone();
    let clock = Arc::clone(&net.clock);
    let bob = net.node("bob");
    let deps = Collaborators {
        transport: Arc::new(bob.endpoint.clone()),
        directory: Arc::new(bob.endpoint.clone()),
        chain,
        liquid: Arc::new(liquid.wallet("bob")),
        store: bob.store.clone(),
        clock,
    };
    // The host observed the peg-in as already resolved while we were down.
    let restored = ClaimCoordinator::restore(deps, false).unwrap();
    assert_eq!(restored.session().role, Role::None);
}

// ---------------------------------------------------------------------------
// 6. Poll Re-Establishes Contact
// ---------------------------------------------------------------------------

#[test]
fn silent_initiator_triggers_a_poll_and_answers_it() {
    let mut net = Network::line(&["alice", "bob"], 100, &[(150, 100_000), (140, 60_000)]);
    net.node("alice").coordinator.start_initiator().unwrap();
    net.settle();
    assert_eq!(net.node("bob").coordinator.session().role, Role::Joiner);

    // A long quiet stretch below the claim height.
    net.clock
        .advance(claimjoin_protocol::config::POLL_SILENCE.as_millis() as u64 + 1);
    net.tick_timers();

    // Bob polled; alice answered with a roster refresh carrying the
    // session status, which bob adopted.
    let bob_status = net.node("bob").coordinator.status();
    let alice_status = net.node("alice").coordinator.status();
    assert_eq!(bob_status, alice_status);
    assert_eq!(net.node("bob").coordinator.session().role, Role::Joiner);
}
