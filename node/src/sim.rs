//! # Devnet Simulation
//!
//! Spins up N coordinators over the in-memory devnet harness — a line
//! topology, so coordination between the far ends relays through the
//! middle — and runs a complete ClaimJoin: announcement, joins, the
//! blinding and signing rounds, fee convergence, broadcast, teardown.
//!
//! Each simulated node persists through its own temporary sled store, so
//! the run exercises the same snapshot path a production host would use.

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use claimjoin_protocol::coordinator::{ClaimCoordinator, Collaborators};
use claimjoin_protocol::devnet::{HubEndpoint, LiquidHub, MemoryChain, MemoryHub};
use claimjoin_protocol::rpc::{LiquidService, SystemClock};
use claimjoin_protocol::session::party::PeginContext;
use claimjoin_protocol::session::state::Role;
use claimjoin_protocol::storage::SledStore;

use crate::cli::SimulateArgs;

struct SimNode {
    name: String,
    endpoint: HubEndpoint,
    coordinator: ClaimCoordinator,
}

/// Run one simulated session to completion and print a JSON summary to
/// stdout.
pub async fn run(args: SimulateArgs) -> Result<()> {
    if args.parties == 0 {
        bail!("a session needs at least one party");
    }

    let start_height = 100u32;
    let hub = MemoryHub::new();
    let chain = Arc::new(MemoryChain::new(start_height));
    let liquid = LiquidHub::new();
    let clock = Arc::new(SystemClock);

    // Line topology: party-1 - party-2 - ... - party-N.
    let names: Vec<String> = (1..=args.parties).map(|i| format!("party-{}", i)).collect();
    for pair in names.windows(2) {
        hub.link(&pair[0], &pair[1]);
    }

    let mut nodes = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let endpoint = hub.endpoint(name);
        let store = SledStore::open_temporary().context("opening sled store")?;
        let deps = Collaborators {
            transport: Arc::new(endpoint.clone()),
            directory: Arc::new(endpoint.clone()),
            chain: chain.clone(),
            liquid: Arc::new(liquid.wallet(name)),
            store: Arc::new(store),
            clock: clock.clone(),
        };
        let mut coordinator = ClaimCoordinator::new(deps).context("building coordinator")?;

        // Every party holds one pending peg-in, claimable a few blocks
        // out so there is room for everyone to join first.
        let pegin = PeginContext {
            txid: format!("{:0>64}", name.replace('-', "")),
            vout: 0,
            claim_script: liquid.wallet(name).claim_script(),
            destination_address: liquid.wallet(name).confidential_address(),
            claimable_height: start_height + 2 + i as u32,
            amount_sats: 50_000 + 10_000 * i as u64,
        };
        chain.register_pegin(&pegin);
        coordinator.set_pegin(Some(pegin));

        nodes.push(SimNode {
            name: name.clone(),
            endpoint,
            coordinator,
        });
    }

    info!(parties = args.parties, "starting simulation");
    nodes[0]
        .coordinator
        .start_initiator()
        .context("opening the session")?;
    pump(&mut nodes)?;

    let mut interval = tokio::time::interval(std::time::Duration::from_millis(args.block_ms));
    let mut blocks = 0u32;
    let txid = loop {
        interval.tick().await;
        blocks += 1;
        if blocks > args.max_blocks {
            bail!("no claim after {} blocks", args.max_blocks);
        }

        let height = chain.tick();
        debug!(height, "block");
        for node in &mut nodes {
            node.coordinator.on_block().context("block tick")?;
        }
        pump(&mut nodes)?;

        if let Some(txid) = liquid.broadcast_txids().first().cloned() {
            // Let the end announcement finish flooding.
            pump(&mut nodes)?;
            break txid;
        }
    };

    for node in &nodes {
        info!(
            node = %node.name,
            role = %node.coordinator.session().role,
            status = %node.coordinator.status(),
            "final state"
        );
        if node.coordinator.session().role != Role::None {
            bail!("{} did not reset after the claim", node.name);
        }
    }

    let probe = liquid.wallet("probe");
    let raw = liquid
        .broadcast_raw(&txid)
        .expect("broadcast transaction is recorded");
    let decoded = probe.decode_final_tx(&raw)?;
    let summary = probe.decode_pset(&raw)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "parties": args.parties,
            "blocks": blocks,
            "txid": decoded.txid,
            "fee_sats": decoded.fee_sats,
            "discounted_vsize": decoded.discounted_vsize,
            "inputs": summary.inputs.len(),
            "outputs": summary.outputs.len(),
        }))?
    );
    Ok(())
}

/// Deliver queued envelopes until the network goes quiet.
fn pump(nodes: &mut [SimNode]) -> Result<()> {
    for _ in 0..100 {
        let mut moved = false;
        for node in nodes.iter_mut() {
            for (from, envelope) in node.endpoint.drain() {
                moved = true;
                node.coordinator
                    .on_envelope(&from, envelope)
                    .context("handling envelope")?;
            }
        }
        if !moved {
            return Ok(());
        }
    }
    bail!("message flood did not settle");
}
