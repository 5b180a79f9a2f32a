// Copyright (c) 2026 ClaimJoin Contributors. MIT License.
// See LICENSE for details.

//! # ClaimJoin Devnet Node
//!
//! Entry point for the `claimjoin-node` binary. Parses CLI arguments,
//! initializes logging, and runs the requested subcommand:
//!
//! - `simulate` — run a local multi-party ClaimJoin over the in-memory
//!   devnet harness and print a JSON summary of the broadcast claim
//! - `version`  — print build version information
//!
//! Production hosts embed `claimjoin-protocol` directly and wire the
//! collaborator traits to their own Bitcoin/Liquid/Lightning plumbing;
//! this binary exists so the protocol can be watched end-to-end without
//! any of that.

mod cli;
mod logging;
mod sim;

use anyhow::Result;
use clap::Parser;

use cli::{ClaimJoinCli, Commands};
use logging::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ClaimJoinCli::parse();

    match cli.command {
        Commands::Simulate(args) => {
            logging::init_logging(
                "claimjoin_node=info,claimjoin_protocol=info",
                LogFormat::from_str_lossy(&args.log_format),
            );
            sim::run(args).await
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Prints version information to stdout.
fn print_version() {
    println!("claimjoin-node {}", env!("CARGO_PKG_VERSION"));
    println!(
        "protocol      {}",
        claimjoin_protocol::config::PROTOCOL_VERSION
    );
}
