//! # CLI Interface
//!
//! Command-line argument structure for `claimjoin-node` using `clap`
//! derive. Two subcommands: `simulate` and `version`.

use clap::{Parser, Subcommand};

/// ClaimJoin devnet node.
///
/// Runs a local multi-party ClaimJoin simulation over the in-memory
/// devnet harness: N parties with pending peg-ins coordinate, build,
/// blind, sign, and broadcast one joint claim transaction.
#[derive(Parser, Debug)]
#[command(
    name = "claimjoin-node",
    about = "ClaimJoin devnet node",
    version,
    propagate_version = true
)]
pub struct ClaimJoinCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a local multi-party simulation to completion.
    Simulate(SimulateArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `simulate` subcommand.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Number of parties in the session (including the initiator).
    #[arg(long, short = 'n', default_value_t = 3)]
    pub parties: usize,

    /// Milliseconds between simulated Bitcoin blocks.
    #[arg(long, default_value_t = 250)]
    pub block_ms: u64,

    /// Give up after this many blocks without a broadcast claim.
    #[arg(long, default_value_t = 60)]
    pub max_blocks: u32,

    /// Log output format: "pretty" or "json".
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}
