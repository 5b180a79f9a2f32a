// Copyright (c) 2026 ClaimJoin Contributors. MIT License.
// See LICENSE for details.

//! # ClaimJoin — Core Protocol Library
//!
//! Cooperative batched claims for Bitcoin→Liquid peg-ins. Any number of
//! mutually distrusting Lightning peers, each holding an unclaimed peg-in,
//! coordinate one joint Liquid claim transaction instead of paying the
//! fixed claim cost separately — the fee amortizes across the roster and
//! the shared blinding hides who got what.
//!
//! There is no trusted coordinator. One peer volunteers as *initiator* and
//! drives construction; everyone else verifies every draft that touches
//! their money and can walk away at any point. The transport is whatever
//! point-to-point channel the host provides (for Lightning hosts, custom
//! peer messages), with coordination payloads sealed end-to-end so relay
//! peers learn nothing but routing.
//!
//! ## Architecture
//!
//! The modules mirror the actual concerns of the protocol:
//!
//! - **crypto** — per-session X25519 identity + the ECIES sealed channel.
//! - **wire** — envelopes, announcements, coordination messages.
//! - **routing** — session-key → peer routing with flood suppression.
//! - **announce** — session start/end flooding and initiator collision.
//! - **session** — the owned state aggregate: role, roster, draft.
//! - **membership** — add/confirm/refuse/remove and the ejection policy.
//! - **engine** — draft construction, blinding and signing rounds, fee
//!   convergence, finalization, broadcast.
//! - **coordinator** — the node-level driver wiring decisions to I/O.
//! - **rpc** — typed contracts for the external chain/Liquid/transport/
//!   store collaborators.
//! - **storage** — the sled-backed store implementation.
//! - **devnet** — in-memory collaborators for tests and simulation.
//! - **config** — every protocol constant.
//!
//! ## Design Ground Rules
//!
//! 1. Single owner for session state; mutations only from message and
//!    tick callbacks.
//! 2. Every state transition persists before the next network action — a
//!    crash resumes the round, never corrupts it.
//! 3. No failure escalates past a logged status line and a session reset;
//!    the node always lives to claim another day.
//! 4. Decision engines stay free of I/O so every protocol branch is
//!    unit-testable.

pub mod announce;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod devnet;
pub mod engine;
pub mod membership;
pub mod routing;
pub mod rpc;
pub mod session;
pub mod storage;
pub mod wire;
