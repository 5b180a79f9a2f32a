//! # Session Module
//!
//! The single owned aggregate holding everything one node knows about the
//! ClaimJoin it is currently part of (or the fact that it is part of none).
//!
//! ```text
//! party.rs — ClaimParty: one participant's peg-in and delivery bookkeeping
//! state.rs — Role + Session: roster, heights, draft, counters, snapshot
//! ```
//!
//! All mutation goes through the membership state machine and the
//! orchestration engine; nothing else touches these fields. The
//! human-readable status string is derived display only — control flow
//! branches on the typed fields, never on the string.

pub mod party;
pub mod state;

pub use party::{ClaimParty, PeginContext};
pub use state::{Role, RosterError, Session, SessionSummary};
