//! # Protocol Configuration & Constants
//!
//! Every magic number in ClaimJoin lives here. A constant hardcoded anywhere
//! else in the tree is a bug waiting for a second copy to drift.
//!
//! Most of these values are protocol-level: two peers with different roster
//! caps or resend policies will still interoperate, but they will make
//! different ejection decisions, so changing them on a live network should
//! be done with care.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Wire Protocol
// ---------------------------------------------------------------------------

/// Version stamped into every envelope. Peers drop envelopes carrying a
/// version they do not understand instead of guessing at the layout.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// The crate version string, assembled at compile time.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// X25519 for the per-session identity and the per-message ephemeral keys.
/// One curve for both keeps the channel code honest and small.
pub const KEY_EXCHANGE_ALGORITHM: &str = "X25519";

/// Session public key length in bytes. X25519 points serialize to 32 bytes.
pub const SESSION_KEY_LENGTH: usize = 32;

/// AES-256-GCM for the sealed coordination payloads.
pub const SYMMETRIC_ALGORITHM: &str = "AES-256-GCM";

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. 96 bits is the standard GCM nonce
/// size and the only one used here.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// Fixed overhead of a sealed message beyond the plaintext length:
/// ephemeral public key + nonce + GCM tag.
pub const ECIES_OVERHEAD: usize = SESSION_KEY_LENGTH + AES_NONCE_LENGTH + AES_TAG_LENGTH;

// ---------------------------------------------------------------------------
// Roster & Membership
// ---------------------------------------------------------------------------

/// Hard cap on the number of parties in one ClaimJoin. Beyond this the
/// coordination rounds get slow enough that a stuck peer stalls everyone,
/// and the fee savings per additional party are marginal anyway.
pub const MAX_PARTIES: usize = 10;

/// How many times a node will ask to join a session before giving up and
/// waiting to claim on its own. Bounded so a refusing or dead initiator
/// cannot keep a peg-in hostage forever.
pub const MAX_JOIN_ATTEMPTS: u32 = 5;

/// The join deadline sits this many blocks before the claim height.
/// Admitting a party after construction has started would invalidate the
/// draft anyway, so close the door one block early.
pub const JOIN_HEIGHT_OFFSET: u32 = 1;

// ---------------------------------------------------------------------------
// Delivery & Ejection Policy
// ---------------------------------------------------------------------------

/// Total sends of one coordination request (first send plus resends) before
/// the counterpart is ejected. Send five times, then kick -- a peer that
/// missed five deliveries is offline or stalling on purpose.
pub const MAX_SENDS_BEFORE_KICK: u32 = 5;

/// Minimum gap between resends to the same counterpart. A reply can take a
/// few seconds over the relay mesh; resending faster than this only floods
/// the channel with duplicates.
pub const RESEND_COOLDOWN: Duration = Duration::from_secs(10);

/// A joiner that has heard nothing from its initiator for this long starts
/// broadcasting liveness polls.
pub const POLL_SILENCE: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Transaction Construction
// ---------------------------------------------------------------------------

/// Cap on full draft rebuilds inside a single claim attempt. The fee loop
/// converges in one or two passes when the transaction shape is stable; ten
/// misses in a row means something is feeding us inconsistent sizes.
pub const MAX_REBUILDS: u32 = 10;

/// How far below its expected share a party's output may come in before
/// verification fails. Covers integer rounding of the fee split, not fee
/// stealing -- 50 sats is noise, 500 is theft.
pub const FEE_SHARE_TOLERANCE_SATS: u64 = 50;

/// Upper bound on the per-party fee share a joiner will accept. A claim
/// input costs a few hundred discounted vbytes at 0.1 sat/vb; anything
/// past this is an initiator trying to skim.
pub const MAX_FEE_SHARE_SATS: u64 = 5_000;

/// Liquid's lowball fee rate, expressed per 1000 discounted vbytes to keep
/// the arithmetic in integers: 100 sat/kdvb = 0.1 sat/dvb.
pub const FEE_RATE_SAT_PER_KDVB: u64 = 100;

/// Floor on the absolute fee. Even a tiny transaction pays at least this.
pub const MIN_CLAIM_FEE_SATS: u64 = 30;

/// Discounted-vsize estimate used for the very first draft, before the
/// finalized transaction tells us the exact figure: a fixed base plus a
/// per-party cost (one peg-in input, one blinded output).
pub const ESTIMATED_DVSIZE_BASE: u64 = 60;

/// Per-party discounted-vsize estimate. Peg-in witness data dominates.
pub const ESTIMATED_DVSIZE_PER_PARTY: u64 = 300;

/// Script hex of the marker output added to multi-party claims:
/// `OP_RETURN` followed by a 9-byte push of the ASCII tag.
pub const MARKER_SCRIPT_HEX: &str = "6a09636c61696d6a6f696e";

// ---------------------------------------------------------------------------
// Persistence Namespaces
// ---------------------------------------------------------------------------

/// Store namespace for the serialized session snapshot.
pub const NS_SESSION: &str = "claimjoin/session";

/// Store namespace for routing table entries (session key -> peer id).
pub const NS_ROUTING: &str = "claimjoin/routing";

/// Key of the session snapshot inside [`NS_SESSION`].
pub const KEY_SNAPSHOT: &str = "state";

/// Key of the session secret key inside [`NS_SESSION`].
pub const KEY_IDENTITY: &str = "identity";

// ---------------------------------------------------------------------------
// Fee Helpers
// ---------------------------------------------------------------------------

/// Exact fee for a finalized transaction of the given discounted vsize,
/// rounded up to the next satoshi and clamped to the minimum.
pub fn exact_fee_sats(discounted_vsize: u64) -> u64 {
    let fee = (discounted_vsize * FEE_RATE_SAT_PER_KDVB).div_ceil(1000);
    fee.max(MIN_CLAIM_FEE_SATS)
}

/// First-draft fee estimate for a roster of `parties` members. Deliberately
/// rough; the convergence loop replaces it with the exact figure after the
/// first finalize.
pub fn estimated_fee_sats(parties: usize) -> u64 {
    let dvsize = ESTIMATED_DVSIZE_BASE + ESTIMATED_DVSIZE_PER_PARTY * parties as u64;
    exact_fee_sats(dvsize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecies_overhead_matches_parts() {
        assert_eq!(ECIES_OVERHEAD, 32 + 12 + 16);
    }

    #[test]
    fn test_exact_fee_rounds_up() {
        // 1234 dvb at 0.1 sat/vb = 123.4 sats, rounded up to 124.
        assert_eq!(exact_fee_sats(1234), 124);
        // Exact multiples do not round.
        assert_eq!(exact_fee_sats(1230), 123);
    }

    #[test]
    fn test_exact_fee_respects_minimum() {
        assert_eq!(exact_fee_sats(0), MIN_CLAIM_FEE_SATS);
        assert_eq!(exact_fee_sats(10), MIN_CLAIM_FEE_SATS);
    }

    #[test]
    fn test_estimated_fee_grows_with_roster() {
        let one = estimated_fee_sats(1);
        let five = estimated_fee_sats(5);
        assert!(five > one);
    }

    #[test]
    fn test_tolerance_below_minimum_share_guard() {
        // The rounding tolerance must stay well below the skim guard, or the
        // two checks collapse into one.
        assert!(FEE_SHARE_TOLERANCE_SATS < MAX_FEE_SHARE_SATS);
    }

    #[test]
    fn test_marker_script_is_op_return() {
        let bytes = hex::decode(MARKER_SCRIPT_HEX).unwrap();
        assert_eq!(bytes[0], 0x6a); // OP_RETURN
        assert_eq!(bytes[1] as usize, bytes.len() - 2); // push length matches
    }

    #[test]
    fn test_kick_threshold() {
        // One first send plus four resends.
        assert_eq!(MAX_SENDS_BEFORE_KICK, 5);
    }
}
