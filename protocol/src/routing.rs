//! # Routing Table
//!
//! Maps a session public key to the directly connected peer that last
//! delivered a message from it. Replies and relays follow these entries
//! backward without any node ever learning the full topology — each hop
//! only knows its own predecessor.
//!
//! The table doubles as the flood-suppression state for announcements: a
//! session-start is forwarded only when its sender key is not yet mapped,
//! a session-end only when it still is. No sequence numbers required.
//!
//! Entries persist through the durable store so a restarted node can still
//! route replies for an in-flight session. All serialization stays inside
//! this module; callers speak [`learn`](RoutingTable::learn) /
//! [`resolve`](RoutingTable::resolve) / [`forget`](RoutingTable::forget).

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::NS_ROUTING;
use crate::crypto::keys::SessionPublicKey;
use crate::rpc::{PeerId, Store, StoreError};

/// Session-key → delivering-peer map with write-through persistence.
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: HashMap<SessionPublicKey, PeerId>,
}

impl RoutingTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load all persisted entries. Corrupt rows are skipped with a warning
    /// rather than poisoning startup.
    pub fn restore(store: &dyn Store) -> Result<Self, StoreError> {
        let mut entries = HashMap::new();
        for key_hex in store.keys(NS_ROUTING)? {
            let Ok(key) = SessionPublicKey::from_hex(&key_hex) else {
                warn!(key = %key_hex, "skipping corrupt routing key");
                continue;
            };
            let Some(value) = store.load(NS_ROUTING, &key_hex)? else {
                continue;
            };
            match String::from_utf8(value) {
                Ok(peer) => {
                    entries.insert(key, peer);
                }
                Err(_) => warn!(key = %key_hex, "skipping corrupt routing value"),
            }
        }
        Ok(Self { entries })
    }

    /// Record (or refresh) where messages from `key` arrive. Last delivery
    /// wins — if a peer reconnects over a different channel, the newer
    /// path replaces the stale one.
    pub fn learn(
        &mut self,
        key: SessionPublicKey,
        peer: PeerId,
        store: &dyn Store,
    ) -> Result<(), StoreError> {
        if self.entries.get(&key) != Some(&peer) {
            debug!(session = %key.short(), peer = %peer, "learned route");
        }
        store.save(NS_ROUTING, &key.to_hex(), peer.as_bytes())?;
        self.entries.insert(key, peer);
        Ok(())
    }

    /// The peer to hand an envelope for `key` to, if known.
    pub fn resolve(&self, key: &SessionPublicKey) -> Option<&PeerId> {
        self.entries.get(key)
    }

    /// Whether a route for `key` exists.
    pub fn contains(&self, key: &SessionPublicKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop the route for `key`, e.g. after an `unable` notice or a
    /// session end. Forgetting an unknown key is a no-op.
    pub fn forget(
        &mut self,
        key: &SessionPublicKey,
        store: &dyn Store,
    ) -> Result<(), StoreError> {
        if self.entries.remove(key).is_some() {
            debug!(session = %key.short(), "forgot route");
        }
        store.delete(NS_ROUTING, &key.to_hex())
    }

    /// Drop every entry. Called on session reset — routes belong to a
    /// session's key universe and mean nothing outside it.
    pub fn clear(&mut self, store: &dyn Store) -> Result<(), StoreError> {
        for key in self.entries.keys() {
            store.delete(NS_ROUTING, &key.to_hex())?;
        }
        self.entries.clear();
        Ok(())
    }

    /// Number of known routes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SessionKeypair;
    use crate::devnet::MemoryStore;

    fn key() -> SessionPublicKey {
        SessionKeypair::generate().public_key()
    }

    #[test]
    fn test_learn_resolve_forget() {
        let store = MemoryStore::new();
        let mut table = RoutingTable::new();
        let k = key();

        table.learn(k, "peer-1".to_string(), &store).unwrap();
        assert_eq!(table.resolve(&k), Some(&"peer-1".to_string()));

        table.forget(&k, &store).unwrap();
        assert!(table.resolve(&k).is_none());
        // Forgetting twice is fine.
        table.forget(&k, &store).unwrap();
    }

    #[test]
    fn test_last_delivery_wins() {
        let store = MemoryStore::new();
        let mut table = RoutingTable::new();
        let k = key();

        table.learn(k, "peer-1".to_string(), &store).unwrap();
        table.learn(k, "peer-2".to_string(), &store).unwrap();
        assert_eq!(table.resolve(&k), Some(&"peer-2".to_string()));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_restore_roundtrip() {
        let store = MemoryStore::new();
        let mut table = RoutingTable::new();
        let (a, b) = (key(), key());
        table.learn(a, "peer-a".to_string(), &store).unwrap();
        table.learn(b, "peer-b".to_string(), &store).unwrap();

        let restored = RoutingTable::restore(&store).unwrap();
        assert_eq!(restored.resolve(&a), Some(&"peer-a".to_string()));
        assert_eq!(restored.resolve(&b), Some(&"peer-b".to_string()));
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn test_clear_empties_table_and_store() {
        let store = MemoryStore::new();
        let mut table = RoutingTable::new();
        table.learn(key(), "peer-1".to_string(), &store).unwrap();
        table.learn(key(), "peer-2".to_string(), &store).unwrap();

        table.clear(&store).unwrap();
        assert!(table.is_empty());
        assert!(RoutingTable::restore(&store).unwrap().is_empty());
    }

    #[test]
    fn test_restore_skips_corrupt_rows() {
        let store = MemoryStore::new();
        store.save(NS_ROUTING, "not-hex", b"peer-x").unwrap();
        let good = key();
        store
            .save(NS_ROUTING, &good.to_hex(), b"peer-good")
            .unwrap();

        let restored = RoutingTable::restore(&store).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.resolve(&good), Some(&"peer-good".to_string()));
    }
}
