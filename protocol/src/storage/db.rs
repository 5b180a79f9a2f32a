//! # SledStore — Durable Key-Value Storage
//!
//! Session snapshots and routing entries persist through sled's embedded
//! key-value store. Each namespace maps to its own sled tree (independent
//! keyspace, same file), so `claimjoin/session` and `claimjoin/routing`
//! cannot collide however their keys are chosen.
//!
//! Writes are flushed before `save`/`delete` return: the protocol's crash
//! story depends on "persisted" meaning "on disk", not "in the page
//! cache". That costs a few milliseconds per coordination round, which is
//! nothing next to a network round trip.

use sled::Db;
use std::path::Path;

use crate::rpc::{Store, StoreError};

/// Durable store over a sled database.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(to_store_error)?;
        Ok(Self { db })
    }

    /// An in-memory database that vanishes on drop. For tests — no
    /// filesystem side effects, no cleanup.
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(to_store_error)?;
        Ok(Self { db })
    }

    fn tree(&self, namespace: &str) -> Result<sled::Tree, StoreError> {
        self.db.open_tree(namespace).map_err(to_store_error)
    }
}

impl Store for SledStore {
    fn save(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let tree = self.tree(namespace)?;
        tree.insert(key.as_bytes(), value).map_err(to_store_error)?;
        tree.flush().map_err(to_store_error)?;
        Ok(())
    }

    fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let tree = self.tree(namespace)?;
        Ok(tree
            .get(key.as_bytes())
            .map_err(to_store_error)?
            .map(|v| v.to_vec()))
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let tree = self.tree(namespace)?;
        tree.remove(key.as_bytes()).map_err(to_store_error)?;
        tree.flush().map_err(to_store_error)?;
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let tree = self.tree(namespace)?;
        let mut keys = Vec::new();
        for entry in tree.iter() {
            let (key, _) = entry.map_err(to_store_error)?;
            // Keys are written as UTF-8 by this crate; anything else is
            // foreign and skipped.
            if let Ok(s) = String::from_utf8(key.to_vec()) {
                keys.push(s);
            }
        }
        Ok(keys)
    }
}

fn to_store_error(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_delete_roundtrip() {
        let store = SledStore::open_temporary().unwrap();
        store.save("ns", "key", b"value").unwrap();
        assert_eq!(store.load("ns", "key").unwrap(), Some(b"value".to_vec()));

        store.delete("ns", "key").unwrap();
        assert_eq!(store.load("ns", "key").unwrap(), None);
    }

    #[test]
    fn test_namespaces_are_independent() {
        let store = SledStore::open_temporary().unwrap();
        store.save("a", "key", b"1").unwrap();
        store.save("b", "key", b"2").unwrap();

        assert_eq!(store.load("a", "key").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.load("b", "key").unwrap(), Some(b"2".to_vec()));

        store.delete("a", "key").unwrap();
        assert_eq!(store.load("b", "key").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_keys_enumeration() {
        let store = SledStore::open_temporary().unwrap();
        store.save("ns", "k1", b"x").unwrap();
        store.save("ns", "k2", b"y").unwrap();

        let mut keys = store.keys("ns").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);
        assert!(store.keys("empty").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.save("ns", "key", b"survives").unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(
            store.load("ns", "key").unwrap(),
            Some(b"survives".to_vec())
        );
    }
}
