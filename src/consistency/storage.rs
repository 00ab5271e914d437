//! Ephemeral Data Store
//!
//! The local authoritative map of key -> versioned [`Datum`]. All nodes hold a
//! full replica of every key they have seen; ownership only decides who
//! proactively pushes and verifies a key, never where it is stored.
//!
//! The store is safe for multi-writer access (`DashMap`) and holds no lock
//! over the whole dataset.

use super::types::{Datum, now_ms};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};

/// Callback invoked before the first write of a previously unknown key.
///
/// Lets the domain lazily materialize owning metadata (e.g. create an empty
/// service entry) when data for an unknown key arrives via replication rather
/// than a local client call, so replicated instance data is never orphaned.
pub type WriteHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct EphemeralStore {
    data: DashMap<String, Datum>,
    write_hook: RwLock<Option<WriteHook>>,
}

impl EphemeralStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: DashMap::new(),
            write_hook: RwLock::new(None),
        })
    }

    /// Installs the before-write hook. At most one hook is active; a later
    /// call replaces the earlier one.
    pub fn set_write_hook(&self, hook: WriteHook) {
        if let Ok(mut slot) = self.write_hook.write() {
            *slot = Some(hook);
        }
    }

    /// Computes the digest stored alongside a value.
    pub fn checksum_of(value: &[u8]) -> String {
        hex::encode(Sha256::digest(value))
    }

    /// Writes a value locally, producing a fresh checksum and timestamp.
    /// Returns the stored datum so callers can forward it without re-reading.
    pub fn put(&self, key: &str, value: Vec<u8>) -> Datum {
        self.run_write_hook(key);

        let datum = Datum {
            key: key.to_string(),
            checksum: Self::checksum_of(&value),
            timestamp: now_ms(),
            value,
        };
        self.data.insert(key.to_string(), datum.clone());
        datum
    }

    /// Applies a replicated datum verbatim, keeping the sender's checksum and
    /// timestamp.
    pub fn put_datum(&self, datum: Datum) {
        self.run_write_hook(&datum.key);
        self.data.insert(datum.key.clone(), datum);
    }

    pub fn get(&self, key: &str) -> Option<Datum> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &str) -> Option<Datum> {
        self.data.remove(key).map(|(_, datum)| datum)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Fetches the datums for the given keys. Keys with no local datum are
    /// silently skipped; a removed key simply stops being part of any batch.
    pub fn batch_get(&self, keys: &[String]) -> Vec<Datum> {
        keys.iter().filter_map(|key| self.get(key)).collect()
    }

    pub fn local_keys(&self) -> Vec<String> {
        self.data.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of every datum held locally, for full-state catch-up.
    pub fn all(&self) -> Vec<Datum> {
        self.data.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn checksum(&self, key: &str) -> Option<String> {
        self.data.get(key).map(|entry| entry.value().checksum.clone())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn run_write_hook(&self, key: &str) {
        if self.data.contains_key(key) {
            return;
        }
        let hook = match self.write_hook.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        if let Some(hook) = hook {
            hook(key);
        }
    }
}
