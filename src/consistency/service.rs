//! Consistency Service Facade
//!
//! Entry point for the domain layer: local-first writes, reads, and listener
//! registration, plus the receive-side entry points the replication endpoints
//! delegate to.
//!
//! Writes apply to the local store synchronously and return at once; the
//! remote fan-out happens asynchronously through the batch engine, and no
//! replication failure is ever surfaced to the writer. Drift that push
//! replication misses is repaired when peers exchange checksum digests.

use super::mapper::OwnershipMapper;
use super::notifier::{ListenerTable, Notifier};
use super::storage::EphemeralStore;
use super::types::{DataAction, Datum, RecordListener, VerifyReport};
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::sync::batcher::SyncBatchEngine;
use crate::sync::config::SyncConfig;
use crate::sync::transport::TransportAgent;
use crate::sync::types::SyncKey;
use anyhow::Result;
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct ConsistencyService {
    store: Arc<EphemeralStore>,
    notifier: Arc<Notifier>,
    listeners: Arc<ListenerTable>,
    engine: Arc<SyncBatchEngine>,
    membership: Arc<MembershipService>,
    mapper: Arc<OwnershipMapper>,
    transport: Arc<dyn TransportAgent>,
    config: SyncConfig,
    resource_type: String,
    initialized: AtomicBool,
    available_override: AtomicBool,
    /// Sources with a verify round currently in process.
    verify_in_process: DashSet<NodeId>,
}

impl ConsistencyService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<EphemeralStore>,
        notifier: Arc<Notifier>,
        listeners: Arc<ListenerTable>,
        engine: Arc<SyncBatchEngine>,
        membership: Arc<MembershipService>,
        mapper: Arc<OwnershipMapper>,
        transport: Arc<dyn TransportAgent>,
        config: SyncConfig,
        resource_type: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            notifier,
            listeners,
            engine,
            membership,
            mapper,
            transport,
            config,
            resource_type: resource_type.to_string(),
            initialized: AtomicBool::new(false),
            available_override: AtomicBool::new(false),
            verify_in_process: DashSet::new(),
        })
    }

    /// Writes a record locally and fans out one delayed sync task per healthy
    /// peer. Returns without any network wait.
    pub fn put(&self, key: &str, value: Vec<u8>) {
        self.store.put(key, value);

        if self.listeners.contains_key(key) {
            self.notifier.add_task(key, DataAction::Change);
        }

        self.distribute(key, DataAction::Change);
    }

    /// Removes a record locally. Listener registrations survive the datum;
    /// peers learn of the deletion through anti-entropy once the key stops
    /// appearing in this node's checksum broadcasts.
    pub fn remove(&self, key: &str) {
        self.remove_local(key);
    }

    pub fn get(&self, key: &str) -> Option<Datum> {
        self.store.get(key)
    }

    pub fn listen(&self, key: &str, listener: Arc<dyn RecordListener>) {
        self.listeners.add(key, listener);
    }

    pub fn unlisten(&self, key: &str, listener: &Arc<dyn RecordListener>) {
        self.listeners.remove(key, listener);
    }

    /// False until the initial catch-up completed (or warm-up is disabled),
    /// unless explicitly overridden. Clients must not be served from a cold,
    /// incomplete view right after node start.
    pub fn is_available(&self) -> bool {
        self.initialized.load(Ordering::SeqCst) || self.available_override.load(Ordering::SeqCst)
    }

    pub fn set_available_override(&self, available: bool) {
        self.available_override.store(available, Ordering::SeqCst);
    }

    // --- Receive side ---

    /// Applies a batch of replicated datums. A datum whose checksum matches
    /// the local copy is skipped, making duplicate pushes idempotent; an
    /// applied datum notifies listeners as CHANGE. Returns how many entries
    /// were actually applied.
    pub fn process_batch(&self, entries: Vec<Datum>) -> usize {
        let mut applied = 0;

        for datum in entries {
            if let Some(local) = self.store.get(&datum.key)
                && local.checksum == datum.checksum
            {
                continue;
            }

            let key = datum.key.clone();
            self.store.put_datum(datum);
            applied += 1;

            if self.listeners.contains_key(&key) {
                self.notifier.add_task(&key, DataAction::Change);
            }
        }

        applied
    }

    /// Handles a received anti-entropy digest: compares it against local
    /// state, removes keys the source dropped, and pulls differing keys from
    /// the source. A second digest from the same source while one is in
    /// process is skipped.
    pub async fn process_verify(
        &self,
        checksums: HashMap<String, String>,
        source: NodeId,
    ) -> Result<()> {
        if !self.verify_in_process.insert(source.clone()) {
            tracing::warn!("Verify round already in process with {:?}, skipping", source);
            return Ok(());
        }

        let result = self.do_verify(checksums, &source).await;
        self.verify_in_process.remove(&source);
        result
    }

    async fn do_verify(&self, checksums: HashMap<String, String>, source: &NodeId) -> Result<()> {
        let report = self.build_verify_report(&checksums, source)?;

        if !report.is_empty() {
            tracing::info!(
                "Verify from {:?}: {} keys to update, {} keys to remove",
                source,
                report.to_update.len(),
                report.to_remove.len()
            );
        }

        for key in &report.to_remove {
            self.remove_local(key);
        }

        if report.to_update.is_empty() {
            return Ok(());
        }

        // Best effort: a failed pull leaves the drift for the next round.
        match self.transport.get_datum(&report.to_update, source).await {
            Ok(entries) => {
                self.process_batch(entries);
            }
            Err(e) => {
                tracing::warn!(
                    "Pulling {} keys from {:?} failed: {}",
                    report.to_update.len(),
                    source,
                    e
                );
            }
        }

        Ok(())
    }

    /// Pure comparison of a received digest against local state, returned as
    /// an explicit report value.
    ///
    /// A digest entry for a key this node itself owns means the sender's
    /// membership view disagrees with ours; the whole round is aborted rather
    /// than acted on.
    pub fn build_verify_report(
        &self,
        checksums: &HashMap<String, String>,
        source: &NodeId,
    ) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();

        for (key, remote_checksum) in checksums {
            if self.mapper.responsible(key) {
                anyhow::bail!(
                    "received digest of locally owned key {} from {:?}",
                    key,
                    source
                );
            }

            if self.store.checksum(key).as_deref() != Some(remote_checksum.as_str()) {
                report.to_update.push(key.clone());
            }
        }

        for key in self.store.local_keys() {
            if self.mapper.owner_of(&key).as_ref() != Some(source) {
                continue;
            }
            if !checksums.contains_key(&key) {
                report.to_remove.push(key);
            }
        }

        Ok(report)
    }

    // --- Warm-up ---

    /// Spawns the initial catch-up: pull a full snapshot from the first peer
    /// that answers, then report the node available. `expect_peers` keeps the
    /// loop retrying when seeds were configured but gossip has not surfaced
    /// them yet; a founder node with no seeds starts available right away.
    pub fn start_load_task(self: &Arc<Self>, expect_peers: bool) {
        if !self.config.data_warmup {
            tracing::info!("Data warm-up disabled, reporting available immediately");
            self.initialized.store(true, Ordering::SeqCst);
            return;
        }

        let service = self.clone();
        tokio::spawn(async move {
            loop {
                let peers = service.membership.get_alive_peers();

                if peers.is_empty() && !expect_peers {
                    tracing::info!("No peers to load from, starting with an empty data set");
                    service.initialized.store(true, Ordering::SeqCst);
                    return;
                }

                for peer in &peers {
                    match service.transport.get_all_datum(&peer.id).await {
                        Ok(entries) => {
                            let total = entries.len();
                            let applied = service.process_batch(entries);
                            tracing::info!(
                                "Loaded snapshot from {:?}: {} datums, {} applied",
                                peer.id,
                                total,
                                applied
                            );
                            service.initialized.store(true, Ordering::SeqCst);
                            return;
                        }
                        Err(e) => {
                            tracing::warn!("Snapshot load from {:?} failed: {}", peer.id, e);
                        }
                    }
                }

                tokio::time::sleep(service.config.load_retry_delay).await;
            }
        });
    }

    // --- Handler accessors ---

    pub fn batch_get(&self, keys: &[String]) -> Vec<Datum> {
        self.store.batch_get(keys)
    }

    pub fn all_datums(&self) -> Vec<Datum> {
        self.store.all()
    }

    pub fn local_id(&self) -> &NodeId {
        &self.membership.local_node.id
    }

    // --- Internals ---

    fn remove_local(&self, key: &str) {
        self.store.remove(key);

        if self.listeners.contains_key(key) {
            self.notifier.add_task(key, DataAction::Delete);
        }
    }

    fn distribute(&self, key: &str, action: DataAction) {
        for peer in self.membership.get_alive_peers() {
            self.engine.add_task(
                SyncKey {
                    resource_key: key.to_string(),
                    resource_type: self.resource_type.clone(),
                    target: peer.id.clone(),
                },
                action,
                self.config.sync_delay,
            );
        }
    }
}
