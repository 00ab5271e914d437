//! Data Syncer
//!
//! Executes push replication and sources the periodic anti-entropy
//! broadcast.
//!
//! ## Push path
//! Submitted tasks claim their `(key, target)` pairs on an in-flight set so
//! the same key is never pushed to the same peer twice concurrently. A failed
//! push is retried with a fixed delay for as long as the target stays in the
//! healthy list; a target that left the cluster silently voids the task.
//!
//! ## Anti-entropy
//! On a fixed schedule the syncer digests every locally-owned key into a
//! `{key: checksum}` map and pushes it to every healthy peer. Receivers pull
//! whatever differs, repairing drift the push path missed.

use super::config::SyncConfig;
use super::transport::TransportAgent;
use super::types::PushTask;
use crate::consistency::mapper::OwnershipMapper;
use crate::consistency::storage::EphemeralStore;
use crate::membership::service::MembershipService;
use crate::membership::types::{NodeId, NodeState};
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub struct DataSyncer {
    store: Arc<EphemeralStore>,
    membership: Arc<MembershipService>,
    mapper: Arc<OwnershipMapper>,
    transport: Arc<dyn TransportAgent>,
    in_flight: DashSet<(String, NodeId)>,
    permits: Arc<Semaphore>,
    config: SyncConfig,
}

impl DataSyncer {
    pub fn new(
        store: Arc<EphemeralStore>,
        membership: Arc<MembershipService>,
        mapper: Arc<OwnershipMapper>,
        transport: Arc<dyn TransportAgent>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_pushes.max(1)));
        Arc::new(Self {
            store,
            membership,
            mapper,
            transport,
            in_flight: DashSet::new(),
            permits,
            config,
        })
    }

    /// Accepts a push task and returns immediately; execution happens on a
    /// background task after `delay`.
    ///
    /// A fresh task (`retry_count == 0`) atomically claims each of its
    /// `(key, target)` pairs; keys another task already claimed are dropped
    /// from this one, and a task left with no keys is discarded as
    /// redundant. Retries keep their claims and skip this step.
    pub fn submit(self: &Arc<Self>, mut task: PushTask, delay: Duration) {
        if task.retry_count == 0 {
            task.keys
                .retain(|key| self.in_flight.insert((key.clone(), task.target.clone())));

            if task.keys.is_empty() {
                tracing::debug!(
                    "Every key already in flight to {:?}, discarding task",
                    task.target
                );
                return;
            }
        }

        let syncer = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            syncer.execute(task).await;
        });
    }

    /// Number of claimed `(key, target)` pairs.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    async fn execute(self: Arc<Self>, task: PushTask) {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        if !self.target_healthy(&task.target) {
            tracing::debug!(
                "Target {:?} left the cluster, dropping push of {} keys",
                task.target,
                task.keys.len()
            );
            self.release(&task);
            return;
        }

        // A key removed since the task was queued has no datum anymore and
        // drops out of the batch; its deletion reaches peers via
        // anti-entropy.
        let entries = self.store.batch_get(&task.keys);
        if entries.is_empty() {
            self.release(&task);
            return;
        }

        match self.transport.sync_data(&entries, &task.target).await {
            Ok(true) => {
                self.release(&task);
                tracing::debug!(
                    "Pushed {} datums to {:?} (retry {})",
                    entries.len(),
                    task.target,
                    task.retry_count
                );
            }
            Ok(false) => {
                tracing::warn!(
                    "Push of {} datums to {:?} rejected",
                    entries.len(),
                    task.target
                );
                self.schedule_retry(task);
            }
            Err(e) => {
                tracing::warn!(
                    "Push of {} datums to {:?} failed: {}",
                    entries.len(),
                    task.target,
                    e
                );
                self.schedule_retry(task);
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, task: PushTask) {
        if !self.target_healthy(&task.target) {
            tracing::debug!("Target {:?} no longer healthy, abandoning retries", task.target);
            self.release(&task);
            return;
        }

        let retry = PushTask {
            keys: task.keys,
            target: task.target,
            retry_count: task.retry_count + 1,
        };
        tracing::debug!(
            "Scheduling retry {} of {} keys to {:?}",
            retry.retry_count,
            retry.keys.len(),
            retry.target
        );
        self.submit(retry, self.config.retry_delay);
    }

    fn release(&self, task: &PushTask) {
        for key in &task.keys {
            self.in_flight.remove(&(key.clone(), task.target.clone()));
        }
    }

    fn target_healthy(&self, target: &NodeId) -> bool {
        self.membership
            .get_member(target)
            .map(|node| node.state == NodeState::Alive)
            .unwrap_or(false)
    }

    // --- Anti-entropy source ---

    /// Spawns the periodic checksum broadcast. The loop logs and continues on
    /// any iteration failure; it never terminates.
    pub fn start_verify_task(self: &Arc<Self>) {
        let syncer = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(syncer.config.verify_interval);
            // Consume the immediate first tick; a node that just started has
            // nothing worth broadcasting yet.
            interval.tick().await;

            loop {
                interval.tick().await;
                syncer.run_verify_once().await;
            }
        });

        tracing::info!("Anti-entropy verify task started");
    }

    /// One broadcast round: digest every locally-owned key and push the map
    /// to each healthy peer exactly once. Returns the number of peers that
    /// acknowledged.
    pub async fn run_verify_once(&self) -> usize {
        let mut checksums = HashMap::new();
        for key in self.store.local_keys() {
            if !self.mapper.responsible(&key) {
                continue;
            }
            if let Some(checksum) = self.store.checksum(&key) {
                checksums.insert(key, checksum);
            }
        }

        if checksums.is_empty() {
            return 0;
        }

        let mut acked = 0;
        for peer in self.membership.get_alive_peers() {
            match self.transport.sync_verify(&checksums, &peer.id).await {
                Ok(true) => acked += 1,
                Ok(false) => {
                    tracing::warn!("Verify push to {:?} rejected", peer.id);
                }
                Err(e) => {
                    tracing::warn!("Verify push to {:?} failed: {}", peer.id, e);
                }
            }
        }

        tracing::debug!("Broadcast {} checksums to {} peers", checksums.len(), acked);
        acked
    }
}
