//! Batch Formation Engine
//!
//! Collects per-key mutation tasks addressed to peers and coalesces them into
//! combined batches, so a burst of writes costs one network call per peer
//! instead of one per key. Pushing every single-key mutation separately
//! churns through connection setup/teardown and leaves sockets lingering in a
//! closing state under load; batching amortizes that cost.
//!
//! ## Sharding
//! Pending tasks are spread across independent shards by key hash, one drain
//! loop per shard, bounding contention and letting batches form in parallel.
//! A shard dispatches when it accumulated `max_batch_size` tasks or when
//! `dispatch_period` elapsed since its last dispatch.
//!
//! ## Failure isolation
//! A batch whose processor fails (or panics) is exploded back into one
//! singleton task per resource key and re-enqueued with a fixed delay, so a
//! single poison key cannot indefinitely block delivery of its batchmates.

use super::config::SyncConfig;
use super::types::{BatchTask, PendingSync, SyncKey};
use crate::consistency::types::{DataAction, now_ms};
use crate::membership::types::NodeId;
use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Type alias for a registered batch processor: an async function handling
/// one combined batch. Processors must be idempotent, since redelivery after
/// a partial failure is expected.
pub type BatchProcessor =
    Arc<dyn Fn(BatchTask) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Policy applied when a batch fails, injected at engine construction.
pub trait FailureHandler: Send + Sync {
    /// The tasks to re-enqueue for a failed batch.
    fn retry_tasks(&self, failed: &BatchTask) -> Vec<(SyncKey, DataAction)>;

    /// Fixed delay before the retry tasks become eligible again.
    fn retry_delay(&self) -> Duration;
}

/// Default policy: one singleton retry per resource key of the failed batch.
pub struct ExplodingFailureHandler {
    retry_delay: Duration,
}

impl ExplodingFailureHandler {
    pub fn new(retry_delay: Duration) -> Arc<Self> {
        Arc::new(Self { retry_delay })
    }
}

impl FailureHandler for ExplodingFailureHandler {
    fn retry_tasks(&self, failed: &BatchTask) -> Vec<(SyncKey, DataAction)> {
        failed
            .resource_keys
            .iter()
            .map(|resource_key| {
                let key = SyncKey {
                    resource_key: resource_key.clone(),
                    resource_type: failed.resource_type.clone(),
                    target: failed.target.clone(),
                };
                (key, DataAction::Change)
            })
            .collect()
    }

    fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

pub struct SyncBatchEngine {
    shards: Vec<DashMap<SyncKey, PendingSync>>,
    last_dispatch: Vec<AtomicU64>,
    processors: DashMap<String, BatchProcessor>,
    failure_handler: Arc<dyn FailureHandler>,
    config: SyncConfig,
}

impl SyncBatchEngine {
    pub fn new(config: SyncConfig, failure_handler: Arc<dyn FailureHandler>) -> Arc<Self> {
        let shard_count = config.shard_count.max(1);
        Arc::new(Self {
            shards: (0..shard_count).map(|_| DashMap::new()).collect(),
            last_dispatch: (0..shard_count).map(|_| AtomicU64::new(now_ms())).collect(),
            processors: DashMap::new(),
            failure_handler,
            config,
        })
    }

    /// Registers the processor for a resource-type prefix.
    pub fn register_processor<F, Fut>(&self, resource_type: &str, processor: F)
    where
        F: Fn(BatchTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let processor: BatchProcessor = Arc::new(move |task: BatchTask| {
            Box::pin(processor(task)) as Pin<Box<dyn Future<Output = Result<()>> + Send>>
        });
        self.processors.insert(resource_type.to_string(), processor);

        tracing::info!("Registered batch processor for {}", resource_type);
    }

    /// Enqueues one mutation for one peer. A task already pending for the
    /// same key merges instead of queueing twice: the newest action wins, the
    /// earliest due time wins. Never blocks the caller.
    pub fn add_task(&self, key: SyncKey, action: DataAction, delay: Duration) {
        self.enqueue(key, action, delay, 0);
    }

    fn enqueue(&self, key: SyncKey, action: DataAction, delay: Duration, retry_count: u32) {
        let due_at = now_ms() + delay.as_millis() as u64;
        let shard = &self.shards[self.shard_for(&key)];

        match shard.entry(key) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                pending.action = action;
                pending.due_at = pending.due_at.min(due_at);
                pending.retry_count = pending.retry_count.max(retry_count);
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingSync {
                    action,
                    due_at,
                    retry_count,
                });
            }
        }
    }

    /// Total number of pending, not yet dispatched tasks.
    pub fn pending_len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    /// Spawns one drain loop per shard and returns immediately.
    pub fn start(self: &Arc<Self>) {
        for shard_index in 0..self.shards.len() {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.drain_loop(shard_index).await;
            });
        }

        tracing::info!("Batch engine started with {} shards", self.shards.len());
    }

    async fn drain_loop(self: Arc<Self>, shard_index: usize) {
        let mut interval = tokio::time::interval(self.config.drain_interval);

        loop {
            interval.tick().await;

            if self.should_dispatch(shard_index) {
                self.process_shard(shard_index).await;
            }
        }
    }

    fn should_dispatch(&self, shard_index: usize) -> bool {
        let shard = &self.shards[shard_index];
        if shard.is_empty() {
            return false;
        }
        if shard.len() >= self.config.max_batch_size {
            return true;
        }

        let last = self.last_dispatch[shard_index].load(Ordering::Relaxed);
        now_ms().saturating_sub(last) >= self.config.dispatch_period.as_millis() as u64
    }

    /// Removes every due task from the shard, groups fresh tasks by
    /// `(resource_type, target)` into combined batches and hands each batch
    /// to its processor. A task that already failed as part of a batch stays
    /// a singleton, so one poison key never re-contaminates its former
    /// batchmates. Failures never escape this method.
    async fn process_shard(self: &Arc<Self>, shard_index: usize) {
        let now = now_ms();
        self.last_dispatch[shard_index].store(now, Ordering::Relaxed);

        let shard = &self.shards[shard_index];
        let due: Vec<SyncKey> = shard
            .iter()
            .filter(|entry| entry.value().due_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut combined: HashMap<(String, NodeId), Vec<String>> = HashMap::new();
        let mut singles: Vec<BatchTask> = Vec::new();
        for key in due {
            if let Some((key, pending)) = shard.remove(&key) {
                if pending.retry_count > 0 {
                    singles.push(BatchTask {
                        resource_type: key.resource_type,
                        resource_keys: vec![key.resource_key],
                        target: key.target,
                        retry_count: pending.retry_count,
                    });
                } else {
                    combined
                        .entry((key.resource_type.clone(), key.target.clone()))
                        .or_default()
                        .push(key.resource_key);
                }
            }
        }

        for ((resource_type, target), resource_keys) in combined {
            self.dispatch(BatchTask {
                resource_type,
                resource_keys,
                target,
                retry_count: 0,
            })
            .await;
        }

        for single in singles {
            self.dispatch(single).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, batch: BatchTask) {
        let Some(processor) = self.processor_for(&batch.resource_type) else {
            tracing::warn!(
                "No processor registered for resource type {}, dropping batch of {} keys",
                batch.resource_type,
                batch.resource_keys.len()
            );
            return;
        };

        // Run the processor on its own task so a panic is contained and
        // counts as a batch failure.
        let handle = tokio::spawn(processor(batch.clone()));
        let failed = match handle.await {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                tracing::warn!(
                    "Batch of {} keys for {:?} failed (retry {}): {}",
                    batch.resource_keys.len(),
                    batch.target,
                    batch.retry_count,
                    e
                );
                true
            }
            Err(e) => {
                tracing::error!("Batch processor panicked: {}", e);
                true
            }
        };

        if failed {
            let delay = self.failure_handler.retry_delay();
            for (key, action) in self.failure_handler.retry_tasks(&batch) {
                self.enqueue(key, action, delay, batch.retry_count + 1);
            }
        }
    }

    fn processor_for(&self, resource_type: &str) -> Option<BatchProcessor> {
        if let Some(processor) = self.processors.get(resource_type) {
            return Some(processor.value().clone());
        }
        self.processors
            .iter()
            .find(|entry| resource_type.starts_with(entry.key()))
            .map(|entry| entry.value().clone())
    }

    fn shard_for(&self, key: &SyncKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.resource_key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }
}
