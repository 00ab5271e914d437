//! Change Notifier
//!
//! Decouples local mutation from listener execution. Mutations enqueue a
//! `(key, action)` pair onto a bounded queue drained by a single consumer
//! task, which serializes listener invocation.
//!
//! ## Coalescing
//! A marker set tracks keys with an unprocessed CHANGE. A CHANGE for a key
//! already marked is dropped instead of re-queued, bounding notification
//! volume under churn. A DELETE is always enqueued, never coalesced. The
//! marker is cleared on dequeue, before listeners run.

use super::storage::EphemeralStore;
use super::types::{DataAction, RecordListener};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const NOTIFY_QUEUE_CAPACITY: usize = 64 * 1024;

/// Per-key listener registrations. Registrations are independent of datum
/// lifecycle; removing a datum does not unregister its listeners.
pub struct ListenerTable {
    inner: DashMap<String, Vec<Arc<dyn RecordListener>>>,
}

impl ListenerTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: DashMap::new(),
        })
    }

    /// Registers a listener for a key. Re-registering the same listener
    /// instance is a no-op.
    pub fn add(&self, key: &str, listener: Arc<dyn RecordListener>) {
        let mut entry = self.inner.entry(key.to_string()).or_default();
        if entry.iter().any(|existing| Arc::ptr_eq(existing, &listener)) {
            return;
        }
        entry.push(listener);
    }

    /// Removes a specific listener instance from a key.
    pub fn remove(&self, key: &str, listener: &Arc<dyn RecordListener>) {
        if let Some(mut entry) = self.inner.get_mut(key) {
            entry.retain(|existing| !Arc::ptr_eq(existing, listener));
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn listeners_for(&self, key: &str) -> Vec<Arc<dyn RecordListener>> {
        self.inner
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

pub struct Notifier {
    store: Arc<EphemeralStore>,
    listeners: Arc<ListenerTable>,
    pending_changes: DashSet<String>,
    tx: mpsc::Sender<(String, DataAction)>,
    rx: Mutex<Option<mpsc::Receiver<(String, DataAction)>>>,
    queued: AtomicUsize,
}

impl Notifier {
    pub fn new(store: Arc<EphemeralStore>, listeners: Arc<ListenerTable>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(NOTIFY_QUEUE_CAPACITY);
        Arc::new(Self {
            store,
            listeners,
            pending_changes: DashSet::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            queued: AtomicUsize::new(0),
        })
    }

    /// Enqueues a notification. Never blocks the caller; a full queue drops
    /// the task with a warning.
    pub fn add_task(&self, key: &str, action: DataAction) {
        if action == DataAction::Change && !self.pending_changes.insert(key.to_string()) {
            // A CHANGE for this key is already waiting; the listener will see
            // the latest value when it runs.
            return;
        }

        match self.tx.try_send((key.to_string(), action)) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                if action == DataAction::Change {
                    self.pending_changes.remove(key);
                }
                tracing::warn!("Notify queue full, dropping task for {}: {}", key, e);
            }
        }
    }

    /// Number of queued, not yet handled notifications.
    pub fn task_len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Number of keys with an unprocessed CHANGE marker.
    pub fn pending_len(&self) -> usize {
        self.pending_changes.len()
    }

    /// Spawns the single consumer task. The loop only ends when every sender
    /// is gone; a failure while handling one task never stops it.
    pub fn start(self: Arc<Self>) {
        let mut rx = match self.rx.lock() {
            Ok(mut slot) => match slot.take() {
                Some(rx) => rx,
                None => {
                    tracing::warn!("Notifier already started");
                    return;
                }
            },
            Err(_) => return,
        };

        tokio::spawn(async move {
            tracing::info!("Change notifier started");

            while let Some((key, action)) = rx.recv().await {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                self.handle(&key, action);
            }
        });
    }

    fn handle(&self, key: &str, action: DataAction) {
        if action == DataAction::Change {
            self.pending_changes.remove(key);
        }

        let listeners = self.listeners.listeners_for(key);
        if listeners.is_empty() {
            return;
        }

        let datum = self.store.get(key);
        let mut count = 0;

        for listener in listeners {
            count += 1;

            // One failing listener must not starve the rest.
            let result = match action {
                DataAction::Change => match &datum {
                    Some(datum) => listener.on_change(key, &datum.value),
                    None => {
                        tracing::debug!("Datum for {} gone before notify, skipping", key);
                        continue;
                    }
                },
                DataAction::Delete => listener.on_delete(key),
            };

            if let Err(e) = result {
                tracing::error!("Error while notifying listener of key {}: {}", key, e);
            }
        }

        tracing::debug!(
            "Datum change notified, key: {}, listener count: {}, action: {:?}",
            key,
            count,
            action
        );
    }
}
