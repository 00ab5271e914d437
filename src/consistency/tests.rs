//! Consistency Module Tests
//!
//! Validates the local half of the replication protocol.
//!
//! ## Test Scopes
//! - **Storage**: Checksum computation, the before-write hook, and batch reads.
//! - **Ownership**: Deterministic, advisory key-to-node assignment.
//! - **Notifier**: CHANGE coalescing, DELETE delivery, and listener fault isolation.
//! - **Facade**: Idempotent batch application, verify-report computation, and
//!   the availability warm-up contract.

#[cfg(test)]
mod tests {
    use crate::consistency::mapper::OwnershipMapper;
    use crate::consistency::notifier::{ListenerTable, Notifier};
    use crate::consistency::service::ConsistencyService;
    use crate::consistency::storage::EphemeralStore;
    use crate::consistency::types::{DataAction, Datum, RecordListener, now_ms};
    use crate::membership::service::MembershipService;
    use crate::membership::types::{Node, NodeId, NodeState};
    use crate::sync::batcher::{ExplodingFailureHandler, SyncBatchEngine};
    use crate::sync::config::SyncConfig;
    use crate::sync::transport::TransportAgent;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // ============================================================
    // FIXTURES
    // ============================================================

    async fn membership_fixture() -> Arc<MembershipService> {
        MembershipService::new("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .expect("Failed to create membership fixture")
    }

    fn test_node(id: &str, port: u16) -> Node {
        Node {
            id: NodeId(id.to_string()),
            gossip_addr: format!("127.0.0.1:{}", port).parse().unwrap(),
            http_addr: format!("127.0.0.1:{}", port + 1000).parse().unwrap(),
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: None,
        }
    }

    fn make_datum(key: &str, value: &str) -> Datum {
        Datum {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
            checksum: EphemeralStore::checksum_of(value.as_bytes()),
            timestamp: now_ms(),
        }
    }

    /// Transport answering pull calls from a designated remote store; push
    /// calls always ack. Enough for every receive-side test.
    struct StoreBackedTransport {
        remote: Arc<EphemeralStore>,
    }

    impl StoreBackedTransport {
        fn new(remote: Arc<EphemeralStore>) -> Arc<Self> {
            Arc::new(Self { remote })
        }

        fn empty() -> Arc<Self> {
            Self::new(EphemeralStore::new())
        }
    }

    #[async_trait]
    impl TransportAgent for StoreBackedTransport {
        async fn sync_data(&self, _entries: &[Datum], _target: &NodeId) -> Result<bool> {
            Ok(true)
        }

        async fn sync_verify(
            &self,
            _checksums: &HashMap<String, String>,
            _target: &NodeId,
        ) -> Result<bool> {
            Ok(true)
        }

        async fn get_data(&self, key: &str, _target: &NodeId) -> Result<Option<Datum>> {
            Ok(self.remote.get(key))
        }

        async fn get_datum(&self, keys: &[String], _target: &NodeId) -> Result<Vec<Datum>> {
            Ok(self.remote.batch_get(keys))
        }

        async fn get_all_datum(&self, _target: &NodeId) -> Result<Vec<Datum>> {
            Ok(self.remote.all())
        }
    }

    async fn build_service(
        transport: Arc<dyn TransportAgent>,
        config: SyncConfig,
    ) -> (
        Arc<ConsistencyService>,
        Arc<EphemeralStore>,
        Arc<MembershipService>,
        Arc<OwnershipMapper>,
        Arc<SyncBatchEngine>,
    ) {
        let membership = membership_fixture().await;
        let store = EphemeralStore::new();
        let mapper = OwnershipMapper::new(&membership);
        let listeners = ListenerTable::new();
        let notifier = Notifier::new(store.clone(), listeners.clone());
        notifier.clone().start();

        let engine = SyncBatchEngine::new(
            config.clone(),
            ExplodingFailureHandler::new(config.retry_delay),
        );

        let service = ConsistencyService::new(
            store.clone(),
            notifier,
            listeners,
            engine.clone(),
            membership.clone(),
            mapper.clone(),
            transport,
            config,
            "registry/instances",
        );

        (service, store, membership, mapper, engine)
    }

    struct CountingListener {
        changes: AtomicUsize,
        deletes: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                changes: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
            })
        }
    }

    impl RecordListener for CountingListener {
        fn on_change(&self, _key: &str, _value: &[u8]) -> Result<()> {
            self.changes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_delete(&self, _key: &str) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingListener;

    impl RecordListener for FailingListener {
        fn on_change(&self, key: &str, _value: &[u8]) -> Result<()> {
            anyhow::bail!("listener broke on change of {}", key)
        }

        fn on_delete(&self, key: &str) -> Result<()> {
            anyhow::bail!("listener broke on delete of {}", key)
        }
    }

    // ============================================================
    // STORAGE TESTS
    // ============================================================

    #[test]
    fn test_put_recomputes_checksum() {
        let store = EphemeralStore::new();

        let first = store.put("svc", b"v1".to_vec());
        let second = store.put("svc", b"v2".to_vec());

        assert_ne!(first.checksum, second.checksum);
        assert_eq!(store.checksum("svc"), Some(second.checksum));
    }

    #[test]
    fn test_checksum_stable_for_equal_values() {
        let store = EphemeralStore::new();

        let first = store.put("svc", b"same".to_vec());
        let second = store.put("svc", b"same".to_vec());

        // Two nodes holding this checksum may assume equal values.
        assert_eq!(first.checksum, second.checksum);
        assert_eq!(first.checksum, EphemeralStore::checksum_of(b"same"));
    }

    #[test]
    fn test_write_hook_fires_only_for_unknown_keys() {
        let store = EphemeralStore::new();
        let hook_calls = Arc::new(AtomicUsize::new(0));

        let counter = hook_calls.clone();
        store.set_write_hook(Arc::new(move |_key| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        store.put("svc-a", b"v1".to_vec());
        store.put("svc-a", b"v2".to_vec());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

        // Replicated data for a never-seen key runs the hook too.
        store.put_datum(make_datum("svc-b", "replicated"));
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_batch_get_skips_missing_keys() {
        let store = EphemeralStore::new();
        store.put("k1", b"a".to_vec());
        store.put("k3", b"c".to_vec());

        let keys = vec!["k1".to_string(), "k2".to_string(), "k3".to_string()];
        let entries = store.batch_get(&keys);

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|d| d.key == "k1" || d.key == "k3"));
    }

    #[test]
    fn test_remove_then_get_returns_none() {
        let store = EphemeralStore::new();
        store.put("svc", b"v".to_vec());

        let removed = store.remove("svc");
        assert!(removed.is_some());
        assert!(store.get("svc").is_none());
        assert!(store.local_keys().is_empty());
    }

    // ============================================================
    // OWNERSHIP MAPPER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_local_responsible_when_view_empty() {
        let membership = membership_fixture().await;
        let mapper = OwnershipMapper::new(&membership);

        mapper.refresh_from(&[]);

        assert_eq!(mapper.owner_of("any-key"), None);
        assert!(mapper.responsible("any-key"));
    }

    #[tokio::test]
    async fn test_single_healthy_node_owns_all_keys() {
        let membership = membership_fixture().await;
        let mapper = OwnershipMapper::new(&membership);

        let mut local = test_node("ignored", 7000);
        local.id = mapper.local_id().clone();
        mapper.refresh_from(&[local]);

        assert!(mapper.responsible("svc-a"));
        assert!(mapper.responsible("svc-b"));
    }

    #[tokio::test]
    async fn test_remote_owner_means_not_responsible() {
        let membership = membership_fixture().await;
        let mapper = OwnershipMapper::new(&membership);

        let remote = test_node("remote-node", 7000);
        mapper.refresh_from(&[remote.clone()]);

        assert_eq!(mapper.owner_of("svc"), Some(remote.id));
        assert!(!mapper.responsible("svc"));
    }

    #[tokio::test]
    async fn test_ownership_deterministic_across_same_view() {
        let membership_a = membership_fixture().await;
        let membership_b = membership_fixture().await;
        let mapper_a = OwnershipMapper::new(&membership_a);
        let mapper_b = OwnershipMapper::new(&membership_b);

        // Two nodes sharing a membership view must agree on every owner.
        let view = vec![test_node("node-1", 7000), test_node("node-2", 7001)];
        mapper_a.refresh_from(&view);
        mapper_b.refresh_from(&view);

        for key in ["svc-a", "svc-b", "svc-c", "svc-d"] {
            assert_eq!(mapper_a.owner_of(key), mapper_b.owner_of(key));
        }
    }

    #[tokio::test]
    async fn test_dead_members_excluded_from_ownership() {
        let membership = membership_fixture().await;
        let mapper = OwnershipMapper::new(&membership);

        let mut dead = test_node("dead-node", 7000);
        dead.state = NodeState::Dead;
        let alive = test_node("alive-node", 7001);
        mapper.refresh_from(&[dead, alive.clone()]);

        assert_eq!(mapper.owner_of("svc"), Some(alive.id));
    }

    // ============================================================
    // NOTIFIER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_change_coalescing_before_drain() {
        let store = EphemeralStore::new();
        let listeners = ListenerTable::new();
        let notifier = Notifier::new(store, listeners);

        notifier.add_task("svc", DataAction::Change);
        notifier.add_task("svc", DataAction::Change);

        // The second CHANGE is dropped, not re-queued.
        assert_eq!(notifier.task_len(), 1);
        assert_eq!(notifier.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_delete_always_enqueued() {
        let store = EphemeralStore::new();
        let listeners = ListenerTable::new();
        let notifier = Notifier::new(store, listeners);

        notifier.add_task("svc", DataAction::Change);
        notifier.add_task("svc", DataAction::Delete);
        notifier.add_task("svc", DataAction::Delete);

        // Both DELETEs queue behind the pending CHANGE.
        assert_eq!(notifier.task_len(), 3);
        assert_eq!(notifier.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_coalesced_changes_notify_once() {
        let store = EphemeralStore::new();
        let listeners = ListenerTable::new();
        let notifier = Notifier::new(store.clone(), listeners.clone());

        let listener = CountingListener::new();
        listeners.add("svc", listener.clone());
        store.put("svc", b"v1".to_vec());

        // Two rapid CHANGEs before the consumer starts draining.
        notifier.add_task("svc", DataAction::Change);
        notifier.add_task("svc", DataAction::Change);
        notifier.clone().start();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(listener.changes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_receives_change_and_delete() {
        let store = EphemeralStore::new();
        let listeners = ListenerTable::new();
        let notifier = Notifier::new(store.clone(), listeners.clone());
        notifier.clone().start();

        let listener = CountingListener::new();
        listeners.add("svc", listener.clone());

        store.put("svc", b"v1".to_vec());
        notifier.add_task("svc", DataAction::Change);
        tokio::time::sleep(Duration::from_millis(100)).await;

        store.remove("svc");
        notifier.add_task("svc", DataAction::Delete);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(listener.changes.load(Ordering::SeqCst), 1);
        assert_eq!(listener.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let store = EphemeralStore::new();
        let listeners = ListenerTable::new();
        let notifier = Notifier::new(store.clone(), listeners.clone());
        notifier.clone().start();

        // The failing listener runs first; the counting one must still fire,
        // and so must the following notification.
        let counting = CountingListener::new();
        listeners.add("svc", Arc::new(FailingListener));
        listeners.add("svc", counting.clone());

        store.put("svc", b"v1".to_vec());
        notifier.add_task("svc", DataAction::Change);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counting.changes.load(Ordering::SeqCst), 1);

        store.remove("svc");
        notifier.add_task("svc", DataAction::Delete);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counting.deletes.load(Ordering::SeqCst), 1);
    }

    // ============================================================
    // FACADE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_put_never_blocks_and_is_readable_at_once() {
        let (service, _store, _membership, _mapper, engine) =
            build_service(StoreBackedTransport::empty(), SyncConfig::default()).await;

        service.put("svc", b"v1".to_vec());

        let datum = service.get("svc").expect("Datum should exist");
        assert_eq!(datum.value, b"v1".to_vec());
        // No peers, nothing to fan out to.
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_put_fans_out_one_task_per_peer() {
        let (service, _store, membership, _mapper, engine) =
            build_service(StoreBackedTransport::empty(), SyncConfig::default()).await;

        let peer_a = test_node("peer-a", 7100);
        let peer_b = test_node("peer-b", 7101);
        membership.members.insert(peer_a.id.clone(), peer_a);
        membership.members.insert(peer_b.id.clone(), peer_b);

        service.put("svc", b"v1".to_vec());

        assert_eq!(engine.pending_len(), 2);
    }

    #[tokio::test]
    async fn test_process_batch_is_idempotent() {
        let (service, _store, _membership, _mapper, _engine) =
            build_service(StoreBackedTransport::empty(), SyncConfig::default()).await;

        let listener = CountingListener::new();
        service.listen("svc", listener.clone());

        let datum = make_datum("svc", "replicated-v1");
        assert_eq!(service.process_batch(vec![datum.clone()]), 1);
        assert_eq!(service.process_batch(vec![datum]), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;

        // The duplicate push produced no second notification.
        assert_eq!(listener.changes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_process_batch_overwrites_on_checksum_mismatch() {
        let (service, store, _membership, _mapper, _engine) =
            build_service(StoreBackedTransport::empty(), SyncConfig::default()).await;

        store.put("svc", b"local".to_vec());

        let incoming = make_datum("svc", "remote");
        assert_eq!(service.process_batch(vec![incoming.clone()]), 1);

        let stored = store.get("svc").unwrap();
        assert_eq!(stored.value, b"remote".to_vec());
        assert_eq!(stored.checksum, incoming.checksum);
    }

    #[tokio::test]
    async fn test_verify_report_update_and_remove() {
        let (service, store, _membership, mapper, _engine) =
            build_service(StoreBackedTransport::empty(), SyncConfig::default()).await;

        // Pin ownership of every key to the digest's source.
        let source = test_node("source-node", 7200);
        mapper.refresh_from(&[source.clone()]);

        store.put("k-stale", b"old".to_vec());
        store.put("k-dropped", b"gone-at-source".to_vec());

        let mut checksums = HashMap::new();
        checksums.insert(
            "k-stale".to_string(),
            EphemeralStore::checksum_of(b"new"),
        );
        checksums.insert(
            "k-missing".to_string(),
            EphemeralStore::checksum_of(b"never-seen"),
        );

        let report = service
            .build_verify_report(&checksums, &source.id)
            .expect("Report should build");

        assert_eq!(report.to_update.len(), 2);
        assert!(report.to_update.contains(&"k-stale".to_string()));
        assert!(report.to_update.contains(&"k-missing".to_string()));
        assert_eq!(report.to_remove, vec!["k-dropped".to_string()]);
    }

    #[tokio::test]
    async fn test_verify_report_rejects_locally_owned_keys() {
        let (service, _store, _membership, mapper, _engine) =
            build_service(StoreBackedTransport::empty(), SyncConfig::default()).await;

        let mut local = test_node("ignored", 7300);
        local.id = mapper.local_id().clone();
        mapper.refresh_from(&[local]);

        let mut checksums = HashMap::new();
        checksums.insert("svc".to_string(), EphemeralStore::checksum_of(b"x"));

        let source = NodeId("confused-peer".to_string());
        assert!(service.build_verify_report(&checksums, &source).is_err());
    }

    #[tokio::test]
    async fn test_process_verify_pulls_updates_and_applies_removals() {
        // The digest source holds the authoritative copy of k-stale.
        let source_store = EphemeralStore::new();
        let authoritative = source_store.put("k-stale", b"fresh".to_vec());

        let (service, store, _membership, mapper, _engine) = build_service(
            StoreBackedTransport::new(source_store.clone()),
            SyncConfig::default(),
        )
        .await;

        let source = test_node("source-node", 7400);
        mapper.refresh_from(&[source.clone()]);

        store.put("k-stale", b"old".to_vec());
        store.put("k-dropped", b"deleted-at-source".to_vec());

        let mut checksums = HashMap::new();
        checksums.insert("k-stale".to_string(), authoritative.checksum.clone());

        service
            .process_verify(checksums, source.id)
            .await
            .expect("Verify round should succeed");

        // Convergence: the stale key now matches the source, the dropped key
        // is gone.
        let repaired = store.get("k-stale").expect("Key should have been pulled");
        assert_eq!(repaired.value, b"fresh".to_vec());
        assert_eq!(repaired.checksum, authoritative.checksum);
        assert!(store.get("k-dropped").is_none());
    }

    // ============================================================
    // AVAILABILITY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_not_available_until_warmed_up() {
        let (service, _store, _membership, _mapper, _engine) =
            build_service(StoreBackedTransport::empty(), SyncConfig::default()).await;

        assert!(!service.is_available());

        service.set_available_override(true);
        assert!(service.is_available());

        service.set_available_override(false);
        assert!(!service.is_available());
    }

    #[tokio::test]
    async fn test_founder_reports_available_without_peers() {
        let (service, _store, _membership, _mapper, _engine) =
            build_service(StoreBackedTransport::empty(), SyncConfig::default()).await;

        service.start_load_task(false);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(service.is_available());
    }

    #[tokio::test]
    async fn test_warmup_disabled_is_available_at_once() {
        let mut config = SyncConfig::default();
        config.data_warmup = false;

        let (service, _store, _membership, _mapper, _engine) =
            build_service(StoreBackedTransport::empty(), config).await;

        service.start_load_task(true);

        assert!(service.is_available());
    }

    #[tokio::test]
    async fn test_snapshot_load_fills_store_and_flips_available() {
        let snapshot_store = EphemeralStore::new();
        snapshot_store.put("svc-a", b"a".to_vec());
        snapshot_store.put("svc-b", b"b".to_vec());

        let (service, store, membership, _mapper, _engine) = build_service(
            StoreBackedTransport::new(snapshot_store),
            SyncConfig::default(),
        )
        .await;

        let peer = test_node("snapshot-peer", 7500);
        membership.members.insert(peer.id.clone(), peer);

        service.start_load_task(true);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(service.is_available());
        assert_eq!(store.len(), 2);
    }
}
