use axum::Json;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use registry_node::consistency::mapper::OwnershipMapper;
use registry_node::consistency::notifier::{ListenerTable, Notifier};
use registry_node::consistency::service::ConsistencyService;
use registry_node::consistency::storage::EphemeralStore;
use registry_node::membership::service::MembershipService;
use registry_node::sync::batcher::{ExplodingFailureHandler, SyncBatchEngine};
use registry_node::sync::config::SyncConfig;
use registry_node::sync::handlers::{
    handle_replica_batch, handle_replica_datum, handle_replica_query, handle_replica_snapshot,
    handle_replica_verify,
};
use registry_node::sync::protocol::{
    ENDPOINT_REPLICA_BATCH, ENDPOINT_REPLICA_DATUM, ENDPOINT_REPLICA_QUERY,
    ENDPOINT_REPLICA_SNAPSHOT, ENDPOINT_REPLICA_VERIFY,
};
use registry_node::sync::syncer::DataSyncer;
use registry_node::sync::transport::HttpTransport;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Resource type of the replicated service-instance records. Keys are scoped
/// to their resource type, and the batch engine routes combined batches to
/// the processor registered under this prefix.
const INSTANCE_RESOURCE: &str = "registry/instances";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} --bind <addr:port> [--seed <addr:port>]", args[0]);
        eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--seed" => {
                seed_nodes.push(args[i + 1].parse()?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.expect("--bind is required");
    let expect_peers = !seed_nodes.is_empty();

    tracing::info!("Starting node on {}", bind_addr);
    if expect_peers {
        tracing::info!("Seed nodes: {:?}", seed_nodes);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    let config = SyncConfig::from_env();

    // 1. Membership (UDP gossip):
    let membership = MembershipService::new(bind_addr, seed_nodes).await?;
    tracing::info!("Node ID: {:?}", membership.local_node.id);

    // 2. Local state: store, ownership, change notification.
    let store = EphemeralStore::new();
    store.set_write_hook(Arc::new(|key: &str| {
        // First write for an unknown key, usually replicated data for a
        // service this node never saw a local registration for.
        tracing::info!("Materializing empty service entry for {}", key);
    }));

    let mapper = OwnershipMapper::new(&membership);
    let listeners = ListenerTable::new();
    let notifier = Notifier::new(store.clone(), listeners.clone());
    notifier.clone().start();

    // 3. Replication: transport, batch engine, push syncer.
    let transport = HttpTransport::new(membership.clone());
    let failure_handler = ExplodingFailureHandler::new(config.retry_delay);
    let engine = SyncBatchEngine::new(config.clone(), failure_handler);
    engine.start();

    let syncer = DataSyncer::new(
        store.clone(),
        membership.clone(),
        mapper.clone(),
        transport.clone(),
        config.clone(),
    );
    syncer.start_verify_task();

    let push_syncer = syncer.clone();
    engine.register_processor(INSTANCE_RESOURCE, move |batch| {
        let syncer = push_syncer.clone();
        async move {
            syncer.submit(batch.into(), Duration::ZERO);
            Ok(())
        }
    });

    // 4. The facade everything above hangs off.
    let service = ConsistencyService::new(
        store.clone(),
        notifier,
        listeners,
        engine.clone(),
        membership.clone(),
        mapper,
        transport,
        config,
        INSTANCE_RESOURCE,
    );
    service.start_load_task(expect_peers);

    // 5. HTTP Router:
    let app = Router::new()
        .route("/registry/put", post(handle_registry_put))
        .route("/registry/get/:service", get(handle_registry_get))
        .route("/registry/remove/:service", post(handle_registry_remove))
        .route(ENDPOINT_REPLICA_BATCH, post(handle_replica_batch))
        .route(ENDPOINT_REPLICA_VERIFY, post(handle_replica_verify))
        .route(
            &format!("{}/:key", ENDPOINT_REPLICA_DATUM),
            get(handle_replica_datum),
        )
        .route(ENDPOINT_REPLICA_QUERY, post(handle_replica_query))
        .route(ENDPOINT_REPLICA_SNAPSHOT, get(handle_replica_snapshot))
        .layer(Extension(service.clone()));

    // 6. Spawn membership service:
    let service_clone = membership.clone();
    tokio::spawn(async move {
        service_clone.start().await;
    });

    // 7. Spawn stats reporter:
    let stats_membership = membership.clone();
    let stats_store = store.clone();
    let stats_engine = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_membership.get_alive_members();
            tracing::info!(
                "Cluster stats: {} alive nodes, {} datums, {} pending sync tasks",
                alive.len(),
                stats_store.len(),
                stats_engine.pending_len()
            );
            for node in alive {
                tracing::info!(
                    "  - {:?} gossip={} http={} (inc={})",
                    node.id,
                    node.gossip_addr,
                    node.http_addr,
                    node.incarnation
                );
            }
        }
    });

    // 8. Start HTTP server:
    let http_addr = membership.local_node.http_addr;

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Demo record replicated through the registry: the instance list of one
/// service, keyed by service name.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServiceRecord {
    service: String,
    instances: Vec<Instance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Instance {
    ip: String,
    port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryAck {
    success: bool,
}

async fn handle_registry_put(
    Extension(service): Extension<Arc<ConsistencyService>>,
    Json(record): Json<ServiceRecord>,
) -> (StatusCode, Json<RegistryAck>) {
    if !service.is_available() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RegistryAck { success: false }),
        );
    }

    let value = match serde_json::to_vec(&record) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!("Failed to serialize record for {}: {}", record.service, e);
            return (
                StatusCode::BAD_REQUEST,
                Json(RegistryAck { success: false }),
            );
        }
    };

    service.put(&record.service, value);

    (StatusCode::OK, Json(RegistryAck { success: true }))
}

async fn handle_registry_get(
    Extension(service): Extension<Arc<ConsistencyService>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Option<ServiceRecord>>) {
    if !service.is_available() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(None));
    }

    match service.get(&name) {
        Some(datum) => match serde_json::from_slice::<ServiceRecord>(&datum.value) {
            Ok(record) => (StatusCode::OK, Json(Some(record))),
            Err(e) => {
                tracing::error!("Stored record for {} is not valid JSON: {}", name, e);
                (StatusCode::INTERNAL_SERVER_ERROR, Json(None))
            }
        },
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}

async fn handle_registry_remove(
    Extension(service): Extension<Arc<ConsistencyService>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<RegistryAck>) {
    service.remove(&name);

    (StatusCode::OK, Json(RegistryAck { success: true }))
}
