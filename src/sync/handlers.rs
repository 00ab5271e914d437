//! Replication HTTP Handlers
//!
//! Receive side of the replication endpoints. Handlers decode the DTOs and
//! delegate to the consistency service; a malformed body is a 400, a
//! processing failure a 500, an unknown key a 404.

use super::protocol::{
    DatumDto, DatumListResponse, DatumResponse, QueryRequest, SyncAckResponse, SyncBatchRequest,
    VerifyRequest, decode_batch, encode_batch,
};
use crate::consistency::service::ConsistencyService;
use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use std::sync::Arc;

pub async fn handle_replica_batch(
    Extension(service): Extension<Arc<ConsistencyService>>,
    Json(req): Json<SyncBatchRequest>,
) -> (StatusCode, Json<SyncAckResponse>) {
    let entries = match decode_batch(req.entries) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("Failed to decode batch from {:?}: {}", req.source, e);
            return (
                StatusCode::BAD_REQUEST,
                Json(SyncAckResponse { success: false }),
            );
        }
    };

    let applied = service.process_batch(entries);
    tracing::debug!("Applied {} datums pushed by {:?}", applied, req.source);

    (StatusCode::OK, Json(SyncAckResponse { success: true }))
}

pub async fn handle_replica_verify(
    Extension(service): Extension<Arc<ConsistencyService>>,
    Json(req): Json<VerifyRequest>,
) -> (StatusCode, Json<SyncAckResponse>) {
    match service.process_verify(req.checksums, req.source).await {
        Ok(()) => (StatusCode::OK, Json(SyncAckResponse { success: true })),
        Err(e) => {
            tracing::error!("Verify round failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SyncAckResponse { success: false }),
            )
        }
    }
}

pub async fn handle_replica_datum(
    Extension(service): Extension<Arc<ConsistencyService>>,
    Path(key): Path<String>,
) -> (StatusCode, Json<DatumResponse>) {
    match service.get(&key) {
        Some(datum) => (
            StatusCode::OK,
            Json(DatumResponse {
                entry: Some(DatumDto::from_datum(&datum)),
            }),
        ),
        None => (StatusCode::NOT_FOUND, Json(DatumResponse { entry: None })),
    }
}

pub async fn handle_replica_query(
    Extension(service): Extension<Arc<ConsistencyService>>,
    Json(req): Json<QueryRequest>,
) -> (StatusCode, Json<DatumListResponse>) {
    let entries = service.batch_get(&req.keys);

    (
        StatusCode::OK,
        Json(DatumListResponse {
            entries: encode_batch(&entries),
        }),
    )
}

pub async fn handle_replica_snapshot(
    Extension(service): Extension<Arc<ConsistencyService>>,
) -> (StatusCode, Json<DatumListResponse>) {
    let entries = service.all_datums();

    (
        StatusCode::OK,
        Json(DatumListResponse {
            entries: encode_batch(&entries),
        }),
    )
}
