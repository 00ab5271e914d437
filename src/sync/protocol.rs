//! Replication Network Protocol
//!
//! Endpoint constants and Data Transfer Objects (DTOs) for inter-node
//! replication traffic. Bodies are JSON; opaque datum values travel
//! base64-encoded so they survive the JSON envelope unharmed.

use crate::consistency::types::Datum;
use crate::membership::types::NodeId;
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// --- API Endpoints ---

/// Receives a pushed batch of datums.
pub const ENDPOINT_REPLICA_BATCH: &str = "/internal/replica/batch";
/// Receives an anti-entropy checksum map.
pub const ENDPOINT_REPLICA_VERIFY: &str = "/internal/replica/verify";
/// Single-datum lookup by key.
pub const ENDPOINT_REPLICA_DATUM: &str = "/internal/replica/datum";
/// Batched datum lookup for a list of keys.
pub const ENDPOINT_REPLICA_QUERY: &str = "/internal/replica/query";
/// Full-state dump for catch-up of a joining or recovering node.
pub const ENDPOINT_REPLICA_SNAPSHOT: &str = "/internal/replica/snapshot";

// --- Data Transfer Objects ---

/// Wire form of a [`Datum`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatumDto {
    pub key: String,
    /// Base64 of the opaque value bytes.
    pub value_b64: String,
    pub checksum: String,
    pub timestamp: u64,
}

impl DatumDto {
    pub fn from_datum(datum: &Datum) -> Self {
        Self {
            key: datum.key.clone(),
            value_b64: BASE64.encode(&datum.value),
            checksum: datum.checksum.clone(),
            timestamp: datum.timestamp,
        }
    }

    pub fn into_datum(self) -> Result<Datum> {
        let value = BASE64
            .decode(&self.value_b64)
            .with_context(|| format!("invalid value encoding for key {}", self.key))?;
        Ok(Datum {
            key: self.key,
            value,
            checksum: self.checksum,
            timestamp: self.timestamp,
        })
    }
}

pub fn encode_batch(entries: &[Datum]) -> Vec<DatumDto> {
    entries.iter().map(DatumDto::from_datum).collect()
}

pub fn decode_batch(entries: Vec<DatumDto>) -> Result<Vec<Datum>> {
    entries.into_iter().map(DatumDto::into_datum).collect()
}

/// A pushed batch of replicated datums.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncBatchRequest {
    /// Node the batch originates from.
    pub source: NodeId,
    pub entries: Vec<DatumDto>,
}

/// Acknowledgment for push and verify calls.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncAckResponse {
    pub success: bool,
}

/// Anti-entropy digest: checksum per key the sender is responsible for.
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub source: NodeId,
    pub checksums: HashMap<String, String>,
}

/// Batched datum lookup.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub keys: Vec<String>,
}

/// Response carrying zero or more datums (query and snapshot endpoints).
#[derive(Debug, Serialize, Deserialize)]
pub struct DatumListResponse {
    pub entries: Vec<DatumDto>,
}

/// Response for a single-datum lookup. `None` means the key is unknown.
#[derive(Debug, Serialize, Deserialize)]
pub struct DatumResponse {
    pub entry: Option<DatumDto>,
}
