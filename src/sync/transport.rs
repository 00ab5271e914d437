//! Peer Transport
//!
//! The network primitive the replication core pushes batches and checksum
//! digests through, and pulls data from. The core only sees the
//! [`TransportAgent`] trait, injected once at startup; per-call timeouts,
//! retry/backoff and connection management all live inside the
//! implementation.

use super::protocol::{
    DatumListResponse, DatumResponse, ENDPOINT_REPLICA_BATCH, ENDPOINT_REPLICA_DATUM,
    ENDPOINT_REPLICA_QUERY, ENDPOINT_REPLICA_SNAPSHOT, ENDPOINT_REPLICA_VERIFY, QueryRequest,
    SyncAckResponse, SyncBatchRequest, VerifyRequest, decode_batch, encode_batch,
};
use crate::consistency::types::Datum;
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait TransportAgent: Send + Sync {
    /// Pushes a batch of datums. `Ok(true)` means the peer applied it.
    async fn sync_data(&self, entries: &[Datum], target: &NodeId) -> Result<bool>;

    /// Pushes an anti-entropy checksum digest.
    async fn sync_verify(
        &self,
        checksums: &HashMap<String, String>,
        target: &NodeId,
    ) -> Result<bool>;

    /// Pulls a single datum from a peer.
    async fn get_data(&self, key: &str, target: &NodeId) -> Result<Option<Datum>>;

    /// Pulls the datums for a list of keys in one call.
    async fn get_datum(&self, keys: &[String], target: &NodeId) -> Result<Vec<Datum>>;

    /// Pulls the peer's complete data set (catch-up for a joining or
    /// recovering node).
    async fn get_all_datum(&self, target: &NodeId) -> Result<Vec<Datum>>;
}

/// HTTP implementation speaking JSON against the `/internal/replica`
/// endpoints, resolving node ids to HTTP addresses through membership.
pub struct HttpTransport {
    local_id: NodeId,
    membership: Arc<MembershipService>,
    http_client: reqwest::Client,
}

const PUSH_TIMEOUT: Duration = Duration::from_millis(800);
const PULL_TIMEOUT: Duration = Duration::from_secs(3);
const ATTEMPTS: usize = 3;

impl HttpTransport {
    pub fn new(membership: Arc<MembershipService>) -> Arc<Self> {
        Arc::new(Self {
            local_id: membership.local_node.id.clone(),
            membership,
            http_client: reqwest::Client::new(),
        })
    }

    fn resolve(&self, target: &NodeId) -> Result<SocketAddr> {
        self.membership
            .get_member(target)
            .map(|node| node.http_addr)
            .ok_or_else(|| anyhow::anyhow!("Unknown target node: {:?}", target))
    }

    async fn post_with_retry<T: serde::Serialize>(
        &self,
        url: String,
        payload: &T,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    // Simple jitter to prevent thundering herd
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }

    async fn get_with_retry(
        &self,
        url: String,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .get(url.clone())
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }
}

#[async_trait]
impl TransportAgent for HttpTransport {
    async fn sync_data(&self, entries: &[Datum], target: &NodeId) -> Result<bool> {
        let addr = self.resolve(target)?;
        let payload = SyncBatchRequest {
            source: self.local_id.clone(),
            entries: encode_batch(entries),
        };

        let response = self
            .post_with_retry(
                format!("http://{}{}", addr, ENDPOINT_REPLICA_BATCH),
                &payload,
                PUSH_TIMEOUT,
                ATTEMPTS,
            )
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Batch push failed: {}", response.status()));
        }

        let ack: SyncAckResponse = response.json().await?;
        Ok(ack.success)
    }

    async fn sync_verify(
        &self,
        checksums: &HashMap<String, String>,
        target: &NodeId,
    ) -> Result<bool> {
        let addr = self.resolve(target)?;
        let payload = VerifyRequest {
            source: self.local_id.clone(),
            checksums: checksums.clone(),
        };

        let response = self
            .post_with_retry(
                format!("http://{}{}", addr, ENDPOINT_REPLICA_VERIFY),
                &payload,
                PUSH_TIMEOUT,
                ATTEMPTS,
            )
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Verify push failed: {}", response.status()));
        }

        let ack: SyncAckResponse = response.json().await?;
        Ok(ack.success)
    }

    async fn get_data(&self, key: &str, target: &NodeId) -> Result<Option<Datum>> {
        let addr = self.resolve(target)?;

        let response = self
            .get_with_retry(
                format!("http://{}{}/{}", addr, ENDPOINT_REPLICA_DATUM, key),
                PULL_TIMEOUT,
                ATTEMPTS,
            )
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Datum fetch failed: {}", response.status()));
        }

        let body: DatumResponse = response.json().await?;
        match body.entry {
            Some(dto) => Ok(Some(dto.into_datum()?)),
            None => Ok(None),
        }
    }

    async fn get_datum(&self, keys: &[String], target: &NodeId) -> Result<Vec<Datum>> {
        let addr = self.resolve(target)?;
        let payload = QueryRequest {
            keys: keys.to_vec(),
        };

        let response = self
            .post_with_retry(
                format!("http://{}{}", addr, ENDPOINT_REPLICA_QUERY),
                &payload,
                PULL_TIMEOUT,
                ATTEMPTS,
            )
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Datum query failed: {}", response.status()));
        }

        let body: DatumListResponse = response.json().await?;
        decode_batch(body.entries)
    }

    async fn get_all_datum(&self, target: &NodeId) -> Result<Vec<Datum>> {
        let addr = self.resolve(target)?;

        let response = self
            .get_with_retry(
                format!("http://{}{}", addr, ENDPOINT_REPLICA_SNAPSHOT),
                PULL_TIMEOUT,
                ATTEMPTS,
            )
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Snapshot fetch failed: {}", response.status()));
        }

        let body: DatumListResponse = response.json().await?;
        decode_batch(body.entries)
    }
}
