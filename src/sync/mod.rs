//! Push Replication Module
//!
//! The network half of the replication protocol, built around three
//! cooperating pieces:
//!
//! 1. **Batch engine** (`batcher`): coalesces per-key mutation tasks into
//!    combined per-peer batches, sharded for parallel formation, with
//!    exploding retries isolating poison keys.
//! 2. **Data syncer** (`syncer`): executes pushes with in-flight
//!    de-duplication and fixed-delay retries bounded only by target health,
//!    and broadcasts the periodic anti-entropy checksum digest.
//! 3. **Transport** (`transport`): the injected network primitive; the HTTP
//!    implementation owns timeouts, retry/backoff and address resolution.
//!
//! `protocol` defines the wire DTOs and endpoint constants, `handlers` the
//! receive-side axum handlers, and `config` the tunables.

pub mod batcher;
pub mod config;
pub mod handlers;
pub mod protocol;
pub mod syncer;
pub mod transport;
pub mod types;
