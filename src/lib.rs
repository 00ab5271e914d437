//! Distributed Service-Registry Node Library
//!
//! This library crate defines the core modules that make up the registry node.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of three loosely coupled subsystems:
//!
//! - **`membership`**: The cluster coordination layer. Uses a UDP-based Gossip protocol
//!   (SWIM-like) to manage node discovery, failure detection, and cluster topology.
//! - **`consistency`**: The local half of the replication protocol: the authoritative
//!   in-memory store of versioned records, advisory key ownership, coalesced change
//!   notification, and the facade domain logic writes through.
//! - **`sync`**: The network half: combined-key batch formation, push execution with
//!   in-flight de-duplication and health-bounded retry, periodic checksum anti-entropy,
//!   and the HTTP transport plus its receive-side endpoints.
//!
//! Replication is AP by construction: a write completes once the local store accepts
//! it, fan-out to peers is asynchronous and at-least-once, and drift the push path
//! misses is repaired by the anti-entropy exchange.

pub mod consistency;
pub mod membership;
pub mod sync;
