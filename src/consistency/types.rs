use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A versioned record held by the ephemeral store.
///
/// Every node keeps a full replica of every datum it has seen; the checksum is
/// a digest of `value` and is what travels during anti-entropy comparison
/// instead of the payload itself. Two nodes holding the same checksum for a
/// key are assumed to hold equal values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Datum {
    /// Unique key within the resource type.
    pub key: String,
    /// Opaque value bytes. Serialization of the domain record is the caller's
    /// concern.
    pub value: Vec<u8>,
    /// Hex digest of `value`, recomputed on every local write.
    pub checksum: String,
    /// Timestamp (ms) of the write that produced this version.
    pub timestamp: u64,
}

/// The kind of mutation applied to a key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataAction {
    Change,
    Delete,
}

/// Domain-facing change listener, registered per key via the consistency
/// service. Listener code runs on the single notifier consumer and must be
/// fast; a slow listener delays every later notification.
pub trait RecordListener: Send + Sync {
    fn on_change(&self, key: &str, value: &[u8]) -> Result<()>;

    fn on_delete(&self, key: &str) -> Result<()>;
}

/// Outcome of comparing a received checksum map against local state.
///
/// Returned as a plain value from the comparison so concurrent verify rounds
/// from different sources never share mutable state.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VerifyReport {
    /// Keys whose local copy is missing or stale and must be pulled from the
    /// sender.
    pub to_update: Vec<String>,
    /// Local keys owned by the sender that the sender no longer lists; they
    /// have been deleted at the source.
    pub to_remove: Vec<String>,
}

impl VerifyReport {
    pub fn is_empty(&self) -> bool {
        self.to_update.is_empty() && self.to_remove.is_empty()
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
