use crate::consistency::types::DataAction;
use crate::membership::types::NodeId;

/// Identifies one logical mutation destined for one peer.
///
/// Key uniqueness is scoped to `(resource_type, resource_key)`; the target
/// makes the same mutation addressed to different peers distinct tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncKey {
    pub resource_key: String,
    pub resource_type: String,
    pub target: NodeId,
}

/// A mutation waiting for batch formation. Becomes eligible for dispatch once
/// `due_at` has passed. A non-zero `retry_count` marks a task that came back
/// from a failed batch; such tasks dispatch alone instead of re-combining.
#[derive(Debug, Clone)]
pub struct PendingSync {
    pub action: DataAction,
    pub due_at: u64,
    pub retry_count: u32,
}

/// An aggregation of resource keys sharing a type and a target peer,
/// replacing one network call per key with a single batched call.
#[derive(Debug, Clone)]
pub struct BatchTask {
    pub resource_type: String,
    pub resource_keys: Vec<String>,
    pub target: NodeId,
    pub retry_count: u32,
}

/// A push job handed to the data syncer. `retry_count` is zero for a fresh
/// submission and grows by one per failed push.
#[derive(Debug, Clone)]
pub struct PushTask {
    pub keys: Vec<String>,
    pub target: NodeId,
    pub retry_count: u32,
}

impl PushTask {
    pub fn new(keys: Vec<String>, target: NodeId) -> Self {
        Self {
            keys,
            target,
            retry_count: 0,
        }
    }
}

impl From<BatchTask> for PushTask {
    // Always a fresh push: engine-level retries happened before any claim
    // was taken, so the push task must still go through claiming.
    fn from(batch: BatchTask) -> Self {
        Self::new(batch.resource_keys, batch.target)
    }
}
