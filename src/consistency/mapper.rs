//! Key Ownership Mapping
//!
//! Decides which node is nominally responsible for a resource key, as a pure
//! function of the key and the current healthy-member list. Responsibility is
//! advisory: it picks who proactively pushes and verifies a key, it does not
//! partition storage.

use crate::membership::service::MembershipService;
use crate::membership::types::{Node, NodeId, NodeState};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

pub struct OwnershipMapper {
    local: NodeId,
    healthy: RwLock<Vec<NodeId>>,
}

impl OwnershipMapper {
    /// Builds a mapper seeded from the current membership view and keeps it
    /// current through a membership-change subscription.
    pub fn new(membership: &Arc<MembershipService>) -> Arc<Self> {
        let mapper = Arc::new(Self {
            local: membership.local_node.id.clone(),
            healthy: RwLock::new(Vec::new()),
        });
        mapper.refresh_from(&membership.all_members());

        let subscriber = mapper.clone();
        membership.subscribe(move |members| subscriber.refresh_from(&members));

        mapper
    }

    /// Rebuilds the cached healthy list. Sorting keeps the assignment stable
    /// across nodes that share the same membership view.
    pub fn refresh_from(&self, members: &[Node]) {
        let mut ids: Vec<NodeId> = members
            .iter()
            .filter(|node| node.state == NodeState::Alive)
            .map(|node| node.id.clone())
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));

        if let Ok(mut healthy) = self.healthy.write() {
            *healthy = ids;
        }
    }

    /// The node nominally responsible for the key, if any healthy node is
    /// known.
    pub fn owner_of(&self, resource_key: &str) -> Option<NodeId> {
        let healthy = self.healthy.read().ok()?;
        if healthy.is_empty() {
            return None;
        }

        let mut hasher = DefaultHasher::new();
        resource_key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % healthy.len();
        Some(healthy[index].clone())
    }

    /// Whether the local node should proactively push and verify this key.
    /// With no healthy view at all, the local node assumes responsibility.
    pub fn responsible(&self, resource_key: &str) -> bool {
        match self.owner_of(resource_key) {
            Some(owner) => owner == self.local,
            None => true,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }
}
