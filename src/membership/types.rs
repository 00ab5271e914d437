use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

/// A single member of the cluster.
///
/// Carries identity, both network addresses (UDP gossip and HTTP
/// replication), and the current lifecycle state. The `incarnation` field is
/// a logical clock used to order state updates and resolve conflicts (e.g.
/// refuting a false Suspect claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// The gossip wire protocol.
///
/// - `Ping`/`Ack`: liveness checks; the ack piggybacks the full member list.
/// - `Join`: sent to seed nodes by a starting node.
/// - `Suspect`/`Alive`: disseminate health-state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        incarnation: u64,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        node: Node,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },
}
