//! Request and reply payloads of the broadcast protocol.

use {
    flood_net::NodeId,
    serde::{Deserialize, Serialize},
    std::collections::HashMap,
};

/// A broadcast value.
pub type Message = i64;

pub const TOPOLOGY: &str = "topology";
pub const BROADCAST: &str = "broadcast";
pub const BROADCAST_PEER: &str = "broadcast_peer";
pub const READ: &str = "read";

/// Replaces the adjacency map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRequest {
    pub topology: HashMap<NodeId, Vec<NodeId>>,
}

/// Client request to spread a value from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub message: Message,
}

/// Node-to-node propagation of a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastPeerRequest {
    pub message: Message,
    /// Nodes the sender already knows to hold the value.
    #[serde(default, alias = "sendeds")]
    pub confirmed: Vec<NodeId>,
    /// Route the value took, ending with the recipient.
    #[serde(default)]
    pub path: Vec<NodeId>,
}

/// Confirmed set carried by `broadcast_peer` replies and feedback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInform {
    #[serde(default, alias = "sendeds")]
    pub confirmed: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOk {
    pub messages: Vec<Message>,
}
