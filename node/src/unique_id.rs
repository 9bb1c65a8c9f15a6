//! `generate`: cluster-unique ids without coordination.
//!
//! Node ids are unique within the cluster, so prefixing a node-local counter
//! with the node id is enough.

use {
    flood_net::{reply_with, Node, NodeId},
    serde::{Deserialize, Serialize},
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

pub const GENERATE: &str = "generate";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateOk {
    pub id: String,
}

/// Produces `<node_id>_<counter>` ids.
#[derive(Debug)]
pub struct IdGenerator {
    node_id: NodeId,
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            next: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}", self.node_id, n)
    }
}

pub fn register(node: &Node) {
    let ids = Arc::new(IdGenerator::new(node.id()));
    node.handle(GENERATE, move |_, _| {
        let id = ids.next_id();
        async move { reply_with(&GenerateOk { id }) }
    });
}
