//! Configuration for the node transport layer.

use std::time::Duration;

/// Configuration for a node's transport, codec and batching.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// How long outbound bodies to the same node are held back so they can
    /// be coalesced into one `batch` (ms).  Zero sends every body at once.
    /// Clients never receive batches regardless of this setting.
    pub batch_window_ms: u64,

    /// Longest accepted input line in bytes.  Longer lines are dropped.
    pub max_line_length: usize,

    /// Size of the channel between the stdin reader and the node.
    pub inbound_buffer_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 0,
            max_line_length: 1_048_576, // 1 MiB
            inbound_buffer_size: 10_000,
        }
    }
}

impl NodeConfig {
    /// Create a config suitable for local testing with smaller buffers.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            batch_window_ms: 0,
            max_line_length: 65_536,
            inbound_buffer_size: 1_000,
        }
    }

    /// The batching window, or `None` when batching is disabled.
    pub fn batch_window(&self) -> Option<Duration> {
        (self.batch_window_ms > 0).then(|| Duration::from_millis(self.batch_window_ms))
    }
}
