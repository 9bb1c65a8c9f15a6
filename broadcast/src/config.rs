//! Broadcast engine configuration.
//!
//! Two timing parameters drive propagation: how long a neighbor may stay
//! silent before its call is retried, and how often a node reports progress
//! to whoever is waiting on it.  The report interval must be shorter than
//! the silence window, otherwise a busy but healthy subtree would look dead
//! to the node upstream of it.

use std::time::Duration;

/// Configuration for the broadcast engine.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Liveness window for each `broadcast_peer` call in milliseconds.
    /// A neighbor that sends neither reply nor feedback within it is
    /// retried.
    /// Default: 500.
    pub peer_timeout_ms: u64,

    /// Interval between progress reports to waiting requesters in
    /// milliseconds.  A report is sent only if the confirmed set grew.
    /// Default: 200.
    pub feedback_interval_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            peer_timeout_ms: 500,
            feedback_interval_ms: 200,
        }
    }
}

impl BroadcastConfig {
    /// Create a config suitable for local testing with shorter timeouts.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            peer_timeout_ms: 100,
            feedback_interval_ms: 40,
        }
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn feedback_interval(&self) -> Duration {
        Duration::from_millis(self.feedback_interval_ms)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_timeout_ms == 0 {
            return Err(ConfigError::InvalidPeerTimeout);
        }
        if self.feedback_interval_ms == 0 || self.feedback_interval_ms >= self.peer_timeout_ms {
            return Err(ConfigError::InvalidFeedbackInterval {
                interval_ms: self.feedback_interval_ms,
                timeout_ms: self.peer_timeout_ms,
            });
        }
        Ok(())
    }
}

/// Errors in broadcast configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("peer_timeout_ms must be > 0")]
    InvalidPeerTimeout,
    #[error("feedback_interval_ms must be in (0, {timeout_ms}), got {interval_ms}")]
    InvalidFeedbackInterval { interval_ms: u64, timeout_ms: u64 },
}
