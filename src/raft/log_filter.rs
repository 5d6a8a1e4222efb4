//! Forwards consensus-layer log lines to `tracing`, dropping configured noise.

use tracing::{debug, error, info, warn};

/// Log adapter for the consensus substrate.
///
/// Messages containing any of the suppressed substrings are dropped.
#[derive(Debug, Clone, Default)]
pub struct RaftLogFilter {
    suppressed: Vec<String>,
}

impl RaftLogFilter {
    pub fn new(suppressed: Vec<String>) -> Self {
        Self { suppressed }
    }

    pub fn is_suppressed(&self, msg: &str) -> bool {
        self.suppressed.iter().any(|s| msg.contains(s.as_str()))
    }

    pub fn debug(&self, msg: &str) {
        if !self.is_suppressed(msg) {
            debug!(target: "raft", "{}", msg);
        }
    }

    pub fn info(&self, msg: &str) {
        if !self.is_suppressed(msg) {
            info!(target: "raft", "{}", msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        if !self.is_suppressed(msg) {
            warn!(target: "raft", "{}", msg);
        }
    }

    pub fn error(&self, msg: &str) {
        if !self.is_suppressed(msg) {
            error!(target: "raft", "{}", msg);
        }
    }
}
