//! Raft node state.

use serde::{Deserialize, Serialize};

/// The state of a Raft node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Follower state - passive, responds to RPCs.
    Follower,
    /// Candidate state - actively seeking election.
    Candidate,
    /// Leader state - handling client requests and replication.
    Leader,
    /// No longer participating in consensus.
    Shutdown,
}

impl NodeState {
    pub fn is_leader(&self) -> bool {
        matches!(self, NodeState::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, NodeState::Follower)
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, NodeState::Shutdown)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "Follower"),
            NodeState::Candidate => write!(f, "Candidate"),
            NodeState::Leader => write!(f, "Leader"),
            NodeState::Shutdown => write!(f, "Shutdown"),
        }
    }
}
