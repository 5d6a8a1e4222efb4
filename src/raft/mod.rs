//! Consensus seam for the system database.
//!
//! The consensus algorithm itself lives outside this crate. This module
//! defines the two sides of the boundary: [`StateMachine`], which the
//! substrate drives with committed log entries, and [`RaftService`], which the
//! database uses to propose entries and manage leadership. [`LocalRaft`] is an
//! in-process substrate that applies entries synchronously in a single total
//! order, used to bootstrap a single replica and in tests.

// Deny unsafe code patterns in this critical consensus module.
// unwrap() calls can cause panics that break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod local;
mod log_filter;
mod state;

pub use local::LocalRaft;
pub use log_filter::RaftLogFilter;
pub use state::NodeState;

use crate::error::{ApplyError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

/// Trait for state machines that can be driven by Raft.
pub trait StateMachine: Send + Sync {
    /// Apply a committed command to the state machine.
    ///
    /// An error means the state machine can no longer be trusted; the
    /// implementation is responsible for taking the replica out of service
    /// before returning it.
    fn apply(&self, command: &[u8]) -> std::result::Result<(), ApplyError>;

    /// Create a snapshot of the current state.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Restore state from a snapshot.
    fn restore(&self, snapshot: &[u8]) -> Result<()>;
}

/// Handle on the consensus service hosting the replicated database.
#[async_trait]
pub trait RaftService: Send + Sync {
    /// Submit a command and wait until it has been committed and applied.
    async fn apply(&self, command: Vec<u8>, timeout: Duration) -> Result<()>;

    /// Add a voting member to the consensus configuration.
    async fn add_voter(&self, id: &str, addr: SocketAddr) -> Result<()>;

    /// Remove a member from the consensus configuration.
    async fn remove_server(&self, id: &str) -> Result<()>;

    /// Step down and hand leadership to another voter.
    async fn leadership_transfer(&self) -> Result<()>;

    /// Stop participating in consensus.
    fn shutdown(&self) -> Result<()>;

    /// Address of the current leader, if known.
    fn leader(&self) -> Option<String>;

    fn state(&self) -> NodeState;
}
