//! Error types for the system database.
//!
//! This module provides a unified error type [`SysdbError`] for all control
//! plane operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Routing**: this node is not a replica, not the leader, or the consensus
//!   service is not running. Callers redirect or retry later.
//! - **Domain conflict**: members or pools that already exist or cannot be
//!   found, join failures and held pool locks. Terminal for the request.
//! - **Fatal**: [`ApplyError`] raised on the replicated apply path. These stop
//!   the replica; see [`crate::sysdb::SystemFsm::emergency_shutdown`].
//! - **Validation**: malformed fault domains and rank sets.
//!
//! # Example
//!
//! ```rust
//! use sysdb::error::SysdbError;
//!
//! fn redirect(err: &SysdbError) -> Option<String> {
//!     match err {
//!         SysdbError::NotLeader { leader_hint, .. } => leader_hint.clone(),
//!         _ => None,
//!     }
//! }
//! ```

use crate::ranks::Rank;
use chrono::{DateTime, Utc};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for system database operations.
#[derive(Error, Debug)]
pub enum SysdbError {
    // Routing errors
    #[error("not a replica; try one of {replicas:?}")]
    NotReplica { replicas: Vec<String> },

    #[error("not the leader; current leader is {leader_hint:?} (replicas: {replicas:?})")]
    NotLeader {
        leader_hint: Option<String>,
        replicas: Vec<String>,
    },

    #[error("raft service unavailable (not started yet?)")]
    RaftUnavailable,

    #[error("system database is uninitialized")]
    Uninitialized,

    #[error("leadership lost while processing request")]
    LeadershipLost,

    // Member errors
    #[error("member not found: {0}")]
    MemberNotFound(MemberLookup),

    #[error("member with rank {0} already exists")]
    RankExists(Rank),

    #[error("member with uuid {0} already exists")]
    UuidExists(Uuid),

    #[error(transparent)]
    JoinFailure(#[from] JoinFailure),

    #[error("illegal member state update for rank {rank}: {from} -> {to}")]
    IllegalStateTransition { rank: Rank, from: String, to: String },

    #[error("ignoring rank {rank} dead event for previous incarnation ({incarnation} < {current})")]
    StaleIncarnation {
        rank: Rank,
        incarnation: u64,
        current: u64,
    },

    #[error("errored result for rank {rank} has conflicting state '{state}'")]
    ConflictingResult { rank: Rank, state: String },

    #[error("system group map is empty")]
    EmptyGroupMap,

    // Pool errors
    #[error("pool {0} not found")]
    PoolNotFound(Uuid),

    #[error("pool with label {0:?} not found")]
    PoolLabelNotFound(String),

    #[error("pool {0} already exists")]
    PoolExists(Uuid),

    #[error("pool {pool} is locked (lock {lock_id} taken at {taken_at})")]
    PoolLocked {
        pool: Uuid,
        lock_id: Uuid,
        taken_at: DateTime<Utc>,
    },

    #[error("invalid pool lock: {0}")]
    InvalidPoolLock(String),

    #[error("request cancelled")]
    Cancelled,

    // Validation errors
    #[error("invalid fault domain {input:?}: {reason}")]
    InvalidFaultDomain { input: String, reason: String },

    #[error("invalid rank set {input:?}: {reason}")]
    InvalidRankSet { input: String, reason: String },

    #[error("fault domain tree: {0}")]
    FaultDomainTree(String),

    #[error("rank {0} not found")]
    RankNotFound(Rank),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Replicated state errors
    #[error("raft apply failed: {0}")]
    Apply(#[from] ApplyError),

    #[error("snapshot schema version {found} does not match current version {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("raft error: {0}")]
    Raft(String),

    #[error("raft apply timed out after {0}ms")]
    Timeout(u64),

    // External errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Identifies how a member lookup was keyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberLookup {
    Rank(Rank),
    Uuid(Uuid),
    Addr(SocketAddr),
}

impl std::fmt::Display for MemberLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberLookup::Rank(rank) => write!(f, "rank {}", rank),
            MemberLookup::Uuid(uuid) => write!(f, "uuid {}", uuid),
            MemberLookup::Addr(addr) => write!(f, "address {}", addr),
        }
    }
}

/// Structured reasons a join request was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinFailure {
    #[error("uuid changed for rank {rank} ({old} -> {new})")]
    UuidChanged { rank: Rank, old: Uuid, new: Uuid },

    #[error("control address changed for rank {rank} ({old} -> {new})")]
    AddrChanged {
        rank: Rank,
        old: SocketAddr,
        new: SocketAddr,
    },

    #[error("rank changed for member {uuid} ({old} -> {new})")]
    RankChanged { uuid: Uuid, old: Rank, new: Rank },

    #[error("rank {rank} is administratively excluded")]
    AdminExcluded { rank: Rank },

    #[error("fault domain {domain:?} has {levels} levels, expected {expected}")]
    BadFaultDomainDepth {
        domain: String,
        levels: usize,
        expected: usize,
    },

    #[error("member {uuid} with rank {rank} already has identical attributes; not a replacement")]
    NotReplacement { rank: Rank, uuid: Uuid },

    #[error("no matching member found for replacement; closest was rank {rank} (mismatched: {fields:?})")]
    NoReplacementCandidate { rank: Rank, fields: Vec<String> },

    #[error("no members available for replacement")]
    NoMembers,

    #[error("unexpected rank {0} in replacement lookup request")]
    UnexpectedRank(Rank),
}

/// Unrecoverable failures on the replicated apply path.
///
/// Any of these means the local copy of the replicated state can no longer be
/// trusted, so the replica stops participating in consensus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("failed to decode raft log entry: {0}")]
    Decode(String),

    #[error("unrecognized raft operation {0:?}")]
    UnknownOp(String),

    #[error("update for unknown member {0}")]
    UnknownMember(Uuid),

    #[error("update for unknown pool {0}")]
    UnknownPool(Uuid),

    #[error("member {0} already indexed")]
    DuplicateMember(Uuid),

    #[error("rank {rank} already held by member {holder}")]
    RankInUse { rank: Rank, holder: Uuid },

    #[error("fault domain tree invariant violated: {0}")]
    TreeInvariant(String),
}

impl SysdbError {
    /// Returns true if the caller may redirect or retry the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SysdbError::NotReplica { .. }
                | SysdbError::NotLeader { .. }
                | SysdbError::RaftUnavailable
                | SysdbError::Uninitialized
                | SysdbError::LeadershipLost
                | SysdbError::Timeout(_)
        )
    }

    /// Returns true if the error says this node never held or has just lost
    /// leadership.
    pub fn is_leadership_error(&self) -> bool {
        matches!(
            self,
            SysdbError::NotLeader { .. } | SysdbError::LeadershipLost
        )
    }

    pub fn is_member_not_found(&self) -> bool {
        matches!(self, SysdbError::MemberNotFound(_))
    }

    pub fn is_pool_not_found(&self) -> bool {
        matches!(
            self,
            SysdbError::PoolNotFound(_) | SysdbError::PoolLabelNotFound(_)
        )
    }

    pub fn is_pool_locked(&self) -> bool {
        matches!(self, SysdbError::PoolLocked { .. })
    }
}

impl From<serde_json::Error> for SysdbError {
    fn from(err: serde_json::Error) -> Self {
        SysdbError::Serialization(err.to_string())
    }
}

/// Result type alias for system database operations.
pub type Result<T> = std::result::Result<T, SysdbError>;
