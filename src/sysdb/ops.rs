//! Replicated operations and their log entry encoding.

use crate::error::{ApplyError, Result};
use crate::member::Member;
use crate::pool::PoolService;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mutation carried by a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaftOp {
    AddMember,
    UpdateMember,
    RemoveMember,
    AddPoolService,
    UpdatePoolService,
    RemovePoolService,
}

impl RaftOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaftOp::AddMember => "addMember",
            RaftOp::UpdateMember => "updateMember",
            RaftOp::RemoveMember => "removeMember",
            RaftOp::AddPoolService => "addPoolService",
            RaftOp::UpdatePoolService => "updatePoolService",
            RaftOp::RemovePoolService => "removePoolService",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "addMember" => RaftOp::AddMember,
            "updateMember" => RaftOp::UpdateMember,
            "removeMember" => RaftOp::RemoveMember,
            "addPoolService" => RaftOp::AddPoolService,
            "updatePoolService" => RaftOp::UpdatePoolService,
            "removePoolService" => RaftOp::RemovePoolService,
            _ => return None,
        })
    }

    fn is_member_op(&self) -> bool {
        matches!(
            self,
            RaftOp::AddMember | RaftOp::UpdateMember | RaftOp::RemoveMember
        )
    }
}

impl fmt::Display for RaftOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of the member operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemberUpdate {
    pub member: Member,
    /// Advance the rank allocator; set when the rank was allocated by the
    /// leader rather than requested by the member.
    #[serde(default)]
    pub next_rank: bool,
}

/// Log entry envelope. The payload stays untyped until the op is known so an
/// unrecognized op can be reported as such.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope {
    time: DateTime<Utc>,
    op: String,
    data: serde_json::Value,
}

/// Decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Member(RaftOp, MemberUpdate),
    Pool(RaftOp, PoolService),
}

impl Command {
    pub(crate) fn op(&self) -> RaftOp {
        match self {
            Command::Member(op, _) | Command::Pool(op, _) => *op,
        }
    }
}

/// Encode `data` as a log entry for `op`, stamped with the current time.
pub(crate) fn encode<T: Serialize>(op: RaftOp, data: &T) -> Result<Vec<u8>> {
    let envelope = Envelope {
        time: Utc::now(),
        op: op.as_str().to_string(),
        data: serde_json::to_value(data)?,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub(crate) fn decode(bytes: &[u8]) -> std::result::Result<(DateTime<Utc>, Command), ApplyError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| ApplyError::Decode(e.to_string()))?;
    let op = RaftOp::from_name(&envelope.op).ok_or(ApplyError::UnknownOp(envelope.op))?;

    let command = if op.is_member_op() {
        let update: MemberUpdate = serde_json::from_value(envelope.data)
            .map_err(|e| ApplyError::Decode(format!("{} payload: {}", op, e)))?;
        Command::Member(op, update)
    } else {
        let ps: PoolService = serde_json::from_value(envelope.data)
            .map_err(|e| ApplyError::Decode(format!("{} payload: {}", op, e)))?;
        Command::Pool(op, ps)
    };
    Ok((envelope.time, command))
}
