//! System members and their state machine.

use crate::error::Result;
use crate::faultdomain::FaultDomain;
use crate::ranks::Rank;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// State of a storage-engine instance as seen by the control plane.
///
/// Values are single bits so that sets of states can be combined into a
/// [`MemberStateFilter`]. `Unknown` is zero and only matches a filter that
/// names it explicitly or the all-filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum MemberState {
    #[default]
    Unknown = 0,
    AwaitFormat = 0x0001,
    Starting = 0x0002,
    Ready = 0x0004,
    Joined = 0x0008,
    Stopping = 0x0010,
    Stopped = 0x0020,
    Excluded = 0x0040,
    Errored = 0x0080,
    Unresponsive = 0x0100,
    AdminExcluded = 0x0200,
    CheckerStarted = 0x0400,
}

impl MemberState {
    pub const ALL: [MemberState; 12] = [
        MemberState::Unknown,
        MemberState::AwaitFormat,
        MemberState::Starting,
        MemberState::Ready,
        MemberState::Joined,
        MemberState::Stopping,
        MemberState::Stopped,
        MemberState::Excluded,
        MemberState::Errored,
        MemberState::Unresponsive,
        MemberState::AdminExcluded,
        MemberState::CheckerStarted,
    ];

    pub fn bits(self) -> u32 {
        self as u32
    }

    /// Target states that may not be entered from `self`.
    fn illegal_targets(self) -> &'static [MemberState] {
        use MemberState::*;
        match self {
            Unknown => &[
                AwaitFormat,
                Starting,
                Ready,
                Joined,
                Stopping,
                Stopped,
                Excluded,
                Errored,
                Unresponsive,
                AdminExcluded,
                CheckerStarted,
            ],
            AwaitFormat | Starting | Ready => &[Excluded],
            Joined | Stopping | CheckerStarted => &[Ready],
            Stopped => &[],
            Excluded | Errored | Unresponsive => &[Ready, Joined, Stopping],
            AdminExcluded => &[
                Unknown,
                AwaitFormat,
                Starting,
                Ready,
                Joined,
                Stopping,
                Stopped,
                Excluded,
                Errored,
                Unresponsive,
                CheckerStarted,
            ],
        }
    }

    /// Whether moving from `self` to `to` is forbidden. Staying in the same
    /// state is always allowed.
    pub fn is_transition_illegal(self, to: MemberState) -> bool {
        if self == to {
            return false;
        }
        self.illegal_targets().contains(&to)
    }

    pub fn is_transition_legal(self, to: MemberState) -> bool {
        !self.is_transition_illegal(to)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberState::Unknown => "Unknown",
            MemberState::AwaitFormat => "AwaitFormat",
            MemberState::Starting => "Starting",
            MemberState::Ready => "Ready",
            MemberState::Joined => "Joined",
            MemberState::Stopping => "Stopping",
            MemberState::Stopped => "Stopped",
            MemberState::Excluded => "Excluded",
            MemberState::Errored => "Errored",
            MemberState::Unresponsive => "Unresponsive",
            MemberState::AdminExcluded => "AdminExcluded",
            MemberState::CheckerStarted => "CheckerStarted",
        };
        f.write_str(s)
    }
}

/// Bitmask over [`MemberState`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberStateFilter(u32);

impl MemberStateFilter {
    /// Every state, including `Unknown`.
    pub const ALL: MemberStateFilter = MemberStateFilter(0x07FF);
    pub const AVAILABLE: MemberStateFilter =
        MemberStateFilter(MemberState::Ready as u32 | MemberState::Joined as u32);
    pub const EXCLUDED: MemberStateFilter = MemberStateFilter(
        MemberState::AwaitFormat as u32
            | MemberState::Excluded as u32
            | MemberState::AdminExcluded as u32,
    );

    /// Filter over `states`; an empty list means every state.
    pub fn from_states(states: &[MemberState]) -> Self {
        if states.is_empty() {
            return Self::ALL;
        }
        MemberStateFilter(states.iter().fold(0, |acc, s| acc | s.bits()))
    }

    pub fn contains(self, state: MemberState) -> bool {
        if state == MemberState::Unknown {
            return self == Self::ALL;
        }
        self.0 & state.bits() != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Whether a member in `state` should be returned for a query over `states`.
///
/// `Unknown` members are included only when `Unknown` is asked for or the
/// query covers every state.
pub fn state_matches(state: MemberState, states: &[MemberState]) -> bool {
    if states.is_empty() || states.contains(&state) {
        return true;
    }
    MemberStateFilter::from_states(states).contains(state)
}

/// A storage-engine instance registered with the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Member {
    pub rank: Rank,
    pub incarnation: u64,
    pub uuid: Uuid,
    pub addr: SocketAddr,
    pub primary_fabric_uri: String,
    #[serde(default)]
    pub secondary_fabric_uris: Vec<String>,
    pub primary_fabric_contexts: u32,
    #[serde(default)]
    pub secondary_fabric_contexts: Vec<u32>,
    pub state: MemberState,
    #[serde(default)]
    pub info: String,
    pub fault_domain: FaultDomain,
    pub last_update: DateTime<Utc>,
}

impl Member {
    pub fn new(rank: Rank, uuid: Uuid, addr: SocketAddr, fault_domain: FaultDomain) -> Self {
        Self {
            rank,
            incarnation: 0,
            uuid,
            addr,
            primary_fabric_uri: String::new(),
            secondary_fabric_uris: Vec::new(),
            primary_fabric_contexts: 0,
            secondary_fabric_contexts: Vec::new(),
            state: MemberState::Unknown,
            info: String::new(),
            fault_domain,
            last_update: Utc::now(),
        }
    }

    pub fn with_state(mut self, state: MemberState) -> Self {
        self.state = state;
        self
    }

    pub fn with_fabric(mut self, uri: impl Into<String>, contexts: u32) -> Self {
        self.primary_fabric_uri = uri.into();
        self.primary_fabric_contexts = contexts;
        self
    }

    pub fn with_incarnation(mut self, incarnation: u64) -> Self {
        self.incarnation = incarnation;
        self
    }

    /// Domain of this member's leaf in the fault domain tree.
    pub fn tree_domain(&self) -> Result<FaultDomain> {
        self.fault_domain.rank_child(self.rank)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rank {} ({}) at {} [{}]",
            self.rank, self.uuid, self.addr, self.state
        )
    }
}

/// Outcome of a control operation on one rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberResult {
    pub rank: Rank,
    /// Filled from the member record when absent.
    pub addr: Option<SocketAddr>,
    pub errored: bool,
    pub msg: String,
    pub state: MemberState,
}

impl MemberResult {
    pub fn new(rank: Rank, err: Option<String>, state: MemberState) -> Self {
        let errored = err.is_some();
        Self {
            rank,
            addr: None,
            errored,
            msg: err.unwrap_or_default(),
            state,
        }
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }
}
