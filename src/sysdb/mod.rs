//! Replicated system database.
//!
//! Holds the membership and pool service tables that every control-plane
//! decision is made against. State changes are proposed by the leader as log
//! entries and applied on every replica by [`SystemFsm`]; [`Database`] is the
//! leader-side API that validates requests before proposing them.

// A panic while applying an entry leaves replicas diverged.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod data;
mod database;
mod fsm;
mod ops;
mod pool_lock;

pub use data::{DbData, MemberDatabase, PoolDatabase, CURRENT_SCHEMA_VERSION};
pub use database::{Database, GroupMap, LeadershipHandler, RankEntry};
pub use fsm::{RaftHandle, SystemFsm};
pub use ops::{MemberUpdate, RaftOp};
pub use pool_lock::{PoolLock, RequestContext};
