//! State machine driven by the consensus substrate.

use super::data::{DbData, CURRENT_SCHEMA_VERSION};
use super::ops;
use crate::error::{ApplyError, Result, SysdbError};
use crate::observability;
use crate::raft::{RaftService, StateMachine};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error};

/// Slot holding the consensus service once it has been started.
#[derive(Default)]
pub struct RaftHandle {
    svc: RwLock<Option<Arc<dyn RaftService>>>,
}

impl RaftHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, svc: Arc<dyn RaftService>) {
        *self.svc.write() = Some(svc);
    }

    /// The running service, or `RaftUnavailable` before it is started.
    pub fn get(&self) -> Result<Arc<dyn RaftService>> {
        self.svc.read().clone().ok_or(SysdbError::RaftUnavailable)
    }

    pub fn is_set(&self) -> bool {
        self.svc.read().is_some()
    }
}

/// Applies committed log entries to the shared [`DbData`].
///
/// Holds no business rules: every check happens on the leader before an
/// entry is proposed, so a failure here means this replica's state has
/// diverged and it must stop.
pub struct SystemFsm {
    data: Arc<RwLock<DbData>>,
    raft: Arc<RaftHandle>,
}

impl SystemFsm {
    pub fn new(data: Arc<RwLock<DbData>>, raft: Arc<RaftHandle>) -> Self {
        Self { data, raft }
    }

    /// Take this replica out of the consensus group after an unrecoverable
    /// apply failure. The process has to be restarted to rejoin.
    pub fn emergency_shutdown(&self, err: &ApplyError) {
        error!(fatal = true, error = %err, "System database apply failed; shutting down raft service");
        observability::record_emergency_shutdown();

        match self.raft.get() {
            Ok(svc) => {
                if let Err(e) = svc.shutdown() {
                    error!(error = %e, "Failed to shut down raft service");
                }
            }
            Err(e) => error!(error = %e, "No raft service to shut down"),
        }
    }
}

impl StateMachine for SystemFsm {
    fn apply(&self, command: &[u8]) -> std::result::Result<(), ApplyError> {
        let result = ops::decode(command).and_then(|(time, cmd)| {
            let mut data = self.data.write();
            let op = data.apply(time, cmd)?;
            Ok((op, data.map_version(), data.members().len()))
        });

        match result {
            Ok((op, map_version, members)) => {
                debug!(op = %op, map_version, "Applied raft op");
                observability::record_raft_op(op.as_str());
                observability::update_membership_metrics(map_version, members);
                Ok(())
            }
            Err(err) => {
                self.emergency_shutdown(&err);
                Err(err)
            }
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        self.data.read().to_bytes()
    }

    fn restore(&self, snapshot: &[u8]) -> Result<()> {
        let restored = DbData::from_bytes(snapshot)?;
        if restored.schema_version() != CURRENT_SCHEMA_VERSION {
            return Err(SysdbError::SchemaMismatch {
                found: restored.schema_version(),
                expected: CURRENT_SCHEMA_VERSION,
            });
        }
        debug!(
            map_version = restored.map_version(),
            members = restored.members().len(),
            pools = restored.pools().len(),
            "Restored system database snapshot"
        );
        *self.data.write() = restored;
        Ok(())
    }
}
