//! In-process consensus substrate.

use super::{NodeState, RaftLogFilter, RaftService, StateMachine};
use crate::error::{Result, SysdbError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Single-process substrate that commits every entry immediately.
///
/// Entries are applied under one lock, first to the local state machine and
/// then to any attached follower state machines, so all of them observe the
/// same total order. Leadership is controlled explicitly with
/// [`LocalRaft::bootstrap`] and [`LocalRaft::step_down`], and each change is
/// reported on the notification channel returned by [`LocalRaft::new`].
pub struct LocalRaft {
    addr: SocketAddr,
    fsm: Arc<dyn StateMachine>,
    followers: RwLock<Vec<Arc<dyn StateMachine>>>,
    /// Index of the last applied entry; held while applying.
    applied: Mutex<u64>,
    state: RwLock<NodeState>,
    voters: RwLock<BTreeMap<String, SocketAddr>>,
    leader_tx: mpsc::UnboundedSender<bool>,
    log: RaftLogFilter,
}

impl LocalRaft {
    /// Create a substrate for the replica at `addr`, returning it together
    /// with the leadership notification channel.
    pub fn new(
        addr: SocketAddr,
        fsm: Arc<dyn StateMachine>,
        log: RaftLogFilter,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<bool>) {
        let (leader_tx, leader_rx) = mpsc::unbounded_channel();
        let mut voters = BTreeMap::new();
        voters.insert(addr.to_string(), addr);
        let raft = Arc::new(Self {
            addr,
            fsm,
            followers: RwLock::new(Vec::new()),
            applied: Mutex::new(0),
            state: RwLock::new(NodeState::Follower),
            voters: RwLock::new(voters),
            leader_tx,
            log,
        });
        (raft, leader_rx)
    }

    fn set_state(&self, next: NodeState) {
        let prev = {
            let mut state = self.state.write();
            let prev = *state;
            *state = next;
            prev
        };
        if prev == next {
            return;
        }
        self.log.info(&format!("{}: {} -> {}", self.addr, prev, next));
        if prev.is_leader() != next.is_leader() {
            // The receiver goes away when the database stops.
            let _ = self.leader_tx.send(next.is_leader());
        }
    }

    /// Take leadership of the (single-voter) cluster.
    pub fn bootstrap(&self) -> Result<()> {
        if self.state().is_shutdown() {
            return Err(SysdbError::RaftUnavailable);
        }
        self.set_state(NodeState::Leader);
        Ok(())
    }

    /// Give up leadership without leaving the cluster.
    pub fn step_down(&self) {
        if !self.state().is_shutdown() {
            self.set_state(NodeState::Follower);
        }
    }

    /// Attach a follower state machine, first catching it up from a snapshot
    /// of the local state.
    pub fn add_follower(&self, follower: Arc<dyn StateMachine>) -> Result<()> {
        let _applied = self.applied.lock();
        let snapshot = self.fsm.snapshot()?;
        follower.restore(&snapshot)?;
        self.followers.write().push(follower);
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let _applied = self.applied.lock();
        self.fsm.snapshot()
    }

    pub fn restore(&self, snapshot: &[u8]) -> Result<()> {
        let _applied = self.applied.lock();
        self.fsm.restore(snapshot)
    }

    /// Number of entries applied so far.
    pub fn applied_index(&self) -> u64 {
        *self.applied.lock()
    }

    pub fn voters(&self) -> Vec<String> {
        self.voters.read().keys().cloned().collect()
    }

    fn commit(&self, command: &[u8]) -> Result<()> {
        let mut applied = self.applied.lock();
        match *self.state.read() {
            NodeState::Leader => {}
            NodeState::Shutdown => return Err(SysdbError::RaftUnavailable),
            _ => {
                return Err(SysdbError::NotLeader {
                    leader_hint: None,
                    replicas: self.voters(),
                })
            }
        }

        self.fsm.apply(command)?;
        for follower in self.followers.read().iter() {
            if let Err(err) = follower.apply(command) {
                self.log.error(&format!("follower failed to apply entry: {}", err));
            }
        }
        *applied += 1;
        Ok(())
    }
}

#[async_trait]
impl RaftService for LocalRaft {
    async fn apply(&self, command: Vec<u8>, _timeout: Duration) -> Result<()> {
        // Commit is synchronous in-process, so there is nothing to time out.
        self.commit(&command)
    }

    async fn add_voter(&self, id: &str, addr: SocketAddr) -> Result<()> {
        self.log.debug(&format!("adding voter {} at {}", id, addr));
        self.voters.write().insert(id.to_string(), addr);
        Ok(())
    }

    async fn remove_server(&self, id: &str) -> Result<()> {
        self.log.debug(&format!("removing server {}", id));
        self.voters.write().remove(id);
        Ok(())
    }

    async fn leadership_transfer(&self) -> Result<()> {
        if !self.state().is_leader() {
            return Err(SysdbError::NotLeader {
                leader_hint: None,
                replicas: self.voters(),
            });
        }
        self.set_state(NodeState::Follower);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.set_state(NodeState::Shutdown);
        Ok(())
    }

    fn leader(&self) -> Option<String> {
        if self.state().is_leader() {
            Some(self.addr.to_string())
        } else {
            None
        }
    }

    fn state(&self) -> NodeState {
        *self.state.read()
    }
}
