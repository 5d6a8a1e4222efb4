//! Leader-only access to the replicated system database.

use super::data::DbData;
use super::fsm::{RaftHandle, SystemFsm};
use super::ops::{self, MemberUpdate};
use super::pool_lock::{PoolLock, PoolLockRegistry, RequestContext};
use super::RaftOp;
use crate::config::DatabaseConfig;
use crate::error::{MemberLookup, Result, SysdbError};
use crate::events::{EventHandler, SystemEvent};
use crate::faultdomain::FaultDomainTree;
use crate::member::{Member, MemberState, MemberStateFilter};
use crate::membership::MemberStore;
use crate::pool::{PoolService, PoolServiceState};
use crate::raft::RaftService;
use crate::ranks::{ranks_from_u32, Rank};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Callbacks run as this replica gains or loses leadership.
#[async_trait]
pub trait LeadershipHandler: Send + Sync {
    /// Called after this replica becomes leader. `leadership` is cancelled
    /// as soon as leadership is lost. Returning an error makes the replica
    /// resign.
    async fn leadership_gained(&self, leadership: CancellationToken) -> Result<()> {
        let _ = leadership;
        Ok(())
    }

    /// Called after leadership is lost and when the database stops.
    async fn leadership_lost(&self) -> Result<()> {
        Ok(())
    }

    /// Called after the consensus service has been shut down.
    async fn raft_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Fabric address of one rank in a [`GroupMap`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankEntry {
    pub uri: String,
    pub incarnation: u64,
}

/// Version of the rank to fabric address table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMap {
    pub version: u32,
    pub rank_entries: BTreeMap<Rank, RankEntry>,
    /// Ranks whose control address is a database replica.
    pub ms_ranks: Vec<Rank>,
}

/// The replicated system database as seen by this node.
///
/// Every read and write must be served by the leader: calls on any other
/// node fail with a routing error naming the replicas. Writes are encoded
/// as log entries and return once the entry has been applied.
pub struct Database {
    cfg: DatabaseConfig,
    replica_addr: Option<SocketAddr>,
    initialized: AtomicBool,
    raft: Arc<RaftHandle>,
    data: Arc<RwLock<DbData>>,
    /// Serializes writes from check through commit.
    write_lock: tokio::sync::Mutex<()>,
    /// Held while a rank is allocated and committed.
    rank_lock: tokio::sync::Mutex<()>,
    pool_locks: Arc<PoolLockRegistry>,
    handlers: RwLock<Vec<Arc<dyn LeadershipHandler>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Database {
    pub fn new(cfg: DatabaseConfig) -> Self {
        let replica_addr = cfg.control_addr.filter(|addr| cfg.is_replica_addr(addr));
        if let Some(addr) = replica_addr {
            debug!(%addr, "Set db replica addr");
        }
        Self {
            cfg,
            replica_addr,
            initialized: AtomicBool::new(false),
            raft: Arc::new(RaftHandle::new()),
            data: Arc::new(RwLock::new(DbData::default())),
            write_lock: tokio::sync::Mutex::new(()),
            rank_lock: tokio::sync::Mutex::new(()),
            pool_locks: PoolLockRegistry::new(),
            handlers: RwLock::new(Vec::new()),
            monitor: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// State machine to hand to the consensus substrate. Every state machine
    /// returned shares this database's state.
    pub fn fsm(&self) -> Arc<SystemFsm> {
        Arc::new(SystemFsm::new(self.data.clone(), self.raft.clone()))
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.cfg
    }

    pub fn system_name(&self) -> &str {
        &self.cfg.system_name
    }

    pub fn is_replica(&self) -> bool {
        self.replica_addr.is_some()
    }

    /// True if this node is the replica that bootstraps the database.
    pub fn is_bootstrap(&self) -> bool {
        match (self.replica_addr, self.cfg.replicas.first()) {
            (Some(me), Some(first)) => me == *first,
            _ => false,
        }
    }

    fn not_replica(&self) -> SysdbError {
        SysdbError::NotReplica {
            replicas: self.cfg.string_replicas(None),
        }
    }

    pub fn replica_addr(&self) -> Result<SocketAddr> {
        self.replica_addr.ok_or_else(|| self.not_replica())
    }

    /// Addresses of the other replicas.
    pub fn peer_addrs(&self) -> Result<Vec<SocketAddr>> {
        let me = self.replica_addr()?;
        Ok(self
            .cfg
            .replicas
            .iter()
            .copied()
            .filter(|r| *r != me)
            .collect())
    }

    /// Current leader, if known, and all replicas.
    pub fn leader_query(&self) -> Result<(Option<String>, Vec<String>)> {
        if !self.is_replica() {
            return Err(self.not_replica());
        }
        Ok((self.leader_hint(), self.cfg.string_replicas(None)))
    }

    fn leader_hint(&self) -> Option<String> {
        self.raft.get().ok().and_then(|svc| svc.leader())
    }

    /// Fails unless this node is a replica with a running consensus service.
    pub fn check_replica(&self) -> Result<()> {
        if !self.is_replica() {
            return Err(self.not_replica());
        }
        if !self.initialized.load(Ordering::Acquire) {
            return Err(SysdbError::Uninitialized);
        }
        self.raft.get().map(|_| ())
    }

    /// Fails unless this node is the current leader.
    pub fn check_leader(&self) -> Result<()> {
        self.check_replica()?;
        let svc = self.raft.get()?;
        if !svc.state().is_leader() {
            return Err(SysdbError::NotLeader {
                leader_hint: svc.leader(),
                replicas: self.cfg.string_replicas(self.replica_addr),
            });
        }
        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        self.check_leader().is_ok()
    }

    pub fn add_leadership_handler(&self, handler: Arc<dyn LeadershipHandler>) {
        self.handlers.write().push(handler);
    }

    /// Install the consensus service and begin following its leadership
    /// notifications. Does nothing on a node that is not a replica.
    pub fn start(
        self: &Arc<Self>,
        svc: Arc<dyn RaftService>,
        leader_rx: mpsc::UnboundedReceiver<bool>,
    ) -> Result<()> {
        if !self.is_replica() {
            debug!("Not a replica; system database not started");
            return Ok(());
        }
        debug!(
            replica = self.is_replica(),
            bootstrap = self.is_bootstrap(),
            "System db start"
        );

        if !self.cfg.raft_dir.as_os_str().is_empty() && !self.cfg.raft_dir.exists() {
            std::fs::create_dir_all(&self.cfg.raft_dir)?;
        }

        self.initialized.store(true, Ordering::Release);
        self.raft.set(svc);

        let db = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            db.monitor_leadership(leader_rx, shutdown).await;
        });
        *self.monitor.lock() = Some(handle);
        Ok(())
    }

    /// Stop the leadership monitor and shut down the consensus service.
    pub async fn stop(&self) -> Result<()> {
        let handle = self.monitor.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        self.shutdown.cancel();
        handle
            .await
            .map_err(|e| SysdbError::Internal(format!("leadership monitor failed: {}", e)))?;
        self.shutdown_raft().await
    }

    /// Shut down the consensus service and run the shutdown callbacks.
    pub async fn shutdown_raft(&self) -> Result<()> {
        self.pool_locks.clear();
        let svc = self.raft.get()?;
        svc.shutdown()?;
        for handler in self.handler_list() {
            if let Err(e) = handler.raft_shutdown().await {
                error!(error = %e, "Failure in raft shutdown callback");
            }
        }
        Ok(())
    }

    /// Remove the consensus state directory.
    pub fn remove_files(&self) -> Result<()> {
        if self.cfg.raft_dir.exists() {
            std::fs::remove_dir_all(&self.cfg.raft_dir)?;
        }
        Ok(())
    }

    fn handler_list(&self) -> Vec<Arc<dyn LeadershipHandler>> {
        self.handlers.read().clone()
    }

    async fn run_leadership_lost(&self) {
        self.pool_locks.clear();
        for handler in self.handler_list() {
            if let Err(e) = handler.leadership_lost().await {
                error!(error = %e, "Failure in leadership lost callback");
            }
        }
    }

    async fn monitor_leadership(
        self: Arc<Self>,
        mut leader_rx: mpsc::UnboundedReceiver<bool>,
        shutdown: CancellationToken,
    ) {
        let mut leadership: Option<CancellationToken> = None;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Some(token) = leadership.take() {
                        token.cancel();
                    }
                    self.run_leadership_lost().await;
                    return;
                }
                notice = leader_rx.recv() => match notice {
                    Some(true) => {
                        info!(replica = ?self.replica_addr, "Gained system database leadership");
                        let token = shutdown.child_token();
                        leadership = Some(token.clone());
                        for handler in self.handler_list() {
                            if let Err(e) = handler.leadership_gained(token.clone()).await {
                                error!(error = %e, "Failure in leadership gained callback");
                                token.cancel();
                                let _ = self.resign_leadership(e).await;
                                break;
                            }
                        }
                    }
                    Some(false) => {
                        info!(replica = ?self.replica_addr, "Lost system database leadership");
                        if let Some(token) = leadership.take() {
                            token.cancel();
                        }
                        self.run_leadership_lost().await;
                    }
                    None => {
                        debug!("Leadership notification channel closed");
                        if let Some(token) = leadership.take() {
                            token.cancel();
                            self.run_leadership_lost().await;
                        }
                        return;
                    }
                },
            }
        }
    }

    /// Step down as leader because of `cause`, returning the cause.
    ///
    /// Nothing is done when `cause` already reports lost leadership.
    pub async fn resign_leadership(&self, cause: SysdbError) -> SysdbError {
        if cause.is_leadership_error() {
            return cause;
        }
        warn!(cause = %cause, "Resigning system database leadership");

        let transfer = match self.raft.get() {
            Ok(svc) => svc.leadership_transfer().await,
            Err(e) => Err(e),
        };
        match transfer {
            Ok(()) => cause,
            Err(e) => SysdbError::Raft(format!("{} (leadership transfer failed: {})", cause, e)),
        }
    }

    async fn submit<T: Serialize>(&self, op: RaftOp, data: &T) -> Result<()> {
        let entry = ops::encode(op, data)?;
        let svc = self.raft.get()?;
        let timeout = self.cfg.apply_timeout;
        match tokio::time::timeout(timeout, svc.apply(entry, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(SysdbError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn manage_voter(&self, member: &Member, op: RaftOp) -> Result<()> {
        if Some(member.addr) == self.replica_addr || !self.cfg.is_replica_addr(&member.addr) {
            return Ok(());
        }
        let svc = self.raft.get()?;
        let id = member.addr.to_string();

        if matches!(op, RaftOp::UpdateMember | RaftOp::RemoveMember) {
            debug!(member = %member, "Removing current raft voter");
            svc.remove_server(&id).await.map_err(|e| {
                SysdbError::Raft(format!("failed to remove {} as a raft replica: {}", id, e))
            })?;
        }
        if matches!(op, RaftOp::AddMember | RaftOp::UpdateMember) {
            debug!(member = %member, "Adding new raft voter");
            svc.add_voter(&id, member.addr).await.map_err(|e| {
                SysdbError::Raft(format!("failed to add {} as raft replica: {}", id, e))
            })?;
        }
        Ok(())
    }

    /// Current rank to fabric address table, omitting excluded members.
    pub fn group_map(&self) -> Result<GroupMap> {
        self.check_leader()?;
        let data = self.data.read();

        let mut gm = GroupMap {
            version: data.map_version(),
            rank_entries: BTreeMap::new(),
            ms_ranks: Vec::new(),
        };
        for member in data.members().uuids.values() {
            if MemberStateFilter::EXCLUDED.contains(member.state) {
                continue;
            }
            if member.rank.is_nil() || member.primary_fabric_uri.is_empty() {
                error!(
                    rank = %member.rank,
                    uri = %member.primary_fabric_uri,
                    "Member has invalid rank or URI"
                );
                continue;
            }
            gm.rank_entries.insert(
                member.rank,
                RankEntry {
                    uri: member.primary_fabric_uri.clone(),
                    incarnation: member.incarnation,
                },
            );
            if self.cfg.is_replica_addr(&member.addr) {
                gm.ms_ranks.push(member.rank);
            }
        }
        gm.ms_ranks.sort();

        if gm.rank_entries.is_empty() {
            return Err(SysdbError::EmptyGroupMap);
        }
        Ok(gm)
    }

    /// Every member, ordered by rank.
    pub fn all_members(&self) -> Result<Vec<Member>> {
        self.check_leader()?;
        let data = self.data.read();
        Ok(data.members().filter(&[]).into_iter().cloned().collect())
    }

    /// Ranks of members in any of `states` (all members if empty), sorted.
    pub fn member_ranks(&self, states: &[MemberState]) -> Result<Vec<Rank>> {
        self.check_leader()?;
        let data = self.data.read();
        Ok(data.members().filter(states).iter().map(|m| m.rank).collect())
    }

    pub fn member_count(&self, states: &[MemberState]) -> Result<usize> {
        self.check_leader()?;
        Ok(self.data.read().members().filter(states).len())
    }

    pub fn cur_map_version(&self) -> Result<u32> {
        self.check_leader()?;
        Ok(self.data.read().map_version())
    }

    pub fn find_member_by_rank(&self, rank: Rank) -> Result<Member> {
        self.check_leader()?;
        self.data
            .read()
            .members()
            .by_rank(rank)
            .cloned()
            .ok_or(SysdbError::MemberNotFound(MemberLookup::Rank(rank)))
    }

    pub fn find_member_by_uuid(&self, uuid: Uuid) -> Result<Member> {
        self.check_leader()?;
        self.data
            .read()
            .members()
            .by_uuid(&uuid)
            .cloned()
            .ok_or(SysdbError::MemberNotFound(MemberLookup::Uuid(uuid)))
    }

    /// Members hosted at `addr`, ordered by rank.
    pub fn find_members_by_addr(&self, addr: SocketAddr) -> Result<Vec<Member>> {
        self.check_leader()?;
        let data = self.data.read();
        let mut found: Vec<Member> = data.members().by_addr(&addr).into_iter().cloned().collect();
        if found.is_empty() {
            return Err(SysdbError::MemberNotFound(MemberLookup::Addr(addr)));
        }
        found.sort_by_key(|m| m.rank);
        Ok(found)
    }

    /// Copy of the fault domain tree.
    pub fn fault_domain_tree(&self) -> Result<FaultDomainTree> {
        self.check_leader()?;
        Ok(self.data.read().members().fault_domains().clone())
    }

    /// Add a new member, allocating the next free rank if the member's rank
    /// is nil. Returns the member as stored.
    pub async fn add_member(&self, member: Member) -> Result<Member> {
        self.check_leader()?;
        let _write = self.write_lock.lock().await;

        {
            let data = self.data.read();
            if data.members().by_uuid(&member.uuid).is_some() {
                return Err(SysdbError::UuidExists(member.uuid));
            }
            if data.members().by_rank(member.rank).is_some() {
                return Err(SysdbError::RankExists(member.rank));
            }
        }

        self.manage_voter(&member, RaftOp::AddMember).await?;

        let uuid = member.uuid;
        let mut update = MemberUpdate {
            member,
            next_rank: false,
        };
        if update.member.rank.is_nil() {
            let _rank = self.rank_lock.lock().await;
            update.member.rank = {
                let data = self.data.read();
                data.members().free_rank_from(data.next_rank())
            };
            update.next_rank = true;
            self.submit(RaftOp::AddMember, &update).await?;
        } else {
            self.submit(RaftOp::AddMember, &update).await?;
        }

        self.data
            .read()
            .members()
            .by_uuid(&uuid)
            .cloned()
            .ok_or(SysdbError::MemberNotFound(MemberLookup::Uuid(uuid)))
    }

    /// Replace the stored record of an existing member.
    pub async fn update_member(&self, member: Member) -> Result<()> {
        self.check_leader()?;
        let _write = self.write_lock.lock().await;

        if self.data.read().members().by_uuid(&member.uuid).is_none() {
            return Err(SysdbError::MemberNotFound(MemberLookup::Uuid(member.uuid)));
        }
        self.manage_voter(&member, RaftOp::UpdateMember).await?;

        self.submit(
            RaftOp::UpdateMember,
            &MemberUpdate {
                member,
                next_rank: false,
            },
        )
        .await
    }

    pub async fn remove_member(&self, member: &Member) -> Result<()> {
        self.check_leader()?;
        let _write = self.write_lock.lock().await;

        if self.data.read().members().by_uuid(&member.uuid).is_none() {
            return Err(SysdbError::MemberNotFound(MemberLookup::Uuid(member.uuid)));
        }
        self.manage_voter(member, RaftOp::RemoveMember).await?;

        self.submit(
            RaftOp::RemoveMember,
            &MemberUpdate {
                member: member.clone(),
                next_rank: false,
            },
        )
        .await
    }

    /// Pool services ordered by UUID; only `Ready` ones unless `all`.
    pub fn pool_service_list(&self, all: bool) -> Result<Vec<PoolService>> {
        self.check_leader()?;
        let data = self.data.read();
        let mut list: Vec<PoolService> = data
            .pools()
            .uuids
            .values()
            .filter(|ps| all || ps.state == PoolServiceState::Ready)
            .cloned()
            .collect();
        list.sort_by_key(|ps| ps.pool_uuid);
        Ok(list)
    }

    pub fn find_pool_service_by_uuid(&self, uuid: Uuid) -> Result<PoolService> {
        self.check_leader()?;
        self.data
            .read()
            .pools()
            .by_uuid(&uuid)
            .cloned()
            .ok_or(SysdbError::PoolNotFound(uuid))
    }

    pub fn find_pool_service_by_label(&self, label: &str) -> Result<PoolService> {
        self.check_leader()?;
        self.data
            .read()
            .pools()
            .by_label(label)
            .cloned()
            .ok_or_else(|| SysdbError::PoolLabelNotFound(label.to_string()))
    }

    pub async fn add_pool_service(&self, ps: PoolService) -> Result<()> {
        self.check_leader()?;
        let _write = self.write_lock.lock().await;

        if self.data.read().pools().by_uuid(&ps.pool_uuid).is_some() {
            return Err(SysdbError::PoolExists(ps.pool_uuid));
        }
        self.submit(RaftOp::AddPoolService, &ps).await
    }

    pub async fn update_pool_service(&self, ps: PoolService) -> Result<()> {
        self.check_leader()?;
        let _write = self.write_lock.lock().await;

        if self.data.read().pools().by_uuid(&ps.pool_uuid).is_none() {
            return Err(SysdbError::PoolNotFound(ps.pool_uuid));
        }
        self.submit(RaftOp::UpdatePoolService, &ps).await
    }

    pub async fn remove_pool_service(&self, uuid: Uuid) -> Result<()> {
        self.check_leader()?;
        let _write = self.write_lock.lock().await;

        let ps = self
            .data
            .read()
            .pools()
            .by_uuid(&uuid)
            .cloned()
            .ok_or(SysdbError::PoolNotFound(uuid))?;
        self.submit(RaftOp::RemovePoolService, &ps).await
    }

    /// Take the lock for `pool_uuid`, or reuse the one carried by `ctx`.
    ///
    /// Contention is reported as `PoolLocked` immediately; in-flight
    /// replicated writes do not delay the caller.
    pub async fn take_pool_lock(&self, ctx: &RequestContext, pool_uuid: Uuid) -> Result<PoolLock> {
        if ctx.is_cancelled() {
            return Err(SysdbError::Cancelled);
        }
        if pool_uuid.is_nil() {
            return Err(SysdbError::InvalidArgument("nil pool UUID".to_string()));
        }

        if let Some(lock) = ctx.pool_lock() {
            if lock.pool_uuid() != pool_uuid {
                return Err(SysdbError::InvalidPoolLock(format!(
                    "context holds lock for pool {}, not {}",
                    lock.pool_uuid(),
                    pool_uuid
                )));
            }
            if !self.pool_locks.is_held(lock) {
                return Err(SysdbError::InvalidPoolLock(format!(
                    "lock {} for pool {} is no longer held",
                    lock.id(),
                    pool_uuid
                )));
            }
            return Ok(lock.clone());
        }

        self.check_leader()?;
        let lock = self.pool_locks.acquire(pool_uuid)?;
        debug!(pool = %pool_uuid, lock = %lock.id(), "Took pool lock");
        Ok(lock)
    }

    async fn handle_pool_reps_update(&self, pool_uuid: Uuid, svc_replicas: &[u32], hostname: &str) {
        debug!(pool = %pool_uuid, host = hostname, replicas = ?svc_replicas, "Processing pool service replicas update");

        let mut ps = match self.find_pool_service_by_uuid(pool_uuid) {
            Ok(ps) => ps,
            Err(e) => {
                error!(pool = %pool_uuid, error = %e, "Failed to find pool");
                return;
            }
        };
        debug!(
            pool = %pool_uuid,
            state = %ps.state,
            old = ?ps.replicas,
            new = ?svc_replicas,
            "Update pool service ranks"
        );
        ps.replicas = ranks_from_u32(svc_replicas);

        if let Err(e) = self.update_pool_service(ps).await {
            error!(pool = %pool_uuid, error = %e, "Failed to apply pool service update");
        }
    }

    #[cfg(test)]
    pub(crate) fn data(&self) -> &Arc<RwLock<DbData>> {
        &self.data
    }
}

#[async_trait]
impl EventHandler for Database {
    async fn on_event(&self, event: &SystemEvent) {
        if let SystemEvent::PoolSvcReplicasUpdate {
            hostname,
            pool_uuid,
            svc_replicas,
            ..
        } = event
        {
            self.handle_pool_reps_update(*pool_uuid, svc_replicas, hostname)
                .await;
        }
    }
}

#[async_trait]
impl MemberStore for Database {
    fn check_leader(&self) -> Result<()> {
        Database::check_leader(self)
    }

    async fn add_member(&self, member: Member) -> Result<Member> {
        Database::add_member(self, member).await
    }

    async fn update_member(&self, member: Member) -> Result<()> {
        Database::update_member(self, member).await
    }

    async fn remove_member(&self, member: &Member) -> Result<()> {
        Database::remove_member(self, member).await
    }

    fn find_member_by_rank(&self, rank: Rank) -> Result<Member> {
        Database::find_member_by_rank(self, rank)
    }

    fn find_member_by_uuid(&self, uuid: Uuid) -> Result<Member> {
        Database::find_member_by_uuid(self, uuid)
    }

    fn all_members(&self) -> Result<Vec<Member>> {
        Database::all_members(self)
    }

    fn member_count(&self, states: &[MemberState]) -> Result<usize> {
        Database::member_count(self, states)
    }

    fn cur_map_version(&self) -> Result<u32> {
        Database::cur_map_version(self)
    }

    fn fault_domain_tree(&self) -> Result<FaultDomainTree> {
        Database::fault_domain_tree(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{LocalRaft, RaftLogFilter};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn cfg() -> DatabaseConfig {
        let addr: SocketAddr = "127.0.0.1:10001".parse().unwrap();
        DatabaseConfig {
            replicas: vec![addr],
            control_addr: Some(addr),
            ..DatabaseConfig::default()
        }
    }

    async fn leader_db() -> (Arc<Database>, Arc<LocalRaft>) {
        let db = Arc::new(Database::new(cfg()));
        let (raft, rx) = LocalRaft::new(
            db.replica_addr().unwrap(),
            db.fsm(),
            RaftLogFilter::default(),
        );
        db.start(raft.clone(), rx).unwrap();
        raft.bootstrap().unwrap();
        (db, raft)
    }

    fn member(rank: Rank, state: MemberState) -> Member {
        Member::new(
            rank,
            Uuid::new_v4(),
            "10.0.0.1:10001".parse().unwrap(),
            "/rack0".parse().unwrap(),
        )
        .with_state(state)
        .with_fabric("tcp://10.0.0.1:31416", 1)
    }

    #[test]
    fn test_routing_errors_before_start() {
        let db = Database::new(DatabaseConfig::default());
        assert!(matches!(db.check_replica(), Err(SysdbError::NotReplica { .. })));

        let db = Database::new(cfg());
        assert!(db.is_replica());
        assert!(db.is_bootstrap());
        assert!(matches!(db.check_replica(), Err(SysdbError::Uninitialized)));
        assert!(matches!(db.all_members(), Err(SysdbError::Uninitialized)));
    }

    #[tokio::test]
    async fn test_follower_reports_not_leader() {
        let db = Arc::new(Database::new(cfg()));
        let (raft, rx) = LocalRaft::new(db.replica_addr().unwrap(), db.fsm(), RaftLogFilter::default());
        db.start(raft, rx).unwrap();

        match db.member_count(&[]) {
            Err(SysdbError::NotLeader { leader_hint, replicas }) => {
                assert!(leader_hint.is_none());
                assert!(replicas.is_empty());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_member_allocates_ranks() {
        let (db, _raft) = leader_db().await;
        let a = db.add_member(member(Rank::NIL, MemberState::Joined)).await.unwrap();
        let b = db.add_member(member(Rank::NIL, MemberState::Joined)).await.unwrap();
        assert_eq!(a.rank, Rank(0));
        assert_eq!(b.rank, Rank(1));
        assert_eq!(db.cur_map_version().unwrap(), 2);

        let explicit = db.add_member(member(Rank(7), MemberState::Joined)).await.unwrap();
        assert_eq!(explicit.rank, Rank(7));
        assert_eq!(db.data().read().next_rank(), Rank(2));

        let err = db.add_member(member(Rank(7), MemberState::Joined)).await.unwrap_err();
        assert!(matches!(err, SysdbError::RankExists(Rank(7))));
        let err = db.add_member(a.clone()).await.unwrap_err();
        assert!(matches!(err, SysdbError::UuidExists(_)));
    }

    #[tokio::test]
    async fn test_allocated_rank_skips_explicitly_held_ranks() {
        let (db, _raft) = leader_db().await;
        let first = db.add_member(member(Rank(0), MemberState::Joined)).await.unwrap();
        let second = db.add_member(member(Rank(1), MemberState::Joined)).await.unwrap();
        let allocated = db.add_member(member(Rank::NIL, MemberState::Joined)).await.unwrap();

        assert_eq!(allocated.rank, Rank(2));
        assert_eq!(db.find_member_by_rank(Rank(0)).unwrap().uuid, first.uuid);
        assert_eq!(db.find_member_by_rank(Rank(1)).unwrap().uuid, second.uuid);
        assert_eq!(db.member_ranks(&[]).unwrap(), vec![Rank(0), Rank(1), Rank(2)]);
        assert_eq!(db.data().read().next_rank(), Rank(3));
    }

    #[tokio::test]
    async fn test_group_map_skips_excluded() {
        let (db, _raft) = leader_db().await;
        assert!(matches!(db.group_map(), Err(SysdbError::EmptyGroupMap)));

        db.add_member(member(Rank(0), MemberState::AwaitFormat)).await.unwrap();
        assert!(matches!(db.group_map(), Err(SysdbError::EmptyGroupMap)));

        db.add_member(member(Rank(1), MemberState::Joined)).await.unwrap();
        let mut no_uri = member(Rank(2), MemberState::Joined);
        no_uri.primary_fabric_uri.clear();
        db.add_member(no_uri).await.unwrap();

        let gm = db.group_map().unwrap();
        assert_eq!(gm.version, 3);
        assert_eq!(gm.rank_entries.keys().copied().collect::<Vec<_>>(), vec![Rank(1)]);
        assert!(gm.ms_ranks.is_empty());
    }

    #[tokio::test]
    async fn test_pool_lock_lifecycle() {
        let (db, raft) = leader_db().await;
        let pool = Uuid::new_v4();
        let ctx = RequestContext::new();

        let lock = db.take_pool_lock(&ctx, pool).await.unwrap();
        let err = db.take_pool_lock(&ctx, pool).await.unwrap_err();
        assert!(err.is_pool_locked());

        let locked = ctx.with_pool_lock(lock.clone());
        assert!(db.take_pool_lock(&locked, pool).await.unwrap().same_lock(&lock));
        let err = db.take_pool_lock(&locked, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SysdbError::InvalidPoolLock(_)));

        let cancelled = RequestContext::new();
        cancelled.cancel();
        assert!(matches!(
            db.take_pool_lock(&cancelled, pool).await,
            Err(SysdbError::Cancelled)
        ));
        assert!(matches!(
            db.take_pool_lock(&ctx, Uuid::nil()).await,
            Err(SysdbError::InvalidArgument(_))
        ));

        // Losing leadership invalidates the held lock.
        raft.step_down();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            db.take_pool_lock(&locked, pool).await,
            Err(SysdbError::InvalidPoolLock(_))
        ));
    }

    #[tokio::test]
    async fn test_pool_lock_not_blocked_by_inflight_write() {
        let (db, _raft) = leader_db().await;
        let _writer = db.write_lock.lock().await;

        let ctx = RequestContext::new();
        let lock = tokio::time::timeout(
            Duration::from_millis(100),
            db.take_pool_lock(&ctx, Uuid::new_v4()),
        )
        .await
        .expect("pool lock waited on the write lock")
        .unwrap();
        assert!(db.pool_locks.is_held(&lock));

        ctx.cancel();
        assert!(matches!(
            db.take_pool_lock(&ctx, Uuid::new_v4()).await,
            Err(SysdbError::Cancelled)
        ));
    }

    #[derive(Default)]
    struct Counting {
        gained: AtomicUsize,
        lost: AtomicUsize,
        shutdown: AtomicUsize,
        fail_gained: bool,
    }

    #[async_trait]
    impl LeadershipHandler for Counting {
        async fn leadership_gained(&self, _leadership: CancellationToken) -> Result<()> {
            self.gained.fetch_add(1, Ordering::SeqCst);
            if self.fail_gained {
                return Err(SysdbError::Internal("not today".to_string()));
            }
            Ok(())
        }

        async fn leadership_lost(&self) -> Result<()> {
            self.lost.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn raft_shutdown(&self) -> Result<()> {
            self.shutdown.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_leadership_callbacks() {
        let db = Arc::new(Database::new(cfg()));
        let handler = Arc::new(Counting::default());
        db.add_leadership_handler(handler.clone());
        let (raft, rx) = LocalRaft::new(db.replica_addr().unwrap(), db.fsm(), RaftLogFilter::default());
        db.start(raft.clone(), rx).unwrap();

        raft.bootstrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.gained.load(Ordering::SeqCst), 1);

        raft.step_down();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.lost.load(Ordering::SeqCst), 1);

        db.stop().await.unwrap();
        assert_eq!(handler.lost.load(Ordering::SeqCst), 2);
        assert_eq!(handler.shutdown.load(Ordering::SeqCst), 1);
        assert!(raft.state().is_shutdown());
    }

    #[tokio::test]
    async fn test_failing_gained_callback_resigns() {
        let db = Arc::new(Database::new(cfg()));
        db.add_leadership_handler(Arc::new(Counting {
            fail_gained: true,
            ..Counting::default()
        }));
        let (raft, rx) = LocalRaft::new(db.replica_addr().unwrap(), db.fsm(), RaftLogFilter::default());
        db.start(raft.clone(), rx).unwrap();

        raft.bootstrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!db.is_leader());
    }

    #[tokio::test]
    async fn test_resign_short_circuits_on_leadership_error() {
        let (db, raft) = leader_db().await;
        let cause = SysdbError::LeadershipLost;
        assert!(matches!(db.resign_leadership(cause).await, SysdbError::LeadershipLost));
        assert!(raft.state().is_leader());

        let cause = SysdbError::Internal("boom".to_string());
        assert!(matches!(db.resign_leadership(cause).await, SysdbError::Internal(_)));
        assert!(!raft.state().is_leader());
    }

    #[tokio::test]
    async fn test_pool_replicas_event() {
        let (db, _raft) = leader_db().await;
        let pool = PoolService::new(Uuid::new_v4(), "tank", vec![Rank(0)]);
        db.add_pool_service(pool.clone()).await.unwrap();

        db.on_event(&SystemEvent::pool_svc_replicas_update("host1", pool.pool_uuid, vec![1, 2], 3))
            .await;
        let updated = db.find_pool_service_by_uuid(pool.pool_uuid).unwrap();
        assert_eq!(updated.replicas, vec![Rank(1), Rank(2)]);
        assert_eq!(db.cur_map_version().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pool_service_crud() {
        let (db, _raft) = leader_db().await;
        let pool = PoolService::new(Uuid::new_v4(), "tank", vec![Rank(0)]);
        db.add_pool_service(pool.clone()).await.unwrap();
        assert!(matches!(
            db.add_pool_service(pool.clone()).await,
            Err(SysdbError::PoolExists(_))
        ));
        assert!(db.pool_service_list(false).unwrap().is_empty());
        assert_eq!(db.pool_service_list(true).unwrap().len(), 1);

        db.update_pool_service(pool.clone().with_state(PoolServiceState::Ready))
            .await
            .unwrap();
        assert_eq!(db.pool_service_list(false).unwrap().len(), 1);
        assert_eq!(db.find_pool_service_by_label("tank").unwrap().pool_uuid, pool.pool_uuid);

        db.remove_pool_service(pool.pool_uuid).await.unwrap();
        assert!(db.find_pool_service_by_uuid(pool.pool_uuid).unwrap_err().is_pool_not_found());
        assert!(db.find_pool_service_by_label("tank").unwrap_err().is_pool_not_found());
        assert!(matches!(
            db.remove_pool_service(pool.pool_uuid).await,
            Err(SysdbError::PoolNotFound(_))
        ));
    }
}
