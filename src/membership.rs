//! Membership rules layered over the system database.
//!
//! [`Membership`] decides how engines join, how their states change and how
//! failures are recorded. It works against the [`MemberStore`] trait rather
//! than the database directly; every change it makes goes through the store
//! and so through the replicated log.

use crate::error::{JoinFailure, Result, SysdbError};
use crate::events::{EventHandler, SystemEvent};
use crate::faultdomain::{FaultDomain, FaultDomainTree};
use crate::member::{Member, MemberResult, MemberState};
use crate::observability;
use crate::ranks::{Rank, RankSet};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Storage used by [`Membership`]. Implemented by
/// [`crate::sysdb::Database`].
#[async_trait]
pub trait MemberStore: Send + Sync {
    /// Fails unless this node may serve requests.
    fn check_leader(&self) -> Result<()>;

    /// Add a member, allocating a rank if its rank is nil. Returns the
    /// stored member.
    async fn add_member(&self, member: Member) -> Result<Member>;

    async fn update_member(&self, member: Member) -> Result<()>;

    async fn remove_member(&self, member: &Member) -> Result<()>;

    fn find_member_by_rank(&self, rank: Rank) -> Result<Member>;

    fn find_member_by_uuid(&self, uuid: Uuid) -> Result<Member>;

    /// Every member, ordered by rank.
    fn all_members(&self) -> Result<Vec<Member>>;

    fn member_count(&self, states: &[MemberState]) -> Result<usize>;

    fn cur_map_version(&self) -> Result<u32>;

    fn fault_domain_tree(&self) -> Result<FaultDomainTree>;
}

/// Request from an engine to join the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Rank held previously, or nil for a new engine.
    pub rank: Rank,
    pub uuid: Uuid,
    pub control_addr: SocketAddr,
    pub primary_fabric_uri: String,
    #[serde(default)]
    pub secondary_fabric_uris: Vec<String>,
    pub primary_fabric_contexts: u32,
    #[serde(default)]
    pub secondary_fabric_contexts: Vec<u32>,
    pub fault_domain: FaultDomain,
    pub incarnation: u64,
    /// Take over the rank of a failed engine.
    #[serde(default)]
    pub replace: bool,
    /// Join in checker mode.
    #[serde(default)]
    pub check_mode: bool,
}

impl JoinRequest {
    pub fn new(rank: Rank, uuid: Uuid, control_addr: SocketAddr, fault_domain: FaultDomain) -> Self {
        Self {
            rank,
            uuid,
            control_addr,
            primary_fabric_uri: String::new(),
            secondary_fabric_uris: Vec::new(),
            primary_fabric_contexts: 0,
            secondary_fabric_contexts: Vec::new(),
            fault_domain,
            incarnation: 0,
            replace: false,
            check_mode: false,
        }
    }

    pub fn with_fabric(mut self, uri: impl Into<String>, contexts: u32) -> Self {
        self.primary_fabric_uri = uri.into();
        self.primary_fabric_contexts = contexts;
        self
    }

    fn joined_state(&self) -> MemberState {
        if self.check_mode {
            MemberState::CheckerStarted
        } else {
            MemberState::Joined
        }
    }

    /// Copy the engine-reported attributes onto `member`.
    fn apply_to(&self, member: &mut Member) {
        member.primary_fabric_uri = self.primary_fabric_uri.clone();
        member.secondary_fabric_uris = self.secondary_fabric_uris.clone();
        member.primary_fabric_contexts = self.primary_fabric_contexts;
        member.secondary_fabric_contexts = self.secondary_fabric_contexts.clone();
        member.fault_domain = self.fault_domain.clone();
        member.state = self.joined_state();
        member.info.clear();
    }
}

/// Outcome of a successful join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinResponse {
    /// True if a new member record was created.
    pub created: bool,
    pub member: Member,
    pub prev_state: MemberState,
    pub map_version: u32,
}

/// Membership business rules.
pub struct Membership {
    store: Arc<dyn MemberStore>,
    /// Serializes read-modify-write sequences on member records.
    lock: Mutex<()>,
}

impl Membership {
    pub fn new(store: Arc<dyn MemberStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    fn check_fault_domain_depth(&self, domain: &FaultDomain) -> Result<()> {
        // The tree holds one extra level for the rank leaves.
        let expected = self.store.fault_domain_tree()?.depth().saturating_sub(1);
        if domain.num_levels() != expected {
            return Err(JoinFailure::BadFaultDomainDepth {
                domain: domain.to_string(),
                levels: domain.num_levels(),
                expected,
            }
            .into());
        }
        Ok(())
    }

    /// Add or refresh the member described by `req`.
    pub async fn join(&self, req: &JoinRequest) -> Result<JoinResponse> {
        let _guard = self.lock.lock().await;
        self.store.check_leader()?;

        let result = if req.replace {
            self.join_replace(req).await
        } else {
            let current = if req.rank.is_nil() {
                self.store.find_member_by_uuid(req.uuid)
            } else {
                self.store.find_member_by_rank(req.rank)
            };
            match current {
                Ok(current) => self.rejoin(req, current).await,
                Err(e) if e.is_member_not_found() => self.join_new(req).await,
                Err(e) => Err(e),
            }
        };

        match &result {
            Ok(resp) if resp.created => observability::record_join("created"),
            Ok(_) => observability::record_join("rejoined"),
            Err(_) => observability::record_join("failed"),
        }
        result
    }

    async fn join_replace(&self, req: &JoinRequest) -> Result<JoinResponse> {
        debug!(rank = %req.rank, uuid = %req.uuid, "Replacing member");
        let current = self.store.find_member_by_rank(req.rank)?;
        if current.state == MemberState::AdminExcluded {
            return Err(JoinFailure::AdminExcluded { rank: current.rank }.into());
        }
        if self.store.member_count(&[])? > 1 {
            self.check_fault_domain_depth(&req.fault_domain)?;
        }

        let mut replacement = Member::new(
            current.rank,
            req.uuid,
            req.control_addr,
            req.fault_domain.clone(),
        )
        .with_incarnation(current.incarnation);
        req.apply_to(&mut replacement);
        replacement.state = MemberState::Joined;

        self.store.remove_member(&current).await?;
        let member = self.store.add_member(replacement).await?;
        info!(rank = %member.rank, old = %current.uuid, new = %member.uuid, "Member replaced");

        Ok(JoinResponse {
            created: false,
            member,
            prev_state: current.state,
            map_version: self.store.cur_map_version()?,
        })
    }

    async fn rejoin(&self, req: &JoinRequest, current: Member) -> Result<JoinResponse> {
        if self.store.member_count(&[])? > 1 {
            self.check_fault_domain_depth(&req.fault_domain)?;
        }
        if current.state == MemberState::AdminExcluded {
            return Err(JoinFailure::AdminExcluded { rank: current.rank }.into());
        }
        if !req.rank.is_nil() && current.rank != req.rank {
            return Err(JoinFailure::RankChanged {
                uuid: current.uuid,
                old: current.rank,
                new: req.rank,
            }
            .into());
        }
        if current.uuid != req.uuid {
            return Err(JoinFailure::UuidChanged {
                rank: current.rank,
                old: current.uuid,
                new: req.uuid,
            }
            .into());
        }
        if current.addr != req.control_addr {
            return Err(JoinFailure::AddrChanged {
                rank: current.rank,
                old: current.addr,
                new: req.control_addr,
            }
            .into());
        }
        if current.fault_domain != req.fault_domain {
            warn!(
                rank = %current.rank,
                old = %current.fault_domain,
                new = %req.fault_domain,
                "Fault domain for rank changed"
            );
        }

        let prev_state = current.state;
        let mut member = current;
        req.apply_to(&mut member);
        member.incarnation = req.incarnation;

        self.store.update_member(member.clone()).await?;
        debug!(member = %member, prev = %prev_state, "Member rejoined");

        Ok(JoinResponse {
            created: false,
            member,
            prev_state,
            map_version: self.store.cur_map_version()?,
        })
    }

    async fn join_new(&self, req: &JoinRequest) -> Result<JoinResponse> {
        if self.store.member_count(&[])? > 0 {
            self.check_fault_domain_depth(&req.fault_domain)?;
        }

        let mut member = Member::new(
            req.rank,
            req.uuid,
            req.control_addr,
            req.fault_domain.clone(),
        )
        .with_incarnation(req.incarnation);
        req.apply_to(&mut member);

        let member = self.store.add_member(member).await?;
        info!(member = %member, "New member joined");

        Ok(JoinResponse {
            created: true,
            member,
            prev_state: MemberState::Unknown,
            map_version: self.store.cur_map_version()?,
        })
    }

    /// Find the rank a replacement engine should take over.
    ///
    /// The rank of a member whose attributes all match the request is
    /// returned. When none matches, the error names the closest candidate
    /// and the fields that differ.
    pub fn find_rank_from_join_request(&self, req: &JoinRequest) -> Result<Rank> {
        if !req.rank.is_nil() {
            return Err(JoinFailure::UnexpectedRank(req.rank).into());
        }

        let members = self.store.all_members()?;
        let mut closest: Option<(Rank, Vec<String>)> = None;
        for candidate in &members {
            let mismatched = mismatched_fields(candidate, req);
            if mismatched.is_empty() {
                if candidate.uuid == req.uuid {
                    return Err(JoinFailure::NotReplacement {
                        rank: candidate.rank,
                        uuid: candidate.uuid,
                    }
                    .into());
                }
                return Ok(candidate.rank);
            }
            let closer = closest
                .as_ref()
                .map(|(_, fields)| mismatched.len() < fields.len())
                .unwrap_or(true);
            if closer {
                closest = Some((candidate.rank, mismatched));
            }
        }

        match closest {
            Some((rank, fields)) => Err(JoinFailure::NoReplacementCandidate { rank, fields }.into()),
            None => Err(JoinFailure::NoMembers.into()),
        }
    }

    /// Apply the states reported in `results` to their members.
    ///
    /// Errored results are skipped unless `update_on_fail` is set and
    /// illegal transitions are skipped silently. Results without an address
    /// get the member's address.
    pub async fn update_member_states(
        &self,
        results: &mut [MemberResult],
        update_on_fail: bool,
    ) -> Result<()> {
        for result in results.iter() {
            if result.errored
                && !matches!(result.state, MemberState::Errored | MemberState::Unresponsive)
            {
                return Err(SysdbError::ConflictingResult {
                    rank: result.rank,
                    state: result.state.to_string(),
                });
            }
        }

        let _guard = self.lock.lock().await;
        for result in results.iter_mut() {
            let mut member = self.store.find_member_by_rank(result.rank)?;
            if result.addr.is_none() {
                result.addr = Some(member.addr);
            }
            if result.errored && !update_on_fail {
                continue;
            }
            if member.state.is_transition_illegal(result.state) {
                debug!(
                    rank = %member.rank,
                    from = %member.state,
                    to = %result.state,
                    "Skipping illegal member state update"
                );
                continue;
            }
            member.state = result.state;
            member.info = result.msg.clone();
            self.store.update_member(member).await?;
        }
        Ok(())
    }

    /// Exclude `rank` after its engine was reported dead.
    ///
    /// A report for an older incarnation of a joined member is rejected, so
    /// a restarted engine is not excluded by news of its predecessor.
    pub async fn mark_rank_dead(&self, rank: Rank, incarnation: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut member = self.store.find_member_by_rank(rank)?;

        let target = MemberState::Excluded;
        if member.state.is_transition_illegal(target) {
            return Err(SysdbError::IllegalStateTransition {
                rank,
                from: member.state.to_string(),
                to: target.to_string(),
            });
        }
        if member.state == MemberState::Joined && member.incarnation > incarnation {
            return Err(SysdbError::StaleIncarnation {
                rank,
                incarnation,
                current: member.incarnation,
            });
        }
        if member.state == target {
            return Ok(());
        }

        info!(rank = %rank, incarnation, prev = %member.state, "Marking rank dead");
        member.state = target;
        self.store.update_member(member).await
    }

    /// Flat encoding of the fault domain tree, limited to `ranks` if any
    /// are given.
    pub fn compressed_fault_domain_tree(&self, ranks: &[Rank]) -> Result<Vec<u32>> {
        let tree = self.store.fault_domain_tree()?;
        if ranks.is_empty() {
            return Ok(tree.compress());
        }
        Ok(tree.subtree_for_ranks(ranks)?.compress())
    }

    pub fn get(&self, rank: Rank) -> Result<Member> {
        self.store.find_member_by_rank(rank)
    }

    pub fn count(&self) -> Result<usize> {
        self.store.member_count(&[])
    }

    /// Ranks of every member, sorted.
    pub fn rank_list(&self) -> Result<Vec<Rank>> {
        Ok(self.store.all_members()?.iter().map(|m| m.rank).collect())
    }

    /// Members whose rank is in `ranks`, or every member if `ranks` is empty.
    pub fn members(&self, ranks: &RankSet) -> Result<Vec<Member>> {
        let mut members = self.store.all_members()?;
        if !ranks.is_empty() {
            members.retain(|m| ranks.contains(m.rank));
        }
        Ok(members)
    }

    /// Split the ranks in `ranks` into those with and without a member.
    /// An empty list selects every member.
    pub fn check_ranks(&self, ranks: &str) -> Result<(RankSet, RankSet)> {
        let requested: RankSet = ranks.parse()?;
        let existing = RankSet::from_ranks(self.rank_list()?);
        if requested.is_empty() {
            return Ok((existing, RankSet::new()));
        }

        Ok((
            requested.intersection(&existing),
            requested.difference(&existing),
        ))
    }

    /// Control addresses mapped to their ranks in `ranks` (all ranks if
    /// empty).
    pub fn host_ranks(&self, ranks: &RankSet) -> Result<BTreeMap<String, Vec<Rank>>> {
        let mut hosts: BTreeMap<String, Vec<Rank>> = BTreeMap::new();
        for member in self.members(ranks)? {
            hosts.entry(member.addr.to_string()).or_default().push(member.rank);
        }
        Ok(hosts)
    }

    /// Sorted control addresses hosting ranks in `ranks`.
    pub fn host_list(&self, ranks: &RankSet) -> Result<Vec<String>> {
        Ok(self.host_ranks(ranks)?.into_keys().collect())
    }

    async fn handle_engine_died(&self, rank: Rank, incarnation: u64, idx: u32, exit_err: &str) {
        let _guard = self.lock.lock().await;
        let mut member = match self.store.find_member_by_rank(rank) {
            Ok(member) => member,
            Err(e) => {
                debug!(rank = %rank, error = %e, "Engine died event for unknown rank");
                return;
            }
        };

        if member.state == MemberState::Joined && member.incarnation > incarnation {
            debug!(
                rank = %rank,
                incarnation,
                current = member.incarnation,
                "Ignoring engine died event for previous incarnation"
            );
            return;
        }
        let target = MemberState::Errored;
        if member.state.is_transition_illegal(target) {
            debug!(rank = %rank, from = %member.state, "Engine died event ignored for state");
            return;
        }

        member.state = target;
        member.info = format!("DAOS engine {} exited unexpectedly: {}", idx, exit_err);
        if let Err(e) = self.store.update_member(member).await {
            error!(rank = %rank, error = %e, "Failed to record engine failure");
        }
    }
}

fn mismatched_fields(member: &Member, req: &JoinRequest) -> Vec<String> {
    let mut fields = Vec::new();
    if member.addr != req.control_addr {
        fields.push("ControlAddr");
    }
    if member.primary_fabric_uri != req.primary_fabric_uri {
        fields.push("PrimaryFabricURI");
    }
    if member.secondary_fabric_uris != req.secondary_fabric_uris {
        fields.push("SecondaryFabricURIs");
    }
    if member.primary_fabric_contexts != req.primary_fabric_contexts {
        fields.push("PrimaryFabricContexts");
    }
    if member.secondary_fabric_contexts != req.secondary_fabric_contexts {
        fields.push("SecondaryFabricContexts");
    }
    if member.fault_domain != req.fault_domain {
        fields.push("FaultDomain");
    }
    fields.into_iter().map(String::from).collect()
}

#[async_trait]
impl EventHandler for Membership {
    async fn on_event(&self, event: &SystemEvent) {
        if let SystemEvent::EngineDied {
            rank,
            incarnation,
            instance_idx,
            exit_err,
            ..
        } = event
        {
            self.handle_engine_died(Rank(*rank), *incarnation, *instance_idx, exit_err)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::raft::{LocalRaft, RaftLogFilter, RaftService};
    use crate::sysdb::Database;
    use std::str::FromStr;

    async fn membership() -> (Membership, Arc<Database>, Arc<LocalRaft>) {
        let addr: SocketAddr = "127.0.0.1:10001".parse().unwrap();
        let db = Arc::new(Database::new(DatabaseConfig {
            replicas: vec![addr],
            control_addr: Some(addr),
            ..DatabaseConfig::default()
        }));
        let (raft, rx) = LocalRaft::new(addr, db.fsm(), RaftLogFilter::default());
        db.start(raft.clone(), rx).unwrap();
        raft.bootstrap().unwrap();
        (Membership::new(db.clone()), db, raft)
    }

    fn fd(s: &str) -> FaultDomain {
        FaultDomain::from_str(s).unwrap()
    }

    fn host_addr(host: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, host], 10001))
    }

    fn request(rank: Rank, host: u8, domain: &str) -> JoinRequest {
        JoinRequest::new(rank, Uuid::new_v4(), host_addr(host), fd(domain))
            .with_fabric(format!("tcp://10.0.0.{}:31416", host), 2)
    }

    #[tokio::test]
    async fn test_join_new_then_rejoin() {
        let (ms, _db, _raft) = membership().await;
        let req = request(Rank::NIL, 1, "/");

        let resp = ms.join(&req).await.unwrap();
        assert!(resp.created);
        assert_eq!(resp.member.rank, Rank(0));
        assert_eq!(resp.member.state, MemberState::Joined);
        assert_eq!(resp.prev_state, MemberState::Unknown);
        assert_eq!(resp.map_version, 1);

        let mut again = req.clone();
        again.rank = Rank(0);
        again.incarnation = 5;
        let resp = ms.join(&again).await.unwrap();
        assert!(!resp.created);
        assert_eq!(resp.prev_state, MemberState::Joined);
        assert_eq!(resp.map_version, 2);
        assert_eq!(ms.get(Rank(0)).unwrap().incarnation, 5);
    }

    #[tokio::test]
    async fn test_rejoin_by_uuid_with_nil_rank() {
        let (ms, _db, _raft) = membership().await;
        let req = request(Rank::NIL, 1, "/rack0/host1");
        ms.join(&req).await.unwrap();
        ms.join(&request(Rank::NIL, 2, "/rack0/host2")).await.unwrap();

        let resp = ms.join(&req).await.unwrap();
        assert!(!resp.created);
        assert_eq!(resp.member.rank, Rank(0));
        assert_eq!(ms.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_join_rejections() {
        let (ms, _db, _raft) = membership().await;
        let first = request(Rank::NIL, 1, "/dc1/rack8/pdu5/host1");
        ms.join(&first).await.unwrap();
        ms.join(&request(Rank::NIL, 2, "/dc1/rack8/pdu5/host2")).await.unwrap();

        // Unknown rank with a known UUID falls through to a duplicate add.
        let mut unknown_rank = first.clone();
        unknown_rank.rank = Rank(42);
        assert!(matches!(
            ms.join(&unknown_rank).await,
            Err(SysdbError::UuidExists(_))
        ));

        let mut new_uuid = first.clone();
        new_uuid.rank = Rank(0);
        new_uuid.uuid = Uuid::new_v4();
        assert!(matches!(
            ms.join(&new_uuid).await,
            Err(SysdbError::JoinFailure(JoinFailure::UuidChanged { .. }))
        ));

        let mut new_addr = first.clone();
        new_addr.rank = Rank(0);
        new_addr.control_addr = host_addr(9);
        assert!(matches!(
            ms.join(&new_addr).await,
            Err(SysdbError::JoinFailure(JoinFailure::AddrChanged { .. }))
        ));

        let shallow = request(Rank::NIL, 3, "/host3");
        match ms.join(&shallow).await {
            Err(SysdbError::JoinFailure(JoinFailure::BadFaultDomainDepth { levels, expected, .. })) => {
                assert_eq!(levels, 1);
                assert_eq!(expected, 4);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let mut shallow_existing = first.clone();
        shallow_existing.rank = Rank(0);
        shallow_existing.fault_domain = fd("/host3");
        assert!(matches!(
            ms.join(&shallow_existing).await,
            Err(SysdbError::JoinFailure(JoinFailure::BadFaultDomainDepth { .. }))
        ));
    }

    #[tokio::test]
    async fn test_sole_member_may_change_depth() {
        let (ms, _db, _raft) = membership().await;
        let mut req = request(Rank::NIL, 1, "/dc1/rack8/pdu5/host1");
        ms.join(&req).await.unwrap();

        req.rank = Rank(0);
        req.fault_domain = fd("/host3");
        let resp = ms.join(&req).await.unwrap();
        assert_eq!(resp.member.fault_domain, fd("/host3"));
        assert_eq!(resp.map_version, 2);
    }

    #[tokio::test]
    async fn test_join_rejects_admin_excluded() {
        let (ms, db, _raft) = membership().await;
        let mut req = request(Rank::NIL, 1, "/");
        let member = ms.join(&req).await.unwrap().member;
        db.update_member(member.with_state(MemberState::AdminExcluded))
            .await
            .unwrap();

        req.rank = Rank(0);
        assert!(matches!(
            ms.join(&req).await,
            Err(SysdbError::JoinFailure(JoinFailure::AdminExcluded { .. }))
        ));
    }

    #[tokio::test]
    async fn test_check_mode_join() {
        let (ms, _db, _raft) = membership().await;
        let mut req = request(Rank::NIL, 1, "/");
        req.check_mode = true;
        let resp = ms.join(&req).await.unwrap();
        assert_eq!(resp.member.state, MemberState::CheckerStarted);
    }

    #[tokio::test]
    async fn test_not_leader_join() {
        let (ms, _db, raft) = membership().await;
        raft.shutdown().unwrap();
        let err = ms.join(&request(Rank::NIL, 1, "/")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_replace_flow() {
        let (ms, _db, _raft) = membership().await;
        let old = request(Rank::NIL, 1, "/rack0/host1");
        ms.join(&old).await.unwrap();
        ms.join(&request(Rank::NIL, 2, "/rack0/host2")).await.unwrap();

        let mut replacement = old.clone();
        replacement.uuid = Uuid::new_v4();
        replacement.replace = true;
        let rank = ms.find_rank_from_join_request(&replacement).unwrap();
        assert_eq!(rank, Rank(0));

        replacement.rank = rank;
        let before = ms.get(Rank(0)).unwrap();
        let resp = ms.join(&replacement).await.unwrap();
        assert!(!resp.created);
        assert_eq!(resp.member.rank, Rank(0));
        assert_eq!(resp.member.uuid, replacement.uuid);
        assert_eq!(resp.member.incarnation, before.incarnation);
        // Remove and add are two committed operations.
        assert_eq!(resp.map_version, 4);
    }

    #[tokio::test]
    async fn test_find_rank_from_join_request_failures() {
        let (ms, _db, _raft) = membership().await;
        let req = request(Rank::NIL, 1, "/rack0/host1");
        assert!(matches!(
            ms.find_rank_from_join_request(&req),
            Err(SysdbError::JoinFailure(JoinFailure::NoMembers))
        ));
        ms.join(&req).await.unwrap();

        assert!(matches!(
            ms.find_rank_from_join_request(&req),
            Err(SysdbError::JoinFailure(JoinFailure::NotReplacement { .. }))
        ));

        let mut moved = req.clone();
        moved.uuid = Uuid::new_v4();
        moved.control_addr = host_addr(7);
        moved.primary_fabric_uri = "tcp://10.0.0.7:31416".to_string();
        match ms.find_rank_from_join_request(&moved) {
            Err(SysdbError::JoinFailure(JoinFailure::NoReplacementCandidate { rank, fields })) => {
                assert_eq!(rank, Rank(0));
                assert_eq!(fields, vec!["ControlAddr", "PrimaryFabricURI"]);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let mut ranked = moved.clone();
        ranked.rank = Rank(0);
        assert!(matches!(
            ms.find_rank_from_join_request(&ranked),
            Err(SysdbError::JoinFailure(JoinFailure::UnexpectedRank(_)))
        ));
    }

    async fn populate(ms: &Membership, db: &Database, states: &[MemberState]) {
        for (i, state) in states.iter().enumerate() {
            let member = ms
                .join(&request(Rank::NIL, (i + 1) as u8, "/"))
                .await
                .unwrap()
                .member;
            if *state != MemberState::Joined {
                db.update_member(member.with_state(*state)).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_update_member_states() {
        let (ms, db, _raft) = membership().await;
        use MemberState::*;
        populate(&ms, &db, &[Joined, Stopped, Excluded, Stopped, Joined, Joined]).await;

        let mut results = vec![
            MemberResult::new(Rank(0), None, Stopped),
            MemberResult::new(Rank(1), Some("can't stop".to_string()), Errored),
            MemberResult::new(Rank(3), None, Ready),
            MemberResult::new(Rank(4), None, Ready),
            MemberResult::new(Rank(5), None, Stopped).with_msg("exit 1"),
        ];
        results[1].addr = Some(host_addr(99));
        ms.update_member_states(&mut results, false).await.unwrap();

        let states: Vec<MemberState> = ms
            .members(&RankSet::new())
            .unwrap()
            .iter()
            .map(|m| m.state)
            .collect();
        assert_eq!(states, vec![Stopped, Stopped, Excluded, Ready, Joined, Stopped]);
        assert_eq!(ms.get(Rank(5)).unwrap().info, "exit 1");
        assert_eq!(results[0].addr, Some(host_addr(1)));
        assert_eq!(results[1].addr, Some(host_addr(99)));

        ms.update_member_states(&mut results[1..2], true).await.unwrap();
        let errored = ms.get(Rank(1)).unwrap();
        assert_eq!(errored.state, Errored);
        assert_eq!(errored.info, "can't stop");
    }

    #[tokio::test]
    async fn test_conflicting_result_rejected_before_updates() {
        let (ms, db, _raft) = membership().await;
        populate(&ms, &db, &[MemberState::Joined, MemberState::Joined]).await;
        let version = db.cur_map_version().unwrap();

        let mut results = vec![
            MemberResult::new(Rank(0), None, MemberState::Stopped),
            MemberResult::new(Rank(1), Some("can't stop".to_string()), MemberState::Joined),
        ];
        let err = ms.update_member_states(&mut results, true).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "errored result for rank 1 has conflicting state 'Joined'"
        );
        assert_eq!(db.cur_map_version().unwrap(), version);
    }

    #[tokio::test]
    async fn test_mark_rank_dead() {
        let (ms, db, _raft) = membership().await;
        populate(
            &ms,
            &db,
            &[MemberState::Joined, MemberState::Stopped, MemberState::AdminExcluded],
        )
        .await;
        let joined = ms.get(Rank(0)).unwrap().with_incarnation(2);
        db.update_member(joined).await.unwrap();

        assert!(ms.mark_rank_dead(Rank(42), 0).await.unwrap_err().is_member_not_found());
        assert!(matches!(
            ms.mark_rank_dead(Rank(2), 3).await,
            Err(SysdbError::IllegalStateTransition { .. })
        ));
        assert!(matches!(
            ms.mark_rank_dead(Rank(0), 1).await,
            Err(SysdbError::StaleIncarnation { incarnation: 1, current: 2, .. })
        ));

        ms.mark_rank_dead(Rank(0), 2).await.unwrap();
        ms.mark_rank_dead(Rank(1), 2).await.unwrap();
        assert_eq!(ms.get(Rank(0)).unwrap().state, MemberState::Excluded);
        assert_eq!(ms.get(Rank(1)).unwrap().state, MemberState::Excluded);

        let version = db.cur_map_version().unwrap();
        ms.mark_rank_dead(Rank(0), 2).await.unwrap();
        assert_eq!(db.cur_map_version().unwrap(), version);
    }

    #[tokio::test]
    async fn test_engine_died_event() {
        let (ms, db, _raft) = membership().await;
        populate(&ms, &db, &[MemberState::Joined, MemberState::Joined]).await;

        ms.on_event(&SystemEvent::engine_died("host1", 0, 1, 0, "exit status 0"))
            .await;
        ms.on_event(&SystemEvent::engine_died("host1", 0, 9, 0, "exit status 0"))
            .await;

        let died = ms.get(Rank(1)).unwrap();
        assert_eq!(died.state, MemberState::Errored);
        assert_eq!(died.info, "DAOS engine 0 exited unexpectedly: exit status 0");
        assert_eq!(ms.get(Rank(0)).unwrap().state, MemberState::Joined);
    }

    #[tokio::test]
    async fn test_rank_queries() {
        let (ms, db, _raft) = membership().await;
        populate(&ms, &db, &[MemberState::Joined, MemberState::Stopped, MemberState::Joined]).await;

        assert_eq!(ms.rank_list().unwrap(), vec![Rank(0), Rank(1), Rank(2)]);

        let (hit, miss) = ms.check_ranks("").unwrap();
        assert_eq!(hit.to_string(), "0-2");
        assert!(miss.is_empty());
        let (hit, miss) = ms.check_ranks("1-4").unwrap();
        assert_eq!(hit.to_string(), "1-2");
        assert_eq!(miss.to_string(), "3-4");
        let (hit, miss) = ms.check_ranks("0-4294967294").unwrap();
        assert_eq!(hit.to_string(), "0-2");
        assert_eq!(miss.to_string(), "3-4294967294");
        assert!(matches!(
            ms.check_ranks("foobar"),
            Err(SysdbError::InvalidRankSet { .. })
        ));

        let subset: RankSet = "0,2".parse().unwrap();
        let hosts = ms.host_ranks(&subset).unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts["10.0.0.3:10001"], vec![Rank(2)]);
        assert_eq!(
            ms.host_list(&subset).unwrap(),
            vec!["10.0.0.1:10001", "10.0.0.3:10001"]
        );
        assert!(ms.members(&"5-6".parse().unwrap()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compressed_tree() {
        let (ms, _db, _raft) = membership().await;
        for (host, domain) in [(1, "/rack0/pdu0"), (2, "/rack0/pdu1"), (3, "/rack1/pdu2")] {
            ms.join(&request(Rank::NIL, host, domain)).await.unwrap();
        }

        let full = ms.compressed_fault_domain_tree(&[]).unwrap();
        assert_eq!(&full[full.len() - 3..], &[0, 1, 2]);

        let subset = ms.compressed_fault_domain_tree(&[Rank(2)]).unwrap();
        assert_eq!(subset.last(), Some(&2));
        assert!(subset.len() < full.len());

        match ms.compressed_fault_domain_tree(&[Rank(100)]) {
            Err(e) => assert_eq!(e.to_string(), "rank 100 not found"),
            Ok(v) => panic!("unexpected tree: {:?}", v),
        }
    }
}
