//! Replicated system state and its snapshot encoding.

use super::ops::Command;
use super::RaftOp;
use crate::error::{ApplyError, Result, SysdbError};
use crate::faultdomain::{FaultDomainTree, FaultDomainTreeWire};
use crate::member::{state_matches, Member, MemberState};
use crate::pool::PoolService;
use crate::ranks::Rank;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use uuid::Uuid;

/// Version of the snapshot layout written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 0;

/// Member records indexed by rank, UUID and control address.
///
/// Only the UUID index owns records; the other indexes refer to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberDatabase {
    pub(crate) ranks: HashMap<Rank, Uuid>,
    pub(crate) uuids: HashMap<Uuid, Member>,
    pub(crate) addrs: HashMap<SocketAddr, Vec<Uuid>>,
    pub(crate) fault_domains: FaultDomainTree,
}

impl MemberDatabase {
    pub fn by_rank(&self, rank: Rank) -> Option<&Member> {
        self.ranks.get(&rank).and_then(|uuid| self.uuids.get(uuid))
    }

    pub fn by_uuid(&self, uuid: &Uuid) -> Option<&Member> {
        self.uuids.get(uuid)
    }

    pub fn by_addr(&self, addr: &SocketAddr) -> Vec<&Member> {
        self.addrs
            .get(addr)
            .map(|uuids| uuids.iter().filter_map(|u| self.uuids.get(u)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.uuids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uuids.is_empty()
    }

    /// Members whose state matches `states`, ordered by rank.
    pub fn filter(&self, states: &[MemberState]) -> Vec<&Member> {
        let mut out: Vec<&Member> = self
            .uuids
            .values()
            .filter(|m| state_matches(m.state, states))
            .collect();
        out.sort_by_key(|m| m.rank);
        out
    }

    pub fn fault_domains(&self) -> &FaultDomainTree {
        &self.fault_domains
    }

    /// Lowest rank at or above `start` that no member holds.
    pub fn free_rank_from(&self, start: Rank) -> Rank {
        let mut rank = start;
        while self.ranks.contains_key(&rank) {
            rank = rank.next();
        }
        rank
    }

    fn check_rank_free(&self, member: &Member) -> std::result::Result<(), ApplyError> {
        match self.ranks.get(&member.rank) {
            Some(holder) if *holder != member.uuid => Err(ApplyError::RankInUse {
                rank: member.rank,
                holder: *holder,
            }),
            _ => Ok(()),
        }
    }

    fn add(&mut self, member: Member) -> std::result::Result<(), ApplyError> {
        if self.uuids.contains_key(&member.uuid) {
            return Err(ApplyError::DuplicateMember(member.uuid));
        }
        self.check_rank_free(&member)?;

        let leaf = member
            .tree_domain()
            .map_err(|e| ApplyError::TreeInvariant(e.to_string()))?;
        self.fault_domains
            .add_domain(&leaf)
            .map_err(|e| ApplyError::TreeInvariant(e.to_string()))?;

        self.ranks.insert(member.rank, member.uuid);
        let at_addr = self.addrs.entry(member.addr).or_default();
        if !at_addr.contains(&member.uuid) {
            at_addr.push(member.uuid);
        }
        self.uuids.insert(member.uuid, member);
        Ok(())
    }

    fn remove(&mut self, uuid: &Uuid) -> std::result::Result<Option<Member>, ApplyError> {
        let Some(old) = self.uuids.remove(uuid) else {
            return Ok(None);
        };

        if self.ranks.get(&old.rank) == Some(uuid) {
            self.ranks.remove(&old.rank);
        }
        if let Some(at_addr) = self.addrs.get_mut(&old.addr) {
            at_addr.retain(|u| u != uuid);
            if at_addr.is_empty() {
                self.addrs.remove(&old.addr);
            }
        }

        let leaf = old
            .tree_domain()
            .map_err(|e| ApplyError::TreeInvariant(e.to_string()))?;
        self.fault_domains
            .remove_domain(&leaf)
            .map_err(|e| ApplyError::TreeInvariant(e.to_string()))?;
        Ok(Some(old))
    }

    fn update(&mut self, member: Member) -> std::result::Result<(), ApplyError> {
        if !self.uuids.contains_key(&member.uuid) {
            return Err(ApplyError::UnknownMember(member.uuid));
        }
        self.check_rank_free(&member)?;
        if self.remove(&member.uuid)?.is_none() {
            return Err(ApplyError::UnknownMember(member.uuid));
        }
        self.add(member)
    }
}

/// Pool service records indexed by UUID, label and hosting rank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolDatabase {
    pub(crate) ranks: HashMap<Rank, Vec<Uuid>>,
    pub(crate) uuids: HashMap<Uuid, PoolService>,
    pub(crate) labels: HashMap<String, Uuid>,
}

impl PoolDatabase {
    pub fn by_uuid(&self, uuid: &Uuid) -> Option<&PoolService> {
        self.uuids.get(uuid)
    }

    pub fn by_label(&self, label: &str) -> Option<&PoolService> {
        self.labels.get(label).and_then(|uuid| self.uuids.get(uuid))
    }

    /// Pools with a service replica on `rank`.
    pub fn on_rank(&self, rank: Rank) -> Vec<&PoolService> {
        self.ranks
            .get(&rank)
            .map(|uuids| uuids.iter().filter_map(|u| self.uuids.get(u)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.uuids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uuids.is_empty()
    }

    fn add(&mut self, ps: PoolService) {
        for rank in &ps.replicas {
            let on_rank = self.ranks.entry(*rank).or_default();
            if !on_rank.contains(&ps.pool_uuid) {
                on_rank.push(ps.pool_uuid);
            }
        }
        if !ps.pool_label.is_empty() {
            self.labels.insert(ps.pool_label.clone(), ps.pool_uuid);
        }
        self.uuids.insert(ps.pool_uuid, ps);
    }

    fn remove(&mut self, uuid: &Uuid) -> Option<PoolService> {
        let old = self.uuids.remove(uuid)?;
        if self.labels.get(&old.pool_label) == Some(uuid) {
            self.labels.remove(&old.pool_label);
        }
        self.ranks = std::mem::take(&mut self.ranks)
            .into_iter()
            .filter_map(|(rank, uuids)| {
                let kept: Vec<Uuid> = uuids.into_iter().filter(|u| u != uuid).collect();
                (!kept.is_empty()).then_some((rank, kept))
            })
            .collect();
        Some(old)
    }

    fn update(&mut self, ps: PoolService) -> std::result::Result<(), ApplyError> {
        if self.remove(&ps.pool_uuid).is_none() {
            return Err(ApplyError::UnknownPool(ps.pool_uuid));
        }
        self.add(ps);
        Ok(())
    }
}

/// Everything replicated through the consensus log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbData {
    pub(crate) schema_version: u32,
    pub(crate) next_rank: Rank,
    pub(crate) map_version: u32,
    pub(crate) members: MemberDatabase,
    pub(crate) pools: PoolDatabase,
}

impl Default for DbData {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            next_rank: Rank(0),
            map_version: 0,
            members: MemberDatabase::default(),
            pools: PoolDatabase::default(),
        }
    }
}

impl DbData {
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn next_rank(&self) -> Rank {
        self.next_rank
    }

    pub fn map_version(&self) -> u32 {
        self.map_version
    }

    pub fn members(&self) -> &MemberDatabase {
        &self.members
    }

    pub fn pools(&self) -> &PoolDatabase {
        &self.pools
    }

    /// Apply one committed command, stamping `time` onto the changed record.
    pub(crate) fn apply(
        &mut self,
        time: DateTime<Utc>,
        command: Command,
    ) -> std::result::Result<RaftOp, ApplyError> {
        let op = command.op();
        match command {
            Command::Member(op, update) => {
                let mut member = update.member;
                member.last_update = time;
                match op {
                    RaftOp::AddMember => {
                        let rank = member.rank;
                        self.members.add(member)?;
                        if update.next_rank {
                            self.next_rank = rank.max(self.next_rank).next();
                        }
                    }
                    RaftOp::UpdateMember => self.members.update(member)?,
                    RaftOp::RemoveMember => {
                        self.members.remove(&member.uuid)?;
                    }
                    other => return Err(ApplyError::UnknownOp(other.to_string())),
                }
            }
            Command::Pool(op, mut ps) => {
                ps.last_update = time;
                match op {
                    RaftOp::AddPoolService => self.pools.add(ps),
                    RaftOp::UpdatePoolService => self.pools.update(ps)?,
                    RaftOp::RemovePoolService => {
                        self.pools.remove(&ps.pool_uuid);
                    }
                    other => return Err(ApplyError::UnknownOp(other.to_string())),
                }
            }
        }
        self.map_version = self.map_version.wrapping_add(1);
        Ok(op)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_wire())?)
    }

    /// Decode a snapshot. The schema version is returned as found; callers
    /// decide whether it is acceptable.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let wire: DbDataWire = serde_json::from_slice(bytes)?;
        Self::from_wire(wire)
    }

    fn to_wire(&self) -> DbDataWire {
        DbDataWire {
            schema_version: self.schema_version,
            next_rank: self.next_rank,
            map_version: self.map_version,
            members: MemberDatabaseWire {
                ranks: self.members.ranks.iter().map(|(r, u)| (*r, *u)).collect(),
                uuids: self
                    .members
                    .uuids
                    .iter()
                    .map(|(u, m)| (*u, m.clone()))
                    .collect(),
                addrs: self
                    .members
                    .addrs
                    .iter()
                    .map(|(a, u)| (a.to_string(), u.clone()))
                    .collect(),
                fault_domains: self.members.fault_domains.to_wire(),
            },
            pools: PoolDatabaseWire {
                ranks: self
                    .pools
                    .ranks
                    .iter()
                    .map(|(r, u)| (*r, u.clone()))
                    .collect(),
                uuids: self
                    .pools
                    .uuids
                    .iter()
                    .map(|(u, p)| (*u, p.clone()))
                    .collect(),
                labels: self.pools.labels.iter().map(|(l, u)| (l.clone(), *u)).collect(),
            },
        }
    }

    fn from_wire(wire: DbDataWire) -> Result<Self> {
        let dangling = |index: &str, uuid: &Uuid| {
            SysdbError::Serialization(format!("{} index refers to unknown record {}", index, uuid))
        };

        let member_uuids: HashMap<Uuid, Member> = wire.members.uuids.into_iter().collect();
        let mut member_ranks = HashMap::with_capacity(wire.members.ranks.len());
        for (rank, uuid) in wire.members.ranks {
            if !member_uuids.contains_key(&uuid) {
                return Err(dangling("member rank", &uuid));
            }
            member_ranks.insert(rank, uuid);
        }
        let mut member_addrs = HashMap::with_capacity(wire.members.addrs.len());
        for (addr, uuids) in wire.members.addrs {
            let addr: SocketAddr = addr.parse().map_err(|e| {
                SysdbError::Serialization(format!("invalid member address {:?}: {}", addr, e))
            })?;
            if let Some(missing) = uuids.iter().find(|u| !member_uuids.contains_key(u)) {
                return Err(dangling("member address", missing));
            }
            member_addrs.insert(addr, uuids);
        }

        let pool_uuids: HashMap<Uuid, PoolService> = wire.pools.uuids.into_iter().collect();
        let mut pool_ranks = HashMap::with_capacity(wire.pools.ranks.len());
        for (rank, uuids) in wire.pools.ranks {
            if let Some(missing) = uuids.iter().find(|u| !pool_uuids.contains_key(u)) {
                return Err(dangling("pool rank", missing));
            }
            pool_ranks.insert(rank, uuids);
        }
        let mut pool_labels = HashMap::with_capacity(wire.pools.labels.len());
        for (label, uuid) in wire.pools.labels {
            if !pool_uuids.contains_key(&uuid) {
                return Err(dangling("pool label", &uuid));
            }
            pool_labels.insert(label, uuid);
        }

        Ok(Self {
            schema_version: wire.schema_version,
            next_rank: wire.next_rank,
            map_version: wire.map_version,
            members: MemberDatabase {
                ranks: member_ranks,
                uuids: member_uuids,
                addrs: member_addrs,
                fault_domains: FaultDomainTree::from_wire(&wire.members.fault_domains)?,
            },
            pools: PoolDatabase {
                ranks: pool_ranks,
                uuids: pool_uuids,
                labels: pool_labels,
            },
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DbDataWire {
    schema_version: u32,
    next_rank: Rank,
    map_version: u32,
    members: MemberDatabaseWire,
    pools: PoolDatabaseWire,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MemberDatabaseWire {
    ranks: BTreeMap<Rank, Uuid>,
    uuids: BTreeMap<Uuid, Member>,
    addrs: BTreeMap<String, Vec<Uuid>>,
    fault_domains: FaultDomainTreeWire,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PoolDatabaseWire {
    ranks: BTreeMap<Rank, Vec<Uuid>>,
    uuids: BTreeMap<Uuid, PoolService>,
    labels: BTreeMap<String, Uuid>,
}
