//! Pool service records.

use crate::error::Result;
use crate::ranks::{Rank, RankSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Lifecycle state of a pool service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolServiceState {
    Creating,
    Ready,
    Destroying,
}

impl fmt::Display for PoolServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolServiceState::Creating => write!(f, "Creating"),
            PoolServiceState::Ready => write!(f, "Ready"),
            PoolServiceState::Destroying => write!(f, "Destroying"),
        }
    }
}

/// Storage allocated to a pool on each of its ranks.
///
/// Rank sets are persisted in their canonical string form and parsed on
/// first use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PoolServiceStorage {
    creation_rank_str: String,
    current_rank_str: String,
    /// Bytes allocated per rank, one entry per storage tier.
    pub per_rank_tier_storage: Vec<u64>,
    #[serde(skip)]
    creation_ranks: OnceLock<RankSet>,
    #[serde(skip)]
    current_ranks: OnceLock<RankSet>,
}

fn cached_ranks(cache: &OnceLock<RankSet>, encoded: &str) -> Result<RankSet> {
    if let Some(ranks) = cache.get() {
        return Ok(ranks.clone());
    }
    let parsed: RankSet = encoded.parse()?;
    let _ = cache.set(parsed.clone());
    Ok(parsed)
}

impl PoolServiceStorage {
    pub fn new(ranks: &RankSet, per_rank_tier_storage: Vec<u64>) -> Self {
        Self {
            creation_rank_str: ranks.to_string(),
            current_rank_str: ranks.to_string(),
            per_rank_tier_storage,
            creation_ranks: OnceLock::new(),
            current_ranks: OnceLock::new(),
        }
    }

    /// Ranks the pool was created on.
    pub fn creation_ranks(&self) -> Result<RankSet> {
        cached_ranks(&self.creation_ranks, &self.creation_rank_str)
    }

    /// Ranks currently hosting the pool.
    pub fn current_ranks(&self) -> Result<RankSet> {
        cached_ranks(&self.current_ranks, &self.current_rank_str)
    }

    pub fn set_current_ranks(&mut self, ranks: &RankSet) {
        self.current_rank_str = ranks.to_string();
        self.current_ranks = OnceLock::new();
    }

    /// Total bytes per tier across the current ranks.
    pub fn total_per_tier(&self) -> Result<Vec<u64>> {
        let count = self.current_ranks()?.count() as u64;
        Ok(self
            .per_rank_tier_storage
            .iter()
            .map(|per_rank| per_rank.saturating_mul(count))
            .collect())
    }
}

impl PartialEq for PoolServiceStorage {
    fn eq(&self, other: &Self) -> bool {
        self.creation_rank_str == other.creation_rank_str
            && self.current_rank_str == other.current_rank_str
            && self.per_rank_tier_storage == other.per_rank_tier_storage
    }
}

impl Eq for PoolServiceStorage {}

/// Metadata-management service for one storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PoolService {
    pub pool_uuid: Uuid,
    pub pool_label: String,
    pub state: PoolServiceState,
    /// Ranks hosting the pool service replicas.
    pub replicas: Vec<Rank>,
    #[serde(default)]
    pub storage: Option<PoolServiceStorage>,
    pub last_update: DateTime<Utc>,
}

impl PoolService {
    pub fn new(pool_uuid: Uuid, label: impl Into<String>, replicas: Vec<Rank>) -> Self {
        Self {
            pool_uuid,
            pool_label: label.into(),
            state: PoolServiceState::Creating,
            replicas,
            storage: None,
            last_update: Utc::now(),
        }
    }

    pub fn with_state(mut self, state: PoolServiceState) -> Self {
        self.state = state;
        self
    }

    pub fn with_storage(mut self, storage: PoolServiceStorage) -> Self {
        self.storage = Some(storage);
        self
    }
}

impl fmt::Display for PoolService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool {} ({:?}) [{}]", self.pool_uuid, self.pool_label, self.state)
    }
}
