//! Hierarchical fault domains and the tree that indexes them.
//!
//! A fault domain is a path such as `/dc0/rack1/node2`, optionally labelled
//! per level (`/dc=dc0/rack=rack1/node=node2`). Every member of the system
//! contributes a synthetic `rank<N>` leaf beneath its configured domain to the
//! [`FaultDomainTree`], which is compressed into a flat `u32` encoding for
//! broadcast to engines.

mod compress;
mod tree;

pub use compress::{COMPRESS_HAS_FAULT_DOMAIN, COMPRESS_HAS_PERF_DOMAIN};
pub use tree::{FaultDomainTree, FaultDomainTreeWire, ROOT_ID};

use crate::error::{Result, SysdbError};
use crate::ranks::Rank;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Separates levels in the string form of a fault domain.
pub const FAULT_DOMAIN_SEPARATOR: &str = "/";
/// Separates a level's label from its value.
pub const FAULT_DOMAIN_LABEL_SEPARATOR: &str = "=";
/// Prefix of the synthetic leaf added below a member's domain.
pub const RANK_LEVEL_PREFIX: &str = "rank";
/// Label given to the rank level of a labelled domain.
pub const RANK_LEVEL_LABEL: &str = "rank";

/// An ordered, normalized list of fault-domain levels. Empty means root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FaultDomain {
    domains: Vec<String>,
    /// Either empty or one label per level.
    labels: Vec<String>,
}

fn invalid(input: impl Into<String>, reason: impl Into<String>) -> SysdbError {
    SysdbError::InvalidFaultDomain {
        input: input.into(),
        reason: reason.into(),
    }
}

fn normalize_level(input: &str, level: &str) -> Result<String> {
    let level = level.trim().to_lowercase();
    if level.is_empty() {
        return Err(invalid(input, "empty level"));
    }
    if level.contains(FAULT_DOMAIN_SEPARATOR) || level.contains(FAULT_DOMAIN_LABEL_SEPARATOR) {
        return Err(invalid(input, format!("level {:?} contains a reserved character", level)));
    }
    Ok(level)
}

impl FaultDomain {
    /// The root domain.
    pub fn root() -> Self {
        Self::default()
    }

    /// Builds an unlabelled domain from its levels, top first.
    pub fn new<S: AsRef<str>>(levels: &[S]) -> Result<Self> {
        let joined = levels.iter().map(|l| l.as_ref()).collect::<Vec<_>>().join("/");
        let domains = levels
            .iter()
            .map(|l| normalize_level(&joined, l.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            domains,
            labels: Vec::new(),
        })
    }

    /// Builds a labelled domain from `(label, level)` pairs, top first.
    pub fn with_labels<S: AsRef<str>>(pairs: &[(S, S)]) -> Result<Self> {
        let joined = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k.as_ref(), v.as_ref()))
            .collect::<Vec<_>>()
            .join("/");
        let mut labels = Vec::with_capacity(pairs.len());
        let mut domains = Vec::with_capacity(pairs.len());
        for (label, level) in pairs {
            labels.push(normalize_level(&joined, label.as_ref())?);
            domains.push(normalize_level(&joined, level.as_ref())?);
        }
        Ok(Self { domains, labels })
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn num_levels(&self) -> usize {
        self.domains.len()
    }

    pub fn has_labels(&self) -> bool {
        !self.labels.is_empty()
    }

    pub fn levels(&self) -> &[String] {
        &self.domains
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Lowest level, or `""` for the root.
    pub fn bottom_level(&self) -> &str {
        self.domains.last().map(String::as_str).unwrap_or("")
    }

    /// Label of the lowest level, if the domain is labelled.
    pub fn bottom_label(&self) -> Option<&str> {
        self.labels.last().map(String::as_str)
    }

    /// Highest level, or `""` for the root.
    pub fn top_level(&self) -> &str {
        self.domains.first().map(String::as_str).unwrap_or("")
    }

    /// Level by index counting up from the bottom (0 is the bottom level).
    pub fn level(&self, index: usize) -> Result<&str> {
        if index >= self.domains.len() {
            return Err(SysdbError::InvalidArgument(format!(
                "level index {} out of range for {} levels",
                index,
                self.domains.len()
            )));
        }
        Ok(&self.domains[self.domains.len() - 1 - index])
    }

    /// True if `other` lies at or beneath this domain.
    pub fn is_ancestor_of(&self, other: &FaultDomain) -> bool {
        if self.domains.len() > other.domains.len() {
            return false;
        }
        if self.domains[..] != other.domains[..self.domains.len()] {
            return false;
        }
        if self.has_labels() && other.has_labels() {
            return self.labels[..] == other.labels[..self.labels.len()];
        }
        true
    }

    /// The first `levels` levels of this domain.
    pub fn prefix(&self, levels: usize) -> FaultDomain {
        let n = levels.min(self.domains.len());
        FaultDomain {
            domains: self.domains[..n].to_vec(),
            labels: if self.has_labels() {
                self.labels[..n].to_vec()
            } else {
                Vec::new()
            },
        }
    }

    /// Appends an unlabelled level.
    pub fn new_child(&self, level: &str) -> Result<FaultDomain> {
        if self.has_labels() {
            return Err(invalid(
                self.to_string(),
                "unlabelled child of a labelled fault domain",
            ));
        }
        let level = normalize_level(&format!("{}/{}", self, level), level)?;
        let mut child = self.clone();
        child.domains.push(level);
        Ok(child)
    }

    /// Appends a labelled level.
    pub fn new_labelled_child(&self, label: &str, level: &str) -> Result<FaultDomain> {
        if !self.is_empty() && !self.has_labels() {
            return Err(invalid(
                self.to_string(),
                "labelled child of an unlabelled fault domain",
            ));
        }
        let input = format!("{}/{}={}", self, label, level);
        let label = normalize_level(&input, label)?;
        let level = normalize_level(&input, level)?;
        let mut child = self.clone();
        child.labels.push(label);
        child.domains.push(level);
        Ok(child)
    }

    /// Domain of the synthetic leaf a member with `rank` contributes to the
    /// tree beneath this domain.
    pub fn rank_child(&self, rank: Rank) -> Result<FaultDomain> {
        let level = format!("{}{}", RANK_LEVEL_PREFIX, rank.0);
        if self.has_labels() {
            self.new_labelled_child(RANK_LEVEL_LABEL, &level)
        } else {
            self.new_child(&level)
        }
    }
}

/// Parses the rank number out of a `rank<N>` level.
pub fn rank_from_level(level: &str) -> Option<Rank> {
    let digits = level.strip_prefix(RANK_LEVEL_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u32>().ok().map(Rank)
}

impl fmt::Display for FaultDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domains.is_empty() {
            return write!(f, "{}", FAULT_DOMAIN_SEPARATOR);
        }
        for (i, level) in self.domains.iter().enumerate() {
            write!(f, "{}", FAULT_DOMAIN_SEPARATOR)?;
            if let Some(label) = self.labels.get(i) {
                write!(f, "{}{}", label, FAULT_DOMAIN_LABEL_SEPARATOR)?;
            }
            write!(f, "{}", level)?;
        }
        Ok(())
    }
}

impl FromStr for FaultDomain {
    type Err = SysdbError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == FAULT_DOMAIN_SEPARATOR {
            return Ok(FaultDomain::root());
        }
        let body = trimmed
            .strip_prefix(FAULT_DOMAIN_SEPARATOR)
            .ok_or_else(|| invalid(s, "must start with '/'"))?;
        if body.ends_with(FAULT_DOMAIN_SEPARATOR) {
            return Err(invalid(s, "must not end with '/'"));
        }

        let mut domains = Vec::new();
        let mut labels = Vec::new();
        for raw in body.split(FAULT_DOMAIN_SEPARATOR) {
            match raw.split_once(FAULT_DOMAIN_LABEL_SEPARATOR) {
                Some((label, level)) => {
                    labels.push(normalize_level(s, label)?);
                    domains.push(normalize_level(s, level)?);
                }
                None => domains.push(normalize_level(s, raw)?),
            }
        }
        if !labels.is_empty() && labels.len() != domains.len() {
            return Err(invalid(s, "either every level or no level must be labelled"));
        }

        Ok(FaultDomain { domains, labels })
    }
}

impl Serialize for FaultDomain {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FaultDomain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
