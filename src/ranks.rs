//! Rank identifiers and compact rank sets.

use crate::error::{Result, SysdbError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a storage-engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rank(pub u32);

impl Rank {
    /// Sentinel meaning "no rank assigned yet".
    pub const NIL: Rank = Rank(u32::MAX);
    /// Largest rank that may be assigned.
    pub const MAX: Rank = Rank(u32::MAX - 1);

    pub fn is_nil(&self) -> bool {
        *self == Rank::NIL
    }

    pub fn next(&self) -> Rank {
        Rank(self.0.saturating_add(1))
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "NilRank")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u32> for Rank {
    fn from(value: u32) -> Self {
        Rank(value)
    }
}

/// Converts raw rank numbers (as carried in events) into ranks.
pub fn ranks_from_u32(values: &[u32]) -> Vec<Rank> {
    values.iter().copied().map(Rank).collect()
}

/// Compact set of ranks stored as sorted, non-overlapping inclusive ranges.
///
/// The canonical string form is `0-4,6,9-10`; parsing also accepts the
/// bracketed form `[0-4,6]` and arbitrary whitespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RankSet {
    ranges: Vec<(u32, u32)>,
}

impl RankSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranks<I: IntoIterator<Item = Rank>>(ranks: I) -> Self {
        let mut set = Self::new();
        for rank in ranks {
            set.insert(rank);
        }
        set
    }

    pub fn insert(&mut self, rank: Rank) {
        self.insert_range(rank.0, rank.0);
    }

    fn insert_range(&mut self, lo: u32, hi: u32) {
        let mut lo = lo;
        let mut hi = hi;
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;

        for &(start, end) in &self.ranges {
            if end.saturating_add(1) < lo {
                merged.push((start, end));
            } else if hi.saturating_add(1) < start {
                if !placed {
                    merged.push((lo, hi));
                    placed = true;
                }
                merged.push((start, end));
            } else {
                lo = lo.min(start);
                hi = hi.max(end);
            }
        }
        if !placed {
            merged.push((lo, hi));
        }
        self.ranges = merged;
    }

    pub fn remove(&mut self, rank: Rank) {
        let r = rank.0;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for &(start, end) in &self.ranges {
            if r < start || r > end {
                out.push((start, end));
                continue;
            }
            if start < r {
                out.push((start, r - 1));
            }
            if r < end {
                out.push((r + 1, end));
            }
        }
        self.ranges = out;
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.ranges
            .iter()
            .any(|&(start, end)| rank.0 >= start && rank.0 <= end)
    }

    pub fn merge(&mut self, other: &RankSet) {
        for &(start, end) in &other.ranges {
            self.insert_range(start, end);
        }
    }

    /// Ranks present in both sets.
    pub fn intersection(&self, other: &RankSet) -> RankSet {
        let mut ranges = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a_start, a_end) = self.ranges[i];
            let (b_start, b_end) = other.ranges[j];
            let lo = a_start.max(b_start);
            let hi = a_end.min(b_end);
            if lo <= hi {
                ranges.push((lo, hi));
            }
            if a_end < b_end {
                i += 1;
            } else {
                j += 1;
            }
        }
        RankSet { ranges }
    }

    /// Ranks in this set that are not in `other`.
    pub fn difference(&self, other: &RankSet) -> RankSet {
        let mut ranges = Vec::new();
        for &(start, end) in &self.ranges {
            // u64 so that a range ending at u32::MAX cannot overflow.
            let end = u64::from(end);
            let mut lo = u64::from(start);
            for &(o_start, o_end) in &other.ranges {
                let (o_start, o_end) = (u64::from(o_start), u64::from(o_end));
                if o_end < lo {
                    continue;
                }
                if o_start > end {
                    break;
                }
                if o_start > lo {
                    ranges.push((lo as u32, (o_start - 1) as u32));
                }
                lo = o_end + 1;
                if lo > end {
                    break;
                }
            }
            if lo <= end {
                ranges.push((lo as u32, end as u32));
            }
        }
        RankSet { ranges }
    }

    pub fn count(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(start, end)| (end - start) as usize + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates the ranks in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Rank> + '_ {
        self.ranges
            .iter()
            .flat_map(|&(start, end)| (start..=end).map(Rank))
    }

    pub fn ranks(&self) -> Vec<Rank> {
        self.iter().collect()
    }

    /// Bracketed form, e.g. `[0-4,6]`.
    pub fn ranged_string(&self) -> String {
        format!("[{}]", self)
    }
}

impl fmt::Display for RankSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, &(start, end)) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        Ok(())
    }
}

impl FromStr for RankSet {
    type Err = SysdbError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| SysdbError::InvalidRankSet {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let mut body = s.trim();
        if let Some(stripped) = body.strip_prefix('[') {
            body = stripped
                .strip_suffix(']')
                .ok_or_else(|| invalid("unterminated bracket"))?;
        }
        if body.chars().any(|c| c.is_ascii_alphabetic()) {
            return Err(invalid("unexpected alphabetic character(s)"));
        }

        let mut set = RankSet::new();
        if body.trim().is_empty() {
            return Ok(set);
        }

        for token in body.split(',') {
            let token = token.trim();
            if token.is_empty() {
                return Err(invalid("empty range"));
            }
            let (lo, hi) = match token.split_once('-') {
                Some((lo, hi)) => (parse_rank(lo, &invalid)?, parse_rank(hi, &invalid)?),
                None => {
                    let r = parse_rank(token, &invalid)?;
                    (r, r)
                }
            };
            if lo > hi {
                return Err(invalid("range start is greater than range end"));
            }
            set.insert_range(lo, hi);
        }

        Ok(set)
    }
}

fn parse_rank(token: &str, invalid: &dyn Fn(&str) -> SysdbError) -> Result<u32> {
    let value: u32 = token
        .trim()
        .parse()
        .map_err(|_| invalid(&format!("invalid rank {:?}", token.trim())))?;
    if value > Rank::MAX.0 {
        return Err(invalid("rank exceeds maximum"));
    }
    Ok(value)
}

impl Serialize for RankSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RankSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl FromIterator<Rank> for RankSet {
    fn from_iter<I: IntoIterator<Item = Rank>>(iter: I) -> Self {
        RankSet::from_ranks(iter)
    }
}
