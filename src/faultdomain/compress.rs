//! Flat `u32` encoding of a fault domain tree for broadcast to engines.
//!
//! Layout: `[metadata, level, id, child_count, ..., rank, ...]`. Nodes are
//! emitted breadth-first, one layer at a time. Each non-rank node contributes
//! a triple whose level is shared by its whole layer, counting down from
//! `depth - 1` at the root; each rank leaf contributes only its rank number.

use super::rank_from_level;
use super::tree::FaultDomainTree;
use std::collections::VecDeque;

/// Set when the tree carries fault domains.
pub const COMPRESS_HAS_FAULT_DOMAIN: u32 = 1 << 0;
/// Set when the tree has a layer beyond (fault domain + rank).
pub const COMPRESS_HAS_PERF_DOMAIN: u32 = 1 << 1;

const MIN_DOMAIN_DEPTH: usize = 2;

impl FaultDomainTree {
    /// Metadata word describing the shape of the tree.
    pub fn compress_metadata(&self) -> u32 {
        let depth = self.depth();
        let mut metadata = 0;
        if depth > 0 {
            metadata |= COMPRESS_HAS_FAULT_DOMAIN;
        }
        if depth > MIN_DOMAIN_DEPTH {
            metadata |= COMPRESS_HAS_PERF_DOMAIN;
        }
        metadata
    }

    /// Breadth-first flat encoding of the tree.
    pub fn compress(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(1 + self.len() * 3);
        out.push(self.compress_metadata());

        let mut level = self.depth().saturating_sub(1) as u32;
        let mut queue = VecDeque::from([self.root_id()]);
        while !queue.is_empty() {
            let layer_size = queue.len();
            for _ in 0..layer_size {
                let Some(id) = queue.pop_front() else { break };
                let Some(node) = self.node(id) else { continue };
                let rank = if node.children.is_empty() && node.parent.is_some() {
                    rank_from_level(node.domain.bottom_level())
                } else {
                    None
                };
                match rank {
                    Some(rank) => out.push(rank.0),
                    None => {
                        out.push(level);
                        out.push(id);
                        out.push(node.children.len() as u32);
                    }
                }
                queue.extend(node.children.iter().copied());
            }
            level = level.saturating_sub(1);
        }
        out
    }
}
