//! Arena-backed fault domain tree.

use super::{rank_from_level, FaultDomain};
use crate::error::{Result, SysdbError};
use crate::ranks::Rank;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// ID assigned to the root node of every tree.
pub const ROOT_ID: u32 = 1;

#[derive(Debug, Clone)]
pub(super) struct TreeNode {
    pub(super) domain: FaultDomain,
    pub(super) parent: Option<u32>,
    /// Child IDs, sorted by the child's bottom level.
    pub(super) children: Vec<u32>,
}

/// Rooted tree of fault domains.
///
/// Nodes live in an arena keyed by their integer ID. IDs are never reused
/// while a node exists; new branches take `max(existing) + 1` onwards. Rank
/// leaves are indexed by rank so members can be located without pointers
/// from the tree back to member records.
#[derive(Debug, Clone)]
pub struct FaultDomainTree {
    root: u32,
    pub(super) nodes: BTreeMap<u32, TreeNode>,
    rank_leaves: BTreeMap<Rank, u32>,
}

impl Default for FaultDomainTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultDomainTree {
    /// Empty tree whose root is the root domain.
    pub fn new() -> Self {
        Self::with_root(FaultDomain::root())
    }

    /// Empty tree rooted at an arbitrary domain.
    pub fn with_root(domain: FaultDomain) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_ID,
            TreeNode {
                domain,
                parent: None,
                children: Vec::new(),
            },
        );
        Self {
            root: ROOT_ID,
            nodes,
            rank_leaves: BTreeMap::new(),
        }
    }

    /// Builds a tree containing every supplied domain. Empty domains are
    /// ignored.
    pub fn from_domains<'a, I>(domains: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a FaultDomain>,
    {
        let mut tree = Self::new();
        for domain in domains {
            if domain.is_empty() {
                continue;
            }
            tree.add_domain(domain)?;
        }
        Ok(tree)
    }

    pub fn root_id(&self) -> u32 {
        self.root
    }

    pub fn root_domain(&self) -> &FaultDomain {
        // The root node is inserted at construction and never removed.
        &self.nodes[&self.root].domain
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the tree holds nothing but its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub(super) fn node(&self, id: u32) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    pub fn is_leaf(&self, id: u32) -> bool {
        self.nodes
            .get(&id)
            .map(|n| n.children.is_empty())
            .unwrap_or(false)
    }

    pub fn domain_of(&self, id: u32) -> Option<&FaultDomain> {
        self.nodes.get(&id).map(|n| &n.domain)
    }

    fn next_id(&self) -> u32 {
        self.nodes.keys().next_back().map(|id| id + 1).unwrap_or(ROOT_ID)
    }

    /// ID of the node holding exactly `domain`.
    pub fn find(&self, domain: &FaultDomain) -> Option<u32> {
        let root = self.root_domain();
        if !root.is_ancestor_of(domain) {
            return None;
        }
        let mut current = self.root;
        for level in &domain.levels()[root.num_levels()..] {
            let node = self.nodes.get(&current)?;
            current = *node
                .children
                .iter()
                .find(|id| self.nodes.get(id).map(|c| c.domain.bottom_level()) == Some(level.as_str()))?;
        }
        Some(current)
    }

    /// Whether the label of `domain`'s bottom level is compatible with `other`.
    fn check_labels(existing: &FaultDomain, incoming: &FaultDomain) -> Result<()> {
        match (existing.bottom_label(), incoming.bottom_label()) {
            (None, None) => Ok(()),
            (Some(a), Some(b)) if a == b => Ok(()),
            (Some(a), Some(b)) => Err(SysdbError::FaultDomainTree(format!(
                "label {:?} of {} conflicts with label {:?} of {}",
                b, incoming, a, existing
            ))),
            _ => Err(SysdbError::FaultDomainTree(format!(
                "label presence of {} does not match {}",
                incoming, existing
            ))),
        }
    }

    /// Inserts `domain`, creating any missing branches.
    pub fn add_domain(&mut self, domain: &FaultDomain) -> Result<()> {
        if domain.is_empty() {
            return Err(SysdbError::FaultDomainTree(
                "can't add empty fault domain to tree".to_string(),
            ));
        }
        let root_levels = self.root_domain().num_levels();
        if !self.root_domain().is_ancestor_of(domain) || domain.num_levels() == root_levels {
            return Err(SysdbError::FaultDomainTree(format!(
                "fault domain {} is not below tree root {}",
                domain,
                self.root_domain()
            )));
        }

        // Validate the whole path before touching the arena.
        let mut current = Some(self.root);
        for depth in root_levels + 1..=domain.num_levels() {
            let step = domain.prefix(depth);
            let Some(parent_id) = current else { break };
            let parent = &self.nodes[&parent_id];
            let matched = parent
                .children
                .iter()
                .copied()
                .find(|id| self.nodes[id].domain.bottom_level() == step.bottom_level());
            match matched {
                Some(id) => {
                    Self::check_labels(&self.nodes[&id].domain, &step)?;
                    current = Some(id);
                }
                None => {
                    if let Some(sibling) = parent.children.first() {
                        Self::check_labels(&self.nodes[sibling].domain, &step)?;
                    }
                    current = None;
                }
            }
        }

        let mut current = self.root;
        for depth in root_levels + 1..=domain.num_levels() {
            let step = domain.prefix(depth);
            let matched = self.nodes[&current]
                .children
                .iter()
                .copied()
                .find(|id| self.nodes[id].domain.bottom_level() == step.bottom_level());
            current = match matched {
                Some(id) => id,
                None => self.insert_child(current, step),
            };
        }
        Ok(())
    }

    fn insert_child(&mut self, parent_id: u32, domain: FaultDomain) -> u32 {
        let id = self.next_id();
        let rank = rank_from_level(domain.bottom_level());
        let bottom = domain.bottom_level().to_string();
        self.nodes.insert(
            id,
            TreeNode {
                domain,
                parent: Some(parent_id),
                children: Vec::new(),
            },
        );

        let pos = {
            let parent = &self.nodes[&parent_id];
            parent
                .children
                .partition_point(|c| self.nodes[c].domain.bottom_level() < bottom.as_str())
        };
        if let Some(parent) = self.nodes.get_mut(&parent_id) {
            parent.children.insert(pos, id);
            // A rank-named node stops being a rank leaf once it has children.
            if let Some(parent_rank) = rank_from_level(parent.domain.bottom_level()) {
                if self.rank_leaves.get(&parent_rank) == Some(&parent_id) {
                    self.rank_leaves.remove(&parent_rank);
                }
            }
        }
        if let Some(rank) = rank {
            self.rank_leaves.insert(rank, id);
        }
        id
    }

    /// Merges every branch of `other` into this tree. On error the tree is
    /// left unchanged.
    pub fn merge(&mut self, other: &FaultDomainTree) -> Result<()> {
        if self.root_domain() != other.root_domain() {
            return Err(SysdbError::FaultDomainTree(format!(
                "trees cannot be merged: root {} differs from {}",
                other.root_domain(),
                self.root_domain()
            )));
        }

        let mut merged = self.clone();
        let mut queue: VecDeque<u32> = other.nodes[&other.root].children.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            let node = &other.nodes[&id];
            merged.add_domain(&node.domain)?;
            queue.extend(node.children.iter().copied());
        }
        *self = merged;
        Ok(())
    }

    /// Removes `domain` and everything beneath it. Absent domains are ignored.
    pub fn remove_domain(&mut self, domain: &FaultDomain) -> Result<()> {
        if domain == self.root_domain() {
            return Err(SysdbError::FaultDomainTree(
                "cannot remove root fault domain from tree".to_string(),
            ));
        }
        let Some(id) = self.find(domain) else {
            return Ok(());
        };

        let mut doomed = vec![id];
        let mut i = 0;
        while i < doomed.len() {
            if let Some(node) = self.nodes.get(&doomed[i]) {
                doomed.extend(node.children.iter().copied());
            }
            i += 1;
        }

        let parent_id = self.nodes.get(&id).and_then(|n| n.parent);
        for gone in &doomed {
            self.nodes.remove(gone);
        }
        self.rank_leaves.retain(|_, leaf| !doomed.contains(leaf));

        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.nodes.get_mut(&parent_id) {
                parent.children.retain(|c| *c != id);
                if parent.children.is_empty() && parent.parent.is_some() {
                    if let Some(rank) = rank_from_level(parent.domain.bottom_level()) {
                        self.rank_leaves.insert(rank, parent_id);
                    }
                }
            }
        }
        Ok(())
    }

    fn height_of(&self, id: u32) -> usize {
        self.nodes
            .get(&id)
            .map(|n| {
                n.children
                    .iter()
                    .map(|c| self.height_of(*c) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Number of edges on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        self.height_of(self.root)
    }

    /// True if every leaf sits at the same depth.
    pub fn is_balanced(&self) -> bool {
        let mut leaf_depths = BTreeSet::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                if node.children.is_empty() {
                    leaf_depths.insert(depth);
                }
                stack.extend(node.children.iter().map(|c| (*c, depth + 1)));
            }
        }
        leaf_depths.len() <= 1
    }

    /// Domains of every leaf, in sorted traversal order. A tree holding only
    /// its root has no leaf domains.
    pub fn domains(&self) -> Vec<FaultDomain> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[&id];
            if node.children.is_empty() {
                if id != self.root {
                    out.push(node.domain.clone());
                }
                continue;
            }
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// ID of the leaf holding `rank`.
    pub fn rank_leaf(&self, rank: Rank) -> Option<u32> {
        self.rank_leaves.get(&rank).copied()
    }

    /// Ranks with a leaf in the tree.
    pub fn ranks(&self) -> Vec<Rank> {
        self.rank_leaves.keys().copied().collect()
    }

    /// Minimal connected subtree covering `domains`, keeping original IDs.
    pub fn subtree(&self, domains: &[FaultDomain]) -> Result<FaultDomainTree> {
        let mut ids = Vec::with_capacity(domains.len());
        for domain in domains {
            let id = self.find(domain).ok_or_else(|| {
                SysdbError::FaultDomainTree(format!("fault domain {} not found in tree", domain))
            })?;
            ids.push(id);
        }
        Ok(self.subtree_of_ids(&ids))
    }

    /// Minimal connected subtree covering the leaves of `ranks`.
    pub fn subtree_for_ranks(&self, ranks: &[Rank]) -> Result<FaultDomainTree> {
        let mut ids = Vec::with_capacity(ranks.len());
        for rank in ranks {
            ids.push(self.rank_leaf(*rank).ok_or(SysdbError::RankNotFound(*rank))?);
        }
        Ok(self.subtree_of_ids(&ids))
    }

    fn subtree_of_ids(&self, ids: &[u32]) -> FaultDomainTree {
        let mut keep = BTreeSet::new();
        for id in ids {
            let mut cursor = Some(*id);
            while let Some(current) = cursor {
                if !keep.insert(current) {
                    break;
                }
                cursor = self.nodes.get(&current).and_then(|n| n.parent);
            }
        }
        keep.insert(self.root);

        let nodes = keep
            .iter()
            .filter_map(|id| {
                self.nodes.get(id).map(|node| {
                    let mut node = node.clone();
                    node.children.retain(|c| keep.contains(c));
                    (*id, node)
                })
            })
            .collect::<BTreeMap<_, _>>();
        let rank_leaves = self
            .rank_leaves
            .iter()
            .filter(|(_, id)| keep.contains(*id))
            .map(|(r, id)| (*r, *id))
            .collect();

        FaultDomainTree {
            root: self.root,
            nodes,
            rank_leaves,
        }
    }

    /// Every node ID paired with its domain, in ID order.
    pub fn node_ids(&self) -> Vec<(u32, FaultDomain)> {
        self.nodes
            .iter()
            .map(|(id, n)| (*id, n.domain.clone()))
            .collect()
    }

    fn structurally_equal(&self, a: u32, other: &FaultDomainTree, b: u32) -> bool {
        match (self.nodes.get(&a), other.nodes.get(&b)) {
            (Some(x), Some(y)) => {
                x.domain == y.domain
                    && x.children.len() == y.children.len()
                    && x
                        .children
                        .iter()
                        .zip(&y.children)
                        .all(|(c, d)| self.structurally_equal(*c, other, *d))
            }
            _ => false,
        }
    }

    /// Nested form used in snapshots.
    pub fn to_wire(&self) -> FaultDomainTreeWire {
        fn build(tree: &FaultDomainTree, id: u32) -> FaultDomainTreeWire {
            let node = &tree.nodes[&id];
            FaultDomainTreeWire {
                domain: node.domain.to_string(),
                id,
                children: node.children.iter().map(|c| build(tree, *c)).collect(),
            }
        }
        build(self, self.root)
    }

    /// Rebuilds a tree from its nested snapshot form, preserving IDs.
    pub fn from_wire(wire: &FaultDomainTreeWire) -> Result<Self> {
        let root_domain: FaultDomain = wire.domain.parse()?;
        let mut tree = FaultDomainTree {
            root: wire.id,
            nodes: BTreeMap::new(),
            rank_leaves: BTreeMap::new(),
        };

        let mut queue = VecDeque::from([(wire, None::<u32>, root_domain)]);
        while let Some((node, parent, domain)) = queue.pop_front() {
            if tree.nodes.contains_key(&node.id) {
                return Err(SysdbError::FaultDomainTree(format!(
                    "duplicate node ID {} in serialized tree",
                    node.id
                )));
            }
            let mut children = Vec::with_capacity(node.children.len());
            for child in &node.children {
                let child_domain: FaultDomain = child.domain.parse()?;
                if child_domain.num_levels() != domain.num_levels() + 1
                    || !domain.is_ancestor_of(&child_domain)
                {
                    return Err(SysdbError::FaultDomainTree(format!(
                        "serialized node {} is not a child of {}",
                        child_domain, domain
                    )));
                }
                children.push(child.id);
                queue.push_back((child, Some(node.id), child_domain));
            }
            if children.is_empty() && parent.is_some() {
                if let Some(rank) = rank_from_level(domain.bottom_level()) {
                    tree.rank_leaves.insert(rank, node.id);
                }
            }
            tree.nodes.insert(
                node.id,
                TreeNode {
                    domain,
                    parent,
                    children,
                },
            );
        }

        // Keep the children ordering invariant regardless of input order.
        let order: BTreeMap<u32, String> = tree
            .nodes
            .iter()
            .map(|(id, n)| (*id, n.domain.bottom_level().to_string()))
            .collect();
        for node in tree.nodes.values_mut() {
            node.children.sort_by(|a, b| order[a].cmp(&order[b]));
        }
        Ok(tree)
    }
}

impl PartialEq for FaultDomainTree {
    fn eq(&self, other: &Self) -> bool {
        self.structurally_equal(self.root, other, other.root)
    }
}

impl Eq for FaultDomainTree {}

impl fmt::Display for FaultDomainTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FaultDomainTree:")?;
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, indent)) = stack.pop() {
            let node = &self.nodes[&id];
            let label = if id == self.root {
                node.domain.to_string()
            } else {
                node.domain.bottom_level().to_string()
            };
            writeln!(f, "{:width$}- {}", "", label, width = indent * 2)?;
            stack.extend(node.children.iter().rev().map(|c| (*c, indent + 1)));
        }
        Ok(())
    }
}

/// Serialized tree node: `{"Domain": "/rack0", "ID": 2, "Children": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FaultDomainTreeWire {
    pub domain: String,
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(default)]
    pub children: Vec<FaultDomainTreeWire>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd(s: &str) -> FaultDomain {
        s.parse().unwrap()
    }

    fn tree(domains: &[&str]) -> FaultDomainTree {
        let domains: Vec<FaultDomain> = domains.iter().map(|d| fd(d)).collect();
        FaultDomainTree::from_domains(&domains).unwrap()
    }

    #[test]
    fn test_new_tree_is_root_only() {
        let t = FaultDomainTree::new();
        assert!(t.is_empty());
        assert!(t.is_leaf(ROOT_ID));
        assert_eq!(t.depth(), 0);
        assert!(t.domains().is_empty());
        assert_eq!(t.to_string(), "FaultDomainTree:\n- /\n");
    }

    #[test]
    fn test_from_domains_ignores_empty() {
        let t = FaultDomainTree::from_domains(&[FaultDomain::root()]).unwrap();
        assert!(t.is_empty());
    }

    #[test]
    fn test_add_domain_empty_fails() {
        let mut t = FaultDomainTree::new();
        let err = t.add_domain(&FaultDomain::root()).unwrap_err();
        assert!(err.to_string().contains("can't add empty fault domain to tree"));
    }

    #[test]
    fn test_children_sorted_by_bottom_level() {
        let t = tree(&["/one/two/three", "/four/five", "/four/six"]);
        assert_eq!(
            t.to_string(),
            "FaultDomainTree:\n- /\n  - four\n    - five\n    - six\n  - one\n    - two\n      - three\n"
        );
    }

    #[test]
    fn test_display_multiple_layers() {
        let t = tree(&[
            "/one/two/three",
            "/one/two/four",
            "/one/five",
            "/two/six/seven",
            "/two/eight/nine",
            "/two/eight/ten/eleven",
        ]);
        let expected = "FaultDomainTree:
- /
  - one
    - five
    - two
      - four
      - three
  - two
    - eight
      - nine
      - ten
        - eleven
    - six
      - seven
";
        assert_eq!(t.to_string(), expected);
    }

    #[test]
    fn test_display_non_root_top_level() {
        let mut t = FaultDomainTree::with_root(fd("/extra/layer"));
        t.add_domain(&fd("/extra/layer/one")).unwrap();
        t.add_domain(&fd("/extra/layer/two")).unwrap();
        assert_eq!(t.to_string(), "FaultDomainTree:\n- /extra/layer\n  - one\n  - two\n");
    }

    #[test]
    fn test_ids_assigned_top_down() {
        let t = tree(&["/rack0/pdu0/rank0", "/rack0/pdu1/rank1"]);
        assert_eq!(t.find(&fd("/rack0")), Some(2));
        assert_eq!(t.find(&fd("/rack0/pdu0")), Some(3));
        assert_eq!(t.find(&fd("/rack0/pdu0/rank0")), Some(4));
        assert_eq!(t.find(&fd("/rack0/pdu1")), Some(5));
        assert_eq!(t.find(&fd("/rack0/pdu1/rank1")), Some(6));
    }

    #[test]
    fn test_add_overlapping_domain_is_noop() {
        let mut t = tree(&["/rack0/node1"]);
        let before = t.clone();
        t.add_domain(&fd("/rack0")).unwrap();
        assert_eq!(t, before);
        assert_eq!(t.len(), before.len());
    }

    #[test]
    fn test_domains_are_input_leaves() {
        let a = tree(&["/b/x", "/a/y", "/a/z"]);
        let b = tree(&["/a/z", "/b/x", "/a/y"]);
        assert_eq!(a.domains(), vec![fd("/a/y"), fd("/a/z"), fd("/b/x")]);
        assert_eq!(a.domains(), b.domains());
        assert_eq!(a, b);
    }

    #[test]
    fn test_clone_is_disjoint() {
        let original = tree(&["/rack0/node1"]);
        let mut copy = original.clone();
        assert_eq!(copy, original);
        copy.add_domain(&fd("/rack1/node2")).unwrap();
        assert_ne!(copy, original);
        assert_eq!(original.domains(), vec![fd("/rack0/node1")]);
    }

    #[test]
    fn test_merge_into_self_is_noop() {
        let mut t = tree(&["/rack0/node1", "/rack0/node2", "/rack1/node3"]);
        let copy = t.clone();
        t.merge(&copy).unwrap();
        assert_eq!(t, copy);
        assert_eq!(t.node_ids(), copy.node_ids());
    }

    #[test]
    fn test_merge_disjoint_trees_into_empty() {
        let left = tree(&["/rack0/node1", "/rack0/node2"]);
        let right = tree(&["/rack1/node3", "/rack1/node4"]);
        let mut merged = FaultDomainTree::new();
        merged.merge(&left).unwrap();
        merged.merge(&right).unwrap();
        assert_eq!(
            merged,
            tree(&["/rack0/node1", "/rack0/node2", "/rack1/node3", "/rack1/node4"])
        );
    }

    #[test]
    fn test_merge_empty_is_noop() {
        let mut t = tree(&["/rack0"]);
        let before = t.clone();
        t.merge(&FaultDomainTree::new()).unwrap();
        assert_eq!(t, before);
    }

    #[test]
    fn test_merge_different_roots_fails() {
        let mut t = FaultDomainTree::new();
        let other = FaultDomainTree::with_root(fd("/rack0"));
        let err = t.merge(&other).unwrap_err();
        assert!(err.to_string().contains("trees cannot be merged"));
    }

    #[test]
    fn test_merge_label_presence_mismatch_fails() {
        let mut t = tree(&["/rack0/node1"]);
        let before = t.clone();
        let other = tree(&["/rack=rack0/node=node2"]);
        assert!(t.merge(&other).is_err());
        assert_eq!(t, before);
    }

    #[test]
    fn test_sibling_label_conflict_fails() {
        let mut t = tree(&["/rack=r0/node=n0"]);
        let err = t.add_domain(&fd("/node=n1/rack=r1")).unwrap_err();
        assert!(matches!(err, SysdbError::FaultDomainTree(_)));
        assert_eq!(t.domains(), vec![fd("/rack=r0/node=n0")]);
        t.add_domain(&fd("/rack=r1/node=n1")).unwrap();
    }

    #[test]
    fn test_remove_root_fails() {
        let mut t = tree(&["/rack0", "/rack1"]);
        let err = t.remove_domain(&FaultDomain::root()).unwrap_err();
        assert!(err.to_string().contains("cannot remove root fault domain from tree"));
    }

    #[test]
    fn test_remove_leaf_and_branch() {
        let mut t = tree(&["/rack0/node1", "/rack0/node2", "/rack1/node3", "/rack1/node4"]);
        t.remove_domain(&fd("/rack0/node2")).unwrap();
        assert_eq!(t, tree(&["/rack0/node1", "/rack1/node3", "/rack1/node4"]));
        t.remove_domain(&fd("/rack1")).unwrap();
        assert_eq!(t, tree(&["/rack0/node1"]));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut t = tree(&["/rack0/node1", "/rack0/node2"]);
        let before = t.clone();
        t.remove_domain(&fd("/rack0/node3")).unwrap();
        t.remove_domain(&fd("/rack1")).unwrap();
        assert_eq!(t, before);
    }

    #[test]
    fn test_is_balanced() {
        assert!(FaultDomainTree::new().is_balanced());
        assert!(tree(&["/one/long/road"]).is_balanced());
        assert!(!tree(&["/one/long/road", "/short/road"]).is_balanced());
        assert!(tree(&["/high/road", "/low/road"]).is_balanced());
        assert!(!tree(&["/take/the/high/road", "/take/the/low/road/and/beyond"]).is_balanced());
        assert!(tree(&[
            "/one/two/three",
            "/one/two/four",
            "/one/six/seven",
            "/every/good/boy",
            "/every/bad/dog",
        ])
        .is_balanced());
    }

    #[test]
    fn test_depth() {
        assert_eq!(tree(&["/a/b/c", "/d"]).depth(), 3);
    }

    #[test]
    fn test_ids_not_reused_after_remove() {
        let mut t = tree(&["/rack0", "/rack1"]);
        t.remove_domain(&fd("/rack0")).unwrap();
        t.add_domain(&fd("/rack2")).unwrap();
        assert_eq!(t.find(&fd("/rack2")), Some(4));
    }

    #[test]
    fn test_rank_leaf_index() {
        let mut t = tree(&["/rack0/rank0", "/rack1/rank1"]);
        assert_eq!(t.rank_leaf(Rank(1)), t.find(&fd("/rack1/rank1")));
        t.remove_domain(&fd("/rack1/rank1")).unwrap();
        assert_eq!(t.rank_leaf(Rank(1)), None);
        assert_eq!(t.ranks(), vec![Rank(0)]);

        // A rank-named node with children is not a rank leaf.
        let t = tree(&["/rank2/rank3"]);
        assert_eq!(t.ranks(), vec![Rank(3)]);
    }

    #[test]
    fn test_subtree_preserves_ids() {
        let t = tree(&["/rack0/pdu0/rank0", "/rack0/pdu1/rank1", "/rack1/pdu2/rank2"]);
        let sub = t.subtree_for_ranks(&[Rank(2)]).unwrap();
        assert_eq!(sub.domains(), vec![fd("/rack1/pdu2/rank2")]);
        assert_eq!(sub.find(&fd("/rack1/pdu2/rank2")), t.find(&fd("/rack1/pdu2/rank2")));
        assert_eq!(sub.root_id(), ROOT_ID);

        let err = t.subtree_for_ranks(&[Rank(100)]).unwrap_err();
        assert_eq!(err.to_string(), "rank 100 not found");
        assert!(t.subtree(&[fd("/rack9")]).is_err());
    }

    #[test]
    fn test_wire_round_trip_keeps_ids() {
        let mut t = tree(&["/rack0/rank0", "/rack1/rank1"]);
        t.remove_domain(&fd("/rack0")).unwrap();
        t.add_domain(&fd("/rack2/rank2")).unwrap();

        let json = serde_json::to_string(&t.to_wire()).unwrap();
        let wire: FaultDomainTreeWire = serde_json::from_str(&json).unwrap();
        let back = FaultDomainTree::from_wire(&wire).unwrap();
        assert_eq!(back, t);
        assert_eq!(back.node_ids(), t.node_ids());
        assert_eq!(back.rank_leaf(Rank(2)), t.rank_leaf(Rank(2)));
    }

    #[test]
    fn test_from_wire_rejects_inconsistent_nodes() {
        let wire = FaultDomainTreeWire {
            domain: "/".to_string(),
            id: 1,
            children: vec![FaultDomainTreeWire {
                domain: "/a/b".to_string(),
                id: 2,
                children: vec![],
            }],
        };
        assert!(FaultDomainTree::from_wire(&wire).is_err());
    }
}
