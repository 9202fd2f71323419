//! The region forest arena.
//!
//! Alternating region and partition nodes, named by [`NodeId`]. The arena
//! is built up front by the embedding runtime and queried concurrently by
//! the analyzers behind a read-write lock; structural mutation after
//! analysis has begun is limited to adding new sub-trees.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use weft_types::{Color, PartitionHandle, RegionHandle, TreeId};

use crate::expr::IndexSpaceExpr;
use crate::path::RegionTreePath;

/// Arena handle of a forest node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone)]
enum NodeKind {
    Region { handle: RegionHandle },
    Partition { handle: PartitionHandle, disjoint: bool },
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    /// Color of this node within its parent.
    color: Color,
    children: BTreeMap<Color, NodeId>,
    expr: IndexSpaceExpr,
    depth: u32,
    tree_id: TreeId,
}

#[derive(Default)]
struct ForestInner {
    nodes: Vec<NodeData>,
    regions: HashMap<RegionHandle, NodeId>,
    partitions: HashMap<PartitionHandle, NodeId>,
}

/// The region forest: an arena of region and partition nodes.
#[derive(Default)]
pub struct RegionTreeForest {
    inner: RwLock<ForestInner>,
}

impl RegionTreeForest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the root region of a new tree covering `expr`.
    pub fn create_region_tree(
        &self,
        handle: RegionHandle,
        expr: IndexSpaceExpr,
    ) -> NodeId {
        let mut inner = self.inner.write();
        let id = NodeId(inner.nodes.len() as u32);
        inner.nodes.push(NodeData {
            kind: NodeKind::Region { handle },
            parent: None,
            color: Color(0),
            children: BTreeMap::new(),
            expr,
            depth: 0,
            tree_id: handle.tree_id,
        });
        inner.regions.insert(handle, id);
        id
    }

    /// Create a partition of `parent` (a region node) with the given color.
    ///
    /// `disjoint` declares that all children of this partition are pairwise
    /// disjoint; the analyzers trust the declaration.
    pub fn create_partition(
        &self,
        parent: NodeId,
        color: Color,
        handle: PartitionHandle,
        disjoint: bool,
    ) -> NodeId {
        let mut inner = self.inner.write();
        debug_assert!(matches!(
            inner.nodes[parent.0 as usize].kind,
            NodeKind::Region { .. }
        ));
        let depth = inner.nodes[parent.0 as usize].depth + 1;
        let tree_id = inner.nodes[parent.0 as usize].tree_id;
        let id = NodeId(inner.nodes.len() as u32);
        inner.nodes.push(NodeData {
            kind: NodeKind::Partition { handle, disjoint },
            parent: Some(parent),
            color,
            children: BTreeMap::new(),
            expr: IndexSpaceExpr::empty(),
            depth,
            tree_id,
        });
        inner.nodes[parent.0 as usize].children.insert(color, id);
        inner.partitions.insert(handle, id);
        id
    }

    /// Create a child region of `parent` (a partition node) covering `expr`.
    pub fn create_child_region(
        &self,
        parent: NodeId,
        color: Color,
        handle: RegionHandle,
        expr: IndexSpaceExpr,
    ) -> NodeId {
        let mut inner = self.inner.write();
        debug_assert!(matches!(
            inner.nodes[parent.0 as usize].kind,
            NodeKind::Partition { .. }
        ));
        let depth = inner.nodes[parent.0 as usize].depth + 1;
        let tree_id = inner.nodes[parent.0 as usize].tree_id;
        let id = NodeId(inner.nodes.len() as u32);
        inner.nodes.push(NodeData {
            kind: NodeKind::Region { handle },
            parent: Some(parent),
            color,
            children: BTreeMap::new(),
            expr: expr.clone(),
            depth,
            tree_id,
        });
        inner.nodes[parent.0 as usize].children.insert(color, id);
        // A partition's expression is the union of its children.
        let partition_expr = inner.nodes[parent.0 as usize].expr.union(&expr);
        inner.nodes[parent.0 as usize].expr = partition_expr;
        inner.regions.insert(handle, id);
        id
    }

    #[must_use]
    pub fn is_region(&self, node: NodeId) -> bool {
        matches!(
            self.inner.read().nodes[node.0 as usize].kind,
            NodeKind::Region { .. }
        )
    }

    #[must_use]
    pub fn get_parent(&self, node: NodeId) -> Option<NodeId> {
        self.inner.read().nodes[node.0 as usize].parent
    }

    #[must_use]
    pub fn depth(&self, node: NodeId) -> u32 {
        self.inner.read().nodes[node.0 as usize].depth
    }

    #[must_use]
    pub fn tree_id(&self, node: NodeId) -> TreeId {
        self.inner.read().nodes[node.0 as usize].tree_id
    }

    /// Color of `node` within its parent.
    #[must_use]
    pub fn color_of(&self, node: NodeId) -> Color {
        self.inner.read().nodes[node.0 as usize].color
    }

    #[must_use]
    pub fn get_tree_child(&self, node: NodeId, color: Color) -> Option<NodeId> {
        self.inner.read().nodes[node.0 as usize]
            .children
            .get(&color)
            .copied()
    }

    /// All `(color, child)` pairs of `node`, ascending by color.
    #[must_use]
    pub fn children(&self, node: NodeId) -> Vec<(Color, NodeId)> {
        self.inner.read().nodes[node.0 as usize]
            .children
            .iter()
            .map(|(&c, &n)| (c, n))
            .collect()
    }

    /// The index-space expression covered by `node`.
    #[must_use]
    pub fn expr(&self, node: NodeId) -> IndexSpaceExpr {
        self.inner.read().nodes[node.0 as usize].expr.clone()
    }

    /// Whether `node` covers every point of `other`.
    #[must_use]
    pub fn dominates(&self, node: NodeId, other: NodeId) -> bool {
        let inner = self.inner.read();
        inner.nodes[node.0 as usize]
            .expr
            .dominates(&inner.nodes[other.0 as usize].expr)
    }

    /// Whether `node` and `other` share a point.
    #[must_use]
    pub fn intersects_with(&self, node: NodeId, other: NodeId) -> bool {
        let inner = self.inner.read();
        inner.nodes[node.0 as usize]
            .expr
            .intersects(&inner.nodes[other.0 as usize].expr)
    }

    /// Whether `node` is a partition whose children are pairwise disjoint.
    #[must_use]
    pub fn are_all_children_disjoint(&self, node: NodeId) -> bool {
        match self.inner.read().nodes[node.0 as usize].kind {
            NodeKind::Partition { disjoint, .. } => disjoint,
            NodeKind::Region { .. } => false,
        }
    }

    #[must_use]
    pub fn region_handle(&self, node: NodeId) -> Option<RegionHandle> {
        match self.inner.read().nodes[node.0 as usize].kind {
            NodeKind::Region { handle } => Some(handle),
            NodeKind::Partition { .. } => None,
        }
    }

    #[must_use]
    pub fn partition_handle(&self, node: NodeId) -> Option<PartitionHandle> {
        match self.inner.read().nodes[node.0 as usize].kind {
            NodeKind::Partition { handle, .. } => Some(handle),
            NodeKind::Region { .. } => None,
        }
    }

    #[must_use]
    pub fn find_region(&self, handle: RegionHandle) -> Option<NodeId> {
        self.inner.read().regions.get(&handle).copied()
    }

    #[must_use]
    pub fn find_partition(&self, handle: PartitionHandle) -> Option<NodeId> {
        self.inner.read().partitions.get(&handle).copied()
    }

    /// Total number of nodes in the arena.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Root region of every tree in the forest.
    #[must_use]
    pub fn roots(&self) -> Vec<NodeId> {
        let inner = self.inner.read();
        inner
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, data)| data.parent.is_none())
            .map(|(idx, _)| NodeId(idx as u32))
            .collect()
    }

    /// Build the path from `ancestor` down to `descendant`, recording the
    /// child color taken at every depth. Returns `None` if `ancestor` is
    /// not on `descendant`'s parent chain.
    #[must_use]
    pub fn initialize_path(&self, descendant: NodeId, ancestor: NodeId) -> Option<RegionTreePath> {
        let inner = self.inner.read();
        let top = inner.nodes[ancestor.0 as usize].depth;
        let bottom = inner.nodes[descendant.0 as usize].depth;
        if bottom < top {
            return None;
        }
        let mut path = RegionTreePath::new(top, bottom);
        let mut current = descendant;
        while current != ancestor {
            let data = &inner.nodes[current.0 as usize];
            let parent = data.parent?;
            path.register_child(inner.nodes[parent.0 as usize].depth, data.color);
            current = parent;
        }
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_handle(tree: u32, ispace: u64) -> RegionHandle {
        RegionHandle {
            tree_id: TreeId(tree),
            index_space: ispace,
            field_space: 0,
        }
    }

    fn partition_handle(tree: u32, ipart: u64) -> PartitionHandle {
        PartitionHandle {
            tree_id: TreeId(tree),
            index_partition: ipart,
            field_space: 0,
        }
    }

    /// Root [0,99] partitioned into two disjoint halves.
    fn two_way_forest() -> (RegionTreeForest, NodeId, NodeId, NodeId, NodeId) {
        let forest = RegionTreeForest::new();
        let root = forest.create_region_tree(region_handle(1, 0), IndexSpaceExpr::interval(0, 99));
        let part = forest.create_partition(root, Color(0), partition_handle(1, 0), true);
        let left = forest.create_child_region(
            part,
            Color(0),
            region_handle(1, 1),
            IndexSpaceExpr::interval(0, 49),
        );
        let right = forest.create_child_region(
            part,
            Color(1),
            region_handle(1, 2),
            IndexSpaceExpr::interval(50, 99),
        );
        (forest, root, part, left, right)
    }

    #[test]
    fn test_structure_queries() {
        let (forest, root, part, left, right) = two_way_forest();
        assert!(forest.is_region(root));
        assert!(!forest.is_region(part));
        assert_eq!(forest.depth(root), 0);
        assert_eq!(forest.depth(part), 1);
        assert_eq!(forest.depth(left), 2);
        assert_eq!(forest.get_parent(left), Some(part));
        assert_eq!(forest.get_tree_child(part, Color(1)), Some(right));
        assert!(forest.are_all_children_disjoint(part));
        assert_eq!(forest.children(part).len(), 2);
    }

    #[test]
    fn test_dominance_and_intersection() {
        let (forest, root, part, left, right) = two_way_forest();
        assert!(forest.dominates(root, left));
        assert!(!forest.dominates(left, root));
        assert!(!forest.intersects_with(left, right));
        assert!(forest.intersects_with(root, right));
        // Partition expression accumulates its children.
        assert_eq!(forest.expr(part), IndexSpaceExpr::interval(0, 99));
    }

    #[test]
    fn test_initialize_path() {
        let (forest, root, part, left, _right) = two_way_forest();
        let path = forest.initialize_path(left, root).unwrap();
        assert_eq!(path.min_depth(), 0);
        assert_eq!(path.max_depth(), 2);
        assert_eq!(path.get_child(0), Some(Color(0)));
        assert_eq!(path.get_child(1), Some(Color(0)));
        assert!(!path.has_child(2));
        // Degenerate path: node to itself.
        let self_path = forest.initialize_path(root, root).unwrap();
        assert!(!self_path.has_child(0));
        // Not an ancestor.
        assert!(forest.initialize_path(root, part).is_none());
    }
}
