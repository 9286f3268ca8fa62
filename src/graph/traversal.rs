//! Graph traversal utilities: orderings, height statistics, parent index.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::graph::graph::Graph;
use crate::graph::node::{NodeData, NodeId};

/// Nodes reachable from `roots`, children before parents.
///
/// Shared nodes appear exactly once. The walk is iterative so chain depth is
/// bounded only by memory, not the call stack.
pub fn postorder(graph: &Graph, roots: &[NodeId]) -> Vec<NodeId> {
    let nodes = graph.nodes.borrow();
    let mut result = Vec::new();
    let mut visited = FxHashSet::default();
    // (node, children already pushed)
    let mut stack: Vec<(NodeId, bool)> = roots.iter().rev().map(|&r| (r, false)).collect();
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            result.push(id);
            continue;
        }
        if !visited.insert(id) {
            continue;
        }
        stack.push((id, true));
        if let NodeData::Func { args, .. } = &nodes[id.0] {
            for &arg in args.iter().rev() {
                if !visited.contains(&arg) {
                    stack.push((arg, false));
                }
            }
        }
    }
    result
}

/// The set of nodes reachable from `roots`.
pub fn reachable(graph: &Graph, roots: &[NodeId]) -> FxHashSet<NodeId> {
    postorder(graph, roots).into_iter().collect()
}

/// Per-node subgraph heights: 0 for leaves, `1 + max(child heights)` for
/// functors. Computed once over the reachable set.
pub struct GraphStat {
    heights: FxHashMap<NodeId, usize>,
    order: Vec<NodeId>,
}

impl GraphStat {
    pub fn new(graph: &Graph, roots: &[NodeId]) -> Self {
        let order = postorder(graph, roots);
        let nodes = graph.nodes.borrow();
        let mut heights = FxHashMap::default();
        for &id in &order {
            let h = match &nodes[id.0] {
                NodeData::Leaf { .. } => 0,
                NodeData::Func { args, .. } => {
                    1 + args.iter().map(|a| heights[a]).max().unwrap_or(0)
                }
            };
            heights.insert(id, h);
        }
        GraphStat { heights, order }
    }

    /// Height of a node in the walked set.
    ///
    /// # Panics
    ///
    /// Panics when `id` was not reachable from the roots this was built from.
    pub fn height(&self, id: NodeId) -> usize {
        self.heights[&id]
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.heights.contains_key(&id)
    }

    pub fn max_height(&self) -> usize {
        self.heights.values().copied().max().unwrap_or(0)
    }

    /// Reachable nodes in non-decreasing height order. Ties keep post-order,
    /// so the result stays deterministic across runs.
    pub fn ordered(&self) -> Vec<NodeId> {
        let mut out = self.order.clone();
        out.sort_by_key(|id| self.heights[id]);
        out
    }
}

/// Reverse edges of the reachable subgraph: for each node, the functors that
/// take it as an argument. A parent using a child in several argument slots
/// is recorded once per slot.
pub struct ParentIndex {
    parents: FxHashMap<NodeId, Vec<NodeId>>,
}

impl ParentIndex {
    pub fn new(graph: &Graph, roots: &[NodeId]) -> Self {
        let order = postorder(graph, roots);
        let nodes = graph.nodes.borrow();
        let mut parents: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
        for &id in &order {
            if let NodeData::Func { args, .. } = &nodes[id.0] {
                for &arg in args {
                    parents.entry(arg).or_default().push(id);
                }
            }
        }
        ParentIndex { parents }
    }

    pub fn parents(&self, id: NodeId) -> &[NodeId] {
        self.parents.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Number of argument slots `id` occupies across all parents.
    pub fn parent_count(&self, id: NodeId) -> usize {
        self.parents.get(&id).map_or(0, Vec::len)
    }
}
