//! Graph abstractions and dominance algorithms over basic blocks.
//!
//! The algorithms in [`dominators`] are written against the small trait set defined here
//! rather than against [`crate::ir::Function`] directly, so they can be exercised on
//! synthetic graphs in tests.
//!
//! - [`GraphBase`] - Node count and node iteration
//! - [`Successors`] - Forward edge traversal
//! - [`Predecessors`] - Backward edge traversal
//! - [`RootedGraph`] - Graphs with a designated entry node

pub mod dominators;

pub use dominators::{
    compute_dominance_frontiers, compute_dominators, iterated_dominance_frontier, DominatorTree,
};

use crate::ir::BlockId;

/// Core graph properties.
pub trait GraphBase {
    /// Returns the number of nodes in the graph.
    fn node_count(&self) -> usize;

    /// Returns an iterator over all node identifiers, in ascending index order.
    fn node_ids(&self) -> impl Iterator<Item = BlockId>;
}

/// Graphs that support forward edge traversal.
pub trait Successors: GraphBase {
    /// Returns an iterator over the successors of `node`.
    ///
    /// Parallel edges yield the same successor more than once.
    fn successors(&self, node: BlockId) -> impl Iterator<Item = BlockId>;
}

/// Graphs that support backward edge traversal.
pub trait Predecessors: GraphBase {
    /// Returns an iterator over the predecessors of `node`, in incoming-edge order.
    fn predecessors(&self, node: BlockId) -> impl Iterator<Item = BlockId>;
}

/// Graphs with a designated entry node.
pub trait RootedGraph: Successors + Predecessors {
    /// Returns the entry node.
    fn entry(&self) -> BlockId;
}

/// Minimal adjacency-list graph used by the algorithm tests.
#[cfg(test)]
pub(crate) struct TestGraph {
    pub(crate) succs: Vec<Vec<BlockId>>,
    pub(crate) preds: Vec<Vec<BlockId>>,
}

#[cfg(test)]
impl TestGraph {
    pub(crate) fn new(n: usize, edges: &[(usize, usize)]) -> Self {
        let mut succs = vec![Vec::new(); n];
        let mut preds = vec![Vec::new(); n];
        for &(a, b) in edges {
            succs[a].push(BlockId::new(b));
            preds[b].push(BlockId::new(a));
        }
        Self { succs, preds }
    }
}

#[cfg(test)]
impl GraphBase for TestGraph {
    fn node_count(&self) -> usize {
        self.succs.len()
    }

    fn node_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.succs.len()).map(BlockId::new)
    }
}

#[cfg(test)]
impl Successors for TestGraph {
    fn successors(&self, node: BlockId) -> impl Iterator<Item = BlockId> {
        self.succs[node.index()].iter().copied()
    }
}

#[cfg(test)]
impl Predecessors for TestGraph {
    fn predecessors(&self, node: BlockId) -> impl Iterator<Item = BlockId> {
        self.preds[node.index()].iter().copied()
    }
}

#[cfg(test)]
impl RootedGraph for TestGraph {
    fn entry(&self) -> BlockId {
        BlockId::new(0)
    }
}
