//! Dominance engine: augmented dominator tree and phi-node placement.
//!
//! Phi placement uses the augmented dominator tree (ADT) of Bilardi and Pingali. Every
//! up-edge `u -> v` (an edge where `u` is not the immediate dominator of `v`) is recorded on
//! a chain of ancestors of `u`, stopping at *boundary* nodes so that each edge is stored a
//! bounded number of times. The merge set of a set of definition blocks is then found by
//! walking dominator subtrees from the deepest definition upward with a priority queue,
//! visiting each subtree only until a boundary is met.

use std::collections::BinaryHeap;

use crate::{
    graph::{compute_dominators, DominatorTree, GraphBase, RootedGraph},
    ir::BlockId,
};

/// Dominator tree plus the ADT augmentation, cached until the control-flow graph changes.
#[derive(Debug, Clone)]
pub struct Dominance {
    tree: DominatorTree,
    augment: Vec<Vec<BlockId>>,
    boundary: Vec<bool>,
    version: u64,
}

impl Dominance {
    /// Builds the dominator tree and the ADT for `graph`.
    ///
    /// `version` identifies the graph state this cache was built from.
    pub fn build<G>(graph: &G, version: u64) -> Self
    where
        G: RootedGraph + GraphBase,
    {
        let tree = compute_dominators(graph, graph.entry());
        let size = graph.node_count();
        let mut up_edges = Vec::new();
        let mut below = vec![0i64; size];
        let mut top = vec![0i64; size];

        for &x in tree.preorder() {
            for &v in tree.children(x) {
                for u in graph.predecessors(v) {
                    if Some(u) != tree.immediate_dominator(v) && tree.is_reachable(u) {
                        up_edges.push((u, v));
                        below[u.index()] += 1;
                        top[x.index()] += 1;
                    }
                }
            }
        }

        // Bottom-up sizes: `a` counts up-edges leaving the subtree, `z` the nodes since the
        // last boundary.
        let mut a = vec![0i64; size];
        let mut z = vec![0i64; size];
        let mut boundary = vec![false; size];
        for &i in tree.preorder().iter().rev() {
            let children = tree.children(i);
            let k: i64 = children.iter().map(|c| a[c.index()]).sum();
            let l: i64 = children.iter().map(|c| z[c.index()]).sum();
            a[i.index()] = below[i.index()] - top[i.index()] + k;
            z[i.index()] = 1 + l;
            if children.is_empty() || z[i.index()] > a[i.index()] + 1 {
                boundary[i.index()] = true;
                z[i.index()] = 1;
            }
        }

        // Nearest boundary proper ancestor of each node.
        let mut chain: Vec<Option<BlockId>> = vec![None; size];
        for &i in tree.preorder() {
            if let Some(j) = tree.immediate_dominator(i) {
                chain[i.index()] = if boundary[j.index()] {
                    Some(j)
                } else {
                    chain[j.index()]
                };
            }
        }

        let mut augment: Vec<Vec<BlockId>> = vec![Vec::new(); size];
        for (u, v) in up_edges {
            let Some(idom) = tree.immediate_dominator(v) else {
                continue;
            };
            let limit = tree.depth(idom);
            let mut k = Some(u);
            while let Some(node) = k {
                if tree.depth(node) <= limit {
                    break;
                }
                augment[node.index()].push(v);
                k = chain[node.index()];
            }
        }
        for list in &mut augment {
            list.sort_by_key(|v| {
                tree.immediate_dominator(*v)
                    .map_or(0, |d| tree.depth(d))
            });
        }

        Self {
            tree,
            augment,
            boundary,
            version,
        }
    }

    /// The dominator tree.
    pub fn tree(&self) -> &DominatorTree {
        &self.tree
    }

    /// Graph state this cache was built from.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Up-edge targets recorded at `block`, ordered by the depth of their immediate dominator.
    pub fn augment(&self, block: BlockId) -> &[BlockId] {
        &self.augment[block.index()]
    }

    /// True if `block` stops the subtree walk during phi placement.
    pub fn is_boundary(&self, block: BlockId) -> bool {
        self.boundary[block.index()]
    }

    /// Blocks needing a phi-node for a location written in `writes`.
    ///
    /// The entry block is always treated as a definition site, standing for the value the
    /// location holds on function entry. The result is the iterated dominance frontier of
    /// those sites, sorted by block index.
    pub fn place_phis(&self, writes: &[BlockId]) -> Vec<BlockId> {
        let size = self.augment.len();
        let mut marked = vec![false; size];
        let mut merged = vec![false; size];
        let mut result = Vec::new();
        let mut queue = BinaryHeap::new();

        let entry = self.tree.entry();
        for &block in writes.iter().chain(std::iter::once(&entry)) {
            if !self.tree.is_reachable(block) || marked[block.index()] {
                continue;
            }
            marked[block.index()] = true;
            queue.push((self.tree.depth(block), block));
        }

        while let Some((q_depth, q)) = queue.pop() {
            let mut stack = vec![q];
            while let Some(node) = stack.pop() {
                for &v in &self.augment[node.index()] {
                    let Some(idom) = self.tree.immediate_dominator(v) else {
                        continue;
                    };
                    if self.tree.depth(idom) >= q_depth {
                        break;
                    }
                    if !merged[v.index()] {
                        merged[v.index()] = true;
                        result.push(v);
                    }
                    if !marked[v.index()] {
                        marked[v.index()] = true;
                        queue.push((self.tree.depth(v), v));
                    }
                }
                if !self.boundary[node.index()] {
                    stack.extend(
                        self.tree
                            .children(node)
                            .iter()
                            .rev()
                            .filter(|c| !marked[c.index()]),
                    );
                }
            }
        }

        result.sort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{iterated_dominance_frontier, TestGraph};

    fn b(i: usize) -> BlockId {
        BlockId::new(i)
    }

    fn check_against_idf(graph: &TestGraph, writes: &[usize]) {
        let dom = Dominance::build(graph, 0);
        let seeds: Vec<BlockId> = writes.iter().map(|w| b(*w)).chain([b(0)]).collect();
        let expected = iterated_dominance_frontier(graph, dom.tree(), &seeds);
        let writes: Vec<BlockId> = writes.iter().map(|w| b(*w)).collect();
        assert_eq!(dom.place_phis(&writes), expected, "writes {writes:?}");
    }

    #[test]
    fn test_diamond_merge() {
        let graph = TestGraph::new(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let dom = Dominance::build(&graph, 0);
        assert_eq!(dom.place_phis(&[b(1)]), vec![b(3)]);
        assert_eq!(dom.place_phis(&[b(0)]), Vec::<BlockId>::new());
        check_against_idf(&graph, &[1, 2]);
    }

    #[test]
    fn test_loop_header() {
        let graph = TestGraph::new(4, &[(0, 1), (1, 2), (2, 1), (1, 3)]);
        let dom = Dominance::build(&graph, 0);
        assert_eq!(dom.place_phis(&[b(2)]), vec![b(1)]);
    }

    #[test]
    fn test_boundary_marks_leaves() {
        let graph = TestGraph::new(3, &[(0, 1), (1, 2)]);
        let dom = Dominance::build(&graph, 0);
        assert!(dom.is_boundary(b(2)));
        assert!(dom.augment(b(1)).is_empty());
    }

    #[test]
    fn test_matches_iterated_frontier_on_irregular_graphs() {
        let graphs = [
            TestGraph::new(
                7,
                &[(0, 1), (1, 2), (1, 3), (2, 4), (3, 4), (4, 5), (5, 1), (5, 6), (3, 6)],
            ),
            TestGraph::new(
                6,
                &[(0, 1), (0, 2), (1, 3), (2, 3), (3, 4), (4, 3), (4, 5), (2, 5)],
            ),
            TestGraph::new(5, &[(0, 1), (1, 1), (1, 2), (2, 3), (3, 2), (3, 4), (2, 4)]),
        ];
        for graph in &graphs {
            let n = graph.node_count();
            // Every subset of definition blocks.
            for mask in 0u32..(1 << n) {
                let writes: Vec<usize> = (0..n).filter(|i| mask & (1 << i) != 0).collect();
                check_against_idf(graph, &writes);
            }
        }
    }
}
