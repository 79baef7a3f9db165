//! Dominator tree computation using the Lengauer-Tarjan algorithm.
//!
//! The dominator tree drives both halves of the pipeline: phi placement walks it to find
//! merge points, renaming traverses it depth-first, and redundant COPY elimination uses it
//! to decide whether one assignment reaches another.
//!
//! # Theory
//!
//! A node `d` **dominates** a node `n` if every path from the entry node to `n`
//! must pass through `d`. The **immediate dominator** of `n` (idom(n)) is the
//! unique node that strictly dominates `n` but does not strictly dominate any
//! other dominator of `n`.
//!
//! The **dominance frontier** of `d` is the set of nodes `n` such that `d` dominates a
//! predecessor of `n` but does not strictly dominate `n`. Iterating the frontier over a set
//! of definition blocks yields exactly the blocks that need a phi-node.
//!
//! # Algorithm
//!
//! This implementation uses the Lengauer-Tarjan algorithm with path compression,
//! achieving O(V α(V)) time complexity where α is the inverse Ackermann function.
//! Nodes unreachable from the entry have no immediate dominator and are skipped by every
//! query that walks the tree.

use std::collections::{BTreeSet, HashSet};

use crate::{
    graph::{Predecessors, Successors},
    ir::BlockId,
};

/// Result of dominator tree computation.
///
/// Besides the immediate dominator relation, the tree caches the child lists and the depth
/// of every reachable node, both of which are queried heavily during phi placement.
///
/// # Examples
///
/// ```rust,ignore
/// use heritage::graph::compute_dominators;
///
/// let dom_tree = compute_dominators(&func, func.entry());
/// assert!(dom_tree.dominates(func.entry(), exit));
/// ```
#[derive(Debug, Clone)]
pub struct DominatorTree {
    entry: BlockId,
    idom: Vec<Option<BlockId>>,
    children: Vec<Vec<BlockId>>,
    depth: Vec<usize>,
    reachable: Vec<bool>,
    preorder: Vec<BlockId>,
}

impl DominatorTree {
    /// Returns the entry node (root of the tree).
    #[inline]
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    /// Returns the immediate dominator of `node`, or `None` for the entry and unreachable
    /// nodes.
    #[inline]
    pub fn immediate_dominator(&self, node: BlockId) -> Option<BlockId> {
        self.idom.get(node.index()).copied().flatten()
    }

    /// Checks whether `a` dominates `b`. Every node dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }

        let target = self.depth[a.index()];
        let mut current = b;
        while self.depth[current.index()] > target {
            match self.idom[current.index()] {
                Some(parent) => current = parent,
                None => return false,
            }
        }
        current == a
    }

    /// Checks whether `a` strictly dominates `b`.
    #[inline]
    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Depth of `node` in the tree; the entry has depth 0.
    #[inline]
    pub fn depth(&self, node: BlockId) -> usize {
        self.depth[node.index()]
    }

    /// Largest depth of any reachable node.
    pub fn max_depth(&self) -> usize {
        self.preorder
            .iter()
            .map(|n| self.depth[n.index()])
            .max()
            .unwrap_or(0)
    }

    /// Children of `node` in the dominator tree.
    #[inline]
    pub fn children(&self, node: BlockId) -> &[BlockId] {
        &self.children[node.index()]
    }

    /// True if `node` can be reached from the entry.
    #[inline]
    pub fn is_reachable(&self, node: BlockId) -> bool {
        self.reachable.get(node.index()).copied().unwrap_or(false)
    }

    /// Reachable nodes in dominator-tree preorder; parents precede children.
    #[inline]
    pub fn preorder(&self) -> &[BlockId] {
        &self.preorder
    }

    /// Total number of nodes the tree was built for.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.idom.len()
    }
}

/// Computes the dominator tree of `graph` rooted at `entry`.
pub fn compute_dominators<G>(graph: &G, entry: BlockId) -> DominatorTree
where
    G: Successors + Predecessors,
{
    let node_count = graph.node_count();

    if node_count == 0 {
        return DominatorTree {
            entry,
            idom: Vec::new(),
            children: Vec::new(),
            depth: Vec::new(),
            reachable: Vec::new(),
            preorder: Vec::new(),
        };
    }

    let mut lt = LengauerTarjan::new(node_count, entry);
    lt.compute(graph);

    let mut idom = vec![None; node_count];
    let mut children = vec![Vec::new(); node_count];
    let mut reachable = vec![false; node_count];
    for i in 0..lt.dfs_counter {
        let w = lt.vertex[i];
        reachable[w.index()] = true;
        if w != entry {
            let parent = lt.idom[w.index()];
            idom[w.index()] = Some(parent);
            children[parent.index()].push(w);
        }
    }
    for list in &mut children {
        list.sort();
    }

    // Depth and preorder from an explicit walk of the finished tree
    let mut depth = vec![0; node_count];
    let mut preorder = Vec::with_capacity(lt.dfs_counter);
    let mut stack = vec![entry];
    while let Some(node) = stack.pop() {
        preorder.push(node);
        for &child in children[node.index()].iter().rev() {
            depth[child.index()] = depth[node.index()] + 1;
            stack.push(child);
        }
    }

    DominatorTree {
        entry,
        idom,
        children,
        depth,
        reachable,
        preorder,
    }
}

/// Internal state for the Lengauer-Tarjan algorithm.
struct LengauerTarjan {
    entry: BlockId,
    /// DFS number for each node (0 = unvisited)
    dfnum: Vec<usize>,
    /// Node at each DFS number
    vertex: Vec<BlockId>,
    /// DFS tree parent
    parent: Vec<BlockId>,
    /// Semi-dominator
    semi: Vec<BlockId>,
    /// Immediate dominator (result)
    idom: Vec<BlockId>,
    /// Ancestor in the link-eval forest
    ancestor: Vec<Option<BlockId>>,
    /// Node with minimum semi-dominator on the path to the ancestor
    best: Vec<BlockId>,
    /// Nodes whose semi-dominator is this node
    bucket: Vec<Vec<BlockId>>,
    dfs_counter: usize,
}

impl LengauerTarjan {
    fn new(n: usize, entry: BlockId) -> Self {
        Self {
            entry,
            dfnum: vec![0; n],
            vertex: vec![entry; n],
            parent: vec![entry; n],
            semi: (0..n).map(BlockId::new).collect(),
            idom: vec![entry; n],
            ancestor: vec![None; n],
            best: (0..n).map(BlockId::new).collect(),
            bucket: vec![Vec::new(); n],
            dfs_counter: 0,
        }
    }

    fn compute<G: Successors + Predecessors>(&mut self, graph: &G) {
        self.dfs(graph);

        for i in (1..self.dfs_counter).rev() {
            let w = self.vertex[i];
            let parent_w = self.parent[w.index()];

            for v in graph.predecessors(w) {
                if self.dfnum[v.index()] == 0 {
                    continue;
                }
                let u = self.eval(v);
                if self.dfnum[self.semi[u.index()].index()]
                    < self.dfnum[self.semi[w.index()].index()]
                {
                    self.semi[w.index()] = self.semi[u.index()];
                }
            }

            let semi_w = self.semi[w.index()];
            self.bucket[semi_w.index()].push(w);
            self.link(parent_w, w);

            let bucket = std::mem::take(&mut self.bucket[parent_w.index()]);
            for v in bucket {
                let u = self.eval(v);
                if self.semi[u.index()] == self.semi[v.index()] {
                    self.idom[v.index()] = parent_w;
                } else {
                    self.idom[v.index()] = u;
                }
            }
        }

        for i in 1..self.dfs_counter {
            let w = self.vertex[i];
            if self.idom[w.index()] != self.semi[w.index()] {
                self.idom[w.index()] = self.idom[self.idom[w.index()].index()];
            }
        }

        self.idom[self.entry.index()] = self.entry;
    }

    /// Depth-first numbering; the parent of a node is the node whose edge discovered it.
    fn dfs<G: Successors>(&mut self, graph: &G) {
        let mut stack: Vec<(BlockId, Vec<BlockId>, usize)> = Vec::new();
        self.visit(self.entry);
        stack.push((self.entry, graph.successors(self.entry).collect(), 0));

        while let Some((node, succs, pos)) = stack.last_mut() {
            if *pos >= succs.len() {
                stack.pop();
                continue;
            }
            let succ = succs[*pos];
            *pos += 1;
            if self.dfnum[succ.index()] == 0 {
                self.parent[succ.index()] = *node;
                self.visit(succ);
                let next: Vec<BlockId> = graph.successors(succ).collect();
                stack.push((succ, next, 0));
            }
        }
    }

    fn visit(&mut self, node: BlockId) {
        self.dfs_counter += 1;
        self.dfnum[node.index()] = self.dfs_counter;
        self.vertex[self.dfs_counter - 1] = node;
    }

    fn link(&mut self, w: BlockId, v: BlockId) {
        self.ancestor[v.index()] = Some(w);
    }

    fn eval(&mut self, v: BlockId) -> BlockId {
        if self.ancestor[v.index()].is_none() {
            return v;
        }
        self.compress(v);
        self.best[v.index()]
    }

    fn compress(&mut self, v: BlockId) {
        let Some(ancestor_v) = self.ancestor[v.index()] else {
            return;
        };
        let Some(grand) = self.ancestor[ancestor_v.index()] else {
            return;
        };

        self.compress(ancestor_v);

        let best_ancestor = self.best[ancestor_v.index()];
        let best_v = self.best[v.index()];
        if self.dfnum[self.semi[best_ancestor.index()].index()]
            < self.dfnum[self.semi[best_v.index()].index()]
        {
            self.best[v.index()] = best_ancestor;
        }

        self.ancestor[v.index()] = self.ancestor[ancestor_v.index()].or(Some(grand));
    }
}

/// Computes the dominance frontier of every node (Cytron et al.).
///
/// For each join point, walks up the dominator tree from each predecessor until reaching
/// the join point's immediate dominator.
pub fn compute_dominance_frontiers<G>(graph: &G, dom_tree: &DominatorTree) -> Vec<HashSet<BlockId>>
where
    G: Predecessors,
{
    let n = graph.node_count();
    let mut frontiers: Vec<HashSet<BlockId>> = vec![HashSet::new(); n];

    for node in graph.node_ids() {
        if !dom_tree.is_reachable(node) {
            continue;
        }
        let preds: Vec<BlockId> = graph
            .predecessors(node)
            .filter(|p| dom_tree.is_reachable(*p))
            .collect();
        if preds.len() < 2 && !preds.iter().any(|p| dom_tree.dominates(node, *p)) {
            continue;
        }

        let idom_node = dom_tree.immediate_dominator(node);
        for pred in preds {
            let mut runner = Some(pred);
            while let Some(r) = runner {
                if Some(r) == idom_node {
                    break;
                }
                frontiers[r.index()].insert(node);
                runner = dom_tree.immediate_dominator(r);
            }
        }
    }

    frontiers
}

/// Computes the iterated dominance frontier of `seeds` by worklist over the per-node
/// frontiers. The result is sorted.
pub fn iterated_dominance_frontier<G>(
    graph: &G,
    dom_tree: &DominatorTree,
    seeds: &[BlockId],
) -> Vec<BlockId>
where
    G: Predecessors,
{
    let frontiers = compute_dominance_frontiers(graph, dom_tree);
    let mut result = BTreeSet::new();
    let mut worklist: Vec<BlockId> = seeds.to_vec();
    let mut queued: HashSet<BlockId> = seeds.iter().copied().collect();

    while let Some(node) = worklist.pop() {
        for &df in &frontiers[node.index()] {
            result.insert(df);
            if queued.insert(df) {
                worklist.push(df);
            }
        }
    }

    result.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TestGraph;

    fn b(i: usize) -> BlockId {
        BlockId::new(i)
    }

    #[test]
    fn test_dominator_single_node() {
        let graph = TestGraph::new(1, &[]);
        let dom_tree = compute_dominators(&graph, b(0));
        assert_eq!(dom_tree.immediate_dominator(b(0)), None);
        assert!(dom_tree.dominates(b(0), b(0)));
        assert_eq!(dom_tree.depth(b(0)), 0);
    }

    #[test]
    fn test_dominator_diamond() {
        // 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3
        let graph = TestGraph::new(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let dom_tree = compute_dominators(&graph, b(0));

        assert_eq!(dom_tree.immediate_dominator(b(1)), Some(b(0)));
        assert_eq!(dom_tree.immediate_dominator(b(2)), Some(b(0)));
        assert_eq!(dom_tree.immediate_dominator(b(3)), Some(b(0)));
        assert!(!dom_tree.dominates(b(1), b(3)));
        assert!(dom_tree.strictly_dominates(b(0), b(3)));
        assert_eq!(dom_tree.children(b(0)), &[b(1), b(2), b(3)]);
        assert_eq!(dom_tree.max_depth(), 1);
    }

    #[test]
    fn test_dominator_loop() {
        // 0 -> 1 -> 2 -> 1, 2 -> 3
        let graph = TestGraph::new(4, &[(0, 1), (1, 2), (2, 1), (2, 3)]);
        let dom_tree = compute_dominators(&graph, b(0));

        assert_eq!(dom_tree.immediate_dominator(b(1)), Some(b(0)));
        assert_eq!(dom_tree.immediate_dominator(b(2)), Some(b(1)));
        assert_eq!(dom_tree.immediate_dominator(b(3)), Some(b(2)));
        assert_eq!(dom_tree.depth(b(3)), 3);
    }

    #[test]
    fn test_dominator_non_dfs_parent() {
        // The edge 0 -> 2 is discovered before 1 -> 2 is explored; idom(2) must still be 0.
        let graph = TestGraph::new(4, &[(0, 1), (0, 2), (1, 2), (2, 3), (1, 3)]);
        let dom_tree = compute_dominators(&graph, b(0));
        assert_eq!(dom_tree.immediate_dominator(b(2)), Some(b(0)));
        assert_eq!(dom_tree.immediate_dominator(b(3)), Some(b(0)));
    }

    #[test]
    fn test_unreachable_node() {
        let graph = TestGraph::new(3, &[(0, 1), (2, 1)]);
        let dom_tree = compute_dominators(&graph, b(0));
        assert!(!dom_tree.is_reachable(b(2)));
        assert_eq!(dom_tree.immediate_dominator(b(2)), None);
        assert!(!dom_tree.dominates(b(0), b(2)));
        assert_eq!(dom_tree.immediate_dominator(b(1)), Some(b(0)));
    }

    #[test]
    fn test_dominance_frontiers_diamond() {
        let graph = TestGraph::new(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let dom_tree = compute_dominators(&graph, b(0));
        let frontiers = compute_dominance_frontiers(&graph, &dom_tree);

        assert!(frontiers[1].contains(&b(3)));
        assert!(frontiers[2].contains(&b(3)));
        assert!(frontiers[0].is_empty());
        assert!(frontiers[3].is_empty());
    }

    #[test]
    fn test_dominance_frontier_self_loop() {
        // 0 -> 1, 1 -> 1, 1 -> 2
        let graph = TestGraph::new(3, &[(0, 1), (1, 1), (1, 2)]);
        let dom_tree = compute_dominators(&graph, b(0));
        let frontiers = compute_dominance_frontiers(&graph, &dom_tree);
        assert!(frontiers[1].contains(&b(1)));
    }

    #[test]
    fn test_iterated_frontier_nested_loops() {
        // 0 -> 1 -> 2 -> 3 -> 2, 3 -> 1, 1 -> 4
        let graph = TestGraph::new(5, &[(0, 1), (1, 2), (2, 3), (3, 2), (3, 1), (1, 4)]);
        let dom_tree = compute_dominators(&graph, b(0));
        let idf = iterated_dominance_frontier(&graph, &dom_tree, &[b(3)]);
        assert_eq!(idf, vec![b(1), b(2)]);
    }
}
