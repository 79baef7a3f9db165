//! Basic blocks.

use crate::ir::{BlockId, OpId};

/// One end of a control-flow edge.
///
/// `reverse_index` is the position of the same edge in the other block's list, so the
/// phi-node slot fed by an outgoing edge is found without searching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEdge {
    /// Block at the other end of the edge.
    pub point: BlockId,
    /// Index of this edge in `point`'s opposite edge list.
    pub reverse_index: usize,
}

/// A basic block: an ordered run of operations with incoming and outgoing edges.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub(crate) ops: Vec<OpId>,
    pub(crate) ins: Vec<BlockEdge>,
    pub(crate) outs: Vec<BlockEdge>,
    pub(crate) start: u64,
}

impl Block {
    /// Operations in execution order.
    #[inline]
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    /// Incoming edges; phi-node input `i` flows along `ins()[i]`.
    #[inline]
    pub fn ins(&self) -> &[BlockEdge] {
        &self.ins
    }

    /// Outgoing edges.
    #[inline]
    pub fn outs(&self) -> &[BlockEdge] {
        &self.outs
    }

    /// Number of incoming edges.
    #[inline]
    pub fn size_in(&self) -> usize {
        self.ins.len()
    }

    /// Number of outgoing edges.
    #[inline]
    pub fn size_out(&self) -> usize {
        self.outs.len()
    }

    /// Address of the first instruction.
    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }
}
