//! Live ranges of values and logical variables.
//!
//! A [`Cover`] records, for every block where a value is live, the positions between its
//! definition and its last use. Positions are operation order keys inside the block, with
//! [`START`] standing for the block entry and [`END`] for its exit. Intervals never wrap:
//! a value live around a loop is represented by a tail interval in the defining block and a
//! head interval `[START, x]` in each block that reaches a use.
//!
//! Two covers sharing a single point ([`Intersection::Boundary`]) do not interfere: that is
//! the operation where one value is last read and the other is written.

use std::{collections::BTreeMap, fmt};

use crate::ir::{BlockId, Function, OpId, Opcode, ValueId};

/// Position of a block's entry.
pub const START: u32 = 0;

/// Position of a block's exit.
pub const END: u32 = u32::MAX;

/// How two live ranges relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Intersection {
    /// No common point.
    Disjoint,
    /// Exactly one common point where one range ends and the other begins.
    Boundary,
    /// The ranges share more than an endpoint.
    Overlap,
}

/// Live positions inside one block: sorted, disjoint, inclusive intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverBlock {
    ranges: Vec<(u32, u32)>,
}

impl CoverBlock {
    /// True if nothing is live in the block.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The intervals, in ascending order.
    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    /// Adds `[start, stop]`, fusing it with every interval it touches.
    pub fn insert(&mut self, start: u32, stop: u32) {
        let (mut start, mut stop) = (start.min(stop), start.max(stop));
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for &(a, b) in &self.ranges {
            if b < start || a > stop {
                kept.push((a, b));
            } else {
                start = start.min(a);
                stop = stop.max(b);
            }
        }
        let at = kept.partition_point(|&(a, _)| a < start);
        kept.insert(at, (start, stop));
        self.ranges = kept;
    }

    /// True if `pos` is live.
    pub fn contains(&self, pos: u32) -> bool {
        self.ranges.iter().any(|&(a, b)| a <= pos && pos <= b)
    }

    /// Largest `x` such that `[START, x]` is live.
    fn head(&self) -> Option<u32> {
        self.ranges
            .first()
            .filter(|(a, _)| *a == START)
            .map(|(_, b)| *b)
    }

    /// Relation between the two blocks' intervals.
    pub fn intersect(&self, other: &CoverBlock) -> Intersection {
        let mut result = Intersection::Disjoint;
        for &(a0, a1) in &self.ranges {
            for &(b0, b1) in &other.ranges {
                if a1 < b0 || b1 < a0 {
                    continue;
                }
                if a1 == b0 || b1 == a0 {
                    result = result.max(Intersection::Boundary);
                } else {
                    return Intersection::Overlap;
                }
            }
        }
        result
    }
}

/// Live range of a value or a logical variable, keyed by block index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cover {
    blocks: BTreeMap<usize, CoverBlock>,
}

impl Cover {
    /// An empty cover.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the cover of `value` from its definition and every read.
    ///
    /// Values that are neither written nor inputs have an empty cover.
    pub fn build(func: &Function, value: ValueId) -> Self {
        let mut cover = Cover::new();
        let Some(def) = cover.add_def_point(func, value) else {
            return cover;
        };
        for op in func.value(value).descend() {
            cover.add_ref_point(func, *op, value, def);
        }
        cover
    }

    /// Marks the definition point and returns it as `(block, position)`.
    pub fn add_def_point(&mut self, func: &Function, value: ValueId) -> Option<(BlockId, u32)> {
        let v = func.value(value);
        let point = match v.def() {
            Some(op) => {
                let op = func.op(op);
                (op.parent()?, op.order())
            }
            None if v.is_input() => (func.entry_block(), START),
            None => return None,
        };
        self.block_mut(point.0).insert(point.1, point.1);
        Some(point)
    }

    /// Extends the cover to reach the read of `value` by `op`.
    ///
    /// A phi-node reads each input at the end of the matching predecessor.
    pub fn add_ref_point(&mut self, func: &Function, op: OpId, value: ValueId, def: (BlockId, u32)) {
        let read = func.op(op);
        let Some(block) = read.parent() else {
            return;
        };
        if read.opcode() == Opcode::MultiEqual {
            let ins = func.block(block).ins();
            for (slot, input) in read.inputs().iter().enumerate() {
                if *input == value {
                    if let Some(edge) = ins.get(slot) {
                        self.add_ref_recurse(func, def, edge.point, END);
                    }
                }
            }
        } else {
            self.add_ref_recurse(func, def, block, read.order());
        }
    }

    /// Makes the value live from block entry up to `pos`, walking predecessors until the
    /// definition or an already live block entry is reached.
    fn add_ref_recurse(&mut self, func: &Function, def: (BlockId, u32), block: BlockId, pos: u32) {
        let mut work = vec![(block, pos)];
        while let Some((block, pos)) = work.pop() {
            if block == def.0 && pos >= def.1 {
                self.block_mut(block).insert(def.1, pos);
                continue;
            }
            let cb = self.block_mut(block);
            let head = cb.head();
            if head.is_some_and(|x| x >= pos) {
                continue;
            }
            cb.insert(START, pos);
            if head.is_some() {
                continue;
            }
            work.extend(func.block(block).ins().iter().map(|e| (e.point, END)));
        }
    }

    fn block_mut(&mut self, block: BlockId) -> &mut CoverBlock {
        self.blocks.entry(block.index()).or_default()
    }

    /// Live intervals inside `block`.
    pub fn block(&self, block: BlockId) -> Option<&CoverBlock> {
        self.blocks.get(&block.index())
    }

    /// Blocks with live intervals, in index order.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &CoverBlock)> {
        self.blocks
            .iter()
            .filter(|(_, cb)| !cb.is_empty())
            .map(|(i, cb)| (BlockId::new(*i), cb))
    }

    /// True if the cover is live nowhere.
    pub fn is_empty(&self) -> bool {
        self.blocks.values().all(CoverBlock::is_empty)
    }

    /// Strongest relation over all blocks.
    pub fn intersect(&self, other: &Cover) -> Intersection {
        let mut result = Intersection::Disjoint;
        for (index, cb) in &self.blocks {
            if let Some(other_cb) = other.blocks.get(index) {
                result = result.max(cb.intersect(other_cb));
                if result == Intersection::Overlap {
                    break;
                }
            }
        }
        result
    }

    /// Relation inside a single block.
    pub fn intersect_by_block(&self, other: &Cover, block: BlockId) -> Intersection {
        match (self.block(block), other.block(block)) {
            (Some(a), Some(b)) => a.intersect(b),
            _ => Intersection::Disjoint,
        }
    }

    /// Blocks where the covers overlap by more than a boundary point.
    pub fn overlapping_blocks(&self, other: &Cover) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter(|(index, cb)| {
                other
                    .blocks
                    .get(index)
                    .is_some_and(|o| cb.intersect(o) == Intersection::Overlap)
            })
            .map(|(index, _)| BlockId::new(*index))
            .collect()
    }

    /// True if `pos` in `block` is live.
    pub fn contains_point(&self, block: BlockId, pos: u32) -> bool {
        self.block(block).is_some_and(|cb| cb.contains(pos))
    }

    /// True if the position of `op` is live.
    pub fn contain(&self, func: &Function, op: OpId) -> bool {
        let op = func.op(op);
        op.parent()
            .is_some_and(|block| self.contains_point(block, op.order()))
    }

    /// Adds every interval of `other`.
    pub fn merge(&mut self, other: &Cover) {
        for (index, cb) in &other.blocks {
            let target = self.blocks.entry(*index).or_default();
            for &(a, b) in cb.ranges() {
                target.insert(a, b);
            }
        }
    }

    /// Earliest live point, used to sort variables by where they start.
    pub fn first_point(&self) -> Option<(usize, u32)> {
        self.blocks
            .iter()
            .find_map(|(index, cb)| cb.ranges().first().map(|(a, _)| (*index, *a)))
    }
}

impl fmt::Display for Cover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (block, cb) in self.blocks() {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            write!(f, "{block}:")?;
            for (a, b) in cb.ranges() {
                match (*a, *b) {
                    (a, END) if a == START => write!(f, "[start,end]")?,
                    (START, b) => write!(f, "[start,{b}]")?,
                    (a, END) => write!(f, "[{a},end]")?,
                    (a, b) => write!(f, "[{a},{b}]")?,
                }
            }
        }
        Ok(())
    }
}

impl Function {
    /// Recomputes the cover of one value.
    pub fn update_cover(&mut self, value: ValueId) {
        let cover = if self.value(value).has_cover() {
            Some(Cover::build(self, value))
        } else {
            None
        };
        self.values[value.index()].cover = cover;
    }

    /// Recomputes every value cover.
    pub fn update_covers(&mut self) {
        for index in 0..self.values.len() {
            self.update_cover(ValueId::new(index));
        }
        self.covers_dirty = false;
    }

    /// True if block renumbering has made cached covers stale.
    pub fn covers_dirty(&self) -> bool {
        self.covers_dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Address, SpaceKind, Storage};

    #[test]
    fn test_cover_block_insert_fuses() {
        let mut cb = CoverBlock::default();
        cb.insert(10, 20);
        cb.insert(40, 50);
        cb.insert(15, 45);
        assert_eq!(cb.ranges(), &[(10, 50)]);
        cb.insert(START, 5);
        assert_eq!(cb.ranges(), &[(0, 5), (10, 50)]);
    }

    #[test]
    fn test_cover_block_intersection_kinds() {
        let mut a = CoverBlock::default();
        a.insert(10, 20);
        let mut b = CoverBlock::default();
        b.insert(20, 30);
        assert_eq!(a.intersect(&b), Intersection::Boundary);
        b.insert(15, 16);
        assert_eq!(a.intersect(&b), Intersection::Overlap);
        let mut c = CoverBlock::default();
        c.insert(21, 30);
        assert_eq!(a.intersect(&c), Intersection::Disjoint);
    }

    /// Diamond: bb0 -> {bb1, bb2} -> bb3, with r0 written in bb1 and bb2 and merged in bb3.
    #[test]
    fn test_phi_inputs_end_at_predecessors() {
        let mut func = Function::new("f", 0);
        let reg = func.add_space("register", SpaceKind::Register);
        let r0 = Storage::new(Address::new(reg, 0), 4);
        let b: Vec<_> = (0..4).map(|i| func.add_block(i * 0x10)).collect();
        func.add_edge(b[0], b[1]);
        func.add_edge(b[0], b[2]);
        func.add_edge(b[1], b[3]);
        func.add_edge(b[2], b[3]);

        let one = func.new_const(4, 1);
        let two = func.new_const(4, 2);
        let w1 = func.push_op(b[1], Opcode::Copy, 0x10, &[one], Some(r0));
        let w2 = func.push_op(b[2], Opcode::Copy, 0x20, &[two], Some(r0));
        let v1 = func.op(w1).output().unwrap();
        let v2 = func.op(w2).output().unwrap();
        let phi = func.push_op(b[3], Opcode::MultiEqual, 0x30, &[v1, v2], Some(r0));

        let c1 = Cover::build(&func, v1);
        let c2 = Cover::build(&func, v2);
        let pos1 = func.op(w1).order();
        assert_eq!(c1.block(b[1]).unwrap().ranges(), &[(pos1, END)]);
        assert!(c1.block(b[3]).is_none());
        assert_eq!(c1.intersect(&c2), Intersection::Disjoint);

        let out = func.op(phi).output().unwrap();
        let c3 = Cover::build(&func, out);
        assert_eq!(c3.intersect(&c1), Intersection::Disjoint);
        assert!(c3.contain(&func, phi));
    }

    #[test]
    fn test_loop_carried_cover() {
        let mut func = Function::new("f", 0);
        let reg = func.add_space("register", SpaceKind::Register);
        let r0 = Storage::new(Address::new(reg, 0), 4);
        let b0 = func.add_block(0);
        let b1 = func.add_block(0x10);
        let b2 = func.add_block(0x20);
        func.add_edge(b0, b1);
        func.add_edge(b1, b1);
        func.add_edge(b1, b2);

        let one = func.new_const(4, 1);
        let def = func.push_op(b0, Opcode::Copy, 0, &[one], Some(r0));
        let v = func.op(def).output().unwrap();
        func.push_op(b2, Opcode::Return, 0x20, &[v], None);

        let cover = Cover::build(&func, v);
        assert_eq!(cover.block(b0).unwrap().ranges(), &[(func.op(def).order(), END)]);
        assert_eq!(cover.block(b1).unwrap().ranges(), &[(START, END)]);
        assert!(cover.contains_point(b2, START));
        assert_eq!(cover.first_point(), Some((0, func.op(def).order())));
        assert!(cover.to_string().starts_with("bb0:["));
    }
}
