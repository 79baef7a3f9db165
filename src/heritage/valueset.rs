//! Value-set analysis for pointers into the stack.
//!
//! The solver computes, for each value in the backward data-flow slice of a set of pointer
//! values, a strided interval that is either absolute or relative to the stack pointer on
//! function entry. It is a worklist algorithm over the slice in the style of sparse constant
//! propagation, with a bounded number of steps and optional widening so that it always
//! terminates.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{Function, OpId, Opcode, ValueId};

/// Abstract value of one data-flow value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueSet {
    /// No information yet.
    #[default]
    Empty,
    /// Every value in `lo..=hi` that is congruent to `lo` modulo `step`.
    ///
    /// `relative` ranges are offsets from the stack pointer on function entry.
    Range {
        /// True if the bounds are relative to the entry stack pointer.
        relative: bool,
        /// Smallest value.
        lo: i64,
        /// Largest value.
        hi: i64,
        /// Stride; 0 for a single value.
        step: u64,
    },
    /// Any value.
    Top,
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl ValueSet {
    /// A single absolute value.
    pub fn constant(value: i64) -> Self {
        Self::Range {
            relative: false,
            lo: value,
            hi: value,
            step: 0,
        }
    }

    /// A single offset from the entry stack pointer.
    pub fn stack(offset: i64) -> Self {
        Self::Range {
            relative: true,
            lo: offset,
            hi: offset,
            step: 0,
        }
    }

    /// True for [`ValueSet::Top`].
    pub fn is_top(&self) -> bool {
        matches!(self, Self::Top)
    }

    /// Least upper bound.
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        match (*self, *other) {
            (Self::Empty, x) | (x, Self::Empty) => x,
            (Self::Top, _) | (_, Self::Top) => Self::Top,
            (
                Self::Range {
                    relative: ra,
                    lo: la,
                    hi: ha,
                    step: sa,
                },
                Self::Range {
                    relative: rb,
                    lo: lb,
                    hi: hb,
                    step: sb,
                },
            ) => {
                if ra != rb {
                    return Self::Top;
                }
                let step = gcd(gcd(sa, sb), la.abs_diff(lb));
                Self::Range {
                    relative: ra,
                    lo: la.min(lb),
                    hi: ha.max(hb),
                    step,
                }
            }
        }
    }

    /// Extends any bound of `next` that moved past `self` to the limit of its direction.
    #[must_use]
    pub fn widen(&self, next: &Self) -> Self {
        match (*self, *next) {
            (
                Self::Range { lo: la, hi: ha, .. },
                Self::Range {
                    relative,
                    lo,
                    hi,
                    step,
                },
            ) => Self::Range {
                relative,
                lo: if lo < la { i64::MIN } else { lo },
                hi: if hi > ha { i64::MAX } else { hi },
                step: step.max(1),
            },
            (_, next) => next,
        }
    }

    fn add(&self, other: &Self) -> Self {
        match (*self, *other) {
            (Self::Empty, _) | (_, Self::Empty) => Self::Empty,
            (
                Self::Range {
                    relative: ra,
                    lo: la,
                    hi: ha,
                    step: sa,
                },
                Self::Range {
                    relative: rb,
                    lo: lb,
                    hi: hb,
                    step: sb,
                },
            ) if !(ra && rb) => Self::Range {
                relative: ra || rb,
                lo: la.saturating_add(lb),
                hi: ha.saturating_add(hb),
                step: gcd(sa, sb),
            },
            _ => Self::Top,
        }
    }

    fn negate(&self) -> Self {
        match *self {
            Self::Range {
                relative: false,
                lo,
                hi,
                step,
            } if lo != i64::MIN => Self::Range {
                relative: false,
                lo: -hi,
                hi: -lo,
                step,
            },
            Self::Empty => Self::Empty,
            _ => Self::Top,
        }
    }

    fn scale(&self, factor: i64) -> Self {
        match *self {
            Self::Range {
                relative,
                lo,
                hi,
                step,
            } if !relative || factor == 1 => {
                let (Some(a), Some(b)) = (lo.checked_mul(factor), hi.checked_mul(factor)) else {
                    return Self::Top;
                };
                Self::Range {
                    relative,
                    lo: a.min(b),
                    hi: a.max(b),
                    step: step.saturating_mul(factor.unsigned_abs()),
                }
            }
            Self::Empty => Self::Empty,
            _ => Self::Top,
        }
    }

    fn mask(&self, mask: u64) -> Self {
        match *self {
            Self::Empty => Self::Empty,
            // Alignment of a stack pointer: the result may move down by up to the cleared
            // low bits.
            Self::Range {
                relative: true,
                lo,
                hi,
                ..
            } if mask.leading_ones() > 0 && (!mask).wrapping_add(1).is_power_of_two() => {
                let slack = i64::try_from(!mask).unwrap_or(i64::MAX);
                Self::Range {
                    relative: true,
                    lo: lo.saturating_sub(slack),
                    hi,
                    step: 1,
                }
            }
            _ => match i64::try_from(mask) {
                Ok(m) => Self::Range {
                    relative: false,
                    lo: 0,
                    hi: m,
                    step: 1u64 << mask.trailing_zeros().min(63),
                },
                Err(_) => Self::Top,
            },
        }
    }
}

/// Why a solve stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    /// A fixed point was reached.
    Converged,
    /// The step limit was hit; unsettled values were set to [`ValueSet::Top`].
    Capped,
}

/// Worklist solver over the backward slice of a set of values.
pub struct ValueSetSolver<'a> {
    func: &'a Function,
    base: Option<ValueId>,
    slice: FxHashSet<ValueId>,
    order: Vec<ValueId>,
    sets: FxHashMap<ValueId, ValueSet>,
    max_iterations: usize,
    iterations: usize,
}

impl<'a> ValueSetSolver<'a> {
    /// Prepares a solver for the values that `sinks` depend on.
    ///
    /// `base` is the stack pointer on entry, the origin of relative ranges.
    pub fn new(
        func: &'a Function,
        base: Option<ValueId>,
        sinks: &[ValueId],
        max_iterations: usize,
    ) -> Self {
        let mut slice = FxHashSet::default();
        let mut order = Vec::new();
        // Post-order so that definitions are seeded before their readers.
        let mut stack: Vec<(ValueId, bool)> = sinks.iter().map(|s| (*s, false)).collect();
        while let Some((value, expanded)) = stack.pop() {
            if expanded {
                order.push(value);
                continue;
            }
            if !slice.insert(value) {
                continue;
            }
            stack.push((value, true));
            if Some(value) == base {
                continue;
            }
            if let Some(def) = func.value(value).def() {
                for input in func.op(def).inputs() {
                    if !slice.contains(input) {
                        stack.push((*input, false));
                    }
                }
            }
        }

        Self {
            func,
            base,
            slice,
            order,
            sets: FxHashMap::default(),
            max_iterations,
            iterations: 0,
        }
    }

    /// Number of values in the slice.
    pub fn slice_len(&self) -> usize {
        self.slice.len()
    }

    /// Steps taken by the last solve.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Result for `value`.
    pub fn value_set(&self, value: ValueId) -> ValueSet {
        self.sets.get(&value).copied().unwrap_or(ValueSet::Top)
    }

    fn leaf(&self, value: ValueId) -> Option<ValueSet> {
        let v = self.func.value(value);
        if Some(value) == self.base {
            return Some(ValueSet::stack(0));
        }
        if let Some(c) = v.signed_constant() {
            return Some(ValueSet::constant(c));
        }
        (!v.is_written()).then_some(ValueSet::Top)
    }

    fn constant_of(&self, value: ValueId) -> Option<i64> {
        self.func.value(value).signed_constant()
    }

    fn transfer(&self, op: OpId) -> ValueSet {
        let op = self.func.op(op);
        let get = |slot: usize| {
            op.input(slot)
                .map_or(ValueSet::Top, |v| self.sets.get(&v).copied().unwrap_or_default())
        };
        match op.opcode() {
            Opcode::Copy | Opcode::Indirect | Opcode::Cast | Opcode::IntZext | Opcode::IntSext => {
                get(0)
            }
            Opcode::IntAdd => get(0).add(&get(1)),
            Opcode::IntSub => get(0).add(&get(1).negate()),
            Opcode::PtrSub => get(0).add(&get(1)),
            Opcode::PtrAdd => match op.input(2).and_then(|v| self.constant_of(v)) {
                Some(size) => get(0).add(&get(1).scale(size)),
                None => ValueSet::Top,
            },
            Opcode::IntMult => {
                match (
                    op.input(0).and_then(|v| self.constant_of(v)),
                    op.input(1).and_then(|v| self.constant_of(v)),
                ) {
                    (_, Some(c)) => get(0).scale(c),
                    (Some(c), None) => get(1).scale(c),
                    (None, None) => ValueSet::Top,
                }
            }
            Opcode::IntAnd => match op.input(1).and_then(|v| self.func.value(v).constant()) {
                Some(mask) => get(0).mask(mask),
                None => ValueSet::Top,
            },
            Opcode::MultiEqual => op
                .inputs()
                .iter()
                .map(|v| self.sets.get(v).copied().unwrap_or_default())
                .fold(ValueSet::Empty, |acc, s| acc.join(&s)),
            Opcode::Load
            | Opcode::Store
            | Opcode::Branch
            | Opcode::CBranch
            | Opcode::BranchInd
            | Opcode::Call
            | Opcode::CallInd
            | Opcode::CallOther
            | Opcode::Return
            | Opcode::Piece
            | Opcode::SubPiece
            | Opcode::Other => ValueSet::Top,
        }
    }

    /// Runs the solver to a fixed point or the step limit.
    ///
    /// With `widen_after`, a value whose set has changed that many times is widened on its
    /// next change.
    pub fn solve(&mut self, widen_after: Option<u32>) -> SolveOutcome {
        self.sets.clear();
        self.iterations = 0;
        let mut changes: FxHashMap<ValueId, u32> = FxHashMap::default();
        let mut worklist = VecDeque::new();
        let mut queued = FxHashSet::default();

        for &value in &self.order {
            match self.leaf(value) {
                Some(set) => {
                    self.sets.insert(value, set);
                }
                None => {
                    self.sets.insert(value, ValueSet::Empty);
                    worklist.push_back(value);
                    queued.insert(value);
                }
            }
        }

        while let Some(value) = worklist.pop_front() {
            queued.remove(&value);
            if self.iterations >= self.max_iterations {
                worklist.push_front(value);
                self.give_up(worklist);
                return SolveOutcome::Capped;
            }
            self.iterations += 1;

            let Some(def) = self.func.value(value).def() else {
                continue;
            };
            let old = self.sets.get(&value).copied().unwrap_or_default();
            let mut new = self.transfer(def);
            if new == old {
                continue;
            }
            let count = changes.entry(value).or_insert(0);
            *count += 1;
            if widen_after.is_some_and(|limit| *count > limit) {
                new = old.widen(&new);
            }
            self.sets.insert(value, new);

            for reader in self.func.value(value).descend() {
                if let Some(out) = self.func.op(*reader).output() {
                    if self.slice.contains(&out) && Some(out) != self.base && queued.insert(out) {
                        worklist.push_back(out);
                    }
                }
            }
        }
        SolveOutcome::Converged
    }

    /// Sets every unsettled value, and everything in the slice that depends on one, to Top.
    fn give_up(&mut self, pending: VecDeque<ValueId>) {
        let mut work: Vec<ValueId> = pending.into_iter().collect();
        let mut seen = FxHashSet::default();
        while let Some(value) = work.pop() {
            if !seen.insert(value) {
                continue;
            }
            self.sets.insert(value, ValueSet::Top);
            for reader in self.func.value(value).descend() {
                if let Some(out) = self.func.op(*reader).output() {
                    if self.slice.contains(&out) {
                        work.push(out);
                    }
                }
            }
        }
    }
}
