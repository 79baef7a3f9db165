//! Guards for LOAD and STORE operations that access the stack through a pointer.
//!
//! A pointer derived from the stack pointer may alias any stack location in the range it
//! can take. Each such access gets a [`LoadGuard`] recording that range. Discovery traces the
//! pointer back to the stack pointer to find its constant part; the value-set solver then
//! narrows indexed accesses down to the offsets the index can actually produce.

use crate::{
    error::TraceError,
    heritage::valueset::{SolveOutcome, ValueSet, ValueSetSolver},
    ir::{signed_within, Function, OpId, Opcode, SpaceId, Storage, ValueId},
};

/// How far the range of a guard has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Range is the conservative result of discovery.
    Pending,
    /// Range comes from a converged value-set solve.
    Bounded,
    /// The solver could not bound the pointer; the guard spans the whole space.
    Unbounded,
}

/// Range of stack offsets one pointer-based access may touch.
#[derive(Debug, Clone)]
pub struct LoadGuard {
    pub(crate) op: OpId,
    pub(crate) space: SpaceId,
    pub(crate) pointer: ValueId,
    pub(crate) highest: u64,
    pub(crate) min: i64,
    pub(crate) max: i64,
    pub(crate) step: u64,
    pub(crate) size: u32,
    pub(crate) indexed: bool,
    pub(crate) state: GuardState,
}

impl LoadGuard {
    /// The guarded LOAD or STORE.
    pub fn op(&self) -> OpId {
        self.op
    }

    /// Space the access may alias.
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Smallest offset the pointer may take, as a signed displacement from the entry stack
    /// pointer.
    pub fn min(&self) -> i64 {
        self.min
    }

    /// Largest offset the pointer may take.
    pub fn max(&self) -> i64 {
        self.max
    }

    /// Stride between possible offsets.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// True if the pointer has a non-constant component.
    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    /// Resolution state.
    pub fn state(&self) -> GuardState {
        self.state
    }

    /// True if the access may touch any byte of `storage`.
    pub fn may_alias(&self, storage: &Storage) -> bool {
        if storage.addr.space != self.space {
            return false;
        }
        if self.state == GuardState::Unbounded {
            return true;
        }
        let start = signed_within(storage.addr.offset, self.highest);
        let end = start.saturating_add(i64::from(storage.size));
        let access_end = self.max.saturating_add(i64::from(self.size.max(1)));
        start < access_end && end > self.min
    }
}

/// Result of tracing a pointer back to the stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerTrace {
    /// Sum of the constant offsets along the chain.
    pub offset: i64,
    /// True if a non-constant term was added somewhere along the chain.
    pub indexed: bool,
}

/// Follows `pointer` through copies and constant arithmetic to `base`.
pub fn trace_pointer(
    func: &Function,
    base: ValueId,
    pointer: ValueId,
    max_depth: usize,
) -> Result<PointerTrace, TraceError> {
    let mut visited = Vec::new();
    trace(func, base, pointer, max_depth, &mut visited)
}

fn trace(
    func: &Function,
    base: ValueId,
    value: ValueId,
    depth: usize,
    visited: &mut Vec<OpId>,
) -> Result<PointerTrace, TraceError> {
    if value == base {
        return Ok(PointerTrace {
            offset: 0,
            indexed: false,
        });
    }
    if depth == 0 {
        return Err(TraceError::DepthLimit);
    }
    let Some(def) = func.value(value).def() else {
        return Err(TraceError::UnknownBase);
    };
    let op = func.op(def);
    let input = |slot: usize| op.input(slot).ok_or(TraceError::UnknownBase);
    let constant = |slot: usize| {
        op.input(slot)
            .and_then(|v| func.value(v).signed_constant())
    };

    match op.opcode() {
        Opcode::Copy | Opcode::Cast | Opcode::Indirect => {
            trace(func, base, input(0)?, depth - 1, visited)
        }
        Opcode::IntAdd | Opcode::PtrSub => match (constant(0), constant(1)) {
            (_, Some(c)) => shift(trace(func, base, input(0)?, depth - 1, visited)?, c),
            (Some(c), None) => shift(trace(func, base, input(1)?, depth - 1, visited)?, c),
            (None, None) => {
                let t = trace(func, base, input(0)?, depth - 1, visited)
                    .or_else(|_| trace(func, base, input(1)?, depth - 1, visited))?;
                Ok(PointerTrace {
                    indexed: true,
                    ..t
                })
            }
        },
        Opcode::IntSub => {
            let t = trace(func, base, input(0)?, depth - 1, visited)?;
            match constant(1) {
                Some(c) => shift(t, c.wrapping_neg()),
                None => Ok(PointerTrace { indexed: true, ..t }),
            }
        }
        Opcode::PtrAdd => {
            let t = trace(func, base, input(0)?, depth - 1, visited)?;
            match (constant(1), constant(2)) {
                (Some(i), Some(s)) => shift(t, i.wrapping_mul(s)),
                _ => Ok(PointerTrace { indexed: true, ..t }),
            }
        }
        Opcode::MultiEqual => {
            if visited.contains(&def) {
                return Err(TraceError::UnknownBase);
            }
            visited.push(def);
            let mut found: Option<PointerTrace> = None;
            let mut indexed = false;
            for &input in op.inputs() {
                match trace(func, base, input, depth - 1, visited) {
                    Ok(t) => match found {
                        None => found = Some(t),
                        Some(prev) => {
                            indexed |= prev.offset != t.offset || t.indexed;
                            if t.offset < prev.offset {
                                found = Some(t);
                            }
                        }
                    },
                    Err(TraceError::DepthLimit) => return Err(TraceError::DepthLimit),
                    // Loop-carried or foreign inputs make the pointer indexed.
                    Err(_) => indexed = true,
                }
            }
            let t = found.ok_or(TraceError::UnknownBase)?;
            Ok(PointerTrace {
                offset: t.offset,
                indexed: indexed || t.indexed,
            })
        }
        other => Err(TraceError::Unsupported(other)),
    }
}

fn shift(t: PointerTrace, by: i64) -> Result<PointerTrace, TraceError> {
    Ok(PointerTrace {
        offset: t.offset.wrapping_add(by),
        ..t
    })
}

/// Creates guards for every LOAD and STORE whose pointer derives from `base` and that has
/// no guard yet.
///
/// Exact accesses get a single-offset range; indexed ones start at their constant part and
/// extend to the top of the space until the solver narrows them.
pub fn discover(
    func: &Function,
    base: ValueId,
    stack: SpaceId,
    known: &[LoadGuard],
    max_depth: usize,
) -> Vec<LoadGuard> {
    let mut found = Vec::new();
    for opcode in [Opcode::Load, Opcode::Store] {
        for op_id in func.ops_with(opcode) {
            if known.iter().any(|g| g.op == op_id) {
                continue;
            }
            let op = func.op(op_id);
            let Some(pointer) = op.input(1) else {
                continue;
            };
            let Ok(t) = trace_pointer(func, base, pointer, max_depth) else {
                continue;
            };
            let size = match opcode {
                Opcode::Load => op.output().map_or(1, |v| func.value(v).size()),
                _ => op.input(2).map_or(1, |v| func.value(v).size()),
            };
            let highest = func.space(stack).highest();
            let min = signed_within(t.offset as u64, highest);
            found.push(LoadGuard {
                op: op_id,
                space: stack,
                pointer,
                highest,
                min,
                max: if t.indexed { (highest >> 1) as i64 } else { min },
                step: if t.indexed { 1 } else { 0 },
                size,
                indexed: t.indexed,
                state: if t.indexed {
                    GuardState::Pending
                } else {
                    GuardState::Bounded
                },
            });
        }
    }
    found
}

/// Narrows pending guards with the value-set solver.
///
/// A first solve runs without widening; if it leaves any pointer unbounded, a second solve
/// widens values that keep changing. Guards still unbounded afterwards span the whole space.
/// Returns the guards that ended unbounded.
pub fn resolve(
    func: &Function,
    base: ValueId,
    guards: &mut [LoadGuard],
    max_iterations: usize,
    widen_after: u32,
) -> Vec<OpId> {
    let pending: Vec<ValueId> = guards
        .iter()
        .filter(|g| g.state == GuardState::Pending)
        .map(|g| g.pointer)
        .collect();
    if pending.is_empty() {
        return Vec::new();
    }

    let mut solver = ValueSetSolver::new(func, Some(base), &pending, max_iterations);
    let outcome = solver.solve(None);
    let unresolved = outcome == SolveOutcome::Capped
        || pending.iter().any(|p| !is_stack_range(solver.value_set(*p)));
    if unresolved {
        solver.solve(Some(widen_after));
    }

    let mut unbounded = Vec::new();
    for guard in guards.iter_mut().filter(|g| g.state == GuardState::Pending) {
        let bounds = match solver.value_set(guard.pointer) {
            ValueSet::Range {
                relative: true,
                lo,
                hi,
                step,
            } => within_space(lo, hi, guard.highest).map(|(min, max)| (min, max, step)),
            _ => None,
        };
        match bounds {
            Some((min, max, step)) => {
                guard.min = min;
                guard.max = max;
                guard.step = step;
                guard.state = GuardState::Bounded;
            }
            None => {
                guard.min = i64::MIN;
                guard.max = i64::MAX;
                guard.step = 1;
                guard.state = GuardState::Unbounded;
                unbounded.push(guard.op);
            }
        }
    }
    unbounded
}

/// `[lo, hi]` wrapped to the width of the space, unless it covers more than half of it or
/// straddles the wrap point.
fn within_space(lo: i64, hi: i64, highest: u64) -> Option<(i64, i64)> {
    if i128::from(hi) - i128::from(lo) > i128::from(highest >> 1) {
        return None;
    }
    let (min, max) = (signed_within(lo as u64, highest), signed_within(hi as u64, highest));
    (min <= max).then_some((min, max))
}

fn is_stack_range(set: ValueSet) -> bool {
    matches!(set, ValueSet::Range { relative: true, .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Address, SpaceKind};

    struct Frame {
        func: Function,
        base: ValueId,
        stack: SpaceId,
        reg: SpaceId,
    }

    fn frame() -> Frame {
        let mut func = Function::new("f", 0);
        let reg = func.add_space("register", SpaceKind::Register);
        let stack = func.add_stack_space("stack", func.ram_space());
        let sp = Storage::new(Address::new(reg, 0x20), 8);
        func.set_stack_pointer(sp, stack);
        func.add_block(0);
        let base = func.new_input(sp);
        Frame {
            func,
            base,
            stack,
            reg,
        }
    }

    #[test]
    fn test_trace_constant_offsets() {
        let mut f = frame();
        let entry = f.func.entry_block();
        let r1 = Storage::new(Address::new(f.reg, 0x8), 8);
        let c16 = f.func.new_const(8, 0x10);
        let c4 = f.func.new_const(8, 4);
        let sub = f.func.push_op(entry, Opcode::IntSub, 0, &[f.base, c16], Some(r1));
        let p = f.func.op(sub).output().unwrap();
        let add = f.func.push_op(entry, Opcode::IntAdd, 4, &[p, c4], Some(r1));
        let q = f.func.op(add).output().unwrap();

        let t = trace_pointer(&f.func, f.base, q, 32).unwrap();
        assert_eq!(
            t,
            PointerTrace {
                offset: -0xc,
                indexed: false
            }
        );
        assert_eq!(trace_pointer(&f.func, f.base, q, 1), Err(TraceError::DepthLimit));
    }

    #[test]
    fn test_trace_rejects_foreign_pointer() {
        let mut f = frame();
        let entry = f.func.entry_block();
        let r1 = Storage::new(Address::new(f.reg, 0x8), 8);
        let other = f.func.new_input(r1);
        let space = f.func.new_space_const(f.func.ram_space());
        let load = f.func.push_op(entry, Opcode::Load, 0, &[space, other], Some(r1));
        let out = f.func.op(load).output().unwrap();

        assert_eq!(
            trace_pointer(&f.func, f.base, other, 32),
            Err(TraceError::UnknownBase)
        );
        let found = discover(&f.func, f.base, f.stack, &[], 32);
        assert!(found.is_empty());
        assert!(f.func.value(out).is_written());
    }

    #[test]
    fn test_indexed_guard_resolves_to_index_range() {
        let mut f = frame();
        let entry = f.func.entry_block();
        let r1 = Storage::new(Address::new(f.reg, 0x8), 8);
        let r2 = Storage::new(Address::new(f.reg, 0x10), 8);
        let raw = f.func.new_input(r2);
        let mask = f.func.new_const(8, 0x7);
        let and = f.func.push_op(entry, Opcode::IntAnd, 0, &[raw, mask], Some(r2));
        let index = f.func.op(and).output().unwrap();
        let c4 = f.func.new_const(8, 4);
        let mult = f.func.push_op(entry, Opcode::IntMult, 4, &[index, c4], Some(r2));
        let scaled = f.func.op(mult).output().unwrap();
        let c32 = f.func.new_const(8, 0x20);
        let sub = f.func.push_op(entry, Opcode::IntSub, 8, &[f.base, c32], Some(r1));
        let buf = f.func.op(sub).output().unwrap();
        let add = f.func.push_op(entry, Opcode::IntAdd, 12, &[buf, scaled], Some(r1));
        let ptr = f.func.op(add).output().unwrap();
        let space = f.func.new_space_const(f.stack);
        f.func
            .push_op(entry, Opcode::Load, 16, &[space, ptr], Some(r1.with_size(4)));

        let mut guards = discover(&f.func, f.base, f.stack, &[], 32);
        assert_eq!(guards.len(), 1);
        assert!(guards[0].is_indexed());
        assert_eq!(guards[0].min(), -0x20);
        assert_eq!(guards[0].state(), GuardState::Pending);

        let unbounded = resolve(&f.func, f.base, &mut guards, 10_000, 2);
        assert!(unbounded.is_empty());
        let g = &guards[0];
        assert_eq!(g.state(), GuardState::Bounded);
        assert_eq!((g.min(), g.max(), g.step()), (-0x20, -0x20 + 28, 4));

        let inside = Storage::new(Address::new(f.stack, (-0x10i64) as u64), 4);
        let outside = Storage::new(Address::new(f.stack, (-0x40i64) as u64), 4);
        assert!(g.may_alias(&inside));
        assert!(!g.may_alias(&outside));
    }

    #[test]
    fn test_guard_offsets_wrap_to_narrow_stack() {
        let mut f = frame();
        f.func.set_space_highest(f.stack, 0xffff_ffff);
        let entry = f.func.entry_block();
        let r1 = Storage::new(Address::new(f.reg, 0x8), 4);
        let minus16 = f.func.new_const(4, 0xffff_fff0);
        let add = f.func.push_op(entry, Opcode::IntAdd, 0, &[f.base, minus16], Some(r1));
        let ptr = f.func.op(add).output().unwrap();
        let space = f.func.new_space_const(f.stack);
        let c = f.func.new_const(4, 7);
        f.func.push_op(entry, Opcode::Store, 4, &[space, ptr, c], None);

        let guards = discover(&f.func, f.base, f.stack, &[], 32);
        assert_eq!(guards.len(), 1);
        let g = &guards[0];
        assert_eq!((g.min(), g.max()), (-0x10, -0x10));

        let slot = Storage::new(Address::new(f.stack, 0xffff_fff0), 4);
        let neighbour = Storage::new(Address::new(f.stack, 0xffff_fff8), 4);
        assert!(g.may_alias(&slot));
        assert!(!g.may_alias(&neighbour));
    }
}
