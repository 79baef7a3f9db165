//! Guards: explicit stand-ins for effects the IR does not show as data flow.
//!
//! Before a range is linked, every operation that may touch it without naming it gets a
//! synthetic neighbour the renamer can see. Calls get INDIRECT writes, returns get extra
//! reads or COPYs, stores through stack pointers get INDIRECT writes and guarded loads get a
//! COPY that keeps the range alive.

use crate::{
    error::fatal_error,
    heritage::{refine, Collected, Heritage},
    ir::{
        Address, Containment, EffectType, Function, OpFlags, OpId, Opcode, ParamActive, SpaceId,
        SpaceKind, Storage, ValueFlags, ValueId,
    },
    Result,
};

/// Creates an INDIRECT before `target` that may change `storage`.
///
/// Input 0 is a fresh read of the storage, input 1 names `target`.
pub(crate) fn new_indirect_op(
    func: &mut Function,
    target: OpId,
    storage: &Storage,
    flags: OpFlags,
) -> Result<OpId> {
    let op = func.new_op(Opcode::Indirect, func.op(target).seq().pc);
    func.set_op_flags(op, flags);
    let out = func.new_value_at(*storage);
    func.set_output(op, out);
    let input = func.new_value_at(*storage);
    func.set_input(op, input, 0);
    let iop = func.new_iop(target);
    func.set_input(op, iop, 1);
    func.insert_before(op, target)?;
    Ok(op)
}

/// Creates an INDIRECT before `target` that produces `storage` from nothing.
///
/// Unless the value may turn out to be an output of `target`, the zero placeholder is
/// itself marked as an indirect creation.
pub(crate) fn new_indirect_creation(
    func: &mut Function,
    target: OpId,
    storage: &Storage,
    possible_output: bool,
) -> Result<OpId> {
    let op = func.new_op(Opcode::Indirect, func.op(target).seq().pc);
    func.set_op_flags(op, OpFlags::INDIRECT_CREATION);
    let zero = func.new_const(storage.size, 0);
    if !possible_output {
        func.set_value_flags(zero, ValueFlags::INDIRECT_CREATION);
    }
    let out = func.new_value_at(*storage);
    func.set_output(op, out);
    func.set_value_flags(out, ValueFlags::INDIRECT_CREATION);
    func.set_input(op, zero, 0);
    let iop = func.new_iop(target);
    func.set_input(op, iop, 1);
    func.insert_before(op, target)?;
    Ok(op)
}

fn output_of(func: &Function, op: OpId) -> Result<ValueId> {
    func.op(op)
        .output()
        .ok_or_else(|| fatal_error!(func.op_address(op), "{} has no output", op))
}

fn activate(func: &mut Function, value: ValueId) {
    func.set_value_flags(value, ValueFlags::ACTIVE_HERITAGE);
}

/// Space named by the first input of a LOAD or STORE.
fn access_space(func: &Function, op: OpId) -> Option<SpaceId> {
    let c = func.value(func.op(op).input(0)?).constant()?;
    let index = usize::try_from(c).ok()?;
    (index < func.spaces().len()).then(|| SpaceId::new(index))
}

/// Registers `slot` as a trial unless it already is one. Returns true if it was added.
fn register_new_trial(active: Option<&mut ParamActive>, slot: Storage) -> bool {
    match active {
        Some(active) if active.which_trial(&slot).is_none() => {
            active.register_trial(slot);
            true
        }
        _ => false,
    }
}

/// True if the call performed by `op` may change `storage`.
fn call_affects(func: &Function, op: OpId, storage: &Storage) -> bool {
    func.call_spec_for(op)
        .is_none_or(|spec| spec.effect(storage) != EffectType::Unaffected)
}

/// Replaces a free read smaller than `range` by a SUBPIECE of a fresh full-size read.
///
/// Returns the new read.
fn normalize_read_size(func: &mut Function, value: ValueId, range: &Storage) -> Result<ValueId> {
    let reader = match func.value(value).descend() {
        [op] => *op,
        [op, ..] => {
            return Err(fatal_error!(
                func.op_address(*op),
                "Free value {} has multiple reads",
                value
            ))
        }
        [] => return Err(fatal_error!(range.addr, "Free value {} has no reads", value)),
    };
    let op = func.new_op(Opcode::SubPiece, func.op(reader).seq().pc);
    let whole = func.new_value_at(*range);
    let offset = refine::significance(func, range, &func.value(value).storage());
    let c = func.new_const(4, offset);
    func.set_input(op, whole, 0);
    func.set_input(op, c, 1);
    func.set_output(op, value);
    func.set_value_flags(value, ValueFlags::WRITEMASK);
    func.insert_before(op, reader)?;
    Ok(whole)
}

/// Produces the part `piece` of `range` that a narrow write leaves untouched.
fn untouched_piece(
    func: &mut Function,
    def: OpId,
    piece: Storage,
    range: &Storage,
    offset: u64,
) -> Result<ValueId> {
    if func.op(def).opcode().is_call() && call_affects(func, def, &piece) {
        let op = new_indirect_creation(func, def, &piece, false)?;
        return output_of(func, op);
    }
    let op = func.new_op(Opcode::SubPiece, func.op(def).seq().pc);
    let out = func.new_value_at(piece);
    func.set_output(op, out);
    let whole = func.new_value_at(*range);
    activate(func, whole);
    func.set_input(op, whole, 0);
    let c = func.new_const(4, offset);
    func.set_input(op, c, 1);
    func.insert_before(op, def)?;
    Ok(out)
}

/// Widens a write smaller than `range` into a full-size write.
///
/// The bytes the write leaves alone are read from the previous value of the range (or
/// created from nothing if a call clobbers them) and PIECEd together with the write.
/// Returns the new full-size write.
fn normalize_write_size(func: &mut Function, value: ValueId, range: &Storage) -> Result<ValueId> {
    let storage = func.value(value).storage();
    let def = func
        .value(value)
        .def()
        .ok_or_else(|| fatal_error!(storage.addr, "Write {} has no definition", value))?;
    let big_endian = func.space(range.addr.space).is_big_endian();
    let pc = func.op(def).seq().pc;
    let overlap = refine::significance(func, range, &storage) as u32;
    let most_size = range.size - (overlap + storage.size);

    let most = if most_size != 0 {
        let addr = if big_endian {
            range.addr
        } else {
            range.addr.add(u64::from(overlap + storage.size))
        };
        let piece = Storage::new(addr, most_size);
        let offset = u64::from(overlap + storage.size);
        Some(untouched_piece(func, def, piece, range, offset)?)
    } else {
        None
    };
    let least = if overlap != 0 {
        let addr = if big_endian {
            range.addr.add(u64::from(range.size - overlap))
        } else {
            range.addr
        };
        Some(untouched_piece(func, def, Storage::new(addr, overlap), range, 0)?)
    } else {
        None
    };

    let mid = match least {
        Some(least) => {
            let op = func.new_op(Opcode::Piece, pc);
            let addr = if big_endian { storage.addr } else { range.addr };
            let mid = func.new_value(addr, overlap + storage.size);
            func.set_output(op, mid);
            func.set_input(op, value, 0);
            func.set_input(op, least, 1);
            func.insert_after(op, def)?;
            mid
        }
        None => value,
    };
    let out = match most {
        Some(most) => {
            let op = func.new_op(Opcode::Piece, pc);
            let out = func.new_value_at(*range);
            func.set_output(op, out);
            func.set_input(op, most, 0);
            func.set_input(op, mid, 1);
            let after = func.value(mid).def().unwrap_or(def);
            func.insert_after(op, after)?;
            out
        }
        None => mid,
    };
    func.set_value_flags(value, ValueFlags::WRITEMASK);
    Ok(out)
}

/// Makes sure formal inputs tile `range`, joining several into one full-size value.
///
/// Gaps between inputs become new inputs. The PIECE of all of them is appended to `inputs`.
pub(super) fn guard_input(
    func: &mut Function,
    range: &Storage,
    inputs: &mut Vec<ValueId>,
) -> Result<()> {
    match inputs.as_slice() {
        [] => return Ok(()),
        [only] if func.value(*only).size() == range.size => return Ok(()),
        _ => {}
    }

    let space = range.addr.space;
    let end = range.end();
    let mut cur = u128::from(range.addr.offset);
    let mut next = 0;
    let mut pieces = Vec::new();
    while cur < end {
        let at = Address::new(space, cur as u64);
        let piece = match inputs.get(next) {
            Some(&v) if u128::from(func.value(v).addr().offset) > cur => {
                let gap = (u128::from(func.value(v).addr().offset) - cur) as u32;
                func.new_input(Storage::new(at, gap))
            }
            Some(&v) => {
                next += 1;
                v
            }
            None => func.new_input(Storage::new(at, (end - cur) as u32)),
        };
        pieces.push(piece);
        cur += u128::from(func.value(piece).size());
    }
    if pieces.len() <= 1 {
        return Ok(());
    }

    for &piece in &pieces {
        func.set_value_flags(piece, ValueFlags::WRITEMASK);
    }
    let whole = func.new_value_at(*range);
    refine::concat_pieces(func, &pieces, None, whole)?;
    activate(func, whole);
    inputs.push(whole);
    Ok(())
}

/// Registers the largest input slot inside `range` as a trial of the call and passes the
/// call a truncation of the range.
fn guard_call_overlapping_input(
    func: &mut Function,
    index: usize,
    range: &Storage,
    callee_range: &Storage,
) -> Result<()> {
    let spec = &func.call_specs()[index];
    let Some(slot) = spec.biggest_contained_input(callee_range) else {
        return Ok(());
    };
    if spec
        .active_input()
        .is_none_or(|active| active.which_trial(&slot).is_some())
    {
        return Ok(());
    }
    let call = spec.op();
    let truncate = refine::significance(func, callee_range, &slot);
    let diff = slot.addr.offset.wrapping_sub(callee_range.addr.offset);
    let local = Storage::new(range.addr.add(diff), slot.size);

    let sub = func.new_op(Opcode::SubPiece, func.op(call).seq().pc);
    let whole = func.new_value_at(*range);
    activate(func, whole);
    func.set_input(sub, whole, 0);
    let c = func.new_const(4, truncate);
    func.set_input(sub, c, 1);
    let part = func.new_value_at(local);
    func.set_output(sub, part);
    func.set_value_flags(part, ValueFlags::WRITEMASK);
    let n = func.op(call).num_inputs();
    func.insert_input(call, part, n);
    func.insert_before(sub, call)?;
    register_new_trial(func.call_specs_mut()[index].active_input_mut(), slot);
    Ok(())
}

/// Guards every registered call site against `range`.
fn guard_calls(
    func: &mut Function,
    fl: ValueFlags,
    range: &Storage,
    writes: &mut Vec<ValueId>,
) -> Result<()> {
    let hold = fl.contains(ValueFlags::ADDRTIED);
    for index in 0..func.call_specs().len() {
        let call = func.call_specs()[index].op();
        if func.op(call).is_dead() || func.parent(call).is_none() {
            continue;
        }
        if let Some(out) = func.op(call).output() {
            if func.value(out).storage() == *range {
                continue;
            }
        }

        // Stack locations are seen by the callee relative to the stack pointer at the call.
        let (callee_range, try_register) = if func.space(range.addr.space).kind() == SpaceKind::Stack {
            match func.call_specs()[index].stack_offset() {
                Some(off) => (
                    Storage::new(
                        Address::new(range.addr.space, range.addr.offset.wrapping_sub(off)),
                        range.size,
                    ),
                    true,
                ),
                None => (*range, false),
            }
        } else {
            (*range, true)
        };

        if try_register {
            match func.call_specs()[index].characterize_as_input(&callee_range) {
                Containment::ContainsJustified => {
                    let active = func.call_specs_mut()[index].active_input_mut();
                    if register_new_trial(active, callee_range) {
                        let v = func.new_value_at(*range);
                        activate(func, v);
                        let n = func.op(call).num_inputs();
                        func.insert_input(call, v, n);
                    }
                }
                Containment::ContainedBy => {
                    guard_call_overlapping_input(func, index, range, &callee_range)?;
                }
                Containment::ContainsUnjustified | Containment::NoContainment => {}
            }
        }

        let spec = &func.call_specs()[index];
        let mut effect = spec.effect(&callee_range);
        let mut possible_output = false;
        if spec.is_output_active() {
            let character = spec.characterize_as_output(&callee_range);
            if character != Containment::NoContainment {
                // A potential output is always killed by the call.
                effect = EffectType::KilledByCall;
                if character == Containment::ContainsJustified {
                    let active = func.call_specs_mut()[index].active_output_mut();
                    possible_output = register_new_trial(active, callee_range);
                }
            }
        }

        match effect {
            EffectType::Unknown | EffectType::ReturnAddress => {
                let op = new_indirect_op(func, call, range, OpFlags::empty())?;
                if let Some(input) = func.op(op).input(0) {
                    activate(func, input);
                }
                let out = output_of(func, op)?;
                activate(func, out);
                if hold {
                    func.set_value_flags(out, ValueFlags::ADDRFORCE);
                }
                if effect == EffectType::ReturnAddress {
                    func.set_value_flags(out, ValueFlags::RETURN_ADDRESS);
                }
                writes.push(out);
            }
            EffectType::KilledByCall => {
                let op = new_indirect_creation(func, call, range, possible_output)?;
                let out = output_of(func, op)?;
                activate(func, out);
                writes.push(out);
            }
            EffectType::Unaffected => {}
        }
    }
    Ok(())
}

/// Truncates `range` to the largest return slot inside it at every RETURN.
fn guard_returns_overlapping(func: &mut Function, range: &Storage, returns: &[OpId]) -> Result<()> {
    let Some(slot) = func.proto().biggest_contained_output(range) else {
        return Ok(());
    };
    if !register_new_trial(func.proto.active_output_mut(), slot) {
        return Ok(());
    }
    let offset = refine::significance(func, range, &slot);
    for &ret in returns {
        let sub = func.new_op(Opcode::SubPiece, func.op(ret).seq().pc);
        let whole = func.new_value_at(*range);
        activate(func, whole);
        func.set_input(sub, whole, 0);
        let c = func.new_const(4, offset);
        func.set_input(sub, c, 1);
        let part = func.new_value_at(slot);
        func.set_output(sub, part);
        func.set_value_flags(part, ValueFlags::WRITEMASK);
        func.insert_before(sub, ret)?;
        let n = func.op(ret).num_inputs();
        func.insert_input(ret, part, n);
    }
    Ok(())
}

/// Makes RETURNs read `range` if it may be the return value or must outlive the function.
fn guard_returns(func: &mut Function, fl: ValueFlags, range: &Storage) -> Result<()> {
    let returns: Vec<OpId> = func.ops_with(Opcode::Return).collect();

    if func.proto().active_output().is_some() {
        match func.proto().characterize_as_output(range) {
            Containment::ContainedBy => guard_returns_overlapping(func, range, &returns)?,
            Containment::NoContainment => {}
            Containment::ContainsJustified | Containment::ContainsUnjustified => {
                if register_new_trial(func.proto.active_output_mut(), *range) {
                    for &ret in &returns {
                        let v = func.new_value_at(*range);
                        activate(func, v);
                        let n = func.op(ret).num_inputs();
                        func.insert_input(ret, v, n);
                    }
                }
            }
        }
    }

    if !fl.contains(ValueFlags::PERSIST) {
        return Ok(());
    }
    for &ret in &returns {
        let copy = func.new_op(Opcode::Copy, func.op(ret).seq().pc);
        func.set_op_flags(copy, OpFlags::RETURN_COPY | OpFlags::STOP_COPY_PROP);
        let out = func.new_value_at(*range);
        func.set_output(copy, out);
        func.set_value_flags(out, ValueFlags::ADDRFORCE | ValueFlags::ACTIVE_HERITAGE);
        let input = func.new_value_at(*range);
        activate(func, input);
        func.set_input(copy, input, 0);
        func.insert_before(copy, ret)?;
    }
    Ok(())
}

impl Heritage {
    /// Normalizes the accesses of `range` to its full size and inserts every guard it needs.
    pub(super) fn guard(
        &mut self,
        func: &mut Function,
        range: &Storage,
        found: &mut Collected,
    ) -> Result<()> {
        for read in &mut found.reads {
            if func.value(*read).size() < range.size {
                *read = normalize_read_size(func, *read, range)?;
            }
            activate(func, *read);
        }
        for write in &mut found.writes {
            if func.value(*write).size() < range.size {
                *write = normalize_write_size(func, *write, range)?;
            }
            activate(func, *write);
        }

        let kind = func.space(range.addr.space).kind();
        let mut fl = found
            .reads
            .iter()
            .chain(&found.writes)
            .chain(&found.inputs)
            .fold(ValueFlags::empty(), |acc, v| {
                acc | (func.value(*v).flags() & (ValueFlags::ADDRTIED | ValueFlags::PERSIST))
            });
        if kind == SpaceKind::Ram {
            fl |= ValueFlags::ADDRTIED | ValueFlags::PERSIST;
        }

        guard_calls(func, fl, range, &mut found.writes)?;
        guard_returns(func, fl, range)?;
        if matches!(kind, SpaceKind::Stack | SpaceKind::Ram) {
            self.guard_stores(func, range, &mut found.writes)?;
            self.guard_loads(func, fl, range)?;
        }
        Ok(())
    }

    /// Adds an INDIRECT at every STORE that may write into `range`.
    fn guard_stores(
        &self,
        func: &mut Function,
        range: &Storage,
        writes: &mut Vec<ValueId>,
    ) -> Result<()> {
        let space = range.addr.space;
        let container = func.space(space).contain();
        let stores: Vec<OpId> = func.ops_with(Opcode::Store).collect();
        for store in stores {
            let Some(target) = access_space(func, store) else {
                continue;
            };
            let through_pointer = Some(target) == container
                && self
                    .guards
                    .iter()
                    .any(|g| g.op() == store && g.may_alias(range));
            if target != space && !through_pointer {
                continue;
            }
            let op = new_indirect_op(func, store, range, OpFlags::INDIRECT_STORE)?;
            if let Some(input) = func.op(op).input(0) {
                activate(func, input);
            }
            let out = output_of(func, op)?;
            activate(func, out);
            writes.push(out);
        }
        Ok(())
    }

    /// Adds a COPY of `range` ahead of every guarded LOAD that may read it.
    ///
    /// Only address-tied ranges are considered; anything else cannot be reached through a
    /// pointer.
    fn guard_loads(&mut self, func: &mut Function, fl: ValueFlags, range: &Storage) -> Result<()> {
        if !fl.contains(ValueFlags::ADDRTIED) {
            return Ok(());
        }
        self.guards.retain(|g| {
            let op = func.op(g.op());
            !op.is_dead()
                && op.parent().is_some()
                && matches!(op.opcode(), Opcode::Load | Opcode::Store)
        });
        let loads: Vec<OpId> = self
            .guards
            .iter()
            .filter(|g| func.op(g.op()).opcode() == Opcode::Load && g.may_alias(range))
            .map(|g| g.op())
            .collect();

        for load in loads {
            let copy = func.new_op(Opcode::Copy, func.op(load).seq().pc);
            func.set_op_flags(copy, OpFlags::LOAD_GUARD);
            let out = func.new_value_at(*range);
            func.set_output(copy, out);
            func.set_value_flags(out, ValueFlags::ACTIVE_HERITAGE | ValueFlags::ADDRFORCE);
            let input = func.new_value_at(*range);
            activate(func, input);
            func.set_input(copy, input, 0);
            func.insert_before(copy, load)?;
            self.load_copies.push(copy);
        }
        Ok(())
    }
}
