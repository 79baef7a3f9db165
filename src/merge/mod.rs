//! Merging SSA values into logical variables.
//!
//! After heritage every value is its own variable. The merge engine coalesces them back
//! into the variables a reader of the decompiled code expects, using live-range
//! ([`Cover`](crate::cover::Cover)) interference to decide what may share a name.
//!
//! # Disciplines
//!
//! - **Required**: the inputs and output of every MULTIEQUAL and INDIRECT must end up in
//!   one variable. When that is illegal, the engine *trims*: a COPY isolates an input (or,
//!   as a last resort, the output) into a fresh temporary whose live range is a single
//!   point, and the merge is retried. Running out of trims is fatal.
//! - **Speculative**: merges that only reduce the variable count (COPY inputs and outputs,
//!   equal data-types at one storage location, address-tied storage, adjacent operands).
//!   They are skipped whenever a test fails; the IR is never changed for them.
//!
//! Afterwards [`copies`] removes the COPYs that merging made pointless, and
//! [`Merge::verify_high_covers`] re-checks that no two members of a variable interfere.
//!
//! # Usage
//!
//! ```rust,ignore
//! use heritage::{HeritageConfig, Merge};
//!
//! let mut merge = Merge::new(HeritageConfig::default());
//! merge.run(&mut func)?;
//! for (id, high) in func.highs() {
//!     println!("{id}: {:?}", high.instances());
//! }
//! ```

pub mod copies;
mod high;

pub use high::{conflicting_instances, copy_shadow, HighIntersectTest, HighVariable, SymbolEntry};

use std::collections::BTreeMap;

use crate::{
    config::HeritageConfig,
    cover::Intersection,
    error::{fatal_error, MergeError},
    events::EventKind,
    graph::{compute_dominators, DominatorTree},
    ir::{Address, Function, HighId, OpFlags, OpId, Opcode, Storage, TypeId, ValueFlags, ValueId},
    Error, Result,
};

/// Which eligibility rules apply to a candidate merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discipline {
    /// Structurally required; only contradictions between the two variables block it.
    Required,
    /// Optional; additionally refuses globals, inputs and address-tied storage.
    Speculative,
    /// Unification of a multi-entry symbol; only data-type locks block it.
    Symbol,
}

/// Checks the rules a merge must satisfy apart from live-range interference.
fn eligible(
    func: &Function,
    a: HighId,
    b: HighId,
    discipline: Discipline,
) -> Result<(), MergeError> {
    if a == b {
        return Ok(());
    }
    let (ha, hb) = (func.high(a), func.high(b));
    if let (Some(ta), Some(tb)) = (ha.type_lock(), hb.type_lock()) {
        if ta != tb {
            return Err(MergeError::TypeLock);
        }
    }
    if discipline == Discipline::Symbol {
        return Ok(());
    }

    if let (Some(sa), Some(sb)) = (ha.tied_storage(), hb.tied_storage()) {
        if sa.addr != sb.addr {
            return Err(MergeError::AddrTied);
        }
    }
    for (input, other) in [(ha, hb), (hb, ha)] {
        if input.is_input() && (other.is_persist() || (other.is_addr_tied() && !input.is_addr_tied()))
        {
            return Err(MergeError::InputPersist);
        }
    }
    if let (Some(sa), Some(sb)) = (ha.symbol(), hb.symbol()) {
        if sa != sb {
            return Err(MergeError::SymbolOffset);
        }
    }
    if let (Some(ga), Some(gb)) = (ha.overlap_group(), hb.overlap_group()) {
        if ga != gb {
            return Err(MergeError::OverlapGroup);
        }
    }

    if discipline == Discipline::Speculative {
        if ha.is_persist() || hb.is_persist() || ha.is_input() || hb.is_input() {
            return Err(MergeError::InputPersist);
        }
        if ha.is_addr_tied() || hb.is_addr_tied() {
            return Err(MergeError::AddrTied);
        }
    }
    Ok(())
}

/// The merge engine for one function.
#[derive(Debug)]
pub struct Merge {
    /// Switches speculative merging on or off.
    config: HeritageConfig,
    /// Memoized interference results.
    tests: HighIntersectTest,
    /// COPYs inserted by trims, for the redundant-copy cleanup.
    copy_trims: Vec<OpId>,
    /// Dominator tree of the function being merged.
    dominators: Option<DominatorTree>,
    /// Next free overlap group number.
    next_group: usize,
}

impl Merge {
    /// Creates an engine.
    #[must_use]
    pub fn new(config: HeritageConfig) -> Self {
        Self {
            config,
            tests: HighIntersectTest::new(),
            copy_trims: Vec::new(),
            dominators: None,
            next_group: 0,
        }
    }

    /// COPYs inserted by trims so far.
    pub fn copy_trims(&self) -> &[OpId] {
        &self.copy_trims
    }

    /// Runs every merge discipline and the cleanups over `func`.
    pub fn run(&mut self, func: &mut Function) -> Result<()> {
        func.create_highs();
        self.dominators = Some(compute_dominators(&*func, func.entry_block()));

        self.group_partials(func);
        self.merge_marker(func)?;
        self.merge_multi_entry(func);
        if self.config.speculative_merges {
            self.merge_addr_tied(func);
            self.merge_opcode(func, Opcode::Copy);
            self.merge_by_datatype(func);
            self.merge_adjacent(func);
        }
        self.process_copy_trims(func)?;
        self.mark_internal_copies(func);
        self.verify_high_covers(func)?;

        log::debug!(
            "{}: merged into {} variables with {} trims",
            func.name(),
            func.highs().count(),
            self.copy_trims.len()
        );
        Ok(())
    }

    /// Logical variable of `value`, creating one if the value has a live range but none yet.
    fn high_of(&mut self, func: &mut Function, value: ValueId) -> Option<HighId> {
        if let Some(high) = func.value(value).high() {
            return Some(high);
        }
        if !func.value(value).has_cover() {
            return None;
        }
        func.update_cover(value);
        Some(func.new_high(value))
    }

    /// Recomputes covers after `values` changed definition or readers.
    fn refresh(&mut self, func: &mut Function, values: &[ValueId]) {
        if func.covers_dirty() {
            func.update_covers();
            let live: Vec<HighId> = func.highs().map(|(id, _)| id).collect();
            for high in live {
                func.mark_high_dirty(high);
            }
            self.tests.clear();
        } else {
            for &value in values {
                func.update_cover(value);
                if let Some(high) = func.value(value).high() {
                    func.mark_high_dirty(high);
                    self.tests.invalidate(high);
                }
            }
        }
        for &value in values {
            self.high_of(func, value);
        }
    }

    fn interference(
        &mut self,
        func: &mut Function,
        a: HighId,
        b: HighId,
    ) -> Option<(ValueId, ValueId)> {
        func.update_high_cover(a);
        func.update_high_cover(b);
        self.tests.intersection(func, a, b)
    }

    /// Merges `b` into `a` if the discipline's rules and the live ranges allow it.
    fn merge_pair(
        &mut self,
        func: &mut Function,
        a: HighId,
        b: HighId,
        discipline: Discipline,
    ) -> Result<HighId, MergeError> {
        if a == b {
            return Ok(a);
        }
        eligible(func, a, b, discipline)?;
        if let Some((va, vb)) = self.interference(func, a, b) {
            return Err(MergeError::CoverIntersection(va, vb));
        }
        func.merge_highs(a, b);
        self.tests.invalidate(a);
        self.tests.invalidate(b);
        Ok(a)
    }

    /// Adds `high` to `list` unless it interferes with a variable already there.
    fn merge_test(&mut self, func: &mut Function, high: HighId, list: &mut Vec<HighId>) -> bool {
        if list.contains(&high) {
            return true;
        }
        for i in 0..list.len() {
            if self.interference(func, list[i], high).is_some() {
                return false;
            }
        }
        list.push(high);
        true
    }

    /// True if the output and the first `max` inputs of `op` are pairwise free of
    /// interference.
    fn cover_test(&mut self, func: &mut Function, op: OpId, max: usize) -> bool {
        let mut list = Vec::new();
        let slots: Vec<ValueId> = func
            .op(op)
            .output()
            .into_iter()
            .chain(func.op(op).inputs()[..max].iter().copied())
            .collect();
        for value in slots {
            let Some(high) = self.high_of(func, value) else {
                return false;
            };
            if !self.merge_test(func, high, &mut list) {
                return false;
            }
        }
        true
    }

    /// Isolates input `slot` of `op` behind a COPY into a fresh temporary.
    ///
    /// For a phi-node the COPY goes at the end of the matching predecessor, otherwise right
    /// before `op`.
    pub fn trim_op_input(&mut self, func: &mut Function, op: OpId, slot: usize) -> Result<ValueId> {
        let vn = func
            .op(op)
            .input(slot)
            .ok_or_else(|| fatal_error!(func.op_address(op), "{} has no input {}", op, slot))?;
        let block = func
            .parent(op)
            .ok_or_else(|| fatal_error!(func.op_address(op), "{} is not placed", op))?;
        let pred = if func.op(op).opcode() == Opcode::MultiEqual {
            let edge = func.block(block).ins().get(slot).ok_or_else(|| {
                fatal_error!(func.op_address(op), "{} has no incoming edge {}", op, slot)
            })?;
            Some(edge.point)
        } else {
            None
        };
        let pc = match pred {
            Some(pred) => {
                let b = func.block(pred);
                b.ops().last().map_or(b.start(), |last| func.op(*last).seq().pc)
            }
            None => func.op(op).seq().pc,
        };

        let copy = func.new_op(Opcode::Copy, pc);
        func.set_op_flags(copy, OpFlags::TRIM_COPY);
        let out = func.new_unique(func.value(vn).size());
        if let Some(dtype) = func.value(vn).data_type() {
            func.set_data_type(out, dtype);
        }
        func.set_output(copy, out);
        func.set_input(copy, vn, 0);
        func.set_input(op, out, slot);
        match pred {
            Some(pred) => func.insert_end(copy, pred),
            None => func.insert_before(copy, op)?,
        }
        self.copy_trims.push(copy);
        self.refresh(func, &[vn, out]);
        log::trace!("trimmed input {slot} of {op} with {copy}");
        Ok(out)
    }

    /// Moves the output of `op` into a fresh temporary that a COPY right after `op` (after
    /// the paired op for an INDIRECT) writes back to the original value.
    pub fn trim_op_output(&mut self, func: &mut Function, op: OpId) -> Result<ValueId> {
        let vn = func
            .op(op)
            .output()
            .ok_or_else(|| fatal_error!(func.op_address(op), "{} has no output", op))?;
        if func.op(op).opcode() == Opcode::Indirect && func.indirect_target(op).is_none() {
            return Err(fatal_error!(
                func.op_address(op),
                "Could not find op associated with indirect {}",
                op
            ));
        }
        let uniq = func.new_unique(func.value(vn).size());
        if let Some(dtype) = func.value(vn).data_type() {
            func.set_data_type(uniq, dtype);
        }
        func.set_output(op, uniq);
        let copy = func.new_op(Opcode::Copy, func.op(op).seq().pc);
        func.set_op_flags(copy, OpFlags::TRIM_COPY);
        func.set_output(copy, vn);
        func.set_input(copy, uniq, 0);
        func.insert_after(copy, op)?;
        self.copy_trims.push(copy);
        self.refresh(func, &[vn, uniq]);
        log::trace!("trimmed output of {op} with {copy}");
        Ok(uniq)
    }

    /// Cuts the input of an address-forced INDIRECT off with a COPY, so its output can
    /// take over the storage at the paired op.
    pub fn snip_indirect(&mut self, func: &mut Function, op: OpId) -> Result<ValueId> {
        if func.indirect_target(op).is_none() {
            return Err(fatal_error!(
                func.op_address(op),
                "Could not find op associated with indirect {}",
                op
            ));
        }
        self.trim_op_input(func, op, 0)
    }

    /// Forces the output and inputs of a MULTIEQUAL or INDIRECT into one variable,
    /// trimming until that is legal.
    ///
    /// Only input 0 of an INDIRECT takes part.
    pub fn merge_op_input_output(&mut self, func: &mut Function, op: OpId) -> Result<()> {
        let max = if func.op(op).opcode() == Opcode::Indirect {
            1
        } else {
            func.op(op).num_inputs()
        };
        let out = func
            .op(op)
            .output()
            .ok_or_else(|| fatal_error!(func.op_address(op), "{} has no output", op))?;
        self.high_of(func, out);

        // Inputs without a live range of their own (constants) need a temporary.
        for slot in 0..max {
            let Some(vn) = func.op(op).input(slot) else {
                continue;
            };
            if self.high_of(func, vn).is_none() {
                self.trim_op_input(func, op, slot)?;
            }
        }

        // Non-cover restrictions first.
        for i in 0..max {
            let hout = self.required_high(func, op, None)?;
            let hin = self.required_high(func, op, Some(i))?;
            if eligible(func, hout, hin, Discipline::Required).is_err() {
                self.trim_op_input(func, op, i)?;
                continue;
            }
            for j in 0..i {
                let hj = self.required_high(func, op, Some(j))?;
                if eligible(func, hj, hin, Discipline::Required).is_err() {
                    self.trim_op_input(func, op, i)?;
                    break;
                }
            }
        }

        if !self.cover_test(func, op, max) {
            let addr = func.op_address(op);
            let mut next = 0;
            while next < max {
                self.trim_op_input(func, op, next)?;
                if self.cover_test(func, op, max) {
                    break;
                }
                next += 1;
            }
            if next == max {
                self.trim_op_output(func, op)?;
            }
            func.warnings().warn(
                EventKind::ForcedSplit,
                addr,
                format!("Live ranges around {} {} separated by COPY", func.op(op).opcode(), op),
            );
        }

        for i in 0..max {
            let hout = self.required_high(func, op, None)?;
            let hin = self.required_high(func, op, Some(i))?;
            match self.merge_pair(func, hout, hin, Discipline::Required) {
                Ok(_) => {}
                Err(MergeError::CoverIntersection(..)) => {
                    return Err(Error::Merge(MergeError::Exhausted(op)));
                }
                Err(e) => {
                    return Err(fatal_error!(
                        func.op_address(op),
                        "Non-cover merge restriction violated despite trims: {}",
                        e
                    ));
                }
            }
        }
        Ok(())
    }

    /// Variable of the output (`None`) or input `slot` of `op`.
    fn required_high(
        &mut self,
        func: &mut Function,
        op: OpId,
        slot: Option<usize>,
    ) -> Result<HighId> {
        let value = match slot {
            Some(slot) => func.op(op).input(slot),
            None => func.op(op).output(),
        };
        value
            .and_then(|v| self.high_of(func, v))
            .ok_or_else(|| fatal_error!(func.op_address(op), "{} operand without a variable", op))
    }

    /// Required merge of an INDIRECT. An address-forced output must stay in its storage,
    /// so a conflicting input is snipped off instead of trimming the output.
    fn merge_indirect(&mut self, func: &mut Function, op: OpId) -> Result<()> {
        let Some(out) = func.op(op).output() else {
            return Err(fatal_error!(func.op_address(op), "{} has no output", op));
        };
        if !func.value(out).flags().contains(ValueFlags::ADDRFORCE) {
            return self.merge_op_input_output(func, op);
        }
        if let Some(input) = func.op(op).input(0) {
            if self.high_of(func, input).is_none() {
                self.trim_op_input(func, op, 0)?;
            }
        }
        let hout = self.required_high(func, op, None)?;
        let hin = self.required_high(func, op, Some(0))?;
        if self.merge_pair(func, hout, hin, Discipline::Required).is_ok() {
            return Ok(());
        }

        self.snip_indirect(func, op)?;
        let hout = self.required_high(func, op, None)?;
        let hin = self.required_high(func, op, Some(0))?;
        self.merge_pair(func, hout, hin, Discipline::Required)
            .map(|_| ())
            .map_err(|_| fatal_error!(func.op_address(op), "Unable to merge address forced indirect {}", op))
    }

    /// Runs the required merges over every phi-node and INDIRECT.
    pub fn merge_marker(&mut self, func: &mut Function) -> Result<()> {
        let markers: Vec<OpId> = func
            .ops()
            .filter(|o| func.op(*o).opcode().is_marker())
            .collect();
        for op in markers {
            if func.op(op).is_dead() || func.parent(op).is_none() {
                continue;
            }
            match func.op(op).opcode() {
                Opcode::MultiEqual => self.merge_op_input_output(func, op)?,
                Opcode::Indirect if func.op(op).flags().contains(OpFlags::INDIRECT_CREATION) => {}
                Opcode::Indirect => self.merge_indirect(func, op)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Puts the pieces of every PIECE whose inputs lie inside its output's storage into one
    /// overlap group, so they are never merged with an unrelated overlapping variable.
    pub fn group_partials(&mut self, func: &mut Function) {
        let pieces: Vec<OpId> = func.ops_with(Opcode::Piece).collect();
        for op in pieces {
            let Some(out) = func.op(op).output() else {
                continue;
            };
            let whole = func.value(out).storage();
            let inputs = func.op(op).inputs().to_vec();
            if !inputs.iter().all(|v| whole.contains(&func.value(*v).storage())) {
                continue;
            }
            let Some(hout) = self.high_of(func, out) else {
                continue;
            };
            let group = match func.high(hout).overlap_group() {
                Some(g) => g,
                None => {
                    self.next_group += 1;
                    func.highs[hout.index()].overlap_group = Some(self.next_group);
                    self.next_group
                }
            };
            for v in inputs {
                let Some(high) = self.high_of(func, v) else {
                    continue;
                };
                if func.high(high).overlap_group().is_none() {
                    func.highs[high.index()].overlap_group = Some(group);
                    self.tests.invalidate(high);
                }
            }
        }
    }

    /// Speculatively merges each input of every `opcode` op with its output.
    pub fn merge_opcode(&mut self, func: &mut Function, opcode: Opcode) {
        let ops: Vec<OpId> = func.ops_with(opcode).collect();
        for op in ops {
            let Some(out) = func.op(op).output() else {
                continue;
            };
            for slot in 0..func.op(op).num_inputs() {
                let Some(input) = func.op(op).input(slot) else {
                    continue;
                };
                let (Some(hout), Some(hin)) = (self.high_of(func, out), self.high_of(func, input)) else {
                    continue;
                };
                // Skipped on failure.
                let _ = self.merge_pair(func, hout, hin, Discipline::Speculative);
            }
        }
    }

    /// Speculatively merges the output of ordinary ops with same-sized, same-typed inputs.
    pub fn merge_adjacent(&mut self, func: &mut Function) {
        let ops: Vec<OpId> = func
            .ops()
            .filter(|o| {
                let opcode = func.op(*o).opcode();
                !opcode.is_marker() && !opcode.is_call() && opcode != Opcode::Copy
            })
            .collect();
        for op in ops {
            let Some(out) = func.op(op).output() else {
                continue;
            };
            for slot in 0..func.op(op).num_inputs() {
                let Some(input) = func.op(op).input(slot) else {
                    continue;
                };
                let (vo, vi) = (func.value(out), func.value(input));
                if vo.size() != vi.size() || vo.data_type() != vi.data_type() {
                    continue;
                }
                let (Some(hout), Some(hin)) = (self.high_of(func, out), self.high_of(func, input)) else {
                    continue;
                };
                let _ = self.merge_pair(func, hout, hin, Discipline::Speculative);
            }
        }
    }

    /// Sort key for greedy group merging: earliest live point, storage, then definition
    /// address.
    fn group_key(&mut self, func: &mut Function, high: HighId) -> (usize, u32, Address, u64) {
        func.update_high_cover(high);
        let h = func.high(high);
        let (block, pos) = h.cover().first_point().unwrap_or((usize::MAX, u32::MAX));
        let first = h.instances().first().copied();
        let addr = first.map_or(Address::new(func.constant_space(), 0), |v| func.value(v).addr());
        let pc = first
            .and_then(|v| func.value(v).def())
            .map_or(0, |op| func.op(op).seq().pc);
        (block, pos, addr, pc)
    }

    /// Merges each variable of `group` into the first earlier accumulator that accepts it.
    ///
    /// Returns the number of variables that found no accumulator besides the first.
    fn merge_group(&mut self, func: &mut Function, group: Vec<HighId>, discipline: Discipline) -> usize {
        let mut keyed: Vec<_> = group
            .into_iter()
            .map(|h| (self.group_key(func, h), h))
            .collect();
        keyed.sort();
        keyed.dedup_by_key(|(_, h)| *h);

        let mut accumulators: Vec<HighId> = Vec::new();
        for (_, high) in keyed {
            if func.high(high).is_dead() {
                continue;
            }
            let mut merged = false;
            for acc in accumulators.clone() {
                if self.merge_pair(func, acc, high, discipline).is_ok() {
                    merged = true;
                    break;
                }
            }
            if !merged {
                accumulators.push(high);
            }
        }
        accumulators.len().saturating_sub(1)
    }

    /// Speculatively merges variables holding the same data-type at the same storage.
    pub fn merge_by_datatype(&mut self, func: &mut Function) {
        let mut groups: BTreeMap<(Storage, TypeId), Vec<HighId>> = BTreeMap::new();
        for (_, v) in func.values() {
            let (Some(high), Some(dtype)) = (v.high(), v.data_type()) else {
                continue;
            };
            groups.entry((v.storage(), dtype)).or_default().push(high);
        }
        for (_, group) in groups {
            self.merge_group(func, group, Discipline::Speculative);
        }
    }

    /// Merges address-tied variables occupying the same storage where their live ranges
    /// allow it.
    pub fn merge_addr_tied(&mut self, func: &mut Function) {
        let mut groups: BTreeMap<Storage, Vec<HighId>> = BTreeMap::new();
        for (id, high) in func.highs() {
            if let Some(storage) = high.tied_storage() {
                groups.entry(storage).or_default().push(id);
            }
        }
        for (_, group) in groups {
            self.merge_group(func, group, Discipline::Required);
        }
    }

    /// Unifies the variables bound to each symbol stored in several locations.
    ///
    /// A symbol whose pieces interfere keeps several variables and gets a warning.
    pub fn merge_multi_entry(&mut self, func: &mut Function) {
        for index in 0..func.symbols().len() {
            let symbol = &func.symbols()[index];
            if !symbol.is_multi_entry() {
                continue;
            }
            let id = symbol.id();
            let name = symbol.name().to_string();
            let addr = symbol.entries()[0].addr;
            let group: Vec<HighId> = func
                .highs()
                .filter(|(_, h)| h.symbol().is_some_and(|s| s.symbol == id))
                .map(|(hid, _)| hid)
                .collect();
            if self.merge_group(func, group, Discipline::Symbol) > 0 {
                func.warnings().warn(
                    EventKind::MultiEntryConflict,
                    addr,
                    format!("Unable to merge multi-entry symbol: {name}"),
                );
            }
        }
    }

    /// Checks that no two members of any variable interfere.
    ///
    /// Members that are copy shadows of one another are allowed to overlap.
    pub fn verify_high_covers(&self, func: &Function) -> Result<()> {
        for (_, high) in func.highs() {
            let members = high.instances();
            for (i, &a) in members.iter().enumerate() {
                let Some(ca) = func.value(a).cover() else {
                    continue;
                };
                for &b in &members[i + 1..] {
                    let Some(cb) = func.value(b).cover() else {
                        continue;
                    };
                    if ca.intersect(cb) == Intersection::Overlap
                        && !copy_shadow(func, a, b)
                    {
                        return Err(MergeError::CoverIntersection(a, b).into());
                    }
                }
            }
        }
        Ok(())
    }
}
