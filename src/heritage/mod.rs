//! SSA construction ("heritage") for storage-addressed values.
//!
//! Heritage links every read of a storage location to the definition that reaches it. It
//! runs in passes: each pass picks up the address spaces whose delay has elapsed, groups
//! their unlinked values into disjoint storage ranges, and links each range independently.
//!
//! # Pass Overview
//!
//! For every range selected in a pass:
//!
//! 1. **Collect**: gather the free reads, writes and formal inputs starting in the range
//! 2. **Refine**: if every access is smaller than the range, cut it at access boundaries
//! 3. **Guard**: normalize accesses to the full range and make implicit effects of calls,
//!    returns, stores and loads explicit
//! 4. **Place phi-nodes**: at the iterated dominance frontier of the writing blocks
//!
//! A single dominator-tree walk then renames every range of the pass at once.
//!
//! # Delays and Revisits
//!
//! The stack space is linked one pass late so that the stack pointer is already in SSA form
//! when pointer-based accesses are traced. A range that gains new reads after dead-code
//! removal ran on its space cannot be linked soundly any more; the driver is told to restart
//! the function with a larger dead-code delay through [`Heritage::needs_restart`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use heritage::{Heritage, HeritageConfig};
//!
//! let mut heritage = Heritage::new(HeritageConfig::default());
//! heritage.run(&mut func)?;
//! if heritage.needs_restart() {
//!     // rebuild the function from raw IR, call heritage.clear() and run again
//! }
//! ```

pub mod dominance;
mod guard;
pub mod loadguard;
pub mod location;
pub mod refine;
mod rename;
pub mod valueset;

pub use dominance::Dominance;
pub use loadguard::{GuardState, LoadGuard, PointerTrace};
pub use location::{Intersect, LocationMap, SizePass};
pub use valueset::{SolveOutcome, ValueSet, ValueSetSolver};

use rustc_hash::FxHashMap;

use crate::{
    config::HeritageConfig,
    error::fatal_error,
    events::EventKind,
    ir::{
        AddrSpace, Address, BlockId, Function, OpId, Opcode, SpaceId, SpaceKind, Storage,
        ValueFlags, ValueId,
    },
    Error, Result,
};

/// Heritage status of one address space.
#[derive(Debug, Clone)]
pub struct HeritageInfo {
    space: SpaceId,
    heritaged: bool,
    delay: u32,
    deadcode_delay: u32,
    dead_removed: bool,
    warning_issued: bool,
    loads_checked: bool,
}

impl HeritageInfo {
    fn new(space: &AddrSpace, config: &HeritageConfig, deadcode_override: Option<u32>) -> Self {
        let delay = if space.delay() > 0 {
            space.delay()
        } else {
            config.default_delay
        };
        let deadcode_delay = space
            .deadcode_delay()
            .max(config.default_deadcode_delay)
            .max(deadcode_override.unwrap_or(0))
            .max(delay);
        Self {
            space: space.id(),
            heritaged: space.kind().is_heritaged(),
            delay,
            deadcode_delay,
            dead_removed: false,
            warning_issued: false,
            loads_checked: false,
        }
    }

    /// The space described.
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// True if values in the space are linked at all.
    pub fn is_heritaged(&self) -> bool {
        self.heritaged
    }

    /// Pass in which the space is first linked.
    pub fn delay(&self) -> u32 {
        self.delay
    }

    /// Last pass before dead-code removal may touch the space.
    pub fn deadcode_delay(&self) -> u32 {
        self.deadcode_delay
    }

    /// True once dead-code removal has run on the space.
    pub fn dead_removed(&self) -> bool {
        self.dead_removed
    }

    /// True once the revisit warning has been issued for the space.
    pub fn warning_issued(&self) -> bool {
        self.warning_issued
    }

    /// True once pointer-based accesses into the space have been looked for.
    pub fn loads_checked(&self) -> bool {
        self.loads_checked
    }
}

/// Values starting inside one storage range, grouped by role.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    /// Free reads.
    pub reads: Vec<ValueId>,
    /// Written values, excluding markers smaller than the range.
    pub writes: Vec<ValueId>,
    /// Formal inputs.
    pub inputs: Vec<ValueId>,
    /// Phi-node and INDIRECT outputs left by an earlier pass at a smaller granularity.
    pub removes: Vec<ValueId>,
    /// Size of the largest read, write or input.
    pub max_size: u32,
}

/// The heritage pass driver for one function.
#[derive(Debug)]
pub struct Heritage {
    /// Solver bounds, default delays and the refinement heuristic switch.
    config: HeritageConfig,

    /// Number of completed passes.
    pass: u32,

    /// Every range linked so far, tagged with the pass that first linked it.
    global: LocationMap,

    /// Ranges being linked in the current pass.
    disjoint: LocationMap,

    /// Status per address space, indexed by space.
    infos: Vec<HeritageInfo>,

    /// Dead-code delays requested for the next run of the function.
    deadcode_overrides: FxHashMap<SpaceId, u32>,

    /// Dominator tree and ADT, rebuilt when the block structure changes.
    dominance: Option<Dominance>,

    /// Guards for pointer-based LOADs and STOREs into the stack.
    guards: Vec<LoadGuard>,

    /// COPYs inserted to keep stack ranges alive across guarded LOADs.
    load_copies: Vec<OpId>,

    /// Set when a revisit after dead-code removal requires the function to be redone.
    needs_restart: bool,
}

impl Heritage {
    /// Creates a driver with no passes run.
    #[must_use]
    pub fn new(config: HeritageConfig) -> Self {
        Self {
            config,
            pass: 0,
            global: LocationMap::new(),
            disjoint: LocationMap::new(),
            infos: Vec::new(),
            deadcode_overrides: FxHashMap::default(),
            dominance: None,
            guards: Vec::new(),
            load_copies: Vec::new(),
            needs_restart: false,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &HeritageConfig {
        &self.config
    }

    /// Number of completed passes.
    pub fn pass(&self) -> u32 {
        self.pass
    }

    /// True if a revisit after dead-code removal was detected.
    ///
    /// The links made for the revisited range are not trustworthy. The function should be
    /// rebuilt from its raw IR and linked again after [`Heritage::clear`], which keeps the
    /// raised dead-code delays.
    pub fn needs_restart(&self) -> bool {
        self.needs_restart
    }

    /// Status of a space, once the space has been seen by a pass.
    pub fn info(&self, space: SpaceId) -> Option<&HeritageInfo> {
        self.infos.get(space.index())
    }

    /// Pointer-access guards found so far.
    pub fn guards(&self) -> &[LoadGuard] {
        &self.guards
    }

    /// COPYs inserted ahead of guarded LOADs.
    pub fn load_copies(&self) -> &[OpId] {
        &self.load_copies
    }

    /// Dominance information of the last pass.
    pub fn dominance(&self) -> Option<&Dominance> {
        self.dominance.as_ref()
    }

    /// Pass in which the byte at `addr` was first linked.
    pub fn heritage_pass(&self, addr: Address) -> Option<u32> {
        self.global.find_pass(addr)
    }

    /// Number of passes that have linked `space`.
    pub fn num_heritage_passes(&self, space: SpaceId) -> u32 {
        match self.info(space) {
            Some(info) if info.heritaged => self.pass.saturating_sub(info.delay),
            _ => 0,
        }
    }

    /// Dead-code delay of `space`.
    pub fn deadcode_delay(&self, space: SpaceId) -> Option<u32> {
        self.info(space).map(HeritageInfo::deadcode_delay)
    }

    /// Sets the dead-code delay of `space`. It may not be smaller than the linking delay.
    pub fn set_deadcode_delay(
        &mut self,
        func: &Function,
        space: SpaceId,
        delay: u32,
    ) -> Result<()> {
        self.sync_infos(func);
        let info = &mut self.infos[space.index()];
        if delay < info.delay {
            return Err(fatal_error!(
                Address::new(space, 0),
                "Dead-code delay {} below linking delay {}",
                delay,
                info.delay
            ));
        }
        info.deadcode_delay = delay;
        Ok(())
    }

    /// True if dead-code removal may run on `space`.
    pub fn dead_removal_allowed(&self, space: SpaceId) -> bool {
        self.info(space)
            .is_some_and(|info| self.pass > info.deadcode_delay)
    }

    /// Like [`Heritage::dead_removal_allowed`], and records that removal ran if allowed.
    pub fn dead_removal_allowed_seen(&mut self, space: SpaceId) -> bool {
        let allowed = self.dead_removal_allowed(space);
        if allowed {
            self.infos[space.index()].dead_removed = true;
        }
        allowed
    }

    /// Records that dead-code removal ran on `space`.
    pub fn seen_dead_code(&mut self, space: SpaceId) {
        if let Some(info) = self.infos.get_mut(space.index()) {
            info.dead_removed = true;
        }
    }

    /// Forgets all passes, ranges and guards. Dead-code delays raised by revisits are kept.
    pub fn clear(&mut self) {
        self.pass = 0;
        self.global.clear();
        self.disjoint.clear();
        self.infos.clear();
        self.dominance = None;
        self.guards.clear();
        self.load_copies.clear();
        self.needs_restart = false;
    }

    /// Runs passes until every heritaged space has been linked at least once, or a restart
    /// is required.
    pub fn run(&mut self, func: &mut Function) -> Result<()> {
        loop {
            self.heritage(func)?;
            let pending = self
                .infos
                .iter()
                .any(|info| info.heritaged && info.delay >= self.pass);
            if self.needs_restart || !pending {
                return Ok(());
            }
        }
    }

    /// Runs one heritage pass.
    pub fn heritage(&mut self, func: &mut Function) -> Result<()> {
        self.sync_infos(func);
        let version = func.structure_version();
        if self
            .dominance
            .as_ref()
            .is_none_or(|d| d.version() != version)
        {
            self.dominance = Some(Dominance::build(&*func, version));
        }

        for index in 0..self.infos.len() {
            let info = &self.infos[index];
            if !info.heritaged || self.pass < info.delay {
                continue;
            }
            let space = info.space;
            if func.space(space).kind() == SpaceKind::Stack && !info.loads_checked {
                self.infos[index].loads_checked = true;
                self.discover_stack_guards(func, space);
            }
            self.select_ranges(func, space);
        }

        let ranges = self.disjoint.len();
        self.place_multiequals(func)?;
        self.rename(func)?;
        log::debug!(
            "{}: heritage pass {} linked {} ranges",
            func.name(),
            self.pass,
            ranges
        );
        self.disjoint.clear();
        self.pass += 1;
        Ok(())
    }

    /// Values starting inside `range`, grouped by role.
    pub fn collect(func: &Function, range: &Storage) -> Collected {
        let mut found = Collected::default();
        for id in func.values_starting_in(range) {
            let v = func.value(id);
            if v.is_write_mask() {
                continue;
            }
            if let Some(def) = v.def() {
                if v.size() < range.size && func.op(def).opcode().is_marker() {
                    found.removes.push(id);
                    continue;
                }
                found.writes.push(id);
            } else if !v.is_heritage_known() && !v.has_no_descend() {
                found.reads.push(id);
            } else if v.is_input() {
                found.inputs.push(id);
            } else {
                continue;
            }
            found.max_size = found.max_size.max(v.size());
        }
        found
    }

    fn sync_infos(&mut self, func: &Function) {
        for space in &func.spaces()[self.infos.len().min(func.spaces().len())..] {
            let deadcode = self.deadcode_overrides.get(&space.id()).copied();
            self.infos
                .push(HeritageInfo::new(space, &self.config, deadcode));
        }
    }

    /// Adds the ranges of `space` that need linking this pass to the disjoint map.
    fn select_ranges(&mut self, func: &Function, space: SpaceId) {
        let dead_removed = self.infos[space.index()].dead_removed;
        let mut revisit: Option<Address> = None;
        let candidates: Vec<ValueId> = func.values_in(space).collect();

        for id in candidates {
            let v = func.value(id);
            if !v.is_written() && v.has_no_descend() && !v.is_input() {
                continue;
            }
            if v.is_write_mask() {
                continue;
            }
            let (start, prev) = self.global.add(v.addr(), v.size(), self.pass);
            let Some((_, entry)) = self.global.find(start) else {
                continue;
            };
            match prev {
                Intersect::New => {
                    self.disjoint.add(start, entry.size, self.pass);
                }
                Intersect::Contained => {
                    if v.is_heritage_known() || v.has_no_descend() {
                        continue;
                    }
                    if revisit.is_none() && dead_removed {
                        revisit = Some(v.addr());
                    }
                    self.disjoint.add(start, entry.size, entry.pass);
                }
                Intersect::Partial => {
                    self.disjoint.add(start, entry.size, entry.pass);
                    if revisit.is_none() && dead_removed && !v.is_heritage_known() {
                        revisit = Some(v.addr());
                    }
                }
            }
        }

        if let Some(addr) = revisit {
            self.report_revisit(func, space, addr);
        }
    }

    fn report_revisit(&mut self, func: &Function, space: SpaceId, addr: Address) {
        self.bump_deadcode_delay(func, space);
        let info = &mut self.infos[space.index()];
        if !info.warning_issued {
            info.warning_issued = true;
            func.warnings().warn(
                EventKind::HeritageAfterDeadRemoval,
                addr,
                format!("Heritage AFTER dead removal. Revisit: {addr}"),
            );
        }
    }

    /// Requests one more pass of dead-code delay for `space` on the next run.
    fn bump_deadcode_delay(&mut self, func: &Function, space: SpaceId) {
        if !matches!(
            func.space(space).kind(),
            SpaceKind::Register | SpaceKind::Stack
        ) {
            return;
        }
        let info = &self.infos[space.index()];
        if info.delay != info.deadcode_delay {
            return;
        }
        self.deadcode_overrides
            .insert(space, info.deadcode_delay + 1);
        self.needs_restart = true;
    }

    /// Finds and resolves guards for pointer-based accesses into the stack.
    fn discover_stack_guards(&mut self, func: &Function, stack: SpaceId) {
        let Some(base) = func.spacebase_input() else {
            return;
        };
        let mut found = loadguard::discover(
            func,
            base,
            stack,
            &self.guards,
            self.config.max_trace_depth,
        );
        let widen_after = u32::try_from(self.config.widen_after).unwrap_or(u32::MAX);
        let unbounded = loadguard::resolve(
            func,
            base,
            &mut found,
            self.config.max_solver_iterations,
            widen_after,
        );
        for op in unbounded {
            func.warnings().warn(
                EventKind::GuardUnresolved,
                func.op_address(op),
                format!("Unable to bound {} pointer into the stack", func.op(op).opcode()),
            );
        }
        log::trace!("{} stack access guards found", found.len());
        self.guards.extend(found);
    }

    /// Links every range of the disjoint map up to, but not including, renaming.
    fn place_multiequals(&mut self, func: &mut Function) -> Result<()> {
        let mut cursor = None;
        while let Some((mut range, pass)) = self.disjoint.next_after(cursor) {
            cursor = Some(range.addr);
            let mut found = Self::collect(func, &range);

            if range.size > 4 && found.max_size < range.size {
                let sizes = refine::refinement(
                    func,
                    &range,
                    &found.reads,
                    &found.writes,
                    &found.inputs,
                    self.config.refinement_heuristic,
                )?;
                if let Some(sizes) = sizes {
                    self.apply_refinement(&range, pass, &sizes)?;
                    range = range.with_size(sizes.first().copied().unwrap_or(range.size));
                    found = Self::collect(func, &range);
                }
            }

            if found.reads.is_empty() && func.space(range.addr.space).kind() == SpaceKind::Unique
            {
                continue;
            }
            if !found.removes.is_empty() {
                self.remove_revisited_markers(func, &found.removes, &range)?;
            }
            guard::guard_input(func, &range, &mut found.inputs)?;
            self.guard(func, &range, &mut found)?;
            if found.reads.is_empty() && found.writes.is_empty() {
                continue;
            }

            let blocks: Vec<BlockId> = found
                .writes
                .iter()
                .filter_map(|w| func.value(*w).def().and_then(|d| func.parent(d)))
                .collect();
            let merge = match &self.dominance {
                Some(dominance) => dominance.place_phis(&blocks),
                None => Vec::new(),
            };
            for block in merge {
                if has_phi(func, block, &range) {
                    continue;
                }
                let phi = func.new_op(Opcode::MultiEqual, func.block(block).start());
                let out = func.new_value_at(range);
                func.set_output(phi, out);
                func.set_value_flags(out, ValueFlags::ACTIVE_HERITAGE);
                for slot in 0..func.block(block).size_in() {
                    let input = func.new_value_at(range);
                    func.set_input(phi, input, slot);
                }
                func.insert_begin(phi, block);
                log::trace!("phi-node for {range} placed in {block}");
            }
        }
        Ok(())
    }

    /// Replaces `range` by its refined partitions in both location maps.
    ///
    /// Every range of the disjoint map is also an entry of the global map; a mismatch means
    /// the two maps have diverged and is reported as [`Error::RangeOverlap`].
    fn apply_refinement(&mut self, range: &Storage, pass: u32, sizes: &[u32]) -> Result<()> {
        let entry = match self.global.find(range.addr) {
            Some((start, entry)) if start == range.addr && entry.size == range.size => entry,
            _ => return Err(Error::RangeOverlap(range.addr)),
        };
        let pieces = refine::partitions(range, sizes);
        self.disjoint.remove(range.addr);
        self.global.remove(range.addr);
        for piece in &pieces {
            self.disjoint.insert_raw(piece.addr, piece.size, pass)?;
            self.global.insert_raw(piece.addr, piece.size, entry.pass)?;
        }
        Ok(())
    }

    /// Turns markers left by an earlier, finer-grained pass into truncations of a fresh read
    /// of the whole range.
    fn remove_revisited_markers(
        &mut self,
        func: &mut Function,
        removes: &[ValueId],
        range: &Storage,
    ) -> Result<()> {
        let space = range.addr.space;
        if self.infos[space.index()].dead_removed {
            self.report_revisit(func, space, range.addr);
        }

        for &value in removes {
            let Some(op) = func.value(value).def() else {
                continue;
            };
            let Some(block) = func.parent(op) else {
                continue;
            };
            let anchor = match func.op(op).opcode() {
                Opcode::Indirect => {
                    func.clear_value_flags(value, ValueFlags::ADDRFORCE);
                    let target = func.indirect_target(op).unwrap_or(op);
                    op_following(func, target)
                }
                _ => func
                    .block(block)
                    .ops()
                    .iter()
                    .copied()
                    .skip_while(|o| *o != op)
                    .find(|o| func.op(*o).opcode() != Opcode::MultiEqual),
            };

            let offset = refine::significance(func, range, &func.value(value).storage());
            func.op_uninsert(op);
            for slot in (0..func.op(op).num_inputs()).rev() {
                func.remove_input(op, slot);
            }
            func.set_opcode(op, Opcode::SubPiece);
            let whole = func.new_value_at(*range);
            func.set_value_flags(whole, ValueFlags::ACTIVE_HERITAGE);
            func.set_input(op, whole, 0);
            let c = func.new_const(4, offset);
            func.set_input(op, c, 1);
            match anchor {
                Some(next) => func.insert_before(op, next)?,
                None => func.insert_end(op, block),
            }
            func.set_value_flags(value, ValueFlags::WRITEMASK);
        }
        Ok(())
    }
}

/// Operation right after `op` in its block.
fn op_following(func: &Function, op: OpId) -> Option<OpId> {
    let block = func.parent(op)?;
    let ops = func.block(block).ops();
    let pos = ops.iter().position(|o| *o == op)?;
    ops.get(pos + 1).copied()
}

/// True if `block` already has a phi-node for exactly `range`.
fn has_phi(func: &Function, block: BlockId, range: &Storage) -> bool {
    func.block(block)
        .ops()
        .iter()
        .take_while(|o| func.op(**o).opcode() == Opcode::MultiEqual)
        .filter_map(|o| func.op(*o).output())
        .any(|out| func.value(out).storage() == *range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Address;

    struct Setup {
        func: Function,
        reg: SpaceId,
    }

    fn setup() -> Setup {
        let mut func = Function::new("f", 0x1000);
        let reg = func.add_space("register", SpaceKind::Register);
        func.add_block(0x1000);
        Setup { func, reg }
    }

    fn r(s: &Setup, offset: u64, size: u32) -> Storage {
        Storage::new(Address::new(s.reg, offset), size)
    }

    #[test]
    fn test_refinement_splits_both_maps() -> Result<()> {
        let s = setup();
        let mut heritage = Heritage::new(HeritageConfig::default());
        let range = r(&s, 0, 8);
        heritage.global.add(range.addr, 8, 0);
        heritage.disjoint.add(range.addr, 8, 1);

        heritage.apply_refinement(&range, 1, &[4, 4])?;

        let expected = vec![(r(&s, 0, 4), 0), (r(&s, 4, 4), 0)];
        assert_eq!(heritage.global.iter().collect::<Vec<_>>(), expected);
        assert_eq!(heritage.disjoint.len(), 2);
        Ok(())
    }

    #[test]
    fn test_refinement_of_untracked_range_is_fatal() {
        let s = setup();
        let mut heritage = Heritage::new(HeritageConfig::default());
        let range = r(&s, 0, 8);
        heritage.global.add(r(&s, 0, 4).addr, 4, 0);
        heritage.disjoint.add(range.addr, 8, 1);

        let result = heritage.apply_refinement(&range, 1, &[4, 4]);

        assert!(matches!(result, Err(Error::RangeOverlap(addr)) if addr == range.addr));
    }

    #[test]
    fn test_collect_groups_values() {
        let mut s = setup();
        let entry = s.func.entry_block();
        let c = s.func.new_const(4, 1);
        let wide = r(&s, 0, 8);
        let low = r(&s, 0, 4);
        let copy = s.func.push_op(entry, Opcode::Copy, 0x1000, &[c], Some(low));
        let written = s.func.op(copy).output().unwrap();
        let read = s.func.new_value_at(wide);
        s.func.push_op(entry, Opcode::Other, 0x1004, &[read], None);
        let input = s.func.new_input(r(&s, 4, 4));

        let found = Heritage::collect(&s.func, &wide);
        assert_eq!(found.writes, vec![written]);
        assert_eq!(found.reads, vec![read]);
        assert_eq!(found.inputs, vec![input]);
        assert_eq!(found.max_size, 8);
        assert!(found.removes.is_empty());
    }

    #[test]
    fn test_single_block_links_read_to_write() {
        let mut s = setup();
        let entry = s.func.entry_block();
        let c = s.func.new_const(4, 7);
        let loc = r(&s, 0, 4);
        let copy = s.func.push_op(entry, Opcode::Copy, 0x1000, &[c], Some(loc));
        let def = s.func.op(copy).output().unwrap();
        let read = s.func.new_value_at(loc);
        let user = s.func.push_op(entry, Opcode::Other, 0x1004, &[read], None);

        let mut heritage = Heritage::new(HeritageConfig::default());
        heritage.heritage(&mut s.func).unwrap();

        assert_eq!(s.func.op(user).input(0), Some(def));
        assert!(s.func.value(read).is_dead());
        assert_eq!(heritage.pass(), 1);
        assert_eq!(heritage.heritage_pass(loc.addr), Some(0));
        assert_eq!(heritage.num_heritage_passes(s.reg), 1);
    }

    #[test]
    fn test_unwritten_read_becomes_input() {
        let mut s = setup();
        let entry = s.func.entry_block();
        let loc = r(&s, 8, 4);
        let a = s.func.new_value_at(loc);
        let first = s.func.push_op(entry, Opcode::Other, 0x1000, &[a], None);
        let b = s.func.new_value_at(loc);
        let second = s.func.push_op(entry, Opcode::Other, 0x1004, &[b], None);

        let mut heritage = Heritage::new(HeritageConfig::default());
        heritage.heritage(&mut s.func).unwrap();

        let input = s.func.op(first).input(0).unwrap();
        assert!(s.func.value(input).is_input());
        assert_eq!(s.func.op(second).input(0), Some(input));
        assert_eq!(s.func.find_input(&loc), Some(input));
    }

    #[test]
    fn test_partial_read_is_normalized() {
        let mut s = setup();
        let entry = s.func.entry_block();
        let c = s.func.new_const(8, 0x1122_3344_5566_7788);
        let wide = r(&s, 0, 8);
        let copy = s.func.push_op(entry, Opcode::Copy, 0x1000, &[c], Some(wide));
        let def = s.func.op(copy).output().unwrap();
        let high = s.func.new_value_at(r(&s, 4, 4));
        let user = s.func.push_op(entry, Opcode::Other, 0x1004, &[high], None);

        let mut heritage = Heritage::new(HeritageConfig::default());
        heritage.heritage(&mut s.func).unwrap();

        // The narrow read is now produced by a SUBPIECE of the full write.
        assert_eq!(s.func.op(user).input(0), Some(high));
        let sub = s.func.value(high).def().unwrap();
        assert_eq!(s.func.op(sub).opcode(), Opcode::SubPiece);
        assert_eq!(s.func.op(sub).input(0), Some(def));
        let offset = s.func.op(sub).input(1).unwrap();
        assert_eq!(s.func.value(offset).constant(), Some(4));
        assert!(s.func.value(high).is_write_mask());
    }

    #[test]
    fn test_revisit_after_dead_removal_requests_restart() {
        let mut s = setup();
        let entry = s.func.entry_block();
        let loc = r(&s, 0, 4);
        let c = s.func.new_const(4, 1);
        s.func.push_op(entry, Opcode::Copy, 0x1000, &[c], Some(loc));
        let read = s.func.new_value_at(loc);
        s.func.push_op(entry, Opcode::Other, 0x1004, &[read], None);

        let mut heritage = Heritage::new(HeritageConfig::default());
        heritage.heritage(&mut s.func).unwrap();
        assert!(heritage.dead_removal_allowed_seen(s.reg));

        let late = s.func.new_value_at(loc);
        s.func.push_op(entry, Opcode::Other, 0x1008, &[late], None);
        heritage.heritage(&mut s.func).unwrap();

        assert!(heritage.needs_restart());
        assert!(s.func.warnings().has(EventKind::HeritageAfterDeadRemoval));
        assert!(heritage.info(s.reg).unwrap().warning_issued());

        heritage.clear();
        heritage.heritage(&mut s.func).unwrap();
        assert_eq!(heritage.deadcode_delay(s.reg), Some(1));
        assert!(!heritage.dead_removal_allowed(s.reg));
    }

    #[test]
    fn test_deadcode_delay_below_delay_is_rejected() {
        let mut s = setup();
        let stack = s.func.add_stack_space("stack", s.func.ram_space());
        let mut heritage = Heritage::new(HeritageConfig::default());
        assert!(heritage.set_deadcode_delay(&s.func, stack, 0).is_err());
        assert!(heritage.set_deadcode_delay(&s.func, stack, 2).is_ok());
        assert_eq!(heritage.deadcode_delay(stack), Some(2));
    }

    #[test]
    fn test_run_links_delayed_space() {
        let mut s = setup();
        let stack = s.func.add_stack_space("stack", s.func.ram_space());
        let entry = s.func.entry_block();
        let slot = Storage::new(Address::new(stack, 0xfff8), 4);
        let read = s.func.new_value_at(slot);
        let user = s.func.push_op(entry, Opcode::Other, 0x1000, &[read], None);

        let mut heritage = Heritage::new(HeritageConfig::default());
        heritage.run(&mut s.func).unwrap();

        assert_eq!(heritage.pass(), 2);
        assert_eq!(heritage.heritage_pass(slot.addr), Some(1));
        let input = s.func.op(user).input(0).unwrap();
        assert!(s.func.value(input).is_input());
    }
}
