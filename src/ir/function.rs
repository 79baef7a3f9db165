//! The per-function arena and analysis context.
//!
//! [`Function`] owns every value, operation, block and logical variable of one function,
//! plus the descriptors supplied by external collaborators (address spaces, call sites, the
//! prototype, symbols). All subsystems receive it by reference; nothing is global.
//!
//! Objects are addressed by handles ([`ValueId`], [`OpId`], [`BlockId`], [`HighId`]).
//! Destroyed objects keep their slot with a dead marker, so handles are never reused.
//! Mutation goes through the methods in the sibling `mutate` module, which keep the
//! output/definition back-references and the reader lists consistent.

use std::collections::BTreeSet;

use crate::{
    events::WarningSink,
    graph::{GraphBase, Predecessors, RootedGraph, Successors},
    ir::{
        AddrSpace, Address, Block, BlockId, CallSpec, FuncProto, HighId, Op, OpId, Opcode,
        SpaceId, SpaceKind, Storage, Symbol, SymbolId, TypeId, Value, ValueFlags, ValueId,
    },
    merge::HighVariable,
};

/// Gap between consecutive order keys in a freshly numbered block.
pub(crate) const ORDER_STEP: u32 = 1 << 8;

/// Arena and analysis context for one function.
#[derive(Debug, Clone)]
pub struct Function {
    pub(crate) name: String,
    pub(crate) entry_pc: u64,
    pub(crate) spaces: Vec<AddrSpace>,
    pub(crate) values: Vec<Value>,
    pub(crate) ops: Vec<Op>,
    pub(crate) blocks: Vec<Block>,
    pub(crate) highs: Vec<HighVariable>,
    pub(crate) calls: Vec<CallSpec>,
    pub(crate) proto: FuncProto,
    pub(crate) symbols: Vec<Symbol>,
    /// Live non-constant values keyed by storage, for address-ordered scans.
    pub(crate) loc: BTreeSet<(Address, u32, ValueId)>,
    pub(crate) uniq_counter: u32,
    pub(crate) unique_next: u64,
    pub(crate) stack_pointer: Option<(Storage, SpaceId)>,
    pub(crate) structure_version: u64,
    pub(crate) covers_dirty: bool,
    pub(crate) warnings: WarningSink,
    constant_space: SpaceId,
    iop_space: SpaceId,
    unique_space: SpaceId,
    ram_space: SpaceId,
}

impl Function {
    /// Creates an empty function.
    ///
    /// The constant, iop, unique and ram spaces are created up front; register and stack
    /// spaces are added by the caller with [`Function::add_space`] and
    /// [`Function::add_stack_space`].
    #[must_use]
    pub fn new(name: impl Into<String>, entry_pc: u64) -> Self {
        let mut spaces = Vec::new();
        let mut push = |name: &str, kind: SpaceKind| {
            let id = SpaceId::new(spaces.len());
            spaces.push(AddrSpace::new(id, name, kind));
            id
        };
        let constant_space = push("const", SpaceKind::Constant);
        let iop_space = push("iop", SpaceKind::Iop);
        let unique_space = push("unique", SpaceKind::Unique);
        let ram_space = push("ram", SpaceKind::Ram);

        Self {
            name: name.into(),
            entry_pc,
            spaces,
            values: Vec::new(),
            ops: Vec::new(),
            blocks: Vec::new(),
            highs: Vec::new(),
            calls: Vec::new(),
            proto: FuncProto::new(),
            symbols: Vec::new(),
            loc: BTreeSet::new(),
            uniq_counter: 0,
            unique_next: 0x1000_0000,
            stack_pointer: None,
            structure_version: 0,
            covers_dirty: false,
            warnings: WarningSink::new(),
            constant_space,
            iop_space,
            unique_space,
            ram_space,
        }
    }

    /// Name of the function.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the first instruction.
    pub fn entry_pc(&self) -> u64 {
        self.entry_pc
    }

    /// Warnings and notes recorded while analysing this function.
    pub fn warnings(&self) -> &WarningSink {
        &self.warnings
    }

    /// Address in the code space for a machine address.
    pub fn pc_address(&self, pc: u64) -> Address {
        Address::new(self.ram_space, pc)
    }

    // ---- address spaces ------------------------------------------------------------

    /// Adds an address space.
    pub fn add_space(&mut self, name: impl Into<String>, kind: SpaceKind) -> SpaceId {
        let id = SpaceId::new(self.spaces.len());
        self.spaces.push(AddrSpace::new(id, name, kind));
        id
    }

    /// Adds the stack space, addressed through pointers into `contain`.
    ///
    /// The stack is linked one pass after the other spaces, so the stack pointer is already
    /// in SSA form when pointer-based accesses are traced.
    pub fn add_stack_space(&mut self, name: impl Into<String>, contain: SpaceId) -> SpaceId {
        let id = self.add_space(name, SpaceKind::Stack);
        let space = &mut self.spaces[id.index()];
        space.contain = Some(contain);
        space.delay = 1;
        id
    }

    /// Looks up a space.
    pub fn space(&self, id: SpaceId) -> &AddrSpace {
        &self.spaces[id.index()]
    }

    /// All spaces.
    pub fn spaces(&self) -> &[AddrSpace] {
        &self.spaces
    }

    /// Sets the linking and dead-code delays of a space.
    pub fn set_space_delay(&mut self, id: SpaceId, delay: u32, deadcode_delay: u32) {
        let space = &mut self.spaces[id.index()];
        space.delay = delay;
        space.deadcode_delay = deadcode_delay;
    }

    /// Marks a space as big-endian.
    pub fn set_big_endian(&mut self, id: SpaceId, big_endian: bool) {
        self.spaces[id.index()].big_endian = big_endian;
    }

    /// Sets the largest valid offset of a space.
    pub fn set_space_highest(&mut self, id: SpaceId, highest: u64) {
        self.spaces[id.index()].highest = highest;
    }

    /// The constant space.
    pub fn constant_space(&self) -> SpaceId {
        self.constant_space
    }

    /// The space whose offsets name operations.
    pub fn iop_space(&self) -> SpaceId {
        self.iop_space
    }

    /// The temporary space.
    pub fn unique_space(&self) -> SpaceId {
        self.unique_space
    }

    /// The global memory space.
    pub fn ram_space(&self) -> SpaceId {
        self.ram_space
    }

    /// The stack space, if one was added.
    pub fn stack_space(&self) -> Option<SpaceId> {
        self.spaces
            .iter()
            .find(|s| s.kind == SpaceKind::Stack)
            .map(|s| s.id)
    }

    // ---- collaborator descriptors ------------------------------------------------

    /// Declares the register holding the stack pointer and the space it points into.
    pub fn set_stack_pointer(&mut self, register: Storage, stack_space: SpaceId) {
        self.stack_pointer = Some((register, stack_space));
    }

    /// Register storage of the stack pointer, if declared.
    pub fn stack_pointer(&self) -> Option<Storage> {
        self.stack_pointer.map(|(reg, _)| reg)
    }

    /// The formal input holding the stack pointer at entry, once the register is linked.
    pub fn spacebase_input(&self) -> Option<ValueId> {
        let (reg, _) = self.stack_pointer?;
        self.find_input(&reg)
    }

    /// Registers a call-site descriptor.
    pub fn add_call_spec(&mut self, spec: CallSpec) {
        self.calls.push(spec);
    }

    /// All call-site descriptors.
    pub fn call_specs(&self) -> &[CallSpec] {
        &self.calls
    }

    /// Mutable access to call-site descriptors.
    pub fn call_specs_mut(&mut self) -> &mut [CallSpec] {
        &mut self.calls
    }

    /// Descriptor of the call performed by `op`.
    pub fn call_spec_for(&self, op: OpId) -> Option<&CallSpec> {
        self.calls.iter().find(|c| c.op() == op)
    }

    /// Sets the function's own prototype.
    pub fn set_proto(&mut self, proto: FuncProto) {
        self.proto = proto;
    }

    /// The function's prototype.
    pub fn proto(&self) -> &FuncProto {
        &self.proto
    }

    /// Registers a symbol stored at `entries`.
    pub fn add_symbol(&mut self, name: impl Into<String>, entries: Vec<Storage>) -> SymbolId {
        let id = SymbolId::new(self.symbols.len());
        self.symbols.push(Symbol {
            id,
            name: name.into(),
            entries,
        });
        id
    }

    /// All symbols.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Looks up a symbol.
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    /// Symbol whose storage contains `storage`.
    pub fn symbol_at(&self, storage: &Storage) -> Option<SymbolId> {
        self.symbols
            .iter()
            .find(|s| s.offset_of(storage).is_some())
            .map(|s| s.id)
    }

    /// Assigns a data-type to a value.
    pub fn set_data_type(&mut self, value: ValueId, dtype: TypeId) {
        self.values[value.index()].dtype = Some(dtype);
    }

    /// Adds attribute flags to a value.
    pub fn set_value_flags(&mut self, value: ValueId, flags: ValueFlags) {
        self.values[value.index()].flags |= flags;
    }

    /// Removes attribute flags from a value.
    pub fn clear_value_flags(&mut self, value: ValueId, flags: ValueFlags) {
        self.values[value.index()].flags.remove(flags);
    }

    // ---- lookups -------------------------------------------------------------------

    /// Looks up a value.
    #[inline]
    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    /// Looks up an operation.
    #[inline]
    pub fn op(&self, id: OpId) -> &Op {
        &self.ops[id.index()]
    }

    /// Looks up a block.
    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    /// Looks up a logical variable.
    #[inline]
    pub fn high(&self, id: HighId) -> &HighVariable {
        &self.highs[id.index()]
    }

    /// The entry block.
    #[inline]
    pub fn entry_block(&self) -> BlockId {
        BlockId::new(0)
    }

    /// Number of blocks.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Live values.
    pub fn values(&self) -> impl Iterator<Item = (ValueId, &Value)> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.dead)
            .map(|(i, v)| (ValueId::new(i), v))
    }

    /// Live operations that are placed in a block, in block then position order.
    pub fn ops(&self) -> impl Iterator<Item = OpId> + '_ {
        self.blocks.iter().flat_map(|b| b.ops.iter().copied())
    }

    /// Placed operations with the given opcode.
    pub fn ops_with(&self, opcode: Opcode) -> impl Iterator<Item = OpId> + '_ {
        self.ops().filter(move |o| self.ops[o.index()].opcode == opcode)
    }

    /// Live logical variables.
    pub fn highs(&self) -> impl Iterator<Item = (HighId, &HighVariable)> {
        self.highs
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.is_dead())
            .map(|(i, h)| (HighId::new(i), h))
    }

    /// Live values of a space, in address order.
    pub fn values_in(&self, space: SpaceId) -> impl Iterator<Item = ValueId> + '_ {
        let lo = (Address::new(space, 0), 0, ValueId::new(0));
        let hi = (Address::new(space, u64::MAX), u32::MAX, ValueId::new(usize::MAX));
        self.loc.range(lo..=hi).map(|(_, _, id)| *id)
    }

    /// Live values whose first byte lies in `storage`, in address order.
    pub fn values_starting_in(&self, storage: &Storage) -> impl Iterator<Item = ValueId> + '_ {
        let lo = (storage.addr, 0, ValueId::new(0));
        let end = storage.end();
        let space = storage.addr.space;
        self.loc
            .range(lo..)
            .take_while(move |(a, _, _)| a.space == space && u128::from(a.offset) < end)
            .map(|(_, _, id)| *id)
    }

    /// The formal input occupying exactly `storage`.
    pub fn find_input(&self, storage: &Storage) -> Option<ValueId> {
        self.values_starting_in(storage).find(|id| {
            let v = &self.values[id.index()];
            v.is_input() && v.addr == storage.addr && v.size == storage.size
        })
    }

    /// Operation named by the second input of an INDIRECT.
    pub fn indirect_target(&self, indirect: OpId) -> Option<OpId> {
        let op = &self.ops[indirect.index()];
        if op.opcode != Opcode::Indirect {
            return None;
        }
        let annot = &self.values[op.input(1)?.index()];
        if annot.addr.space != self.iop_space {
            return None;
        }
        let target = OpId::new(usize::try_from(annot.addr.offset).ok()?);
        let target_op = self.ops.get(target.index())?;
        (!target_op.dead).then_some(target)
    }

    /// Block containing `op`.
    #[inline]
    pub fn parent(&self, op: OpId) -> Option<BlockId> {
        self.ops[op.index()].parent
    }

    /// True if `a` executes before `b` within the same block.
    pub fn before_in_block(&self, a: OpId, b: OpId) -> bool {
        let (oa, ob) = (&self.ops[a.index()], &self.ops[b.index()]);
        oa.parent == ob.parent && oa.order < ob.order
    }

    /// Address of the instruction an operation came from.
    pub fn op_address(&self, op: OpId) -> Address {
        self.pc_address(self.ops[op.index()].seq.pc)
    }

    /// Last operation of a block, if it ends the block.
    pub fn block_terminator(&self, block: BlockId) -> Option<OpId> {
        let last = *self.blocks[block.index()].ops.last()?;
        self.ops[last.index()]
            .opcode
            .is_block_end()
            .then_some(last)
    }

    /// Counter that changes whenever blocks or edges are added.
    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }
}

impl GraphBase for Function {
    fn node_count(&self) -> usize {
        self.blocks.len()
    }

    fn node_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len()).map(BlockId::new)
    }
}

impl Successors for Function {
    fn successors(&self, node: BlockId) -> impl Iterator<Item = BlockId> {
        self.blocks[node.index()].outs.iter().map(|e| e.point)
    }
}

impl Predecessors for Function {
    fn predecessors(&self, node: BlockId) -> impl Iterator<Item = BlockId> {
        self.blocks[node.index()].ins.iter().map(|e| e.point)
    }
}

impl RootedGraph for Function {
    fn entry(&self) -> BlockId {
        BlockId::new(0)
    }
}
