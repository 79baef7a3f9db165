//! Structural mutation of a [`Function`].
//!
//! Every edit of the data-flow graph goes through these methods. They keep three links in
//! agreement at all times:
//!
//! - `Op::output` and `Value::def` point at each other,
//! - `Value::descend` holds one entry per input slot that reads the value,
//! - `Op::parent` and `Block::ops` agree on placement, with `Op::order` strictly increasing
//!   along the block.

use crate::{
    error::Error,
    ir::{
        function::ORDER_STEP, Address, Block, BlockEdge, BlockId, Function, Op, OpFlags, OpId,
        Opcode, SeqNum, SpaceKind, Storage, Value, ValueFlags, ValueId,
    },
    Result,
};

impl Function {
    // ---- control flow ----------------------------------------------------------------

    /// Adds an empty block starting at machine address `start`. The first block added is the
    /// entry.
    pub fn add_block(&mut self, start: u64) -> BlockId {
        let id = BlockId::new(self.blocks.len());
        self.blocks.push(Block {
            start,
            ..Block::default()
        });
        self.structure_version += 1;
        id
    }

    /// Adds the control-flow edge `from -> to`.
    ///
    /// Phi-nodes of `to` must not exist yet, since their slots follow the incoming edge order.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        let out_index = self.blocks[from.index()].outs.len();
        let in_index = self.blocks[to.index()].ins.len();
        self.blocks[from.index()].outs.push(BlockEdge {
            point: to,
            reverse_index: in_index,
        });
        self.blocks[to.index()].ins.push(BlockEdge {
            point: from,
            reverse_index: out_index,
        });
        self.structure_version += 1;
    }

    // ---- creation ------------------------------------------------------------------

    /// Creates an operation that is not yet placed in any block.
    pub fn new_op(&mut self, opcode: Opcode, pc: u64) -> OpId {
        let id = OpId::new(self.ops.len());
        let seq = SeqNum {
            pc,
            uniq: self.uniq_counter,
        };
        self.uniq_counter += 1;
        self.ops.push(Op::new(opcode, seq));
        id
    }

    fn push_value(&mut self, value: Value) -> ValueId {
        let id = ValueId::new(self.values.len());
        if !value.is_constant() {
            self.loc.insert((value.addr, value.size, id));
        }
        self.values.push(value);
        id
    }

    /// Creates a free value at `addr`.
    ///
    /// Values in global memory are marked persistent and tied to their address.
    pub fn new_value(&mut self, addr: Address, size: u32) -> ValueId {
        let flags = match self.spaces[addr.space.index()].kind {
            SpaceKind::Ram => ValueFlags::PERSIST | ValueFlags::ADDRTIED,
            _ => ValueFlags::empty(),
        };
        self.push_value(Value::new(addr, size, flags))
    }

    /// Creates a free value occupying `storage`.
    pub fn new_value_at(&mut self, storage: Storage) -> ValueId {
        self.new_value(storage.addr, storage.size)
    }

    /// Creates a constant.
    pub fn new_const(&mut self, size: u32, value: u64) -> ValueId {
        let addr = Address::new(self.constant_space(), value);
        self.push_value(Value::new(addr, size, ValueFlags::CONSTANT))
    }

    /// Creates the constant naming `space` as the first input of a LOAD or STORE.
    pub fn new_space_const(&mut self, space: crate::ir::SpaceId) -> ValueId {
        self.new_const(8, space.index() as u64)
    }

    /// Creates the annotation that names `op` from the second input of an INDIRECT.
    pub fn new_iop(&mut self, op: OpId) -> ValueId {
        let addr = Address::new(self.iop_space(), op.index() as u64);
        self.push_value(Value::new(addr, 8, ValueFlags::CONSTANT))
    }

    /// Creates a fresh temporary.
    pub fn new_unique(&mut self, size: u32) -> ValueId {
        let addr = Address::new(self.unique_space(), self.unique_next);
        self.unique_next += u64::from(size.max(1)).next_multiple_of(0x10);
        self.new_value(addr, size)
    }

    /// Creates a formal input at `storage`, reusing an existing one.
    pub fn new_input(&mut self, storage: Storage) -> ValueId {
        let value = self.new_value_at(storage);
        self.set_input_value(value)
    }

    /// Turns a free value into a formal input.
    ///
    /// If an input with the same storage already exists, readers of `value` are moved to it,
    /// `value` is destroyed and the existing input is returned.
    pub fn set_input_value(&mut self, value: ValueId) -> ValueId {
        let storage = self.values[value.index()].storage();
        if let Some(existing) = self.find_input(&storage) {
            if existing != value {
                self.total_replace(value, existing);
                self.value_destroy(value);
                return existing;
            }
        }
        self.values[value.index()].flags |= ValueFlags::INPUT;
        value
    }

    /// Builder shorthand: appends a new operation to the end of `block`, with the given
    /// inputs and an optional fresh output at `output`.
    pub fn push_op(
        &mut self,
        block: BlockId,
        opcode: Opcode,
        pc: u64,
        inputs: &[ValueId],
        output: Option<Storage>,
    ) -> OpId {
        let op = self.new_op(opcode, pc);
        for (slot, input) in inputs.iter().enumerate() {
            self.set_input(op, *input, slot);
        }
        if let Some(storage) = output {
            let out = self.new_value_at(storage);
            self.set_output(op, out);
        }
        let index = self.blocks[block.index()].ops.len();
        self.insert_at(op, block, index);
        op
    }

    // ---- data flow -------------------------------------------------------------------

    fn unlink_reader(&mut self, value: ValueId, op: OpId) {
        let descend = &mut self.values[value.index()].descend;
        if let Some(pos) = descend.iter().position(|o| *o == op) {
            descend.remove(pos);
        }
    }

    /// Changes the opcode of `op`.
    pub fn set_opcode(&mut self, op: OpId, opcode: Opcode) {
        self.ops[op.index()].opcode = opcode;
    }

    /// Adds attribute flags to an operation.
    pub fn set_op_flags(&mut self, op: OpId, flags: OpFlags) {
        self.ops[op.index()].flags |= flags;
    }

    /// Sets input `slot` of `op` to `value`. A slot equal to the input count appends.
    pub fn set_input(&mut self, op: OpId, value: ValueId, slot: usize) {
        let inputs = &self.ops[op.index()].inputs;
        if slot < inputs.len() {
            let old = inputs[slot];
            if old == value {
                return;
            }
            self.unlink_reader(old, op);
            self.ops[op.index()].inputs[slot] = value;
        } else {
            self.ops[op.index()].inputs.push(value);
        }
        self.values[value.index()].descend.push(op);
    }

    /// Inserts `value` as a new input at `slot`, shifting later inputs up.
    pub fn insert_input(&mut self, op: OpId, value: ValueId, slot: usize) {
        let inputs = &mut self.ops[op.index()].inputs;
        let slot = slot.min(inputs.len());
        inputs.insert(slot, value);
        self.values[value.index()].descend.push(op);
    }

    /// Removes input `slot`, shifting later inputs down.
    pub fn remove_input(&mut self, op: OpId, slot: usize) {
        if slot >= self.ops[op.index()].inputs.len() {
            return;
        }
        let old = self.ops[op.index()].inputs.remove(slot);
        self.unlink_reader(old, op);
    }

    /// Makes `value` the output of `op`, detaching any previous definitions on both sides.
    pub fn set_output(&mut self, op: OpId, value: ValueId) {
        if let Some(old) = self.ops[op.index()].output {
            self.values[old.index()].def = None;
        }
        if let Some(prev) = self.values[value.index()].def {
            self.ops[prev.index()].output = None;
        }
        self.values[value.index()].def = Some(op);
        self.values[value.index()].flags.remove(ValueFlags::INPUT);
        self.ops[op.index()].output = Some(value);
    }

    /// Detaches the output of `op`, leaving the value free.
    pub fn unset_output(&mut self, op: OpId) {
        if let Some(old) = self.ops[op.index()].output.take() {
            self.values[old.index()].def = None;
        }
    }

    /// Points every reader of `old` at `new` instead.
    pub fn total_replace(&mut self, old: ValueId, new: ValueId) {
        let readers = std::mem::take(&mut self.values[old.index()].descend);
        for op in readers {
            if let Some(slot) = self.ops[op.index()].slot_of(old) {
                self.ops[op.index()].inputs[slot] = new;
                self.values[new.index()].descend.push(op);
            }
        }
    }

    // ---- placement -----------------------------------------------------------------

    pub(crate) fn insert_at(&mut self, op: OpId, block: BlockId, index: usize) {
        let list = &self.blocks[block.index()].ops;
        let prev = match index {
            0 => 0,
            i => self.ops[list[i - 1].index()].order,
        };
        let order = if index == list.len() {
            prev.checked_add(ORDER_STEP).filter(|o| *o < u32::MAX)
        } else {
            let next = self.ops[list[index].index()].order;
            (next - prev >= 2).then(|| prev + (next - prev) / 2)
        };

        self.blocks[block.index()].ops.insert(index, op);
        self.ops[op.index()].parent = Some(block);
        match order {
            Some(order) => self.ops[op.index()].order = order,
            None => self.renumber(block),
        }
    }

    /// Reassigns evenly spaced order keys. Cached covers hold stale positions afterwards.
    fn renumber(&mut self, block: BlockId) {
        for (i, op) in self.blocks[block.index()].ops.iter().enumerate() {
            let key = u32::try_from(i + 1)
                .map(|n| n.saturating_mul(ORDER_STEP))
                .unwrap_or(u32::MAX - 1);
            self.ops[op.index()].order = key.min(u32::MAX - 1);
        }
        self.covers_dirty = true;
    }

    fn position(&self, op: OpId) -> Result<(BlockId, usize)> {
        let block = self.ops[op.index()]
            .parent
            .ok_or_else(|| Error::Graph(format!("{op} is not placed in a block")))?;
        let index = self.blocks[block.index()]
            .ops
            .iter()
            .position(|o| *o == op)
            .ok_or_else(|| Error::Graph(format!("{op} missing from {block}")))?;
        Ok((block, index))
    }

    /// Places `op` immediately before `follow`.
    pub fn insert_before(&mut self, op: OpId, follow: OpId) -> Result<()> {
        let (block, index) = self.position(follow)?;
        self.insert_at(op, block, index);
        Ok(())
    }

    /// Places `op` after `prev`.
    ///
    /// An INDIRECT stands for effects of its target operation, so insertion after one moves
    /// past the target instead. Non-phi operations never land among the phi-nodes.
    pub fn insert_after(&mut self, op: OpId, prev: OpId) -> Result<()> {
        let prev = match self.indirect_target(prev) {
            Some(target) => target,
            None => prev,
        };
        let (block, mut index) = self.position(prev)?;
        index += 1;
        if self.ops[op.index()].opcode != Opcode::MultiEqual {
            let list = &self.blocks[block.index()].ops;
            while index < list.len() && self.ops[list[index].index()].opcode == Opcode::MultiEqual {
                index += 1;
            }
        }
        self.insert_at(op, block, index);
        Ok(())
    }

    /// Places `op` at the start of `block`, after any phi-nodes unless it is one.
    pub fn insert_begin(&mut self, op: OpId, block: BlockId) {
        let mut index = 0;
        if self.ops[op.index()].opcode != Opcode::MultiEqual {
            let list = &self.blocks[block.index()].ops;
            while index < list.len() && self.ops[list[index].index()].opcode == Opcode::MultiEqual {
                index += 1;
            }
        }
        self.insert_at(op, block, index);
    }

    /// Places `op` at the end of `block`, before a terminating branch or return.
    pub fn insert_end(&mut self, op: OpId, block: BlockId) {
        let mut index = self.blocks[block.index()].ops.len();
        if self.block_terminator(block).is_some() {
            index -= 1;
        }
        self.insert_at(op, block, index);
    }

    /// Removes `op` from its block without destroying it.
    pub fn op_uninsert(&mut self, op: OpId) {
        if let Some(block) = self.ops[op.index()].parent.take() {
            self.blocks[block.index()].ops.retain(|o| *o != op);
        }
    }

    /// Destroys `op`: its inputs lose a reader, an unread output is destroyed with it, and
    /// the operation leaves its block.
    pub fn op_destroy(&mut self, op: OpId) {
        for slot in (0..self.ops[op.index()].inputs.len()).rev() {
            self.remove_input(op, slot);
        }
        if let Some(out) = self.ops[op.index()].output {
            self.unset_output(op);
            if self.values[out.index()].descend.is_empty() {
                self.value_destroy(out);
            }
        }
        self.op_uninsert(op);
        self.ops[op.index()].dead = true;
    }

    /// Destroys a value that nothing reads.
    pub fn value_destroy(&mut self, value: ValueId) {
        debug_assert!(self.values[value.index()].descend.is_empty());
        if let Some(def) = self.values[value.index()].def.take() {
            self.ops[def.index()].output = None;
        }
        let v = &mut self.values[value.index()];
        self.loc.remove(&(v.addr, v.size, value));
        v.dead = true;
        v.cover = None;
    }
}
