//! IR operations.

use std::fmt;

use bitflags::bitflags;

use crate::ir::{BlockId, Opcode, ValueId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// Attribute flags carried by an [`Op`].
    pub struct OpFlags: u32 {
        /// INDIRECT guarding a STORE.
        const INDIRECT_STORE = 0x0001;
        /// INDIRECT that creates its output from nothing (killed-by-call).
        const INDIRECT_CREATION = 0x0002;
        /// COPY keeping a range live across an indexed LOAD.
        const LOAD_GUARD = 0x0004;
        /// COPY placing a persistent value at a RETURN.
        const RETURN_COPY = 0x0008;
        /// COPY that does not need to be emitted.
        const NONPRINTING = 0x0010;
        /// COPY inserted by the merge engine to split a live range.
        const TRIM_COPY = 0x0020;
        /// Copy propagation must not cross this op.
        const STOP_COPY_PROP = 0x0040;
    }
}

/// Position of an operation: the machine address it came from and a creation counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNum {
    /// Address of the originating instruction.
    pub pc: u64,
    /// Unique creation counter within the function.
    pub uniq: u32,
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.pc, self.uniq)
    }
}

/// An IR operation: opcode, ordered inputs, at most one output.
///
/// `order` is the position key inside the parent block. Keys are spaced so that most
/// insertions fit between neighbours without renumbering the block.
#[derive(Debug, Clone)]
pub struct Op {
    pub(crate) opcode: Opcode,
    pub(crate) inputs: Vec<ValueId>,
    pub(crate) output: Option<ValueId>,
    pub(crate) parent: Option<BlockId>,
    pub(crate) seq: SeqNum,
    pub(crate) order: u32,
    pub(crate) flags: OpFlags,
    pub(crate) dead: bool,
}

impl Op {
    pub(crate) fn new(opcode: Opcode, seq: SeqNum) -> Self {
        Self {
            opcode,
            inputs: Vec::new(),
            output: None,
            parent: None,
            seq,
            order: 0,
            flags: OpFlags::empty(),
            dead: false,
        }
    }

    /// The operation kind.
    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Input values in slot order.
    #[inline]
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    /// Input in `slot`, if present.
    #[inline]
    pub fn input(&self, slot: usize) -> Option<ValueId> {
        self.inputs.get(slot).copied()
    }

    /// Number of inputs.
    #[inline]
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Output value, if any.
    #[inline]
    pub fn output(&self) -> Option<ValueId> {
        self.output
    }

    /// Block containing the operation; `None` until inserted.
    #[inline]
    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }

    /// Sequence number.
    #[inline]
    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    /// Position key inside the parent block.
    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Attribute flags.
    #[inline]
    pub fn flags(&self) -> OpFlags {
        self.flags
    }

    /// True once the operation has been destroyed.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// First slot holding `value`.
    pub fn slot_of(&self, value: ValueId) -> Option<usize> {
        self.inputs.iter().position(|v| *v == value)
    }
}
