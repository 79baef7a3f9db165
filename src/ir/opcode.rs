//! Operation kinds.
//!
//! [`Opcode`] is a closed enumeration; every pass that dispatches on operation kind does so
//! with an exhaustive `match`, so adding a kind forces each of them to be revisited.

use strum::{Display, EnumCount, EnumIter};

/// The kind of an IR operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumCount)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    /// Copy input 0 to the output.
    Copy,
    /// Load from the space named by input 0 at the pointer in input 1.
    Load,
    /// Store input 2 to the space named by input 0 at the pointer in input 1.
    Store,
    /// Unconditional branch.
    Branch,
    /// Conditional branch.
    CBranch,
    /// Computed branch.
    BranchInd,
    /// Direct call; input 0 is the target.
    Call,
    /// Computed call; input 0 is the target pointer.
    CallInd,
    /// Opaque user-defined operation with possible side effects.
    CallOther,
    /// Function return.
    Return,
    /// Integer addition.
    IntAdd,
    /// Integer subtraction.
    IntSub,
    /// Bitwise and.
    IntAnd,
    /// Integer multiplication.
    IntMult,
    /// Zero extension.
    IntZext,
    /// Sign extension.
    IntSext,
    /// Concatenation; input 0 is the most significant part.
    Piece,
    /// Truncation; input 1 is the byte offset of the least significant byte kept.
    SubPiece,
    /// Phi-node; input `i` flows in along incoming edge `i` of the block.
    MultiEqual,
    /// Indirect effect of another operation; input 1 names the operation.
    Indirect,
    /// Pointer plus scaled index; input 2 is the element size.
    PtrAdd,
    /// Pointer to a sub-component at a constant offset.
    PtrSub,
    /// Reinterpretation without change of bits.
    Cast,
    /// Any other computation the core does not need to understand.
    Other,
}

impl Opcode {
    /// True for operations that transfer control to another function.
    #[must_use]
    pub fn is_call(self) -> bool {
        matches!(self, Self::Call | Self::CallInd | Self::CallOther)
    }

    /// True for the synthetic data-flow operations placed by heritage.
    #[must_use]
    pub fn is_marker(self) -> bool {
        matches!(self, Self::MultiEqual | Self::Indirect)
    }

    /// True for operations that end a basic block.
    #[must_use]
    pub fn is_block_end(self) -> bool {
        matches!(
            self,
            Self::Branch | Self::CBranch | Self::BranchInd | Self::Return
        )
    }

    /// True for operations whose output is a plain re-labelling of input 0.
    #[must_use]
    pub fn is_copy_like(self) -> bool {
        matches!(self, Self::Copy | Self::Cast | Self::Indirect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_display_names() {
        assert_eq!(Opcode::MultiEqual.to_string(), "MULTI_EQUAL");
        assert_eq!(Opcode::Copy.to_string(), "COPY");
        assert_eq!(Opcode::SubPiece.to_string(), "SUB_PIECE");
    }

    #[test]
    fn test_predicates_are_disjoint() {
        for op in Opcode::iter() {
            assert!(!(op.is_call() && op.is_marker()), "{op}");
            assert!(!(op.is_block_end() && op.is_marker()), "{op}");
        }
        assert_eq!(Opcode::iter().filter(|op| op.is_call()).count(), 3);
        assert!(Opcode::COUNT > 20);
    }
}
