//! Storage-addressed values.

use bitflags::bitflags;

use crate::{
    cover::Cover,
    ir::{Address, HighId, OpId, Storage},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// Attribute flags carried by a [`Value`].
    pub struct ValueFlags: u32 {
        /// Formal input of the function.
        const INPUT = 0x0001;
        /// Constant; the address offset is the value.
        const CONSTANT = 0x0002;
        /// Storage is tied to a fixed memory location (address taken or global).
        const ADDRTIED = 0x0004;
        /// Global storage that outlives the function.
        const PERSIST = 0x0008;
        /// The write must happen, even if nothing in the function reads it.
        const ADDRFORCE = 0x0010;
        /// The data-type is fixed by an external collaborator.
        const TYPELOCK = 0x0020;
        /// The name is fixed by an external collaborator.
        const NAMELOCK = 0x0040;
        /// Produced by an INDIRECT that creates the value from nothing.
        const INDIRECT_CREATION = 0x0080;
        /// Selected for linking in the current heritage pass.
        const ACTIVE_HERITAGE = 0x0100;
        /// Partial write whose contents are reassembled elsewhere; not a write of the range.
        const WRITEMASK = 0x0200;
        /// Holds the return address of a call.
        const RETURN_ADDRESS = 0x0400;
        /// Points into a space base (the stack pointer and values derived from it).
        const SPACEBASE = 0x0800;
    }
}

/// Opaque data-type identifier supplied by the type-inference collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

/// A storage-addressed value (SSA instance once linked).
///
/// A value occupies `[addr, addr + size)`. It is defined by at most one operation; a value
/// with no definition is either a constant, a formal input, or *free* (a read that has not
/// been linked yet). The definition back-reference and the reader list are maintained
/// exclusively by the mutation API on [`crate::ir::Function`].
#[derive(Debug, Clone)]
pub struct Value {
    pub(crate) addr: Address,
    pub(crate) size: u32,
    pub(crate) def: Option<OpId>,
    pub(crate) descend: Vec<OpId>,
    pub(crate) flags: ValueFlags,
    pub(crate) dtype: Option<TypeId>,
    pub(crate) high: Option<HighId>,
    pub(crate) cover: Option<Cover>,
    pub(crate) dead: bool,
}

impl Value {
    pub(crate) fn new(addr: Address, size: u32, flags: ValueFlags) -> Self {
        Self {
            addr,
            size,
            def: None,
            descend: Vec::new(),
            flags,
            dtype: None,
            high: None,
            cover: None,
            dead: false,
        }
    }

    /// Start address.
    #[inline]
    pub fn addr(&self) -> Address {
        self.addr
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Storage range occupied by this value.
    #[inline]
    pub fn storage(&self) -> Storage {
        Storage::new(self.addr, self.size)
    }

    /// Defining operation, if any.
    #[inline]
    pub fn def(&self) -> Option<OpId> {
        self.def
    }

    /// Operations reading this value, one entry per input slot.
    #[inline]
    pub fn descend(&self) -> &[OpId] {
        &self.descend
    }

    /// Attribute flags.
    #[inline]
    pub fn flags(&self) -> ValueFlags {
        self.flags
    }

    /// Data-type assigned by the type collaborator.
    #[inline]
    pub fn data_type(&self) -> Option<TypeId> {
        self.dtype
    }

    /// Logical variable this value belongs to, once merging has started.
    #[inline]
    pub fn high(&self) -> Option<HighId> {
        self.high
    }

    /// Live range, if computed.
    #[inline]
    pub fn cover(&self) -> Option<&Cover> {
        self.cover.as_ref()
    }

    /// True once the value has been destroyed.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// True if defined by an operation.
    #[inline]
    pub fn is_written(&self) -> bool {
        self.def.is_some()
    }

    /// True for formal inputs.
    #[inline]
    pub fn is_input(&self) -> bool {
        self.flags.contains(ValueFlags::INPUT)
    }

    /// True for constants.
    #[inline]
    pub fn is_constant(&self) -> bool {
        self.flags.contains(ValueFlags::CONSTANT)
    }

    /// True for reads that are not yet linked to a definition.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.def.is_none() && !self.flags.intersects(ValueFlags::INPUT | ValueFlags::CONSTANT)
    }

    /// True if the value has been linked (written, input, or constant).
    #[inline]
    pub fn is_heritage_known(&self) -> bool {
        !self.is_free()
    }

    /// True if nothing reads this value.
    #[inline]
    pub fn has_no_descend(&self) -> bool {
        self.descend.is_empty()
    }

    /// True if the value is tied to its storage.
    #[inline]
    pub fn is_addr_tied(&self) -> bool {
        self.flags.contains(ValueFlags::ADDRTIED)
    }

    /// True for global storage.
    #[inline]
    pub fn is_persist(&self) -> bool {
        self.flags.contains(ValueFlags::PERSIST)
    }

    /// True if the value is selected for linking in the current pass.
    #[inline]
    pub fn is_active_heritage(&self) -> bool {
        self.flags.contains(ValueFlags::ACTIVE_HERITAGE)
    }

    /// True if the value is a masked partial write.
    #[inline]
    pub fn is_write_mask(&self) -> bool {
        self.flags.contains(ValueFlags::WRITEMASK)
    }

    /// True if the value carries a live range suitable for merging.
    #[inline]
    pub fn has_cover(&self) -> bool {
        !self.dead && !self.is_constant() && (self.is_written() || self.is_input())
    }

    /// The constant this value holds, for constants.
    #[inline]
    pub fn constant(&self) -> Option<u64> {
        self.is_constant().then_some(self.addr.offset)
    }

    /// The constant this value holds, sign-extended from the value's size.
    pub fn signed_constant(&self) -> Option<i64> {
        let c = self.constant()?;
        let bits = self.size.saturating_mul(8);
        if bits == 0 || bits >= 64 {
            return Some(c as i64);
        }
        let shift = 64 - bits;
        Some(((c << shift) as i64) >> shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::SpaceId;

    fn constant(size: u32, value: u64) -> Value {
        Value::new(Address::new(SpaceId::new(0), value), size, ValueFlags::CONSTANT)
    }

    #[test]
    fn test_signed_constant_extends_from_size() {
        assert_eq!(constant(4, 0xffff_fff0).signed_constant(), Some(-0x10));
        assert_eq!(constant(4, 0x10).signed_constant(), Some(0x10));
        assert_eq!(constant(1, 0x80).signed_constant(), Some(-0x80));
        assert_eq!(constant(8, 0xffff_fff0).signed_constant(), Some(0xffff_fff0));
    }
}
