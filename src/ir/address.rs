//! Address spaces, addresses and storage ranges.

use std::fmt;

use crate::ir::SpaceId;

/// Kind of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceKind {
    /// Constant values; the offset is the value itself.
    Constant,
    /// Processor registers.
    Register,
    /// Stack frame, addressed relative to the stack pointer at function entry.
    Stack,
    /// Global memory.
    Ram,
    /// Compiler temporaries.
    Unique,
    /// Internal space whose offsets name operations (INDIRECT annotations).
    Iop,
}

impl SpaceKind {
    /// True for spaces whose values are linked into SSA form.
    #[must_use]
    pub fn is_heritaged(self) -> bool {
        matches!(self, Self::Register | Self::Stack | Self::Ram | Self::Unique)
    }
}

/// `offset` masked to `highest` and read as a two's complement number of that width.
pub(crate) fn signed_within(offset: u64, highest: u64) -> i64 {
    let off = offset & highest;
    if highest == u64::MAX || off <= highest >> 1 {
        off as i64
    } else {
        (i128::from(off) - i128::from(highest) - 1) as i64
    }
}

/// Description of one address space.
#[derive(Debug, Clone)]
pub struct AddrSpace {
    pub(crate) id: SpaceId,
    pub(crate) name: String,
    pub(crate) kind: SpaceKind,
    pub(crate) big_endian: bool,
    pub(crate) highest: u64,
    pub(crate) contain: Option<SpaceId>,
    pub(crate) delay: u32,
    pub(crate) deadcode_delay: u32,
}

impl AddrSpace {
    /// Creates a little-endian space spanning the full 64-bit offset range.
    #[must_use]
    pub fn new(id: SpaceId, name: impl Into<String>, kind: SpaceKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            big_endian: false,
            highest: u64::MAX,
            contain: None,
            delay: 0,
            deadcode_delay: 0,
        }
    }

    /// Handle of this space.
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Name of this space.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of this space.
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// True if multi-byte values are stored most significant byte first.
    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    /// Largest valid offset.
    pub fn highest(&self) -> u64 {
        self.highest
    }

    /// `offset` reduced to the width of this space and read as a two's complement
    /// displacement, so that stack offsets below the entry stack pointer come out negative.
    ///
    /// `highest` is one less than a power of two for every space this is used on.
    pub fn signed_offset(&self, offset: u64) -> i64 {
        signed_within(offset, self.highest)
    }

    /// Space that pointers into this space actually address (the stack lives in RAM).
    pub fn contain(&self) -> Option<SpaceId> {
        self.contain
    }

    /// Passes to wait before values in this space are first linked.
    pub fn delay(&self) -> u32 {
        self.delay
    }

    /// Passes to wait before dead-code removal may run on this space.
    pub fn deadcode_delay(&self) -> u32 {
        self.deadcode_delay
    }
}

/// A location inside an address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub(crate) space: SpaceId,
    pub(crate) offset: u64,
}

impl Address {
    /// Creates an address.
    #[must_use]
    #[inline]
    pub const fn new(space: SpaceId, offset: u64) -> Self {
        Self { space, offset }
    }

    /// The space this address belongs to.
    #[inline]
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Byte offset within the space.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The address `bytes` further into the same space, wrapping on overflow.
    #[must_use]
    #[inline]
    pub fn add(self, bytes: u64) -> Self {
        Self {
            space: self.space,
            offset: self.offset.wrapping_add(bytes),
        }
    }

    /// Position of `self + skip` inside `[base, base + size)`, if it falls there.
    pub fn overlap(&self, skip: u64, base: Address, size: u32) -> Option<u64> {
        if self.space != base.space {
            return None;
        }
        let pos = self.offset.wrapping_add(skip);
        if pos < base.offset {
            return None;
        }
        let diff = pos - base.offset;
        (diff < u64::from(size)).then_some(diff)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.space, self.offset)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.space, self.offset)
    }
}

/// A contiguous byte range `[addr, addr + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Storage {
    /// First byte.
    pub addr: Address,
    /// Length in bytes.
    pub size: u32,
}

impl Storage {
    /// Creates a storage range.
    #[must_use]
    pub const fn new(addr: Address, size: u32) -> Self {
        Self { addr, size }
    }

    /// The same start address with a different length.
    #[must_use]
    pub const fn with_size(self, size: u32) -> Self {
        Self {
            addr: self.addr,
            size,
        }
    }

    /// One past the last byte offset.
    ///
    /// Computed without wrapping: a range whose last byte is the top of the offset range
    /// (a stack slot ending at the entry stack pointer) ends at `1 << 64`.
    #[inline]
    pub fn end(&self) -> u128 {
        u128::from(self.addr.offset) + u128::from(self.size)
    }

    /// True if every byte of `other` lies inside `self`.
    pub fn contains(&self, other: &Storage) -> bool {
        self.addr.space == other.addr.space
            && other.addr.offset >= self.addr.offset
            && other.end() <= self.end()
    }

    /// True if `self` and `other` share at least one byte.
    pub fn overlaps(&self, other: &Storage) -> bool {
        self.addr.space == other.addr.space
            && u128::from(self.addr.offset) < other.end()
            && u128::from(other.addr.offset) < self.end()
    }

    /// True if `other` starts at the same address and fits inside `self`.
    pub fn contains_justified(&self, other: &Storage) -> bool {
        self.addr == other.addr && other.size <= self.size
    }
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.addr, self.size)
    }
}
