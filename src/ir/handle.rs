//! Strongly-typed arena handles.
//!
//! Every object owned by a [`crate::ir::Function`] is referenced through a `usize` newtype
//! instead of a pointer. Handles are stable: destroying an object marks its slot dead but
//! never reuses the index, so a stale handle can be detected rather than aliasing a new
//! object.

use std::fmt;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) usize);

        impl $name {
            /// Creates a handle from a raw index.
            #[must_use]
            #[inline]
            pub const fn new(index: usize) -> Self {
                $name(index)
            }

            /// Returns the raw index of this handle.
            #[must_use]
            #[inline]
            pub const fn index(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(index: usize) -> Self {
                $name(index)
            }
        }

        impl From<$name> for usize {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_handle!(
    /// Handle to a storage-addressed value in the function's value pool.
    ValueId,
    "v"
);
define_handle!(
    /// Handle to an IR operation.
    OpId,
    "op"
);
define_handle!(
    /// Handle to a basic block; doubles as the node identifier for graph algorithms.
    BlockId,
    "bb"
);
define_handle!(
    /// Handle to a logical variable produced by merging.
    HighId,
    "high"
);
define_handle!(
    /// Handle to an address space.
    SpaceId,
    "space"
);
define_handle!(
    /// Handle to a symbol registered on the function.
    SymbolId,
    "sym"
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_handle_roundtrip() {
        let v = ValueId::new(42);
        assert_eq!(v.index(), 42);
        let raw: usize = v.into();
        assert_eq!(ValueId::from(raw), v);
    }

    #[test]
    fn test_handle_formatting() {
        assert_eq!(format!("{:?}", OpId::new(3)), "OpId(3)");
        assert_eq!(format!("{}", OpId::new(3)), "op3");
        assert_eq!(format!("{}", BlockId::new(0)), "bb0");
        assert_eq!(format!("{}", ValueId::new(9)), "v9");
    }

    #[test]
    fn test_handle_ordering_and_hash() {
        let mut ids = vec![BlockId::new(2), BlockId::new(0), BlockId::new(1)];
        ids.sort();
        assert_eq!(ids, vec![BlockId::new(0), BlockId::new(1), BlockId::new(2)]);
        let set: HashSet<_> = ids.into_iter().collect();
        assert!(set.contains(&BlockId::new(1)));
    }
}
