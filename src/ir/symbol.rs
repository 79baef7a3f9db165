//! Symbols bound to storage by the naming collaborator.

use crate::ir::{Storage, SymbolId};

/// A source-level symbol and the storage locations that hold it.
///
/// Most symbols have one entry. A symbol with several entries (a variable that moves between
/// a register and a stack slot, for example) asks the merge engine to unify every value
/// stored in any of its locations.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub(crate) id: SymbolId,
    pub(crate) name: String,
    pub(crate) entries: Vec<Storage>,
}

impl Symbol {
    /// Handle of this symbol.
    pub fn id(&self) -> SymbolId {
        self.id
    }

    /// Name of this symbol.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage locations of this symbol.
    pub fn entries(&self) -> &[Storage] {
        &self.entries
    }

    /// True if the symbol is stored in more than one location.
    pub fn is_multi_entry(&self) -> bool {
        self.entries.len() > 1
    }

    /// Byte offset of `storage` inside one of the entries, if contained.
    pub fn offset_of(&self, storage: &Storage) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.contains(storage))
            .map(|e| storage.addr.offset - e.addr.offset)
    }
}
