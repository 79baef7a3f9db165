//! Logical variables and the interference test between them.

use rustc_hash::FxHashMap;

use crate::{
    cover::{Cover, Intersection},
    ir::{Function, HighId, Opcode, Storage, SymbolId, TypeId, ValueFlags, ValueId},
};

/// Binding of a logical variable to a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolEntry {
    /// The symbol.
    pub symbol: SymbolId,
    /// Byte offset of the variable inside the symbol's storage.
    pub offset: u64,
}

/// A logical variable: the set of SSA values that end up as one source-level variable.
#[derive(Debug, Clone, Default)]
pub struct HighVariable {
    pub(crate) instances: Vec<ValueId>,
    pub(crate) cover: Cover,
    pub(crate) cover_dirty: bool,
    pub(crate) flags: ValueFlags,
    pub(crate) tied: Option<Storage>,
    pub(crate) symbol: Option<SymbolEntry>,
    pub(crate) type_lock: Option<TypeId>,
    pub(crate) overlap_group: Option<usize>,
    pub(crate) dead: bool,
}

impl HighVariable {
    /// Member values, inputs first, then by definition position.
    pub fn instances(&self) -> &[ValueId] {
        &self.instances
    }

    /// Union of the members' live ranges. Stale while [`HighVariable::is_cover_dirty`].
    pub fn cover(&self) -> &Cover {
        &self.cover
    }

    /// True if a member was added or removed since the cover was last computed.
    pub fn is_cover_dirty(&self) -> bool {
        self.cover_dirty
    }

    /// True if some member is tied to its storage.
    pub fn is_addr_tied(&self) -> bool {
        self.flags.contains(ValueFlags::ADDRTIED)
    }

    /// True if some member is global storage.
    pub fn is_persist(&self) -> bool {
        self.flags.contains(ValueFlags::PERSIST)
    }

    /// True if some member is a formal input.
    pub fn is_input(&self) -> bool {
        self.flags.contains(ValueFlags::INPUT)
    }

    /// True if the variable's name is fixed.
    pub fn is_name_locked(&self) -> bool {
        self.flags.contains(ValueFlags::NAMELOCK)
    }

    /// Locked data-type, if any.
    pub fn type_lock(&self) -> Option<TypeId> {
        self.type_lock
    }

    /// Storage of the address-tied members.
    pub fn tied_storage(&self) -> Option<Storage> {
        self.tied
    }

    /// Symbol the variable is bound to.
    pub fn symbol(&self) -> Option<SymbolEntry> {
        self.symbol
    }

    /// Group of variables sharing overlapping storage.
    pub fn overlap_group(&self) -> Option<usize> {
        self.overlap_group
    }

    /// True once the variable has been absorbed into another.
    pub fn is_dead(&self) -> bool {
        self.dead
    }
}

/// Sort key placing inputs first, then values by block and position of their definition.
fn def_position(func: &Function, value: ValueId) -> (usize, u32, usize) {
    let v = func.value(value);
    match v.def() {
        Some(op) => (
            func.parent(op).map_or(usize::MAX, |b| b.index() + 1),
            func.op(op).order(),
            value.index(),
        ),
        None => (0, 0, value.index()),
    }
}

impl Function {
    /// Creates a logical variable for every live value with a live range that has none.
    pub fn create_highs(&mut self) {
        if self.covers_dirty() {
            self.update_covers();
        }
        let missing: Vec<ValueId> = self
            .values()
            .filter(|(_, v)| v.has_cover() && v.high().is_none())
            .map(|(id, _)| id)
            .collect();
        for value in missing {
            if self.value(value).cover().is_none() {
                self.update_cover(value);
            }
            self.new_high(value);
        }
    }

    /// Creates a logical variable holding only `value`.
    pub(crate) fn new_high(&mut self, value: ValueId) -> HighId {
        let id = HighId::new(self.highs.len());
        let v = self.value(value);
        let storage = v.storage();
        let flags = v.flags()
            & (ValueFlags::ADDRTIED | ValueFlags::PERSIST | ValueFlags::INPUT | ValueFlags::NAMELOCK);
        let type_lock = v
            .flags()
            .contains(ValueFlags::TYPELOCK)
            .then(|| v.data_type())
            .flatten();
        let symbol = self.symbol_at(&storage).and_then(|s| {
            self.symbol(s)
                .offset_of(&storage)
                .map(|offset| SymbolEntry { symbol: s, offset })
        });
        let cover = v.cover().cloned().unwrap_or_default();
        self.highs.push(HighVariable {
            instances: vec![value],
            cover,
            cover_dirty: false,
            flags,
            tied: flags.contains(ValueFlags::ADDRTIED).then_some(storage),
            symbol,
            type_lock,
            overlap_group: None,
            dead: false,
        });
        self.values[value.index()].high = Some(id);
        id
    }

    /// Recomputes the cover of `high` from its members if it is stale.
    pub fn update_high_cover(&mut self, high: HighId) {
        if !self.highs[high.index()].cover_dirty {
            return;
        }
        let mut cover = Cover::new();
        for &value in &self.highs[high.index()].instances {
            if let Some(c) = self.values[value.index()].cover() {
                cover.merge(c);
            }
        }
        let h = &mut self.highs[high.index()];
        h.cover = cover;
        h.cover_dirty = false;
    }

    /// Marks the cover of `high` stale.
    pub(crate) fn mark_high_dirty(&mut self, high: HighId) {
        self.highs[high.index()].cover_dirty = true;
    }

    /// Moves every member of `absorb` into `keep`. `absorb` is dead afterwards.
    pub(crate) fn merge_highs(&mut self, keep: HighId, absorb: HighId) {
        if keep == absorb {
            return;
        }
        let taken = std::mem::take(&mut self.highs[absorb.index()]);
        for &value in &taken.instances {
            self.values[value.index()].high = Some(keep);
        }
        self.highs[absorb.index()].dead = true;

        let mut instances = std::mem::take(&mut self.highs[keep.index()].instances);
        instances.extend_from_slice(&taken.instances);
        instances.sort_by_key(|v| def_position(self, *v));

        let h = &mut self.highs[keep.index()];
        h.instances = instances;
        h.flags |= taken.flags;
        h.tied = h.tied.or(taken.tied);
        h.symbol = h.symbol.or(taken.symbol);
        h.type_lock = h.type_lock.or(taken.type_lock);
        h.overlap_group = h.overlap_group.or(taken.overlap_group);
        if h.cover_dirty || taken.cover_dirty {
            h.cover_dirty = true;
        } else {
            h.cover.merge(&taken.cover);
        }
    }

    /// Removes `value` from its logical variable.
    pub(crate) fn remove_instance(&mut self, value: ValueId) {
        let Some(high) = self.values[value.index()].high.take() else {
            return;
        };
        let h = &mut self.highs[high.index()];
        h.instances.retain(|v| *v != value);
        h.cover_dirty = true;
        if h.instances.is_empty() {
            h.dead = true;
        }
    }
}

/// True if `a` and `b` hold the same value because one is a chain of COPYs of the other, or
/// both are COPYs of a common root, with every link of the chain in the same storage.
pub fn copy_shadow(func: &Function, a: ValueId, b: ValueId) -> bool {
    if a == b {
        return true;
    }
    let storage = func.value(a).storage();
    if func.value(b).storage() != storage {
        return false;
    }
    let copied_from = |v: ValueId| {
        let def = func.value(v).def()?;
        let op = func.op(def);
        let input = op.input(0)?;
        (op.opcode() == Opcode::Copy && func.value(input).storage() == storage).then_some(input)
    };

    let mut chain = vec![a];
    let mut cur = a;
    while let Some(src) = copied_from(cur) {
        if src == b {
            return true;
        }
        chain.push(src);
        cur = src;
    }
    let mut cur = b;
    while let Some(src) = copied_from(cur) {
        if chain.contains(&src) {
            return true;
        }
        cur = src;
    }
    false
}

/// First pair of members of `a` and `b` whose live ranges overlap, ignoring copy shadows.
pub fn conflicting_instances(
    func: &Function,
    a: HighId,
    b: HighId,
) -> Option<(ValueId, ValueId)> {
    let (ha, hb) = (func.high(a), func.high(b));
    if !ha.is_cover_dirty()
        && !hb.is_cover_dirty()
        && ha.cover().intersect(hb.cover()) != Intersection::Overlap
    {
        return None;
    }
    for &va in ha.instances() {
        let Some(ca) = func.value(va).cover() else {
            continue;
        };
        for &vb in hb.instances() {
            let Some(cb) = func.value(vb).cover() else {
                continue;
            };
            if ca.intersect(cb) == Intersection::Overlap && !copy_shadow(func, va, vb) {
                return Some((va, vb));
            }
        }
    }
    None
}

/// Memoized pairwise interference between logical variables.
///
/// Results stay valid until one of the two variables changes membership; the merge engine
/// calls [`HighIntersectTest::invalidate`] for both sides of every merge and trim.
#[derive(Debug, Default)]
pub struct HighIntersectTest {
    cache: FxHashMap<(HighId, HighId), Option<(ValueId, ValueId)>>,
}

impl HighIntersectTest {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Members of `a` and `b` that interfere, if any.
    pub fn intersection(
        &mut self,
        func: &Function,
        a: HighId,
        b: HighId,
    ) -> Option<(ValueId, ValueId)> {
        let key = if a < b { (a, b) } else { (b, a) };
        if let Some(hit) = self.cache.get(&key) {
            return *hit;
        }
        let result = conflicting_instances(func, key.0, key.1);
        self.cache.insert(key, result);
        result
    }

    /// Forgets every result involving `high`.
    pub fn invalidate(&mut self, high: HighId) {
        self.cache.retain(|(a, b), _| *a != high && *b != high);
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Number of cached pairs.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
