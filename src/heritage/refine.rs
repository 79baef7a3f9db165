//! Refinement of storage ranges that are only ever accessed in smaller pieces.
//!
//! When a disjoint range is larger than every value in it, linking it as one unit would
//! force needless PIECE/SUBPIECE traffic around each access. Refinement instead cuts the
//! range at every access boundary and rewrites each access that straddles a cut: reads are
//! rebuilt by concatenating the pieces, writes and inputs are split into them.

use crate::{
    ir::{Address, Function, OpId, Opcode, Storage, ValueFlags, ValueId},
    Result,
};

/// Byte offset of `piece` inside `whole`, counted from the least significant end.
pub(crate) fn significance(func: &Function, whole: &Storage, piece: &Storage) -> u64 {
    if func.space(whole.addr.space).is_big_endian() {
        whole.end().wrapping_sub(piece.end()) as u64
    } else {
        piece.addr.offset.wrapping_sub(whole.addr.offset)
    }
}

/// Marks the start and end of every value in `values` as a cut point of `range`.
///
/// `refine` has one slot per byte of the range plus one.
pub fn build_refinement(func: &Function, refine: &mut [u32], range: &Storage, values: &[ValueId]) {
    for &value in values {
        let v = func.value(value);
        let diff = v.addr().offset.wrapping_sub(range.addr.offset) as usize;
        let end = diff + v.size() as usize;
        if end < refine.len() {
            refine[diff] = 1;
            refine[end] = 1;
        }
    }
}

/// Converts cut points into partition sizes stored at each partition's first byte.
///
/// Returns false if there is no cut strictly inside the range.
pub fn boundaries_to_sizes(refine: &mut [u32], size: u32) -> bool {
    let mut last = 0usize;
    for pos in 1..size as usize {
        if refine[pos] != 0 {
            refine[last] = (pos - last) as u32;
            last = pos;
        }
    }
    if last == 0 {
        return false;
    }
    refine[last] = size - last as u32;
    true
}

/// Fuses adjacent partitions of sizes 1 and 3 (in either order) into one of size 4.
///
/// Such a split is almost always a byte access into an aligned 4-byte quantity rather than
/// two independent variables.
pub fn remove_13_refinement(refine: &mut [u32]) {
    let Some(&first) = refine.first() else {
        return;
    };
    let mut pos = first as usize;
    let mut last = first as usize;
    // The trailing slot marks the end of the range, not a partition.
    while pos + 1 < refine.len() {
        let cur = refine[pos] as usize;
        if cur == 0 {
            break;
        }
        if (last == 1 && cur == 3) || (last == 3 && cur == 1) {
            refine[pos - last] = 4;
            last = 4;
            pos += cur;
        } else {
            last = cur;
            pos += cur;
        }
    }
}

/// Partition sizes of `range` implied by `refine`, in address order.
pub fn partition_sizes(refine: &[u32], size: u32) -> Vec<u32> {
    let mut sizes = Vec::new();
    let mut cut = 0usize;
    while cut < size as usize {
        let sz = refine[cut].max(1);
        sizes.push(sz);
        cut += sz as usize;
    }
    sizes
}

/// Creates one new value per partition covered by `value`. Returns nothing if `value` is
/// already a single partition.
pub fn split_by_refinement(
    func: &mut Function,
    value: ValueId,
    range: &Storage,
    refine: &[u32],
) -> Vec<ValueId> {
    let (mut addr, mut size) = {
        let v = func.value(value);
        (v.addr(), v.size())
    };
    let mut diff = addr.offset.wrapping_sub(range.addr.offset) as usize;
    let mut cut = refine.get(diff).copied().unwrap_or(size).max(1);
    if size <= cut {
        return Vec::new();
    }
    let mut split = Vec::new();
    while size > 0 {
        split.push(func.new_value(addr, cut));
        addr = addr.add(u64::from(cut));
        size -= cut;
        diff = addr.offset.wrapping_sub(range.addr.offset) as usize;
        cut = refine.get(diff).copied().unwrap_or(size).max(1).min(size);
    }
    split
}

/// Builds `whole` as the PIECE-wise concatenation of `pieces` (given in address order),
/// inserting the ops before `insert`, or at the start of the entry block.
pub fn concat_pieces(
    func: &mut Function,
    pieces: &[ValueId],
    insert: Option<OpId>,
    whole: ValueId,
) -> Result<()> {
    let Some(&first) = pieces.first() else {
        return Ok(());
    };
    let big_endian = func.space(func.value(first).addr().space).is_big_endian();
    let pc = insert.map_or(func.entry_pc(), |op| func.op(op).seq().pc);
    let mut prev_inserted: Option<OpId> = None;
    let mut acc = first;

    for (i, &piece) in pieces.iter().enumerate().skip(1) {
        let op = func.new_op(Opcode::Piece, pc);
        let out = if i == pieces.len() - 1 {
            whole
        } else {
            let size = func.value(acc).size() + func.value(piece).size();
            func.new_unique(size)
        };
        func.set_output(op, out);
        let (most, least) = if big_endian { (acc, piece) } else { (piece, acc) };
        func.set_input(op, most, 0);
        func.set_input(op, least, 1);
        match (insert, prev_inserted) {
            (Some(before), _) => func.insert_before(op, before)?,
            (None, None) => {
                let entry = func.entry_block();
                func.insert_begin(op, entry);
            }
            (None, Some(prev)) => func.insert_after(op, prev)?,
        }
        prev_inserted = Some(op);
        acc = out;
    }
    Ok(())
}

/// Defines each of `pieces` as a SUBPIECE of `whole`, which occupies `storage`.
///
/// The ops go right after `after`, or at the start of the entry block.
pub fn split_pieces(
    func: &mut Function,
    pieces: &[ValueId],
    after: Option<OpId>,
    storage: &Storage,
    whole: ValueId,
) -> Result<()> {
    let pc = after.map_or(func.entry_pc(), |op| func.op(op).seq().pc);
    let mut prev = after;

    for &piece in pieces {
        let diff = significance(func, storage, &func.value(piece).storage());
        let op = func.new_op(Opcode::SubPiece, pc);
        func.set_input(op, whole, 0);
        let c = func.new_const(4, diff);
        func.set_input(op, c, 1);
        func.set_output(op, piece);
        match prev {
            Some(p) => func.insert_after(op, p)?,
            None => {
                let entry = func.entry_block();
                func.insert_begin(op, entry);
            }
        }
        prev = Some(op);
    }
    Ok(())
}

/// Rewrites a free read straddling partitions as a concatenation of per-partition reads.
pub fn refine_read(
    func: &mut Function,
    value: ValueId,
    range: &Storage,
    refine: &[u32],
) -> Result<()> {
    let pieces = split_by_refinement(func, value, range, refine);
    if pieces.is_empty() {
        return Ok(());
    }
    let Some(&reader) = func.value(value).descend().first() else {
        return Ok(());
    };
    let replace = func.new_unique(func.value(value).size());
    concat_pieces(func, &pieces, Some(reader), replace)?;
    if let Some(slot) = func.op(reader).slot_of(value) {
        func.set_input(reader, replace, slot);
    }
    if func.value(value).has_no_descend() {
        func.value_destroy(value);
    }
    Ok(())
}

/// Rewrites a write straddling partitions: the defining op now writes a temporary, which is
/// split into per-partition writes.
pub fn refine_write(
    func: &mut Function,
    value: ValueId,
    range: &Storage,
    refine: &[u32],
) -> Result<()> {
    let pieces = split_by_refinement(func, value, range, refine);
    if pieces.is_empty() {
        return Ok(());
    }
    let Some(def) = func.value(value).def() else {
        return Ok(());
    };
    let storage = func.value(value).storage();
    let replace = func.new_unique(storage.size);
    func.set_output(def, replace);
    split_pieces(func, &pieces, Some(def), &storage, replace)?;
    func.total_replace(value, replace);
    func.value_destroy(value);
    Ok(())
}

/// Splits an input straddling partitions at function entry and masks the original.
pub fn refine_input(
    func: &mut Function,
    value: ValueId,
    range: &Storage,
    refine: &[u32],
) -> Result<()> {
    let pieces = split_by_refinement(func, value, range, refine);
    if pieces.is_empty() {
        return Ok(());
    }
    let storage = func.value(value).storage();
    split_pieces(func, &pieces, None, &storage, value)?;
    func.set_value_flags(value, ValueFlags::WRITEMASK);
    Ok(())
}

/// Computes the partition of `range` induced by its accesses and rewrites the accesses to
/// match. Returns the partition sizes, or `None` if the range stays whole.
pub fn refinement(
    func: &mut Function,
    range: &Storage,
    reads: &[ValueId],
    writes: &[ValueId],
    inputs: &[ValueId],
    fuse_1_3: bool,
) -> Result<Option<Vec<u32>>> {
    if range.size > 1024 {
        return Ok(None);
    }
    let mut refine = vec![0u32; range.size as usize + 1];
    build_refinement(func, &mut refine, range, reads);
    build_refinement(func, &mut refine, range, writes);
    build_refinement(func, &mut refine, range, inputs);
    if !boundaries_to_sizes(&mut refine, range.size) {
        return Ok(None);
    }
    if fuse_1_3 {
        remove_13_refinement(&mut refine);
    }

    for &v in reads {
        refine_read(func, v, range, &refine)?;
    }
    for &v in writes {
        refine_write(func, v, range, &refine)?;
    }
    for &v in inputs {
        refine_input(func, v, range, &refine)?;
    }
    Ok(Some(partition_sizes(&refine, range.size)))
}

/// Start addresses and sizes of the partitions.
pub fn partitions(range: &Storage, sizes: &[u32]) -> Vec<Storage> {
    let mut addr: Address = range.addr;
    sizes
        .iter()
        .map(|&sz| {
            let piece = Storage::new(addr, sz);
            addr = addr.add(u64::from(sz));
            piece
        })
        .collect()
}
