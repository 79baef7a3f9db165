//! COPY cleanup after merging.
//!
//! Merging leaves two kinds of COPY behind that a printer should not show:
//!
//! - COPYs whose input and output ended up in the same variable. They are marked
//!   [`OpFlags::NONPRINTING`] and stay in the IR.
//! - Trim COPYs that duplicate one another. When several trims copy the same value into the
//!   same variable and one of them dominates the others, the dominated ones are removed and
//!   their readers are pointed at the dominating COPY's output.
//!
//! # Example
//!
//! Before (two phi-nodes trimmed the same input `v0` into variable `h`):
//! ```text
//! B1: t1 = COPY v0          // h
//! B2: t2 = COPY v0          // h, B1 dominates B2
//!     x  = MULTIEQUAL t2, y
//! ```
//!
//! After:
//! ```text
//! B1: t1 = COPY v0
//! B2: x  = MULTIEQUAL t1, y
//! ```

use std::collections::BTreeMap;

use crate::{
    cover::{Cover, Intersection},
    ir::{Function, OpFlags, OpId, Opcode, ValueId},
    merge::{copy_shadow, Merge},
    Result,
};

/// True if the op `a` runs before `b` on every path to `b`.
fn op_dominates(merge: &Merge, func: &Function, a: OpId, b: OpId) -> bool {
    let (Some(ba), Some(bb)) = (func.parent(a), func.parent(b)) else {
        return false;
    };
    if ba == bb {
        return func.before_in_block(a, b);
    }
    merge
        .dominators
        .as_ref()
        .is_some_and(|tree| tree.dominates(ba, bb))
}

impl Merge {
    /// Marks every COPY whose input and output share a variable as non-printing.
    pub fn mark_internal_copies(&self, func: &mut Function) {
        let copies: Vec<OpId> = func.ops_with(Opcode::Copy).collect();
        for op in copies {
            let (Some(out), Some(input)) = (func.op(op).output(), func.op(op).input(0)) else {
                continue;
            };
            let high = func.value(out).high();
            if high.is_some() && high == func.value(input).high() {
                func.set_op_flags(op, OpFlags::NONPRINTING);
            }
        }
    }

    /// Removes trim COPYs made redundant by a dominating trim of the same value.
    pub fn process_copy_trims(&mut self, func: &mut Function) -> Result<()> {
        let mut by_input: BTreeMap<ValueId, Vec<OpId>> = BTreeMap::new();
        for &op in &self.copy_trims {
            let o = func.op(op);
            if o.is_dead() || o.parent().is_none() || !o.flags().contains(OpFlags::TRIM_COPY) {
                continue;
            }
            if let Some(input) = o.input(0) {
                by_input.entry(input).or_default().push(op);
            }
        }

        let mut removed = 0;
        for (_, group) in by_input {
            if group.len() > 1 {
                removed += self.eliminate_redundant_copies(func, &group)?;
            }
        }
        self.copy_trims.retain(|op| !func.op(*op).is_dead());
        if removed > 0 {
            log::debug!("{}: removed {removed} redundant trim copies", func.name());
        }
        Ok(())
    }

    /// Within `group`, all COPYs of one value, removes each COPY dominated by another whose
    /// output can take over its readers. Returns the number removed.
    pub fn eliminate_redundant_copies(
        &mut self,
        func: &mut Function,
        group: &[OpId],
    ) -> Result<usize> {
        let mut removed = 0;
        for (i, &sub) in group.iter().enumerate() {
            for &dom in group.iter().take(i).chain(group.iter().skip(i + 1)) {
                if func.op(dom).is_dead() || func.op(sub).is_dead() {
                    continue;
                }
                if !op_dominates(self, func, dom, sub) || !self.can_replace(func, dom, sub) {
                    continue;
                }
                let (Some(keep), Some(gone)) = (func.op(dom).output(), func.op(sub).output()) else {
                    continue;
                };
                func.total_replace(gone, keep);
                func.remove_instance(gone);
                func.op_destroy(sub);
                func.update_cover(keep);
                if let Some(high) = func.value(keep).high() {
                    func.mark_high_dirty(high);
                    self.tests.invalidate(high);
                }
                removed += 1;
                break;
            }
        }
        Ok(removed)
    }

    /// True if the output of `dom` can serve every reader of the output of `sub` without
    /// colliding with another member of their shared variable.
    fn can_replace(&self, func: &Function, dom: OpId, sub: OpId) -> bool {
        let (Some(keep), Some(gone)) = (func.op(dom).output(), func.op(sub).output()) else {
            return false;
        };
        let Some(high) = func.value(keep).high() else {
            return false;
        };
        if func.value(gone).high() != Some(high) {
            return false;
        }

        let mut extended = Cover::new();
        let Some(def) = extended.add_def_point(func, keep) else {
            return false;
        };
        for &reader in func.value(keep).descend() {
            extended.add_ref_point(func, reader, keep, def);
        }
        for &reader in func.value(gone).descend() {
            extended.add_ref_point(func, reader, gone, def);
        }

        func.high(high).instances().iter().all(|&other| {
            if other == keep || other == gone || copy_shadow(func, keep, other) {
                return true;
            }
            func.value(other)
                .cover()
                .is_none_or(|c| extended.intersect(c) != Intersection::Overlap)
        })
    }
}
