//! Renaming: the dominator-tree walk that connects reads to reaching definitions.

use rustc_hash::FxHashMap;

use crate::{
    heritage::Heritage,
    ir::{Address, BlockId, Function, OpId, Opcode, ValueFlags, ValueId},
    Result,
};

enum Visit {
    Enter(BlockId),
    Leave(Vec<Address>),
}

/// Current definition of every location on the path from the entry block.
type DefStacks = FxHashMap<Address, Vec<ValueId>>;

/// Top of the stack for `value`'s location, creating a formal input if nothing is defined.
fn reaching(func: &mut Function, stacks: &mut DefStacks, value: ValueId) -> ValueId {
    let storage = func.value(value).storage();
    let stack = stacks.entry(storage.addr).or_default();
    match stack.last() {
        Some(&top) => top,
        None => {
            let input = func.new_input(storage);
            stack.push(input);
            input
        }
    }
}

/// Like [`reaching`], but skips an INDIRECT attached to `reader` itself.
///
/// An INDIRECT sits before the op it describes, so its output is on the stack when the op
/// reads the same location. The op must see the value from before the INDIRECT.
fn reaching_for(
    func: &mut Function,
    stacks: &mut DefStacks,
    value: ValueId,
    reader: OpId,
) -> ValueId {
    let top = reaching(func, stacks, value);
    let paired = func
        .value(top)
        .def()
        .filter(|def| func.op(*def).opcode() == Opcode::Indirect)
        .and_then(|def| func.indirect_target(def))
        == Some(reader);
    if !paired {
        return top;
    }
    let storage = func.value(value).storage();
    let stack = stacks.entry(storage.addr).or_default();
    if stack.len() >= 2 {
        return stack[stack.len() - 2];
    }
    let input = func.new_input(storage);
    stack.insert(0, input);
    input
}

fn replace_read(func: &mut Function, op: OpId, slot: usize, old: ValueId, new: ValueId) {
    if old == new {
        return;
    }
    func.set_input(op, new, slot);
    if func.value(old).has_no_descend() {
        func.value_destroy(old);
    }
}

/// Renames the reads and writes inside `block`. Returns the locations pushed.
fn rename_block(func: &mut Function, stacks: &mut DefStacks, block: BlockId) -> Vec<Address> {
    let mut pushed = Vec::new();
    let ops = func.block(block).ops().to_vec();
    for op in ops {
        if func.op(op).opcode() != Opcode::MultiEqual {
            for slot in 0..func.op(op).num_inputs() {
                let Some(old) = func.op(op).input(slot) else {
                    continue;
                };
                let v = func.value(old);
                if !v.is_free() || !v.is_active_heritage() {
                    continue;
                }
                func.clear_value_flags(old, ValueFlags::ACTIVE_HERITAGE);
                let new = reaching_for(func, stacks, old, op);
                replace_read(func, op, slot, old, new);
            }
        }

        let Some(out) = func.op(op).output() else {
            continue;
        };
        if !func.value(out).is_active_heritage() {
            continue;
        }
        func.clear_value_flags(out, ValueFlags::ACTIVE_HERITAGE);
        let addr = func.value(out).addr();
        stacks.entry(addr).or_default().push(out);
        pushed.push(addr);
    }

    // Fill the phi-node slots fed by each outgoing edge.
    let outs = func.block(block).outs().to_vec();
    for edge in outs {
        let phis: Vec<_> = func
            .block(edge.point)
            .ops()
            .iter()
            .copied()
            .take_while(|o| func.op(*o).opcode() == Opcode::MultiEqual)
            .collect();
        for phi in phis {
            let slot = edge.reverse_index;
            let (Some(out), Some(old)) = (func.op(phi).output(), func.op(phi).input(slot)) else {
                continue;
            };
            if func.value(old).is_heritage_known() {
                continue;
            }
            let storage = func.value(out).storage();
            let stack = stacks.entry(storage.addr).or_default();
            let new = match stack.last() {
                Some(&top) => top,
                None => {
                    let input = func.new_input(storage);
                    stack.push(input);
                    input
                }
            };
            replace_read(func, phi, slot, old, new);
        }
    }
    pushed
}

impl Heritage {
    /// Walks the dominator tree once, linking every active read of the pass to its reaching
    /// definition and every phi-node input to the definition live at the end of its edge.
    pub(super) fn rename(&self, func: &mut Function) -> Result<()> {
        let Some(dominance) = &self.dominance else {
            return Ok(());
        };
        let tree = dominance.tree();
        let mut stacks = DefStacks::default();
        let mut work = vec![Visit::Enter(tree.entry())];

        while let Some(visit) = work.pop() {
            match visit {
                Visit::Enter(block) => {
                    let pushed = rename_block(func, &mut stacks, block);
                    work.push(Visit::Leave(pushed));
                    work.extend(tree.children(block).iter().rev().map(|c| Visit::Enter(*c)));
                }
                Visit::Leave(pushed) => {
                    for addr in pushed.iter().rev() {
                        if let Some(stack) = stacks.get_mut(addr) {
                            stack.pop();
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::HeritageConfig,
        heritage::Heritage,
        ir::{Address, BlockId, CallSpec, EffectType, Function, Opcode, SpaceKind, Storage},
        Result,
    };

    fn diamond() -> (Function, [BlockId; 4], Storage) {
        let mut func = Function::new("f", 0x1000);
        let reg = func.add_space("register", SpaceKind::Register);
        let entry = func.add_block(0x1000);
        let left = func.add_block(0x1010);
        let right = func.add_block(0x1020);
        let join = func.add_block(0x1030);
        func.add_edge(entry, left);
        func.add_edge(entry, right);
        func.add_edge(left, join);
        func.add_edge(right, join);
        (func, [entry, left, right, join], Storage::new(Address::new(reg, 0), 4))
    }

    #[test]
    fn test_diamond_gets_phi_at_join() -> Result<()> {
        let (mut func, [_, left, right, join], loc) = diamond();
        let one = func.new_const(4, 1);
        let two = func.new_const(4, 2);
        let a = func.push_op(left, Opcode::Copy, 0x1010, &[one], Some(loc));
        let b = func.push_op(right, Opcode::Copy, 0x1020, &[two], Some(loc));
        let read = func.new_value_at(loc);
        let user = func.push_op(join, Opcode::Other, 0x1030, &[read], None);

        let mut heritage = Heritage::new(HeritageConfig::default());
        heritage.heritage(&mut func)?;

        let phi = func.block(join).ops()[0];
        assert_eq!(func.op(phi).opcode(), Opcode::MultiEqual);
        assert_eq!(func.op(user).input(0), func.op(phi).output());
        assert_eq!(func.op(phi).input(0), func.op(a).output());
        assert_eq!(func.op(phi).input(1), func.op(b).output());
        Ok(())
    }

    #[test]
    fn test_one_sided_write_merges_with_input() -> Result<()> {
        let (mut func, [_, left, _, join], loc) = diamond();
        let one = func.new_const(4, 1);
        let a = func.push_op(left, Opcode::Copy, 0x1010, &[one], Some(loc));
        let read = func.new_value_at(loc);
        func.push_op(join, Opcode::Other, 0x1030, &[read], None);

        let mut heritage = Heritage::new(HeritageConfig::default());
        heritage.heritage(&mut func)?;

        let phi = func.block(join).ops()[0];
        assert_eq!(func.op(phi).input(0), func.op(a).output());
        let other = func.op(phi).input(1).unwrap();
        assert!(func.value(other).is_input());
        assert_eq!(func.find_input(&loc), Some(other));
        Ok(())
    }

    #[test]
    fn test_call_reads_value_from_before_its_indirect() -> Result<()> {
        let mut func = Function::new("f", 0x1000);
        let reg = func.add_space("register", SpaceKind::Register);
        let entry = func.add_block(0x1000);
        let loc = Storage::new(Address::new(reg, 0), 4);
        let one = func.new_const(4, 1);
        let write = func.push_op(entry, Opcode::Copy, 0x1000, &[one], Some(loc));
        let target = func.new_const(8, 0x2000);
        let call = func.push_op(entry, Opcode::Call, 0x1004, &[target], None);
        func.add_call_spec(
            CallSpec::new(call)
                .with_default_effect(EffectType::Unknown)
                .with_active_inputs(vec![loc]),
        );
        let read = func.new_value_at(loc);
        let user = func.push_op(entry, Opcode::Other, 0x1008, &[read], None);

        let mut heritage = Heritage::new(HeritageConfig::default());
        heritage.heritage(&mut func)?;

        let ops = func.block(entry).ops().to_vec();
        let indirect = ops[1];
        assert_eq!(func.op(indirect).opcode(), Opcode::Indirect);
        assert_eq!(ops[2], call);
        let written = func.op(write).output();
        assert_eq!(func.op(indirect).input(0), written);
        assert_eq!(func.op(call).input(1), written);
        assert_eq!(func.op(user).input(0), func.op(indirect).output());
        Ok(())
    }
}
