//! Heritage integration tests.
//!
//! These tests build small functions through the public mutation API, run the heritage
//! pipeline and check the linked data flow:
//! 1. Hand-written scenarios (reassignment, diamond, call effects)
//! 2. Refinement of a range accessed only in pieces, checked by evaluating the rebuilt value
//! 3. Phi placement against a brute-force iterated dominance frontier on generated graphs
//! 4. SSA soundness of every linked read on the same graphs

use heritage::{
    ir::{
        Address, BlockId, CallSpec, EffectType, Function, OpId, Opcode, SpaceId, SpaceKind,
        Storage, ValueId,
    },
    Heritage, HeritageConfig, Result,
};

/// Evaluates a value built only from constants, COPY, SUBPIECE and PIECE.
fn eval(func: &Function, value: ValueId) -> Option<u64> {
    let v = func.value(value);
    if let Some(c) = v.constant() {
        return Some(c);
    }
    let mask = |size: u32| {
        if size >= 8 {
            u64::MAX
        } else {
            (1u64 << (size * 8)) - 1
        }
    };
    let op = func.op(v.def()?);
    match op.opcode() {
        Opcode::Copy => eval(func, op.input(0)?),
        Opcode::SubPiece => {
            let whole = eval(func, op.input(0)?)?;
            let shift = func.value(op.input(1)?).constant()? * 8;
            Some((whole >> shift) & mask(v.size()))
        }
        Opcode::Piece => {
            let low = op.input(1)?;
            let high = eval(func, op.input(0)?)?;
            Some((high << (func.value(low).size() * 8)) | eval(func, low)?)
        }
        _ => None,
    }
}

fn heritage_all(func: &mut Function) -> Result<Heritage> {
    let mut heritage = Heritage::new(HeritageConfig::default());
    heritage.run(func)?;
    Ok(heritage)
}

#[test]
fn test_reassigned_stack_slot_read_sees_first_write() -> Result<()> {
    let mut func = Function::new("reassign", 0x1000);
    let ram = func.ram_space();
    let stack = func.add_stack_space("stack", ram);
    let b1 = func.add_block(0x1000);
    let b2 = func.add_block(0x1010);
    func.add_edge(b1, b2);
    let slot = Storage::new(Address::new(stack, 0xfff0), 4);

    let one = func.new_const(4, 1);
    let two = func.new_const(4, 2);
    let first = func.push_op(b1, Opcode::Copy, 0x1000, &[one], Some(slot));
    let read1 = func.new_value_at(slot);
    let use1 = func.push_op(b1, Opcode::Other, 0x1004, &[read1], None);
    let second = func.push_op(b2, Opcode::Copy, 0x1010, &[two], Some(slot));
    let read2 = func.new_value_at(slot);
    let use2 = func.push_op(b2, Opcode::Other, 0x1014, &[read2], None);

    let heritage = heritage_all(&mut func)?;

    assert_eq!(func.op(use1).input(0), func.op(first).output());
    assert_eq!(func.op(use2).input(0), func.op(second).output());
    assert_eq!(heritage.num_heritage_passes(stack), 1);
    Ok(())
}

#[test]
fn test_topmost_stack_local_links_partial_reads() -> Result<()> {
    let mut func = Function::new("locals", 0x1000);
    let ram = func.ram_space();
    let stack = func.add_stack_space("stack", ram);
    let entry = func.add_block(0x1000);
    let at = |offset: i64, size: u32| Storage::new(Address::new(stack, offset as u64), size);

    let value = func.new_const(8, 0x1122_3344_5566_7788);
    func.push_op(entry, Opcode::Copy, 0x1000, &[value], Some(at(-8, 8)));
    let top = func.new_value_at(at(-1, 1));
    let low = func.new_value_at(at(-8, 4));
    let above = func.new_value_at(at(0, 4));
    let user = func.push_op(entry, Opcode::Other, 0x1004, &[top, low, above], None);

    heritage_all(&mut func)?;

    let op = func.op(user);
    let (top, low, above) = (op.input(0).unwrap(), op.input(1).unwrap(), op.input(2).unwrap());
    assert_eq!(eval(&func, top), Some(0x11));
    assert_eq!(eval(&func, low), Some(0x5566_7788));
    assert!(func.value(above).is_input());
    Ok(())
}

#[test]
fn test_diamond_join_reads_phi() -> Result<()> {
    let mut func = Function::new("diamond", 0x1000);
    let reg = func.add_space("register", SpaceKind::Register);
    let entry = func.add_block(0x1000);
    let then = func.add_block(0x1010);
    let other = func.add_block(0x1020);
    let join = func.add_block(0x1030);
    func.add_edge(entry, then);
    func.add_edge(entry, other);
    func.add_edge(then, join);
    func.add_edge(other, join);
    let eax = Storage::new(Address::new(reg, 0), 4);

    let one = func.new_const(4, 1);
    let two = func.new_const(4, 2);
    let a = func.push_op(then, Opcode::Copy, 0x1010, &[one], Some(eax));
    let b = func.push_op(other, Opcode::Copy, 0x1020, &[two], Some(eax));
    let read = func.new_value_at(eax);
    let user = func.push_op(join, Opcode::Return, 0x1030, &[read], None);

    heritage_all(&mut func)?;

    let phis: Vec<_> = func
        .block(join)
        .ops()
        .iter()
        .copied()
        .filter(|op| func.op(*op).opcode() == Opcode::MultiEqual)
        .collect();
    assert_eq!(phis.len(), 1);
    let phi = func.op(phis[0]);
    assert_eq!(phi.num_inputs(), 2);
    assert_eq!(phi.input(0), func.op(a).output());
    assert_eq!(phi.input(1), func.op(b).output());
    assert_eq!(func.op(user).input(0), phi.output());
    Ok(())
}

#[test]
fn test_unknown_call_clobbers_register() -> Result<()> {
    let mut func = Function::new("call", 0x1000);
    let reg = func.add_space("register", SpaceKind::Register);
    let entry = func.add_block(0x1000);
    let ecx = Storage::new(Address::new(reg, 4), 4);

    let one = func.new_const(4, 1);
    let before = func.push_op(entry, Opcode::Copy, 0x1000, &[one], Some(ecx));
    let target = func.new_const(8, 0x4000);
    let call = func.push_op(entry, Opcode::Call, 0x1004, &[target], None);
    func.add_call_spec(CallSpec::new(call).with_default_effect(EffectType::Unknown));
    let read = func.new_value_at(ecx);
    let user = func.push_op(entry, Opcode::Other, 0x1008, &[read], None);

    heritage_all(&mut func)?;

    let seen = func.op(user).input(0).unwrap();
    assert_ne!(Some(seen), func.op(before).output());
    let def = func.value(seen).def().unwrap();
    assert_eq!(func.op(def).opcode(), Opcode::Indirect);
    assert_eq!(func.indirect_target(def), Some(call));
    assert_eq!(func.op(def).input(0), func.op(before).output());
    Ok(())
}

#[test]
fn test_killed_register_is_created_by_call() -> Result<()> {
    let mut func = Function::new("killed", 0x1000);
    let reg = func.add_space("register", SpaceKind::Register);
    let entry = func.add_block(0x1000);
    let edx = Storage::new(Address::new(reg, 8), 4);

    let target = func.new_const(8, 0x4000);
    let call = func.push_op(entry, Opcode::Call, 0x1000, &[target], None);
    func.add_call_spec(CallSpec::new(call).with_effect(edx, EffectType::KilledByCall));
    let read = func.new_value_at(edx);
    let user = func.push_op(entry, Opcode::Other, 0x1004, &[read], None);

    heritage_all(&mut func)?;

    let seen = func.op(user).input(0).unwrap();
    let def = func.value(seen).def().unwrap();
    assert_eq!(func.op(def).opcode(), Opcode::Indirect);
    assert!(func.find_input(&edx).is_none());
    Ok(())
}

#[test]
fn test_refinement_round_trip() -> Result<()> {
    let mut func = Function::new("refine", 0x1000);
    let reg = func.add_space("register", SpaceKind::Register);
    let entry = func.add_block(0x1000);
    let at = |offset, size| Storage::new(Address::new(reg, offset), size);

    let lo = func.new_const(4, 0x1122_3344);
    let hi = func.new_const(4, 0x5566_7788);
    func.push_op(entry, Opcode::Copy, 0x1000, &[lo], Some(at(0, 4)));
    func.push_op(entry, Opcode::Copy, 0x1004, &[hi], Some(at(4, 4)));
    let read = func.new_value_at(at(2, 4));
    let user = func.push_op(entry, Opcode::Other, 0x1008, &[read], None);

    heritage_all(&mut func)?;

    // Bytes 2..6 of 0x55667788_11223344, little-endian.
    let rebuilt = func.op(user).input(0).unwrap();
    assert_eq!(eval(&func, rebuilt), Some(0x7788_1122));

    let partitions = [at(0, 2), at(2, 2), at(4, 2), at(6, 2)];
    for id in func.values_in(reg) {
        let v = func.value(id);
        if v.is_written() || !v.has_no_descend() {
            assert!(partitions.contains(&v.storage()), "{} is not a partition", v.storage());
        }
    }
    Ok(())
}

/// Small deterministic generator for graph shapes.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

struct Generated {
    func: Function,
    edges: Vec<(usize, usize)>,
    writers: Vec<usize>,
    loc: Storage,
}

/// A chain of `n` blocks with extra forward and backward edges, writes to one register in
/// some blocks and a read of it at the end.
fn generate(seed: u64, n: usize) -> Generated {
    let mut rng = XorShift(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1);
    let mut func = Function::new(format!("gen{seed}"), 0x1000);
    let reg = func.add_space("register", SpaceKind::Register);
    let loc = Storage::new(Address::new(reg, 0), 4);
    let blocks: Vec<BlockId> = (0..n)
        .map(|i| func.add_block(0x1000 + 0x100 * i as u64))
        .collect();

    let mut edges: Vec<(usize, usize)> = (0..n - 1).map(|i| (i, i + 1)).collect();
    for _ in 0..n {
        let (a, b) = (rng.below(n), 1 + rng.below(n - 1));
        if a != b && !edges.contains(&(a, b)) {
            edges.push((a, b));
        }
    }
    for &(a, b) in &edges {
        func.add_edge(blocks[a], blocks[b]);
    }

    let mut writers = Vec::new();
    for (i, &block) in blocks.iter().enumerate() {
        if rng.below(3) == 0 || (i == n - 2 && writers.is_empty()) {
            let c = func.new_const(4, i as u64);
            func.push_op(block, Opcode::Copy, func.block(block).start(), &[c], Some(loc));
            writers.push(i);
        }
        if rng.below(2) == 0 {
            let read = func.new_value_at(loc);
            func.push_op(block, Opcode::Other, func.block(block).start() + 8, &[read], None);
        }
    }
    let read = func.new_value_at(loc);
    let last = blocks[n - 1];
    func.push_op(last, Opcode::Other, func.block(last).start() + 0x10, &[read], None);

    Generated {
        func,
        edges,
        writers,
        loc,
    }
}

/// Dominator sets as bit masks, by the textbook fixed point.
fn brute_dominators(n: usize, edges: &[(usize, usize)]) -> Vec<u64> {
    let all = (1u64 << n) - 1;
    let mut dom = vec![all; n];
    dom[0] = 1;
    let mut changed = true;
    while changed {
        changed = false;
        for b in 1..n {
            let meet = edges
                .iter()
                .filter(|(_, to)| *to == b)
                .fold(all, |acc, (from, _)| acc & dom[*from]);
            let next = meet | (1 << b);
            if next != dom[b] {
                dom[b] = next;
                changed = true;
            }
        }
    }
    dom
}

fn brute_idf(n: usize, edges: &[(usize, usize)], writers: &[usize]) -> Vec<usize> {
    let dom = brute_dominators(n, edges);
    let frontier = |x: usize| -> u64 {
        edges
            .iter()
            .filter(|(p, y)| dom[*p] & (1 << x) != 0 && (x == *y || dom[*y] & (1 << x) == 0))
            .fold(0, |acc, (_, y)| acc | (1 << y))
    };
    let seed = writers.iter().fold(0u64, |acc, w| acc | (1 << w));
    let mut idf = 0u64;
    loop {
        let set = seed | idf;
        let next = (0..n)
            .filter(|x| set & (1 << x) != 0)
            .fold(0, |acc, x| acc | frontier(x));
        if next == idf {
            break;
        }
        idf = next;
    }
    (0..n).filter(|b| idf & (1 << b) != 0).collect()
}

fn phi_blocks(func: &Function, loc: &Storage) -> Vec<usize> {
    (0..func.num_blocks())
        .filter(|&b| {
            func.block(BlockId::new(b)).ops().iter().any(|op| {
                let op = func.op(*op);
                op.opcode() == Opcode::MultiEqual
                    && op.output().is_some_and(|out| func.value(out).storage() == *loc)
            })
        })
        .collect()
}

#[test]
fn test_phi_placement_matches_brute_force_idf() -> Result<()> {
    for seed in 1..=40 {
        let n = 4 + (seed as usize % 6);
        let mut g = generate(seed, n);
        heritage_all(&mut g.func)?;

        assert_eq!(
            phi_blocks(&g.func, &g.loc),
            brute_idf(n, &g.edges, &g.writers),
            "seed {seed}, edges {:?}, writers {:?}",
            g.edges,
            g.writers
        );
    }
    Ok(())
}

/// True if the definition of `value` reaches the point before `before` in `block`, or the
/// end of `block` when `before` is `None`.
fn def_dominates(
    func: &Function,
    dom: &[u64],
    value: ValueId,
    block: usize,
    before: Option<OpId>,
) -> bool {
    let v = func.value(value);
    if v.is_input() {
        return true;
    }
    let Some(def) = v.def() else {
        return false;
    };
    let Some(def_block) = func.parent(def) else {
        return false;
    };
    let d = def_block.index();
    if d == block {
        return before.is_none_or(|reader| func.before_in_block(def, reader));
    }
    dom[block] & (1 << d) != 0
}

#[test]
fn test_every_read_has_dominating_definition() -> Result<()> {
    for seed in 100..140 {
        let n = 3 + (seed as usize % 7);
        let mut g = generate(seed, n);
        heritage_all(&mut g.func)?;
        let dom = brute_dominators(n, &g.edges);
        let func = &g.func;

        for b in 0..n {
            let block = func.block(BlockId::new(b));
            for &op in block.ops() {
                let o = func.op(op);
                for (slot, &input) in o.inputs().iter().enumerate() {
                    if func.value(input).storage() != g.loc {
                        continue;
                    }
                    assert!(!func.value(input).is_free(), "seed {seed}: {op} reads a free value");
                    let ok = if o.opcode() == Opcode::MultiEqual {
                        let pred = block.ins()[slot].point.index();
                        def_dominates(func, &dom, input, pred, None)
                    } else {
                        def_dominates(func, &dom, input, b, Some(op))
                    };
                    assert!(ok, "seed {seed}: definition of {input} does not reach {op}");
                }
            }
        }
    }
    Ok(())
}

#[test]
fn test_space_delay_postpones_linking() -> Result<()> {
    let mut func = Function::new("delay", 0x1000);
    let ram = func.ram_space();
    let stack: SpaceId = func.add_stack_space("stack", ram);
    let entry = func.add_block(0x1000);
    let slot = Storage::new(Address::new(stack, 0x10), 4);
    let one = func.new_const(4, 1);
    let write = func.push_op(entry, Opcode::Copy, 0x1000, &[one], Some(slot));
    let read = func.new_value_at(slot);
    let user = func.push_op(entry, Opcode::Other, 0x1004, &[read], None);

    let mut heritage = Heritage::new(HeritageConfig::default());
    heritage.heritage(&mut func)?;
    assert_eq!(func.op(user).input(0), Some(read));
    assert_eq!(heritage.num_heritage_passes(stack), 0);

    heritage.heritage(&mut func)?;
    assert_eq!(func.op(user).input(0), func.op(write).output());
    assert_eq!(heritage.heritage_pass(slot.addr), Some(1));
    Ok(())
}
