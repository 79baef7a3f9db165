//! Merge engine integration tests.
//!
//! Functions are either built directly in SSA form (to pin down a specific live-range shape)
//! or produced by running heritage first. Every test ends by checking that no two members of
//! a logical variable interfere.

use heritage::{
    cover::Intersection,
    ir::{Address, BlockId, Function, OpFlags, OpId, Opcode, SpaceKind, Storage, ValueFlags},
    merge::copy_shadow,
    Error, EventKind, Heritage, HeritageConfig, Merge, Result,
};

/// Asserts the merge soundness property directly, independent of
/// [`Merge::verify_high_covers`].
fn assert_sound(func: &Function) {
    for (id, high) in func.highs() {
        let members = high.instances();
        for (i, &a) in members.iter().enumerate() {
            for &b in &members[i + 1..] {
                let (Some(ca), Some(cb)) = (func.value(a).cover(), func.value(b).cover()) else {
                    continue;
                };
                assert!(
                    ca.intersect(cb) != Intersection::Overlap || copy_shadow(func, a, b),
                    "{id}: {a} and {b} interfere"
                );
            }
        }
    }
}

struct Loop {
    func: Function,
    phi: OpId,
    add: OpId,
}

/// `x1 = phi(x0, x2)` in a self-looping header where `x1` is still read after `x2 = x1 + 1`
/// is defined.
fn overlapping_loop() -> Loop {
    let mut func = Function::new("loop", 0x1000);
    let reg = func.add_space("register", SpaceKind::Register);
    let r0 = Storage::new(Address::new(reg, 0), 4);
    let entry = func.add_block(0x1000);
    let header = func.add_block(0x1010);
    let exit = func.add_block(0x1020);
    func.add_edge(entry, header);
    func.add_edge(header, header);
    func.add_edge(header, exit);

    let zero = func.new_const(4, 0);
    let one = func.new_const(4, 1);
    let init = func.push_op(entry, Opcode::Copy, 0x1000, &[zero], Some(r0));
    let x0 = func.op(init).output().unwrap();
    let phi = func.push_op(header, Opcode::MultiEqual, 0x1010, &[x0, x0], Some(r0));
    let x1 = func.op(phi).output().unwrap();
    let add = func.push_op(header, Opcode::IntAdd, 0x1010, &[x1, one], Some(r0));
    let x2 = func.op(add).output().unwrap();
    func.push_op(header, Opcode::Other, 0x1014, &[x1], None);
    func.set_input(phi, x2, 1);
    func.push_op(exit, Opcode::Return, 0x1020, &[x2], None);

    Loop { func, phi, add }
}

#[test]
fn test_forced_split_on_back_edge() -> Result<()> {
    let Loop { mut func, phi, add } = overlapping_loop();

    let mut merge = Merge::new(HeritageConfig::default());
    merge.run(&mut func)?;

    let p = func.op(phi);
    let out = p.output().unwrap();
    let hout = func.value(out).high();
    for &input in p.inputs() {
        assert_eq!(func.value(input).high(), hout);
        let copy = func.value(input).def().unwrap();
        assert!(func.op(copy).flags().contains(OpFlags::TRIM_COPY));
    }
    let x2 = func.op(add).output().unwrap();
    assert_ne!(func.value(x2).high(), hout);
    assert_eq!(merge.copy_trims().len(), 2);
    assert!(func.warnings().has(EventKind::ForcedSplit));

    merge.verify_high_covers(&func)?;
    assert_sound(&func);
    Ok(())
}

#[test]
fn test_second_run_changes_nothing() -> Result<()> {
    let Loop { mut func, .. } = overlapping_loop();
    Merge::new(HeritageConfig::default()).run(&mut func)?;
    let highs = func.highs().count();
    let ops = func.ops().count();

    let mut again = Merge::new(HeritageConfig::default());
    again.run(&mut func)?;

    assert!(again.copy_trims().is_empty());
    assert_eq!(func.highs().count(), highs);
    assert_eq!(func.ops().count(), ops);
    again.verify_high_covers(&func)?;
    Ok(())
}

#[test]
fn test_diamond_phi_merges_without_trims() -> Result<()> {
    let mut func = Function::new("diamond", 0x1000);
    let reg = func.add_space("register", SpaceKind::Register);
    let eax = Storage::new(Address::new(reg, 0), 4);
    let entry = func.add_block(0x1000);
    let left = func.add_block(0x1010);
    let right = func.add_block(0x1020);
    let join = func.add_block(0x1030);
    func.add_edge(entry, left);
    func.add_edge(entry, right);
    func.add_edge(left, join);
    func.add_edge(right, join);
    let one = func.new_const(4, 1);
    let two = func.new_const(4, 2);
    let a = func.push_op(left, Opcode::Copy, 0x1010, &[one], Some(eax));
    let b = func.push_op(right, Opcode::Copy, 0x1020, &[two], Some(eax));
    let read = func.new_value_at(eax);
    let ret = func.push_op(join, Opcode::Return, 0x1030, &[read], None);

    let config = HeritageConfig::default();
    Heritage::new(config.clone()).run(&mut func)?;
    let mut merge = Merge::new(config);
    merge.run(&mut func)?;

    let va = func.op(a).output().unwrap();
    let vb = func.op(b).output().unwrap();
    let joined = func.op(ret).input(0).unwrap();
    assert_eq!(func.value(va).high(), func.value(vb).high());
    assert_eq!(func.value(va).high(), func.value(joined).high());
    assert!(merge.copy_trims().is_empty());
    assert!(!func.warnings().has(EventKind::ForcedSplit));
    Ok(())
}

/// An address-forced INDIRECT at a call whose input stays live across the call.
fn forced_indirect(annotate: bool) -> (Function, OpId) {
    let mut func = Function::new("forced", 0x1000);
    let reg = func.add_space("register", SpaceKind::Register);
    let r0 = Storage::new(Address::new(reg, 0), 4);
    let entry = func.add_block(0x1000);

    let one = func.new_const(4, 1);
    let init = func.push_op(entry, Opcode::Copy, 0x1000, &[one], Some(r0));
    let x0 = func.op(init).output().unwrap();
    let target = func.new_const(8, 0x4000);
    let call = func.push_op(entry, Opcode::Call, 0x1004, &[target], None);

    let ind = func.new_op(Opcode::Indirect, 0x1004);
    let annotation = if annotate {
        func.new_iop(call)
    } else {
        func.new_const(8, 0)
    };
    let x1 = func.new_value_at(r0);
    func.set_output(ind, x1);
    func.set_input(ind, x0, 0);
    func.set_input(ind, annotation, 1);
    func.set_value_flags(x1, ValueFlags::ADDRFORCE);
    func.insert_before(ind, call).unwrap();

    func.push_op(entry, Opcode::Other, 0x1008, &[x0], None);
    func.push_op(entry, Opcode::Other, 0x100c, &[x1], None);
    (func, ind)
}

#[test]
fn test_address_forced_indirect_is_snipped() -> Result<()> {
    let (mut func, ind) = forced_indirect(true);

    let mut merge = Merge::new(HeritageConfig::default().with_speculative_merges(false));
    merge.run(&mut func)?;

    let input = func.op(ind).input(0).unwrap();
    let snip = func.value(input).def().unwrap();
    assert_eq!(func.op(snip).opcode(), Opcode::Copy);
    assert!(func.op(snip).flags().contains(OpFlags::TRIM_COPY));
    let out = func.op(ind).output().unwrap();
    assert_eq!(func.value(input).high(), func.value(out).high());
    let x0 = func.op(snip).input(0).unwrap();
    assert_ne!(func.value(x0).high(), func.value(out).high());
    assert_sound(&func);
    Ok(())
}

#[test]
fn test_indirect_without_paired_op_is_fatal() {
    let (mut func, _) = forced_indirect(false);

    let result = Merge::new(HeritageConfig::default()).run(&mut func);

    assert!(matches!(result, Err(Error::Fatal { .. })));
}

#[test]
fn test_speculative_merges_can_be_disabled() -> Result<()> {
    let mut func = Function::new("copies", 0x1000);
    let reg = func.add_space("register", SpaceKind::Register);
    let entry = func.add_block(0x1000);
    let one = func.new_const(4, 1);
    let a = func.push_op(
        entry,
        Opcode::IntAdd,
        0x1000,
        &[one, one],
        Some(Storage::new(Address::new(reg, 0), 4)),
    );
    let va = func.op(a).output().unwrap();
    let c = func.push_op(
        entry,
        Opcode::Copy,
        0x1004,
        &[va],
        Some(Storage::new(Address::new(reg, 4), 4)),
    );
    let vc = func.op(c).output().unwrap();
    func.push_op(entry, Opcode::Return, 0x1008, &[vc], None);

    let mut strict = func.clone();
    Merge::new(HeritageConfig::default().with_speculative_merges(false)).run(&mut strict)?;
    assert_ne!(strict.value(va).high(), strict.value(vc).high());

    Merge::new(HeritageConfig::default()).run(&mut func)?;
    assert_eq!(func.value(va).high(), func.value(vc).high());
    Ok(())
}

/// Small deterministic generator for graph shapes.
struct XorShift(u64);

impl XorShift {
    fn below(&mut self, n: usize) -> usize {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 % n as u64) as usize
    }
}

/// Chain of blocks with random extra edges; two registers written and read at random.
fn generate(seed: u64, n: usize) -> Function {
    let mut rng = XorShift(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1);
    let mut func = Function::new(format!("gen{seed}"), 0x1000);
    let reg = func.add_space("register", SpaceKind::Register);
    let locs = [
        Storage::new(Address::new(reg, 0), 4),
        Storage::new(Address::new(reg, 4), 4),
    ];
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

    for &block in &blocks {
        let mut pc = func.block(block).start();
        for _ in 0..3 {
            let src = locs[rng.below(2)];
            let dst = locs[rng.below(2)];
            let read = func.new_value_at(src);
            let one = func.new_const(4, 1);
            let opcode = if rng.below(2) == 0 {
                Opcode::Copy
            } else {
                Opcode::IntAdd
            };
            let inputs = if opcode == Opcode::Copy {
                vec![read]
            } else {
                vec![read, one]
            };
            func.push_op(block, opcode, pc, &inputs, Some(dst));
            pc += 4;
        }
    }
    let last = blocks[n - 1];
    let reads: Vec<_> = locs.iter().map(|l| func.new_value_at(*l)).collect();
    func.push_op(last, Opcode::Other, 0x9000, &reads, None);
    func
}

#[test]
fn test_merged_variables_never_interfere() -> Result<()> {
    for seed in 1..=30 {
        let mut func = generate(seed, 3 + seed as usize % 6);
        let config = HeritageConfig::default();
        Heritage::new(config.clone()).run(&mut func)?;
        let mut merge = Merge::new(config);
        merge.run(&mut func)?;

        assert_sound(&func);
        for op in func.ops_with(Opcode::MultiEqual) {
            let phi = func.op(op);
            let out = phi.output().unwrap();
            for &input in phi.inputs() {
                assert_eq!(
                    func.value(input).high(),
                    func.value(out).high(),
                    "seed {seed}: {op} not merged"
                );
            }
        }
    }
    Ok(())
}
