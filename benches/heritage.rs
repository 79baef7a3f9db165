#![allow(unused)]
extern crate heritage;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use heritage::{
    ir::{Address, BlockId, Function, Opcode, SpaceKind, Storage},
    Heritage, HeritageConfig, Merge,
};
use std::hint::black_box;

/// A chain of `count` if/else diamonds, each arm writing every register, with a loop back
/// edge around the whole chain.
fn diamond_chain(count: usize, registers: u64) -> Function {
    let mut func = Function::new("bench", 0x1000);
    let reg = func.add_space("register", SpaceKind::Register);
    let locs: Vec<Storage> = (0..registers)
        .map(|i| Storage::new(Address::new(reg, i * 4), 4))
        .collect();

    let entry = func.add_block(0x1000);
    let mut top = entry;
    let mut pc = 0x1000u64;
    for _ in 0..count {
        let left = func.add_block(pc + 0x10);
        let right = func.add_block(pc + 0x20);
        let join = func.add_block(pc + 0x30);
        func.add_edge(top, left);
        func.add_edge(top, right);
        func.add_edge(left, join);
        func.add_edge(right, join);
        for (arm, block) in [left, right].into_iter().enumerate() {
            for loc in &locs {
                let read = func.new_value_at(*loc);
                let c = func.new_const(4, arm as u64 + 1);
                func.push_op(block, Opcode::IntAdd, pc, &[read, c], Some(*loc));
            }
        }
        top = join;
        pc += 0x40;
    }
    func.add_edge(top, BlockId::new(1));
    let reads: Vec<_> = locs.iter().map(|l| func.new_value_at(*l)).collect();
    func.push_op(top, Opcode::Other, pc, &reads, None);
    func
}

fn bench_heritage(c: &mut Criterion) {
    let mut group = c.benchmark_group("heritage");
    for count in [8usize, 32, 128] {
        let func = diamond_chain(count, 4);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &func, |b, func| {
            b.iter(|| {
                let mut func = func.clone();
                let mut heritage = Heritage::new(HeritageConfig::default());
                heritage.run(&mut func).unwrap();
                black_box(func)
            });
        });
    }
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    for count in [8usize, 32, 128] {
        let mut func = diamond_chain(count, 4);
        Heritage::new(HeritageConfig::default())
            .run(&mut func)
            .unwrap();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &func, |b, func| {
            b.iter(|| {
                let mut func = func.clone();
                let mut merge = Merge::new(HeritageConfig::default());
                merge.run(&mut func).unwrap();
                black_box(func)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_heritage, bench_merge);
criterion_main!(benches);
