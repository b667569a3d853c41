use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use reporter_core::{Block, LedgerAggregator, MemoryStore, Output, Transaction};
use std::sync::Arc;

fn block_with(transactions: usize) -> Block {
    let mut block = Block::new(1, 0);
    block.miner_payouts.push(Output::to_address("10", "01miner"));
    for i in 0..transactions {
        block.transactions.push(Transaction {
            coin_inputs: vec![Output::to_address("25.5", format!("01from{}", i % 50))],
            coin_outputs: vec![
                Output::to_address("20", format!("01to{}", i % 80)),
                Output::to_address("5.4", format!("01from{}", i % 50)),
            ],
            ..Default::default()
        });
    }
    block
}

fn bench_deltas(c: &mut Criterion) {
    let mut group = c.benchmark_group("deltas");
    for size in [10, 100, 1000] {
        let block = block_with(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &block, |b, block| {
            b.iter(|| LedgerAggregator::deltas(black_box(block)).unwrap())
        });
    }
    group.finish();
}

fn bench_apply(c: &mut Criterion) {
    let block = block_with(100);
    let ledger = LedgerAggregator::new(Arc::new(MemoryStore::new()));
    c.bench_function("apply_block_100", |b| {
        b.iter(|| ledger.apply_block(black_box(&block)).unwrap())
    });
}

criterion_group!(benches, bench_deltas, bench_apply);
criterion_main!(benches);
