//! Benchmarks for sharded save and load throughput

use bytes::Bytes;
use checkpoint_core::{Dtype, ShardedStateDict, ShardedTensor};
use checkpoint_strategies::{
    AsyncCallsQueue, AsyncSaveShardedStrategy, BincodeShardedLoadStrategy,
    BincodeShardedSaveStrategy, LoadShardedStrategy,
};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use tempfile::TempDir;

fn sharded_state(size_bytes: usize) -> ShardedStateDict {
    let elements = (size_bytes / Dtype::F32.size_bytes()) as u64;
    let mut dict = ShardedStateDict::new();
    dict.insert(
        "weight",
        ShardedTensor::new(
            "model.weight",
            Dtype::F32,
            vec![elements],
            vec![0],
            vec![elements],
            Bytes::from(vec![0u8; size_bytes]),
        ),
    );
    dict
}

fn sharded_save_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("sharded_save");

    for size in [1_000_000usize, 10_000_000, 100_000_000].iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_function(format!("{}MB", size / 1_000_000), |b| {
            b.to_async(&rt).iter(|| async {
                let temp_dir = TempDir::new().unwrap();
                let strategy = BincodeShardedSaveStrategy::new();
                let queue = AsyncCallsQueue::new();

                let state = sharded_state(*size);
                let request = strategy.async_save(&state, temp_dir.path()).await.unwrap();
                queue.schedule_async_request(request);
                queue.maybe_finalize_async_calls(true).await.unwrap();
            });
        });
    }

    group.finish();
}

fn sharded_load_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("sharded_load");

    for size in [1_000_000usize, 10_000_000, 100_000_000].iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        // Setup: write the checkpoint once.
        let temp_dir = TempDir::new().unwrap();
        let state = sharded_state(*size);
        rt.block_on(async {
            let strategy = BincodeShardedSaveStrategy::new();
            let queue = AsyncCallsQueue::new();
            let request = strategy.async_save(&state, temp_dir.path()).await.unwrap();
            queue.schedule_async_request(request);
            queue.maybe_finalize_async_calls(true).await.unwrap();
        });

        group.bench_function(format!("{}MB", size / 1_000_000), |b| {
            b.to_async(&rt).iter(|| async {
                let strategy = BincodeShardedLoadStrategy::new();
                strategy.load(&state, temp_dir.path()).await.unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, sharded_save_benchmark, sharded_load_benchmark);
criterion_main!(benches);
