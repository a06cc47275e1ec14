//! Benchmarks for index lookup and sampler planning

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use data_shard::{ChunkedSampler, GlobalIndex};
use shard_core::{SamplerConfig, Topology};

fn bench_locate(c: &mut Criterion) {
    let index = GlobalIndex::from_counts((0..10_000).map(|i| 1_000 + (i % 7)));
    let total = index.total_samples();

    c.bench_function("locate", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 7_919) % total;
            index.locate(i)
        })
    });
}

fn bench_set_epoch(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_epoch");

    for total_samples in [100_000u64, 1_000_000, 10_000_000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(total_samples),
            total_samples,
            |b, &total| {
                let config = SamplerConfig {
                    chunk_size: 1_000,
                    shuffle: true,
                    seed: 42,
                };
                let mut sampler =
                    ChunkedSampler::new(total, config, Topology::new(3, 8, 1, 4)).unwrap();
                let mut epoch = 0;
                b.iter(|| {
                    epoch += 1;
                    sampler.set_epoch(epoch);
                })
            },
        );
    }

    group.finish();
}

fn bench_drain_epoch(c: &mut Criterion) {
    c.bench_function("drain_epoch_1m_32_slots", |b| {
        let mut sampler = ChunkedSampler::new(
            1_000_000,
            SamplerConfig::default(),
            Topology::new(0, 8, 0, 4),
        )
        .unwrap();

        b.iter(|| {
            sampler.set_epoch(0);
            let mut n = 0u64;
            while let Ok(Some(_)) = sampler.next_index() {
                n += 1;
            }
            n
        })
    });
}

criterion_group!(benches, bench_locate, bench_set_epoch, bench_drain_epoch);
criterion_main!(benches);
