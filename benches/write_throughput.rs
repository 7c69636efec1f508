//! Write-path throughput against the in-memory repository

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shardpump::shard::policy;
use shardpump::{ContentValue, DocumentUri, IterSource, MemoryRepository, PolicyKind, Record, ShardedWriter, TaskRunner, WriterConfig};

const DOCUMENTS: usize = 2_000;

fn workload(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            (
                DocumentUri::new(format!("/bench/doc-{}.json", i)),
                ContentValue::Text(format!("{{\"id\":{}}}", i)),
            )
        })
        .collect()
}

fn write_all(config: &WriterConfig, shards: usize, records: &[Record]) {
    let repo = MemoryRepository::with_shards(shards);
    let list = repo.shard_list().unwrap();
    let policy = policy::build(config.policy, &list);
    let mut writer = ShardedWriter::new(config, Arc::new(repo), list, policy).unwrap();

    for (uri, value) in records {
        writer.write(uri.clone(), value.clone()).unwrap();
    }
    writer.close().unwrap();
}

fn bench_batch_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("Writer/BatchSize");
    group.throughput(Throughput::Elements(DOCUMENTS as u64));
    let records = workload(DOCUMENTS);

    for batch in [1usize, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::new("legacy_4_shards", batch), batch, |b, &batch| {
            let config = WriterConfig::new().with_batch_size(batch);
            b.iter(|| write_all(black_box(&config), 4, &records))
        });
    }

    group.finish();
}

fn bench_policies(c: &mut Criterion) {
    let mut group = c.benchmark_group("Writer/Policy");
    group.throughput(Throughput::Elements(DOCUMENTS as u64));
    let records = workload(DOCUMENTS);

    for kind in [PolicyKind::Legacy, PolicyKind::Bucket, PolicyKind::Statistical] {
        group.bench_with_input(BenchmarkId::new("batch_50", kind.name()), &kind, |b, &kind| {
            let config = WriterConfig::new().with_batch_size(50).with_policy(kind);
            b.iter(|| write_all(black_box(&config), 8, &records))
        });
    }

    group.finish();
}

fn bench_threaded_task(c: &mut Criterion) {
    let mut group = c.benchmark_group("Task/Threads");
    group.throughput(Throughput::Elements(DOCUMENTS as u64));

    for threads in [1usize, 2, 4].iter() {
        group.bench_with_input(BenchmarkId::new("batch_50", threads), threads, |b, &threads| {
            let config = WriterConfig::new().with_batch_size(50).with_threads(threads);
            b.iter(|| {
                let repo = MemoryRepository::with_shards(4);
                let list = repo.shard_list().unwrap();
                let policy = policy::build(config.policy, &list);
                let task = TaskRunner::new(config.clone(), Arc::new(repo), list, policy);
                task.run(&mut IterSource::new(workload(DOCUMENTS))).unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_batch_sizes, bench_policies, bench_threaded_task);
criterion_main!(benches);
