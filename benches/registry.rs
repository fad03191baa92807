//! Buffer manager hot-path benchmarks.

use bufmgr::coherency::{CoherencyStore, ShmStore, SoftwarePolicy};
use bufmgr::kernel::SoftGem;
use bufmgr::prelude::*;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::sync::Arc;

fn software_manager() -> BufferManager {
    let store = Arc::new(ShmStore::anonymous(4096).unwrap());
    let policy = SoftwarePolicy::new(store).unwrap();
    BufferManager::new(Arc::new(SoftGem::new()), Box::new(policy))
}

fn bench_import_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("import_hit");

    for live in [1usize, 64, 1024] {
        let manager = software_manager();
        let objects: Vec<_> = (0..live)
            .map(|_| manager.allocate(4096, 0).unwrap())
            .collect();
        let name = objects[live / 2].name();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(live), &name, |b, &name| {
            b.iter(|| {
                let bo = manager.import(name).unwrap();
                manager.free(&bo).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_map_session(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_session");
    group.throughput(Throughput::Elements(1));

    let manager = software_manager();
    let bo = manager.allocate(64 * 1024, 0).unwrap();
    group.bench_function("cpu_read", |b| {
        b.iter(|| {
            let handle = manager.map(&bo, Device::Cpu, Access::Read).unwrap();
            std::hint::black_box(handle);
            manager.unmap(&bo).unwrap();
        });
    });

    group.bench_function("cpu_write_gpu_read", |b| {
        b.iter(|| {
            manager.map(&bo, Device::Cpu, Access::Write).unwrap();
            manager.unmap(&bo).unwrap();
            manager.map(&bo, Device::ThreeD, Access::Read).unwrap();
            manager.unmap(&bo).unwrap();
        });
    });

    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("coherency_store");
    group.throughput(Throughput::Elements(1));

    let store = ShmStore::anonymous(4096).unwrap();
    for key in 1..=2048 {
        store.register(key).unwrap();
    }
    group.bench_function("get_set", |b| {
        let mut key = 1u32;
        b.iter(|| {
            let word = store.get(key).unwrap();
            store.set(key, word.wrapping_add(1)).unwrap();
            key = key % 2048 + 1;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_import_hit, bench_map_session, bench_store);
criterion_main!(benches);
