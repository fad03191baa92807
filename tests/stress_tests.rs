//! Concurrency stress tests for the buffer manager.

use bufmgr::coherency::{CoherencyStore, GLOBAL_KEY, ShmStore, SoftwarePolicy};
use bufmgr::kernel::SoftGem;
use bufmgr::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 8;
const ROUNDS: usize = 200;

fn software_manager() -> (Arc<SoftGem>, Arc<ShmStore>, Arc<BufferManager>) {
    let gem = Arc::new(SoftGem::new());
    let store = Arc::new(ShmStore::anonymous(1024).unwrap());
    let policy = SoftwarePolicy::new(store.clone()).unwrap();
    let manager = Arc::new(BufferManager::new(gem.clone(), Box::new(policy)));
    (gem, store, manager)
}

/// Many threads importing, mapping and freeing one shared buffer.
#[test]
fn test_concurrent_import_map_free() {
    let (gem, store, manager) = software_manager();
    let base = manager.allocate(64 * 1024, 0).unwrap();
    let name = manager.export(&base).unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let manager = manager.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for round in 0..ROUNDS {
                    let bo = manager.import(name).unwrap();
                    let device = if (i + round) % 2 == 0 {
                        Device::Cpu
                    } else {
                        Device::ThreeD
                    };
                    let access = if round % 3 == 0 {
                        Access::Write
                    } else {
                        Access::Read
                    };
                    manager.map(&bo, device, access).unwrap();
                    manager.unmap(&bo).unwrap();
                    manager.free(&bo).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    // Only the base reference is left, on a single kernel handle.
    assert_eq!(manager.refcount(&base).unwrap(), 1);
    assert_eq!(manager.live_objects(), 1);
    assert_eq!(gem.stats().opens, 0);
    assert_eq!(gem.stats().live_handles, 1);
    assert_eq!(base.map_count(), 0);
    assert_eq!(store.refs(name.get()).unwrap(), 1);

    manager.free(&base).unwrap();
    assert_eq!(gem.stats().live_handles, 0);
    assert_eq!(store.refs(name.get()).unwrap(), 0);
}

/// Threads allocating and freeing private buffers.
#[test]
fn test_concurrent_allocate_free() {
    let (gem, store, manager) = software_manager();
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let manager = manager.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for round in 0..ROUNDS {
                    let size = 4096 * (1 + (i + round) % 4);
                    let bo = manager.allocate(size, 0).unwrap();
                    assert_eq!(manager.size(&bo).unwrap(), size);
                    manager.map(&bo, Device::Cpu, Access::Write).unwrap();
                    manager.unmap(&bo).unwrap();
                    manager.free(&bo).unwrap();
                    assert!(bo.is_freed());
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let stats = gem.stats();
    assert_eq!(stats.creates, (THREADS * ROUNDS) as u64);
    assert_eq!(stats.live_objects, 0);
    assert_eq!(stats.live_handles, 0);
    assert_eq!(manager.live_objects(), 0);
    // Only the global generation remains registered.
    assert_eq!(store.len(), 1);
    assert_eq!(store.refs(GLOBAL_KEY).unwrap(), 1);
}

/// Two managers on one device and store, trading one buffer back and forth.
#[test]
fn test_two_managers_share_state() {
    let gem = Arc::new(SoftGem::new());
    let store = Arc::new(ShmStore::anonymous(256).unwrap());
    let producer = Arc::new(BufferManager::new(
        gem.clone(),
        Box::new(SoftwarePolicy::new(store.clone()).unwrap()),
    ));
    let consumer = Arc::new(BufferManager::new(
        gem.clone(),
        Box::new(SoftwarePolicy::new(store.clone()).unwrap()),
    ));

    let bo = producer.allocate(4096, 0).unwrap();
    let name = producer.export(&bo).unwrap();
    let peer = consumer.import(name).unwrap();

    let writer = {
        let producer = producer.clone();
        let bo = bo.clone();
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                producer.map(&bo, Device::Cpu, Access::Write).unwrap();
                producer.unmap(&bo).unwrap();
            }
        })
    };
    let reader = {
        let consumer = consumer.clone();
        let peer = peer.clone();
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                consumer.map(&peer, Device::ThreeD, Access::Read).unwrap();
                consumer.unmap(&peer).unwrap();
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();

    // Every clean advanced the shared generation exactly once.
    assert_eq!(store.get(GLOBAL_KEY).unwrap() as u64, gem.stats().clean_alls);

    consumer.free(&peer).unwrap();
    producer.free(&bo).unwrap();
    assert_eq!(gem.stats().live_handles, 0);
}
