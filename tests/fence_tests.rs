//! Integration tests for buffer locking.

use bufmgr::coherency::{HardwareFencePolicy, ShmStore, SoftwarePolicy};
use bufmgr::fence::FENCE_QUEUE_CAPACITY;
use bufmgr::kernel::{
    CacheOp, FenceAccess, FenceContext, GemHandle, Mapping, SoftGem, SoftOp,
};
use bufmgr::prelude::*;
use rustix::fd::{BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn hardware_manager() -> (Arc<SoftGem>, BufferManager) {
    let gem = Arc::new(SoftGem::new());
    let manager = BufferManager::new(gem.clone(), Box::new(HardwareFencePolicy));
    (gem, manager)
}

fn software_manager() -> (Arc<SoftGem>, BufferManager) {
    let gem = Arc::new(SoftGem::new());
    let store = Arc::new(ShmStore::anonymous(64).unwrap());
    let policy = SoftwarePolicy::new(store).unwrap();
    let manager = BufferManager::new(gem.clone(), Box::new(policy));
    (gem, manager)
}

// ============================================================================
// Devices without locking
// ============================================================================

#[test]
fn test_lock_ignores_2d_and_multimedia() {
    let (gem, manager) = software_manager();
    let bo = manager.allocate(4096, 0).unwrap();
    let before = gem.stats();

    manager.lock(&bo, Device::TwoD, Access::Write).unwrap();
    manager.lock(&bo, Device::Multimedia, Access::Read).unwrap();
    manager.lock(&bo, Device::Default, Access::ReadWrite).unwrap();

    assert_eq!(gem.stats(), before);
    assert_eq!(bo.pending_locks(), 0);
    assert!(!bo.has_descriptor());
}

#[test]
fn test_lock_requires_access() {
    let (_gem, manager) = software_manager();
    let bo = manager.allocate(4096, 0).unwrap();
    assert!(matches!(
        manager.lock(&bo, Device::Cpu, Access::None),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(bo.pending_locks(), 0);
}

// ============================================================================
// Hardware fences
// ============================================================================

#[test]
fn test_3d_lock_takes_fence() {
    let (gem, manager) = hardware_manager();
    let bo = manager.allocate(4096, 0).unwrap();

    manager.lock(&bo, Device::ThreeD, Access::Write).unwrap();
    assert_eq!(gem.stats().fence_gets, 1);
    assert_eq!(gem.outstanding_fences(), 1);
    assert_eq!(bo.pending_locks(), 1);

    manager.unlock(&bo).unwrap();
    assert_eq!(gem.stats().fence_puts, 1);
    assert_eq!(gem.outstanding_fences(), 0);
    assert_eq!(bo.pending_locks(), 0);
}

#[test]
fn test_full_queue_returns_extra_fence() {
    let (gem, manager) = hardware_manager();
    let bo = manager.allocate(4096, 0).unwrap();

    for _ in 0..=FENCE_QUEUE_CAPACITY {
        manager.lock(&bo, Device::ThreeD, Access::Write).unwrap();
    }
    assert_eq!(bo.pending_locks(), FENCE_QUEUE_CAPACITY);
    assert_eq!(gem.stats().fence_gets, FENCE_QUEUE_CAPACITY as u64 + 1);
    assert_eq!(gem.stats().fence_puts, 1);
    assert_eq!(gem.outstanding_fences(), FENCE_QUEUE_CAPACITY);

    for _ in 0..FENCE_QUEUE_CAPACITY {
        manager.unlock(&bo).unwrap();
    }
    assert_eq!(gem.stats().fence_puts, FENCE_QUEUE_CAPACITY as u64 + 1);
    assert_eq!(gem.outstanding_fences(), 0);

    // Nothing left: no kernel call.
    manager.unlock(&bo).unwrap();
    assert_eq!(gem.stats().fence_puts, FENCE_QUEUE_CAPACITY as u64 + 1);
}

#[test]
fn test_unlock_releases_oldest_first() {
    let (gem, manager) = hardware_manager();
    let bo = manager.allocate(4096, 0).unwrap();

    // A read fence then a write fence: putting them in the wrong order
    // would be rejected for mismatched access.
    manager.lock(&bo, Device::ThreeD, Access::Read).unwrap();
    manager.lock(&bo, Device::ThreeD, Access::Write).unwrap();
    manager.unlock(&bo).unwrap();
    manager.unlock(&bo).unwrap();
    assert_eq!(gem.stats().fence_puts, 2);
}

#[test]
fn test_fence_failure_records_nothing() {
    let (gem, manager) = hardware_manager();
    let bo = manager.allocate(4096, 0).unwrap();

    gem.fail_next(SoftOp::GetFence);
    assert!(matches!(
        manager.lock(&bo, Device::ThreeD, Access::Write),
        Err(Error::Kernel {
            op: "DMABUF_GET_FENCE",
            ..
        })
    ));
    assert_eq!(bo.pending_locks(), 0);

    manager.unlock(&bo).unwrap();
    assert_eq!(gem.stats().fence_puts, 0);
}

#[test]
fn test_last_free_puts_outstanding_fences() {
    let (gem, manager) = hardware_manager();
    let bo = manager.allocate(4096, 0).unwrap();

    manager.lock(&bo, Device::ThreeD, Access::Read).unwrap();
    manager.lock(&bo, Device::ThreeD, Access::Write).unwrap();
    manager.free(&bo).unwrap();

    assert_eq!(gem.outstanding_fences(), 0);
    assert_eq!(gem.stats().fence_puts, 2);
    assert_eq!(gem.stats().live_handles, 0);
}

// ============================================================================
// Record locks
// ============================================================================

#[test]
fn test_cpu_lock_uses_record_lock() {
    let (gem, manager) = hardware_manager();
    let bo = manager.allocate(4096, 0).unwrap();

    manager.lock(&bo, Device::Cpu, Access::Write).unwrap();
    manager.lock(&bo, Device::Cpu, Access::Read).unwrap();
    assert_eq!(bo.pending_locks(), 2);
    assert_eq!(gem.stats().fence_calls(), 0);

    manager.unlock(&bo).unwrap();
    manager.unlock(&bo).unwrap();
    assert_eq!(bo.pending_locks(), 0);
}

#[test]
fn test_software_mode_3d_uses_record_lock() {
    let (gem, manager) = software_manager();
    let bo = manager.allocate(4096, 0).unwrap();

    manager.lock(&bo, Device::ThreeD, Access::Write).unwrap();
    assert_eq!(gem.stats().fence_calls(), 0);
    assert_eq!(bo.pending_locks(), 1);
    // The descriptor is exported on first use.
    assert!(bo.has_descriptor());
    assert_eq!(gem.stats().exports, 1);

    manager.unlock(&bo).unwrap();
    assert_eq!(bo.pending_locks(), 0);
}

#[test]
fn test_full_queue_keeps_record_locks() {
    let (_gem, manager) = software_manager();
    let bo = manager.allocate(4096, 0).unwrap();

    for _ in 0..FENCE_QUEUE_CAPACITY + 2 {
        manager.lock(&bo, Device::Cpu, Access::Read).unwrap();
    }
    assert_eq!(bo.pending_locks(), FENCE_QUEUE_CAPACITY);

    for _ in 0..FENCE_QUEUE_CAPACITY + 2 {
        manager.unlock(&bo).unwrap();
    }
    assert_eq!(bo.pending_locks(), 0);
}

#[test]
fn test_free_keeps_descriptor_while_locked() {
    let (_gem, manager) = software_manager();
    let bo = manager.allocate(4096, 0).unwrap();
    let again = manager.import(bo.name()).unwrap();

    manager.lock(&bo, Device::Cpu, Access::Write).unwrap();
    manager.free(&again).unwrap();
    assert!(bo.has_descriptor());
    assert_eq!(bo.pending_locks(), 1);

    manager.unlock(&bo).unwrap();
    manager.free(&bo).unwrap();
    assert!(bo.is_freed());
}

#[test]
fn test_lock_after_free_fails() {
    let (_gem, manager) = hardware_manager();
    let bo = manager.allocate(4096, 0).unwrap();
    manager.free(&bo).unwrap();

    assert!(matches!(
        manager.lock(&bo, Device::ThreeD, Access::Read),
        Err(Error::Freed)
    ));
    assert!(matches!(manager.unlock(&bo), Err(Error::Freed)));
}

// ============================================================================
// Locks racing frees
// ============================================================================

/// A [`SoftGem`] whose next `get_fence` parks until the test lets it go.
struct GatedGem {
    inner: SoftGem,
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl GatedGem {
    fn new() -> Self {
        Self {
            inner: SoftGem::new(),
            armed: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl GemKernel for GatedGem {
    fn name(&self) -> &str {
        "gated"
    }

    fn create(&self, size: u32, flags: u32) -> Result<GemHandle> {
        self.inner.create(size, flags)
    }

    fn open_by_name(&self, name: GlobalName) -> Result<(GemHandle, u64)> {
        self.inner.open_by_name(name)
    }

    fn close(&self, handle: GemHandle) -> Result<()> {
        self.inner.close(handle)
    }

    fn flink(&self, handle: GemHandle) -> Result<GlobalName> {
        self.inner.flink(handle)
    }

    fn to_descriptor(&self, handle: GemHandle) -> Result<OwnedFd> {
        self.inner.to_descriptor(handle)
    }

    fn from_descriptor(&self, fd: BorrowedFd<'_>) -> Result<GemHandle> {
        self.inner.from_descriptor(fd)
    }

    fn map(&self, handle: GemHandle, size: usize) -> Result<Mapping> {
        self.inner.map(handle, size)
    }

    fn cache_op(&self, op: &CacheOp) -> Result<()> {
        self.inner.cache_op(op)
    }

    fn get_fence(&self, dmabuf: BorrowedFd<'_>, access: FenceAccess) -> Result<FenceContext> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        self.inner.get_fence(dmabuf, access)
    }

    fn put_fence(
        &self,
        dmabuf: BorrowedFd<'_>,
        context: FenceContext,
        access: FenceAccess,
    ) -> Result<()> {
        self.inner.put_fence(dmabuf, context, access)
    }
}

#[test]
fn test_free_keeps_descriptor_for_lock_in_flight() {
    let gem = Arc::new(GatedGem::new());
    let manager = BufferManager::new(gem.clone(), Box::new(HardwareFencePolicy));
    let bo = manager.allocate(4096, 0).unwrap();
    let again = manager.import(bo.name()).unwrap();

    gem.armed.store(true, Ordering::SeqCst);
    thread::scope(|scope| {
        let locker = scope.spawn(|| manager.lock(&bo, Device::ThreeD, Access::Write));

        // The locker is inside get_fence with the descriptor resolved.
        gem.entered.wait();
        manager.free(&again).unwrap();
        assert!(bo.has_descriptor());
        assert_eq!(bo.pending_locks(), 0);

        gem.release.wait();
        locker.join().unwrap().unwrap();
    });

    assert_eq!(bo.pending_locks(), 1);
    assert!(bo.has_descriptor());
    assert_eq!(gem.inner.stats().exports, 1);

    manager.unlock(&bo).unwrap();
    assert_eq!(gem.inner.outstanding_fences(), 0);
    assert_eq!(gem.inner.stats().exports, 1);

    manager.free(&bo).unwrap();
    assert_eq!(gem.inner.stats().live_handles, 0);
}
