//! Buffer objects.

use crate::coherency::CacheState;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::fence::FenceQueue;
use crate::kernel::{GemHandle, GemKernel, GlobalName, Mapping};
use rustix::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Mutable per-object state, guarded by the object's state mutex.
#[derive(Debug, Default)]
pub(crate) struct BoState {
    /// CPU mapping, created on the first CPU map.
    pub(crate) mapping: Option<Mapping>,
    /// Cached dma-buf descriptor, shared with lock/unlock callers.
    pub(crate) dmabuf: Option<Arc<OwnedFd>>,
    pub(crate) map_count: u32,
    pub(crate) last_map_device: Option<Device>,
    pub(crate) cache: CacheState,
}

impl BoState {
    /// The cached descriptor, exporting one on first use.
    pub(crate) fn dmabuf(&mut self, kernel: &dyn GemKernel, handle: GemHandle) -> Result<Arc<OwnedFd>> {
        if let Some(fd) = &self.dmabuf {
            return Ok(fd.clone());
        }
        let fd = Arc::new(kernel.to_descriptor(handle).inspect_err(|e| {
            tracing::error!(gem = %handle, "cannot export dma-buf: {}", e);
        })?);
        self.dmabuf = Some(fd.clone());
        Ok(fd)
    }

    /// The CPU mapping, creating it on first use.
    ///
    /// Nothing is cached when mmap fails.
    pub(crate) fn mapping(
        &mut self,
        kernel: &dyn GemKernel,
        handle: GemHandle,
        size: usize,
    ) -> Result<&Mapping> {
        if self.mapping.is_none() {
            let mapping = kernel.map(handle, size).inspect_err(|e| {
                tracing::error!(gem = %handle, size, "cannot mmap buffer: {}", e);
            })?;
            self.mapping = Some(mapping);
        }
        self.mapping
            .as_ref()
            .ok_or_else(|| Error::InvariantViolation("mapping vanished".into()))
    }
}

/// One allocated or imported buffer.
///
/// Objects are created and handed out by
/// [`BufferManager`](crate::manager::BufferManager) and stay registered
/// until freed as many times as they were obtained. After the last free the
/// object is inert: every operation on it returns [`Error::Freed`].
pub struct BufferObject {
    handle: GemHandle,
    name: GlobalName,
    size: usize,
    flags: u32,
    state: Mutex<BoState>,
    fences: Mutex<FenceQueue>,
    freed: AtomicBool,
}

impl BufferObject {
    pub(crate) fn new(handle: GemHandle, name: GlobalName, size: usize, flags: u32) -> Self {
        Self {
            handle,
            name,
            size,
            flags,
            state: Mutex::new(BoState::default()),
            fences: Mutex::new(FenceQueue::new()),
            freed: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_descriptor(mut self, dmabuf: Option<OwnedFd>) -> Self {
        if let Some(fd) = dmabuf {
            self.state
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .dmabuf = Some(Arc::new(fd));
        }
        self
    }

    /// Process-local GEM handle.
    #[inline]
    pub fn handle(&self) -> GemHandle {
        self.handle
    }

    /// Global (flink) name.
    #[inline]
    pub fn name(&self) -> GlobalName {
        self.name
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Creation flags; 0 for imported buffers.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Whether the last reference has been freed.
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// Number of unmatched `map` calls.
    pub fn map_count(&self) -> u32 {
        self.state().map_count
    }

    /// Device of the most recent map, until the next unmap.
    pub fn last_map_device(&self) -> Option<Device> {
        self.state().last_map_device
    }

    /// In-process copy of the cache state.
    pub fn cache_state(&self) -> CacheState {
        self.state().cache
    }

    /// Whether a CPU mapping is currently held.
    pub fn is_cpu_mapped(&self) -> bool {
        self.state().mapping.is_some()
    }

    /// Whether a dma-buf descriptor is currently cached.
    pub fn has_descriptor(&self) -> bool {
        self.state().dmabuf.is_some()
    }

    /// Number of outstanding locks.
    pub fn pending_locks(&self) -> usize {
        self.fences().len()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, BoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn fences(&self) -> MutexGuard<'_, FenceQueue> {
        self.fences.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the cached dma-buf descriptor.
    pub(crate) fn descriptor(&self, kernel: &dyn GemKernel) -> Result<Arc<OwnedFd>> {
        self.state().dmabuf(kernel, self.handle)
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_freed() {
            return Err(Error::Freed);
        }
        Ok(())
    }

    pub(crate) fn mark_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("freed", &self.is_freed())
            .finish()
    }
}
