//! The buffer manager: one per process, owning every buffer object.
//!
//! All lifecycle operations go through [`BufferManager`]:
//!
//! ```text
//! allocate / import / import_fd ──► kernel ──► registry dedup ──► init_state
//! map / unmap ──────────────────────► coherency policy ──► cache ops
//! lock / unlock ────────────────────► fence queue ──► fences / record locks
//! free ─────────────────────────────► registry release ──► destroy_state, close
//! ```
//!
//! The registry mutex is held for the whole of every allocate, import and
//! free, so deduplication by global name is linearizable within a process.

use crate::bo::{BoState, BufferObject};
use crate::coherency::{
    CoherencyMode, CoherencyPolicy, FlushDecision, HardwareFencePolicy, ShmStore, SoftwarePolicy,
    StateOrigin,
};
use crate::config::BufMgrConfig;
use crate::device::{Access, BoHandle, Device};
use crate::error::{Error, Result};
use crate::fence;
use crate::kernel::{CacheOp, DriverOps, DrmDevice, GemHandle, GemKernel, GlobalName};
use crate::observability;
use crate::registry::{HandleRegistry, Release};
use crate::surface::{Fourcc, PlaneInfo, PlaneLayout};
use rustix::fd::{AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Process-wide buffer manager context.
///
/// # Example
///
/// ```rust,ignore
/// use bufmgr::prelude::*;
///
/// let manager = BufferManager::open(&BufMgrConfig::from_env()?, Vc4)?;
/// let bo = manager.allocate(4096, 0)?;
/// let ptr = manager.map(&bo, Device::Cpu, Access::Write)?;
/// // ... fill the buffer through ptr ...
/// manager.unmap(&bo)?;
/// let name = manager.export(&bo)?;
/// ```
pub struct BufferManager {
    kernel: Arc<dyn GemKernel>,
    policy: Box<dyn CoherencyPolicy>,
    registry: Mutex<HandleRegistry>,
    layout: Option<Arc<dyn PlaneLayout>>,
    shut_down: AtomicBool,
}

impl BufferManager {
    /// Create a manager from an explicit kernel backend and policy.
    pub fn new(kernel: Arc<dyn GemKernel>, policy: Box<dyn CoherencyPolicy>) -> Self {
        observability::init_metrics();
        tracing::debug!(backend = kernel.name(), mode = %policy.mode(), "buffer manager created");

        Self {
            kernel,
            policy,
            registry: Mutex::new(HandleRegistry::new()),
            layout: None,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create a manager whose policy is built from `config`.
    ///
    /// Software tracking opens the configured store file, or creates a
    /// private anonymous store when none is configured.
    pub fn with_config(kernel: Arc<dyn GemKernel>, config: &BufMgrConfig) -> Result<Self> {
        let policy: Box<dyn CoherencyPolicy> = match config.coherency.resolve() {
            CoherencyMode::HardwareFence => Box::new(HardwareFencePolicy),
            CoherencyMode::SoftwareTracked => {
                let store = match &config.store_path {
                    Some(path) => ShmStore::open(path, config.store_capacity)?,
                    None => ShmStore::anonymous(config.store_capacity)?,
                };
                Box::new(SoftwarePolicy::new(Arc::new(store))?)
            }
        };
        Ok(Self::new(kernel, policy))
    }

    /// Open the configured DRM node with `driver` and build a manager on it.
    pub fn open<D: DriverOps>(config: &BufMgrConfig, driver: D) -> Result<Self> {
        let drm = DrmDevice::open(config.resolve_device_path(), driver)?;
        Self::with_config(Arc::new(drm), config)
    }

    /// Install the plane geometry used by [`plane_info`](Self::plane_info).
    pub fn with_layout(mut self, layout: Arc<dyn PlaneLayout>) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Active coherency mode.
    pub fn mode(&self) -> CoherencyMode {
        self.policy.mode()
    }

    /// The kernel backend.
    pub fn kernel(&self) -> &Arc<dyn GemKernel> {
        &self.kernel
    }

    /// Number of distinct buffer objects alive in this process.
    pub fn live_objects(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> MutexGuard<'_, HandleRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_initialized(registry: &HandleRegistry) -> Result<()> {
        if registry.is_destroyed() {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    /// Close a handle on an error path; the caller reports the first error.
    fn discard_handle(&self, handle: GemHandle) {
        if let Err(e) = self.kernel.close(handle) {
            tracing::error!(gem = %handle, "cannot close handle while unwinding: {}", e);
        }
    }

    /// Allocate a new buffer of `size` bytes.
    pub fn allocate(&self, size: usize, flags: u32) -> Result<Arc<BufferObject>> {
        if size == 0 {
            return Err(Error::InvalidArgument("buffer size must be non-zero".into()));
        }
        let kernel_size = u32::try_from(size)
            .map_err(|_| Error::InvalidArgument(format!("buffer size {size} exceeds 4 GiB")))?;

        let mut registry = self.registry();
        Self::ensure_initialized(&registry)?;

        let handle = self.kernel.create(kernel_size, flags).inspect_err(|e| {
            tracing::error!(size, flags, "cannot create buffer: {}", e);
        })?;

        let name = match self.kernel.flink(handle) {
            Ok(name) => name,
            Err(e) => {
                tracing::error!(gem = %handle, "cannot name buffer: {}", e);
                self.discard_handle(handle);
                return Err(e);
            }
        };

        self.policy.init_state(name, StateOrigin::Allocated);

        let dmabuf = match self.mode() {
            CoherencyMode::HardwareFence => match self.kernel.to_descriptor(handle) {
                Ok(fd) => Some(fd),
                Err(e) => {
                    tracing::error!(gem = %handle, name = name.get(), "cannot export dma-buf: {}", e);
                    self.policy.destroy_state(name);
                    self.discard_handle(handle);
                    return Err(e);
                }
            },
            CoherencyMode::SoftwareTracked => None,
        };

        let bo = Arc::new(BufferObject::new(handle, name, size, flags).with_descriptor(dmabuf));
        if let Err(e) = registry.insert(name, bo.clone()) {
            self.policy.destroy_state(name);
            // Drop the descriptor before the handle goes away.
            drop(bo);
            self.discard_handle(handle);
            return Err(e);
        }

        observability::record_allocated(self.kernel.name(), size);
        tracing::debug!(gem = %handle, name = name.get(), size, flags, "allocated");
        Ok(bo)
    }

    /// Import a buffer by global name.
    ///
    /// A name already known to this process returns the same object with
    /// one more reference, without a kernel call.
    pub fn import(&self, name: GlobalName) -> Result<Arc<BufferObject>> {
        let mut registry = self.registry();
        Self::ensure_initialized(&registry)?;

        if let Some(bo) = registry.acquire(name)? {
            observability::record_imported("name", true);
            tracing::debug!(gem = %bo.handle(), name = name.get(), "import hit registry");
            return Ok(bo);
        }

        let (handle, size) = self.kernel.open_by_name(name).inspect_err(|e| {
            tracing::error!(name = name.get(), "cannot open buffer by name: {}", e);
        })?;
        let size = match usize::try_from(size) {
            Ok(size) => size,
            Err(_) => {
                self.discard_handle(handle);
                return Err(Error::InvalidArgument(format!("buffer size {size} too large")));
            }
        };

        self.policy.init_state(name, StateOrigin::Imported);

        let dmabuf = match self.kernel.to_descriptor(handle) {
            Ok(fd) => fd,
            Err(e) => {
                tracing::error!(gem = %handle, name = name.get(), "cannot export dma-buf: {}", e);
                self.policy.destroy_state(name);
                self.discard_handle(handle);
                return Err(e);
            }
        };

        let bo = Arc::new(BufferObject::new(handle, name, size, 0).with_descriptor(Some(dmabuf)));
        if let Err(e) = registry.insert(name, bo.clone()) {
            self.policy.destroy_state(name);
            drop(bo);
            self.discard_handle(handle);
            return Err(e);
        }

        observability::record_imported("name", false);
        tracing::debug!(gem = %handle, name = name.get(), size, "imported by name");
        Ok(bo)
    }

    /// Import a buffer from a dma-buf descriptor.
    ///
    /// The descriptor is only borrowed; the caller keeps ownership.
    pub fn import_fd(&self, fd: BorrowedFd<'_>) -> Result<Arc<BufferObject>> {
        let mut registry = self.registry();
        Self::ensure_initialized(&registry)?;

        let handle = self.kernel.from_descriptor(fd).inspect_err(|e| {
            tracing::error!(fd = fd.as_raw_fd(), "cannot import dma-buf: {}", e);
        })?;

        let name = match self.kernel.flink(handle) {
            Ok(name) => name,
            Err(e) => {
                tracing::error!(gem = %handle, fd = fd.as_raw_fd(), "cannot name imported buffer: {}", e);
                if !registry.contains_handle(handle) {
                    self.discard_handle(handle);
                }
                return Err(e);
            }
        };

        if let Some(bo) = registry.acquire(name)? {
            if bo.handle() != handle {
                tracing::warn!(
                    name = name.get(),
                    registered = %bo.handle(),
                    resolved = %handle,
                    "descriptor import resolved a different handle, keeping the registered one"
                );
                self.discard_handle(handle);
            }
            observability::record_imported("fd", true);
            tracing::debug!(gem = %bo.handle(), name = name.get(), fd = fd.as_raw_fd(), "import hit registry");
            return Ok(bo);
        }

        let size = match rustix::fs::seek(fd, SeekFrom::End(0)) {
            Ok(size) => size,
            Err(probe_err) => {
                tracing::debug!(fd = fd.as_raw_fd(), "size probe failed ({}), asking the kernel", probe_err);
                match self.kernel.open_by_name(name) {
                    Ok((extra, size)) => {
                        if extra != handle {
                            self.discard_handle(extra);
                        }
                        size
                    }
                    Err(e) => {
                        tracing::error!(name = name.get(), "cannot determine buffer size: {}", e);
                        self.discard_handle(handle);
                        return Err(e);
                    }
                }
            }
        };
        let size = match usize::try_from(size) {
            Ok(size) => size,
            Err(_) => {
                self.discard_handle(handle);
                return Err(Error::InvalidArgument(format!("buffer size {size} too large")));
            }
        };

        self.policy.init_state(name, StateOrigin::Imported);

        let bo = Arc::new(BufferObject::new(handle, name, size, 0));
        if let Err(e) = registry.insert(name, bo.clone()) {
            self.policy.destroy_state(name);
            self.discard_handle(handle);
            return Err(e);
        }

        observability::record_imported("fd", false);
        tracing::debug!(gem = %handle, name = name.get(), fd = fd.as_raw_fd(), size, "imported by descriptor");
        Ok(bo)
    }

    /// The global name of `bo`, for sharing with other processes.
    pub fn export(&self, bo: &BufferObject) -> Result<GlobalName> {
        bo.ensure_live()?;
        tracing::debug!(gem = %bo.handle(), name = bo.name().get(), "exported name");
        Ok(bo.name())
    }

    /// A fresh dma-buf descriptor for `bo`, owned by the caller.
    pub fn export_fd(&self, bo: &BufferObject) -> Result<OwnedFd> {
        bo.ensure_live()?;
        let fd = self.kernel.to_descriptor(bo.handle()).inspect_err(|e| {
            tracing::error!(gem = %bo.handle(), "cannot export dma-buf: {}", e);
        })?;
        tracing::debug!(gem = %bo.handle(), name = bo.name().get(), fd = fd.as_raw_fd(), "exported descriptor");
        Ok(fd)
    }

    fn resolve_handle(&self, bo: &BufferObject, state: &mut BoState, device: Device) -> Result<BoHandle> {
        match device {
            Device::Default | Device::TwoD => Ok(BoHandle::Gem(bo.handle().0)),
            Device::Cpu => {
                let mapping = state.mapping(&*self.kernel, bo.handle(), bo.size())?;
                Ok(BoHandle::Ptr(mapping.as_ptr()))
            }
            Device::ThreeD | Device::Multimedia => {
                let fd = state.dmabuf(&*self.kernel, bo.handle())?;
                Ok(BoHandle::Fd(fd.as_raw_fd()))
            }
        }
    }

    /// The handle `device` would use for `bo`, without starting a map
    /// session.
    pub fn get_handle(&self, bo: &BufferObject, device: Device) -> Result<BoHandle> {
        bo.ensure_live()?;
        let mut state = bo.state();
        self.resolve_handle(bo, &mut state, device)
    }

    fn cache_op(&self, op: CacheOp) {
        observability::record_cache_op(op.kind());
        if let Err(e) = self.kernel.cache_op(&op) {
            tracing::error!(op = op.kind(), "cache maintenance failed: {}", e);
        }
    }

    /// Map `bo` for `device`.
    ///
    /// Maps nest: each call must be matched by an [`unmap`](Self::unmap).
    /// The first map of a session consults the coherency policy and issues
    /// whatever cache maintenance it asks for.
    pub fn map(&self, bo: &BufferObject, device: Device, access: Access) -> Result<BoHandle> {
        bo.ensure_live()?;
        let mut state = bo.state();
        let handle = self.resolve_handle(bo, &mut state, device).inspect_err(|e| {
            tracing::error!(gem = %bo.handle(), device = %device, access = %access, "cannot map: {}", e);
        })?;

        if state.map_count == 0 {
            let decision = self.policy.set_state(bo.name(), &mut state.cache, device, access);
            match decision {
                FlushDecision::None => {}
                FlushDecision::Invalidate => match &state.mapping {
                    Some(mapping) => self.cache_op(CacheOp::Invalidate {
                        addr: mapping.as_ptr().as_ptr() as usize,
                        len: mapping.len(),
                    }),
                    None => self.cache_op(CacheOp::FlushAll),
                },
                FlushDecision::CleanAll => self.cache_op(CacheOp::CleanAll),
            }
        }

        state.last_map_device = Some(device);
        state.map_count += 1;

        tracing::debug!(
            gem = %bo.handle(),
            name = bo.name().get(),
            device = %device,
            access = %access,
            map_count = state.map_count,
            "mapped"
        );
        Ok(handle)
    }

    /// End one map of `bo`.
    pub fn unmap(&self, bo: &BufferObject) -> Result<()> {
        bo.ensure_live()?;
        let mut state = bo.state();
        if state.map_count == 0 {
            return Err(Error::NotMapped);
        }

        state.map_count -= 1;
        if state.map_count == 0 {
            self.policy.save_state(bo.name(), &mut state.cache);
        }

        if self.policy.flush_on_unmap(state.last_map_device) {
            self.cache_op(CacheOp::FlushAll);
        }
        state.last_map_device = None;

        tracing::debug!(gem = %bo.handle(), name = bo.name().get(), map_count = state.map_count, "unmapped");
        Ok(())
    }

    /// Serialize access to `bo` with other processes.
    ///
    /// Only 3D and CPU access take a lock; other devices return at once.
    pub fn lock(&self, bo: &BufferObject, device: Device, access: Access) -> Result<()> {
        bo.ensure_live()?;
        fence::lock(&*self.kernel, self.mode(), bo, device, access)
    }

    /// Release the oldest lock taken on `bo`. A no-op without locks.
    pub fn unlock(&self, bo: &BufferObject) -> Result<()> {
        bo.ensure_live()?;
        fence::unlock(&*self.kernel, bo)
    }

    /// Drop one reference to `bo`.
    ///
    /// The kernel handle is released with the last reference. Cached CPU
    /// mappings and descriptors are dropped on every free unless a map
    /// session or a lock is still outstanding, and re-created on demand.
    pub fn free(&self, bo: &BufferObject) -> Result<()> {
        bo.ensure_live()?;
        let mut registry = self.registry();

        match registry.release(bo)? {
            Release::Retained(remaining) => {
                // Fences before state, as in `lock`. Closing the descriptor
                // would also drop this process's record locks on the buffer.
                let fences = bo.fences();
                let mut state = bo.state();
                if state.map_count == 0 && fences.is_idle() {
                    state.mapping = None;
                    state.dmabuf = None;
                }
                tracing::debug!(gem = %bo.handle(), name = bo.name().get(), remaining, "released reference");
                Ok(())
            }
            Release::Last => {
                let result = self.finalize(bo);
                observability::record_freed();
                tracing::debug!(gem = %bo.handle(), name = bo.name().get(), "freed");
                result
            }
        }
    }

    /// Tear down an object that has left the registry.
    fn finalize(&self, bo: &BufferObject) -> Result<()> {
        loop {
            let pending = bo.pending_locks();
            if pending == 0 {
                break;
            }
            if let Err(e) = fence::unlock(&*self.kernel, bo) {
                tracing::warn!(gem = %bo.handle(), "dropping lock during teardown failed: {}", e);
                // An entry whose descriptor could not be resolved stays queued.
                if bo.pending_locks() == pending {
                    bo.fences().pop();
                }
            }
        }

        {
            let mut state = bo.state();
            if state.map_count > 0 {
                tracing::warn!(gem = %bo.handle(), map_count = state.map_count, "freeing a mapped buffer");
                self.policy.save_state(bo.name(), &mut state.cache);
                state.map_count = 0;
                state.last_map_device = None;
            }
            state.mapping = None;
            state.dmabuf = None;
        }

        self.policy.destroy_state(bo.name());
        bo.mark_freed();
        self.kernel.close(bo.handle()).inspect_err(|e| {
            tracing::error!(gem = %bo.handle(), "cannot close handle: {}", e);
        })
    }

    /// Current registry count of `bo` (0 once freed).
    pub fn refcount(&self, bo: &BufferObject) -> Result<u32> {
        self.registry().refcount(bo.name())
    }

    /// Size of `bo` in bytes.
    pub fn size(&self, bo: &BufferObject) -> Result<usize> {
        bo.ensure_live()?;
        Ok(bo.size())
    }

    /// Creation flags of `bo`; 0 for imported buffers.
    pub fn flags(&self, bo: &BufferObject) -> Result<u32> {
        bo.ensure_live()?;
        Ok(bo.flags())
    }

    /// Plane geometry from the installed [`PlaneLayout`].
    pub fn plane_info(&self, width: u32, height: u32, format: Fourcc, plane: u32) -> Result<PlaneInfo> {
        match &self.layout {
            Some(layout) => layout.plane(width, height, format, plane),
            None => Err(Error::Unsupported("no plane layout installed".into())),
        }
    }

    /// Formats known to the installed [`PlaneLayout`].
    pub fn supported_formats(&self) -> Result<Vec<Fourcc>> {
        match &self.layout {
            Some(layout) => Ok(layout.supported_formats()),
            None => Err(Error::Unsupported("no plane layout installed".into())),
        }
    }

    /// Release every remaining object and the coherency store.
    ///
    /// Idempotent; also run on drop. Objects still held by callers become
    /// inert and report [`Error::Freed`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let objects = self.registry().destroy();
        let count = objects.len();
        for bo in objects {
            if let Err(e) = self.finalize(&bo) {
                tracing::warn!(gem = %bo.handle(), "teardown failed: {}", e);
            }
        }
        self.policy.shutdown();
        observability::record_live_objects(0);

        tracing::debug!(released = count, "buffer manager shut down");
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("backend", &self.kernel.name())
            .field("mode", &self.mode())
            .field("registry", &*self.registry())
            .finish()
    }
}
