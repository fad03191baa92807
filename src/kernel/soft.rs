//! Software GEM emulation backed by memfd.
//!
//! `SoftGem` reproduces the parts of DRM GEM semantics the buffer manager
//! relies on, entirely in userspace:
//!
//! - Every object is a memfd; handles are per-`SoftGem` integers.
//! - `flink` assigns a stable global name once per object.
//! - `open_by_name` creates a *new* handle each call, like `GEM_OPEN`.
//! - PRIME export returns a fresh dup of the memfd; PRIME import recognizes
//!   the object by inode and returns the handle it was last exported or
//!   imported under, like the kernel's per-file prime cache.
//! - Objects die when their last handle is closed; exported descriptors keep
//!   the memory alive and can be re-imported as a new object.
//! - Fences are synthetic contexts that must be put exactly once.
//!
//! It also counts calls and supports one-shot failure injection, which makes
//! it the backend of choice for tests and headless hosts.

use super::{CacheOp, FenceAccess, FenceContext, GemHandle, GemKernel, GlobalName, Mapping};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::io::Errno;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Operations of [`SoftGem`] that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoftOp {
    /// `create`
    Create,
    /// `open_by_name`
    Open,
    /// `close`
    Close,
    /// `flink`
    Flink,
    /// `to_descriptor`
    Export,
    /// `from_descriptor`
    Import,
    /// `map`
    Map,
    /// `cache_op`
    CacheOp,
    /// `get_fence`
    GetFence,
    /// `put_fence`
    PutFence,
}

/// Call counters and live-object gauges of a [`SoftGem`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftGemStats {
    /// Successful `create` calls.
    pub creates: u64,
    /// Successful `open_by_name` calls.
    pub opens: u64,
    /// Successful `close` calls.
    pub closes: u64,
    /// Successful `flink` calls.
    pub flinks: u64,
    /// Successful `to_descriptor` calls.
    pub exports: u64,
    /// Successful `from_descriptor` calls.
    pub imports: u64,
    /// Successful `map` calls.
    pub maps: u64,
    /// `CacheOp::Invalidate` requests.
    pub invalidates: u64,
    /// `CacheOp::CleanAll` requests.
    pub clean_alls: u64,
    /// `CacheOp::FlushAll` requests.
    pub flush_alls: u64,
    /// Successful `get_fence` calls.
    pub fence_gets: u64,
    /// Successful `put_fence` calls.
    pub fence_puts: u64,
    /// Objects currently alive.
    pub live_objects: usize,
    /// Handles currently open.
    pub live_handles: usize,
}

impl SoftGemStats {
    /// Total cache maintenance requests of any kind.
    pub fn cache_ops(&self) -> u64 {
        self.invalidates + self.clean_alls + self.flush_alls
    }

    /// Total fence calls of any kind.
    pub fn fence_calls(&self) -> u64 {
        self.fence_gets + self.fence_puts
    }
}

struct SoftObject {
    memfd: OwnedFd,
    size: u64,
    inode: u64,
    name: Option<GlobalName>,
    prime_handle: Option<GemHandle>,
}

#[derive(Default)]
struct SoftState {
    next_handle: u32,
    next_name: u32,
    next_object: u64,
    next_fence: u64,
    objects: HashMap<u64, SoftObject>,
    handles: HashMap<GemHandle, u64>,
    names: HashMap<GlobalName, u64>,
    inodes: HashMap<u64, u64>,
    fences: HashMap<FenceContext, FenceAccess>,
    failures: HashSet<SoftOp>,
    stats: SoftGemStats,
}

impl SoftState {
    fn fail_if_armed(&mut self, op: SoftOp, name: &'static str) -> Result<()> {
        if self.failures.remove(&op) {
            return Err(Error::kernel(name, Errno::IO));
        }
        Ok(())
    }

    fn object_id(&self, handle: GemHandle, op: &'static str) -> Result<u64> {
        self.handles
            .get(&handle)
            .copied()
            .ok_or_else(|| Error::kernel(op, Errno::NOENT))
    }

    fn new_handle(&mut self, object: u64) -> GemHandle {
        self.next_handle += 1;
        let handle = GemHandle(self.next_handle);
        self.handles.insert(handle, object);
        handle
    }

    fn insert_object(&mut self, memfd: OwnedFd, size: u64) -> Result<u64> {
        let inode = rustix::fs::fstat(&memfd)?.st_ino as u64;
        self.next_object += 1;
        let id = self.next_object;
        self.objects.insert(
            id,
            SoftObject {
                memfd,
                size,
                inode,
                name: None,
                prime_handle: None,
            },
        );
        self.inodes.insert(inode, id);
        Ok(id)
    }

    fn refresh_gauges(&mut self) {
        self.stats.live_objects = self.objects.len();
        self.stats.live_handles = self.handles.len();
    }
}

/// memfd-backed emulation of a GEM-capable DRM device.
///
/// # Example
///
/// ```rust,ignore
/// use bufmgr::kernel::{GemKernel, SoftGem};
///
/// let gem = SoftGem::new();
/// let handle = gem.create(4096, 0)?;
/// let name = gem.flink(handle)?;
/// let (other, size) = gem.open_by_name(name)?;
/// assert_ne!(handle, other);
/// assert_eq!(size, 4096);
/// ```
#[derive(Default)]
pub struct SoftGem {
    state: Mutex<SoftState>,
}

impl SoftGem {
    /// Create an empty emulated device.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SoftState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of `op` fail with `EIO`.
    pub fn fail_next(&self, op: SoftOp) {
        self.lock().failures.insert(op);
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> SoftGemStats {
        self.lock().stats
    }

    /// Number of fences obtained but not yet put.
    pub fn outstanding_fences(&self) -> usize {
        self.lock().fences.len()
    }

    /// Is `handle` currently open?
    pub fn is_open(&self, handle: GemHandle) -> bool {
        self.lock().handles.contains_key(&handle)
    }
}

impl GemKernel for SoftGem {
    fn name(&self) -> &str {
        "soft"
    }

    fn create(&self, size: u32, _flags: u32) -> Result<GemHandle> {
        let mut state = self.lock();
        state.fail_if_armed(SoftOp::Create, "CREATE_BO")?;
        if size == 0 {
            return Err(Error::kernel("CREATE_BO", Errno::INVAL));
        }

        let memfd = rustix::fs::memfd_create("soft-gem", rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&memfd, size as u64)?;

        let id = state.insert_object(memfd, size as u64)?;
        let handle = state.new_handle(id);
        state.stats.creates += 1;
        state.refresh_gauges();
        Ok(handle)
    }

    fn open_by_name(&self, name: GlobalName) -> Result<(GemHandle, u64)> {
        let mut state = self.lock();
        state.fail_if_armed(SoftOp::Open, "GEM_OPEN")?;

        let id = *state
            .names
            .get(&name)
            .ok_or_else(|| Error::kernel("GEM_OPEN", Errno::NOENT))?;
        let size = state.objects[&id].size;
        let handle = state.new_handle(id);
        state.stats.opens += 1;
        state.refresh_gauges();
        Ok((handle, size))
    }

    fn close(&self, handle: GemHandle) -> Result<()> {
        let mut state = self.lock();
        state.fail_if_armed(SoftOp::Close, "GEM_CLOSE")?;

        let id = state
            .handles
            .remove(&handle)
            .ok_or_else(|| Error::kernel("GEM_CLOSE", Errno::INVAL))?;

        if let Some(object) = state.objects.get_mut(&id) {
            if object.prime_handle == Some(handle) {
                object.prime_handle = None;
            }
        }

        if !state.handles.values().any(|&other| other == id) {
            if let Some(object) = state.objects.remove(&id) {
                state.inodes.remove(&object.inode);
                if let Some(name) = object.name {
                    state.names.remove(&name);
                }
            }
        }

        state.stats.closes += 1;
        state.refresh_gauges();
        Ok(())
    }

    fn flink(&self, handle: GemHandle) -> Result<GlobalName> {
        let mut state = self.lock();
        state.fail_if_armed(SoftOp::Flink, "GEM_FLINK")?;

        let id = state.object_id(handle, "GEM_FLINK")?;
        if let Some(name) = state.objects[&id].name {
            state.stats.flinks += 1;
            return Ok(name);
        }

        state.next_name += 1;
        let name = GlobalName::new(state.next_name)
            .ok_or_else(|| Error::kernel("GEM_FLINK", Errno::NOSPC))?;
        if let Some(object) = state.objects.get_mut(&id) {
            object.name = Some(name);
        }
        state.names.insert(name, id);
        state.stats.flinks += 1;
        Ok(name)
    }

    fn to_descriptor(&self, handle: GemHandle) -> Result<OwnedFd> {
        let mut state = self.lock();
        state.fail_if_armed(SoftOp::Export, "PRIME_HANDLE_TO_FD")?;

        let id = state.object_id(handle, "PRIME_HANDLE_TO_FD")?;
        let object = state
            .objects
            .get_mut(&id)
            .ok_or_else(|| Error::kernel("PRIME_HANDLE_TO_FD", Errno::NOENT))?;
        let fd = rustix::io::fcntl_dupfd_cloexec(&object.memfd, 0)?;
        object.prime_handle.get_or_insert(handle);
        state.stats.exports += 1;
        Ok(fd)
    }

    fn from_descriptor(&self, fd: BorrowedFd<'_>) -> Result<GemHandle> {
        let mut state = self.lock();
        state.fail_if_armed(SoftOp::Import, "PRIME_FD_TO_HANDLE")?;

        let stat = rustix::fs::fstat(fd).map_err(|e| Error::kernel("PRIME_FD_TO_HANDLE", e))?;
        let inode = stat.st_ino as u64;

        let handle = match state.inodes.get(&inode).copied() {
            Some(id) => match state.objects[&id].prime_handle {
                Some(handle) => handle,
                None => {
                    let handle = state.new_handle(id);
                    if let Some(object) = state.objects.get_mut(&id) {
                        object.prime_handle = Some(handle);
                    }
                    handle
                }
            },
            None => {
                // The object died but an exported descriptor kept the memory
                // alive: the import resurrects it as a new object.
                let memfd = rustix::io::fcntl_dupfd_cloexec(fd, 0)?;
                let id = state.insert_object(memfd, stat.st_size as u64)?;
                let handle = state.new_handle(id);
                if let Some(object) = state.objects.get_mut(&id) {
                    object.prime_handle = Some(handle);
                }
                handle
            }
        };

        state.stats.imports += 1;
        state.refresh_gauges();
        Ok(handle)
    }

    fn map(&self, handle: GemHandle, size: usize) -> Result<Mapping> {
        let mut state = self.lock();
        state.fail_if_armed(SoftOp::Map, "mmap")?;

        let id = state.object_id(handle, "mmap")?;
        let mapping = Mapping::new(state.objects[&id].memfd.as_fd(), size, 0)?;
        state.stats.maps += 1;
        Ok(mapping)
    }

    fn cache_op(&self, op: &CacheOp) -> Result<()> {
        let mut state = self.lock();
        state.fail_if_armed(SoftOp::CacheOp, "CACHE_OP")?;

        match op {
            CacheOp::Invalidate { .. } => state.stats.invalidates += 1,
            CacheOp::CleanAll => state.stats.clean_alls += 1,
            CacheOp::FlushAll => state.stats.flush_alls += 1,
        }
        Ok(())
    }

    fn get_fence(&self, dmabuf: BorrowedFd<'_>, access: FenceAccess) -> Result<FenceContext> {
        let mut state = self.lock();
        state.fail_if_armed(SoftOp::GetFence, "DMABUF_GET_FENCE")?;

        let inode = rustix::fs::fstat(dmabuf)
            .map_err(|e| Error::kernel("DMABUF_GET_FENCE", e))?
            .st_ino as u64;
        if !state.inodes.contains_key(&inode) {
            return Err(Error::kernel("DMABUF_GET_FENCE", Errno::BADF));
        }

        state.next_fence += 1;
        let context = FenceContext(state.next_fence);
        state.fences.insert(context, access);
        state.stats.fence_gets += 1;
        Ok(context)
    }

    fn put_fence(
        &self,
        _dmabuf: BorrowedFd<'_>,
        context: FenceContext,
        access: FenceAccess,
    ) -> Result<()> {
        let mut state = self.lock();
        state.fail_if_armed(SoftOp::PutFence, "DMABUF_PUT_FENCE")?;

        match state.fences.get(&context) {
            Some(recorded) if *recorded == access => {
                state.fences.remove(&context);
                state.stats.fence_puts += 1;
                Ok(())
            }
            _ => Err(Error::kernel("DMABUF_PUT_FENCE", Errno::INVAL)),
        }
    }
}

impl std::fmt::Debug for SoftGem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SoftGem")
            .field("objects", &state.objects.len())
            .field("handles", &state.handles.len())
            .field("fences", &state.fences.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_close() {
        let gem = SoftGem::new();
        let handle = gem.create(4096, 0).unwrap();
        assert!(gem.is_open(handle));
        assert_eq!(gem.stats().live_objects, 1);

        gem.close(handle).unwrap();
        assert!(!gem.is_open(handle));
        assert_eq!(gem.stats().live_objects, 0);
        assert!(gem.close(handle).is_err());
    }

    #[test]
    fn test_flink_is_stable() {
        let gem = SoftGem::new();
        let handle = gem.create(4096, 0).unwrap();
        let a = gem.flink(handle).unwrap();
        let b = gem.flink(handle).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_open_by_name_creates_new_handle() {
        let gem = SoftGem::new();
        let handle = gem.create(8192, 0).unwrap();
        let name = gem.flink(handle).unwrap();

        let (other, size) = gem.open_by_name(name).unwrap();
        assert_ne!(handle, other);
        assert_eq!(size, 8192);

        // Object survives until its last handle is closed.
        gem.close(handle).unwrap();
        assert_eq!(gem.stats().live_objects, 1);
        gem.close(other).unwrap();
        assert_eq!(gem.stats().live_objects, 0);
        assert!(gem.open_by_name(name).is_err());
    }

    #[test]
    fn test_prime_round_trip_returns_same_handle() {
        let gem = SoftGem::new();
        let handle = gem.create(4096, 0).unwrap();
        let fd = gem.to_descriptor(handle).unwrap();
        let imported = gem.from_descriptor(fd.as_fd()).unwrap();
        assert_eq!(handle, imported);
    }

    #[test]
    fn test_prime_shares_memory() {
        let gem = SoftGem::new();
        let handle = gem.create(4096, 0).unwrap();
        let fd = gem.to_descriptor(handle).unwrap();

        let via_gem = gem.map(handle, 4096).unwrap();
        let via_fd = Mapping::new(&fd, 4096, 0).unwrap();
        unsafe {
            *via_gem.as_ptr().as_ptr().add(17) = 0xab;
            assert_eq!(via_fd.as_slice()[17], 0xab);
        }
    }

    #[test]
    fn test_import_after_object_died() {
        let gem = SoftGem::new();
        let handle = gem.create(4096, 0).unwrap();
        let fd = gem.to_descriptor(handle).unwrap();
        gem.close(handle).unwrap();

        let revived = gem.from_descriptor(fd.as_fd()).unwrap();
        assert!(gem.is_open(revived));
        assert_eq!(gem.stats().live_objects, 1);
    }

    #[test]
    fn test_fail_next_is_one_shot() {
        let gem = SoftGem::new();
        gem.fail_next(SoftOp::Create);
        assert!(matches!(
            gem.create(4096, 0),
            Err(Error::Kernel { op: "CREATE_BO", .. })
        ));
        assert!(gem.create(4096, 0).is_ok());
    }

    #[test]
    fn test_fence_get_put() {
        let gem = SoftGem::new();
        let handle = gem.create(4096, 0).unwrap();
        let fd = gem.to_descriptor(handle).unwrap();

        let ctx = gem.get_fence(fd.as_fd(), FenceAccess::Write).unwrap();
        assert_eq!(gem.outstanding_fences(), 1);

        // Wrong access type is rejected.
        assert!(gem.put_fence(fd.as_fd(), ctx, FenceAccess::Read).is_err());
        gem.put_fence(fd.as_fd(), ctx, FenceAccess::Write).unwrap();
        assert_eq!(gem.outstanding_fences(), 0);

        // Double put is rejected.
        assert!(gem.put_fence(fd.as_fd(), ctx, FenceAccess::Write).is_err());
    }

    #[test]
    fn test_cache_op_counters() {
        let gem = SoftGem::new();
        gem.cache_op(&CacheOp::CleanAll).unwrap();
        gem.cache_op(&CacheOp::FlushAll).unwrap();
        gem.cache_op(&CacheOp::Invalidate { addr: 0, len: 16 }).unwrap();
        let stats = gem.stats();
        assert_eq!(stats.clean_alls, 1);
        assert_eq!(stats.flush_alls, 1);
        assert_eq!(stats.invalidates, 1);
        assert_eq!(stats.cache_ops(), 3);
    }
}
