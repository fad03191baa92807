//! CPU mapping of a GEM object.

use crate::error::{Error, Result};
use rustix::fd::AsFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// A shared, read-write CPU mapping of a buffer.
///
/// The region is unmapped when the `Mapping` is dropped. Kernel backends
/// create mappings through [`Mapping::new`]; the pointer stays valid for the
/// lifetime of this value regardless of what happens to the descriptor it
/// was created from.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// Map `len` bytes of `fd` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Kernel`] if mmap fails (invalid fd, bad offset,
    /// insufficient permissions) and [`Error::InvalidArgument`] for `len == 0`.
    pub fn new<Fd: AsFd>(fd: Fd, len: usize, offset: u64) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument("cannot map an empty buffer".into()));
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                offset,
            )
            .map_err(|e| Error::kernel("mmap", e))?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        Ok(Self { ptr, len })
    }

    /// Start of the mapped region.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the mapped region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; empty mappings are rejected at creation.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the mapping as a byte slice.
    ///
    /// # Safety
    ///
    /// The buffer is shared with devices and other processes. The caller must
    /// ensure nobody writes to it for the lifetime of the slice.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes; caller guarantees no writers.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a mapping created by mmap in `new`.
        if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) } {
            tracing::error!(addr = ?self.ptr, len = self.len, "munmap failed: {}", e);
        }
    }
}

// SAFETY: the mapping is plain shared memory; the pointer may be used from
// any thread, and synchronization of the contents is the caller's job (that
// is what the fence lock is for).
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
