//! DRM GEM backend.
//!
//! Implements [`GemKernel`] with the generic GEM/PRIME ioctls of the DRM
//! core. The two ioctls whose shape differs per driver (object creation and
//! mmap offset lookup) are delegated to a [`DriverOps`] implementation.

use super::driver::DriverOps;
use super::{CacheOp, FenceAccess, FenceContext, GemHandle, GemKernel, GlobalName, Mapping};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};

// linux/ioctl.h direction bits.
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc<T>(dir: u32, ty: u8, nr: u8) -> u32 {
    let size = std::mem::size_of::<T>() as u32;
    (dir << 30) | (size << 16) | ((ty as u32) << 8) | (nr as u32)
}

/// `_IOW(ty, nr, T)`.
pub(super) const fn iow<T>(ty: u8, nr: u8) -> u32 {
    ioc::<T>(IOC_WRITE, ty, nr)
}

/// `_IOWR(ty, nr, T)`.
pub(super) const fn iowr<T>(ty: u8, nr: u8) -> u32 {
    ioc::<T>(IOC_READ | IOC_WRITE, ty, nr)
}

/// DRM ioctl type byte.
pub(super) const DRM_IOCTL_BASE: u8 = b'd';

/// First driver-private DRM ioctl number.
pub(super) const DRM_COMMAND_BASE: u8 = 0x40;

#[repr(C)]
struct DrmGemClose {
    handle: u32,
    pad: u32,
}

#[repr(C)]
struct DrmGemFlink {
    handle: u32,
    name: u32,
}

#[repr(C)]
struct DrmGemOpen {
    name: u32,
    handle: u32,
    size: u64,
}

#[repr(C)]
struct DrmPrimeHandle {
    handle: u32,
    flags: u32,
    fd: i32,
}

#[repr(C)]
struct DmaBufFence {
    ctx: libc::c_ulong,
    type_: u32,
}

const DRM_IOCTL_GEM_CLOSE: u32 = iow::<DrmGemClose>(DRM_IOCTL_BASE, 0x09);
const DRM_IOCTL_GEM_FLINK: u32 = iowr::<DrmGemFlink>(DRM_IOCTL_BASE, 0x0a);
const DRM_IOCTL_GEM_OPEN: u32 = iowr::<DrmGemOpen>(DRM_IOCTL_BASE, 0x0b);
const DRM_IOCTL_PRIME_HANDLE_TO_FD: u32 = iowr::<DrmPrimeHandle>(DRM_IOCTL_BASE, 0x2d);
const DRM_IOCTL_PRIME_FD_TO_HANDLE: u32 = iowr::<DrmPrimeHandle>(DRM_IOCTL_BASE, 0x2e);

const DMABUF_IOCTL_BASE: u8 = b'F';
const DMABUF_IOCTL_GET_FENCE: u32 = iowr::<DmaBufFence>(DMABUF_IOCTL_BASE, 0x01);
const DMABUF_IOCTL_PUT_FENCE: u32 = iowr::<DmaBufFence>(DMABUF_IOCTL_BASE, 0x02);

const DRM_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
const DRM_RDWR: u32 = libc::O_RDWR as u32;

/// Issue an ioctl, retrying on `EINTR`/`EAGAIN` the way libdrm does.
///
/// # Safety
///
/// `arg` must be the `#[repr(C)]` argument type the kernel expects for
/// `request`.
pub(super) unsafe fn ioctl<T>(
    fd: BorrowedFd<'_>,
    request: u32,
    arg: &mut T,
    op: &'static str,
) -> Result<()> {
    loop {
        // SAFETY: caller guarantees `arg` matches `request`; the kernel does
        // not retain the pointer past the call.
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg as *mut T) };
        if ret != -1 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => return Err(Error::Kernel { op, source: err }),
        }
    }
}

/// A DRM device node driven through the GEM ioctls.
///
/// # Example
///
/// ```rust,ignore
/// use bufmgr::kernel::{DrmDevice, Vc4};
///
/// let drm = DrmDevice::open("/dev/dri/card0", Vc4)?;
/// ```
pub struct DrmDevice<D: DriverOps> {
    fd: OwnedFd,
    driver: D,
    path: Option<PathBuf>,
}

impl<D: DriverOps> DrmDevice<D> {
    /// Open a DRM node read-write.
    pub fn open(path: impl AsRef<Path>, driver: D) -> Result<Self> {
        let path = path.as_ref();
        let fd = rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| Error::kernel("open drm node", e))?;

        tracing::debug!(path = %path.display(), driver = driver.name(), "opened DRM device");

        Ok(Self {
            fd,
            driver,
            path: Some(path.to_path_buf()),
        })
    }

    /// Wrap an already-open DRM descriptor (e.g. the display server's
    /// master fd handed over by the host).
    pub fn from_fd(fd: OwnedFd, driver: D) -> Self {
        Self {
            fd,
            driver,
            path: None,
        }
    }

    /// The node this device was opened from, if known.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The driver vocabulary in use.
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: DriverOps> AsFd for DrmDevice<D> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl<D: DriverOps> GemKernel for DrmDevice<D> {
    fn name(&self) -> &str {
        self.driver.name()
    }

    fn create(&self, size: u32, flags: u32) -> Result<GemHandle> {
        self.driver.create_bo(self.fd.as_fd(), size, flags)
    }

    fn open_by_name(&self, name: GlobalName) -> Result<(GemHandle, u64)> {
        let mut arg = DrmGemOpen {
            name: name.get(),
            handle: 0,
            size: 0,
        };
        // SAFETY: DrmGemOpen is struct drm_gem_open.
        unsafe { ioctl(self.fd.as_fd(), DRM_IOCTL_GEM_OPEN, &mut arg, "GEM_OPEN")? };
        Ok((GemHandle(arg.handle), arg.size))
    }

    fn close(&self, handle: GemHandle) -> Result<()> {
        let mut arg = DrmGemClose {
            handle: handle.0,
            pad: 0,
        };
        // SAFETY: DrmGemClose is struct drm_gem_close.
        unsafe { ioctl(self.fd.as_fd(), DRM_IOCTL_GEM_CLOSE, &mut arg, "GEM_CLOSE") }
    }

    fn flink(&self, handle: GemHandle) -> Result<GlobalName> {
        let mut arg = DrmGemFlink {
            handle: handle.0,
            name: 0,
        };
        // SAFETY: DrmGemFlink is struct drm_gem_flink.
        unsafe { ioctl(self.fd.as_fd(), DRM_IOCTL_GEM_FLINK, &mut arg, "GEM_FLINK")? };
        GlobalName::new(arg.name).ok_or_else(|| {
            Error::InvariantViolation(format!("GEM_FLINK returned name 0 for gem {handle}"))
        })
    }

    fn to_descriptor(&self, handle: GemHandle) -> Result<OwnedFd> {
        let mut arg = DrmPrimeHandle {
            handle: handle.0,
            flags: DRM_CLOEXEC | DRM_RDWR,
            fd: -1,
        };
        // SAFETY: DrmPrimeHandle is struct drm_prime_handle.
        unsafe {
            ioctl(
                self.fd.as_fd(),
                DRM_IOCTL_PRIME_HANDLE_TO_FD,
                &mut arg,
                "PRIME_HANDLE_TO_FD",
            )?
        };
        if arg.fd < 0 {
            return Err(Error::InvariantViolation(format!(
                "PRIME_HANDLE_TO_FD returned fd {} for gem {handle}",
                arg.fd
            )));
        }
        // SAFETY: on success the kernel installed a fresh descriptor that
        // nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(arg.fd) })
    }

    fn from_descriptor(&self, fd: BorrowedFd<'_>) -> Result<GemHandle> {
        let mut arg = DrmPrimeHandle {
            handle: 0,
            flags: 0,
            fd: fd.as_raw_fd(),
        };
        // SAFETY: DrmPrimeHandle is struct drm_prime_handle.
        unsafe {
            ioctl(
                self.fd.as_fd(),
                DRM_IOCTL_PRIME_FD_TO_HANDLE,
                &mut arg,
                "PRIME_FD_TO_HANDLE",
            )?
        };
        Ok(GemHandle(arg.handle))
    }

    fn map(&self, handle: GemHandle, size: usize) -> Result<Mapping> {
        let offset = self.driver.mmap_offset(self.fd.as_fd(), handle)?;
        Mapping::new(&self.fd, size, offset)
    }

    fn cache_op(&self, op: &CacheOp) -> Result<()> {
        self.driver.cache_op(self.fd.as_fd(), op)
    }

    fn get_fence(&self, dmabuf: BorrowedFd<'_>, access: FenceAccess) -> Result<FenceContext> {
        let mut fence = DmaBufFence {
            ctx: 0,
            type_: access.bits(),
        };
        // SAFETY: DmaBufFence is struct dma_buf_fence.
        unsafe { ioctl(dmabuf, DMABUF_IOCTL_GET_FENCE, &mut fence, "DMABUF_GET_FENCE")? };
        Ok(FenceContext(fence.ctx as u64))
    }

    fn put_fence(
        &self,
        dmabuf: BorrowedFd<'_>,
        context: FenceContext,
        access: FenceAccess,
    ) -> Result<()> {
        let mut fence = DmaBufFence {
            ctx: context.0 as libc::c_ulong,
            type_: access.bits(),
        };
        // SAFETY: DmaBufFence is struct dma_buf_fence.
        unsafe { ioctl(dmabuf, DMABUF_IOCTL_PUT_FENCE, &mut fence, "DMABUF_PUT_FENCE") }
    }
}

impl<D: DriverOps> std::fmt::Debug for DrmDevice<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmDevice")
            .field("fd", &self.fd.as_raw_fd())
            .field("driver", &self.driver.name())
            .field("path", &self.path)
            .finish()
    }
}
