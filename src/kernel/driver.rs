//! Driver-specific ioctl vocabularies.
//!
//! The DRM core shares names, PRIME export and handle lifetime across all
//! drivers, but allocating an object and finding its mmap offset are
//! driver-private ioctls. [`DriverOps`] is that small vocabulary.

use super::drm::{DRM_COMMAND_BASE, DRM_IOCTL_BASE, ioctl, iowr};
use super::{CacheOp, GemHandle};
use crate::error::{Error, Result};
use rustix::fd::BorrowedFd;

/// Driver-private operations used by [`DrmDevice`](super::DrmDevice).
pub trait DriverOps: Send + Sync + 'static {
    /// Driver name (as reported by `drmGetVersion`).
    fn name(&self) -> &'static str;

    /// Allocate a GEM object of at least `size` bytes.
    fn create_bo(&self, drm: BorrowedFd<'_>, size: u32, flags: u32) -> Result<GemHandle>;

    /// Fake offset to pass to mmap on the DRM fd for `handle`.
    fn mmap_offset(&self, drm: BorrowedFd<'_>, handle: GemHandle) -> Result<u64>;

    /// Perform cache maintenance.
    ///
    /// Drivers without an explicit cache ioctl keep their buffers coherent
    /// (write-combined or snooped), so the default does nothing.
    fn cache_op(&self, _drm: BorrowedFd<'_>, op: &CacheOp) -> Result<()> {
        tracing::trace!(driver = self.name(), op = op.kind(), "no cache ioctl, skipping");
        Ok(())
    }
}

#[repr(C)]
struct DrmVc4CreateBo {
    size: u32,
    flags: u32,
    handle: u32,
    pad: u32,
}

#[repr(C)]
struct DrmVc4MmapBo {
    handle: u32,
    flags: u32,
    offset: u64,
}

const DRM_IOCTL_VC4_CREATE_BO: u32 =
    iowr::<DrmVc4CreateBo>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x03);
const DRM_IOCTL_VC4_MMAP_BO: u32 = iowr::<DrmVc4MmapBo>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x04);

/// Broadcom VideoCore IV (vc4) driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct Vc4;

impl DriverOps for Vc4 {
    fn name(&self) -> &'static str {
        "vc4"
    }

    fn create_bo(&self, drm: BorrowedFd<'_>, size: u32, flags: u32) -> Result<GemHandle> {
        let mut arg = DrmVc4CreateBo {
            size,
            flags,
            handle: 0,
            pad: 0,
        };
        // SAFETY: DrmVc4CreateBo is struct drm_vc4_create_bo.
        unsafe { ioctl(drm, DRM_IOCTL_VC4_CREATE_BO, &mut arg, "VC4_CREATE_BO")? };
        Ok(GemHandle(arg.handle))
    }

    fn mmap_offset(&self, drm: BorrowedFd<'_>, handle: GemHandle) -> Result<u64> {
        let mut arg = DrmVc4MmapBo {
            handle: handle.0,
            flags: 0,
            offset: 0,
        };
        // SAFETY: DrmVc4MmapBo is struct drm_vc4_mmap_bo.
        unsafe { ioctl(drm, DRM_IOCTL_VC4_MMAP_BO, &mut arg, "VC4_MMAP_BO")? };
        Ok(arg.offset)
    }

    /// Upstream vc4 has no cache-maintenance ioctl. Buffers are
    /// write-combined, but a caller asking for an explicit clean or
    /// invalidate must learn that none happened.
    fn cache_op(&self, _drm: BorrowedFd<'_>, op: &CacheOp) -> Result<()> {
        Err(Error::Unsupported(format!(
            "vc4 has no cache maintenance ioctl ({})",
            op.kind()
        )))
    }
}

#[repr(C)]
struct DrmModeCreateDumb {
    height: u32,
    width: u32,
    bpp: u32,
    flags: u32,
    handle: u32,
    pitch: u32,
    size: u64,
}

#[repr(C)]
struct DrmModeMapDumb {
    handle: u32,
    pad: u32,
    offset: u64,
}

const DRM_IOCTL_MODE_CREATE_DUMB: u32 = iowr::<DrmModeCreateDumb>(DRM_IOCTL_BASE, 0xb2);
const DRM_IOCTL_MODE_MAP_DUMB: u32 = iowr::<DrmModeMapDumb>(DRM_IOCTL_BASE, 0xb3);

/// Row width used to shape a linear allocation into a dumb buffer.
const DUMB_ROW_BYTES: u32 = 4096;

/// KMS dumb buffers: available on any modesetting driver.
///
/// A linear allocation of `size` bytes is requested as a 32 bpp surface of
/// 1024 pixels per row, rounded up to whole rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dumb;

impl DriverOps for Dumb {
    fn name(&self) -> &'static str {
        "dumb"
    }

    fn create_bo(&self, drm: BorrowedFd<'_>, size: u32, flags: u32) -> Result<GemHandle> {
        if size == 0 {
            return Err(Error::InvalidArgument("dumb buffer size must be non-zero".into()));
        }
        let mut arg = DrmModeCreateDumb {
            height: size.div_ceil(DUMB_ROW_BYTES),
            width: DUMB_ROW_BYTES / 4,
            bpp: 32,
            flags,
            handle: 0,
            pitch: 0,
            size: 0,
        };
        // SAFETY: DrmModeCreateDumb is struct drm_mode_create_dumb.
        unsafe { ioctl(drm, DRM_IOCTL_MODE_CREATE_DUMB, &mut arg, "MODE_CREATE_DUMB")? };
        tracing::trace!(
            handle = arg.handle,
            pitch = arg.pitch,
            size = arg.size,
            "created dumb buffer"
        );
        Ok(GemHandle(arg.handle))
    }

    fn mmap_offset(&self, drm: BorrowedFd<'_>, handle: GemHandle) -> Result<u64> {
        let mut arg = DrmModeMapDumb {
            handle: handle.0,
            pad: 0,
            offset: 0,
        };
        // SAFETY: DrmModeMapDumb is struct drm_mode_map_dumb.
        unsafe { ioctl(drm, DRM_IOCTL_MODE_MAP_DUMB, &mut arg, "MODE_MAP_DUMB")? };
        Ok(arg.offset)
    }
}
