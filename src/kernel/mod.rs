//! Kernel allocation interface.
//!
//! Everything the buffer manager needs from the kernel goes through the
//! [`GemKernel`] trait:
//!
//! - GEM object lifetime: create, open-by-name, close
//! - Sharing: flink names and PRIME dma-buf descriptors
//! - CPU access: mmap of a GEM object ([`Mapping`])
//! - Cache maintenance and dma-buf fences
//!
//! Two implementations are provided:
//!
//! - [`DrmDevice`]: real DRM ioctls on an open DRM node, parameterized by a
//!   small [`DriverOps`] vocabulary for the driver-specific create and mmap
//!   ioctls.
//! - [`SoftGem`]: a software emulation backed by memfd, for headless use and
//!   for tests.

mod driver;
mod drm;
mod mapping;
mod soft;

pub use driver::{DriverOps, Dumb, Vc4};
pub use drm::DrmDevice;
pub use mapping::Mapping;
pub use soft::{SoftGem, SoftGemStats, SoftOp};

use crate::error::Result;
use rustix::fd::{BorrowedFd, OwnedFd};
use std::fmt;
use std::num::NonZeroU32;

/// Process-local GEM handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GemHandle(pub u32);

impl fmt::Display for GemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global (flink) name of a GEM object, resolvable from any process.
///
/// The kernel never hands out name 0, so the name is stored as non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalName(NonZeroU32);

impl GlobalName {
    /// Wrap a raw flink name. Returns `None` for 0.
    #[inline]
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// The raw flink name.
    #[inline]
    pub fn get(&self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for GlobalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque kernel token for a pending dma-buf fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceContext(pub u64);

/// Access type attached to a dma-buf fence request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FenceAccess {
    /// DMA read.
    Read,
    /// DMA write.
    Write,
}

impl FenceAccess {
    /// `DMA_BUF_ACCESS_READ`.
    pub const READ_BIT: u32 = 0x1;
    /// `DMA_BUF_ACCESS_WRITE`.
    pub const WRITE_BIT: u32 = 0x2;
    /// `DMA_BUF_ACCESS_DMA`.
    pub const DMA_BIT: u32 = 0x4;

    /// The kernel's access bitmask for this fence type.
    #[inline]
    pub fn bits(&self) -> u32 {
        match self {
            FenceAccess::Read => Self::READ_BIT | Self::DMA_BIT,
            FenceAccess::Write => Self::WRITE_BIT | Self::DMA_BIT,
        }
    }
}

/// A cache maintenance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// Invalidate the CPU cache lines covering one mapping.
    Invalidate {
        /// Start of the CPU mapping.
        addr: usize,
        /// Length in bytes.
        len: usize,
    },
    /// Clean (write back) all CPU caches.
    CleanAll,
    /// Clean and invalidate all CPU caches.
    FlushAll,
}

impl CacheOp {
    /// Label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheOp::Invalidate { .. } => "invalidate",
            CacheOp::CleanAll => "clean_all",
            CacheOp::FlushAll => "flush_all",
        }
    }
}

/// The kernel operations a buffer manager is built on.
///
/// Every method may fail; a failure is a hard stop for the calling
/// lifecycle operation and is never retried at this level.
pub trait GemKernel: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Allocate a new GEM object of `size` bytes.
    fn create(&self, size: u32, flags: u32) -> Result<GemHandle>;

    /// Open the object behind a global name. Returns a new handle and the
    /// size the kernel reports for it.
    fn open_by_name(&self, name: GlobalName) -> Result<(GemHandle, u64)>;

    /// Drop a process-local handle.
    fn close(&self, handle: GemHandle) -> Result<()>;

    /// Resolve (creating if necessary) the global name of a handle.
    fn flink(&self, handle: GemHandle) -> Result<GlobalName>;

    /// Export a handle as a dma-buf descriptor.
    fn to_descriptor(&self, handle: GemHandle) -> Result<OwnedFd>;

    /// Import a dma-buf descriptor, returning this process's handle for it.
    fn from_descriptor(&self, fd: BorrowedFd<'_>) -> Result<GemHandle>;

    /// Map `size` bytes of a GEM object into the CPU address space.
    fn map(&self, handle: GemHandle, size: usize) -> Result<Mapping>;

    /// Perform cache maintenance.
    fn cache_op(&self, op: &CacheOp) -> Result<()>;

    /// Attach a fence of the given access type to a dma-buf.
    fn get_fence(&self, dmabuf: BorrowedFd<'_>, access: FenceAccess) -> Result<FenceContext>;

    /// Signal and release a fence previously obtained with `get_fence`.
    fn put_fence(
        &self,
        dmabuf: BorrowedFd<'_>,
        context: FenceContext,
        access: FenceAccess,
    ) -> Result<()>;
}
