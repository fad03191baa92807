//! Cross-process access serialization for shared buffers.
//!
//! A lock on a buffer is one of two things, depending on who asks:
//!
//! - 3D access with hardware fences: a dma-buf fence context obtained from
//!   the kernel, released with the same access type.
//! - CPU access (and 3D access when fences are not in use): a blocking POSIX
//!   record lock on the buffer's dma-buf descriptor, shared for readers and
//!   exclusive for writers.
//!
//! Each successful lock leaves an entry in the buffer's [`FenceQueue`];
//! `unlock` releases the oldest one. The descriptor is resolved under the
//! queue mutex and blocking kernel calls are made with it released. A lock
//! waiting in the kernel counts as in flight, so the queue is not idle and
//! the descriptor stays cached until the entry lands. When the queue is
//! full the new lock still succeeds but is not recorded.

use crate::bo::BufferObject;
use crate::coherency::CoherencyMode;
use crate::device::{Access, Device};
use crate::error::{Error, Result};
use crate::kernel::{FenceAccess, FenceContext, GemKernel};
use rustix::fd::{AsFd, OwnedFd};
use rustix::fs::FlockOperation;
use std::collections::VecDeque;

/// Maximum number of outstanding locks recorded per buffer.
pub const FENCE_QUEUE_CAPACITY: usize = 5;

/// One outstanding lock on a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceEntry {
    /// A kernel dma-buf fence.
    Fence {
        /// Kernel fence token.
        context: FenceContext,
        /// Access the fence was requested with.
        access: FenceAccess,
    },
    /// A POSIX record lock on the dma-buf descriptor.
    FileLock {
        /// Write lock (otherwise read lock).
        exclusive: bool,
    },
}

/// Bounded FIFO of outstanding locks.
#[derive(Debug, Default)]
pub struct FenceQueue {
    entries: VecDeque<FenceEntry>,
    in_flight: usize,
}

impl FenceQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(FENCE_QUEUE_CAPACITY),
            in_flight: 0,
        }
    }

    /// Append an entry. Returns `false` (and drops it) when full.
    pub fn push(&mut self, entry: FenceEntry) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    /// Remove the oldest entry.
    pub fn pop(&mut self) -> Option<FenceEntry> {
        self.entries.pop_front()
    }

    /// Number of outstanding entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no lock is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether another push would be dropped.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= FENCE_QUEUE_CAPACITY
    }

    /// Outstanding entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &FenceEntry> {
        self.entries.iter()
    }

    /// Whether nothing is outstanding and no lock is being acquired.
    pub fn is_idle(&self) -> bool {
        self.entries.is_empty() && self.in_flight == 0
    }

    fn begin_acquire(&mut self) {
        self.in_flight += 1;
    }

    fn end_acquire(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

/// Acquire a lock on `bo` for `device`/`access`.
pub(crate) fn lock(
    kernel: &dyn GemKernel,
    mode: CoherencyMode,
    bo: &BufferObject,
    device: Device,
    access: Access,
) -> Result<()> {
    if !matches!(device, Device::ThreeD | Device::Cpu) {
        tracing::debug!(device = %device, "lock not supported for device, ignoring");
        return Ok(());
    }
    if !access.is_read() && !access.is_write() {
        return Err(Error::InvalidArgument(format!(
            "lock needs read or write access, got {access}"
        )));
    }

    let dmabuf = {
        let mut fences = bo.fences();
        let dmabuf = bo.descriptor(kernel)?;
        fences.begin_acquire();
        dmabuf
    };

    let acquired = acquire(kernel, mode, bo, &dmabuf, device, access);
    let mut fences = bo.fences();
    fences.end_acquire();
    let entry = acquired?;
    let recorded = fences.push(entry);
    drop(fences);

    if !recorded {
        tracing::warn!(
            gem = %bo.handle(),
            name = bo.name().get(),
            capacity = FENCE_QUEUE_CAPACITY,
            "fence queue is full, dropping entry"
        );
        crate::observability::record_fence_dropped();
        // An unrecorded fence could never be put; give it back now. Record
        // locks stay: releasing one would release the recorded ones too.
        if let FenceEntry::Fence { context, access } = entry {
            if let Err(e) = kernel.put_fence(dmabuf.as_fd(), context, access) {
                tracing::warn!(gem = %bo.handle(), "cannot release dropped fence: {}", e);
            }
        }
        return Ok(());
    }

    tracing::debug!(
        gem = %bo.handle(),
        name = bo.name().get(),
        fd = ?dmabuf,
        device = %device,
        access = %access,
        "locked"
    );
    Ok(())
}

/// Take the kernel side of a lock. Blocks for record locks.
fn acquire(
    kernel: &dyn GemKernel,
    mode: CoherencyMode,
    bo: &BufferObject,
    dmabuf: &OwnedFd,
    device: Device,
    access: Access,
) -> Result<FenceEntry> {
    if device == Device::ThreeD && mode == CoherencyMode::HardwareFence {
        let fence_access = if access.is_write() {
            FenceAccess::Write
        } else {
            FenceAccess::Read
        };
        let context = kernel.get_fence(dmabuf.as_fd(), fence_access).inspect_err(|e| {
            tracing::error!(gem = %bo.handle(), "cannot get fence: {}", e);
        })?;
        Ok(FenceEntry::Fence {
            context,
            access: fence_access,
        })
    } else {
        let exclusive = access.is_write();
        let op = if exclusive {
            FlockOperation::LockExclusive
        } else {
            FlockOperation::LockShared
        };
        rustix::fs::fcntl_lock(dmabuf, op).map_err(|e| Error::kernel("F_SETLKW", e))?;
        Ok(FenceEntry::FileLock { exclusive })
    }
}

/// Release the oldest outstanding lock on `bo`, if any.
pub(crate) fn unlock(kernel: &dyn GemKernel, bo: &BufferObject) -> Result<()> {
    let (entry, dmabuf) = {
        let mut fences = bo.fences();
        if fences.is_empty() {
            return Ok(());
        }
        // The entry stays queued if the descriptor cannot be resolved.
        let dmabuf = bo.descriptor(kernel)?;
        let Some(entry) = fences.pop() else {
            return Ok(());
        };
        (entry, dmabuf)
    };
    match entry {
        FenceEntry::Fence { context, access } => {
            kernel
                .put_fence(dmabuf.as_fd(), context, access)
                .inspect_err(|e| tracing::error!(gem = %bo.handle(), "cannot put fence: {}", e))?;
        }
        FenceEntry::FileLock { .. } => {
            rustix::fs::fcntl_lock(&*dmabuf, FlockOperation::Unlock)
                .map_err(|e| Error::kernel("F_SETLKW", e))?;
        }
    }

    tracing::debug!(gem = %bo.handle(), name = bo.name().get(), entry = ?entry, "unlocked");
    Ok(())
}
