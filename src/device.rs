//! Access devices, access options and per-device buffer handles.

use std::fmt;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// A device class that maps or locks a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Default device; receives the raw GEM handle.
    Default,
    /// The CPU. The only cache-aware device class.
    Cpu,
    /// 2D blitter class; receives the raw GEM handle.
    TwoD,
    /// 3D/GPU class; receives a dma-buf descriptor.
    ThreeD,
    /// Multimedia (codec, camera) class; receives a dma-buf descriptor.
    Multimedia,
}

impl Device {
    /// Does this device participate in the CPU cache coherency domain?
    #[inline]
    pub fn is_cache_aware(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Short tag used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Default => "DEF",
            Device::Cpu => "CPU",
            Device::TwoD => "2D",
            Device::ThreeD => "3D",
            Device::Multimedia => "MM",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a device intends to access a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Access {
    /// No access declared.
    #[default]
    None,
    /// Read-only access.
    Read,
    /// Write-only access.
    Write,
    /// Read and write access.
    ReadWrite,
}

impl Access {
    /// Does this access include reading?
    #[inline]
    pub fn is_read(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    /// Does this access include writing?
    #[inline]
    pub fn is_write(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    /// Short tag used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::None => "NONE",
            Access::Read => "RD",
            Access::Write => "WR",
            Access::ReadWrite => "RDWR",
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device-specific handle to a buffer object.
///
/// `Ptr` and `Fd` borrow state owned by the buffer object: they stay valid
/// until the object is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoHandle {
    /// Raw GEM handle (default and 2D devices).
    Gem(u32),
    /// CPU virtual address of the shared mapping.
    Ptr(NonNull<u8>),
    /// dma-buf descriptor (3D and multimedia devices).
    Fd(RawFd),
}

impl BoHandle {
    /// The CPU pointer, if this is a CPU handle.
    pub fn as_ptr(&self) -> Option<*mut u8> {
        match self {
            BoHandle::Ptr(ptr) => Some(ptr.as_ptr()),
            _ => None,
        }
    }

    /// The descriptor, if this is a dma-buf handle.
    pub fn as_fd(&self) -> Option<RawFd> {
        match self {
            BoHandle::Fd(fd) => Some(*fd),
            _ => None,
        }
    }

    /// The GEM handle, if this is a GEM handle.
    pub fn as_gem(&self) -> Option<u32> {
        match self {
            BoHandle::Gem(handle) => Some(*handle),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_flags() {
        assert!(!Access::None.is_read());
        assert!(!Access::None.is_write());
        assert!(Access::Read.is_read());
        assert!(!Access::Read.is_write());
        assert!(Access::Write.is_write());
        assert!(Access::ReadWrite.is_read() && Access::ReadWrite.is_write());
    }

    #[test]
    fn test_only_cpu_is_cache_aware() {
        assert!(Device::Cpu.is_cache_aware());
        for device in [
            Device::Default,
            Device::TwoD,
            Device::ThreeD,
            Device::Multimedia,
        ] {
            assert!(!device.is_cache_aware(), "{device} should be cache-oblivious");
        }
    }

    #[test]
    fn test_handle_accessors() {
        assert_eq!(BoHandle::Gem(7).as_gem(), Some(7));
        assert_eq!(BoHandle::Fd(3).as_fd(), Some(3));
        assert!(BoHandle::Gem(7).as_ptr().is_none());
    }
}
