//! # bufmgr
//!
//! A GEM/dma-buf buffer-object manager for Linux graphics stacks.
//!
//! bufmgr allocates, imports, exports, maps and releases graphics memory
//! backed by kernel DMA buffers, and keeps CPU and device cache views
//! coherent when several processes and devices touch the same buffer.
//!
//! ## Features
//!
//! - **One object per name**: importing a global name or a dma-buf twice
//!   yields the same reference-counted object
//! - **Cache coherency tracking**: last-writer/flush-generation state shared
//!   across processes through a shared-memory store
//! - **Fence locks**: dma-buf fences or POSIX record locks, per access
//! - **Pluggable kernel**: real DRM nodes (`vc4`, KMS dumb buffers) or a
//!   memfd emulation for headless use and tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bufmgr::prelude::*;
//!
//! let manager = BufferManager::open(&BufMgrConfig::from_env()?, Vc4)?;
//!
//! let bo = manager.allocate(1920 * 1080 * 4, 0)?;
//! manager.lock(&bo, Device::Cpu, Access::Write)?;
//! let ptr = manager.map(&bo, Device::Cpu, Access::Write)?;
//! // ... draw into ptr ...
//! manager.unmap(&bo)?;
//! manager.unlock(&bo)?;
//!
//! // Hand the name to another process, which calls manager.import(name).
//! let name = manager.export(&bo)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bo;
pub mod coherency;
pub mod config;
pub mod device;
pub mod error;
pub mod fence;
pub mod kernel;
pub mod manager;
pub mod observability;
pub mod registry;
pub mod surface;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bo::BufferObject;
    pub use crate::coherency::{CoherencyMode, ShmStore, SoftwarePolicy};
    pub use crate::config::{BufMgrConfig, CoherencySetting, ProcessRole};
    pub use crate::device::{Access, BoHandle, Device};
    pub use crate::error::{Error, Result};
    pub use crate::kernel::{DrmDevice, Dumb, GemKernel, GlobalName, SoftGem, Vc4};
    pub use crate::manager::BufferManager;
}

pub use error::{Error, Result};
