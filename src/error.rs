//! Error types for bufmgr.

use crate::kernel::GlobalName;
use thiserror::Error;

/// Result type alias using bufmgr's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer-manager operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A kernel call (ioctl, mmap, prime export/import) failed.
    #[error("kernel call {op} failed: {source}")]
    Kernel {
        /// Name of the failing kernel operation.
        op: &'static str,
        /// The OS error reported by the kernel.
        #[source]
        source: std::io::Error,
    },

    /// Memory allocation failed.
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    /// Caller passed an argument the operation cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `unmap` was called on a buffer with no live map session.
    #[error("buffer is not mapped")]
    NotMapped,

    /// The buffer object has already been released.
    #[error("buffer object has been freed")]
    Freed,

    /// The manager context has been shut down.
    #[error("buffer manager is not initialized")]
    NotInitialized,

    /// Another object is already registered under this global name.
    #[error("global name {0} is already bound to a different buffer object")]
    NameCollision(GlobalName),

    /// Internal bookkeeping is inconsistent (double free and the like).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The coherency shared store rejected an operation.
    #[error("coherency store error: {0}")]
    Store(String),

    /// The operation is not supported by this backend.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Build a [`Error::Kernel`] from a rustix errno.
    pub(crate) fn kernel(op: &'static str, errno: rustix::io::Errno) -> Self {
        Error::Kernel {
            op,
            source: errno.into(),
        }
    }
}
