//! Key/word storage shared by every process that tracks cache state.

use crate::error::Result;

/// Key reserved for the process-wide flush-generation counter.
///
/// Buffer keys are global names, which are 32-bit and never reach this
/// value in practice.
pub const GLOBAL_KEY: u32 = u32::MAX;

/// Out-of-process `key -> u32` storage.
///
/// Keys are reference counted: a key exists while at least one registrant
/// (typically one per process holding the buffer) has not unregistered it.
/// Implementations must make each individual call atomic with respect to
/// other callers on the same key, across processes.
pub trait CoherencyStore: Send + Sync {
    /// Register interest in `key`, creating it with value 0 if absent.
    fn register(&self, key: u32) -> Result<()>;

    /// Drop one registration of `key`. The key disappears with the last one.
    fn unregister(&self, key: u32) -> Result<()>;

    /// Read the word stored under `key`.
    fn get(&self, key: u32) -> Result<u32>;

    /// Overwrite the word stored under `key`.
    fn set(&self, key: u32, value: u32) -> Result<()>;
}
