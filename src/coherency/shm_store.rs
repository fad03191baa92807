//! Shared-memory implementation of [`CoherencyStore`].
//!
//! The store is a fixed-capacity open-addressing hash table living in a
//! shared mapping, so every process that maps the same file (or receives the
//! same memfd) sees the same words.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ StoreHeader (64 bytes)                                       │
//! │ magic: u64 │ version: u32 │ capacity: u32 │ len: u32         │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Slot[0..capacity] (16 bytes each)                            │
//! │ key: u32 (0 = empty) │ refs: u32 │ value: u32 │ _pad: u32    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Locking
//!
//! Every operation runs under an in-process mutex, for threads sharing one
//! instance, and an exclusive `flock` on the backing descriptor, for other
//! instances and other processes. `flock` locks belong to the open file
//! description, so every instance owns a description of its own:
//! [`ShmStore::from_fd`] reopens the descriptor it is given. Deletion uses
//! backward shifting so lookups never need tombstones.

use super::store::CoherencyStore;
use crate::error::{Error, Result};
use crate::kernel::Mapping;
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::{FlockOperation, Mode, OFlags};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Magic number identifying a store file.
const STORE_MAGIC: u64 = 0x4246_4d47_5f43_4f48; // "BFMG_COH"

/// Current store format version.
const STORE_VERSION: u32 = 1;

/// Default number of slots.
pub const DEFAULT_CAPACITY: u32 = 4096;

/// Marks an empty slot. Key 0 is never a valid global name.
const EMPTY_KEY: u32 = 0;

#[repr(C, align(64))]
struct StoreHeader {
    magic: AtomicU64,
    version: AtomicU32,
    capacity: AtomicU32,
    len: AtomicU32,
    _reserved: [u8; 44],
}

#[repr(C, align(16))]
struct Slot {
    key: AtomicU32,
    refs: AtomicU32,
    value: AtomicU32,
    _pad: u32,
}

fn layout_size(capacity: u32) -> usize {
    std::mem::size_of::<StoreHeader>() + std::mem::size_of::<Slot>() * capacity as usize
}

/// Home slot of `key` (Fibonacci hashing).
fn home(key: u32, capacity: u32) -> u32 {
    ((key.wrapping_mul(0x9e37_79b9) as u64 * capacity as u64) >> 32) as u32
}

/// Cross-process coherency store in a shared mapping.
///
/// # Example
///
/// ```rust,ignore
/// use bufmgr::coherency::{CoherencyStore, ShmStore};
///
/// let store = ShmStore::open("/dev/shm/bufmgr-coherency", 4096)?;
/// store.register(42)?;
/// store.set(42, 0x1_0003)?;
/// assert_eq!(store.get(42)?, 0x1_0003);
/// ```
pub struct ShmStore {
    fd: OwnedFd,
    mapping: Mapping,
    capacity: u32,
    lock: Mutex<()>,
}

impl ShmStore {
    /// Open (creating and initializing if empty) a file-backed store.
    ///
    /// `capacity` is only used when the file is created; an existing store
    /// keeps its own capacity.
    pub fn open(path: impl AsRef<Path>, capacity: u32) -> Result<Self> {
        let path = path.as_ref();
        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::CLOEXEC,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| Error::Store(format!("cannot open {}: {e}", path.display())))?;

        tracing::debug!(path = %path.display(), capacity, "opening coherency store");
        Self::attach(fd, Some(capacity))
    }

    /// Create a private store backed by an anonymous memfd.
    ///
    /// Other processes can join it through [`ShmStore::from_fd`] after the
    /// descriptor has been passed to them.
    pub fn anonymous(capacity: u32) -> Result<Self> {
        let fd = rustix::fs::memfd_create("bufmgr-coherency", rustix::fs::MemfdFlags::CLOEXEC)?;
        Self::attach(fd, Some(capacity))
    }

    /// Join an existing store from a received descriptor.
    ///
    /// The descriptor is reopened through `/proc/self/fd` so this instance
    /// locks independently of whoever else holds the same description.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let path = format!("/proc/self/fd/{}", fd.as_raw_fd());
        let fd = match rustix::fs::open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()) {
            Ok(reopened) => reopened,
            Err(e) => {
                tracing::warn!(path = %path, "cannot reopen store descriptor, sharing its lock: {}", e);
                fd
            }
        };
        Self::attach(fd, None)
    }

    fn attach(fd: OwnedFd, create_capacity: Option<u32>) -> Result<Self> {
        rustix::fs::flock(&fd, FlockOperation::LockExclusive)
            .map_err(|e| Error::Store(format!("cannot lock store: {e}")))?;
        let result = Self::attach_locked(fd.as_fd(), create_capacity);
        if let Err(e) = rustix::fs::flock(&fd, FlockOperation::Unlock) {
            tracing::error!("failed to unlock coherency store: {}", e);
        }
        let (mapping, capacity) = result?;

        Ok(Self {
            fd,
            mapping,
            capacity,
            lock: Mutex::new(()),
        })
    }

    fn attach_locked(fd: BorrowedFd<'_>, create_capacity: Option<u32>) -> Result<(Mapping, u32)> {
        let file_size = rustix::fs::fstat(fd)?.st_size as usize;

        if file_size == 0 {
            let capacity = create_capacity
                .ok_or_else(|| Error::Store("store descriptor is empty".into()))?;
            if capacity == 0 {
                return Err(Error::Store("store capacity must be > 0".into()));
            }
            let size = layout_size(capacity);
            rustix::fs::ftruncate(fd, size as u64)?;
            let mapping = Mapping::new(fd, size, 0)?;

            // SAFETY: the mapping is at least one header long and page
            // aligned; the file was just sized by us under the lock.
            let header = unsafe { &*mapping.as_ptr().as_ptr().cast::<StoreHeader>() };
            header.version.store(STORE_VERSION, Ordering::Release);
            header.capacity.store(capacity, Ordering::Release);
            header.len.store(0, Ordering::Release);
            header.magic.store(STORE_MAGIC, Ordering::Release);

            tracing::debug!(capacity, size, "initialized coherency store");
            return Ok((mapping, capacity));
        }

        if file_size < std::mem::size_of::<StoreHeader>() {
            return Err(Error::Store(format!("store too small: {file_size} bytes")));
        }

        let probe = Mapping::new(fd, std::mem::size_of::<StoreHeader>(), 0)?;
        // SAFETY: `probe` covers exactly one header.
        let header = unsafe { &*probe.as_ptr().as_ptr().cast::<StoreHeader>() };
        let magic = header.magic.load(Ordering::Acquire);
        if magic != STORE_MAGIC {
            return Err(Error::Store(format!(
                "invalid store magic: expected {STORE_MAGIC:x}, got {magic:x}"
            )));
        }
        let version = header.version.load(Ordering::Acquire);
        if version != STORE_VERSION {
            return Err(Error::Store(format!(
                "unsupported store version: expected {STORE_VERSION}, got {version}"
            )));
        }
        let capacity = header.capacity.load(Ordering::Acquire);
        let size = layout_size(capacity);
        if capacity == 0 || file_size < size {
            return Err(Error::Store(format!(
                "store capacity {capacity} does not fit in {file_size} bytes"
            )));
        }
        drop(probe);

        Ok((Mapping::new(fd, size, 0)?, capacity))
    }

    /// Number of slots in the table.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of registered keys.
    pub fn len(&self) -> u32 {
        self.header().len.load(Ordering::Acquire)
    }

    /// Whether no key is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current registration count of `key` (0 if absent).
    pub fn refs(&self, key: u32) -> Result<u32> {
        self.locked(|| Ok(self.find(key).map_or(0, |i| self.slot(i).refs.load(Ordering::Acquire))))
    }

    fn header(&self) -> &StoreHeader {
        // SAFETY: the mapping starts with a validated header.
        unsafe { &*self.mapping.as_ptr().as_ptr().cast::<StoreHeader>() }
    }

    fn slot(&self, index: u32) -> &Slot {
        debug_assert!(index < self.capacity);
        // SAFETY: the mapping holds `capacity` slots after the header.
        unsafe {
            &*self
                .mapping
                .as_ptr()
                .as_ptr()
                .add(std::mem::size_of::<StoreHeader>())
                .cast::<Slot>()
                .add(index as usize)
        }
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        rustix::fs::flock(&self.fd, FlockOperation::LockExclusive)
            .map_err(|e| Error::Store(format!("cannot lock store: {e}")))?;
        let result = f();
        if let Err(e) = rustix::fs::flock(&self.fd, FlockOperation::Unlock) {
            tracing::error!("failed to unlock coherency store: {}", e);
        }
        result
    }

    fn check_key(key: u32) -> Result<()> {
        if key == EMPTY_KEY {
            return Err(Error::Store("key 0 is reserved".into()));
        }
        Ok(())
    }

    /// Index of `key`, or `None` if absent. Caller holds the lock.
    fn find(&self, key: u32) -> Option<u32> {
        let mut index = home(key, self.capacity);
        for _ in 0..self.capacity {
            match self.slot(index).key.load(Ordering::Acquire) {
                EMPTY_KEY => return None,
                k if k == key => return Some(index),
                _ => index = (index + 1) % self.capacity,
            }
        }
        None
    }

    /// Remove the slot at `index`, shifting later members of its probe
    /// chain back so lookups stay correct. Caller holds the lock.
    fn remove_at(&self, mut hole: u32) {
        let mut next = hole;
        loop {
            next = (next + 1) % self.capacity;
            let slot = self.slot(next);
            let key = slot.key.load(Ordering::Acquire);
            if key == EMPTY_KEY {
                break;
            }

            let desired = home(key, self.capacity);
            // Distance from the desired slot, measured along the probe order.
            let dist_hole = (hole + self.capacity - desired) % self.capacity;
            let dist_next = (next + self.capacity - desired) % self.capacity;
            if dist_hole < dist_next {
                let target = self.slot(hole);
                target.key.store(key, Ordering::Release);
                target.refs.store(slot.refs.load(Ordering::Acquire), Ordering::Release);
                target.value.store(slot.value.load(Ordering::Acquire), Ordering::Release);
                hole = next;
            }
        }

        let slot = self.slot(hole);
        slot.key.store(EMPTY_KEY, Ordering::Release);
        slot.refs.store(0, Ordering::Release);
        slot.value.store(0, Ordering::Release);
        self.header().len.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CoherencyStore for ShmStore {
    fn register(&self, key: u32) -> Result<()> {
        Self::check_key(key)?;
        self.locked(|| {
            let mut index = home(key, self.capacity);
            for _ in 0..self.capacity {
                let slot = self.slot(index);
                match slot.key.load(Ordering::Acquire) {
                    EMPTY_KEY => {
                        slot.refs.store(1, Ordering::Release);
                        slot.value.store(0, Ordering::Release);
                        slot.key.store(key, Ordering::Release);
                        self.header().len.fetch_add(1, Ordering::AcqRel);
                        return Ok(());
                    }
                    k if k == key => {
                        slot.refs.fetch_add(1, Ordering::AcqRel);
                        return Ok(());
                    }
                    _ => index = (index + 1) % self.capacity,
                }
            }
            Err(Error::Store(format!(
                "store full ({} slots), cannot register key {key}",
                self.capacity
            )))
        })
    }

    fn unregister(&self, key: u32) -> Result<()> {
        Self::check_key(key)?;
        self.locked(|| {
            let index = self
                .find(key)
                .ok_or_else(|| Error::Store(format!("unregister of unknown key {key}")))?;
            if self.slot(index).refs.fetch_sub(1, Ordering::AcqRel) <= 1 {
                self.remove_at(index);
            }
            Ok(())
        })
    }

    fn get(&self, key: u32) -> Result<u32> {
        Self::check_key(key)?;
        self.locked(|| {
            self.find(key)
                .map(|i| self.slot(i).value.load(Ordering::Acquire))
                .ok_or_else(|| Error::Store(format!("get of unknown key {key}")))
        })
    }

    fn set(&self, key: u32, value: u32) -> Result<()> {
        Self::check_key(key)?;
        self.locked(|| {
            let index = self
                .find(key)
                .ok_or_else(|| Error::Store(format!("set of unknown key {key}")))?;
            self.slot(index).value.store(value, Ordering::Release);
            Ok(())
        })
    }
}

impl AsFd for ShmStore {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for ShmStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmStore")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
