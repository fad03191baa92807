//! CPU/device cache coherency tracking.
//!
//! Buffers shared between the CPU and cache-oblivious devices (GPU, codecs)
//! need explicit cache maintenance unless the kernel keeps them coherent
//! through dma-buf fences. This module decides *when* maintenance is needed:
//!
//! - Each buffer carries a [`CacheState`]: who wrote it last, whether the
//!   CPU has touched it, and the flush generation it was last saved under.
//! - A process-wide flush generation, kept under [`GLOBAL_KEY`], advances
//!   every time a full clean is issued. A CPU-dirtied buffer saved under an
//!   older generation has already been cleaned.
//! - States live in a [`CoherencyStore`] so cooperating processes agree.
//!
//! Two policies implement [`CoherencyPolicy`]: [`HardwareFencePolicy`] does
//! nothing (the kernel handles it), [`SoftwarePolicy`] runs the state
//! machine.

mod shm_store;
mod store;

pub use shm_store::{DEFAULT_CAPACITY, ShmStore};
pub use store::{CoherencyStore, GLOBAL_KEY};

use crate::device::{Access, Device};
use crate::kernel::GlobalName;
use std::sync::Arc;

/// Which device class last wrote a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LastWriter {
    /// Nobody, or the last access was a read.
    #[default]
    None,
    /// A device that goes through the CPU caches.
    CacheAware,
    /// A device that bypasses the CPU caches.
    CacheOblivious,
}

impl LastWriter {
    fn bits(self) -> u32 {
        match self {
            LastWriter::None => 0,
            LastWriter::CacheAware => 1,
            LastWriter::CacheOblivious => 2,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            1 => LastWriter::CacheAware,
            2 => LastWriter::CacheOblivious,
            _ => LastWriter::None,
        }
    }
}

/// Per-buffer cache state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheState {
    /// Global flush generation at the last save.
    pub flush_generation: u16,
    /// The CPU has accessed the buffer.
    pub cached: bool,
    /// Device class of the last writer.
    pub last_writer: LastWriter,
}

const CACHED_BIT: u32 = 1 << 16;
const WRITER_SHIFT: u32 = 17;

impl CacheState {
    /// Pack into the word kept in the store.
    pub fn encode(&self) -> u32 {
        let mut word = self.flush_generation as u32;
        if self.cached {
            word |= CACHED_BIT;
        }
        word | (self.last_writer.bits() << WRITER_SHIFT)
    }

    /// Unpack a word read from the store.
    pub fn decode(word: u32) -> Self {
        Self {
            flush_generation: word as u16,
            cached: word & CACHED_BIT != 0,
            last_writer: LastWriter::from_bits(word >> WRITER_SHIFT),
        }
    }
}

/// Cache maintenance required before a device may access a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Nothing to do.
    None,
    /// Invalidate the CPU's view of this buffer.
    Invalidate,
    /// Clean all CPU caches.
    CleanAll,
}

/// How a buffer entered this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOrigin {
    /// Freshly allocated: its state starts at zero.
    Allocated,
    /// Imported: another process may have persisted state already.
    Imported,
}

/// Coherency mode, resolved at manager creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoherencyMode {
    /// The kernel keeps buffers coherent and serializes access with fences.
    HardwareFence,
    /// Cache state is tracked here and maintenance issued explicitly.
    SoftwareTracked,
}

impl CoherencyMode {
    /// Short name for logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            CoherencyMode::HardwareFence => "hardware-fence",
            CoherencyMode::SoftwareTracked => "software",
        }
    }
}

impl std::fmt::Display for CoherencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy the buffer manager consults around map/unmap.
///
/// Failures never surface from a policy: the caller's allocation or
/// mapping proceeds, and the decision errs on the side of flushing.
pub trait CoherencyPolicy: Send + Sync {
    /// The mode this policy implements.
    fn mode(&self) -> CoherencyMode;

    /// Start tracking a buffer.
    fn init_state(&self, name: GlobalName, origin: StateOrigin);

    /// A map session is starting: update `state` for `device`/`access` and
    /// return the maintenance to perform.
    fn set_state(
        &self,
        name: GlobalName,
        state: &mut CacheState,
        device: Device,
        access: Access,
    ) -> FlushDecision;

    /// A map session ended: stamp the current generation and persist.
    fn save_state(&self, name: GlobalName, state: &mut CacheState);

    /// The process dropped its last reference to the buffer.
    fn destroy_state(&self, name: GlobalName);

    /// Whether unmapping after `last_device` requires a full flush.
    fn flush_on_unmap(&self, last_device: Option<Device>) -> bool;

    /// Release process-wide resources (the global generation key).
    fn shutdown(&self);
}

/// The kernel keeps caches coherent; every operation is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareFencePolicy;

impl CoherencyPolicy for HardwareFencePolicy {
    fn mode(&self) -> CoherencyMode {
        CoherencyMode::HardwareFence
    }

    fn init_state(&self, _name: GlobalName, _origin: StateOrigin) {}

    fn set_state(
        &self,
        _name: GlobalName,
        _state: &mut CacheState,
        _device: Device,
        _access: Access,
    ) -> FlushDecision {
        FlushDecision::None
    }

    fn save_state(&self, _name: GlobalName, _state: &mut CacheState) {}

    fn destroy_state(&self, _name: GlobalName) {}

    fn flush_on_unmap(&self, _last_device: Option<Device>) -> bool {
        false
    }

    fn shutdown(&self) {}
}

/// Software cache tracking backed by a shared [`CoherencyStore`].
pub struct SoftwarePolicy {
    store: Arc<dyn CoherencyStore>,
}

impl SoftwarePolicy {
    /// Create the policy and register the global generation key.
    pub fn new(store: Arc<dyn CoherencyStore>) -> crate::Result<Self> {
        store.register(GLOBAL_KEY)?;
        Ok(Self { store })
    }

    /// The store this policy persists into.
    pub fn store(&self) -> &Arc<dyn CoherencyStore> {
        &self.store
    }

    /// Current global flush generation, if readable.
    pub fn global_generation(&self) -> Option<u32> {
        match self.store.get(GLOBAL_KEY) {
            Ok(generation) => Some(generation),
            Err(e) => {
                tracing::warn!("cannot read global flush generation: {}", e);
                None
            }
        }
    }

    fn advance_generation(&self, current: Option<u32>) {
        let Some(current) = current else {
            return;
        };
        let next = current.wrapping_add(1);
        match self.store.set(GLOBAL_KEY, next) {
            Ok(()) => crate::observability::record_generation(next),
            Err(e) => tracing::warn!(generation = next, "cannot advance flush generation: {}", e),
        }
    }
}

impl CoherencyPolicy for SoftwarePolicy {
    fn mode(&self) -> CoherencyMode {
        CoherencyMode::SoftwareTracked
    }

    fn init_state(&self, name: GlobalName, origin: StateOrigin) {
        if let Err(e) = self.store.register(name.get()) {
            tracing::warn!(name = name.get(), "cannot register cache state: {}", e);
            return;
        }
        if origin == StateOrigin::Allocated {
            if let Err(e) = self.store.set(name.get(), 0) {
                tracing::warn!(name = name.get(), "cannot reset cache state: {}", e);
            }
        }
    }

    fn set_state(
        &self,
        name: GlobalName,
        state: &mut CacheState,
        device: Device,
        access: Access,
    ) -> FlushDecision {
        let stored = match self.store.get(name.get()) {
            Ok(word) => Some(CacheState::decode(word)),
            Err(e) => {
                tracing::warn!(name = name.get(), "cache state unreadable, flushing: {}", e);
                None
            }
        };
        let global = self.global_generation();

        let decision = match stored {
            Some(current) => {
                *state = current;
                if device.is_cache_aware() {
                    let decision = if state.last_writer == LastWriter::CacheOblivious && state.cached
                    {
                        FlushDecision::Invalidate
                    } else {
                        FlushDecision::None
                    };
                    state.cached = true;
                    if access.is_write() {
                        state.last_writer = LastWriter::CacheAware;
                    } else if state.last_writer != LastWriter::CacheAware {
                        state.last_writer = LastWriter::None;
                    }
                    decision
                } else {
                    // An unreadable global counter counts as "not flushed since".
                    let same_generation =
                        global.is_none_or(|g| g as u16 == state.flush_generation);
                    let decision = if state.last_writer == LastWriter::CacheAware
                        && state.cached
                        && same_generation
                    {
                        FlushDecision::CleanAll
                    } else {
                        FlushDecision::None
                    };
                    if access.is_write() {
                        state.last_writer = LastWriter::CacheOblivious;
                    } else if state.last_writer != LastWriter::CacheOblivious {
                        state.last_writer = LastWriter::None;
                    }
                    decision
                }
            }
            None if device.is_cache_aware() => {
                state.cached = true;
                if access.is_write() {
                    state.last_writer = LastWriter::CacheAware;
                }
                FlushDecision::Invalidate
            }
            None => {
                if access.is_write() {
                    state.last_writer = LastWriter::CacheOblivious;
                }
                FlushDecision::CleanAll
            }
        };

        if decision == FlushDecision::CleanAll {
            self.advance_generation(global);
        }

        tracing::trace!(
            name = name.get(),
            device = %device,
            access = %access,
            cached = state.cached,
            last_writer = ?state.last_writer,
            decision = ?decision,
            "cache state updated"
        );

        decision
    }

    fn save_state(&self, name: GlobalName, state: &mut CacheState) {
        if let Some(global) = self.global_generation() {
            state.flush_generation = global as u16;
        }
        if let Err(e) = self.store.set(name.get(), state.encode()) {
            tracing::warn!(name = name.get(), "cannot persist cache state: {}", e);
        }
    }

    fn destroy_state(&self, name: GlobalName) {
        if let Err(e) = self.store.unregister(name.get()) {
            tracing::warn!(name = name.get(), "cannot unregister cache state: {}", e);
        }
    }

    fn flush_on_unmap(&self, last_device: Option<Device>) -> bool {
        last_device == Some(Device::Cpu)
    }

    fn shutdown(&self) {
        if let Err(e) = self.store.unregister(GLOBAL_KEY) {
            tracing::warn!("cannot unregister global flush generation: {}", e);
        }
    }
}

impl std::fmt::Debug for SoftwarePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwarePolicy")
            .field("global_generation", &self.store.get(GLOBAL_KEY).ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(raw: u32) -> GlobalName {
        GlobalName::new(raw).unwrap()
    }

    fn policy() -> (Arc<ShmStore>, SoftwarePolicy) {
        let store = Arc::new(ShmStore::anonymous(64).unwrap());
        let policy = SoftwarePolicy::new(store.clone()).unwrap();
        (store, policy)
    }

    #[test]
    fn test_cache_state_packing() {
        let state = CacheState {
            flush_generation: 0x1234,
            cached: true,
            last_writer: LastWriter::CacheOblivious,
        };
        assert_eq!(state.encode(), 0x1234 | (1 << 16) | (2 << 17));
        assert_eq!(CacheState::decode(state.encode()), state);
        assert_eq!(CacheState::decode(0), CacheState::default());
    }

    #[test]
    fn test_hardware_policy_never_flushes() {
        let policy = HardwareFencePolicy;
        let mut state = CacheState::default();
        for device in [Device::Cpu, Device::ThreeD] {
            assert_eq!(
                policy.set_state(name(1), &mut state, device, Access::Write),
                FlushDecision::None
            );
        }
        assert!(!policy.flush_on_unmap(Some(Device::Cpu)));
        assert_eq!(state, CacheState::default());
    }

    #[test]
    fn test_cpu_write_then_gpu_read_cleans_once() {
        let (_store, policy) = policy();
        let n = name(3);
        policy.init_state(n, StateOrigin::Allocated);

        let mut state = CacheState::default();
        assert_eq!(
            policy.set_state(n, &mut state, Device::Cpu, Access::Write),
            FlushDecision::None
        );
        policy.save_state(n, &mut state);

        assert_eq!(
            policy.set_state(n, &mut state, Device::ThreeD, Access::Read),
            FlushDecision::CleanAll
        );
        assert_eq!(policy.global_generation(), Some(1));
        policy.save_state(n, &mut state);

        assert_eq!(
            policy.set_state(n, &mut state, Device::ThreeD, Access::Read),
            FlushDecision::None
        );
    }

    #[test]
    fn test_stale_generation_skips_clean() {
        let (store, policy) = policy();
        let n = name(4);
        policy.init_state(n, StateOrigin::Allocated);

        let mut state = CacheState::default();
        policy.set_state(n, &mut state, Device::Cpu, Access::Write);
        policy.save_state(n, &mut state);

        // Somebody else cleaned all caches in the meantime.
        store.set(GLOBAL_KEY, 5).unwrap();
        assert_eq!(
            policy.set_state(n, &mut state, Device::ThreeD, Access::Read),
            FlushDecision::None
        );
    }

    #[test]
    fn test_gpu_write_then_cpu_read_invalidates() {
        let (_store, policy) = policy();
        let n = name(5);
        policy.init_state(n, StateOrigin::Allocated);

        let mut state = CacheState::default();
        policy.set_state(n, &mut state, Device::Cpu, Access::Read);
        policy.save_state(n, &mut state);
        policy.set_state(n, &mut state, Device::ThreeD, Access::Write);
        policy.save_state(n, &mut state);

        assert_eq!(
            policy.set_state(n, &mut state, Device::Cpu, Access::Read),
            FlushDecision::Invalidate
        );
    }

    #[test]
    fn test_cpu_read_keeps_cache_aware() {
        let (_store, policy) = policy();
        let n = name(6);
        policy.init_state(n, StateOrigin::Allocated);

        let mut state = CacheState::default();
        policy.set_state(n, &mut state, Device::Cpu, Access::Write);
        policy.save_state(n, &mut state);
        policy.set_state(n, &mut state, Device::Cpu, Access::Read);
        assert_eq!(state.last_writer, LastWriter::CacheAware);
    }

    #[test]
    fn test_import_preserves_persisted_state() {
        let (store, policy) = policy();
        let n = name(7);
        policy.init_state(n, StateOrigin::Allocated);
        store.set(n.get(), 0x3_0000).unwrap();

        policy.init_state(n, StateOrigin::Imported);
        assert_eq!(store.get(n.get()).unwrap(), 0x3_0000);
        assert_eq!(store.refs(n.get()).unwrap(), 2);
    }

    #[test]
    fn test_unreadable_state_defaults_to_flush() {
        let (_store, policy) = policy();
        // Never registered: every read fails.
        let n = name(8);
        let mut state = CacheState::default();
        assert_eq!(
            policy.set_state(n, &mut state, Device::Cpu, Access::Read),
            FlushDecision::Invalidate
        );
        assert_eq!(
            policy.set_state(n, &mut state, Device::Multimedia, Access::Read),
            FlushDecision::CleanAll
        );
    }

    #[test]
    fn test_flush_on_unmap_only_after_cpu() {
        let (_store, policy) = policy();
        assert!(policy.flush_on_unmap(Some(Device::Cpu)));
        assert!(!policy.flush_on_unmap(Some(Device::ThreeD)));
        assert!(!policy.flush_on_unmap(None));
    }

    #[test]
    fn test_shutdown_releases_global_key() {
        let (store, policy) = policy();
        assert_eq!(store.refs(GLOBAL_KEY).unwrap(), 1);
        policy.shutdown();
        assert_eq!(store.refs(GLOBAL_KEY).unwrap(), 0);
    }
}
