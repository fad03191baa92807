//! Metrics collection using metrics-rs.
//!
//! The library only records; installing an exporter (Prometheus, statsd,
//! ...) is up to the host. Without a recorder every call is a no-op.

use metrics::{Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const BUFFERS_ALLOCATED: &str = "bufmgr_buffers_allocated";
const BYTES_ALLOCATED: &str = "bufmgr_bytes_allocated";
const BUFFERS_IMPORTED: &str = "bufmgr_buffers_imported";
const IMPORT_DEDUP_HITS: &str = "bufmgr_import_dedup_hits";
const BUFFERS_FREED: &str = "bufmgr_buffers_freed";
const CACHE_OPS: &str = "bufmgr_cache_ops";
const FENCE_ENTRIES_DROPPED: &str = "bufmgr_fence_entries_dropped";
const LIVE_OBJECTS: &str = "bufmgr_live_objects";
const FLUSH_GENERATION: &str = "bufmgr_flush_generation";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        BUFFERS_ALLOCATED,
        Unit::Count,
        "Buffer objects allocated from the kernel"
    );
    metrics::describe_counter!(BYTES_ALLOCATED, Unit::Bytes, "Bytes allocated from the kernel");
    metrics::describe_counter!(
        BUFFERS_IMPORTED,
        Unit::Count,
        "Buffer objects imported by name or descriptor"
    );
    metrics::describe_counter!(
        IMPORT_DEDUP_HITS,
        Unit::Count,
        "Imports answered from the handle registry"
    );
    metrics::describe_counter!(
        BUFFERS_FREED,
        Unit::Count,
        "Buffer objects whose last reference was freed"
    );
    metrics::describe_counter!(CACHE_OPS, Unit::Count, "Cache maintenance operations issued");
    metrics::describe_counter!(
        FENCE_ENTRIES_DROPPED,
        Unit::Count,
        "Locks not recorded because the fence queue was full"
    );
    metrics::describe_gauge!(LIVE_OBJECTS, Unit::Count, "Buffer objects in the registry");
    metrics::describe_gauge!(
        FLUSH_GENERATION,
        Unit::Count,
        "Global cache flush generation last written by this process"
    );
}

/// Record a kernel allocation.
#[inline]
pub fn record_allocated(backend: &str, bytes: usize) {
    counter!(BUFFERS_ALLOCATED, "backend" => backend.to_string()).increment(1);
    counter!(BYTES_ALLOCATED, "backend" => backend.to_string()).increment(bytes as u64);
}

/// Record an import; `source` is `"name"` or `"fd"`.
#[inline]
pub fn record_imported(source: &'static str, dedup_hit: bool) {
    if dedup_hit {
        counter!(IMPORT_DEDUP_HITS, "source" => source).increment(1);
    } else {
        counter!(BUFFERS_IMPORTED, "source" => source).increment(1);
    }
}

/// Record the release of a kernel handle.
#[inline]
pub fn record_freed() {
    counter!(BUFFERS_FREED).increment(1);
}

/// Record a cache maintenance request, labelled by kind.
#[inline]
pub fn record_cache_op(kind: &'static str) {
    counter!(CACHE_OPS, "kind" => kind).increment(1);
}

/// Record a lock dropped by a full fence queue.
#[inline]
pub fn record_fence_dropped() {
    counter!(FENCE_ENTRIES_DROPPED).increment(1);
}

/// Record the registry size.
#[inline]
pub fn record_live_objects(count: usize) {
    gauge!(LIVE_OBJECTS).set(count as f64);
}

/// Record a new global flush generation.
#[inline]
pub fn record_generation(generation: u32) {
    gauge!(FLUSH_GENERATION).set(generation as f64);
}
