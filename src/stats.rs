//! Operation statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and
//! not used as synchronization primitives. The data structures' own CAS
//! protocols provide the ordering guarantees for correctness; these
//! counters are purely for monitoring.
//!
//! # Usage
//!
//! ```ignore
//! let snap = lfkit::stats::snapshot();
//! println!("pin scans: {}", snap.pin_scans);
//! ```
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! individually atomic but not globally consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- PinBox / slab ----
    /// Purgatory scans (`real_free` invocations).
    pub pin_scans: AtomicU64,
    /// Objects handed back to the slab free stack after a scan.
    pub pin_frees: AtomicU64,
    /// Objects kept in a purgatory because some thread had them pinned.
    pub pin_survivors: AtomicU64,
    /// Fresh heap allocations made by slab allocators.
    pub slab_mallocs: AtomicU64,

    // ---- Limbo (RCU) ----
    /// Handles created (epoch advances).
    pub limbo_handles: AtomicU64,
    /// Retired pointers physically freed by `clean_until`.
    pub limbo_frees: AtomicU64,
    /// Retired pointers recycled into a per-thread pool.
    pub limbo_pooled: AtomicU64,
    /// RCU callbacks invoked during reclamation.
    pub limbo_callbacks: AtomicU64,

    // ---- WFMCAS ----
    /// Descriptors published to the pending-op table after MAX_FAIL tries.
    pub mcas_publishes: AtomicU64,
    /// help_complete calls made on behalf of other workers.
    pub mcas_helps: AtomicU64,

    // ---- Hash map / Masstree ----
    /// Hash-map bucket dummies created.
    pub hash_buckets: AtomicU64,
    /// Hash-map logical size doublings.
    pub hash_resizes: AtomicU64,
    /// Masstree leaf and internode splits.
    pub mt_splits: AtomicU64,
    /// Masstree sub-layers created on ikey collisions.
    pub mt_layers: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            pin_scans: AtomicU64::new(0),
            pin_frees: AtomicU64::new(0),
            pin_survivors: AtomicU64::new(0),
            slab_mallocs: AtomicU64::new(0),
            limbo_handles: AtomicU64::new(0),
            limbo_frees: AtomicU64::new(0),
            limbo_pooled: AtomicU64::new(0),
            limbo_callbacks: AtomicU64::new(0),
            mcas_publishes: AtomicU64::new(0),
            mcas_helps: AtomicU64::new(0),
            hash_buckets: AtomicU64::new(0),
            hash_resizes: AtomicU64::new(0),
            mt_splits: AtomicU64::new(0),
            mt_layers: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all operation statistics.
///
/// Fields are plain `u64` values loaded from the global atomic counters.
/// Individual fields are each atomically read, but the snapshot as a whole
/// is not globally consistent — concurrent operations may race between
/// loads. For monitoring purposes this is always sufficient.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub pin_scans: u64,
    pub pin_frees: u64,
    pub pin_survivors: u64,
    pub slab_mallocs: u64,
    pub limbo_handles: u64,
    pub limbo_frees: u64,
    pub limbo_pooled: u64,
    pub limbo_callbacks: u64,
    pub mcas_publishes: u64,
    pub mcas_helps: u64,
    pub hash_buckets: u64,
    pub hash_resizes: u64,
    pub mt_splits: u64,
    pub mt_layers: u64,
}

/// Load every counter into a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        pin_scans: s.pin_scans.load(Ordering::Relaxed),
        pin_frees: s.pin_frees.load(Ordering::Relaxed),
        pin_survivors: s.pin_survivors.load(Ordering::Relaxed),
        slab_mallocs: s.slab_mallocs.load(Ordering::Relaxed),
        limbo_handles: s.limbo_handles.load(Ordering::Relaxed),
        limbo_frees: s.limbo_frees.load(Ordering::Relaxed),
        limbo_pooled: s.limbo_pooled.load(Ordering::Relaxed),
        limbo_callbacks: s.limbo_callbacks.load(Ordering::Relaxed),
        mcas_publishes: s.mcas_publishes.load(Ordering::Relaxed),
        mcas_helps: s.mcas_helps.load(Ordering::Relaxed),
        hash_buckets: s.hash_buckets.load(Ordering::Relaxed),
        hash_resizes: s.hash_resizes.load(Ordering::Relaxed),
        mt_splits: s.mt_splits.load(Ordering::Relaxed),
        mt_layers: s.mt_layers.load(Ordering::Relaxed),
    }
}
