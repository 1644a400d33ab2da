#![no_std]

//! lfkit: lock- and wait-free building blocks for in-memory data
//! structures on shared-memory multiprocessors.
//!
//! Five subsystems, leaves first:
//! - [`dyn_array`]: lazily-populated 4-level radix trie of elements
//! - [`pinbox`] + [`slab`]: address-pinning reclamation and a lock-free
//!   fixed-size object pool on top of it
//! - [`limbo`]: epoch-based deferred reclamation (RCU)
//! - [`sort_list`] + [`hash_map`]: Harris-style ordered list and a
//!   split-ordered-list hash map built on the pinning allocator
//! - [`wfmcas`]: wait-free multi-word compare-and-set with helping
//! - [`masstree`]: a concurrent B⁺-trie of 8-byte key slices, with
//!   optimistic readers and locked writers, reclaimed through limbo
//!
//! # Usage
//!
//! ```ignore
//! lfkit::init(workers)?;
//! // per worker thread i:
//! let ti = lfkit::thread_info(i);
//! let tree = lfkit::masstree::Table::new();
//! unsafe {
//!     tree.initialize(&mut *ti);
//!     tree.put(b"hello", 1, &mut *ti);
//! }
//! ```

extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod bits;
pub mod config;
pub mod dyn_array;
pub mod hash_map;
pub mod limbo;
pub mod masstree;
mod macros;
pub mod pinbox;
pub mod slab;
pub mod sort_list;
pub mod stats;
pub mod sync;
pub mod wfmcas;

pub use limbo::{LimboHandle, ThreadInfo, thread_info};
pub use wfmcas::{McasCtx, mcas_ctx};

/// Library initialization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    AlreadyInitialized,
}

/// Allocate the fixed per-worker tables: one limbo [`ThreadInfo`] and one
/// WFMCAS context per worker, plus the pending-op table. Must run once,
/// before any other call into the library.
pub fn init(worker_count: usize) -> Result<(), InitError> {
    if !limbo::init_threads(worker_count) {
        return Err(InitError::AlreadyInitialized);
    }
    wfmcas::init_tables(worker_count);
    Ok(())
}

/// Number of workers the library was initialized with (0 before init).
pub fn worker_count() -> usize {
    limbo::worker_count()
}

/// Tear down the global tables.
///
/// # Safety
///
/// No [`LimboHandle`] may be live and no thread may be inside any library
/// call, now or later — the per-worker contexts dangle after this.
pub unsafe fn deinit() {
    unsafe {
        wfmcas::deinit_tables();
        limbo::deinit_threads();
    }
}
