//! Spin hints and memory fences.
//!
//! Every lock in this crate is a CAS loop over a version word or a pointer
//! bit, so the only primitives needed here are the pause hint emitted
//! between CAS retries, a yield for long waits (purgatory drains), and the
//! standalone fences that pair with relaxed atomics in the version
//! protocols.

use core::sync::atomic::{Ordering, fence};

/// Pause hint for short CAS retry loops.
#[inline(always)]
pub fn spin_hint() {
    core::hint::spin_loop();
}

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "std"))] {
        /// Give up the CPU while waiting for other threads to unpin
        /// addresses or finish an operation.
        #[inline]
        pub fn yield_now() {
            std::thread::yield_now();
        }
    } else {
        /// Without std there is nothing to yield to; degrade to a pause.
        #[inline]
        pub fn yield_now() {
            core::hint::spin_loop();
        }
    }
}

/// Acquire fence: pairs with a release store/fence in another thread.
#[inline(always)]
pub fn acquire_fence() {
    fence(Ordering::Acquire);
}

/// Release fence: makes prior writes visible to acquire observers.
#[inline(always)]
pub fn release_fence() {
    fence(Ordering::Release);
}

/// Compiler-only barrier. Prevents reordering of surrounding accesses by
/// the compiler without emitting a hardware fence.
#[inline(always)]
pub fn compiler_barrier() {
    core::sync::atomic::compiler_fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callable() {
        spin_hint();
        yield_now();
        acquire_fence();
        release_fence();
        compiler_barrier();
    }
}
