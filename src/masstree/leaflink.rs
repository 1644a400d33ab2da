//! Doubly-linked leaf list maintenance.
//!
//! The low bit of a leaf's next pointer is a per-leaf lock covering that
//! leaf's `(next, prev-of-next)` edge. Splits lock the predecessor's next
//! pointer before wiring in the new sibling; unlink locks the victim's
//! next pointer and then the predecessor's. Readers only ever use
//! `safe_next`, which strips the bit.

use crate::masstree::node::Leaf;
use crate::sync::{compiler_barrier, spin_hint};
use core::sync::atomic::Ordering;

#[inline]
fn mark(n: *mut Leaf) -> usize {
    n as usize + 1
}

#[inline]
fn is_marked(v: usize) -> bool {
    v & 1 != 0
}

/// Lock `n`'s next pointer; returns the (unmarked) successor.
unsafe fn lock_next(n: *mut Leaf) -> *mut Leaf {
    unsafe {
        loop {
            let next = (*n).next.load(Ordering::Relaxed);
            if next == 0 {
                return core::ptr::null_mut();
            }
            if !is_marked(next)
                && (*n)
                    .next
                    .compare_exchange(
                        next,
                        mark(next as *mut Leaf),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return next as *mut Leaf;
            }
            spin_hint();
        }
    }
}

/// Wire the fresh right sibling `nr` in after `n`.
///
/// # Safety
///
/// `n` must be locked (node lock); `nr` unpublished.
pub unsafe fn link_split(n: *mut Leaf, nr: *mut Leaf) {
    unsafe {
        (*nr).prev.store(n, Ordering::Relaxed);
        let next = lock_next(n);
        (*nr).next.store(next as usize, Ordering::Relaxed);
        if !next.is_null() {
            (*next).prev.store(nr, Ordering::Relaxed);
        }
        compiler_barrier();
        // publishing nr also releases n's link lock
        (*n).next.store(nr as usize, Ordering::Relaxed);
    }
}

/// Take `n` out of the leaf list.
///
/// # Safety
///
/// `n` must be locked (node lock) and marked deleted, with a live
/// predecessor.
pub unsafe fn unlink(n: *mut Leaf) {
    unsafe {
        let next = lock_next(n);
        let prev;
        loop {
            let p = (*n).prev.load(Ordering::Relaxed);
            // lock the predecessor's edge by marking its next pointer
            if (*p)
                .next
                .compare_exchange(
                    n as usize,
                    mark(n),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                prev = p;
                break;
            }
            spin_hint();
        }
        if !next.is_null() {
            (*next).prev.store(prev, Ordering::Relaxed);
        }
        compiler_barrier();
        // swing the predecessor past n, releasing its link lock
        (*prev).next.store(next as usize, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limbo::test_support::test_worker;
    use crate::masstree::node::Leaf;
    use core::ptr;

    #[test]
    fn test_link_split_and_unlink() {
        let ti = unsafe { &mut *crate::limbo::thread_info(test_worker()) };
        unsafe {
            let a = Leaf::make_root(0, ptr::null_mut(), ti);
            let b = Leaf::make(0, 0, ti);
            let c = Leaf::make(0, 0, ti);

            // a -> c, then split a -> b -> c
            link_split(a, c);
            link_split(a, b);
            assert_eq!((*a).safe_next(), b);
            assert_eq!((*b).safe_next(), c);
            assert_eq!((*c).prev.load(Ordering::Relaxed), b);
            assert_eq!((*b).prev.load(Ordering::Relaxed), a);

            unlink(b);
            assert_eq!((*a).safe_next(), c);
            assert_eq!((*c).prev.load(Ordering::Relaxed), a);

            (*a).deallocate(ti);
            (*b).deallocate(ti);
            (*c).deallocate(ti);
        }
    }
}
