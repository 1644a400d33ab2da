//! 4-level radix trie of power-of-256 pages forming a sparse, growable
//! vector of fixed-size elements.
//!
//! `level[L]` roots a subtree holding `256^(L+1)` elements, so the whole
//! array spans the full `u32` index space. Index pages are arrays of 256
//! child pointers; leaf pages hold 256 elements each. Pages are allocated
//! lazily and published by CAS — losers free their page and adopt the
//! winner's — and the array never shrinks. Reads are lock-free
//! (acquire loads down the path, null = absent).
//!
//! Leaf pages are over-allocated so each element can be aligned to
//! `element_size`; the raw allocation base is stored one pointer below the
//! aligned region, where `Drop` finds it.

use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

pub const DYNARRAY_LEVEL_LENGTH: usize = 256;
pub const DYNARRAY_LEVELS: usize = 4;

/// Total number of elements reachable through levels `0..L`.
const IDXES_IN_PREV_LEVELS: [u64; DYNARRAY_LEVELS] = {
    const LL: u64 = DYNARRAY_LEVEL_LENGTH as u64;
    [0, LL, LL * LL + LL, LL * LL * LL + LL * LL + LL]
};

/// Elements per child subtree at each level.
const IDXES_IN_PREV_LEVEL: [u64; DYNARRAY_LEVELS] = {
    const LL: u64 = DYNARRAY_LEVEL_LENGTH as u64;
    [1, LL, LL * LL, LL * LL * LL]
};

pub struct DynArray {
    level: [AtomicPtr<u8>; DYNARRAY_LEVELS],
    element_size: usize,
}

// All mutation goes through CAS on atomic pointers; elements themselves are
// handed out as raw pointers and synchronized by the caller.
unsafe impl Send for DynArray {}
unsafe impl Sync for DynArray {}

impl DynArray {
    /// Create an empty array of `element_size`-byte elements.
    ///
    /// `element_size` must be a multiple of 8 or a power of two no larger
    /// than 8 so the leaf over-allocation slack always covers the
    /// alignment padding.
    pub fn new(element_size: usize) -> Self {
        assert!(
            element_size > 0 && (element_size % 8 == 0 || 8 % element_size == 0),
            "element_size ({}) must be a multiple of 8 or divide 8",
            element_size
        );
        Self {
            level: [const { AtomicPtr::new(ptr::null_mut()) }; DYNARRAY_LEVELS],
            element_size,
        }
    }

    #[inline]
    fn index_page_layout() -> Layout {
        Layout::array::<AtomicPtr<u8>>(DYNARRAY_LEVEL_LENGTH).unwrap()
    }

    #[inline]
    fn leaf_alloc_len(&self) -> usize {
        DYNARRAY_LEVEL_LENGTH * self.element_size
            + self.element_size.max(mem::size_of::<*mut u8>())
    }

    /// Pick the level subtree holding `idx` and return `(level, offset)`.
    #[inline]
    fn locate(idx: u32) -> (usize, u64) {
        let idx = idx as u64;
        let mut i = DYNARRAY_LEVELS - 1;
        while idx < IDXES_IN_PREV_LEVELS[i] {
            i -= 1;
        }
        (i, idx - IDXES_IN_PREV_LEVELS[i])
    }

    /// Return a stable pointer to element `idx`, allocating every missing
    /// page on the path. Returns null on out-of-memory.
    pub fn lvalue(&self, idx: u32) -> *mut u8 {
        let (mut i, mut idx) = Self::locate(idx);

        let mut slot: &AtomicPtr<u8> = &self.level[i];
        while i > 0 {
            let mut page = slot.load(Ordering::Acquire);
            if page.is_null() {
                let fresh = unsafe { alloc_zeroed(Self::index_page_layout()) };
                if fresh.is_null() {
                    return ptr::null_mut();
                }
                match slot.compare_exchange(
                    ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => page = fresh,
                    Err(winner) => {
                        unsafe { dealloc(fresh, Self::index_page_layout()) };
                        page = winner;
                    }
                }
            }
            let children = page as *const AtomicPtr<u8>;
            slot = unsafe { &*children.add((idx / IDXES_IN_PREV_LEVEL[i]) as usize) };
            idx %= IDXES_IN_PREV_LEVEL[i];
            i -= 1;
        }

        let mut page = slot.load(Ordering::Acquire);
        if page.is_null() {
            let fresh = self.alloc_leaf_page();
            if fresh.is_null() {
                return ptr::null_mut();
            }
            match slot.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => page = fresh,
                Err(winner) => {
                    unsafe { self.free_leaf_page(fresh) };
                    page = winner;
                }
            }
        }
        unsafe { page.add(self.element_size * idx as usize) }
    }

    /// Return a pointer to element `idx`, or null if any page on the path
    /// has not been materialized. Never allocates.
    pub fn value(&self, idx: u32) -> *mut u8 {
        let (mut i, mut idx) = Self::locate(idx);

        let mut slot: &AtomicPtr<u8> = &self.level[i];
        while i > 0 {
            let page = slot.load(Ordering::Acquire);
            if page.is_null() {
                return ptr::null_mut();
            }
            let children = page as *const AtomicPtr<u8>;
            slot = unsafe { &*children.add((idx / IDXES_IN_PREV_LEVEL[i]) as usize) };
            idx %= IDXES_IN_PREV_LEVEL[i];
            i -= 1;
        }

        let page = slot.load(Ordering::Acquire);
        if page.is_null() {
            return ptr::null_mut();
        }
        unsafe { page.add(self.element_size * idx as usize) }
    }

    /// Visit every materialized leaf page in ascending index order. The
    /// callback receives the page base (`DYNARRAY_LEVEL_LENGTH` elements);
    /// returning `true` stops the walk early.
    pub fn iterate<F: FnMut(*mut u8) -> bool>(&self, f: &mut F) -> bool {
        for i in 0..DYNARRAY_LEVELS {
            let page = self.level[i].load(Ordering::Acquire);
            if Self::iterate_page(page, i, f) {
                return true;
            }
        }
        false
    }

    fn iterate_page<F: FnMut(*mut u8) -> bool>(page: *mut u8, level: usize, f: &mut F) -> bool {
        if page.is_null() {
            return false;
        }
        if level == 0 {
            return f(page);
        }
        let children = page as *const AtomicPtr<u8>;
        for c in 0..DYNARRAY_LEVEL_LENGTH {
            let child = unsafe { (*children.add(c)).load(Ordering::Acquire) };
            if Self::iterate_page(child, level - 1, f) {
                return true;
            }
        }
        false
    }

    /// Allocate a zeroed leaf page with room to align element 0 to
    /// `element_size`. The raw base goes one pointer below the data.
    fn alloc_leaf_page(&self) -> *mut u8 {
        let len = self.leaf_alloc_len();
        let layout = Layout::from_size_align(len, mem::align_of::<*mut u8>()).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return ptr::null_mut();
        }
        let mut data = unsafe { base.add(mem::size_of::<*mut u8>()) };
        let rem = data as usize % self.element_size;
        if rem != 0 {
            data = unsafe { data.add(self.element_size - rem) };
        }
        unsafe { (data as *mut *mut u8).offset(-1).write(base) };
        data
    }

    /// # Safety
    ///
    /// `data` must have been returned by `alloc_leaf_page` of this array.
    unsafe fn free_leaf_page(&self, data: *mut u8) {
        let base = unsafe { (data as *mut *mut u8).offset(-1).read() };
        let layout = Layout::from_size_align(self.leaf_alloc_len(), mem::align_of::<*mut u8>())
            .unwrap();
        unsafe { dealloc(base, layout) };
    }

    fn free_page(&self, page: *mut u8, level: usize) {
        if page.is_null() {
            return;
        }
        if level == 0 {
            unsafe { self.free_leaf_page(page) };
            return;
        }
        let children = page as *const AtomicPtr<u8>;
        for c in 0..DYNARRAY_LEVEL_LENGTH {
            let child = unsafe { (*children.add(c)).load(Ordering::Relaxed) };
            self.free_page(child, level - 1);
        }
        unsafe { dealloc(page, Self::index_page_layout()) };
    }
}

impl Drop for DynArray {
    fn drop(&mut self) {
        for i in 0..DYNARRAY_LEVELS {
            let page = self.level[i].load(Ordering::Relaxed);
            self.free_page(page, i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use std::sync::Arc;

    #[test]
    fn test_value_absent() {
        let a = DynArray::new(8);
        assert!(a.value(0).is_null());
        assert!(a.value(255).is_null());
        assert!(a.value(1_000_000).is_null());
    }

    #[test]
    fn test_lvalue_then_value() {
        let a = DynArray::new(8);
        for idx in [0u32, 1, 255, 256, 257, 65_535, 65_536, 16_843_007, 16_843_008] {
            let p = a.lvalue(idx);
            assert!(!p.is_null(), "lvalue({idx}) failed");
            unsafe { (p as *mut u64).write(idx as u64 ^ 0xABCD) };
        }
        for idx in [0u32, 1, 255, 256, 257, 65_535, 65_536, 16_843_007, 16_843_008] {
            let p = a.value(idx);
            assert!(!p.is_null());
            assert_eq!(unsafe { (p as *mut u64).read() }, idx as u64 ^ 0xABCD);
            // lvalue must be stable
            assert_eq!(a.lvalue(idx), p);
        }
        // untouched neighbors exist (same page) but are zero
        assert_eq!(unsafe { (a.value(2) as *mut u64).read() }, 0);
    }

    #[test]
    fn test_element_alignment() {
        let a = DynArray::new(64);
        for idx in [0u32, 7, 300] {
            let p = a.lvalue(idx);
            assert!(!p.is_null());
            assert_eq!(p as usize % 64, 0, "element {idx} misaligned");
        }
    }

    #[test]
    fn test_iterate_visits_pages_in_order() {
        let a = DynArray::new(8);
        // touch three pages: 0, 256 (level-1 subtree), 70000
        a.lvalue(0);
        a.lvalue(300);
        a.lvalue(70_000);
        let mut pages = Vec::new();
        a.iterate(&mut |page| {
            pages.push(page);
            false
        });
        assert_eq!(pages.len(), 3);
        // early stop
        let mut n = 0;
        a.iterate(&mut |_| {
            n += 1;
            true
        });
        assert_eq!(n, 1);
    }

    #[test]
    fn test_concurrent_lvalue_same_page() {
        let a = Arc::new(DynArray::new(8));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let a = Arc::clone(&a);
                std::thread::spawn(move || {
                    for i in 0..1000u32 {
                        let p = a.lvalue(i % 512);
                        assert!(!p.is_null());
                        let _ = t;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // exactly one page per 256-element run survived the races
        assert_eq!(a.value(0), a.lvalue(0));
        assert_eq!(a.value(511), a.lvalue(511));
    }
}
