//! Lock-free pool of fixed-size objects with pinning reclamation.
//!
//! A `Slab` keeps a Treiber stack of free objects chained through the same
//! in-object word the PinBox uses for purgatories (`free_ptr_offset`).
//! `alloc` pops under pin protection or falls back to the heap; retired
//! objects travel purgatory-first and come back to the stack in batches via
//! the PinBox free callback. The pin on the observed stack top is what
//! makes the pop CAS ABA-safe: a pinned object can never re-enter the
//! stack, so `top == node` implies the chained next pointer is still the
//! one the CAS installs.

use crate::pinbox::{PinBox, Pins, pin, unpin};
use crate::stat_inc;
use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// Hook invoked when an object is created by the heap (not when it is
/// reused from the pool) or destroyed at teardown.
pub type ObjectHook = unsafe fn(*mut u8);

pub struct Slab {
    pinbox: PinBox,
    /// Top of the free-object stack.
    top: AtomicPtr<u8>,
    element_size: usize,
    free_ptr_offset: usize,
    /// Number of objects ever taken from the heap.
    mallocs: AtomicU32,
    constructor: Option<ObjectHook>,
    destructor: Option<ObjectHook>,
}

unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

#[inline]
unsafe fn next_node(free_ptr_offset: usize, obj: *mut u8) -> *mut *mut u8 {
    unsafe { obj.add(free_ptr_offset) as *mut *mut u8 }
}

/// PinBox free callback: CAS-prepend a survivor batch onto the free stack.
unsafe fn alloc_free(first: *mut u8, last: *mut u8, arg: *mut u8) {
    unsafe {
        let slab = &*(arg as *const Slab);
        let mut top = slab.top.load(Ordering::SeqCst);
        loop {
            *next_node(slab.free_ptr_offset, last) = top;
            match slab
                .top
                .compare_exchange_weak(top, first, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(cur) => top = cur,
            }
        }
    }
}

impl Slab {
    /// Pool of `element_size`-byte objects. `free_ptr_offset` is the byte
    /// offset of a pointer-sized field inside the object that is provably
    /// unused once the object is retired; both the free stack and the
    /// purgatories chain through it.
    pub fn new(element_size: usize, free_ptr_offset: usize) -> Self {
        Self::with_hooks(element_size, free_ptr_offset, None, None)
    }

    /// Like [`Slab::new`] with creation/teardown hooks. The constructor
    /// runs once per heap allocation — objects reused from the pool keep
    /// whatever state the previous user left in them. The destructor runs
    /// when an object is finally freed (teardown or `direct_free`).
    pub fn with_hooks(
        element_size: usize,
        free_ptr_offset: usize,
        constructor: Option<ObjectHook>,
        destructor: Option<ObjectHook>,
    ) -> Self {
        assert!(element_size >= free_ptr_offset + mem::size_of::<*mut u8>());
        Self {
            pinbox: PinBox::new(free_ptr_offset, alloc_free, ptr::null_mut()),
            top: AtomicPtr::new(ptr::null_mut()),
            element_size,
            free_ptr_offset,
            mallocs: AtomicU32::new(0),
            constructor,
            destructor,
        }
    }

    #[inline]
    fn layout(&self) -> Layout {
        Layout::from_size_align(self.element_size, mem::align_of::<*mut u8>()).unwrap()
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Borrow a pin record for use with [`Slab::alloc`] / retire paths.
    ///
    /// The slab must not move for as long as any record or object is
    /// outstanding; the PinBox callback holds its address.
    pub fn get_pins(&self) -> *mut Pins {
        self.pinbox
            .set_free_arg(self as *const Slab as *mut u8);
        self.pinbox.get_pins()
    }

    /// Pop a free object or heap-allocate a zeroed one. Uses pin slot 0;
    /// the slot is cleared on return. Returns null on out-of-memory.
    ///
    /// # Safety
    ///
    /// `pins` must be a live record obtained from this slab's
    /// [`Slab::get_pins`], used only by the calling thread.
    pub unsafe fn alloc(&self, pins: *mut Pins) -> *mut u8 {
        let node;
        loop {
            let mut n = self.top.load(Ordering::SeqCst);
            loop {
                unsafe { pin(pins, 0, n) };
                let cur = self.top.load(Ordering::SeqCst);
                if n == cur {
                    break;
                }
                n = cur;
            }
            if n.is_null() {
                let fresh = unsafe { alloc_zeroed(self.layout()) };
                if !fresh.is_null() {
                    if let Some(ctor) = self.constructor {
                        unsafe { ctor(fresh) };
                    }
                    self.mallocs.fetch_add(1, Ordering::SeqCst);
                    stat_inc!(slab_mallocs);
                }
                node = fresh;
                break;
            }
            let next = unsafe { *next_node(self.free_ptr_offset, n) };
            if self
                .top
                .compare_exchange(n, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                node = n;
                break;
            }
        }
        unsafe { unpin(pins, 0) };
        node
    }

    /// Destroy and free an object immediately, bypassing the purgatory.
    /// Only valid for objects no other thread can still reach.
    ///
    /// # Safety
    ///
    /// `addr` must be an object of this slab that is unreachable to every
    /// other thread.
    pub unsafe fn direct_free(&self, addr: *mut u8) {
        unsafe {
            if let Some(dtor) = self.destructor {
                dtor(addr);
            }
            dealloc(addr, self.layout());
        }
    }

    /// Walk the free stack and count it. Not thread-safe; diagnostic only.
    pub fn pool_count(&self) -> u32 {
        let mut n = 0;
        let mut node = self.top.load(Ordering::SeqCst);
        while !node.is_null() {
            n += 1;
            node = unsafe { *next_node(self.free_ptr_offset, node) };
        }
        n
    }

    pub fn malloc_count(&self) -> u32 {
        self.mallocs.load(Ordering::SeqCst)
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        let mut node = self.top.load(Ordering::Relaxed);
        while !node.is_null() {
            let next = unsafe { *next_node(self.free_ptr_offset, node) };
            unsafe {
                if let Some(dtor) = self.destructor {
                    dtor(node);
                }
                dealloc(node, self.layout());
            }
            node = next;
        }
        self.top.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinbox::{pins_free, put_pins};
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;

    static CTOR_CALLS: AtomicUsize = AtomicUsize::new(0);
    static DTOR_CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe fn count_ctor(_p: *mut u8) {
        CTOR_CALLS.fetch_add(1, Ordering::SeqCst);
    }
    unsafe fn count_dtor(_p: *mut u8) {
        DTOR_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_alloc_reuses_retired_objects() {
        let slab = Box::leak(Box::new(Slab::new(32, 0)));
        let pins = slab.get_pins();
        unsafe {
            let a = slab.alloc(pins);
            assert!(!a.is_null());
            pins_free(pins, a);
            // drain the purgatory so the object reaches the free stack
            put_pins(pins);
        }
        let pins = slab.get_pins();
        unsafe {
            let b = slab.alloc(pins);
            let a2 = slab.alloc(pins);
            // one of the two came from the pool
            assert!(!b.is_null() && !a2.is_null());
            assert_eq!(slab.malloc_count(), 2);
            pins_free(pins, b);
            pins_free(pins, a2);
            put_pins(pins);
        }
        assert_eq!(slab.pool_count(), 2);
    }

    #[test]
    fn test_hooks_run_on_malloc_and_teardown() {
        CTOR_CALLS.store(0, Ordering::SeqCst);
        DTOR_CALLS.store(0, Ordering::SeqCst);
        {
            let slab = Slab::with_hooks(64, 8, Some(count_ctor), Some(count_dtor));
            let pins = slab.get_pins();
            unsafe {
                let a = slab.alloc(pins);
                let b = slab.alloc(pins);
                assert_eq!(CTOR_CALLS.load(Ordering::SeqCst), 2);
                pins_free(pins, a);
                pins_free(pins, b);
                put_pins(pins);
            }
        }
        // teardown destroyed exactly the pooled objects
        assert_eq!(DTOR_CALLS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let slab = Box::leak(Box::new(Slab::new(48, 0)));
        let handles: Vec<_> = (0..4)
            .map(|tid| {
                let slab: &'static Slab = slab;
                std::thread::spawn(move || {
                    let pins = slab.get_pins();
                    assert!(!pins.is_null());
                    for i in 0..5000usize {
                        unsafe {
                            let p = slab.alloc(pins);
                            assert!(!p.is_null());
                            // scribble a thread-unique pattern past the link word
                            (p.add(8) as *mut usize).write(tid * 100_000 + i);
                            assert_eq!((p.add(8) as *mut usize).read(), tid * 100_000 + i);
                            pins_free(pins, p);
                        }
                    }
                    unsafe { put_pins(pins) };
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // every live object was retired back to the pool
        assert_eq!(slab.pool_count(), slab.malloc_count());
    }
}
