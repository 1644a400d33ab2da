//! Address pinning for safe lock-free memory reclamation.
//!
//! Every thread borrows a [`Pins`] record holding a small array of pin
//! slots. Before dereferencing a shared pointer a thread publishes the
//! address in a slot; a retirer scans all slots of all records and keeps
//! anything still pinned in a per-record *purgatory* instead of freeing it.
//!
//! Callers must follow the pinning protocol:
//!
//! 1. read the shared pointer `P` into a local `L`;
//! 2. `pin(pins, k, L)`;
//! 3. re-read `P`; if it changed, go back to 1;
//! 4. use `L`;
//! 5. `unpin(pins, k)` when done;
//! 6. when walking a chain, copy pins upward only (`pin[N]` to `pin[M]`
//!    with `M > N`) — the retire scan reads slots in ascending order and
//!    a downward copy could slip past it.
//!
//! The versioned free stack of `Pins` records (16-bit index + 16-bit
//! version in one word) is the same ABA defense the records themselves
//! provide for user objects.

use crate::config::PURGATORY_SIZE;
use crate::dyn_array::DynArray;
use crate::stat_add;
use crate::stat_inc;
use crate::sync::yield_now;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// Pin slots per record.
pub const PINBOX_PINS: usize = 4;

/// The pin table addresses records with 16 bits; index 0 means "null".
const PINBOX_MAX_PINS: u32 = 65536;

/// Frees a linked batch of retired objects. `first`..`last` are chained
/// through each object's `free_ptr_offset` word; `arg` is the value
/// registered with the PinBox.
pub type FreeBatchFn = unsafe fn(first: *mut u8, last: *mut u8, arg: *mut u8);

/// Per-thread pin record. Sized to one cache line to avoid false sharing
/// between the pin arrays of different threads.
#[repr(C, align(64))]
pub struct Pins {
    pin: [AtomicPtr<u8>; PINBOX_PINS],
    pinbox: *mut PinBox,
    purgatory: *mut u8,
    purgatory_count: u32,
    /// While the record is live: its own index in the pin table.
    /// While it sits on the free stack: the index of the next free record.
    link: AtomicU32,
}

const _: () = assert!(mem::size_of::<Pins>() == 64);

pub struct PinBox {
    pinarray: DynArray,
    free_func: FreeBatchFn,
    free_arg: AtomicPtr<u8>,
    free_ptr_offset: usize,
    /// `(version << 16) | index` of the top free record. The version half
    /// advances on every pop/push so a stale index cannot be reused.
    pinstack_top_ver: AtomicU32,
    /// Highest record index ever handed out.
    pins_in_array: AtomicU32,
}

unsafe impl Send for PinBox {}
unsafe impl Sync for PinBox {}

/// Next-pointer embedded at `free_ptr_offset` inside a retired object.
#[inline]
unsafe fn next_node(free_ptr_offset: usize, obj: *mut u8) -> *mut *mut u8 {
    unsafe { obj.add(free_ptr_offset) as *mut *mut u8 }
}

impl PinBox {
    /// `free_ptr_offset` is the byte offset inside managed objects of a
    /// pointer-sized field that is guaranteed unused — by every thread, not
    /// just the owner — once the object is retired; purgatories chain
    /// through it. `free_func(first, last, arg)` receives batches of
    /// unpinned objects.
    pub fn new(free_ptr_offset: usize, free_func: FreeBatchFn, free_arg: *mut u8) -> Self {
        assert!(free_ptr_offset % mem::size_of::<*mut u8>() == 0);
        Self {
            pinarray: DynArray::new(mem::size_of::<Pins>()),
            free_func,
            free_arg: AtomicPtr::new(free_arg),
            free_ptr_offset,
            pinstack_top_ver: AtomicU32::new(0),
            pins_in_array: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn free_arg(&self) -> *mut u8 {
        self.free_arg.load(Ordering::SeqCst)
    }

    /// Late-bind the callback argument. Owners that embed their PinBox
    /// (the slab allocator) point it at themselves once their address is
    /// final; must happen before any record is handed out.
    #[inline]
    pub fn set_free_arg(&self, arg: *mut u8) {
        self.free_arg.store(arg, Ordering::SeqCst);
    }

    /// Pop a free `Pins` record or allocate a fresh one from the table.
    /// Returns null when the 64 Ki table is exhausted or on OOM.
    pub fn get_pins(&self) -> *mut Pins {
        let mut top_ver = self.pinstack_top_ver.load(Ordering::SeqCst);
        let mut el: *mut Pins;
        let index: u32;
        loop {
            let pins = top_ver % PINBOX_MAX_PINS;
            if pins == 0 {
                // free stack empty: extend the array.
                // index 0 is reserved to mean "null pointer".
                let idx = self.pins_in_array.fetch_add(1, Ordering::SeqCst) + 1;
                if idx >= PINBOX_MAX_PINS {
                    return ptr::null_mut();
                }
                el = self.pinarray.lvalue(idx) as *mut Pins;
                if el.is_null() {
                    return ptr::null_mut();
                }
                index = idx;
                break;
            }
            el = self.pinarray.value(pins) as *mut Pins;
            let next = unsafe { (*el).link.load(Ordering::SeqCst) };
            match self.pinstack_top_ver.compare_exchange(
                top_ver,
                top_ver
                    .wrapping_sub(pins)
                    .wrapping_add(next)
                    .wrapping_add(PINBOX_MAX_PINS),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    index = pins;
                    break;
                }
                Err(cur) => top_ver = cur,
            }
        }
        unsafe {
            (*el).link.store(index, Ordering::SeqCst);
            (*el).pinbox = self as *const PinBox as *mut PinBox;
            (*el).purgatory = ptr::null_mut();
            (*el).purgatory_count = 0;
        }
        el
    }
}

/// Publish `addr` in pin slot `slot`.
///
/// # Safety
///
/// `pins` must be a live record from `get_pins`, used only by its owner.
#[inline]
pub unsafe fn pin(pins: *mut Pins, slot: usize, addr: *mut u8) {
    unsafe { (*pins).pin[slot].store(addr, Ordering::SeqCst) };
}

/// Clear pin slot `slot`.
///
/// # Safety
///
/// Same as [`pin`].
#[inline]
pub unsafe fn unpin(pins: *mut Pins, slot: usize) {
    unsafe { (*pins).pin[slot].store(ptr::null_mut(), Ordering::SeqCst) };
}

#[inline]
unsafe fn add_to_purgatory(pins: *mut Pins, addr: *mut u8) {
    unsafe {
        let off = (*(*pins).pinbox).free_ptr_offset;
        *next_node(off, addr) = (*pins).purgatory;
        (*pins).purgatory = addr;
        (*pins).purgatory_count += 1;
    }
}

/// Retire an object allocated through this PinBox's allocator.
///
/// The object lands in the owner's purgatory; every `PURGATORY_SIZE`
/// retires the purgatory is scanned against all pins and unpinned objects
/// are passed to the free callback.
///
/// # Safety
///
/// `pins` must be the caller's live record; `addr` must be retired exactly
/// once and no new references to it may be created after this call.
pub unsafe fn pins_free(pins: *mut Pins, addr: *mut u8) {
    unsafe {
        add_to_purgatory(pins, addr);
        if (*pins).purgatory_count % PURGATORY_SIZE == 0 {
            real_free(pins);
        }
    }
}

/// Return a record to its PinBox, first draining its purgatory.
///
/// This can livelock if another thread waits for the caller while holding
/// pins on addresses the caller wants to free — only return pins when all
/// work is done and nobody can be waiting on this thread.
///
/// # Safety
///
/// `pins` must be a live record; the caller must not touch it afterwards.
pub unsafe fn put_pins(pins: *mut Pins) {
    unsafe {
        while (*pins).purgatory_count != 0 {
            real_free(pins);
            if (*pins).purgatory_count != 0 {
                yield_now();
            }
        }
        let pinbox = &*(*pins).pinbox;
        let nr = (*pins).link.load(Ordering::SeqCst);
        let mut top_ver = pinbox.pinstack_top_ver.load(Ordering::SeqCst);
        loop {
            let link = top_ver % PINBOX_MAX_PINS;
            (*pins).link.store(link, Ordering::SeqCst);
            match pinbox.pinstack_top_ver.compare_exchange(
                top_ver,
                top_ver
                    .wrapping_sub(link)
                    .wrapping_add(nr)
                    .wrapping_add(PINBOX_MAX_PINS),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(cur) => top_ver = cur,
            }
        }
    }
}

/// Scan the purgatory and free everything that is not pinned anywhere.
///
/// # Safety
///
/// `pins` must be the caller's live record.
pub(crate) unsafe fn real_free(pins: *mut Pins) {
    stat_inc!(pin_scans);
    unsafe {
        let pinbox = &*(*pins).pinbox;
        let off = pinbox.free_ptr_offset;

        // Swap the purgatory off the record; pinned objects are re-added
        // as the scan encounters them.
        let mut old_purgatory = (*pins).purgatory;
        (*pins).purgatory = ptr::null_mut();
        (*pins).purgatory_count = 0;

        pinbox.pinarray.iterate(&mut |page| {
            let records = page as *const Pins;
            for r in 0..crate::dyn_array::DYNARRAY_LEVEL_LENGTH {
                let el = records.add(r);
                for i in 0..PINBOX_PINS {
                    let p = (*el).pin[i].load(Ordering::SeqCst);
                    if p.is_null() {
                        continue;
                    }
                    // Move every purgatory entry equal to p back to the
                    // record's purgatory; keep the rest chained.
                    let mut cur = old_purgatory;
                    let mut list_prev: *mut *mut u8 = &mut old_purgatory;
                    while !cur.is_null() {
                        let next = *next_node(off, cur);
                        if p == cur {
                            stat_inc!(pin_survivors);
                            add_to_purgatory(pins, cur);
                            *list_prev = next;
                        } else {
                            list_prev = next_node(off, cur);
                        }
                        cur = next;
                    }
                    if old_purgatory.is_null() {
                        return true;
                    }
                }
            }
            false
        });

        if !old_purgatory.is_null() {
            // whatever survived the scan is pinned by nobody: free it
            let mut last = old_purgatory;
            let mut batch = 1u64;
            while !(*next_node(off, last)).is_null() {
                last = *next_node(off, last);
                batch += 1;
            }
            stat_add!(pin_frees, batch);
            let _ = batch;
            (pinbox.free_func)(old_purgatory, last, pinbox.free_arg());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;

    // Test objects: first word is the chain link (free_ptr_offset = 0),
    // freed batches are counted through `arg`.
    static FREED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn count_batch(first: *mut u8, _last: *mut u8, _arg: *mut u8) {
        let mut cur = first;
        while !cur.is_null() {
            let next = unsafe { *(cur as *mut *mut u8) };
            unsafe { drop(Box::from_raw(cur as *mut [u8; 16])) };
            FREED.fetch_add(1, Ordering::SeqCst);
            cur = next;
        }
    }

    fn new_obj() -> *mut u8 {
        Box::into_raw(Box::new([0u8; 16])) as *mut u8
    }

    #[test]
    fn test_get_put_roundtrip() {
        let pb = PinBox::new(0, count_batch, ptr::null_mut());
        let p1 = pb.get_pins();
        assert!(!p1.is_null());
        unsafe { put_pins(p1) };
        // the freed record is reused
        let p2 = pb.get_pins();
        assert_eq!(p1, p2);
        let p3 = pb.get_pins();
        assert_ne!(p2, p3);
        unsafe {
            put_pins(p3);
            put_pins(p2);
        }
    }

    #[test]
    fn test_unpinned_objects_are_freed() {
        FREED.store(0, Ordering::SeqCst);
        let pb = PinBox::new(0, count_batch, ptr::null_mut());
        let pins = pb.get_pins();
        let mut objs = Vec::new();
        for _ in 0..PURGATORY_SIZE as usize {
            objs.push(new_obj());
        }
        unsafe {
            for o in objs {
                pins_free(pins, o);
            }
        }
        // the PURGATORY_SIZE-th retire triggered a scan; nothing was pinned
        assert_eq!(FREED.load(Ordering::SeqCst), PURGATORY_SIZE as usize);
        unsafe { put_pins(pins) };
    }

    #[test]
    fn test_pinned_object_survives_scan() {
        FREED.store(0, Ordering::SeqCst);
        let pb = PinBox::new(0, count_batch, ptr::null_mut());
        let owner = pb.get_pins();
        let reader = pb.get_pins();

        let hot = new_obj();
        unsafe { pin(reader, 0, hot) };

        unsafe {
            pins_free(owner, hot);
            for _ in 1..PURGATORY_SIZE as usize {
                pins_free(owner, new_obj());
            }
        }
        // scan ran; the pinned object must not be in the freed count
        assert_eq!(FREED.load(Ordering::SeqCst), PURGATORY_SIZE as usize - 1);

        unsafe {
            unpin(reader, 0);
            put_pins(reader);
            // put_pins drains the remaining purgatory entry
            put_pins(owner);
        }
        assert_eq!(FREED.load(Ordering::SeqCst), PURGATORY_SIZE as usize);
    }

    #[test]
    fn test_concurrent_get_put() {
        let pb = Box::leak(Box::new(PinBox::new(0, count_batch, ptr::null_mut())));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pb: &'static PinBox = pb;
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        let pins = pb.get_pins();
                        assert!(!pins.is_null());
                        unsafe { put_pins(pins) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // at most one record per thread was ever live
        assert!(pb.pins_in_array.load(Ordering::SeqCst) <= 8);
    }
}
