//! Lock-free sorted singly-linked list keyed by `u64`.
//!
//! Nodes chain through a tagged `link` word whose low bit marks the node
//! *logically deleted*; traversals help unlink marked nodes before
//! stepping over them (Harris-style). Readers follow the pinning protocol
//! with three slots: pin 1 holds the current node, pin 0 the next node,
//! pin 2 the previous node once the cursor advances — the upward copy
//! order the PinBox scan requires.
//!
//! Field reads of a node become trustworthy only after re-checking that
//! the predecessor still points at it: the key word doubles as the
//! purgatory chain link once a node is retired (`ITEM_FREE_PTR_OFFSET`),
//! so a stale read is possible but is always discarded by the
//! re-validation.

use crate::pinbox::{Pins, pin, pins_free, unpin};
use crate::sync::yield_now;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// List node. Embed at offset 0 of a larger slab element to attach a
/// payload.
#[repr(C)]
pub struct Item {
    /// Next-pointer with the deleted flag in bit 0.
    pub link: AtomicUsize,
    pub key: AtomicU64,
}

/// Purgatory chain offset: the key word is dead once a node is retired.
/// The link word is not — concurrent traversals still read it while the
/// node sits in a purgatory.
pub const ITEM_FREE_PTR_OFFSET: usize = mem::offset_of!(Item, key);

/// Cursor over three successive positions in a list.
pub struct Cursor {
    pub prev: *const AtomicUsize,
    pub curr: *mut Item,
    pub next: *mut Item,
}

impl Cursor {
    pub fn new() -> Self {
        Self {
            prev: ptr::null(),
            curr: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn item_ptr(v: usize) -> *mut Item {
    (v & !1) as *mut Item
}

#[inline]
fn is_deleted(v: usize) -> bool {
    v & 1 != 0
}

/// Search for `key` starting at `head` and position the cursor.
///
/// Returns true if found. The cursor is positioned in either case and
/// pins 0..2 stay in place — callers unpin.
///
/// # Safety
///
/// `head` must be the list head word; `pins` a live record of the slab
/// the nodes come from.
pub unsafe fn lfind(head: *const AtomicUsize, key: u64, cursor: &mut Cursor, pins: *mut Pins) -> bool {
    unsafe {
        'retry: loop {
            cursor.prev = head;
            loop {
                cursor.curr = (*cursor.prev).load(Ordering::SeqCst) as *mut Item;
                pin(pins, 1, cursor.curr as *mut u8);
                if (*cursor.prev).load(Ordering::SeqCst) == cursor.curr as usize {
                    break;
                }
            }
            loop {
                if cursor.curr.is_null() {
                    return false; // end of the list
                }
                let mut link;
                loop {
                    link = (*cursor.curr).link.load(Ordering::SeqCst);
                    cursor.next = item_ptr(link);
                    pin(pins, 0, cursor.next as *mut u8);
                    if (*cursor.curr).link.load(Ordering::SeqCst) == link {
                        break;
                    }
                }
                let cur_key = (*cursor.curr).key.load(Ordering::SeqCst);
                if (*cursor.prev).load(Ordering::SeqCst) != cursor.curr as usize {
                    yield_now();
                    continue 'retry;
                }
                if !is_deleted(link) {
                    if cur_key > key {
                        return false;
                    }
                    if cur_key == key {
                        return true;
                    }
                    cursor.prev = &(*cursor.curr).link;
                    pin(pins, 2, cursor.curr as *mut u8);
                } else {
                    // help the deleter: swing prev past the marked node
                    if (*cursor.prev)
                        .compare_exchange(
                            cursor.curr as usize,
                            cursor.next as usize,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        pins_free(pins, cursor.curr as *mut u8);
                    } else {
                        yield_now();
                        continue 'retry;
                    }
                }
                cursor.curr = cursor.next;
                pin(pins, 1, cursor.curr as *mut u8);
            }
        }
    }
}

/// Insert `node` at its sorted position. Keys are unique: returns null on
/// success, or the conflicting node otherwise (NOT pinned — only usable
/// as a flag). All pins are cleared on return.
///
/// # Safety
///
/// `node` must be a private, fully initialized node from the list's slab.
pub unsafe fn linsert(head: *const AtomicUsize, node: *mut Item, pins: *mut Pins) -> *mut Item {
    unsafe {
        let mut cursor = Cursor::new();
        let key = (*node).key.load(Ordering::Relaxed);
        let inserted;
        loop {
            if lfind(head, key, &mut cursor, pins) {
                inserted = false; // duplicate
                break;
            }
            (*node).link.store(cursor.curr as usize, Ordering::SeqCst);
            debug_assert!(cursor.curr != node);
            debug_assert!(cursor.prev != &(*node).link as *const AtomicUsize);
            if (*cursor.prev)
                .compare_exchange(
                    cursor.curr as usize,
                    node as usize,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                inserted = true;
                break;
            }
        }
        unpin(pins, 0);
        unpin(pins, 1);
        unpin(pins, 2);
        if inserted { ptr::null_mut() } else { cursor.curr }
    }
}

/// Delete the node with `key`. Returns 0 on success, 1 if not found.
/// All pins are cleared on return.
///
/// # Safety
///
/// `head`/`pins` as for [`lfind`].
pub unsafe fn ldelete(head: *const AtomicUsize, key: u64, pins: *mut Pins) -> i32 {
    unsafe {
        let mut cursor = Cursor::new();
        let res;
        loop {
            if !lfind(head, key, &mut cursor, pins) {
                res = 1;
                break;
            }
            // mark the node deleted
            if (*cursor.curr)
                .link
                .compare_exchange(
                    cursor.next as usize,
                    cursor.next as usize | 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                // and unlink it
                if (*cursor.prev)
                    .compare_exchange(
                        cursor.curr as usize,
                        cursor.next as usize,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    pins_free(pins, cursor.curr as *mut u8);
                } else {
                    // somebody helped us; help whoever marked next, so
                    // unlinks keep pace with the marks
                    lfind(head, key, &mut cursor, pins);
                }
                res = 0;
                break;
            }
        }
        unpin(pins, 0);
        unpin(pins, 1);
        unpin(pins, 2);
        res
    }
}

/// Find the node with `key`. On success the node stays pinned on pin 2;
/// pins 0..1 are cleared either way.
///
/// # Safety
///
/// `head`/`pins` as for [`lfind`].
pub unsafe fn lsearch(head: *const AtomicUsize, key: u64, pins: *mut Pins) -> *mut Item {
    unsafe {
        let mut cursor = Cursor::new();
        let found = lfind(head, key, &mut cursor, pins);
        if found {
            pin(pins, 2, cursor.curr as *mut u8);
        }
        unpin(pins, 0);
        unpin(pins, 1);
        if found { cursor.curr } else { ptr::null_mut() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinbox::put_pins;
    use crate::slab::Slab;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;

    struct TestList {
        head: AtomicUsize,
        slab: Slab,
    }

    fn new_list() -> &'static TestList {
        Box::leak(Box::new(TestList {
            head: AtomicUsize::new(0),
            slab: Slab::new(mem::size_of::<Item>(), ITEM_FREE_PTR_OFFSET),
        }))
    }

    unsafe fn new_item(l: &TestList, pins: *mut Pins, key: u64) -> *mut Item {
        unsafe {
            let node = l.slab.alloc(pins) as *mut Item;
            assert!(!node.is_null());
            (*node).key.store(key, Ordering::Relaxed);
            node
        }
    }

    #[test]
    fn test_insert_search_delete() {
        let l = new_list();
        let pins = l.slab.get_pins();
        unsafe {
            for key in [5u64, 1, 9, 3, 7] {
                let node = new_item(l, pins, key);
                assert!(linsert(&l.head, node, pins).is_null());
            }
            // duplicate rejected
            let dup = new_item(l, pins, 3);
            assert!(!linsert(&l.head, dup, pins).is_null());
            pins_free(pins, dup as *mut u8);

            for key in [1u64, 3, 5, 7, 9] {
                let found = lsearch(&l.head, key, pins);
                assert!(!found.is_null(), "key {key} missing");
                assert_eq!((*found).key.load(Ordering::Relaxed), key);
                unpin(pins, 2);
            }
            assert!(lsearch(&l.head, 4, pins).is_null());

            assert_eq!(ldelete(&l.head, 5, pins), 0);
            assert_eq!(ldelete(&l.head, 5, pins), 1);
            assert!(lsearch(&l.head, 5, pins).is_null());
            put_pins(pins);
        }
    }

    #[test]
    fn test_list_stays_sorted() {
        let l = new_list();
        let pins = l.slab.get_pins();
        unsafe {
            for key in [20u64, 10, 40, 30, 0] {
                let node = new_item(l, pins, key);
                assert!(linsert(&l.head, node, pins).is_null());
            }
            let mut prev_key = None;
            let mut cur = l.head.load(Ordering::SeqCst) as *mut Item;
            while !cur.is_null() {
                let k = (*cur).key.load(Ordering::Relaxed);
                if let Some(p) = prev_key {
                    assert!(k > p);
                }
                prev_key = Some(k);
                cur = ((*cur).link.load(Ordering::SeqCst) & !1) as *mut Item;
            }
            put_pins(pins);
        }
    }

    #[test]
    fn test_concurrent_disjoint_inserts() {
        let l = new_list();
        let nthreads = 4u64;
        let per_thread = 500u64;
        let handles: Vec<_> = (0..nthreads)
            .map(|t| {
                std::thread::spawn(move || {
                    let pins = l.slab.get_pins();
                    unsafe {
                        for i in 0..per_thread {
                            let node = new_item(l, pins, t * per_thread + i);
                            assert!(linsert(&l.head, node, pins).is_null());
                        }
                        put_pins(pins);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let pins = l.slab.get_pins();
        unsafe {
            for key in 0..nthreads * per_thread {
                assert!(!lsearch(&l.head, key, pins).is_null());
                unpin(pins, 2);
            }
            put_pins(pins);
        }
    }

    #[test]
    fn test_concurrent_insert_delete_churn() {
        let l = new_list();
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                std::thread::spawn(move || {
                    let pins = l.slab.get_pins();
                    unsafe {
                        for round in 0..300u64 {
                            let key = t * 1000 + round % 16;
                            let node = new_item(l, pins, key);
                            if !linsert(&l.head, node, pins).is_null() {
                                pins_free(pins, node as *mut u8);
                            }
                            if round % 3 == 0 {
                                ldelete(&l.head, key, pins);
                            }
                        }
                        put_pins(pins);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
