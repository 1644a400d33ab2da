//! Lock-free hash map over a split-ordered list.
//!
//! All elements live in one singly-linked list sorted by bit-reversed
//! hash, so every bucket is a contiguous run delimited by a never-freed
//! *dummy* node (even reversed hash; real nodes are odd). The bucket table
//! is a [`DynArray`] of head pointers into the list, filled in lazily:
//! initializing bucket `b` first initializes its parent
//! `clear_highest_bit(b)` and then inserts the dummy through the parent's
//! run. Resizing just doubles the logical `size` by CAS — no data moves.
//!
//! Nodes come from a [`Slab`] whose `free_ptr_offset` is the in-node `key`
//! pointer, which is dead weight once a node is retired and so doubles as
//! the purgatory chain link. See `sort_list` for the pinning discipline of
//! the traversal; this list is the same shape with (reversed hash, key
//! bytes) as the sort key.

use crate::bits::{clear_highest_bit, reverse_bits};
use crate::dyn_array::DynArray;
use crate::pinbox::{Pins, pin, pins_free, put_pins as pinbox_put_pins, unpin};
use crate::slab::{ObjectHook, Slab};
use crate::stat_inc;
use crate::sync::yield_now;
use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;
use core::cmp::Ordering as CmpOrdering;
use core::mem;
use core::ptr;
use core::slice;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

/// Reject duplicate keys on insert.
pub const LF_HASH_UNIQUE: u32 = 1;

const MAX_LOAD: f64 = 1.0;
const INT_MAX32: u32 = 0x7FFF_FFFF;

/// Extracts the key of a stored element: `(element, &mut len) -> key ptr`.
pub type GetKeyFn = unsafe fn(*const u8, &mut usize) -> *const u8;
/// 32-bit hash over key bytes.
pub type HashFn = fn(&[u8]) -> u32;
/// Copies/initializes a stored element from the value passed to `insert`:
/// `(dst_element, src)`.
pub type InitFn = unsafe fn(*mut u8, *const u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Unique-mode insert found the key already present.
    Duplicate,
    /// Key not present.
    NotFound,
    /// Allocation failed.
    OutOfMemory,
}

/// List node header. The element payload is stored directly behind it;
/// `key` points into the payload (or at a static empty key for dummies).
#[repr(C)]
struct Node {
    /// Next-pointer, deleted flag in bit 0.
    link: AtomicUsize,
    /// Bit-reversed hash; bit 0 set for real nodes, clear for dummies.
    hashnr: AtomicU32,
    /// Key bytes; repurposed as the purgatory chain once retired.
    key: AtomicPtr<u8>,
    keylen: AtomicUsize,
}

const NODE_FREE_PTR_OFFSET: usize = mem::offset_of!(Node, key);

/// Per-element overhead of the map.
pub const HASH_OVERHEAD: usize = mem::size_of::<Node>();

#[inline]
fn node_ptr(v: usize) -> *mut Node {
    (v & !1) as *mut Node
}

#[inline]
fn is_deleted(v: usize) -> bool {
    v & 1 != 0
}

#[inline]
unsafe fn payload(node: *mut Node) -> *mut u8 {
    unsafe { (node as *mut u8).add(mem::size_of::<Node>()) }
}

/// memcmp with a shorter-is-smaller length tiebreak.
fn keycmp(a: &[u8], b: &[u8]) -> CmpOrdering {
    let n = a.len().min(b.len());
    match a[..n].cmp(&b[..n]) {
        CmpOrdering::Equal => a.len().cmp(&b.len()),
        other => other,
    }
}

/// Default 32-bit FNV-1a. Callers with better-distributed hashes can
/// install their own through [`HashMap::with_hooks`].
fn fnv1a32(key: &[u8]) -> u32 {
    let mut h: u32 = 0x811C_9DC5;
    for &b in key {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

struct ListCursor {
    prev: *const AtomicUsize,
    curr: *mut Node,
    next: *mut Node,
}

impl ListCursor {
    fn new() -> Self {
        Self {
            prev: ptr::null(),
            curr: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }
}

/// Search for `(hashnr, key)` from `head` and position the cursor; the
/// list is ordered by `(hashnr, key bytes)`. Returns true if found.
/// Pins 0..2 stay in place either way.
unsafe fn lfind(
    head: *const AtomicUsize,
    hashnr: u32,
    key: &[u8],
    cursor: &mut ListCursor,
    pins: *mut Pins,
) -> bool {
    unsafe {
        'retry: loop {
            cursor.prev = head;
            loop {
                cursor.curr = (*cursor.prev).load(Ordering::SeqCst) as *mut Node;
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
                    cursor.next = node_ptr(link);
                    pin(pins, 0, cursor.next as *mut u8);
                    if (*cursor.curr).link.load(Ordering::SeqCst) == link {
                        break;
                    }
                }
                let cur_hashnr = (*cursor.curr).hashnr.load(Ordering::SeqCst);
                let cur_key = (*cursor.curr).key.load(Ordering::SeqCst);
                let cur_keylen = (*cursor.curr).keylen.load(Ordering::SeqCst);
                if (*cursor.prev).load(Ordering::SeqCst) != cursor.curr as usize {
                    yield_now();
                    continue 'retry;
                }
                if !is_deleted(link) {
                    if cur_hashnr >= hashnr {
                        if cur_hashnr > hashnr {
                            return false;
                        }
                        // the node is pinned, so its payload bytes are stable
                        let r = keycmp(slice::from_raw_parts(cur_key, cur_keylen), key);
                        if r != CmpOrdering::Less {
                            return r == CmpOrdering::Equal;
                        }
                    }
                    cursor.prev = &(*cursor.curr).link;
                    pin(pins, 2, cursor.curr as *mut u8);
                } else {
                    // help remove the logically deleted node
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

/// Search for a node in `[first_hashnr, last_hashnr]` whose payload
/// satisfies `matcher`. Dummies met along the way become the restart head
/// (they are never freed, so retrying from one is always safe).
unsafe fn lfind_match(
    mut head: *const AtomicUsize,
    first_hashnr: u32,
    last_hashnr: u32,
    matcher: unsafe fn(*const u8) -> bool,
    cursor: &mut ListCursor,
    pins: *mut Pins,
) -> bool {
    unsafe {
        'retry: loop {
            cursor.prev = head;
            loop {
                cursor.curr = (*cursor.prev).load(Ordering::SeqCst) as *mut Node;
                pin(pins, 1, cursor.curr as *mut u8);
                if (*cursor.prev).load(Ordering::SeqCst) == cursor.curr as usize {
                    break;
                }
            }
            loop {
                if cursor.curr.is_null() {
                    return false;
                }
                let mut link;
                loop {
                    link = (*cursor.curr).link.load(Ordering::SeqCst);
                    cursor.next = node_ptr(link);
                    pin(pins, 0, cursor.next as *mut u8);
                    if (*cursor.curr).link.load(Ordering::SeqCst) == link {
                        break;
                    }
                }
                let cur_hashnr = (*cursor.curr).hashnr.load(Ordering::SeqCst);
                if (*cursor.prev).load(Ordering::SeqCst) != cursor.curr as usize {
                    yield_now();
                    continue 'retry;
                }
                if !is_deleted(link) {
                    if cur_hashnr >= first_hashnr {
                        if cur_hashnr > last_hashnr {
                            return false;
                        }
                        if cur_hashnr & 1 != 0 {
                            if matcher(payload(cursor.curr) as *const u8) {
                                return true;
                            }
                        } else {
                            head = &(*cursor.curr).link;
                        }
                    }
                    cursor.prev = &(*cursor.curr).link;
                    pin(pins, 2, cursor.curr as *mut u8);
                } else {
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

/// Insert `node` at its sorted position. Returns null on success, or a
/// pointer to the duplicate (unpinned — only safe to use when it is a
/// dummy). Clears all pins.
unsafe fn linsert(
    head: *const AtomicUsize,
    node: *mut Node,
    pins: *mut Pins,
    flags: u32,
) -> *mut Node {
    unsafe {
        let mut cursor = ListCursor::new();
        let hashnr = (*node).hashnr.load(Ordering::Relaxed);
        let keyp = (*node).key.load(Ordering::Relaxed);
        let keylen = (*node).keylen.load(Ordering::Relaxed);
        let key = slice::from_raw_parts(keyp as *const u8, keylen);
        let inserted;
        loop {
            if lfind(head, hashnr, key, &mut cursor, pins) && flags & LF_HASH_UNIQUE != 0 {
                inserted = false;
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

/// Mark and unlink the node with `(hashnr, key)`. Returns true on success.
/// Clears all pins.
unsafe fn ldelete(head: *const AtomicUsize, hashnr: u32, key: &[u8], pins: *mut Pins) -> bool {
    unsafe {
        let mut cursor = ListCursor::new();
        let res;
        loop {
            if !lfind(head, hashnr, key, &mut cursor, pins) {
                res = false;
                break;
            }
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
                    // somebody helped with the unlink; re-run the search so
                    // marks and unlinks stay in balance
                    lfind(head, hashnr, key, &mut cursor, pins);
                }
                res = true;
                break;
            }
        }
        unpin(pins, 0);
        unpin(pins, 1);
        unpin(pins, 2);
        res
    }
}

/// Find the node with `(hashnr, key)`. On success the node stays pinned on
/// pin 2. Pins 0..1 are cleared either way.
unsafe fn lsearch(
    head: *const AtomicUsize,
    hashnr: u32,
    key: &[u8],
    pins: *mut Pins,
) -> *mut Node {
    unsafe {
        let mut cursor = ListCursor::new();
        let found = lfind(head, hashnr, key, &mut cursor, pins);
        if found {
            pin(pins, 2, cursor.curr as *mut u8);
        }
        unpin(pins, 0);
        unpin(pins, 1);
        if found { cursor.curr } else { ptr::null_mut() }
    }
}

static DUMMY_KEY: u8 = 0;

pub struct HashMap {
    /// Bucket heads: `AtomicUsize` cells holding `*mut Node`.
    array: DynArray,
    /// Element allocator; elements are `HASH_OVERHEAD + element_size`.
    alloc: Slab,
    get_key: Option<GetKeyFn>,
    hash_function: HashFn,
    key_offset: usize,
    key_length: usize,
    element_size: usize,
    flags: u32,
    /// Logical bucket count; doubled by CAS when the load factor passes 1.
    size: AtomicU32,
    /// Number of elements.
    count: AtomicU32,
    initialize: Option<InitFn>,
}

unsafe impl Send for HashMap {}
unsafe impl Sync for HashMap {}

impl HashMap {
    /// Map of fixed-size elements whose key lives at
    /// `key_offset..key_offset + key_length` inside the element.
    pub fn new(element_size: usize, flags: u32, key_offset: usize, key_length: usize) -> Self {
        Self::with_hooks(
            element_size,
            flags,
            key_offset,
            key_length,
            None,
            None,
            None,
            None,
            None,
        )
    }

    /// Full-control constructor: key extraction hook (replaces
    /// offset/length), custom hash, slab creation/teardown hooks, and an
    /// element-initialization hook used by `insert` instead of a plain
    /// copy.
    #[allow(clippy::too_many_arguments)]
    pub fn with_hooks(
        element_size: usize,
        flags: u32,
        key_offset: usize,
        key_length: usize,
        get_key: Option<GetKeyFn>,
        hash_function: Option<HashFn>,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
        initialize: Option<InitFn>,
    ) -> Self {
        if get_key.is_some() {
            assert!(key_offset == 0 && key_length == 0);
        } else {
            assert!(key_length > 0);
        }
        Self {
            array: DynArray::new(mem::size_of::<AtomicUsize>()),
            alloc: Slab::with_hooks(
                HASH_OVERHEAD + element_size,
                NODE_FREE_PTR_OFFSET,
                ctor,
                dtor,
            ),
            get_key,
            hash_function: hash_function.unwrap_or(fnv1a32),
            key_offset,
            key_length,
            element_size,
            flags,
            size: AtomicU32::new(1),
            count: AtomicU32::new(0),
            initialize,
        }
    }

    pub fn get_pins(&self) -> *mut Pins {
        self.alloc.get_pins()
    }

    /// # Safety
    ///
    /// `pins` must come from this map's [`HashMap::get_pins`] and must not
    /// be used afterwards.
    pub unsafe fn put_pins(&self, pins: *mut Pins) {
        unsafe { pinbox_put_pins(pins) };
    }

    /// Release pin 2, which `search`/`random_match` leave holding their
    /// result. Mandatory after either call, found or not.
    ///
    /// # Safety
    ///
    /// `pins` must be the record passed to the preceding search.
    pub unsafe fn search_unpin(&self, pins: *mut Pins) {
        unsafe { unpin(pins, 2) };
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::SeqCst)
    }

    #[inline]
    unsafe fn element_key(&self, record: *const u8, len: &mut usize) -> *const u8 {
        if let Some(get_key) = self.get_key {
            unsafe { get_key(record, len) }
        } else {
            *len = self.key_length;
            unsafe { record.add(self.key_offset) }
        }
    }

    #[inline]
    fn calc_hash(&self, key: &[u8]) -> u32 {
        (self.hash_function)(key) & INT_MAX32
    }

    /// Insert a *copy* of `data` (or whatever the initialization hook
    /// builds from it).
    ///
    /// # Safety
    ///
    /// Without an initialization hook, `data` must be readable for
    /// `element_size` bytes. `pins` must be a live record of this map.
    pub unsafe fn insert(&self, pins: *mut Pins, data: *const u8) -> Result<(), MapError> {
        unsafe {
            let node = self.alloc.alloc(pins) as *mut Node;
            if node.is_null() {
                return Err(MapError::OutOfMemory);
            }
            let element = payload(node);
            if let Some(init) = self.initialize {
                init(element, data);
            } else {
                ptr::copy_nonoverlapping(data, element, self.element_size);
            }
            let mut keylen = 0usize;
            let keyp = self.element_key(element as *const u8, &mut keylen);
            (*node).key.store(keyp as *mut u8, Ordering::SeqCst);
            (*node).keylen.store(keylen, Ordering::SeqCst);
            let key = slice::from_raw_parts(keyp, keylen);
            let hashnr = self.calc_hash(key);

            let el = match self.bucket_head(hashnr, pins) {
                Some(el) => el,
                None => {
                    pins_free(pins, node as *mut u8);
                    return Err(MapError::OutOfMemory);
                }
            };
            (*node)
                .hashnr
                .store(reverse_bits(hashnr) | 1, Ordering::SeqCst);
            if !linsert(el, node, pins, self.flags).is_null() {
                pins_free(pins, node as *mut u8);
                return Err(MapError::Duplicate);
            }
            let csize = self.size.load(Ordering::SeqCst);
            let new_count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            if new_count as f64 / csize as f64 > MAX_LOAD {
                if self
                    .size
                    .compare_exchange(csize, csize * 2, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    stat_inc!(hash_resizes);
                }
            }
            Ok(())
        }
    }

    /// Find the element with the given key. `Ok(ptr)` points at the stored
    /// element and stays valid while pin 2 holds it — call
    /// [`HashMap::search_unpin`] when done (also after `Ok(None)`/errors).
    ///
    /// # Safety
    ///
    /// `pins` must be a live record of this map.
    pub unsafe fn search(&self, pins: *mut Pins, key: &[u8]) -> Result<Option<*const u8>, MapError> {
        unsafe {
            let hashnr = self.calc_hash(key);
            let el = self.bucket_head(hashnr, pins).ok_or(MapError::OutOfMemory)?;
            let found = lsearch(el, reverse_bits(hashnr) | 1, key, pins);
            if found.is_null() {
                Ok(None)
            } else {
                Ok(Some(payload(found) as *const u8))
            }
        }
    }

    /// Remove the element with the given key.
    ///
    /// # Safety
    ///
    /// `pins` must be a live record of this map.
    pub unsafe fn remove(&self, pins: *mut Pins, key: &[u8]) -> Result<(), MapError> {
        unsafe {
            let hashnr = self.calc_hash(key);
            // the bucket must be initialized even on the remove path: the
            // node may have been split into a bucket nobody touched yet
            let el = self.bucket_head(hashnr, pins).ok_or(MapError::OutOfMemory)?;
            if !ldelete(el, reverse_bits(hashnr) | 1, key, pins) {
                return Err(MapError::NotFound);
            }
            self.count.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Find some element satisfying `matcher`, scanning from the bucket
    /// selected by `rand_val` and wrapping to the head once. Pin 2 holds
    /// the result; [`HashMap::search_unpin`] is mandatory afterwards.
    ///
    /// # Safety
    ///
    /// `pins` must be a live record of this map.
    pub unsafe fn random_match(
        &self,
        pins: *mut Pins,
        matcher: unsafe fn(*const u8) -> bool,
        rand_val: u32,
    ) -> Result<Option<*const u8>, MapError> {
        unsafe {
            let hashnr = rand_val & INT_MAX32;
            let rev_hashnr = reverse_bits(hashnr);
            let el = self.bucket_head(hashnr, pins).ok_or(MapError::OutOfMemory)?;

            // start above the random point to avoid bias towards the first
            // element of the bucket
            let mut cursor = ListCursor::new();
            let mut res = lfind_match(el, rev_hashnr | 1, u32::MAX, matcher, &mut cursor, pins);
            if !res && hashnr != 0 {
                // nothing above the random point: wrap to the list head and
                // stop where the first pass started
                let el = self.array.lvalue(0) as *const AtomicUsize;
                if el.is_null() {
                    return Err(MapError::OutOfMemory);
                }
                res = lfind_match(el, 1, rev_hashnr, matcher, &mut cursor, pins);
            }
            if res {
                pin(pins, 2, cursor.curr as *mut u8);
                unpin(pins, 0);
                unpin(pins, 1);
                Ok(Some(payload(cursor.curr) as *const u8))
            } else {
                unpin(pins, 0);
                unpin(pins, 1);
                Ok(None)
            }
        }
    }

    /// Locate (and lazily initialize) the bucket head cell for `hashnr`.
    unsafe fn bucket_head(&self, hashnr: u32, pins: *mut Pins) -> Option<*const AtomicUsize> {
        unsafe {
            let bucket = hashnr % self.size.load(Ordering::SeqCst);
            let el = self.array.lvalue(bucket) as *const AtomicUsize;
            if el.is_null() {
                return None;
            }
            if (*el).load(Ordering::SeqCst) == 0 && !self.initialize_bucket(el, bucket, pins) {
                return None;
            }
            Some(el)
        }
    }

    /// Create the dummy node for `bucket` and publish it in `cell`.
    /// Recursively initializes the parent bucket first. Returns false on
    /// out-of-memory.
    unsafe fn initialize_bucket(
        &self,
        cell: *const AtomicUsize,
        bucket: u32,
        pins: *mut Pins,
    ) -> bool {
        unsafe {
            let parent = clear_highest_bit(bucket);
            let layout = Layout::new::<Node>();
            let mut dummy = alloc_zeroed(layout) as *mut Node;
            let parent_cell = self.array.lvalue(parent) as *const AtomicUsize;
            if parent_cell.is_null() || dummy.is_null() {
                return false;
            }
            if (*parent_cell).load(Ordering::SeqCst) == 0
                && bucket != 0
                && !self.initialize_bucket(parent_cell, parent, pins)
            {
                dealloc(dummy as *mut u8, layout);
                return false;
            }
            (*dummy)
                .hashnr
                .store(reverse_bits(bucket), Ordering::SeqCst); // even: dummy
            (*dummy)
                .key
                .store(&DUMMY_KEY as *const u8 as *mut u8, Ordering::SeqCst);
            (*dummy).keylen.store(0, Ordering::SeqCst);
            let cur = linsert(parent_cell, dummy, pins, LF_HASH_UNIQUE);
            if !cur.is_null() {
                // another thread's dummy won; it is never freed, so the
                // unpinned pointer is safe to publish
                dealloc(dummy as *mut u8, layout);
                dummy = cur;
            }
            stat_inc!(hash_buckets);
            let _ = (*cell).compare_exchange(
                0,
                dummy as usize,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            // if the CAS lost, the winner published the same dummy (it
            // found ours as its linsert duplicate); no retry, no leak
            true
        }
    }
}

impl Drop for HashMap {
    fn drop(&mut self) {
        let head = self.array.value(0) as *const AtomicUsize;
        if head.is_null() {
            return;
        }
        let mut el = unsafe { (*head).load(Ordering::Relaxed) as *mut Node };
        while !el.is_null() {
            let next = node_ptr(unsafe { (*el).link.load(Ordering::Relaxed) });
            unsafe {
                if (*el).hashnr.load(Ordering::Relaxed) & 1 != 0 {
                    self.alloc.direct_free(el as *mut u8); // real node
                } else {
                    dealloc(el as *mut u8, Layout::new::<Node>()); // dummy
                }
            }
            el = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    #[test]
    fn test_insert_search_remove() {
        // 7-byte elements "key1:v1", key = first 4 bytes
        let m = HashMap::new(7, 0, 0, 4);
        let pins = m.get_pins();
        unsafe {
            assert_eq!(m.insert(pins, b"key1:v1".as_ptr()), Ok(()));

            let found = m.search(pins, b"key1").unwrap();
            let p = found.expect("key1 not found");
            assert_eq!(slice::from_raw_parts(p, 7), b"key1:v1");
            m.search_unpin(pins);

            assert_eq!(m.remove(pins, b"key1"), Ok(()));
            assert_eq!(m.remove(pins, b"key1"), Err(MapError::NotFound));

            assert_eq!(m.insert(pins, b"key1:v1".as_ptr()), Ok(()));
            assert_eq!(m.remove(pins, b"key1"), Ok(()));
            m.put_pins(pins);
        }
    }

    #[test]
    fn test_unique_flag_rejects_duplicates() {
        let m = HashMap::new(7, LF_HASH_UNIQUE, 0, 4);
        let pins = m.get_pins();
        unsafe {
            assert_eq!(m.insert(pins, b"key2:v1".as_ptr()), Ok(()));
            assert_eq!(
                m.insert(pins, b"key2:v2".as_ptr()),
                Err(MapError::Duplicate)
            );
            assert_eq!(m.count(), 1);
            m.put_pins(pins);
        }
    }

    #[test]
    fn test_resize_keeps_everything_reachable() {
        let m = HashMap::new(8, LF_HASH_UNIQUE, 0, 8);
        let pins = m.get_pins();
        unsafe {
            for i in 0u64..2000 {
                let e = i.to_le_bytes();
                assert_eq!(m.insert(pins, e.as_ptr()), Ok(()));
            }
            assert!(m.size() > 1, "load factor 1 must have doubled the table");
            assert_eq!(m.count(), 2000);
            for i in 0u64..2000 {
                let k = i.to_le_bytes();
                let found = m.search(pins, &k).unwrap();
                assert!(found.is_some(), "key {i} lost after resize");
                m.search_unpin(pins);
            }
            m.put_pins(pins);
        }
    }

    #[test]
    fn test_random_match_wraps() {
        let m = HashMap::new(8, LF_HASH_UNIQUE, 0, 8);
        let pins = m.get_pins();
        unsafe fn match_any(_el: *const u8) -> bool {
            true
        }
        unsafe {
            // empty map: no match, any rand_val
            assert_eq!(m.random_match(pins, match_any, 12345).unwrap(), None);
            m.search_unpin(pins);

            let e = 7u64.to_le_bytes();
            m.insert(pins, e.as_ptr()).unwrap();
            for rand_val in [0u32, 1, 999_999, u32::MAX] {
                let found = m.random_match(pins, match_any, rand_val).unwrap();
                assert!(found.is_some(), "rand_val {rand_val} found nothing");
                m.search_unpin(pins);
            }
            m.put_pins(pins);
        }
    }

    #[test]
    fn test_multi_thread_disjoint_inserts() {
        let m: &'static HashMap = Box::leak(Box::new(HashMap::new(8, LF_HASH_UNIQUE, 0, 4)));
        let nthreads = 5u32;
        let per_thread = 10_000u32;
        let handles: Vec<_> = (0..nthreads)
            .map(|t| {
                std::thread::spawn(move || {
                    let pins = m.get_pins();
                    unsafe {
                        for i in 0..per_thread {
                            let k = t * per_thread + i;
                            let mut e = [0u8; 8];
                            e[..4].copy_from_slice(&k.to_le_bytes());
                            e[4..].copy_from_slice(&t.to_le_bytes());
                            assert_eq!(m.insert(pins, e.as_ptr()), Ok(()));
                        }
                        m.put_pins(pins);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.count(), nthreads * per_thread);
        let pins = m.get_pins();
        unsafe {
            for k in 0..nthreads * per_thread {
                let kb = k.to_le_bytes();
                let found = m.search(pins, &kb).unwrap();
                assert!(found.is_some(), "key {k} missing");
                m.search_unpin(pins);
            }
            m.put_pins(pins);
        }
    }

    #[test]
    fn test_concurrent_unique_insert_single_winner() {
        let m: &'static HashMap = Box::leak(Box::new(HashMap::new(8, LF_HASH_UNIQUE, 0, 8)));
        let winners: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(0)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(move || {
                    let pins = m.get_pins();
                    unsafe {
                        let e = 42u64.to_le_bytes();
                        if m.insert(pins, e.as_ptr()).is_ok() {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                        m.put_pins(pins);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(m.count(), 1);
    }
}
