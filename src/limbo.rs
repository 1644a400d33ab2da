//! Epoch-based deferred reclamation (RCU).
//!
//! A monotonically increasing global epoch stamps [`LimboHandle`]
//! lifetimes. Each worker thread owns one [`ThreadInfo`] with a
//! single-writer queue of [`LimboGroup`] pages holding retired pointers
//! interleaved with epoch markers. A pointer retired at epoch `e` is freed
//! only once every thread's oldest live handle is younger than `e`
//! (`min_active_epoch() > e`).
//!
//! A handle binds to its creating thread for its whole life; that makes
//! the per-thread handle list and group queue single-writer structures
//! needing no atomics beyond the `min_epoch` other threads read. The
//! global minimum may lag reality — that only delays reclamation, never
//! breaks it.
//!
//! Retired pointers carry a memory tag: the low 8 bits select a
//! per-thread free-object pool (0 = plain heap-backed, freed outright),
//! and the distinguished [`MEMTAG_RCU_CALLBACK`] marks a callback object
//! whose `call` hook runs at reclamation time. Anything else is a bug and
//! aborts. Sized allocations carry a 16-byte header recording their
//! length so deferred frees need no layout.

use crate::config::{CLEAN_BUDGET, HANDLE_BATCH, LIMBO_GROUP_CAPACITY};
use crate::stat_inc;
use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error};
use alloc::boxed::Box;
use core::alloc::Layout;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

pub type Epoch = u64;

/// Plain heap-backed memory: freed with the sized-header free.
pub const MEMTAG_NONE: u32 = 0;
/// Low 8 bits of a tag: per-thread pool index (0 = no pool).
pub const POOL_TAG_MASK: u32 = 0xFF;
/// The retired pointer is an [`RcuHead`] whose hook runs at reclamation.
pub const MEMTAG_RCU_CALLBACK: u32 = 0x100;

const POOL_COUNT: usize = 256;

static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(0);

/// Current value of the global epoch counter.
#[inline]
pub fn global_epoch() -> Epoch {
    GLOBAL_EPOCH.load(Ordering::Acquire)
}

/// Callback object header. Concrete callbacks embed this as their first
/// field; `call` receives the object itself and the reclaiming thread.
/// The callback owns its memory — free through
/// [`ThreadInfo::direct_free`] or re-register, but do one of the two.
#[repr(C)]
pub struct RcuHead {
    pub call: unsafe fn(*mut RcuHead, *mut ThreadInfo),
}

// ---------------------------------------------------------------------------
// Sized allocations
// ---------------------------------------------------------------------------

const ALLOC_HEADER: usize = 16;

/// Zeroing allocator stamping the total length just below the returned
/// pointer, so the matching free needs nothing but the pointer.
unsafe fn sized_alloc(size: usize) -> *mut u8 {
    let total = size + ALLOC_HEADER;
    let layout = Layout::from_size_align(total, ALLOC_HEADER).unwrap();
    let base = unsafe { alloc_zeroed(layout) };
    if base.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        (base as *mut usize).write(total);
        base.add(ALLOC_HEADER)
    }
}

unsafe fn sized_free(p: *mut u8) {
    unsafe {
        let base = p.sub(ALLOC_HEADER);
        let total = (base as *const usize).read();
        dealloc(base, Layout::from_size_align(total, ALLOC_HEADER).unwrap());
    }
}

/// Bytes usable at `p` (the size its `sized_alloc` was asked for).
unsafe fn sized_usable(p: *mut u8) -> usize {
    unsafe { (p.sub(ALLOC_HEADER) as *const usize).read() - ALLOC_HEADER }
}

// ---------------------------------------------------------------------------
// LimboGroup
// ---------------------------------------------------------------------------

/// One queue entry: an epoch marker (`ptr` null, `meta` = epoch) or a
/// retired item (`ptr` set, `meta` = memory tag).
#[repr(C)]
#[derive(Clone, Copy)]
struct LimboEntry {
    ptr: *mut u8,
    meta: u64,
}

/// Page of retired-pointer entries. Groups are recycled through the
/// owner's queue, not freed, until the thread tears down.
#[repr(C)]
pub struct LimboGroup {
    head: u32,
    tail: u32,
    /// Epoch of the most recently pushed marker; a push whose epoch still
    /// matches skips the marker.
    epoch: Epoch,
    next: *mut LimboGroup,
    entries: [LimboEntry; LIMBO_GROUP_CAPACITY],
}

fn alloc_group() -> *mut LimboGroup {
    let layout = Layout::new::<LimboGroup>();
    let g = unsafe { alloc_zeroed(layout) } as *mut LimboGroup;
    if g.is_null() {
        handle_alloc_error(layout);
    }
    g
}

unsafe fn free_group(g: *mut LimboGroup) {
    unsafe { dealloc(g as *mut u8, Layout::new::<LimboGroup>()) };
}

impl LimboGroup {
    fn first_epoch(&self) -> Epoch {
        debug_assert!(self.head != self.tail);
        let e = self.entries[self.head as usize];
        debug_assert!(e.ptr.is_null());
        e.meta
    }

    /// Append `[marker?, item]`. Needs two free slots.
    fn push_back(&mut self, p: *mut u8, tag: u32, epoch: Epoch) {
        debug_assert!(self.tail as usize + 2 <= LIMBO_GROUP_CAPACITY);
        if self.head == self.tail || self.epoch != epoch {
            self.entries[self.tail as usize] = LimboEntry {
                ptr: ptr::null_mut(),
                meta: epoch,
            };
            self.tail += 1;
            self.epoch = epoch;
        }
        self.entries[self.tail as usize] = LimboEntry {
            ptr: p,
            meta: tag as u64,
        };
        self.tail += 1;
    }
}

/// Consume entries of `group` whose epoch is at most `epoch_bound`, at
/// most `count` items. Returns the remaining budget. When the budget runs
/// out mid-group, the consumed slot is overwritten with an epoch marker so
/// the item cannot be freed twice on resume.
unsafe fn clean_until(
    group: *mut LimboGroup,
    ti: *mut ThreadInfo,
    epoch_bound: Epoch,
    mut count: u32,
) -> u32 {
    unsafe {
        let mut epoch: Epoch = 0;
        while (*group).head != (*group).tail {
            let e = (*group).entries[(*group).head as usize];
            if e.ptr.is_null() {
                epoch = e.meta;
                if epoch_bound < epoch {
                    break;
                }
            } else {
                dispatch_retired(ti, e.ptr, e.meta as u32);
                count -= 1;
                if count == 0 {
                    (*group).entries[(*group).head as usize] = LimboEntry {
                        ptr: ptr::null_mut(),
                        meta: epoch,
                    };
                    break;
                }
            }
            (*group).head += 1;
        }
        if (*group).head == (*group).tail {
            (*group).head = 0;
            (*group).tail = 0;
        }
        count
    }
}

/// Free, pool, or invoke a reclaimed entry according to its tag.
unsafe fn dispatch_retired(ti: *mut ThreadInfo, p: *mut u8, tag: u32) {
    unsafe {
        if tag == MEMTAG_RCU_CALLBACK {
            stat_inc!(limbo_callbacks);
            let head = p as *mut RcuHead;
            ((*head).call)(head, ti);
        } else if tag & !POOL_TAG_MASK == 0 {
            let pool = (tag & POOL_TAG_MASK) as usize;
            if pool != 0 {
                stat_inc!(limbo_pooled);
                (p as *mut *mut u8).write((*ti).pools[pool]);
                (*ti).pools[pool] = p;
            } else {
                stat_inc!(limbo_frees);
                sized_free(p);
            }
        } else {
            panic!("limbo: unrecognized memory tag {:#x}", tag);
        }
    }
}

// ---------------------------------------------------------------------------
// LimboHandle
// ---------------------------------------------------------------------------

/// Epoch-stamped handle. While a handle is live, nothing retired at or
/// after its epoch is reclaimed anywhere in the process. Bound to the
/// creating thread for its whole life.
pub struct LimboHandle {
    prev: *mut LimboHandle,
    next: *mut LimboHandle,
    ti: *mut ThreadInfo,
    my_epoch: Epoch,
    /// Small staging buffer; flushed to the group queue when full and at
    /// handle deletion.
    buf: [(*mut u8, u32); HANDLE_BATCH],
    buf_len: usize,
}

impl LimboHandle {
    fn empty() -> Self {
        Self {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            ti: ptr::null_mut(),
            my_epoch: 0,
            buf: [(ptr::null_mut(), 0); HANDLE_BATCH],
            buf_len: 0,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.my_epoch
    }

    /// Zeroing allocation through the owning thread.
    ///
    /// # Safety
    ///
    /// Only the owning thread may call this.
    pub unsafe fn alloc(&mut self, size: usize) -> *mut u8 {
        unsafe { (*self.ti).alloc(size, MEMTAG_NONE) }
    }

    /// Stage `p` for deferred free (plain heap-backed memory).
    ///
    /// # Safety
    ///
    /// `p` must come from this subsystem's alloc and be retired once.
    pub unsafe fn dealloc(&mut self, p: *mut u8) {
        unsafe { self.dealloc_tagged(p, MEMTAG_NONE) };
    }

    /// Stage `p` for deferred free with an explicit memory tag.
    ///
    /// # Safety
    ///
    /// As [`LimboHandle::dealloc`]; the tag must be a pool tag or
    /// [`MEMTAG_RCU_CALLBACK`].
    pub unsafe fn dealloc_tagged(&mut self, p: *mut u8, tag: u32) {
        if p.is_null() {
            return;
        }
        assert!(
            tag & !POOL_TAG_MASK == 0 || tag == MEMTAG_RCU_CALLBACK,
            "limbo: unrecognized memory tag {:#x}",
            tag
        );
        self.buf[self.buf_len] = (p, tag);
        self.buf_len += 1;
        if self.buf_len == HANDLE_BATCH {
            unsafe { self.flush() };
        }
    }

    unsafe fn flush(&mut self) {
        unsafe {
            let ti = self.ti;
            for i in 0..self.buf_len {
                let (p, tag) = self.buf[i];
                (*ti).push_retired(p, tag);
            }
        }
        self.buf_len = 0;
    }
}

// ---------------------------------------------------------------------------
// ThreadInfo
// ---------------------------------------------------------------------------

/// Per-worker reclamation state. Single-writer: only the owning thread
/// touches anything here except `min_epoch`, which other threads read
/// relaxed when computing the global minimum.
#[repr(C)]
pub struct ThreadInfo {
    index: u32,
    handle_count: u32,
    /// Oldest live handle's epoch; 0 when no handle is live.
    min_epoch: AtomicU64,
    /// Sentinel of the active-handle ring, oldest first.
    handle_ring: LimboHandle,
    /// Cache of returned handle allocations.
    empty_handles: *mut LimboHandle,
    group_head: *mut LimboGroup,
    group_tail: *mut LimboGroup,
    /// Free-object pools indexed by the tag's low byte; blocks chain
    /// through their first word.
    pools: [*mut u8; POOL_COUNT],
}

impl ThreadInfo {
    /// Fix up a zeroed slot into a live ThreadInfo.
    ///
    /// # Safety
    ///
    /// `ti` must point to zeroed, properly aligned, pinned memory.
    unsafe fn init_in_place(ti: *mut ThreadInfo, index: u32) {
        unsafe {
            (*ti).index = index;
            let ring = &raw mut (*ti).handle_ring;
            (*ring).prev = ring;
            (*ring).next = ring;
            let g = alloc_group();
            (*ti).group_head = g;
            (*ti).group_tail = g;
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn min_epoch(&self) -> Epoch {
        self.min_epoch.load(Ordering::Relaxed)
    }

    /// Open a handle stamped with a fresh epoch.
    ///
    /// # Safety
    ///
    /// Only the owning thread may call this; the ThreadInfo must stay
    /// pinned while any handle is live.
    pub unsafe fn new_handle(&mut self) -> *mut LimboHandle {
        stat_inc!(limbo_handles);
        let handle = if !self.empty_handles.is_null() {
            let h = self.empty_handles;
            self.empty_handles = unsafe { (*h).next };
            h
        } else {
            self.handle_count += 1;
            Box::into_raw(Box::new(LimboHandle::empty()))
        };
        unsafe {
            (*handle).ti = self as *mut ThreadInfo;
            (*handle).my_epoch = GLOBAL_EPOCH.fetch_add(1, Ordering::AcqRel) + 1;
            (*handle).buf_len = 0;

            // link at the ring tail; the ring is sorted by epoch
            let ring = &raw mut self.handle_ring;
            let prev = (*ring).prev;
            (*prev).next = handle;
            (*handle).prev = prev;
            (*handle).next = ring;
            (*ring).prev = handle;

            self.min_epoch
                .store((*(*ring).next).my_epoch, Ordering::Relaxed);
        }
        handle
    }

    /// Close a handle: flush its buffer, unlink it, refresh `min_epoch`,
    /// and reclaim what the new minimum allows.
    ///
    /// # Safety
    ///
    /// `handle` must be a live handle created by this ThreadInfo.
    pub unsafe fn delete_handle(&mut self, handle: *mut LimboHandle) {
        unsafe {
            let ring = &raw mut self.handle_ring;
            debug_assert!(handle != ring);
            (*handle).flush();

            let epoch = (*(*ring).next).my_epoch;
            (*(*handle).prev).next = (*handle).next;
            (*(*handle).next).prev = (*handle).prev;

            (*handle).prev = ptr::null_mut();
            (*handle).next = self.empty_handles;
            self.empty_handles = handle;

            if epoch != (*(*ring).next).my_epoch {
                self.min_epoch
                    .store((*(*ring).next).my_epoch, Ordering::Relaxed);
                self.hard_free();
            }
        }
    }

    /// Zeroing allocation; `tag`'s pool byte selects a per-thread pool to
    /// recycle from. Returns null on out-of-memory.
    ///
    /// # Safety
    ///
    /// Only the owning thread may call this. A non-zero pool tag must
    /// always be paired with one allocation size.
    pub unsafe fn alloc(&mut self, size: usize, tag: u32) -> *mut u8 {
        let pool = (tag & POOL_TAG_MASK) as usize;
        if pool != 0 {
            let p = self.pools[pool];
            if !p.is_null() {
                unsafe {
                    assert!(sized_usable(p) >= size);
                    self.pools[pool] = (p as *const *mut u8).read();
                    ptr::write_bytes(p, 0, size);
                }
                return p;
            }
        }
        unsafe { sized_alloc(size) }
    }

    /// Defer-free `p` (plain heap tag).
    ///
    /// # Safety
    ///
    /// `p` must come from [`ThreadInfo::alloc`] and be retired once; only
    /// the owning thread may call this.
    pub unsafe fn dealloc(&mut self, p: *mut u8) {
        unsafe { self.dealloc_tagged(p, MEMTAG_NONE) };
    }

    /// Defer-free `p` with an explicit tag.
    ///
    /// # Safety
    ///
    /// As [`ThreadInfo::dealloc`]; the tag must be recognized.
    pub unsafe fn dealloc_tagged(&mut self, p: *mut u8, tag: u32) {
        if p.is_null() {
            return;
        }
        assert!(
            tag & !POOL_TAG_MASK == 0 || tag == MEMTAG_RCU_CALLBACK,
            "limbo: unrecognized memory tag {:#x}",
            tag
        );
        unsafe { self.push_retired(p, tag) };
    }

    /// Queue a callback object to run after the current grace period.
    ///
    /// # Safety
    ///
    /// `head` must point to an [`RcuHead`]-prefixed object from
    /// [`ThreadInfo::alloc`]; only the owning thread may call this.
    pub unsafe fn register_rcu(&mut self, head: *mut RcuHead) {
        unsafe { self.push_retired(head as *mut u8, MEMTAG_RCU_CALLBACK) };
    }

    /// Free `p` immediately, bypassing the grace period. Only for memory
    /// no other thread can reach (e.g. a callback freeing itself).
    ///
    /// # Safety
    ///
    /// `p` must come from [`ThreadInfo::alloc`] and be unreachable.
    pub unsafe fn direct_free(&mut self, p: *mut u8) {
        unsafe { sized_free(p) };
    }

    unsafe fn push_retired(&mut self, p: *mut u8, tag: u32) {
        unsafe {
            if (*self.group_tail).tail as usize + 2 > LIMBO_GROUP_CAPACITY {
                self.refill_group();
            }
            let epoch = GLOBAL_EPOCH.load(Ordering::Acquire);
            (*self.group_tail).push_back(p, tag, epoch);
        }
    }

    unsafe fn refill_group(&mut self) {
        unsafe {
            if (*self.group_tail).next.is_null() {
                (*self.group_tail).next = alloc_group();
            }
            self.group_tail = (*self.group_tail).next;
            debug_assert!((*self.group_tail).head == 0 && (*self.group_tail).tail == 0);
        }
    }

    /// Reclaim queued entries up to the current safe epoch bound, at most
    /// `CLEAN_BUDGET` items. Groups drained empty are spliced behind the
    /// tail for reuse.
    ///
    /// # Safety
    ///
    /// Only the owning thread may call this.
    pub unsafe fn hard_free(&mut self) {
        let ti = self as *mut ThreadInfo;
        unsafe {
            let mut empty_head: *mut LimboGroup = ptr::null_mut();
            let mut empty_tail: *mut LimboGroup = ptr::null_mut();
            let mut count = CLEAN_BUDGET;

            let epoch_bound = min_active_epoch().wrapping_sub(1);
            let head = (*ti).group_head;
            if (*head).head == (*head).tail || (*head).first_epoch() > epoch_bound {
                return;
            }
            while count != 0 {
                count = clean_until((*ti).group_head, ti, epoch_bound, count);
                if (*(*ti).group_head).head != (*(*ti).group_head).tail {
                    break;
                }
                if empty_head.is_null() {
                    empty_head = (*ti).group_head;
                }
                empty_tail = (*ti).group_head;
                if (*ti).group_head == (*ti).group_tail {
                    (*ti).group_head = empty_head;
                    (*ti).group_tail = empty_head;
                    return;
                }
                (*ti).group_head = (*(*ti).group_head).next;
            }
            if !empty_head.is_null() {
                (*empty_tail).next = (*(*ti).group_tail).next;
                (*(*ti).group_tail).next = empty_head;
            }
        }
    }

    /// Tear down: drain everything (no handle may be live anywhere), then
    /// free cached handles, groups, and pools.
    ///
    /// # Safety
    ///
    /// Must run with no live handles in the process and no concurrent use
    /// of this ThreadInfo.
    unsafe fn destroy(&mut self) {
        let ti = self as *mut ThreadInfo;
        unsafe {
            debug_assert!((*ti).handle_ring.prev == &raw mut (*ti).handle_ring);
            // With no live handles the bound is unbounded. Callbacks may
            // re-register during the drain, so sweep until a full pass
            // finds every group empty.
            loop {
                let mut any = false;
                let mut g = (*ti).group_head;
                while !g.is_null() {
                    if (*g).head != (*g).tail {
                        clean_until(g, ti, Epoch::MAX, u32::MAX);
                        any = true;
                    }
                    g = (*g).next;
                }
                if !any {
                    break;
                }
            }
            while !(*ti).empty_handles.is_null() {
                let h = (*ti).empty_handles;
                (*ti).empty_handles = (*h).next;
                drop(Box::from_raw(h));
            }
            // recycled groups stay chained behind the tail, so the next
            // chain from the head covers every group
            let mut g = (*ti).group_head;
            while !g.is_null() {
                let next = (*g).next;
                free_group(g);
                g = next;
            }
            (*ti).group_head = ptr::null_mut();
            (*ti).group_tail = ptr::null_mut();
            for pool in (*ti).pools.iter_mut() {
                let mut p = *pool;
                while !p.is_null() {
                    let next = (p as *const *mut u8).read();
                    sized_free(p);
                    p = next;
                }
                *pool = ptr::null_mut();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Thread table
// ---------------------------------------------------------------------------

static THREADS: AtomicPtr<ThreadInfo> = AtomicPtr::new(ptr::null_mut());
static WORKER_COUNT: AtomicUsize = AtomicUsize::new(0);

fn threads_layout(count: usize) -> Layout {
    Layout::array::<ThreadInfo>(count).unwrap()
}

/// Allocate the fixed thread table. Returns false if already initialized.
pub(crate) fn init_threads(worker_count: usize) -> bool {
    assert!(worker_count > 0);
    let table = unsafe { alloc_zeroed(threads_layout(worker_count)) } as *mut ThreadInfo;
    if table.is_null() {
        handle_alloc_error(threads_layout(worker_count));
    }
    for i in 0..worker_count {
        unsafe { ThreadInfo::init_in_place(table.add(i), i as u32) };
    }
    if THREADS
        .compare_exchange(
            ptr::null_mut(),
            table,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        unsafe {
            for i in 0..worker_count {
                (*table.add(i)).destroy();
            }
            dealloc(table as *mut u8, threads_layout(worker_count));
        }
        return false;
    }
    WORKER_COUNT.store(worker_count, Ordering::Release);
    true
}

/// Tear down the thread table.
///
/// # Safety
///
/// No live handles and no concurrent use of any ThreadInfo.
pub(crate) unsafe fn deinit_threads() {
    let table = THREADS.swap(ptr::null_mut(), Ordering::AcqRel);
    if table.is_null() {
        return;
    }
    let count = WORKER_COUNT.swap(0, Ordering::AcqRel);
    unsafe {
        for i in 0..count {
            (*table.add(i)).destroy();
        }
        dealloc(table as *mut u8, threads_layout(count));
    }
}

pub(crate) fn worker_count() -> usize {
    WORKER_COUNT.load(Ordering::Acquire)
}

/// The ThreadInfo of worker `index`. Each worker must use only its own.
pub fn thread_info(index: usize) -> *mut ThreadInfo {
    let table = THREADS.load(Ordering::Acquire);
    assert!(!table.is_null(), "lfkit::init has not run");
    assert!(index < WORKER_COUNT.load(Ordering::Acquire));
    unsafe { table.add(index) }
}

/// Minimum epoch over every thread's oldest live handle; `1 << 63` when
/// no handle is live anywhere. May lag reality, which is safe — it only
/// delays reclamation.
pub fn min_active_epoch() -> Epoch {
    let mut ae: Epoch = 1 << 63;
    let table = THREADS.load(Ordering::Acquire);
    assert!(!table.is_null(), "lfkit::init has not run");
    let count = WORKER_COUNT.load(Ordering::Acquire);
    for i in 0..count {
        let m = unsafe { (*table.add(i)).min_epoch() };
        if m != 0 && m < ae {
            ae = m;
        }
    }
    ae
}

#[cfg(test)]
pub(crate) mod test_support {
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Once;

    static INIT: Once = Once::new();
    static NEXT_INDEX: AtomicUsize = AtomicUsize::new(0);

    /// Unit tests share one process: initialize a wide table once and hand
    /// out distinct worker slots.
    pub fn test_worker() -> usize {
        INIT.call_once(|| {
            assert!(crate::init(64).is_ok());
        });
        let idx = NEXT_INDEX.fetch_add(1, Ordering::SeqCst);
        assert!(idx < 64, "test worker table exhausted");
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::test_worker;

    #[test]
    fn test_handle_epochs_increase() {
        let ti = unsafe { &mut *thread_info(test_worker()) };
        unsafe {
            let h1 = ti.new_handle();
            let h2 = ti.new_handle();
            assert!((*h2).epoch() > (*h1).epoch());
            assert_eq!(ti.min_epoch(), (*h1).epoch());
            ti.delete_handle(h1);
            assert_eq!(ti.min_epoch(), (*h2).epoch());
            ti.delete_handle(h2);
            assert_eq!(ti.min_epoch(), 0);
        }
    }

    #[test]
    fn test_alloc_dealloc_churn_recycles_handles() {
        let ti = unsafe { &mut *thread_info(test_worker()) };
        unsafe {
            for _ in 0..10_000 {
                let h = ti.new_handle();
                let p = (*h).alloc(64);
                assert!(!p.is_null());
                p.write(b'a');
                (*h).dealloc(p);
                ti.delete_handle(h);
            }
            // every handle allocation came from the cache after the first
            assert_eq!(ti.handle_count, 1);
        }
    }

    #[test]
    fn test_grace_period_blocks_reclaim() {
        static FIRED: AtomicU64 = AtomicU64::new(0);

        #[repr(C)]
        struct FlagCallback {
            head: RcuHead,
        }
        unsafe fn fire(head: *mut RcuHead, ti: *mut ThreadInfo) {
            FIRED.fetch_add(1, Ordering::SeqCst);
            unsafe { (*ti).direct_free(head as *mut u8) };
        }

        let a = unsafe { &mut *thread_info(test_worker()) };
        let b = unsafe { &mut *thread_info(test_worker()) };
        unsafe {
            // b holds the grace period open
            let guard = b.new_handle();

            let cb =
                a.alloc(core::mem::size_of::<FlagCallback>(), MEMTAG_NONE) as *mut FlagCallback;
            (*cb).head.call = fire;
            a.register_rcu(&mut (*cb).head);

            for _ in 0..100 {
                a.hard_free();
            }
            assert_eq!(FIRED.load(Ordering::SeqCst), 0, "reclaimed under a live handle");

            b.delete_handle(guard);
            // other tests in this process may briefly hold handles with
            // older epochs; retry until the grace period passes
            for _ in 0..100_000 {
                a.hard_free();
                if FIRED.load(Ordering::SeqCst) == 1 {
                    break;
                }
                std::thread::yield_now();
            }
            assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_pool_tag_recycles_block() {
        let ti = unsafe { &mut *thread_info(test_worker()) };
        unsafe {
            let p1 = ti.alloc(128, 3);
            assert!(!p1.is_null());
            ti.dealloc_tagged(p1, 3);
            // retry: concurrent tests may briefly pin older epochs
            for _ in 0..100_000 {
                ti.hard_free();
                if !ti.pools[3].is_null() {
                    break;
                }
                std::thread::yield_now();
            }
            // the block went to pool 3 and comes back
            let p2 = ti.alloc(128, 3);
            assert_eq!(p1, p2);
            // the recycled block is zeroed again
            for i in 0..128 {
                assert_eq!(p2.add(i).read(), 0);
            }
            ti.dealloc_tagged(p2, 3);
        }
    }

    #[test]
    #[should_panic(expected = "unrecognized memory tag")]
    fn test_bad_tag_is_fatal() {
        let ti = unsafe { &mut *thread_info(test_worker()) };
        unsafe {
            let p = ti.alloc(8, MEMTAG_NONE);
            ti.dealloc_tagged(p, 0x7777);
        }
    }

    #[test]
    fn test_group_overflow_allocates_and_recycles() {
        let ti = unsafe { &mut *thread_info(test_worker()) };
        unsafe {
            // retire far more than one group holds
            let n = LIMBO_GROUP_CAPACITY * 3;
            for _ in 0..n {
                let p = ti.alloc(16, MEMTAG_NONE);
                ti.dealloc(p);
            }
            // drain; retry past other tests' short-lived handles
            for _ in 0..100_000 {
                ti.hard_free();
                if (*ti.group_head).head == (*ti.group_head).tail
                    && ti.group_head == ti.group_tail
                {
                    break;
                }
                std::thread::yield_now();
            }
            assert_eq!((*ti.group_head).head, (*ti.group_head).tail);
        }
    }
}
