//! Wait-free multi-word compare-and-set with cooperative helping.
//!
//! An operation is a descriptor: a run of [`CasRow`]s sorted by address
//! descending (so concurrent operations acquire addresses in one global
//! order), terminated by a sentinel row whose address is [`MCAS_END`].
//! Acquiring a row means tagging its word with a pointer to an
//! [`McasHelper`] (top bit set); each row's `mch` field settles exactly
//! once, to the owning helper or to the FAIL mark, and that single
//! transition is what every cooperating thread agrees on.
//!
//! Wait-freedom comes from publication: after `MAX_FAIL` failed attempts
//! on one row the worker publishes its descriptor in the pending-op
//! table, and every worker polls one slot of that table round-robin
//! before starting its own operation. Recursive helping is bounded by the
//! worker count; hitting the bound unwinds with a *full return* so the
//! helper can get back to its own stalled operation.
//!
//! Helper and descriptor memory is managed by the limbo engine: readers
//! hold a live [`LimboHandle`], so anything they can still see is retired
//! under a younger epoch and stays mapped until they are done.
//!
//! Words managed by this module hold user values in the low 63 bits; the
//! top bit is the helper tag and MUST be clear in every value.

use crate::config::MAX_FAIL;
use crate::limbo::{LimboHandle, ThreadInfo};
use crate::stat_inc;
use crate::sync::acquire_fence;
use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error};
use core::alloc::Layout;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Sentinel address value terminating a descriptor.
pub const MCAS_END: usize = 1;

/// `mch` value marking a failed operation.
const MCH_FAIL: usize = usize::MAX;

const HELPER_TAG: u64 = 1 << 63;

#[inline]
fn is_helper(v: u64) -> bool {
    v & HELPER_TAG != 0
}

#[inline]
fn helper_mask(p: *mut McasHelper) -> u64 {
    p as u64 | HELPER_TAG
}

#[inline]
fn helper_unmask(v: u64) -> *mut McasHelper {
    (v & !HELPER_TAG) as *mut McasHelper
}

/// One compare-and-set within a descriptor.
#[repr(C)]
pub struct CasRow {
    address: *mut AtomicU64,
    expected: u64,
    new_value: u64,
    /// 0 while undecided; then the owning helper, or `MCH_FAIL`. Settles
    /// exactly once.
    mch: AtomicUsize,
}

/// Tag object placed into a word while its operation is in flight. The
/// association with a row is only authoritative while `row.mch == self`.
#[repr(C)]
struct McasHelper {
    cr: *mut CasRow,
}

/// Caller-facing description of one word update.
#[derive(Clone, Copy)]
pub struct CasDesc {
    pub address: *mut AtomicU64,
    pub expected: u64,
    pub new_value: u64,
}

/// Per-worker helping state; one per worker, assigned at init.
pub struct McasCtx {
    thread_id: usize,
    /// Round-robin cursor over the pending-op table.
    check_id: usize,
    recur_depth: usize,
}

enum HelpStatus {
    Ok,
    Failed,
    FullReturn,
}

// ---------------------------------------------------------------------------
// Global tables
// ---------------------------------------------------------------------------

static PENDING_OPS: AtomicPtr<AtomicPtr<CasRow>> = AtomicPtr::new(ptr::null_mut());
static MCAS_CTXS: AtomicPtr<McasCtx> = AtomicPtr::new(ptr::null_mut());
static MCAS_WORKERS: AtomicUsize = AtomicUsize::new(0);

fn pending_layout(count: usize) -> Layout {
    Layout::array::<AtomicPtr<CasRow>>(count).unwrap()
}

fn ctxs_layout(count: usize) -> Layout {
    Layout::array::<McasCtx>(count).unwrap()
}

pub(crate) fn init_tables(worker_count: usize) {
    let pending = unsafe { alloc_zeroed(pending_layout(worker_count)) } as *mut AtomicPtr<CasRow>;
    if pending.is_null() {
        handle_alloc_error(pending_layout(worker_count));
    }
    let ctxs = unsafe { alloc_zeroed(ctxs_layout(worker_count)) } as *mut McasCtx;
    if ctxs.is_null() {
        handle_alloc_error(ctxs_layout(worker_count));
    }
    for i in 0..worker_count {
        unsafe {
            (*ctxs.add(i)).thread_id = i;
            (*ctxs.add(i)).check_id = (i + 1) % worker_count;
            (*ctxs.add(i)).recur_depth = 0;
        }
    }
    MCAS_WORKERS.store(worker_count, Ordering::Release);
    MCAS_CTXS.store(ctxs, Ordering::Release);
    PENDING_OPS.store(pending, Ordering::Release);
}

pub(crate) unsafe fn deinit_tables() {
    let pending = PENDING_OPS.swap(ptr::null_mut(), Ordering::AcqRel);
    let ctxs = MCAS_CTXS.swap(ptr::null_mut(), Ordering::AcqRel);
    let count = MCAS_WORKERS.swap(0, Ordering::AcqRel);
    unsafe {
        if !pending.is_null() {
            dealloc(pending as *mut u8, pending_layout(count));
        }
        if !ctxs.is_null() {
            dealloc(ctxs as *mut u8, ctxs_layout(count));
        }
    }
}

/// The helping context of worker `index`. Each worker must use only its
/// own.
pub fn mcas_ctx(index: usize) -> *mut McasCtx {
    let ctxs = MCAS_CTXS.load(Ordering::Acquire);
    assert!(!ctxs.is_null(), "lfkit::init has not run");
    assert!(index < MCAS_WORKERS.load(Ordering::Acquire));
    unsafe { ctxs.add(index) }
}

#[inline]
fn pending_slot(index: usize) -> *const AtomicPtr<CasRow> {
    let pending = PENDING_OPS.load(Ordering::Acquire);
    debug_assert!(!pending.is_null());
    unsafe { pending.add(index) }
}

// ---------------------------------------------------------------------------
// Core algorithm
// ---------------------------------------------------------------------------

unsafe fn allocate_helper(handle: *mut LimboHandle, cr: *mut CasRow) -> *mut McasHelper {
    unsafe {
        let mch = (*handle).alloc(mem::size_of::<McasHelper>()) as *mut McasHelper;
        assert!(!mch.is_null());
        (*mch).cr = cr;
        mch
    }
}

/// Settle `cr` (and then the last row) as failed. Only the thread whose
/// CAS moves `mch` from 0 wins; everyone else defers to the settled value.
unsafe fn set_mcas_fail(cr: *mut CasRow, last_row: *mut CasRow) {
    unsafe {
        if (*cr)
            .mch
            .compare_exchange(0, MCH_FAIL, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = (*last_row)
                .mch
                .compare_exchange(0, MCH_FAIL, Ordering::SeqCst, Ordering::SeqCst);
        }
    }
}

/// Acquire `cr`'s address for its operation: leave the address holding a
/// tagged helper and `cr.mch` settled (helper or FAIL). On return the row
/// is settled one way or the other; losing helpers are restored and
/// retired along the way.
unsafe fn place_mcas_helper(
    ctx: *mut McasCtx,
    handle: *mut LimboHandle,
    cr: *mut CasRow,
    last_row: *mut CasRow,
) {
    unsafe {
        let address = (*cr).address;
        let evalue = (*cr).expected;
        let mch = allocate_helper(handle, cr);
        let mut cvalue = (*address).load(Ordering::Relaxed);
        let mut tries: u32 = 0;

        while (*cr).mch.load(Ordering::SeqCst) == 0 {
            if tries == MAX_FAIL {
                if (*ctx).recur_depth > 0 {
                    // helping someone else and stuck: unwind to our own
                    // operation instead of publishing theirs
                    set_mcas_fail(cr, last_row);
                    if (*cr).mch.load(Ordering::SeqCst) != mch as usize {
                        (*handle).dealloc(mch as *mut u8);
                    }
                    return;
                }
                // publish so any worker can finish this operation
                stat_inc!(mcas_publishes);
                (*pending_slot((*ctx).thread_id)).store(cr, Ordering::SeqCst);
            }
            tries = tries.wrapping_add(1);

            if !is_helper(cvalue) {
                // the word holds a plain value: claim it if it matches
                match (*address).compare_exchange(
                    evalue,
                    helper_mask(mch),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        match (*cr).mch.compare_exchange(
                            0,
                            mch as usize,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        ) {
                            Ok(_) => {}
                            Err(emch) => {
                                if emch != mch as usize {
                                    // another helper completed this row;
                                    // take our tag back out of the word
                                    if (*address)
                                        .compare_exchange(
                                            helper_mask(mch),
                                            evalue,
                                            Ordering::SeqCst,
                                            Ordering::SeqCst,
                                        )
                                        .is_ok()
                                    {
                                        (*handle).dealloc(mch as *mut u8);
                                    }
                                }
                            }
                        }
                        return;
                    }
                    Err(actual) => {
                        if is_helper(actual) {
                            // not a value mismatch: some operation holds the
                            // word, resolve it next iteration
                            cvalue = actual;
                            continue;
                        }
                        // plain value != expected: the operation fails below
                    }
                }
            } else {
                acquire_fence();
                let cmch = helper_unmask(cvalue);
                if cr == (*cmch).cr {
                    // another worker already placed a helper for this row
                    let emch = match (*cr).mch.compare_exchange(
                        0,
                        cmch as usize,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => 0,
                        Err(emch) => {
                            if emch != cmch as usize {
                                // the row settled on yet another helper;
                                // restore the word and retire this one
                                if (*address)
                                    .compare_exchange(
                                        cvalue,
                                        evalue,
                                        Ordering::SeqCst,
                                        Ordering::SeqCst,
                                    )
                                    .is_ok()
                                {
                                    (*handle).dealloc(cmch as *mut u8);
                                }
                            }
                            emch
                        }
                    };
                    if mch as usize != emch {
                        (*handle).dealloc(mch as *mut u8);
                    }
                    return;
                } else if should_replace(ctx, handle, evalue, cmch) {
                    // the blocking operation is finished and its logical
                    // value matches: overwrite its helper with ours
                    match (*address).compare_exchange(
                        cvalue,
                        helper_mask(mch),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => {
                            match (*cr).mch.compare_exchange(
                                0,
                                mch as usize,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            ) {
                                Ok(_) => {}
                                Err(emch) => {
                                    if emch != mch as usize {
                                        if (*address)
                                            .compare_exchange(
                                                helper_mask(mch),
                                                evalue,
                                                Ordering::SeqCst,
                                                Ordering::SeqCst,
                                            )
                                            .is_ok()
                                        {
                                            (*handle).dealloc(mch as *mut u8);
                                        }
                                    }
                                }
                            }
                            return;
                        }
                        Err(actual) => {
                            cvalue = actual;
                            continue;
                        }
                    }
                }
                // the blocking operation's value cannot equal ours
            }

            // value mismatch: the whole operation fails
            set_mcas_fail(cr, last_row);
            break;
        }

        if (*cr).mch.load(Ordering::SeqCst) != mch as usize {
            (*handle).dealloc(mch as *mut u8);
        }
    }
}

/// Decide whether the logical value of the word tagged with `cmch` equals
/// `ev`. Helps the owning operation to completion first, so the logical
/// value is settled.
unsafe fn should_replace(
    ctx: *mut McasCtx,
    handle: *mut LimboHandle,
    ev: u64,
    cmch: *mut McasHelper,
) -> bool {
    unsafe {
        let cr = (*cmch).cr;
        debug_assert!(!cr.is_null());
        if (*cr).expected != ev && (*cr).new_value != ev {
            return false;
        }
        match help_complete(ctx, handle, cr) {
            HelpStatus::Ok => {
                if (*cr).mch.load(Ordering::Relaxed) == cmch as usize {
                    (*cr).new_value == ev
                } else {
                    // the operation succeeded but through a different
                    // helper; ours will be rolled back to `ev`
                    (*cr).expected == ev
                }
            }
            HelpStatus::FullReturn => false,
            HelpStatus::Failed => (*cr).expected == ev,
        }
    }
}

/// Poll one pending-op slot round-robin and finish whatever is published
/// there.
unsafe fn help_if_needed(ctx: *mut McasCtx, handle: *mut LimboHandle) {
    unsafe {
        let workers = MCAS_WORKERS.load(Ordering::Acquire);
        (*ctx).check_id = ((*ctx).check_id + 1) % workers;
        if (*ctx).check_id == (*ctx).thread_id {
            return;
        }
        let cr = (*pending_slot((*ctx).check_id)).load(Ordering::SeqCst);
        if !cr.is_null() {
            acquire_fence();
            stat_inc!(mcas_helps);
            help_complete(ctx, handle, cr);
        }
    }
}

/// Drive the descriptor containing `cr` to a settled state, starting at
/// `cr`. Recursion depth is bounded by the worker count; at the bound the
/// helper abandons the chain with `FullReturn`.
unsafe fn help_complete(
    ctx: *mut McasCtx,
    handle: *mut LimboHandle,
    mut cr: *mut CasRow,
) -> HelpStatus {
    unsafe {
        (*ctx).recur_depth += 1;
        if (*ctx).recur_depth >= MCAS_WORKERS.load(Ordering::Acquire) {
            // deeper than the worker count means our own operation's
            // dependency chain changed under us: unwind
            (*ctx).recur_depth -= 1;
            return HelpStatus::FullReturn;
        }

        let mut last_row = cr.add(1);
        while (*last_row).address as usize != MCAS_END {
            last_row = last_row.add(1);
        }
        last_row = last_row.sub(1);

        loop {
            if (*last_row).mch.load(Ordering::SeqCst) == 0 {
                place_mcas_helper(ctx, handle, cr, last_row);
                if (*cr).mch.load(Ordering::Relaxed) == MCH_FAIL {
                    break;
                }
            } else {
                break;
            }
            if cr == last_row {
                break;
            }
            cr = cr.add(1);
        }
        (*ctx).recur_depth -= 1;
        if (*last_row).mch.load(Ordering::Relaxed) != MCH_FAIL {
            HelpStatus::Ok
        } else {
            HelpStatus::Failed
        }
    }
}

/// Replace every settled helper with the row's final value and retire it.
unsafe fn remove_mcas_helper(
    _ctx: *mut McasCtx,
    handle: *mut LimboHandle,
    passed: bool,
    mut m: *mut CasRow,
    last_row: *mut CasRow,
) {
    unsafe {
        debug_assert!(m <= last_row);
        loop {
            let mch = (*m).mch.load(Ordering::Relaxed);
            if mch == MCH_FAIL {
                return;
            }
            let tagged = helper_mask(mch as *mut McasHelper);
            if passed {
                let _ = (*(*m).address).compare_exchange(
                    tagged,
                    (*m).new_value,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            } else {
                let _ = (*(*m).address).compare_exchange(
                    tagged,
                    (*m).expected,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
            (*handle).dealloc(mch as *mut u8);
            if m == last_row {
                return;
            }
            m = m.add(1);
        }
    }
}

unsafe fn invoke_mcas(
    ctx: *mut McasCtx,
    handle: *mut LimboHandle,
    mcasp: *mut CasRow,
    last_row: *mut CasRow,
) -> bool {
    unsafe {
        (*ctx).recur_depth = 0;
        // first pay the helping tax: finish one published operation
        help_if_needed(ctx, handle);

        let mut m = mcasp;
        loop {
            // last_row.mch doubles as the operation state: 0 in flight,
            // FAIL failed, anything else success — no extra state word
            if (*last_row).mch.load(Ordering::SeqCst) == 0 {
                place_mcas_helper(ctx, handle, m, last_row);
            } else {
                break;
            }
            if m == last_row {
                break;
            }
            m = m.add(1);
        }

        (*pending_slot((*ctx).thread_id)).store(ptr::null_mut(), Ordering::SeqCst);
        let passed = (*last_row).mch.load(Ordering::SeqCst) != MCH_FAIL;
        remove_mcas_helper(ctx, handle, passed, mcasp, last_row);
        passed
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Atomically compare-and-set every word in `desc`. Returns whether all
/// matched and were updated; a value mismatch is an ordinary `false`, not
/// an error.
///
/// # Safety
///
/// `ctx` must be the calling worker's context and `handle` a live handle
/// of the same worker. Every address must stay valid for the whole call
/// and hold only values with the top bit clear; `desc` must not name the
/// same address twice.
pub unsafe fn mcas(ctx: *mut McasCtx, handle: *mut LimboHandle, desc: &mut [CasDesc]) -> bool {
    if desc.is_empty() {
        return true;
    }
    // address-descending order prevents circular waits between operations
    desc.sort_unstable_by(|a, b| (b.address as usize).cmp(&(a.address as usize)));

    unsafe {
        let n = desc.len();
        let rows = (*handle).alloc((n + 1) * mem::size_of::<CasRow>()) as *mut CasRow;
        assert!(!rows.is_null());
        for (i, d) in desc.iter().enumerate() {
            debug_assert!(!d.address.is_null());
            debug_assert!(!is_helper(d.expected) && !is_helper(d.new_value));
            rows.add(i).write(CasRow {
                address: d.address,
                expected: d.expected,
                new_value: d.new_value,
                mch: AtomicUsize::new(0),
            });
        }
        rows.add(n).write(CasRow {
            address: MCAS_END as *mut AtomicU64,
            expected: 0,
            new_value: 0,
            mch: AtomicUsize::new(0),
        });
        let last_row = rows.add(n - 1);

        let ret = invoke_mcas(ctx, handle, rows, last_row);

        (*handle).dealloc(rows as *mut u8);
        ret
    }
}

/// Read the logical value of `*address`: the raw value when untagged,
/// otherwise the settled outcome of the operation holding the word
/// (helping it finish first).
///
/// # Safety
///
/// As [`mcas`].
pub unsafe fn mcas_read(
    ctx: *mut McasCtx,
    handle: *mut LimboHandle,
    address: *mut AtomicU64,
) -> u64 {
    unsafe {
        debug_assert_eq!((*ctx).recur_depth, 0);
        let cvalue = (*address).load(Ordering::Relaxed);
        if !is_helper(cvalue) {
            return cvalue;
        }
        acquire_fence();
        let mch = helper_unmask(cvalue);
        let cr = (*mch).cr;
        match help_complete(ctx, handle, cr) {
            HelpStatus::Ok if (*cr).mch.load(Ordering::Relaxed) == mch as usize => {
                (*cr).new_value
            }
            _ => (*cr).expected,
        }
    }
}

/// Convenience wrapper binding a worker's limbo and mcas contexts.
pub struct McasWorker {
    pub ti: *mut ThreadInfo,
    pub ctx: *mut McasCtx,
}

impl McasWorker {
    pub fn new(index: usize) -> Self {
        Self {
            ti: crate::limbo::thread_info(index),
            ctx: mcas_ctx(index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limbo::test_support::test_worker;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    #[test]
    fn test_mcas_empty_succeeds() {
        let w = McasWorker::new(test_worker());
        unsafe {
            let ti = &mut *w.ti;
            let h = ti.new_handle();
            assert!(mcas(w.ctx, h, &mut []));
            ti.delete_handle(h);
        }
    }

    #[test]
    fn test_mcas_two_words() {
        let a: &'static AtomicU64 = Box::leak(Box::new(AtomicU64::new(1)));
        let b: &'static AtomicU64 = Box::leak(Box::new(AtomicU64::new(2)));
        let w = McasWorker::new(test_worker());
        unsafe {
            let ti = &mut *w.ti;
            let h = ti.new_handle();

            let mut desc = [
                CasDesc {
                    address: a as *const AtomicU64 as *mut AtomicU64,
                    expected: 1,
                    new_value: 10,
                },
                CasDesc {
                    address: b as *const AtomicU64 as *mut AtomicU64,
                    expected: 2,
                    new_value: 20,
                },
            ];
            assert!(mcas(w.ctx, h, &mut desc));
            assert_eq!(mcas_read(w.ctx, h, a as *const AtomicU64 as *mut AtomicU64), 10);
            assert_eq!(mcas_read(w.ctx, h, b as *const AtomicU64 as *mut AtomicU64), 20);

            // one stale expectation fails the whole operation
            let mut desc = [
                CasDesc {
                    address: a as *const AtomicU64 as *mut AtomicU64,
                    expected: 10,
                    new_value: 11,
                },
                CasDesc {
                    address: b as *const AtomicU64 as *mut AtomicU64,
                    expected: 999,
                    new_value: 21,
                },
            ];
            assert!(!mcas(w.ctx, h, &mut desc));
            assert_eq!(mcas_read(w.ctx, h, a as *const AtomicU64 as *mut AtomicU64), 10);
            assert_eq!(mcas_read(w.ctx, h, b as *const AtomicU64 as *mut AtomicU64), 20);

            ti.delete_handle(h);
        }
    }

    #[test]
    fn test_mcas_single_word_loop() {
        let a: &'static AtomicU64 = Box::leak(Box::new(AtomicU64::new(0)));
        let w = McasWorker::new(test_worker());
        unsafe {
            let ti = &mut *w.ti;
            for i in 0..1000u64 {
                let h = ti.new_handle();
                let addr = a as *const AtomicU64 as *mut AtomicU64;
                let cur = mcas_read(w.ctx, h, addr);
                assert_eq!(cur, i);
                let mut desc = [CasDesc {
                    address: addr,
                    expected: cur,
                    new_value: cur + 1,
                }];
                assert!(mcas(w.ctx, h, &mut desc));
                ti.delete_handle(h);
            }
            assert_eq!(a.load(Ordering::SeqCst), 1000);
        }
    }

    #[test]
    fn test_mcas_pair_stays_consistent_across_threads() {
        // two words that must always be equal under concurrent mcas
        let cells: &'static [AtomicU64; 2] =
            Box::leak(Box::new([AtomicU64::new(0), AtomicU64::new(0)]));
        let nthreads = 4usize;
        let iters = 3000u64;

        let handles: Vec<_> = (0..nthreads)
            .map(|_| {
                std::thread::spawn(move || {
                    let w = McasWorker::new(test_worker());
                    unsafe {
                        let ti = &mut *w.ti;
                        for i in 1..=iters {
                            let h = ti.new_handle();
                            let a0 = &cells[0] as *const AtomicU64 as *mut AtomicU64;
                            let a1 = &cells[1] as *const AtomicU64 as *mut AtomicU64;
                            let g0 = mcas_read(w.ctx, h, a0);
                            let g1 = mcas_read(w.ctx, h, a1);
                            let mut desc = [
                                CasDesc {
                                    address: a0,
                                    expected: g0,
                                    new_value: i,
                                },
                                CasDesc {
                                    address: a1,
                                    expected: g1,
                                    new_value: i,
                                },
                            ];
                            mcas(w.ctx, h, &mut desc);
                            ti.delete_handle(h);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let w = McasWorker::new(test_worker());
        unsafe {
            let ti = &mut *w.ti;
            let h = ti.new_handle();
            let v0 = mcas_read(w.ctx, h, &cells[0] as *const AtomicU64 as *mut AtomicU64);
            let v1 = mcas_read(w.ctx, h, &cells[1] as *const AtomicU64 as *mut AtomicU64);
            assert_eq!(v0, v1, "the two words diverged");
            ti.delete_handle(h);
        }
    }
}
