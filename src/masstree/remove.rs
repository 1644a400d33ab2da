//! Removal: permutation drop, empty-leaf unlink, upward collapse of
//! empty internodes, and RCU-deferred layer garbage collection.
//!
//! Removing the last entry of a leaf unlinks it from the leaf list and
//! walks upward removing it from its parents; trivial single-child
//! internode chains collapse along the way, rewriting stale ikey bounds
//! (`redirect`). A leaf that is the only node of a *nested* layer cannot
//! be removed inline — a GC callback re-checks it after a grace period
//! and collapses the empty layer from its parent slot. Tree teardown is
//! a two-phase callback: mark the root deleted, wait out a grace period,
//! then walk the whole trie threading a work queue through the parent
//! pointers.

use crate::limbo::{RcuHead, ThreadInfo};
use crate::masstree::cursor::TCursor;
use crate::masstree::leaflink;
use crate::masstree::node::{
    InterNode, Leaf, MODSTATE_DELETED_LAYER, MODSTATE_INSERT, MODSTATE_REMOVE, NodeBase,
    inter_upper_bound, lv_layer, parent_link_ptr,
};
use core::mem;
use core::ptr;
use core::slice;
use core::sync::atomic::Ordering;

/// Drop the cursor's slot from its leaf. Returns true when the leaf
/// became empty and was consumed (lock included) by `remove_leaf`.
///
/// # Safety
///
/// Cursor leaf locked, slot valid; `ti` is the calling worker's.
pub(crate) unsafe fn finish_remove(cur: &mut TCursor<'_>, ti: &mut ThreadInfo) -> bool {
    unsafe {
        let n = cur.n;
        if (*n).modstate() == MODSTATE_INSERT {
            (*n).base.version.mark_insert();
            (*n).set_modstate(MODSTATE_REMOVE);
        }

        let mut perm = (*n).permutation();
        perm.remove(cur.kx.i as usize);
        (*n).permutation.store(perm.value(), Ordering::Relaxed);
        if perm.size() != 0 {
            false
        } else {
            remove_leaf(n, cur.root, cur.ka.prefix(), ti)
        }
    }
}

/// Unlink an empty leaf and collapse upward. Returns false (leaving the
/// leaf to the caller) when the leaf roots its layer.
///
/// # Safety
///
/// `leaf` locked and empty; `ti` is the calling worker's.
pub(crate) unsafe fn remove_leaf(
    leaf: *mut Leaf,
    root: *const NodeBase,
    prefix: &[u8],
    ti: &mut ThreadInfo,
) -> bool {
    unsafe {
        if (*leaf).prev.load(Ordering::Relaxed).is_null() {
            // leftmost leaf: it holds the layer's lower bound and stays.
            // An empty *nested* layer is collapsed after a grace period.
            if (*leaf).next.load(Ordering::Relaxed) == 0 && !prefix.is_empty() {
                make_gc_layer_callback(root as *mut NodeBase, prefix, ti);
            }
            return false;
        }

        (*leaf).base.version.mark_deleted();
        (*leaf).deallocate(ti);

        // Promote our phantom epoch into the predecessor: a range scan
        // crossing the gap must observe a version at least as new as this
        // leaf's last modification.
        loop {
            let prev = (*leaf).prev.load(Ordering::Relaxed);
            let leaf_pe = (*leaf).phantom_epoch.load(Ordering::Relaxed);
            let mut prev_ts = (*prev).phantom_epoch.load(Ordering::Relaxed);
            while prev_ts < leaf_pe {
                match (*prev).phantom_epoch.compare_exchange(
                    prev_ts,
                    leaf_pe,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(cur) => prev_ts = cur,
                }
            }
            crate::sync::compiler_barrier();
            if prev == (*leaf).prev.load(Ordering::Relaxed) {
                break;
            }
        }

        leaflink::unlink(leaf);

        // Remove from the tree, collapsing trivial chains and rewriting
        // ikey bounds when we were a 0th child.
        let mut ikey = (*leaf).ikey_bound();
        let mut n: *mut NodeBase = leaf as *mut NodeBase;
        let mut replacement: *mut NodeBase = ptr::null_mut();

        loop {
            let p = (*n).locked_parent();
            debug_assert!(!p.is_null());
            (*p).base.version.mark_insert();
            debug_assert!(!(*p).base.version.deleted());

            let kp = inter_upper_bound(ikey, &*p);
            debug_assert!(kp == 0 || (*p).ikey(kp - 1) <= ikey);
            debug_assert!((*p).child(kp) == n);

            (*p).set_child(kp, replacement);

            if !replacement.is_null() {
                (*replacement).set_parent(p as *mut NodeBase);
            } else if kp > 0 {
                (*p).shift_down(kp - 1, kp, (*p).size() - kp);
                (*p).set_size((*p).size() - 1);
            }

            if kp <= 1 && (*p).size() > 0 && (*p).child(0).is_null() {
                // we were the leftmost child: the parent's range now
                // starts at its first pivot
                redirect(p, ikey, (*p).ikey(0));
                ikey = (*p).ikey(0);
            }

            (*n).version.unlock();

            if (*p).size() > (*p).child(0).is_null() as usize || (*p).base.version.is_root() {
                (*p).base.version.unlock();
                return true;
            }

            // the parent kept a single child: collapse it too
            (*p).base.version.mark_deleted();
            (*p).deallocate(ti);
            n = p as *mut NodeBase;
            replacement = (*p).child((*p).size());
            (*p).set_child((*p).size(), ptr::null_mut());
        }
    }
}

/// Merge a removed subtree's key range into the preceding pivot of every
/// ancestor that still routes through it.
unsafe fn redirect(n: *mut InterNode, ikey: u64, replacement_ikey: u64) {
    unsafe {
        let mut n = n;
        let mut kp: i32 = -1;
        loop {
            let p = (*n).base.locked_parent();
            if kp >= 0 {
                (*n).base.version.unlock();
            }
            debug_assert!(!p.is_null());
            n = p;
            kp = inter_upper_bound(ikey, &*n) as i32;
            if kp > 0 {
                // n->ikey[kp-1] need not equal ikey
                (*n).set_ikey(kp as usize - 1, replacement_ikey);
            }
            if !(kp == 0 || (kp == 1 && (*n).child(0).is_null())) {
                break;
            }
        }
        (*n).base.version.unlock();
    }
}

// ---------------------------------------------------------------------------
// Layer GC callback
// ---------------------------------------------------------------------------

#[repr(C)]
struct GcLayerRcuCallback {
    head: RcuHead,
    root: *mut NodeBase,
    len: usize,
    // prefix bytes follow
}

unsafe fn gc_layer_prefix(cb: *mut GcLayerRcuCallback) -> &'static [u8] {
    unsafe {
        slice::from_raw_parts(
            (cb as *const u8).add(mem::size_of::<GcLayerRcuCallback>()),
            (*cb).len,
        )
    }
}

unsafe fn gc_layer_call(head: *mut RcuHead, ti: *mut ThreadInfo) {
    unsafe {
        let cb = head as *mut GcLayerRcuCallback;
        let mut root = (*cb).root;
        while !(*root).version.is_root() {
            root = (*root).maybe_parent();
        }
        if !(*root).version.deleted() {
            let mut lp = TCursor::new(root, gc_layer_prefix(cb));
            let do_remove = gc_layer(&mut lp, &mut *ti);
            if !do_remove || !finish_remove(&mut lp, &mut *ti) {
                (*lp.n).base.version.unlock();
            }
        }
        (*ti).direct_free(cb as *mut u8);
    }
}

/// Schedule an empty-layer collapse for the layer reached by `prefix`.
pub(crate) unsafe fn make_gc_layer_callback(
    root: *mut NodeBase,
    prefix: &[u8],
    ti: &mut ThreadInfo,
) {
    unsafe {
        let sz = mem::size_of::<GcLayerRcuCallback>() + prefix.len();
        let cb = ti.alloc(sz, crate::limbo::MEMTAG_NONE) as *mut GcLayerRcuCallback;
        assert!(!cb.is_null());
        (*cb).head.call = gc_layer_call;
        (*cb).root = root;
        (*cb).len = prefix.len();
        ptr::copy_nonoverlapping(
            prefix.as_ptr(),
            (cb as *mut u8).add(mem::size_of::<GcLayerRcuCallback>()),
            prefix.len(),
        );
        (*ti).register_rcu(&raw mut (*cb).head);
    }
}

/// Position the cursor on the layer-pointer slot named by its key and
/// collapse redundant internode chains below it. Returns true when the
/// nested layer was an empty leaf and got removed — the caller then
/// removes the slot itself via `finish_remove`.
///
/// # Safety
///
/// `ti` is the reclaiming worker's; the cursor's root must be the layer
/// root above the garbage layer.
pub(crate) unsafe fn gc_layer(cur: &mut TCursor<'_>, ti: &mut ThreadInfo) -> bool {
    unsafe {
        cur.find_locked(ti);
        debug_assert!(!(*cur.n).base.version.deleted() && !(*cur.n).deleted_layer());

        // find_locked may stop early if another collapse already removed
        // whole layers; insist the whole key was consumed
        if cur.ka.has_suffix() {
            return false;
        }

        cur.kx.i += cur.has_value() as i32;
        if cur.kx.i >= (*cur.n).size() as i32 {
            return false;
        }
        let perm = (*cur.n).permutation();
        cur.kx.p = perm.get(cur.kx.i as usize) as i32;
        if (*cur.n).ikey(cur.kx.p as usize) != cur.ka.ikey()
            || !(*cur.n).is_layer(cur.kx.p as usize)
        {
            return false;
        }

        // peel redundant internode layers off the slot
        let mut layer;
        loop {
            layer = lv_layer((*cur.n).lv(cur.kx.p as usize));
            if !(*layer).version.is_root() {
                (*cur.n).set_lv(cur.kx.p as usize, (*layer).maybe_parent() as u64);
                continue;
            }
            if (*layer).version.is_leaf() {
                break;
            }

            let in_ = layer as *mut InterNode;
            if (*in_).size() > 0 {
                return false;
            }
            (*in_).base.version.lock();
            if !(*in_).base.version.is_root() || (*in_).size() > 0 {
                (*layer).version.unlock();
                return false;
            }

            let child = (*in_).child(0);
            (*child).make_layer_root();
            (*cur.n).set_lv(cur.kx.p as usize, child as u64);
            (*in_).base.version.mark_split();
            (*in_).base.set_parent(child);
            (*in_).base.version.unlock();
            (*in_).deallocate(ti);
        }

        let lf = layer as *mut Leaf;
        if (*lf).size() > 0 {
            return false;
        }
        (*lf).base.version.lock();
        if !(*lf).base.version.is_root() || (*lf).size() > 0 {
            (*lf).base.version.unlock();
            return false;
        }

        // the nested layer is an empty leaf: kill it
        debug_assert!((*lf).prev.load(Ordering::Relaxed).is_null());
        debug_assert!((*lf).next.load(Ordering::Relaxed) == 0);
        debug_assert!(!(*lf).base.version.deleted());
        debug_assert!(!(*lf).deleted_layer());
        let lf_pe = (*lf).phantom_epoch.load(Ordering::Relaxed);
        if (*cur.n).phantom_epoch.load(Ordering::Relaxed) < lf_pe {
            (*cur.n).phantom_epoch.store(lf_pe, Ordering::Relaxed);
        }
        (*lf).set_modstate(MODSTATE_DELETED_LAYER);
        (*lf).base.version.unlock();
        (*lf).deallocate(ti);
        true
    }
}

// ---------------------------------------------------------------------------
// Tree destruction
// ---------------------------------------------------------------------------

#[repr(C)]
struct DestroyRcuCallback {
    head: RcuHead,
    root: *mut NodeBase,
    count: u32,
}

unsafe fn destroy_enqueue(n: *mut NodeBase, tailp: &mut *mut *mut NodeBase) {
    unsafe {
        **tailp = n;
        *tailp = parent_link_ptr(n);
    }
}

unsafe fn destroy_call(head: *mut RcuHead, ti: *mut ThreadInfo) {
    unsafe {
        let cb = head as *mut DestroyRcuCallback;
        (*cb).count += 1;
        if (*cb).count == 1 {
            // first pass: cut the tree off from new readers, then wait
            // out another grace period before touching nodes
            let mut root = (*cb).root;
            while !(*root).version.is_root() {
                root = (*root).maybe_parent();
            }
            (*cb).root = root;
            (*root).version.lock();
            (*root).version.mark_deleted_tree();
            (*root).version.unlock();
            (*ti).register_rcu(head);
            return;
        }

        // second pass: walk everything, threading the work queue through
        // the now-unused parent pointers
        let mut workq: *mut NodeBase = ptr::null_mut();
        let mut tailp: *mut *mut NodeBase = &mut workq;
        destroy_enqueue((*cb).root, &mut tailp);

        loop {
            let n = workq;
            if n.is_null() {
                break;
            }
            let linkp = parent_link_ptr(n);
            if linkp != tailp {
                workq = *linkp;
            } else {
                workq = ptr::null_mut();
                tailp = &mut workq;
            }

            if (*n).version.is_leaf() {
                let l = n as *mut Leaf;
                let perm = (*l).permutation();
                for i in 0..perm.size() {
                    let p = perm.get(i);
                    if (*l).is_layer(p) {
                        destroy_enqueue(lv_layer((*l).lv(p)), &mut tailp);
                    }
                }
                (*l).deallocate(&mut *ti);
            } else {
                let in_ = n as *mut InterNode;
                for i in 0..=(*in_).size() {
                    let child = (*in_).child(i);
                    if !child.is_null() {
                        destroy_enqueue(child, &mut tailp);
                    }
                }
                (*in_).deallocate(&mut *ti);
            }
        }
        (*ti).dealloc(cb as *mut u8);
    }
}

/// Queue the two-phase destruction of the tree rooted at `root`. Values
/// stored in the tree are NOT freed — that stays the caller's job.
pub(crate) unsafe fn make_destroy_callback(root: *mut NodeBase, ti: &mut ThreadInfo) {
    unsafe {
        let cb = ti.alloc(
            mem::size_of::<DestroyRcuCallback>(),
            crate::limbo::MEMTAG_NONE,
        ) as *mut DestroyRcuCallback;
        assert!(!cb.is_null());
        (*cb).head.call = destroy_call;
        (*cb).root = root;
        (*cb).count = 0;
        (*ti).register_rcu(&raw mut (*cb).head);
    }
}
