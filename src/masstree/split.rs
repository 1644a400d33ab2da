//! Leaf and internode splits.
//!
//! A leaf split picks a midpoint that never separates two entries with
//! the same ikey (they must stay in one node so a future layer conversion
//! finds both), with an optimization for sequential insert at either end.
//! The split then propagates upward: insert the pivot into the parent,
//! splitting it too when full, until a parent has room or a new root
//! internode is created and published through the layer-root pointer.

use crate::limbo::ThreadInfo;
use crate::masstree::cursor::TCursor;
use crate::masstree::key::MtKey;
use crate::masstree::leaflink;
use crate::masstree::node::{InterNode, Leaf, NodeBase, inter_upper_bound};
use crate::masstree::permuter::{Permuter, WIDTH};
use crate::stat_inc;
use crate::sync::compiler_barrier;
use core::sync::atomic::Ordering;

/// The ikey at sorted position `i` once `ka` is (notionally) inserted at
/// position `ka_i`.
unsafe fn ikey_after_insert(
    leaf: &Leaf,
    perm: Permuter,
    i: usize,
    ka_ikey: u64,
    ka_i: usize,
) -> u64 {
    if i < ka_i {
        leaf.ikey(perm.get(i))
    } else if i == ka_i {
        ka_ikey
    } else {
        leaf.ikey(perm.get(i - 1))
    }
}

/// Split `nl` into `nl` + `nr`, pretending `ka` is inserted at position
/// `p`. Returns `(split_type, split_ikey)` where `split_ikey` is `nr`'s
/// first key and split_type is 0 = `ka` stays left, 1 = `ka` goes right,
/// 2 = `ka` goes right as a pure append (nothing else moved).
///
/// # Safety
///
/// Both nodes locked; `nr` fresh and empty.
pub(crate) unsafe fn leaf_split_into(
    nl: *mut Leaf,
    nr: *mut Leaf,
    p: usize,
    ka: &MtKey<'_>,
    ti: &mut ThreadInfo,
) -> (i32, u64) {
    unsafe {
        debug_assert!((*nl).base.version.locked() && (*nr).base.version.locked());
        debug_assert!((*nl).size() >= WIDTH - 1);

        let sz = (*nl).size();
        let mut mid = WIDTH / 2 + 1;
        if p == 0 && (*nl).prev.load(Ordering::Relaxed).is_null() {
            mid = 1;
        } else if p == sz && (*nl).next.load(Ordering::Relaxed) == 0 {
            mid = sz;
        }

        // never separate entries with the same ikey
        let perml = (*nl).permutation();
        let mid_ikey = ikey_after_insert(&*nl, perml, mid, ka.ikey(), p);
        if mid_ikey == ikey_after_insert(&*nl, perml, mid - 1, ka.ikey(), p) {
            let mut midl = mid as i32 - 2;
            let mut midr = mid + 1;
            loop {
                // at most two entries can share an ikey
                if midr <= sz
                    && mid_ikey != ikey_after_insert(&*nl, perml, midr, ka.ikey(), p)
                {
                    mid = midr;
                    break;
                } else if midl >= 0
                    && mid_ikey != ikey_after_insert(&*nl, perml, midl as usize, ka.ikey(), p)
                {
                    mid = midl as usize + 1;
                    break;
                }
                midl -= 1;
                midr += 1;
            }
            debug_assert!(mid > 0 && mid <= sz);
        }

        let mut pv = perml.value_from(mid - (p < mid) as usize);
        for x in mid..=sz {
            if x == p {
                (*nr).assign_initialize(
                    x - mid,
                    ka.ikey(),
                    ka.length(),
                    ka.suffix_or_empty(),
                    ti,
                );
            } else {
                (*nr).assign_initialize_from(x - mid, &*nl, (pv & 15) as usize, ti);
                pv >>= 4;
            }
        }
        let mut permr = Permuter::from_value(Permuter::make_sorted(sz + 1 - mid));
        if p >= mid {
            permr.remove_to_back(p - mid);
        }
        (*nr).permutation.store(permr.value(), Ordering::Relaxed);

        leaflink::link_split(nl, nr);

        let split_ikey = (*nr).ikey(0);
        let split_type = if p >= mid { 1 + (mid == sz) as i32 } else { 0 };
        (split_type, split_ikey)
    }
}

/// Split a full internode around the insertion of `(ka_ikey, value)` at
/// child position `p`. Returns `(kp, split_ikey)`: `kp >= 0` means the
/// caller still inserts the pivot into the left node at `kp`; `kp < 0`
/// means the pivot moved right.
///
/// # Safety
///
/// Both nodes locked; `nr` fresh.
pub(crate) unsafe fn inter_split_into(
    n: *mut InterNode,
    nr: *mut InterNode,
    p: usize,
    ka_ikey: u64,
    value: *mut NodeBase,
    split_type: i32,
) -> (i32, u64) {
    unsafe {
        debug_assert!((*n).base.version.locked() && (*nr).base.version.locked());

        let mid = if split_type == 2 { WIDTH } else { (WIDTH + 1) / 2 };
        (*nr).set_size(WIDTH - mid);

        let split_ikey;
        if p < mid {
            (*nr).set_child(0, (*n).child(mid));
            (*nr).shift_from(0, &*n, mid, WIDTH - mid);
            split_ikey = (*n).ikey(mid - 1);
        } else if p == mid {
            (*nr).set_child(0, value);
            (*nr).shift_from(0, &*n, mid, WIDTH - mid);
            split_ikey = ka_ikey;
        } else {
            (*nr).set_child(0, (*n).child(mid + 1));
            (*nr).shift_from(0, &*n, mid + 1, p - (mid + 1));
            (*nr).assign(p - (mid + 1), ka_ikey, value);
            (*nr).shift_from(p + 1 - (mid + 1), &*n, p, WIDTH - p);
            split_ikey = (*n).ikey(mid);
        }

        for i in 0..=(*nr).size() {
            (*(*nr).child(i)).set_parent(nr as *mut NodeBase);
        }

        (*n).base.version.mark_split();
        if p < mid {
            (*n).set_size(mid - 1);
            (p as i32, split_ikey)
        } else {
            (*n).set_size(mid);
            (-1, split_ikey)
        }
    }
}

/// Split the cursor's full leaf and propagate upward. On return the
/// cursor's slot is allocated in whichever node now covers the key, and
/// every node except the cursor's stays unlocked.
///
/// # Safety
///
/// Cursor leaf locked; `ti` is the calling worker's.
pub(crate) unsafe fn make_split(cur: &mut TCursor<'_>, ti: &mut ThreadInfo) -> bool {
    unsafe {
        // Two ways here: the node is full, or we must insert at position
        // 0, which is pinned to the ikey_bound for the node's lifetime.
        // For the latter, first try to take a free slot other than 0.
        let nl = cur.n;
        if (*nl).size() < WIDTH {
            let mut perm = (*nl).permutation();
            perm.exchange(perm.size(), WIDTH - 1);
            cur.kx.p = perm.back() as i32;
            if cur.kx.p != 0 {
                (*nl).permutation.store(perm.value(), Ordering::Relaxed);
                compiler_barrier();
                (*nl).assign(
                    cur.kx.p as usize,
                    cur.ka.ikey(),
                    cur.ka.length(),
                    cur.ka.suffix_or_empty(),
                    ti,
                );
                return false;
            }
        }

        stat_inc!(mt_splits);

        let child_leaf = Leaf::make(
            (*nl).ksuf_used_capacity(),
            (*nl).phantom_epoch.load(Ordering::Relaxed),
            ti,
        );
        (*child_leaf)
            .base
            .version
            .assign((*nl).base.version.snapshot());
        let mut xikey = [0u64; 2];
        let (split_type, ikey0) =
            leaf_split_into(nl, child_leaf, cur.kx.i as usize, &cur.ka, ti);
        xikey[0] = ikey0;

        let mut sense = 0usize;
        let mut n: *mut NodeBase = nl as *mut NodeBase;
        let mut child: *mut NodeBase = child_leaf as *mut NodeBase;
        let mut height = 0u32;

        loop {
            debug_assert!(
                (*n).version.locked()
                    && (*child).version.locked()
                    && ((*n).version.is_leaf() || (*n).version.snapshot().splitting())
            );
            let mut next_child: *mut InterNode = core::ptr::null_mut();
            let p = (*n).locked_parent();

            let mut kp: i32 = -1;
            if !p.is_null() {
                kp = inter_upper_bound(xikey[sense], &*p) as i32;
                (*p).base.version.mark_insert();
            }

            if kp < 0 || (!p.is_null() && (*p).height > height + 1) {
                // no parent at the right height: interpose a fresh
                // internode owning (n, child)
                let nn = InterNode::make(height + 1, ti);
                (*nn).set_child(0, n);
                (*nn).assign(0, xikey[sense], child);
                (*nn).set_size(1);
                if kp < 0 {
                    (*nn).base.make_layer_root();
                } else {
                    (*nn).base.set_parent(p as *mut NodeBase);
                    (*p).set_child(kp as usize, nn as *mut NodeBase);
                }
                compiler_barrier();
                (*n).set_parent(nn as *mut NodeBase);
            } else {
                if (*p).size() >= WIDTH {
                    next_child = InterNode::make(height + 1, ti);
                    (*next_child)
                        .base
                        .version
                        .assign((*p).base.version.snapshot());
                    (*next_child).base.version.mark_nonroot();
                    let (nkp, nikey) = inter_split_into(
                        p,
                        next_child,
                        kp as usize,
                        xikey[sense],
                        child,
                        split_type,
                    );
                    kp = nkp;
                    xikey[1 - sense] = nikey;
                    stat_inc!(mt_splits);
                }
                if kp >= 0 {
                    (*p).shift_up(kp as usize + 1, kp as usize, (*p).size() - kp as usize);
                    (*p).assign(kp as usize, xikey[sense], child);
                    compiler_barrier();
                    (*p).set_size((*p).size() + 1);
                }
            }

            if (*n).version.is_leaf() {
                let left = n as *mut Leaf;
                let right = child as *mut Leaf;
                let mut perml = (*left).permutation();
                let sz = perml.size();
                perml.set_size(sz - (*right).size());
                // the removed entry, if any, must sit at perml.size()
                if sz != WIDTH {
                    perml.exchange(perml.size(), WIDTH - 1);
                }
                (*left).base.version.mark_split();
                (*left).permutation.store(perml.value(), Ordering::Relaxed);
                if split_type == 0 {
                    cur.kx.p = perml.back() as i32;
                    (*left).assign(
                        cur.kx.p as usize,
                        cur.ka.ikey(),
                        cur.ka.length(),
                        cur.ka.suffix_or_empty(),
                        ti,
                    );
                } else {
                    cur.kx.i -= perml.size() as i32;
                    cur.kx.p = cur.kx.i;
                    cur.n = right;
                }
            }

            if n != cur.n as *mut NodeBase {
                (*n).version.unlock();
            }
            if child != cur.n as *mut NodeBase {
                (*child).version.unlock();
            }

            if !next_child.is_null() {
                n = p as *mut NodeBase;
                child = next_child as *mut NodeBase;
                sense = 1 - sense;
                height += 1;
            } else if !p.is_null() {
                (*p).base.version.unlock();
                break;
            } else {
                break;
            }
        }
        false
    }
}
