//! Point-operation cursors.
//!
//! [`UnlockedCursor`] is the optimistic read path: descend, copy, and
//! re-validate versions, hopping the leaf list when a split moved the
//! key. [`TCursor`] is the write path: repeat the read path, lock the
//! target leaf, and re-check that nothing moved under the lock. State
//! after `find_locked`: 0 = not found, 1 = found, 2 = inserting (slot
//! claimed but value not yet published), negative = the slot is a
//! sub-layer pointer (internal, resolved by retrying in the layer).

use crate::limbo::ThreadInfo;
use crate::masstree::key::MtKey;
use crate::masstree::node::{
    InternalBag, KeyIndexedPosition, KeyRef, Leaf, MODSTATE_INSERT, MODSTATE_REMOVE, NodeBase,
    advance_to_key, leaf_lower_bound, lv_layer, reach_leaf, LAYER_KEYLENX,
};
use crate::masstree::nodeversion::Version;
use crate::masstree::permuter::{Permuter, WIDTH};
use crate::masstree::remove;
use crate::masstree::split;
use crate::stat_inc;
use crate::sync::compiler_barrier;
use core::sync::atomic::Ordering;

impl<'k> MtKey<'k> {
    #[inline]
    pub(crate) fn suffix_or_empty(&self) -> &'k [u8] {
        if self.has_suffix() { self.suffix() } else { &[] }
    }

    #[inline]
    pub(crate) fn keyref(&self) -> KeyRef {
        KeyRef {
            ikey: self.ikey(),
            len: self.length(),
        }
    }
}

/// Optimistic, non-blocking point lookup.
pub struct UnlockedCursor<'k> {
    n: *mut Leaf,
    ka: MtKey<'k>,
    v: Version,
    perm: Permuter,
    lv: u64,
    root: *const NodeBase,
}

impl<'k> UnlockedCursor<'k> {
    pub(crate) fn new(root: *const NodeBase, key: &'k [u8]) -> Self {
        Self {
            n: core::ptr::null_mut(),
            ka: MtKey::new(key),
            v: Version(0),
            perm: Permuter::from_value(Permuter::make_empty()),
            lv: 0,
            root,
        }
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.lv
    }

    /// The leaf permutation observed by the last find.
    #[inline]
    pub fn permutation(&self) -> Permuter {
        self.perm
    }

    /// Find the key without taking any lock. Returns whether it exists.
    ///
    /// # Safety
    ///
    /// The caller must hold a live LimboHandle on `_ti`'s thread so node
    /// memory read optimistically cannot be reclaimed mid-read.
    pub unsafe fn find_unlocked(&mut self, _ti: &mut ThreadInfo) -> bool {
        unsafe {
            let mut root = self.root;
            'retry: loop {
                let (n, v) = reach_leaf(root, self.ka.keyref());
                self.n = n;
                self.v = v;
                loop {
                    if self.v.deleted() {
                        continue 'retry;
                    }
                    self.perm = (*self.n).permutation();
                    let kx = leaf_lower_bound(self.ka.keyref(), &*self.n, self.perm);
                    let matched;
                    if kx.p >= 0 {
                        self.lv = (*self.n).lv(kx.p as usize);
                        matched =
                            (*self.n).ksuf_matches(kx.p as usize, self.ka.suffix_or_empty());
                    } else {
                        matched = 0;
                    }
                    if (*self.n).base.version.has_changed(self.v) {
                        let (n, v) = advance_to_key(self.n, self.ka.keyref(), self.v);
                        self.n = n;
                        self.v = v;
                        continue;
                    }

                    if matched < 0 {
                        self.ka.shift_by((-matched) as usize);
                        root = lv_layer(self.lv);
                        continue 'retry;
                    }
                    return matched != 0;
                }
            }
        }
    }
}

/// Locked write cursor.
pub struct TCursor<'k> {
    pub(crate) n: *mut Leaf,
    pub(crate) ka: MtKey<'k>,
    pub(crate) kx: KeyIndexedPosition,
    pub(crate) root: *const NodeBase,
    pub(crate) state: i32,
}

impl<'k> TCursor<'k> {
    pub(crate) fn new(root: *const NodeBase, key: &'k [u8]) -> Self {
        Self {
            n: core::ptr::null_mut(),
            ka: MtKey::new(key),
            kx: KeyIndexedPosition { i: 0, p: -1 },
            root,
            state: 0,
        }
    }

    #[inline]
    pub fn has_value(&self) -> bool {
        self.kx.p >= 0
    }

    /// Value in the cursor's slot. Only meaningful while the leaf is
    /// locked and `has_value()`.
    ///
    /// # Safety
    ///
    /// Between `find_locked`/`find_insert` and `finish` only.
    pub unsafe fn value(&self) -> u64 {
        unsafe { (*self.n).lv(self.kx.p as usize) }
    }

    /// Store the value in the cursor's slot.
    ///
    /// # Safety
    ///
    /// As [`TCursor::value`].
    pub unsafe fn set_value(&self, v: u64) {
        unsafe { (*self.n).set_lv(self.kx.p as usize, v) };
    }

    pub fn is_first_layer(&self) -> bool {
        !self.ka.is_shifted()
    }

    /// Find the key and lock its leaf. On return `self.n` is locked and
    /// `self.state` says what was found.
    ///
    /// # Safety
    ///
    /// As [`UnlockedCursor::find_unlocked`]; pair with `finish`.
    pub unsafe fn find_locked(&mut self, _ti: &mut ThreadInfo) -> i32 {
        unsafe {
            let mut root = self.root;
            'retry: loop {
                let (mut n, mut v) = reach_leaf(root, self.ka.keyref());
                loop {
                    if v.deleted() {
                        continue 'retry;
                    }
                    let perm = (*n).permutation();
                    compiler_barrier();

                    self.kx = leaf_lower_bound(self.ka.keyref(), &*n, perm);
                    if self.kx.p >= 0 {
                        let lv = (*n).lv(self.kx.p as usize);
                        self.state =
                            (*n).ksuf_matches(self.kx.p as usize, self.ka.suffix_or_empty());
                        compiler_barrier();
                        if self.state < 0
                            && !(*n).base.version.has_changed(v)
                            && (*lv_layer(lv)).version.is_root()
                        {
                            self.ka.shift_by((-self.state) as usize);
                            root = lv_layer(lv);
                            continue 'retry;
                        }
                    } else {
                        self.state = 0;
                    }

                    (*n).base.version.lock();
                    if (*n).base.version.has_changed(v)
                        || (*n).permutation.load(Ordering::Relaxed) != perm.value()
                    {
                        // what we decided on above is stale under the lock
                        (*n).base.version.unlock();
                        let (n2, v2) = advance_to_key(n, self.ka.keyref(), v);
                        n = n2;
                        v = v2;
                        continue;
                    } else if self.state < 0 {
                        // lazily chain-compress the layer root pointer,
                        // then retry through the fresh root
                        self.ka.shift_by((-self.state) as usize);
                        let layer =
                            (*lv_layer((*n).lv(self.kx.p as usize))).maybe_parent();
                        (*n).set_lv(self.kx.p as usize, layer as u64);
                        root = layer;
                        (*n).base.version.unlock();
                        continue 'retry;
                    } else if (*n).deleted_layer() {
                        self.ka.unshift_all();
                        root = self.root;
                        (*n).base.version.unlock();
                        continue 'retry;
                    }
                    self.n = n;
                    return self.state;
                }
            }
        }
    }

    /// Find the key, creating a slot (and any needed layers or splits)
    /// when absent. Returns whether the key already existed; either way
    /// the cursor points at a locked leaf slot for the key.
    ///
    /// # Safety
    ///
    /// As [`TCursor::find_locked`].
    pub unsafe fn find_insert(&mut self, ti: &mut ThreadInfo) -> bool {
        unsafe {
            self.find_locked(ti);

            // maybe we found it
            if self.state != 0 {
                return true;
            }

            // otherwise mark as inserted but not present
            self.state = 2;

            // maybe we need a new layer: ikey and length matched but the
            // suffixes differ
            if self.kx.p >= 0 {
                return self.make_new_layer(ti);
            }

            // flag the modification-state flip for concurrent readers
            if (*self.n).modstate() != MODSTATE_INSERT {
                debug_assert!((*self.n).modstate() == MODSTATE_REMOVE);
                (*self.n).base.version.mark_insert();
                (*self.n).set_modstate(MODSTATE_INSERT);
            }

            // try inserting into this node
            if (*self.n).size() < WIDTH {
                self.kx.p = (*self.n).permutation().back() as i32;
                // don't inappropriately reuse slot 0, which holds the
                // ikey_bound
                if self.kx.p != 0
                    || (*self.n).prev.load(Ordering::Relaxed).is_null()
                    || (*self.n).ikey_bound() == self.ka.ikey()
                {
                    (*self.n).assign(
                        self.kx.p as usize,
                        self.ka.ikey(),
                        self.ka.length(),
                        self.ka.suffix_or_empty(),
                        ti,
                    );
                    return false;
                }
            }

            // otherwise must split
            split::make_split(self, ti)
        }
    }

    /// The stored key and ours agree on every 8-byte slice so far but
    /// differ later: grow a twig of single-entry layers down to the first
    /// slice where they diverge, ending in a two-entry leaf.
    unsafe fn make_new_layer(&mut self, ti: &mut ThreadInfo) -> bool {
        unsafe {
            let n = self.n;
            let mut oka = MtKey::new((*n).ksuf(self.kx.p as usize));
            self.ka.shift();
            let mut kcmp = oka.compare(&self.ka);

            let mut twig_head = n;
            let mut twig_tail = n;
            while kcmp == 0 {
                let nl = Leaf::make_root(0, twig_tail, ti);
                (*nl).assign_initialize_for_layer(0, oka.ikey());
                if twig_head != n {
                    (*twig_tail).set_lv(0, nl as u64);
                } else {
                    twig_head = nl;
                }
                (*nl).permutation
                    .store(Permuter::make_sorted(1), Ordering::Relaxed);
                twig_tail = nl;
                stat_inc!(mt_layers);
                oka.shift();
                self.ka.shift();
                kcmp = oka.compare(&self.ka);
            }

            // estimate suffix space for the final two-entry leaf
            let ksufsize = if self.ka.has_suffix() || oka.has_suffix() {
                (self.ka.suffix_length().max(0) + oka.suffix_length().max(0)) as usize
                    * (WIDTH / 2)
                    + InternalBag::overhead(WIDTH)
            } else {
                0
            };
            let nl = Leaf::make_root(ksufsize, twig_tail, ti);
            let (first, second) = if kcmp < 0 {
                (&oka, &self.ka)
            } else {
                (&self.ka, &oka)
            };
            (*nl).assign_initialize(
                0,
                first.ikey(),
                first.length(),
                first.suffix_or_empty(),
                ti,
            );
            (*nl).assign_initialize(
                1,
                second.ikey(),
                second.length(),
                second.suffix_or_empty(),
                ti,
            );
            (*nl).set_lv((kcmp > 0) as usize, (*n).lv(self.kx.p as usize));
            (*nl).base.version.lock();
            if kcmp < 0 {
                (*nl).permutation
                    .store(Permuter::make_sorted(1), Ordering::Relaxed);
            } else {
                let mut permnl = Permuter::from_value(Permuter::make_sorted(2));
                permnl.remove_to_back(0);
                (*nl).permutation.store(permnl.value(), Ordering::Relaxed);
            }
            stat_inc!(mt_layers);

            (*n).base.version.mark_insert();
            compiler_barrier();

            // publish the twig; readers following the old slot now land
            // in the new layer chain
            if twig_tail != n {
                (*twig_tail).set_lv(0, nl as u64);
            }
            if twig_head != n {
                (*n).set_lv(self.kx.p as usize, twig_head as u64);
            } else {
                (*n).set_lv(self.kx.p as usize, nl as u64);
            }
            (*n).set_keylenx(self.kx.p as usize, LAYER_KEYLENX);
            (*n).base.version.unlock();

            self.n = nl;
            self.kx.i = (kcmp < 0) as i32;
            self.kx.p = self.kx.i;
            false
        }
    }

    pub(crate) unsafe fn finish_insert(&mut self) {
        unsafe {
            let mut perm = (*self.n).permutation();
            debug_assert!(perm.back() as i32 == self.kx.p);
            perm.insert_from_back(self.kx.i as usize);
            compiler_barrier();
            (*self.n).permutation.store(perm.value(), Ordering::Relaxed);
        }
    }

    /// Commit the operation and release the leaf: `state > 0` publishes
    /// an insert, `state < 0` performs a remove, `state == 0` just
    /// unlocks.
    ///
    /// # Safety
    ///
    /// Must follow a successful `find_locked`/`find_insert` on this
    /// cursor; `ti` is the calling worker's.
    pub unsafe fn finish(&mut self, state: i32, ti: &mut ThreadInfo) {
        unsafe {
            if state < 0 && self.state == 1 {
                if remove::finish_remove(self, ti) {
                    return;
                }
            } else if state > 0 && self.state == 2 {
                self.finish_insert();
            }
            (*self.n).base.version.unlock();
        }
    }
}
