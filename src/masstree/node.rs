//! Tree nodes: 15-wide internodes and leaves.
//!
//! Both node kinds start with the same header (version word + parent
//! pointer); the version's leaf bit drives downcasts. Leaves store slots
//! unordered and publish order through the permutation word; key suffixes
//! live in an internal bag carved from the leaf's spare tail space, or an
//! external bag once that overflows. Leaves form a doubly-linked list
//! whose next-pointer low bit is the link lock (see `leaflink`).
//!
//! Readers run lock-free: load fields relaxed, then re-validate the
//! version (`has_changed`) before trusting what they copied, exactly the
//! discipline `stable`/`unlock` fences support. All writes happen under
//! the version lock.

use crate::limbo::{MEMTAG_NONE, ThreadInfo};
use crate::masstree::key::{IKEY_SIZE, ikey_compare, key_slot_compare};
use crate::masstree::nodeversion::{NodeVersion, VSPLIT_LOWBIT, Version};
use crate::masstree::permuter::{Permuter, WIDTH};
use crate::masstree::stringbag::StringBag;
use crate::sync::{compiler_barrier, spin_hint};
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicI8, AtomicPtr, AtomicU8, AtomicU64, AtomicUsize, Ordering};

/// `keylenx` code for "slot key continues in the suffix bag".
pub const KSUF_KEYLENX: u8 = 64;
/// `keylenx` code for "slot value is a sub-layer root, not a value".
pub const LAYER_KEYLENX: u8 = 128;

/// Cap on the suffix space reserved inside a fresh leaf.
const INTERNAL_KSUF_CAP: usize = 128;

pub type InternalBag = StringBag<u8>;
pub type ExternalBag = StringBag<u16>;

#[inline]
pub(crate) fn iceil(x: usize, y: usize) -> usize {
    x.div_ceil(y) * y
}

/// A key's current-layer view, enough for node navigation.
#[derive(Clone, Copy)]
pub(crate) struct KeyRef {
    pub ikey: u64,
    pub len: usize,
}

/// Result of a lower-bound search: logical position `i`, physical slot
/// `p` (negative when no slot matched exactly).
#[derive(Clone, Copy)]
pub struct KeyIndexedPosition {
    pub i: i32,
    pub p: i32,
}

/// Common node header. Always at offset 0 of both node kinds.
#[repr(C)]
pub struct NodeBase {
    pub version: NodeVersion,
    parent: AtomicPtr<NodeBase>,
}

impl NodeBase {
    #[inline]
    pub fn parent(&self) -> *mut NodeBase {
        self.parent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_parent(&self, p: *mut NodeBase) {
        self.parent.store(p, Ordering::Relaxed);
    }

    /// This node's parent, or the node itself for a layer root (whose
    /// parent pointer is null).
    #[inline]
    pub fn maybe_parent(&self) -> *mut NodeBase {
        let x = self.parent();
        if x.is_null() {
            self as *const NodeBase as *mut NodeBase
        } else {
            x
        }
    }

    /// Turn this node into a layer root: no parent, root bit set.
    pub fn make_layer_root(&self) {
        self.set_parent(ptr::null_mut());
        self.version.mark_root();
    }

    /// Lock and return the parent, rechecking that it still is the parent
    /// after the lock. Null when this node has none.
    ///
    /// # Safety
    ///
    /// The caller must hold this node's lock.
    pub unsafe fn locked_parent(&self) -> *mut InterNode {
        debug_assert!(self.version.locked());
        loop {
            let p = self.parent();
            if p.is_null() {
                return ptr::null_mut();
            }
            unsafe {
                (*p).version.lock();
                if p == self.parent() {
                    debug_assert!(!(*p).version.is_leaf());
                    return p as *mut InterNode;
                }
                (*p).version.unlock();
            }
            spin_hint();
        }
    }
}

// ---------------------------------------------------------------------------
// InterNode
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct InterNode {
    pub base: NodeBase,
    nkeys: AtomicU8,
    pub height: u32,
    ikey0: [AtomicU64; WIDTH],
    child: [AtomicPtr<NodeBase>; WIDTH + 1],
}

impl InterNode {
    /// Allocate a zeroed internode of the given height.
    ///
    /// # Safety
    ///
    /// `ti` must be the calling worker's ThreadInfo.
    pub unsafe fn make(height: u32, ti: &mut ThreadInfo) -> *mut InterNode {
        unsafe {
            let n = ti.alloc(mem::size_of::<InterNode>(), MEMTAG_NONE) as *mut InterNode;
            assert!(!n.is_null());
            (*n).base.version.init(false);
            (*n).height = height;
            n
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.nkeys.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn set_size(&self, n: usize) {
        self.nkeys.store(n as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn ikey(&self, p: usize) -> u64 {
        self.ikey0[p].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_ikey(&self, p: usize, ikey: u64) {
        self.ikey0[p].store(ikey, Ordering::Relaxed);
    }

    #[inline]
    pub fn child(&self, p: usize) -> *mut NodeBase {
        self.child[p].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_child(&self, p: usize, c: *mut NodeBase) {
        self.child[p].store(c, Ordering::Relaxed);
    }

    /// Install `child` after pivot position `p`. Caller holds the lock.
    ///
    /// # Safety
    ///
    /// `child` must be a valid node owned by this tree.
    pub unsafe fn assign(&self, p: usize, ikey: u64, child: *mut NodeBase) {
        unsafe {
            (*child).set_parent(self as *const InterNode as *mut InterNode as *mut NodeBase)
        };
        self.set_child(p + 1, child);
        self.set_ikey(p, ikey);
    }

    /// Copy `n` pivots (and their right children) from `x` starting at
    /// `xp` into this node starting at `p`. Caller holds both locks.
    pub fn shift_from(&self, p: usize, x: &InterNode, xp: usize, n: usize) {
        debug_assert!(!ptr::eq(self, x));
        for k in 0..n {
            self.set_ikey(p + k, x.ikey(xp + k));
            self.set_child(p + k + 1, x.child(xp + k + 1));
        }
    }

    /// Move `n` pivots up from `xp` to `p` (`p > xp`), opening a hole.
    /// Copies backward so the overlapping ranges survive.
    pub fn shift_up(&self, p: usize, xp: usize, n: usize) {
        for k in (0..n).rev() {
            self.set_ikey(p + k, self.ikey(xp + k));
        }
        for k in (1..=n).rev() {
            self.set_child(p + k, self.child(xp + k));
        }
    }

    /// Move `n` pivots down from `xp` to `p` (`p < xp`), closing a hole.
    pub fn shift_down(&self, p: usize, xp: usize, n: usize) {
        for k in 0..n {
            self.set_ikey(p + k, self.ikey(xp + k));
            self.set_child(p + k + 1, self.child(xp + k + 1));
        }
    }
}

// ---------------------------------------------------------------------------
// Leaf
// ---------------------------------------------------------------------------

/// Leaf modification state: what kind of change the current lock holder
/// is making, and whether this leaf was removed as a whole layer.
pub const MODSTATE_INSERT: u8 = 0;
pub const MODSTATE_REMOVE: u8 = 1;
pub const MODSTATE_DELETED_LAYER: u8 = 2;

#[repr(C)]
pub struct Leaf {
    pub base: NodeBase,
    /// 64-byte units of spare tail space; negative once an external bag
    /// replaced the internal one.
    extrasize64: AtomicI8,
    modstate: AtomicU8,
    keylenx: [AtomicU8; WIDTH],
    pub permutation: AtomicU64,
    ikey0: [AtomicU64; WIDTH],
    lv: [AtomicU64; WIDTH],
    ksuf: AtomicPtr<ExternalBag>,
    /// Next leaf; bit 0 is the leaf-link lock.
    pub next: AtomicUsize,
    pub prev: AtomicPtr<Leaf>,
    pub phantom_epoch: AtomicU64,
    // internal suffix bag follows in the same allocation
}

impl Leaf {
    /// Allocate a zeroed leaf with room for roughly `ksufsize` bytes of
    /// key suffixes in its tail.
    ///
    /// # Safety
    ///
    /// `ti` must be the calling worker's ThreadInfo.
    pub unsafe fn make(ksufsize: usize, phantom_epoch: u64, ti: &mut ThreadInfo) -> *mut Leaf {
        let sz = iceil(
            mem::size_of::<Leaf>() + ksufsize.min(INTERNAL_KSUF_CAP),
            64,
        );
        unsafe {
            let n = ti.alloc(sz, MEMTAG_NONE) as *mut Leaf;
            assert!(!n.is_null());
            (*n).base.version.init(true);
            (*n).permutation
                .store(Permuter::make_empty(), Ordering::Relaxed);
            let extra = (sz >> 6) as i8 - (mem::size_of::<Leaf>().div_ceil(64)) as i8;
            (*n).extrasize64.store(extra, Ordering::Relaxed);
            if extra > 0 {
                InternalBag::init((*n).iksuf_ptr(), WIDTH, sz - mem::size_of::<Leaf>());
            }
            (*n).phantom_epoch.store(phantom_epoch, Ordering::Relaxed);
            n
        }
    }

    /// Allocate a leaf that roots a (sub-)layer, inheriting the parent
    /// leaf's phantom epoch.
    ///
    /// # Safety
    ///
    /// As [`Leaf::make`].
    pub unsafe fn make_root(
        ksufsize: usize,
        parent: *mut Leaf,
        ti: &mut ThreadInfo,
    ) -> *mut Leaf {
        unsafe {
            let phantom = if parent.is_null() {
                0
            } else {
                (*parent).phantom_epoch.load(Ordering::Relaxed)
            };
            let n = Leaf::make(ksufsize, phantom, ti);
            (*n).next.store(0, Ordering::Relaxed);
            (*n).prev.store(ptr::null_mut(), Ordering::Relaxed);
            (*n).base.make_layer_root();
            n
        }
    }

    #[inline]
    unsafe fn iksuf_ptr(&self) -> *mut InternalBag {
        unsafe {
            (self as *const Leaf as *mut u8).add(mem::size_of::<Leaf>()) as *mut InternalBag
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        Permuter::size_of_value(self.permutation.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn permutation(&self) -> Permuter {
        Permuter::from_value(self.permutation.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn ikey(&self, p: usize) -> u64 {
        self.ikey0[p].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_ikey(&self, p: usize, ikey: u64) {
        self.ikey0[p].store(ikey, Ordering::Relaxed);
    }

    /// The smallest ikey this leaf is responsible for. Slot 0 holds it
    /// for the leaf's whole lifetime.
    #[inline]
    pub fn ikey_bound(&self) -> u64 {
        self.ikey(0)
    }

    #[inline]
    pub fn keylenx(&self, p: usize) -> u8 {
        self.keylenx[p].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_keylenx(&self, p: usize, x: u8) {
        self.keylenx[p].store(x, Ordering::Relaxed);
    }

    #[inline]
    pub fn lv(&self, p: usize) -> u64 {
        self.lv[p].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_lv(&self, p: usize, v: u64) {
        self.lv[p].store(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_layer(&self, p: usize) -> bool {
        keylenx_is_layer(self.keylenx(p))
    }

    #[inline]
    pub fn has_ksuf(&self, p: usize) -> bool {
        keylenx_has_ksuf(self.keylenx(p))
    }

    #[inline]
    pub fn modstate(&self) -> u8 {
        self.modstate.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_modstate(&self, s: u8) {
        self.modstate.store(s, Ordering::Relaxed);
    }

    #[inline]
    pub fn deleted_layer(&self) -> bool {
        self.modstate() == MODSTATE_DELETED_LAYER
    }

    /// Next leaf with the link-lock bit stripped.
    #[inline]
    pub fn safe_next(&self) -> *mut Leaf {
        (self.next.load(Ordering::Relaxed) & !1) as *mut Leaf
    }

    /// The suffix stored for slot `p`.
    ///
    /// # Safety
    ///
    /// `p` must have a suffix (`has_ksuf`); the returned slice lives as
    /// long as the leaf's current bag, which is only guaranteed while the
    /// leaf is locked or the read is version-validated.
    pub unsafe fn ksuf(&self, p: usize) -> &[u8] {
        unsafe {
            let ext = self.ksuf.load(Ordering::Relaxed);
            if !ext.is_null() {
                ExternalBag::get(ext, p)
            } else if self.extrasize64.load(Ordering::Relaxed) > 0 {
                InternalBag::get(self.iksuf_ptr(), p)
            } else {
                &[]
            }
        }
    }

    /// Does slot `p`'s stored key equal `(ikey already matched, suffix)`?
    ///
    /// # Safety
    ///
    /// As [`Leaf::ksuf`].
    pub unsafe fn ksuf_equals(&self, p: usize, suffix: &[u8]) -> bool {
        let keylenx = self.keylenx(p);
        if !keylenx_has_ksuf(keylenx) {
            return true;
        }
        unsafe { self.ksuf(p) == suffix }
    }

    /// Match result for slot `p` against a key whose ikey and layer
    /// length already matched in the lower bound: 1 = match; 0 = no
    /// match; negative = descend a layer (shift by that many bytes).
    ///
    /// # Safety
    ///
    /// As [`Leaf::ksuf`].
    pub unsafe fn ksuf_matches(&self, p: usize, suffix: &[u8]) -> i32 {
        let keylenx = self.keylenx(p);
        if keylenx < KSUF_KEYLENX {
            // no suffix stored: the lengths decided the match
            return 1;
        }
        if keylenx == LAYER_KEYLENX {
            return -(IKEY_SIZE as i32);
        }
        unsafe { (self.ksuf(p) == suffix) as i32 }
    }

    /// Lexicographic compare of slot `p`'s suffix against `suffix`.
    ///
    /// # Safety
    ///
    /// As [`Leaf::ksuf`].
    pub unsafe fn ksuf_compare(&self, p: usize, suffix: &[u8]) -> i32 {
        let keylenx = self.keylenx(p);
        if !keylenx_has_ksuf(keylenx) {
            return 0;
        }
        unsafe {
            match self.ksuf(p).cmp(suffix) {
                core::cmp::Ordering::Less => -1,
                core::cmp::Ordering::Equal => 0,
                core::cmp::Ordering::Greater => 1,
            }
        }
    }

    /// Bytes of suffix storage in use.
    pub fn ksuf_used_capacity(&self) -> usize {
        let ext = self.ksuf.load(Ordering::Relaxed);
        if !ext.is_null() {
            unsafe { (*ext).used_capacity() }
        } else if self.extrasize64.load(Ordering::Relaxed) > 0 {
            unsafe { (*self.iksuf_ptr()).used_capacity() }
        } else {
            0
        }
    }

    /// Install key `ikey`/`suffix` into slot `p` (value cleared). Caller
    /// holds the lock and owns slot `p`.
    ///
    /// # Safety
    ///
    /// `ti` must be the calling worker's ThreadInfo; lock held.
    pub unsafe fn assign(&self, p: usize, ikey: u64, klen: usize, suffix: &[u8], ti: &mut ThreadInfo) {
        self.set_lv(p, 0);
        self.set_ikey(p, ikey);
        if klen <= IKEY_SIZE {
            self.set_keylenx(p, klen as u8);
        } else {
            self.set_keylenx(p, KSUF_KEYLENX);
            unsafe { self.assign_ksuf(p, suffix, false, ti) };
        }
    }

    /// Like [`Leaf::assign`] during node construction, before the node is
    /// published (suffix compaction may use slots `0..p` only).
    ///
    /// # Safety
    ///
    /// As [`Leaf::assign`]; the leaf must be unpublished.
    pub unsafe fn assign_initialize(
        &self,
        p: usize,
        ikey: u64,
        klen: usize,
        suffix: &[u8],
        ti: &mut ThreadInfo,
    ) {
        self.set_lv(p, 0);
        self.set_ikey(p, ikey);
        if klen <= IKEY_SIZE {
            self.set_keylenx(p, klen as u8);
        } else {
            self.set_keylenx(p, KSUF_KEYLENX);
            unsafe { self.assign_ksuf(p, suffix, true, ti) };
        }
    }

    /// Copy slot `xp` of `x` into slot `p` of this (unpublished) leaf.
    ///
    /// # Safety
    ///
    /// As [`Leaf::assign_initialize`].
    pub unsafe fn assign_initialize_from(
        &self,
        p: usize,
        x: &Leaf,
        xp: usize,
        ti: &mut ThreadInfo,
    ) {
        unsafe {
            self.set_lv(p, x.lv(xp));
            self.set_ikey(p, x.ikey(xp));
            self.set_keylenx(p, x.keylenx(xp));
            if x.has_ksuf(xp) {
                self.assign_ksuf(p, x.ksuf(xp), true, ti);
            }
        }
    }

    /// Make slot `p` a layer pointer for `ikey` (value installed by the
    /// caller).
    pub fn assign_initialize_for_layer(&self, p: usize, ikey: u64) {
        self.set_ikey(p, ikey);
        self.set_keylenx(p, LAYER_KEYLENX);
    }

    /// Store `suffix` for slot `p`, growing into an external bag when the
    /// current storage is full. The old bag stays readable until retired
    /// through RCU, so concurrent validated readers never chase freed
    /// memory.
    ///
    /// # Safety
    ///
    /// Lock held (or leaf unpublished, `initializing`); `ti` is the
    /// calling worker's.
    pub unsafe fn assign_ksuf(&self, p: usize, suffix: &[u8], initializing: bool, ti: &mut ThreadInfo) {
        unsafe {
            let ext = self.ksuf.load(Ordering::Relaxed);
            if !ext.is_null() && ExternalBag::assign(ext, p, suffix) {
                return;
            }
            if ext.is_null()
                && self.extrasize64.load(Ordering::Relaxed) > 0
                && InternalBag::assign(self.iksuf_ptr(), p, suffix)
            {
                return;
            }

            // rebuild every live suffix into a bigger external bag
            let perm = self.permutation();
            let n = if initializing { p } else { perm.size() };

            let mut csz = 0;
            for i in 0..n {
                let mp = if initializing { i } else { perm.get(i) };
                if mp != p && self.has_ksuf(mp) {
                    csz += self.ksuf(mp).len();
                }
            }

            let mut sz = ExternalBag::safe_size(WIDTH, csz + suffix.len()).next_power_of_two();
            if !ext.is_null() {
                sz = sz.max((*ext).capacity());
            }

            let nbag = ti.alloc(sz, MEMTAG_NONE) as *mut ExternalBag;
            assert!(!nbag.is_null());
            ExternalBag::init(nbag, WIDTH, sz);
            for i in 0..n {
                let mp = if initializing { i } else { perm.get(i) };
                if mp != p && self.has_ksuf(mp) {
                    let ok = ExternalBag::assign(nbag, mp, self.ksuf(mp));
                    debug_assert!(ok);
                }
            }
            let ok = ExternalBag::assign(nbag, p, suffix);
            debug_assert!(ok);
            compiler_barrier();

            debug_assert!(self.modstate() != MODSTATE_REMOVE);
            self.ksuf.store(nbag, Ordering::Relaxed);
            compiler_barrier();

            // the internal bag (if any) is dead from here on
            let extra = self.extrasize64.load(Ordering::Relaxed);
            if extra >= 0 {
                self.extrasize64.store(-extra - 1, Ordering::Relaxed);
            }

            if !ext.is_null() {
                ti.dealloc(ext as *mut u8);
            }
        }
    }

    /// Retire this leaf and its external bag through RCU.
    ///
    /// # Safety
    ///
    /// The leaf must already be unreachable for new readers.
    pub unsafe fn deallocate(&self, ti: &mut ThreadInfo) {
        unsafe {
            let ext = self.ksuf.load(Ordering::Relaxed);
            if !ext.is_null() {
                ti.dealloc(ext as *mut u8);
            }
            ti.dealloc(self as *const Leaf as *mut u8);
        }
    }
}

impl InterNode {
    /// Retire this internode through RCU.
    ///
    /// # Safety
    ///
    /// The node must already be unreachable for new readers.
    pub unsafe fn deallocate(&self, ti: &mut ThreadInfo) {
        unsafe { ti.dealloc(self as *const InterNode as *mut u8) };
    }
}

#[inline]
pub fn keylenx_is_layer(keylenx: u8) -> bool {
    keylenx > 127
}

#[inline]
pub fn keylenx_has_ksuf(keylenx: u8) -> bool {
    keylenx == KSUF_KEYLENX
}

/// Interpret a leaf value as a sub-layer root.
#[inline]
pub fn lv_layer(v: u64) -> *mut NodeBase {
    v as usize as *mut NodeBase
}

// ---------------------------------------------------------------------------
// Key search
// ---------------------------------------------------------------------------

/// Binary search the leaf's sorted positions for the key's current
/// layer. `p >= 0` on an ikey+length match.
pub(crate) fn leaf_lower_bound(k: KeyRef, leaf: &Leaf, perm: Permuter) -> KeyIndexedPosition {
    let mut l = 0i32;
    let mut r = perm.size() as i32;
    while l < r {
        let m = (l + r) >> 1;
        let mp = perm.get(m as usize);
        let cmp = key_slot_compare(k.ikey, k.len, leaf.ikey(mp), leaf.keylenx(mp));
        if cmp < 0 {
            r = m;
        } else if cmp == 0 {
            return KeyIndexedPosition { i: m, p: mp as i32 };
        } else {
            l = m + 1;
        }
    }
    KeyIndexedPosition { i: l, p: -1 }
}

/// Child index an ikey routes to inside an internode.
pub(crate) fn inter_upper_bound(ikey: u64, n: &InterNode) -> usize {
    let mut l = 0usize;
    let mut r = n.size();
    while l < r {
        let m = (l + r) >> 1;
        let cmp = ikey_compare(ikey, n.ikey(m));
        if cmp < 0 {
            r = m;
        } else if cmp == 0 {
            return m + 1;
        } else {
            l = m + 1;
        }
    }
    l
}

/// Compare `k` against the leaf's largest key, retrying until the answer
/// is stable.
pub(crate) fn leaf_stable_last_key_compare(leaf: &Leaf, k: KeyRef, mut v: Version) -> i32 {
    loop {
        let perm = leaf.permutation();
        let p = if perm.size() == 0 {
            0
        } else {
            perm.get(perm.size() - 1)
        };
        let cmp = key_slot_compare(k.ikey, k.len, leaf.ikey(p), leaf.keylenx(p));
        if !leaf.base.version.has_changed(v) {
            return cmp;
        }
        v = leaf.base.version.stable();
    }
}

/// Compare `ikey` against the internode's largest pivot, retrying until
/// stable.
pub(crate) fn inter_stable_last_key_compare(n: &InterNode, ikey: u64, mut v: Version) -> i32 {
    loop {
        let sz = n.size();
        let cmp = if sz == 0 {
            0
        } else {
            ikey_compare(ikey, n.ikey(sz - 1))
        };
        if !n.base.version.has_changed(v) {
            return cmp;
        }
        v = n.base.version.stable();
    }
}

#[inline]
fn version_split_from(new: Version, old: Version) -> bool {
    (new.value() ^ old.value()) >= VSPLIT_LOWBIT
}

/// Walk the leaf list to the leaf now responsible for `k`.
/// `leaf` was responsible for `k` at version `v`; returns the successor
/// (possibly the same leaf) and its stable version.
///
/// # Safety
///
/// The caller must be inside an epoch-protected read (live handle).
pub(crate) unsafe fn advance_to_key(
    leaf: *mut Leaf,
    k: KeyRef,
    v: Version,
) -> (*mut Leaf, Version) {
    unsafe {
        let mut n = leaf;
        let oldv = v;
        let mut v = (*n).base.version.stable();
        if version_split_from(v, oldv) && leaf_stable_last_key_compare(&*n, k, v) > 0 {
            while !v.deleted() {
                let next = (*n).safe_next();
                if next.is_null() || ikey_compare(k.ikey, (*next).ikey_bound()) < 0 {
                    break;
                }
                n = next;
                v = (*n).base.version.stable();
            }
        }
        (n, v)
    }
}

/// Descend from `root` to the leaf responsible for `k`'s current layer.
/// Uses the two-slot "sense" trick: keep the parent's version around so a
/// child read can be revalidated against the parent before trusting it.
///
/// # Safety
///
/// As [`advance_to_key`].
pub(crate) unsafe fn reach_leaf(root: *const NodeBase, k: KeyRef) -> (*mut Leaf, Version) {
    unsafe {
        let mut n: [*const NodeBase; 2] = [ptr::null(), ptr::null()];
        let mut v: [Version; 2] = [Version(0), Version(0)];

        'retry: loop {
            // Get a non-stale root: the true root has never split.
            let mut sense = 0usize;
            n[sense] = root;
            loop {
                v[sense] = (*n[sense]).version.stable();
                if v[sense].is_root() {
                    break;
                }
                n[sense] = (*n[sense]).maybe_parent();
            }

            while !v[sense].is_leaf() {
                let in_ = &*(n[sense] as *const InterNode);
                let kp = inter_upper_bound(k.ikey, in_);
                n[1 - sense] = in_.child(kp);
                if n[1 - sense].is_null() {
                    continue 'retry;
                }
                v[1 - sense] = (*n[1 - sense]).version.stable();

                if !in_.base.version.has_changed(v[sense]) {
                    sense = 1 - sense;
                    continue;
                }

                let oldv = v[sense];
                v[sense] = in_.base.version.stable();
                if version_split_from(v[sense], oldv)
                    && inter_stable_last_key_compare(in_, k.ikey, v[sense]) > 0
                {
                    // the key may have moved to a different subtree
                    continue 'retry;
                }
                // otherwise retry the same internode
            }

            return (n[sense] as *mut Leaf, v[sense]);
        }
    }
}

/// The parent field as a raw pointer slot. Tree destruction repurposes
/// it as the work-queue next pointer once no reader can be navigating.
///
/// # Safety
///
/// `n` must be a valid node; concurrent parent updates must be over.
pub(crate) unsafe fn parent_link_ptr(n: *mut NodeBase) -> *mut *mut NodeBase {
    unsafe { (&raw mut (*n).parent) as *mut *mut NodeBase }
}

/// Read a stored suffix into a caller buffer (scans keep suffixes across
/// version validation this way).
///
/// # Safety
///
/// As [`Leaf::ksuf`].
pub(crate) unsafe fn copy_ksuf_into(leaf: &Leaf, p: usize, buf: &mut [u8]) -> usize {
    unsafe {
        let s = leaf.ksuf(p);
        buf[..s.len()].copy_from_slice(s);
        s.len()
    }
}
