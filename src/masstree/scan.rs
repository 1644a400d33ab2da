//! Ordered range scans, forward and reverse.
//!
//! A scan is an explicit state machine over `{find_initial, find_next,
//! emit, down, up, retry}`. Descending into a sub-layer pushes the
//! current `(root, leaf)` on a stack; ascending pops it and repositions
//! with the key cursor unshifted. Version changes fall back to `retry`,
//! which re-descends from the current layer root. The forward and
//! reverse helpers parameterize duplicate suppression, the ordering
//! predicate, and the cross-leaf advance.

use crate::config::MAX_KEY_LEN;
use crate::limbo::ThreadInfo;
use crate::masstree::key::{ScanKey, ikey_compare};
use crate::masstree::node::{
    KeyIndexedPosition, KeyRef, Leaf, NodeBase, advance_to_key, copy_ksuf_into,
    keylenx_has_ksuf, keylenx_is_layer, leaf_lower_bound, lv_layer, reach_leaf,
};
use crate::masstree::nodeversion::Version;
use crate::masstree::permuter::{Permuter, SIZE_BITS};
use crate::sync::compiler_barrier;
use alloc::vec::Vec;
use core::ptr;

/// Per-entry scan visitor.
pub trait Scanner {
    /// Called whenever the scan (re)positions on a leaf, with the leaf's
    /// full version value (version ≪ 4 | size) for phantom tracking.
    fn visit_leaf(&mut self, _full_version_value: u64) {}

    /// Called once per visited entry, in scan order. Return false to stop
    /// the scan.
    fn visit_value(&mut self, key: &[u8], value: u64, ti: &mut ThreadInfo) -> bool;
}

pub(crate) enum ScanState {
    Emit,
    FindNext,
    Down,
    Up,
    Retry,
}

#[inline]
fn keyref(k: &ScanKey) -> KeyRef {
    KeyRef {
        ikey: k.ikey(),
        len: k.length(),
    }
}

pub(crate) struct ScanStackElt {
    root: *mut NodeBase,
    n: *mut Leaf,
    v: Version,
    perm: Permuter,
    ki: i32,
    node_stack: Vec<*mut NodeBase>,
}

impl ScanStackElt {
    fn new(root: *mut NodeBase) -> Self {
        Self {
            root,
            n: ptr::null_mut(),
            v: Version(0),
            perm: Permuter::from_value(Permuter::make_empty()),
            ki: 0,
            node_stack: Vec::new(),
        }
    }

    pub(crate) fn full_version_value(&self) -> u64 {
        (self.v.value() << SIZE_BITS) + self.perm.size() as u64
    }

    /// Physical slot under the cursor, or -1 past either end.
    #[inline]
    fn kp(&self) -> i32 {
        if self.ki >= 0 && (self.ki as usize) < self.perm.size() {
            self.perm.get(self.ki as usize) as i32
        } else {
            -1
        }
    }

    /// Position on the scan's first entry.
    unsafe fn find_initial<H: ScanHelper>(
        &mut self,
        helper: &mut H,
        ka: &mut ScanKey,
        emit_equal: bool,
        entry: &mut u64,
    ) -> ScanState {
        unsafe {
            let mut kx = KeyIndexedPosition { i: 0, p: -1 };
            let mut keylenx = 0u8;
            let mut suffix_buf = [0u8; MAX_KEY_LEN];
            let mut suffix_len = 0usize;

            'retry_root: loop {
                let (n, v) = reach_leaf(self.root, keyref(ka));
                self.n = n;
                self.v = v;
                loop {
                    if self.v.deleted() {
                        continue 'retry_root;
                    }
                    self.perm = (*self.n).permutation();
                    kx = helper.lower_with_position(ka, self.n, self.perm);
                    if kx.p >= 0 {
                        keylenx = (*self.n).keylenx(kx.p as usize);
                        compiler_barrier();
                        *entry = (*self.n).lv(kx.p as usize);
                        if keylenx_has_ksuf(keylenx) {
                            suffix_len =
                                copy_ksuf_into(&*self.n, kx.p as usize, &mut suffix_buf);
                        }
                    }
                    if (*self.n).base.version.has_changed(self.v) {
                        let (n, v) = advance_to_key(self.n, keyref(ka), self.v);
                        self.n = n;
                        self.v = v;
                        continue;
                    }
                    break;
                }

                self.ki = kx.i;
                if kx.p >= 0 {
                    if keylenx_is_layer(keylenx) {
                        self.node_stack.push(self.root);
                        self.node_stack.push(self.n as *mut NodeBase);
                        self.root = lv_layer(*entry);
                        return ScanState::Down;
                    } else if keylenx_has_ksuf(keylenx) {
                        let stored = &suffix_buf[..suffix_len];
                        let ksuf_compare = match stored.cmp(ka.suffix()) {
                            core::cmp::Ordering::Less => -1,
                            core::cmp::Ordering::Equal => 0,
                            core::cmp::Ordering::Greater => 1,
                        };
                        if helper.initial_ksuf_match(ksuf_compare, emit_equal) {
                            let keylen = ka.assign_store_suffix(stored);
                            ka.assign_store_length(keylen);
                            return ScanState::Emit;
                        }
                    } else if emit_equal {
                        return ScanState::Emit;
                    }
                    // this entry must be skipped
                    self.ki = helper.next(self.ki);
                }
                return ScanState::FindNext;
            }
        }
    }

    /// Re-descend in the current layer after a version change.
    unsafe fn find_retry<H: ScanHelper>(&mut self, helper: &H, ka: &ScanKey) -> ScanState {
        unsafe {
            loop {
                let (n, v) = reach_leaf(self.root, keyref(ka));
                self.n = n;
                self.v = v;
                if self.v.deleted() {
                    continue;
                }
                self.perm = (*self.n).permutation();
                self.ki = helper.lower(ka, self);
                return ScanState::FindNext;
            }
        }
    }

    /// Advance the cursor to the next entry to emit (or descend/ascend).
    unsafe fn find_next<H: ScanHelper>(
        &mut self,
        helper: &mut H,
        ka: &mut ScanKey,
        entry: &mut u64,
    ) -> ScanState {
        unsafe {
            if self.v.deleted() {
                return ScanState::Retry;
            }

            loop {
                let kp = self.kp();
                if kp >= 0 {
                    let ikey = (*self.n).ikey(kp as usize);
                    let keylenx = (*self.n).keylenx(kp as usize);
                    let mut keylen = keylenx as usize;
                    compiler_barrier();
                    *entry = (*self.n).lv(kp as usize);
                    if keylenx_has_ksuf(keylenx) {
                        keylen = ka.assign_store_suffix((*self.n).ksuf(kp as usize));
                    }

                    if (*self.n).base.version.has_changed(self.v) {
                        // fall through to restabilize
                    } else if helper.is_duplicate(ka, ikey, keylenx) {
                        self.ki = helper.next(self.ki);
                        continue;
                    } else {
                        // the data collected above is consistent: emit it
                        ka.assign_store_ikey(ikey);
                        helper.found();
                        if keylenx_is_layer(keylenx) {
                            self.node_stack.push(self.root);
                            self.node_stack.push(self.n as *mut NodeBase);
                            self.root = lv_layer(*entry);
                            return ScanState::Down;
                        } else {
                            ka.assign_store_length(keylen);
                            return ScanState::Emit;
                        }
                    }
                } else if !(*self.n).base.version.has_changed(self.v) {
                    let next = helper.advance(self.n, ka);
                    if next.is_null() {
                        return ScanState::Up;
                    }
                    self.n = next;
                }

                self.v = helper.stable(&mut self.n, ka);
                self.perm = (*self.n).permutation();
                self.ki = helper.lower(ka, self);
                return ScanState::FindNext;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Direction helpers
// ---------------------------------------------------------------------------

pub(crate) trait ScanHelper {
    fn initial_ksuf_match(&self, ksuf_compare: i32, emit_equal: bool) -> bool;
    fn is_duplicate(&self, k: &ScanKey, ikey: u64, keylenx: u8) -> bool;
    unsafe fn lower(&self, k: &ScanKey, e: &ScanStackElt) -> i32;
    unsafe fn lower_with_position(
        &self,
        k: &ScanKey,
        n: *mut Leaf,
        perm: Permuter,
    ) -> KeyIndexedPosition;
    fn found(&mut self);
    fn next(&self, ki: i32) -> i32;
    unsafe fn advance(&self, n: *mut Leaf, k: &mut ScanKey) -> *mut Leaf;
    unsafe fn stable(&self, n: &mut *mut Leaf, k: &ScanKey) -> Version;
    fn shift_clear(&mut self, ka: &mut ScanKey);
}

pub(crate) struct ForwardScan;

impl ScanHelper for ForwardScan {
    fn initial_ksuf_match(&self, ksuf_compare: i32, emit_equal: bool) -> bool {
        ksuf_compare > 0 || (ksuf_compare == 0 && emit_equal)
    }

    fn is_duplicate(&self, k: &ScanKey, ikey: u64, keylenx: u8) -> bool {
        k.compare_slot(ikey, keylenx) >= 0
    }

    unsafe fn lower(&self, k: &ScanKey, e: &ScanStackElt) -> i32 {
        unsafe { leaf_lower_bound(keyref(k), &*e.n, e.perm).i }
    }

    unsafe fn lower_with_position(
        &self,
        k: &ScanKey,
        n: *mut Leaf,
        perm: Permuter,
    ) -> KeyIndexedPosition {
        unsafe { leaf_lower_bound(keyref(k), &*n, perm) }
    }

    fn found(&mut self) {}

    fn next(&self, ki: i32) -> i32 {
        ki + 1
    }

    unsafe fn advance(&self, n: *mut Leaf, _k: &mut ScanKey) -> *mut Leaf {
        unsafe { (*n).safe_next() }
    }

    unsafe fn stable(&self, n: &mut *mut Leaf, _k: &ScanKey) -> Version {
        unsafe { (**n).base.version.stable() }
    }

    fn shift_clear(&mut self, ka: &mut ScanKey) {
        ka.shift_clear();
    }
}

#[derive(Default)]
pub(crate) struct ReverseScan {
    /// Set while positioned at a layer's upper bound (no key to compare
    /// against yet).
    upper_bound: bool,
}

impl ScanHelper for ReverseScan {
    fn initial_ksuf_match(&self, ksuf_compare: i32, emit_equal: bool) -> bool {
        ksuf_compare < 0 || (ksuf_compare == 0 && emit_equal)
    }

    fn is_duplicate(&self, k: &ScanKey, ikey: u64, keylenx: u8) -> bool {
        k.compare_slot(ikey, keylenx) <= 0 && !self.upper_bound
    }

    unsafe fn lower(&self, k: &ScanKey, e: &ScanStackElt) -> i32 {
        unsafe {
            if self.upper_bound {
                return (*e.n).size() as i32 - 1;
            }
            let kx = leaf_lower_bound(keyref(k), &*e.n, e.perm);
            kx.i - (kx.p < 0) as i32
        }
    }

    unsafe fn lower_with_position(
        &self,
        k: &ScanKey,
        n: *mut Leaf,
        perm: Permuter,
    ) -> KeyIndexedPosition {
        unsafe {
            let mut kx = leaf_lower_bound(keyref(k), &*n, perm);
            kx.i -= (kx.p < 0) as i32;
            kx
        }
    }

    fn found(&mut self) {
        self.upper_bound = false;
    }

    fn next(&self, ki: i32) -> i32 {
        ki - 1
    }

    unsafe fn advance(&self, n: *mut Leaf, k: &mut ScanKey) -> *mut Leaf {
        unsafe {
            // position exclusively at this leaf's lower bound, then step
            // to the predecessor
            k.assign_store_ikey((*n).ikey_bound());
            k.assign_store_length(0);
            (*n).prev.load(core::sync::atomic::Ordering::Relaxed)
        }
    }

    unsafe fn stable(&self, n: &mut *mut Leaf, k: &ScanKey) -> Version {
        unsafe {
            // walking backward can overshoot: slide forward until this
            // leaf's range covers the cursor key
            loop {
                let v = (**n).base.version.stable();
                let next = (**n).safe_next();
                if next.is_null() {
                    return v;
                }
                let cmp = ikey_compare(k.ikey(), (*next).ikey_bound());
                if cmp < 0 || (cmp == 0 && k.length() == 0) {
                    return v;
                }
                *n = next;
            }
        }
    }

    fn shift_clear(&mut self, ka: &mut ScanKey) {
        ka.shift_clear_reverse();
        self.upper_bound = true;
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub(crate) unsafe fn scan_impl<H: ScanHelper, F: Scanner>(
    root: *mut NodeBase,
    mut helper: H,
    firstkey: &[u8],
    emit_firstkey: bool,
    scanner: &mut F,
    ti: &mut ThreadInfo,
) -> usize {
    unsafe {
        let mut ka = ScanKey::new(firstkey);
        let mut stack = ScanStackElt::new(root);
        let mut entry = 0u64;
        let mut scancount = 0usize;

        let mut state;
        loop {
            state = stack.find_initial(&mut helper, &mut ka, emit_firstkey, &mut entry);
            scanner.visit_leaf(stack.full_version_value());
            if !matches!(state, ScanState::Down) {
                break;
            }
            ka.shift();
        }

        loop {
            match state {
                ScanState::Emit => {
                    scancount += 1;
                    if !scanner.visit_value(ka.full(), entry, ti) {
                        return scancount;
                    }
                    stack.ki = helper.next(stack.ki);
                    state = stack.find_next(&mut helper, &mut ka, &mut entry);
                }
                ScanState::FindNext => {
                    state = stack.find_next(&mut helper, &mut ka, &mut entry);
                    if !matches!(state, ScanState::Up) {
                        scanner.visit_leaf(stack.full_version_value());
                    }
                }
                ScanState::Up => {
                    loop {
                        if stack.node_stack.is_empty() {
                            return scancount;
                        }
                        stack.n = stack.node_stack.pop().unwrap() as *mut Leaf;
                        stack.root = stack.node_stack.pop().unwrap();
                        ka.unshift();
                        if !ka.empty() {
                            break;
                        }
                    }
                    stack.v = helper.stable(&mut stack.n, &ka);
                    stack.perm = (*stack.n).permutation();
                    stack.ki = helper.lower(&ka, &stack);
                    state = ScanState::FindNext;
                }
                ScanState::Down => {
                    helper.shift_clear(&mut ka);
                    state = ScanState::Retry;
                }
                ScanState::Retry => {
                    state = stack.find_retry(&helper, &ka);
                }
            }
        }
    }
}
