//! Masstree: a concurrent B⁺-trie over 8-byte key slices.
//!
//! Keys descend a trie one big-endian 8-byte slice at a time; each trie
//! *layer* is a B⁺-tree of 15-wide nodes. When two keys collide on every
//! slice a layer holds, the colliding slot becomes a pointer to a child
//! layer. Readers are optimistic (version-validated, never blocking);
//! writers lock individual leaves and hand-over-hand through parents
//! during splits. Node memory retires through the limbo engine, so
//! readers bracket operations with a live [`crate::LimboHandle`].

pub mod cursor;
pub mod key;
pub mod leaflink;
pub mod node;
pub mod nodeversion;
pub mod permuter;
pub mod remove;
pub mod scan;
pub mod split;
pub mod stringbag;

pub use cursor::{TCursor, UnlockedCursor};
pub use key::MtKey;
pub use node::{InterNode, Leaf, NodeBase};
pub use nodeversion::{NodeVersion, Version};
pub use permuter::{Permuter, WIDTH};
pub use scan::Scanner;

use crate::limbo::ThreadInfo;
use crate::masstree::node::Leaf as LeafNode;
use crate::masstree::scan::{ForwardScan, ReverseScan, scan_impl};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// An ordered map from byte keys (up to `config::MAX_KEY_LEN`) to `u64`
/// values. Values are opaque words — if they are pointers, freeing what
/// they point at is the caller's business, including at `destroy`.
pub struct Table {
    root: AtomicPtr<NodeBase>,
}

unsafe impl Send for Table {}
unsafe impl Sync for Table {}

impl Table {
    pub const fn new() -> Self {
        Self {
            root: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Create the empty root leaf. Must run once before any operation.
    ///
    /// # Safety
    ///
    /// `ti` must be the calling worker's ThreadInfo.
    pub unsafe fn initialize(&self, ti: &mut ThreadInfo) {
        assert!(self.root.load(Ordering::Relaxed).is_null());
        let root = unsafe { LeafNode::make_root(0, ptr::null_mut(), ti) };
        self.root.store(root as *mut NodeBase, Ordering::Release);
    }

    #[inline]
    fn root(&self) -> *mut NodeBase {
        self.root.load(Ordering::Acquire)
    }

    /// Advance the published root past splits: when the recorded root
    /// gained a parent, CAS the pointer up one level.
    unsafe fn fix_root(&self) -> *mut NodeBase {
        let old_root = self.root();
        unsafe {
            if !(*old_root).version.is_root() {
                let new_root = (*old_root).maybe_parent();
                let _ = self.root.compare_exchange(
                    old_root,
                    new_root,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
        old_root
    }

    /// Non-blocking point lookup.
    ///
    /// # Safety
    ///
    /// The calling worker must hold a live LimboHandle so optimistically
    /// read nodes cannot be reclaimed mid-read; `ti` is its ThreadInfo.
    pub unsafe fn get(&self, key: &[u8], ti: &mut ThreadInfo) -> Option<u64> {
        unsafe {
            let mut lp = UnlockedCursor::new(self.root(), key);
            if lp.find_unlocked(ti) {
                Some(lp.value())
            } else {
                None
            }
        }
    }

    /// Insert or overwrite. Returns true when the key was newly created.
    ///
    /// # Safety
    ///
    /// As [`Table::get`].
    pub unsafe fn put(&self, key: &[u8], value: u64, ti: &mut ThreadInfo) -> bool {
        unsafe {
            let mut lp = TCursor::new(self.fix_root(), key);
            let found = lp.find_insert(ti);
            lp.set_value(value);
            lp.finish(1, ti);
            !found
        }
    }

    /// Logically delete the key. Returns whether it was present. Empty
    /// nested layers collapse later through an RCU callback.
    ///
    /// # Safety
    ///
    /// As [`Table::get`].
    pub unsafe fn remove(&self, key: &[u8], ti: &mut ThreadInfo) -> bool {
        unsafe {
            let mut lp = TCursor::new(self.fix_root(), key);
            let found = lp.find_locked(ti) == 1;
            lp.finish(-1, ti);
            found
        }
    }

    /// Ordered forward scan from `firstkey` (inclusive when
    /// `emit_firstkey`). Returns the number of entries visited.
    ///
    /// # Safety
    ///
    /// As [`Table::get`].
    pub unsafe fn scan<F: Scanner>(
        &self,
        firstkey: &[u8],
        emit_firstkey: bool,
        scanner: &mut F,
        ti: &mut ThreadInfo,
    ) -> usize {
        unsafe { scan_impl(self.root(), ForwardScan, firstkey, emit_firstkey, scanner, ti) }
    }

    /// Ordered reverse scan from `firstkey` downward.
    ///
    /// # Safety
    ///
    /// As [`Table::get`].
    pub unsafe fn rscan<F: Scanner>(
        &self,
        firstkey: &[u8],
        emit_firstkey: bool,
        scanner: &mut F,
        ti: &mut ThreadInfo,
    ) -> usize {
        unsafe {
            scan_impl(
                self.root(),
                ReverseScan::default(),
                firstkey,
                emit_firstkey,
                scanner,
                ti,
            )
        }
    }

    /// Tear the whole trie down through a two-phase RCU callback: first
    /// mark the root dead, then (a grace period later) free every node
    /// and sub-layer. The table can be `initialize`d again afterwards.
    ///
    /// # Safety
    ///
    /// `ti` must be the calling worker's ThreadInfo.
    pub unsafe fn destroy(&self, ti: &mut ThreadInfo) {
        let root = self.root.swap(ptr::null_mut(), Ordering::AcqRel);
        if !root.is_null() {
            unsafe { remove::make_destroy_callback(root, ti) };
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limbo::test_support::test_worker;
    use alloc::format;
    use alloc::string::String;
    use alloc::vec::Vec;

    struct Collect {
        keys: Vec<String>,
        values: Vec<u64>,
        limit: Option<Vec<u8>>,
    }

    impl Collect {
        fn new() -> Self {
            Self {
                keys: Vec::new(),
                values: Vec::new(),
                limit: None,
            }
        }
        fn until(limit: &[u8]) -> Self {
            Self {
                keys: Vec::new(),
                values: Vec::new(),
                limit: Some(limit.to_vec()),
            }
        }
    }

    impl Scanner for Collect {
        fn visit_value(&mut self, key: &[u8], value: u64, _ti: &mut ThreadInfo) -> bool {
            if let Some(limit) = &self.limit {
                if key >= &limit[..] {
                    return false;
                }
            }
            self.keys.push(String::from_utf8_lossy(key).into_owned());
            self.values.push(value);
            true
        }
    }

    fn new_table(ti: &mut ThreadInfo) -> Table {
        let t = Table::new();
        unsafe { t.initialize(ti) };
        t
    }

    #[test]
    fn test_put_get_remove_basic() {
        let ti = unsafe { &mut *crate::limbo::thread_info(test_worker()) };
        let t = new_table(ti);
        unsafe {
            assert!(t.put(b"hello", 1, ti));
            assert!(t.put(b"world", 2, ti));
            assert!(!t.put(b"hello", 3, ti), "overwrite is not a new key");
            assert_eq!(t.get(b"hello", ti), Some(3));
            assert_eq!(t.get(b"world", ti), Some(2));
            assert_eq!(t.get(b"nope", ti), None);
            assert!(t.remove(b"hello", ti));
            assert!(!t.remove(b"hello", ti));
            assert_eq!(t.get(b"hello", ti), None);
            assert_eq!(t.get(b"world", ti), Some(2));
        }
    }

    #[test]
    fn test_short_and_exact_8_byte_keys() {
        let ti = unsafe { &mut *crate::limbo::thread_info(test_worker()) };
        let t = new_table(ti);
        unsafe {
            assert!(t.put(b"", 10, ti));
            assert!(t.put(b"a", 11, ti));
            assert!(t.put(b"abcdefgh", 12, ti)); // exactly one slice
            assert!(t.put(b"abcdefghi", 13, ti)); // 8 + suffix
            assert_eq!(t.get(b"", ti), Some(10));
            assert_eq!(t.get(b"a", ti), Some(11));
            assert_eq!(t.get(b"abcdefgh", ti), Some(12));
            assert_eq!(t.get(b"abcdefghi", ti), Some(13));
            assert_eq!(t.get(b"abcdefg", ti), None);
        }
    }

    #[test]
    fn test_layer_creation_on_shared_prefix() {
        let ti = unsafe { &mut *crate::limbo::thread_info(test_worker()) };
        let t = new_table(ti);
        unsafe {
            // same first two slices, divergence in the third
            let k1 = b"PREFIX00PREFIX11aaaa";
            let k2 = b"PREFIX00PREFIX11bbbb";
            assert!(t.put(k1, 100, ti));
            assert!(t.put(k2, 200, ti));
            assert_eq!(t.get(k1, ti), Some(100));
            assert_eq!(t.get(k2, ti), Some(200));
            // the shared-prefix siblings scan in byte order
            let mut c = Collect::new();
            let n = t.scan(b"", true, &mut c, ti);
            assert_eq!(n, 2);
            assert_eq!(c.values, alloc::vec![100, 200]);

            assert!(t.remove(k1, ti));
            assert_eq!(t.get(k1, ti), None);
            assert_eq!(t.get(k2, ti), Some(200));
        }
    }

    #[test]
    fn test_many_keys_force_splits() {
        let ti = unsafe { &mut *crate::limbo::thread_info(test_worker()) };
        let t = new_table(ti);
        let n = 2000u32;
        unsafe {
            for i in 0..n {
                let key = format!("key{:08}", i * 7 % n);
                assert!(t.put(key.as_bytes(), i as u64, ti), "dup at {i}");
            }
            for i in 0..n {
                let key = format!("key{:08}", i * 7 % n);
                assert_eq!(t.get(key.as_bytes(), ti), Some(i as u64), "miss {key}");
            }
            let mut c = Collect::new();
            let count = t.scan(b"", true, &mut c, ti);
            assert_eq!(count, n as usize);
            let mut sorted = c.keys.clone();
            sorted.sort();
            assert_eq!(c.keys, sorted, "scan out of order");
        }
    }

    #[test]
    fn test_spec_stride_scan() {
        let ti = unsafe { &mut *crate::limbo::thread_info(test_worker()) };
        let t = new_table(ti);
        unsafe {
            // 100 twelve-digit keys with stride 5
            let mut expect = Vec::new();
            for i in 0..100u64 {
                let key = format!("{}", 123_456_789_012u64 + i * 5);
                assert!(t.put(key.as_bytes(), i, ti));
                expect.push(key);
            }
            assert_eq!(t.get(b"123456789017", ti), Some(1));
            assert_eq!(t.get(b"123456789013", ti), None);

            let mut c = Collect::until(b"123456790000");
            t.scan(b"123456789012", true, &mut c, ti);
            assert_eq!(c.keys.len(), 100);
            assert_eq!(c.keys, expect);
        }
    }

    #[test]
    fn test_rscan_reverses_order() {
        let ti = unsafe { &mut *crate::limbo::thread_info(test_worker()) };
        let t = new_table(ti);
        unsafe {
            for i in 0..50u64 {
                let key = format!("rk{:04}", i);
                t.put(key.as_bytes(), i, ti);
            }
            let mut c = Collect::new();
            let n = t.rscan(b"rk9999", false, &mut c, ti);
            assert_eq!(n, 50);
            let mut expect: Vec<String> = (0..50).map(|i| format!("rk{:04}", i)).collect();
            expect.reverse();
            assert_eq!(c.keys, expect);
        }
    }

    #[test]
    fn test_remove_down_to_empty_and_reinsert() {
        let ti = unsafe { &mut *crate::limbo::thread_info(test_worker()) };
        let t = new_table(ti);
        unsafe {
            for i in 0..300u32 {
                let key = format!("del{:06}", i);
                assert!(t.put(key.as_bytes(), i as u64, ti));
            }
            for i in 0..300u32 {
                let key = format!("del{:06}", i);
                assert!(t.remove(key.as_bytes(), ti), "remove miss {key}");
            }
            let mut c = Collect::new();
            assert_eq!(t.scan(b"", true, &mut c, ti), 0);
            // the tree still works after total removal
            assert!(t.put(b"again", 9, ti));
            assert_eq!(t.get(b"again", ti), Some(9));
        }
    }

    #[test]
    fn test_long_key_chain_layers() {
        let ti = unsafe { &mut *crate::limbo::thread_info(test_worker()) };
        let t = new_table(ti);
        unsafe {
            // diverge only in the fourth 8-byte slice
            let base = b"AAAAAAAABBBBBBBBCCCCCCCC";
            let mut k1 = base.to_vec();
            k1.extend_from_slice(b"DDDDDDD1tail-one");
            let mut k2 = base.to_vec();
            k2.extend_from_slice(b"DDDDDDD2tail-two");
            assert!(t.put(&k1, 1, ti));
            assert!(t.put(&k2, 2, ti));
            assert_eq!(t.get(&k1, ti), Some(1));
            assert_eq!(t.get(&k2, ti), Some(2));
            // a prefix of the chain is absent
            assert_eq!(t.get(base, ti), None);
            let mut c = Collect::new();
            assert_eq!(t.scan(b"", true, &mut c, ti), 2);
            assert_eq!(c.values, alloc::vec![1, 2]);
        }
    }

    #[test]
    fn test_destroy_then_reinitialize() {
        let ti = unsafe { &mut *crate::limbo::thread_info(test_worker()) };
        let t = new_table(ti);
        unsafe {
            for i in 0..10u64 {
                let key = format!("destroy{:02}", i);
                t.put(key.as_bytes(), i, ti);
            }
            t.destroy(ti);
            // the destroy callback runs in two reclamation phases; give
            // the epoch machinery room to pass both
            for _ in 0..100_000 {
                ti.hard_free();
                std::thread::yield_now();
            }
            t.initialize(ti);
            assert_eq!(t.get(b"destroy00", ti), None);
            assert!(t.put(b"destroy00", 42, ti));
            assert_eq!(t.get(b"destroy00", ti), Some(42));
        }
    }
}
