//! 64-bit node version word.
//!
//! Layout, low to high: 8 unused bits, lock, inserting, splitting, a
//! 16-bit insert counter, a 33-bit split counter, one unused bit, the
//! deleted / root / is-leaf flags. `inserting|splitting` are the *dirty*
//! bits: writers raise them before touching the node and `unlock` rolls
//! them into the counters, so an optimistic reader that observes the same
//! clean version before and after its reads saw a consistent node.

use crate::sync::{acquire_fence, compiler_barrier, release_fence, spin_hint};
use core::sync::atomic::{AtomicU64, Ordering};

pub const LOCK_BIT: u64 = 1 << 8;
pub const INSERTING_SHIFT: u32 = 9;
pub const INSERTING_BIT: u64 = 1 << 9;
pub const SPLITTING_BIT: u64 = 1 << 10;
pub const DIRTY_MASK: u64 = INSERTING_BIT | SPLITTING_BIT;
pub const VINSERT_LOWBIT: u64 = 1 << 11;
pub const VSPLIT_LOWBIT: u64 = 1 << 27;
pub const UNUSED1_BIT: u64 = 1 << 60;
pub const DELETED_BIT: u64 = 1 << 61;
pub const ROOT_BIT: u64 = 1 << 62;
pub const ISLEAF_BIT: u64 = 1 << 63;
pub const SPLIT_UNLOCK_MASK: u64 = !(ROOT_BIT | UNUSED1_BIT | (VSPLIT_LOWBIT - 1));
pub const UNLOCK_MASK: u64 = !(UNUSED1_BIT | (VINSERT_LOWBIT - 1));
/// Bits of headroom above the version in a "full" version value.
pub const TOP_STABLE_BITS: u32 = 4;

/// An observed version value. Plain data; compare against the live word
/// with [`NodeVersion::has_changed`] / [`NodeVersion::has_split`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Version(pub u64);

impl Version {
    #[inline]
    pub fn is_leaf(self) -> bool {
        self.0 & ISLEAF_BIT != 0
    }
    #[inline]
    pub fn is_root(self) -> bool {
        self.0 & ROOT_BIT != 0
    }
    #[inline]
    pub fn deleted(self) -> bool {
        self.0 & DELETED_BIT != 0
    }
    #[inline]
    pub fn locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }
    #[inline]
    pub fn inserting(self) -> bool {
        self.0 & INSERTING_BIT != 0
    }
    #[inline]
    pub fn splitting(self) -> bool {
        self.0 & SPLITTING_BIT != 0
    }
    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Version")
            .field("leaf", &self.is_leaf())
            .field("root", &self.is_root())
            .field("deleted", &self.deleted())
            .field("locked", &self.locked())
            .field("inserting", &self.inserting())
            .field("splitting", &self.splitting())
            .field("vinsert", &((self.0 >> 11) & 0xFFFF))
            .field("vsplit", &((self.0 >> 27) & 0x1_FFFF_FFFF))
            .finish()
    }
}

/// The live version word embedded in every node.
#[repr(transparent)]
pub struct NodeVersion(AtomicU64);

impl NodeVersion {
    pub fn new(is_leaf: bool) -> Self {
        Self(AtomicU64::new(if is_leaf { ISLEAF_BIT } else { 0 }))
    }

    /// Raw initialization for zeroed node memory.
    ///
    /// # Safety
    ///
    /// Only before the node is published.
    pub unsafe fn init(&self, is_leaf: bool) {
        self.0
            .store(if is_leaf { ISLEAF_BIT } else { 0 }, Ordering::Relaxed);
    }

    #[inline]
    pub fn snapshot(&self) -> Version {
        Version(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.snapshot().is_leaf()
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.snapshot().is_root()
    }

    #[inline]
    pub fn deleted(&self) -> bool {
        self.snapshot().deleted()
    }

    #[inline]
    pub fn locked(&self) -> bool {
        self.snapshot().locked()
    }

    /// Spin until the dirty bits clear, then fence so subsequent reads see
    /// at least the state the returned version covers.
    pub fn stable(&self) -> Version {
        let mut x = self.0.load(Ordering::Relaxed);
        while x & DIRTY_MASK != 0 {
            spin_hint();
            x = self.0.load(Ordering::Relaxed);
        }
        acquire_fence();
        Version(x)
    }

    /// True when the live word differs from `x` in anything above the lock
    /// bit (dirty bits or counters).
    #[inline]
    pub fn has_changed(&self, x: Version) -> bool {
        compiler_barrier();
        (x.0 ^ self.0.load(Ordering::Relaxed)) > LOCK_BIT
    }

    /// True when the live word's split counter moved past `x`'s.
    #[inline]
    pub fn has_split(&self, x: Version) -> bool {
        compiler_barrier();
        (x.0 ^ self.0.load(Ordering::Relaxed)) >= VSPLIT_LOWBIT
    }

    /// Acquire the lock bit, spinning past other holders. Returns the
    /// locked version.
    pub fn lock(&self) -> Version {
        let mut expected = self.0.load(Ordering::Relaxed);
        loop {
            if expected & LOCK_BIT == 0 {
                match self.0.compare_exchange_weak(
                    expected,
                    expected | LOCK_BIT,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(cur) => {
                        expected = cur;
                        continue;
                    }
                }
            }
            spin_hint();
            expected = self.0.load(Ordering::Relaxed);
        }
        debug_assert!(expected & DIRTY_MASK == 0);
        acquire_fence();
        Version(expected | LOCK_BIT)
    }

    /// Release the lock, folding raised dirty bits into the counters.
    pub fn unlock(&self) {
        let mut x = self.0.load(Ordering::Relaxed);
        debug_assert!(x & LOCK_BIT != 0);
        if x & SPLITTING_BIT != 0 {
            x = x.wrapping_add(VSPLIT_LOWBIT) & SPLIT_UNLOCK_MASK;
        } else {
            x = x.wrapping_add((x & INSERTING_BIT) << 2) & UNLOCK_MASK;
        }
        release_fence();
        self.0.store(x, Ordering::Relaxed);
    }

    /// Raise the inserting dirty bit. Caller holds the lock.
    pub fn mark_insert(&self) {
        debug_assert!(self.locked());
        self.0.fetch_or(INSERTING_BIT, Ordering::Relaxed);
        acquire_fence();
    }

    /// Raise the splitting dirty bit. Caller holds the lock.
    pub fn mark_split(&self) {
        debug_assert!(self.locked());
        self.0.fetch_or(SPLITTING_BIT, Ordering::Relaxed);
        acquire_fence();
    }

    /// Raise inserting or splitting. Caller holds the lock.
    pub fn mark_change(&self, is_split: bool) {
        debug_assert!(self.locked());
        self.0
            .fetch_or((is_split as u64 + 1) << INSERTING_SHIFT, Ordering::Relaxed);
        acquire_fence();
    }

    /// Mark the node dead; counts as a split so stale readers advance off
    /// it. Caller holds the lock.
    pub fn mark_deleted(&self) {
        debug_assert!(self.locked());
        self.0
            .fetch_or(DELETED_BIT | SPLITTING_BIT, Ordering::Relaxed);
        acquire_fence();
    }

    /// Mark a whole tree dead at its root (deleted but not splitting).
    /// Caller holds the lock on the root.
    pub fn mark_deleted_tree(&self) {
        debug_assert!(self.locked() && self.is_root());
        self.0.fetch_or(DELETED_BIT, Ordering::Relaxed);
        acquire_fence();
    }

    pub fn mark_root(&self) {
        self.0.fetch_or(ROOT_BIT, Ordering::Relaxed);
        acquire_fence();
    }

    pub fn mark_nonroot(&self) {
        self.0.fetch_and(!ROOT_BIT, Ordering::Relaxed);
        acquire_fence();
    }

    /// Copy another node's version (split children start from the
    /// parent's version, locked state included).
    ///
    /// # Safety
    ///
    /// Only before the node is published.
    pub unsafe fn assign(&self, x: Version) {
        self.0.store(x.0, Ordering::Relaxed);
    }

    #[inline]
    pub fn version_value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// The version with lock-section bits cleared, as it will read after
    /// an unlock.
    pub fn unlocked_version_value(&self) -> u64 {
        self.0.load(Ordering::Relaxed) & UNLOCK_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock_roundtrip() {
        let v = NodeVersion::new(true);
        assert!(v.is_leaf());
        let locked = v.lock();
        assert!(locked.locked());
        assert!(v.locked());
        v.unlock();
        assert!(!v.locked());
        // a plain lock/unlock with no marks must not change the version
        assert!(!v.has_changed(Version(locked.0 & !LOCK_BIT)));
    }

    #[test]
    fn test_insert_bumps_counter() {
        let v = NodeVersion::new(true);
        let before = v.stable();
        v.lock();
        v.mark_insert();
        v.unlock();
        let after = v.stable();
        assert!(v.has_changed(before));
        assert!(!v.has_split(before));
        assert_eq!(after.0 - before.0, VINSERT_LOWBIT);
    }

    #[test]
    fn test_split_bumps_counter_and_resets_insert() {
        let v = NodeVersion::new(true);
        v.lock();
        v.mark_insert();
        v.unlock();
        let mid = v.stable();
        v.lock();
        v.mark_split();
        v.unlock();
        assert!(v.has_split(mid));
        // split unlock clears the insert counter
        assert_eq!(v.version_value() & (VSPLIT_LOWBIT - 1), 0);
    }

    #[test]
    fn test_deleted_counts_as_split() {
        let v = NodeVersion::new(true);
        let before = v.stable();
        v.lock();
        v.mark_deleted();
        assert!(v.deleted());
        v.unlock();
        assert!(v.has_split(before));
        assert!(v.deleted());
    }

    #[test]
    fn test_root_flag() {
        let v = NodeVersion::new(false);
        assert!(!v.is_root());
        v.mark_root();
        assert!(v.is_root());
        v.mark_nonroot();
        assert!(!v.is_root());
    }
}
