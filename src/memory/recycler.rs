// ----------------------------------------------------------------------------
// Global Recycler: lock-free cross-thread bundle recycling
// ----------------------------------------------------------------------------

use super::thread_cache::FreeBlock;
use crate::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::NonNull;

/// Fixed-capacity set of bundle slots per size class.
///
/// Each slot holds at most one bundle head (0 = empty). Push claims the first
/// empty slot with `null -> head`, pop claims the first occupied slot with
/// `head -> null`. A slot is never read through before the CAS that takes
/// ownership succeeds, so a head reappearing at the same address (ABA) is
/// the same bundle and the swap stays correct without generation tags.
///
/// Pushes and pops on different size classes touch disjoint slots and never
/// contend.
pub(crate) struct GlobalRecycler {
    slots: Box<[AtomicUsize]>,
    slots_per_pool: usize,
}

impl GlobalRecycler {
    pub fn new(pool_count: usize, slots_per_pool: usize) -> Self {
        Self {
            slots: (0..pool_count * slots_per_pool).map(|_| AtomicUsize::new(0)).collect(),
            slots_per_pool,
        }
    }

    #[inline]
    fn pool_slots(&self, pool_index: usize) -> &[AtomicUsize] {
        let start = pool_index * self.slots_per_pool;
        &self.slots[start..start + self.slots_per_pool]
    }

    #[inline]
    pub fn slots_per_pool(&self) -> usize {
        self.slots_per_pool
    }

    /// Park a bundle. Returns `false` if every slot of the pool is taken;
    /// the caller still owns the bundle and must free its blocks.
    ///
    /// The bundle's links must be fully written before the call; the
    /// successful CAS publishes them.
    pub fn push_bundle(&self, pool_index: usize, head: NonNull<FreeBlock>) -> bool {
        let raw = head.as_ptr() as usize;
        for slot in self.pool_slots(pool_index) {
            if slot.load(Ordering::Relaxed) == 0
                && slot
                    .compare_exchange(0, raw, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Take any parked bundle of `pool_index`.
    pub fn pop_bundle(&self, pool_index: usize) -> Option<NonNull<FreeBlock>> {
        for slot in self.pool_slots(pool_index) {
            let cur = slot.load(Ordering::Relaxed);
            if cur != 0
                && slot
                    .compare_exchange(cur, 0, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return NonNull::new(cur as *mut FreeBlock);
            }
        }
        None
    }

    /// Occupied slots of a pool. Diagnostic only.
    pub fn bundle_count(&self, pool_index: usize) -> usize {
        self.pool_slots(pool_index)
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) != 0)
            .count()
    }
}
