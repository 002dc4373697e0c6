//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., total may briefly disagree with the sum of
//! per-path counters). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};
use std::fmt;

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Address space reserved by every allocator instance in the process
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Physical memory committed by every allocator instance in the process
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Breakdown by path
crate::sync::static_atomic! {
    pub static SMALL_POOL_COMMITTED: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static OS_ALLOCATION_COMMITTED: Counter = Counter::new();
}

/// Record `size` bytes of fresh reservation.
#[inline]
pub(crate) fn on_reserve(size: usize) {
    TOTAL_RESERVED.add(size);
}

#[inline]
pub(crate) fn on_release(size: usize) {
    TOTAL_RESERVED.sub(size);
}

/// Record a commit on one of the two allocation paths.
#[inline]
pub(crate) fn on_commit(path: &Counter, size: usize) {
    TOTAL_COMMITTED.add(size);
    path.add(size);
}

#[inline]
pub(crate) fn on_decommit(path: &Counter, size: usize) {
    TOTAL_COMMITTED.sub(size);
    path.sub(size);
}

/// Process-wide counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalCounters {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub small_pool_committed: usize,
    pub os_allocation_committed: usize,
}

impl GlobalCounters {
    pub fn snapshot() -> Self {
        Self {
            total_reserved: TOTAL_RESERVED.get(),
            total_committed: TOTAL_COMMITTED.get(),
            small_pool_committed: SMALL_POOL_COMMITTED.get(),
            os_allocation_committed: OS_ALLOCATION_COMMITTED.get(),
        }
    }
}

/// Per size class numbers gathered under that pool's lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    pub committed_slabs: usize,
    pub empty_slabs: usize,
    /// Blocks handed out by the slab layer. Blocks parked in thread caches or
    /// in the recycler count as live here.
    pub live_blocks: usize,
    pub recycled_bundles: usize,
}

/// Snapshot of one allocator instance.
#[derive(Clone, Debug, Default)]
pub struct AllocatorStats {
    pub pools: Vec<PoolStats>,
    pub os_allocations: usize,
    pub os_allocated_bytes: usize,
    pub os_mapped_bytes: usize,
    pub registered_thread_caches: usize,
    pub thread_cached_bytes: usize,
}

impl AllocatorStats {
    pub fn small_committed_bytes(&self, slab_size: usize) -> usize {
        self.pools.iter().map(|p| p.committed_slabs * slab_size).sum()
    }

    pub fn live_small_bytes(&self) -> usize {
        self.pools.iter().map(|p| p.live_blocks * p.block_size).sum()
    }
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>8} {:>8} {:>6} {:>10} {:>8}", "block", "slabs", "empty", "live", "bundles")?;
        for pool in self.pools.iter().filter(|p| p.committed_slabs > 0 || p.recycled_bundles > 0) {
            writeln!(
                f,
                "{:>8} {:>8} {:>6} {:>10} {:>8}",
                pool.block_size, pool.committed_slabs, pool.empty_slabs, pool.live_blocks, pool.recycled_bundles
            )?;
        }
        writeln!(f, "small live bytes:   {}", self.live_small_bytes())?;
        writeln!(
            f,
            "os allocations:     {} ({} bytes requested, {} bytes mapped)",
            self.os_allocations, self.os_allocated_bytes, self.os_mapped_bytes
        )?;
        writeln!(
            f,
            "thread caches:      {} ({} bytes cached)",
            self.registered_thread_caches, self.thread_cached_bytes
        )?;
        let g = GlobalCounters::snapshot();
        write!(
            f,
            "process totals:     {} reserved, {} committed ({} small, {} os)",
            g.total_reserved, g.total_committed, g.small_pool_committed, g.os_allocation_committed
        )
    }
}
