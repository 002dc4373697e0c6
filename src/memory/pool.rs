use super::bit_tree::BitTreeChain;
use super::config::ArenaParams;
use super::stats::{self, PoolStats};
use super::vm::{VirtualMemory, VirtualMemoryBlock, VmError};
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

const BIN_SENTINEL: u16 = 0xFFFF;

/// 8-bit canary value written into every `SlabMeta` on creation.
const SLAB_CANARY: u8 = 0xA5;

/// 32-bit canary written at offset 4 of every block freed into a slab.
/// Checked when the block is handed out again.
pub(crate) const FREE_CANARY: u32 = 0xAB_AD_BA_BE;

/// Per-slab metadata packed into 8 bytes.
///
/// Bit layout of `packed: u64`:
/// ```text
///   [63..56] canary      (8 bits)  always SLAB_CANARY (0xA5)
///   [55..48] reserved    (8 bits)
///   [47..32] bump_cursor (16 bits) next never-used block
///   [31..16] free_head   (16 bits) first freed block, or 0xFFFF
///   [15..0]  free_count  (16 bits) free blocks, bumpable ones included
/// ```
///
/// Committed state lives in the owning pool's bitset, not here.
#[derive(Clone, Copy)]
pub(crate) struct SlabMeta {
    packed: u64,
}

impl SlabMeta {
    /// Slot value for slabs that were never committed.
    const UNUSED: Self = Self { packed: 0 };

    pub fn new(blocks: u16) -> Self {
        let mut packed = u64::from(SLAB_CANARY) << 56;
        // bump_cursor = 0 (implicit)
        packed |= u64::from(BIN_SENTINEL) << 16;
        packed |= u64::from(blocks);
        Self { packed }
    }

    #[inline]
    pub fn free_count(self) -> u16 {
        (self.packed & 0xFFFF) as u16
    }

    #[inline]
    fn set_free_count(&mut self, v: u16) {
        self.packed = (self.packed & !0xFFFF) | u64::from(v);
    }

    #[inline]
    pub fn free_head(self) -> u16 {
        ((self.packed >> 16) & 0xFFFF) as u16
    }

    #[inline]
    fn set_free_head(&mut self, v: u16) {
        self.packed = (self.packed & !(0xFFFF << 16)) | (u64::from(v) << 16);
    }

    #[inline]
    pub fn bump_cursor(self) -> u16 {
        ((self.packed >> 32) & 0xFFFF) as u16
    }

    #[inline]
    fn set_bump_cursor(&mut self, v: u16) {
        self.packed = (self.packed & !(0xFFFF << 32)) | (u64::from(v) << 32);
    }

    #[inline]
    fn canary(self) -> u8 {
        (self.packed >> 56) as u8
    }

    /// Verify canary byte. Panics on corruption.
    #[inline]
    pub fn check_canary(self, slab: usize) {
        let canary = self.canary();
        assert!(
            canary == SLAB_CANARY,
            "BinnedAllocator corruption: slab {slab} canary was 0x{canary:02x}, expected 0x{SLAB_CANARY:02x}",
        );
    }
}

/// Inconsistency found by [`Pool::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PoolFault {
    #[error("pool {pool} slab {slab}: bad canary 0x{canary:02x}")]
    SlabCanary { pool: u16, slab: usize, canary: u8 },
    #[error("pool {pool} slab {slab}: bump {bump} / free {free} out of range")]
    CountsOutOfRange { pool: u16, slab: usize, bump: u16, free: u16 },
    #[error("pool {pool} slab {slab}: free list runs off at block {block}")]
    FreeListOverrun { pool: u16, slab: usize, block: u16 },
    #[error("pool {pool} slab {slab}: free block {block} canary 0x{canary:08x}")]
    FreeBlockCanary { pool: u16, slab: usize, block: u16, canary: u32 },
    #[error("pool {pool} slab {slab}: free count {free} but {listed} listed + {untouched} untouched")]
    FreeCountMismatch { pool: u16, slab: usize, free: u16, listed: u16, untouched: u16 },
    #[error("pool {pool} slab {slab}: tracking bits disagree with free count {free}")]
    TrackingBits { pool: u16, slab: usize, free: u16 },
    #[error("pool {pool}: {found} live blocks found, {recorded} recorded")]
    LiveCount { pool: u16, found: usize, recorded: usize },
}

/// All slabs of one size class.
///
/// Slab states: unused (never committed, or decommitted by trim),
/// committed with free blocks (`available`), committed and exhausted.
/// `empty` marks committed slabs whose blocks are all free; trim decommits
/// them. Every tracking structure is sized here, so `alloc`/`free`/`trim`
/// never touch the heap.
pub(crate) struct Pool {
    pub pool_index: u16,
    pub block_size: usize,
    pub slab_size: usize,
    pub blocks_per_slab: u16,
    /// Start of this pool's region.
    pub base: NonNull<u8>,
    /// Offset of `base` inside the backing reservation.
    pub reservation_offset: usize,
    pub reserved_size: usize,
    slabs: Box<[SlabMeta]>,
    committed: FixedBitSet,
    available: BitTreeChain,
    empty: BitTreeChain,
    /// Decommitted slabs below `high_water`.
    released: BitTreeChain,
    /// Slabs at or above this index were never committed.
    high_water: usize,
    committed_bytes: usize,
    live_blocks: usize,
}

// Safety: Pool owns its address range and is only touched under its mutex.
unsafe impl Send for Pool {}

impl Pool {
    /// Describe the pool living at `base`, `reservation_offset` bytes into
    /// its reservation. Nothing is committed yet.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if a slab cannot hold a block.
    pub fn new(
        pool_index: u16,
        block_size: usize,
        base: NonNull<u8>,
        reservation_offset: usize,
        params: &ArenaParams,
    ) -> Result<Self, VmError> {
        let slab_size = params.slab_size;
        let blocks_per_slab = slab_size / block_size;
        let blocks_per_slab = u16::try_from(blocks_per_slab)
            .ok()
            .filter(|&n| n > 0 && n < BIN_SENTINEL)
            .ok_or_else(|| {
                VmError::InitializationFailed(format!(
                    "slab of {slab_size} bytes holds {blocks_per_slab} blocks of {block_size}"
                ))
            })?;
        let slab_capacity = params.pool_reserved_size / slab_size;

        Ok(Self {
            pool_index,
            block_size,
            slab_size,
            blocks_per_slab,
            base,
            reservation_offset,
            reserved_size: slab_capacity * slab_size,
            slabs: vec![SlabMeta::UNUSED; slab_capacity].into_boxed_slice(),
            committed: FixedBitSet::with_capacity(slab_capacity),
            available: BitTreeChain::with_capacity(slab_capacity),
            empty: BitTreeChain::with_capacity(slab_capacity),
            released: BitTreeChain::with_capacity(slab_capacity),
            high_water: 0,
            committed_bytes: 0,
            live_blocks: 0,
        })
    }

    #[inline]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_addr() && addr - self.base_addr() < self.reserved_size
    }

    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes
    }

    #[inline]
    pub fn live_blocks(&self) -> usize {
        self.live_blocks
    }

    pub fn is_slab_committed(&self, slab: usize) -> bool {
        self.committed.contains(slab)
    }

    /// Address range of slab `slab`.
    pub fn slab_range(&self, slab: usize) -> std::ops::Range<usize> {
        let start = self.base_addr() + slab * self.slab_size;
        start..start + self.slab_size
    }

    /// Indices of committed slabs, lowest first.
    pub fn committed_slabs(&self) -> impl Iterator<Item = usize> + '_ {
        self.committed.ones()
    }

    #[inline]
    fn block_ptr(&self, slab: usize, block: u16) -> *mut u8 {
        // Safety: callers pass indices inside the pool region.
        unsafe {
            self.base
                .as_ptr()
                .add(slab * self.slab_size + usize::from(block) * self.block_size)
        }
    }

    /// Commit a fresh slab, reusing the lowest decommitted one first.
    fn grow(&mut self, vm: &dyn VirtualMemory, reservation: &VirtualMemoryBlock) -> Result<usize, VmError> {
        let slab = match self.released.find_first() {
            Some(idx) => idx,
            None if self.high_water < self.slabs.len() => self.high_water,
            None => {
                return Err(VmError::CommitFailed(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "Pool exhausted",
                )));
            }
        };

        let offset = self.reservation_offset + slab * self.slab_size;
        // Safety: the offset lies inside this pool's part of the reservation.
        unsafe { vm.commit(reservation, offset, self.slab_size)? };

        if slab == self.high_water {
            self.high_water += 1;
        } else {
            self.released.clear(slab);
        }
        self.committed.insert(slab);
        self.committed_bytes += self.slab_size;
        stats::on_commit(&stats::SMALL_POOL_COMMITTED, self.slab_size);

        // No eager free-list initialization: untouched blocks are handed out
        // through the bump cursor.
        self.slabs[slab] = SlabMeta::new(self.blocks_per_slab);
        self.available.set(slab);
        self.empty.set(slab);
        Ok(slab)
    }

    /// Hand out one block, committing a slab if every committed one is
    /// exhausted.
    pub fn alloc(
        &mut self,
        vm: &dyn VirtualMemory,
        reservation: &VirtualMemoryBlock,
    ) -> Result<NonNull<u8>, VmError> {
        let slab = match self.available.find_first() {
            Some(idx) => idx,
            None => self.grow(vm, reservation)?,
        };

        let mut meta = self.slabs[slab];
        meta.check_canary(slab);
        let blocks = self.blocks_per_slab;

        let block_ptr = if meta.free_head() == BIN_SENTINEL {
            // Bump path: space not yet touched by the allocator.
            let block = meta.bump_cursor();
            debug_assert!(block < blocks);
            meta.set_bump_cursor(block + 1);
            self.block_ptr(slab, block)
        } else {
            // Free-list path: recycle a previously freed block.
            let block = meta.free_head();
            let ptr = self.block_ptr(slab, block);
            // Safety: ptr is a free block of a committed slab; offsets 0..8
            // hold the link and the canary.
            let (next, canary) = unsafe { (ptr.cast::<u16>().read(), ptr.add(4).cast::<u32>().read()) };
            assert!(
                canary == FREE_CANARY,
                "BinnedAllocator corruption: free-block canary at {ptr:p}+4 was 0x{canary:08x}, expected 0x{FREE_CANARY:08x}",
            );
            // Safety: same block as above.
            unsafe { ptr.add(4).cast::<u32>().write(0) };
            meta.set_free_head(next);
            ptr
        };

        let fc = meta.free_count() - 1;
        meta.set_free_count(fc);
        self.slabs[slab] = meta;
        if fc + 1 == blocks {
            self.empty.clear(slab);
        }
        if fc == 0 {
            self.available.clear(slab);
        }
        self.live_blocks += 1;

        // Safety: block_ptr is inside the pool region, hence non-null.
        Ok(unsafe { NonNull::new_unchecked(block_ptr) })
    }

    /// Return a block to its slab.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not the start of a live block of this pool.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        assert!(self.contains(addr), "Pointer {ptr:p} does not belong to pool {}", self.pool_index);

        let offset = addr - self.base_addr();
        let slab = offset / self.slab_size;
        let offset_in_slab = offset % self.slab_size;
        assert!(
            self.committed.contains(slab),
            "Pointer {ptr:p} belongs to an uncommitted slab of pool {} (double free after trim?)",
            self.pool_index
        );
        assert!(
            offset_in_slab.is_multiple_of(self.block_size),
            "Pointer {ptr:p} is not aligned to block size {}",
            self.block_size
        );
        #[allow(clippy::cast_possible_truncation)]
        let block = (offset_in_slab / self.block_size) as u16;

        let mut meta = self.slabs[slab];
        meta.check_canary(slab);
        assert!(
            block < meta.bump_cursor() && meta.free_count() < self.blocks_per_slab,
            "Pointer {ptr:p} was never handed out by pool {}",
            self.pool_index
        );

        #[cfg(debug_assertions)]
        {
            // Safety: the block is inside a committed slab.
            let canary = unsafe { ptr.as_ptr().add(4).cast::<u32>().read() };
            if canary == FREE_CANARY {
                assert!(
                    !self.free_list_contains(slab, meta, block),
                    "Double free detected in BinnedAllocator: pool {}, slab {slab}, block {block}",
                    self.pool_index
                );
            }
        }

        // Safety: the caller hands the block back; its bytes are ours until
        // the next alloc returns it.
        unsafe {
            ptr.as_ptr().cast::<u16>().write(meta.free_head());
            ptr.as_ptr().add(4).cast::<u32>().write(FREE_CANARY);
        }
        meta.set_free_head(block);
        let fc = meta.free_count() + 1;
        meta.set_free_count(fc);
        self.slabs[slab] = meta;
        self.live_blocks -= 1;

        if fc == 1 {
            self.available.set(slab);
        }
        if fc == self.blocks_per_slab {
            // Decommit is deferred to trim to keep syscalls off the free path.
            self.empty.set(slab);
        }
    }

    #[cfg(debug_assertions)]
    fn free_list_contains(&self, slab: usize, meta: SlabMeta, block: u16) -> bool {
        let mut cur = meta.free_head();
        let mut steps = 0u16;
        while cur != BIN_SENTINEL && steps < self.blocks_per_slab {
            if cur == block {
                return true;
            }
            // Safety: free-list entries are blocks of a committed slab.
            cur = unsafe { self.block_ptr(slab, cur).cast::<u16>().read() };
            steps += 1;
        }
        false
    }

    /// Decommit every fully empty slab. Returns the number of bytes released.
    /// Stops at the first decommit failure; the slab stays usable.
    pub fn trim(&mut self, vm: &dyn VirtualMemory, reservation: &VirtualMemoryBlock) -> usize {
        let mut released = 0;
        while let Some(slab) = self.empty.find_first() {
            let offset = self.reservation_offset + slab * self.slab_size;
            // Safety: the slab holds no live blocks.
            if unsafe { vm.decommit(reservation, offset, self.slab_size) }.is_err() {
                break;
            }
            self.empty.clear(slab);
            self.available.clear(slab);
            self.committed.set(slab, false);
            self.slabs[slab] = SlabMeta::UNUSED;
            self.committed_bytes -= self.slab_size;
            stats::on_decommit(&stats::SMALL_POOL_COMMITTED, self.slab_size);
            released += self.slab_size;

            if slab + 1 == self.high_water {
                self.high_water -= 1;
                while self.high_water > 0 && self.released.contains(self.high_water - 1) {
                    self.high_water -= 1;
                    self.released.clear(self.high_water);
                }
            } else {
                self.released.set(slab);
            }
        }
        released
    }

    /// Walk every committed slab, checking canaries, counts and free lists.
    ///
    /// Runs under the pool lock, so the error carries no heap data.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), PoolFault> {
        let pool = self.pool_index;
        let mut live = 0usize;
        for slab in self.committed.ones() {
            let meta = self.slabs[slab];
            if meta.canary() != SLAB_CANARY {
                return Err(PoolFault::SlabCanary { pool, slab, canary: meta.canary() });
            }
            let bump = meta.bump_cursor();
            let free = meta.free_count();
            if bump > self.blocks_per_slab || free > self.blocks_per_slab {
                return Err(PoolFault::CountsOutOfRange { pool, slab, bump, free });
            }

            let untouched = self.blocks_per_slab - bump;
            let mut listed = 0u16;
            let mut cur = meta.free_head();
            while cur != BIN_SENTINEL {
                if cur >= bump || listed > bump {
                    return Err(PoolFault::FreeListOverrun { pool, slab, block: cur });
                }
                let ptr = self.block_ptr(slab, cur);
                // Safety: free-list entries are blocks of a committed slab.
                let (next, canary) = unsafe { (ptr.cast::<u16>().read(), ptr.add(4).cast::<u32>().read()) };
                if canary != FREE_CANARY {
                    return Err(PoolFault::FreeBlockCanary { pool, slab, block: cur, canary });
                }
                listed += 1;
                cur = next;
            }
            if listed + untouched != free {
                return Err(PoolFault::FreeCountMismatch { pool, slab, free, listed, untouched });
            }
            if (free > 0) != self.available.contains(slab) || (free == self.blocks_per_slab) != self.empty.contains(slab) {
                return Err(PoolFault::TrackingBits { pool, slab, free });
            }
            live += usize::from(self.blocks_per_slab - free);
        }
        if live != self.live_blocks {
            return Err(PoolFault::LiveCount { pool, found: live, recorded: self.live_blocks });
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            block_size: self.block_size,
            committed_slabs: self.committed.count_ones(..),
            empty_slabs: self.empty.count(),
            live_blocks: self.live_blocks,
            recycled_bundles: 0,
        }
    }

    /// Forget committed bytes when the backing reservation goes away.
    pub(crate) fn release_accounting(&mut self) {
        stats::on_decommit(&stats::SMALL_POOL_COMMITTED, self.committed_bytes);
        self.committed_bytes = 0;
    }
}
