use super::config::ArenaParams;
use super::error::AllocError;
use super::malloc::Malloc;
use super::pool_map::{PoolLookup, ShiftLookup};
use super::size_class::SizeClassTable;
use super::stats;
use super::vm::{VirtualMemory, VirtualMemoryBlock};
use crate::sync::rc::Arc;
use fixedbitset::FixedBitSet;
use crate::sync::{Mutex, lock};
use std::fmt;
use std::ptr::NonNull;

/// Heap-side stand-in for a free block of memory the CPU may not write.
pub struct FreeBlockProxy {
    block: NonNull<u8>,
    next: Option<Box<FreeBlockProxy>>,
}

impl FreeBlockProxy {
    #[inline]
    pub fn block(&self) -> NonNull<u8> {
        self.block
    }
}

struct ProxyPool {
    block_size: usize,
    base: usize,
    capacity: usize,
    /// Blocks below this were handed out at least once.
    bump: usize,
    free: Option<Box<FreeBlockProxy>>,
    free_count: usize,
    live: usize,
    /// One bit per block below `bump`, set while the block is handed out.
    /// Grown outside the lock, see [`ProxyPool::install_map`].
    live_map: FixedBitSet,
}

// Safety: the pool only records addresses; it never dereferences them.
unsafe impl Send for ProxyPool {}

enum Taken {
    Block(NonNull<u8>, Option<Box<FreeBlockProxy>>),
    /// The live map must cover this many blocks before the next bump.
    GrowMap(usize),
    Exhausted,
}

impl ProxyPool {
    const MIN_MAP_BITS: usize = 64;

    fn take(&mut self) -> Taken {
        if let Some(mut node) = self.free.take() {
            self.free = node.next.take();
            self.free_count -= 1;
            self.live += 1;
            let idx = (node.block.as_ptr() as usize - self.base) / self.block_size;
            self.live_map.insert(idx);
            return Taken::Block(node.block, Some(node));
        }
        if self.bump == self.capacity {
            return Taken::Exhausted;
        }
        if self.bump == self.live_map.len() {
            let bits = (self.bump * 2).max(Self::MIN_MAP_BITS).min(self.capacity);
            return Taken::GrowMap(bits);
        }
        let addr = self.base + self.bump * self.block_size;
        self.live_map.insert(self.bump);
        self.bump += 1;
        self.live += 1;
        match NonNull::new(addr as *mut u8) {
            Some(p) => Taken::Block(p, None),
            None => Taken::Exhausted,
        }
    }

    /// Swap in `map` if it is larger than the current one, carrying the live
    /// bits over. Returns whichever set the caller must drop after unlocking.
    fn install_map(&mut self, mut map: FixedBitSet) -> FixedBitSet {
        if map.len() <= self.live_map.len() {
            return map;
        }
        map.union_with(&self.live_map);
        std::mem::replace(&mut self.live_map, map)
    }

    /// Index of the block `addr` starts, if it is currently handed out.
    fn live_index(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        if !offset.is_multiple_of(self.block_size) {
            return None;
        }
        let idx = offset / self.block_size;
        (idx < self.bump && self.live_map.contains(idx)).then_some(idx)
    }

    /// Return a handed-out block. The node comes back if `node.block` is not
    /// a live block start (interior pointer, never handed out, or already
    /// freed).
    fn put(&mut self, mut node: Box<FreeBlockProxy>) -> Result<(), Box<FreeBlockProxy>> {
        let Some(idx) = self.live_index(node.block.as_ptr() as usize) else {
            return Err(node);
        };
        self.live_map.set(idx, false);
        node.next = self.free.take();
        self.free = Some(node);
        self.free_count += 1;
        self.live -= 1;
        Ok(())
    }

    fn check(&self, pool_index: usize) -> Result<(), String> {
        let mut listed = 0;
        let mut cur = self.free.as_deref();
        while let Some(node) = cur {
            let addr = node.block.as_ptr() as usize;
            let offset = addr.wrapping_sub(self.base);
            if offset >= self.bump * self.block_size || !offset.is_multiple_of(self.block_size) {
                return Err(format!("proxy pool {pool_index}: stray free block {addr:#x}"));
            }
            if self.live_map.contains(offset / self.block_size) {
                return Err(format!("proxy pool {pool_index}: block {addr:#x} both free and live"));
            }
            listed += 1;
            cur = node.next.as_deref();
        }
        if listed != self.free_count || self.free_count + self.live != self.bump {
            return Err(format!(
                "proxy pool {pool_index}: {listed} listed, {} free, {} live, {} handed out",
                self.free_count, self.live, self.bump
            ));
        }
        let marked = self.live_map.count_ones(..);
        if marked != self.live {
            return Err(format!("proxy pool {pool_index}: {marked} blocks marked live, {} counted", self.live));
        }
        Ok(())
    }
}

impl Drop for ProxyPool {
    fn drop(&mut self) {
        // Unlink iteratively; a long chain would overflow the stack otherwise.
        let mut cur = self.free.take();
        while let Some(mut node) = cur {
            cur = node.next.take();
        }
    }
}

/// Binned allocator for memory the CPU must not touch, such as a GPU heap
/// mapped into the address space.
///
/// The managed reservation is protected no-access; free lists live in
/// heap-allocated [`FreeBlockProxy`] nodes. Only the size-class range is
/// served, and `realloc` is refused because moving would need a CPU copy.
pub struct BlockProxyAllocator {
    vm: Arc<dyn VirtualMemory>,
    table: SizeClassTable,
    reservation: Option<VirtualMemoryBlock>,
    lookup: ShiftLookup,
    pools: Box<[Mutex<ProxyPool>]>,
}

impl BlockProxyAllocator {
    /// Reserve `params.pool_reserved_size` bytes per size class on `vm`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for invalid parameters, out of memory if the
    /// reservation fails.
    pub fn new(vm: Arc<dyn VirtualMemory>, mut params: ArenaParams) -> Result<Self, AllocError> {
        params.resolve(&*vm);
        params.validate()?;
        let table = SizeClassTable::new(&params)?;
        let stride = params.pool_reserved_size;
        let total = stride
            .checked_mul(table.len())
            .ok_or_else(|| AllocError::exhausted(stride, 0))?;
        let reservation = vm.reserve(total, 0).map_err(|e| AllocError::oom(total, 0, e))?;
        stats::on_reserve(reservation.reserved_size());
        // Safety: the range is our own fresh reservation.
        let protected = unsafe { vm.protect(reservation.base(), reservation.reserved_size(), false, false) };
        let base = reservation.base_addr();

        let pools = table
            .block_sizes()
            .iter()
            .enumerate()
            .map(|(idx, &block_size)| {
                Mutex::new(ProxyPool {
                    block_size,
                    base: base + idx * stride,
                    capacity: stride / block_size,
                    bump: 0,
                    free: None,
                    free_count: 0,
                    live: 0,
                    live_map: FixedBitSet::new(),
                })
            })
            .collect();
        tracing::debug!(pools = table.len(), protected, "block proxy allocator ready");

        Ok(Self {
            lookup: ShiftLookup::new(base, stride, table.len()),
            vm,
            table,
            reservation: Some(reservation),
            pools,
        })
    }

    /// Blocks handed out and not yet freed.
    pub fn live_blocks(&self) -> usize {
        self.pools.iter().map(|p| lock(p).live).sum()
    }
}

impl Malloc for BlockProxyAllocator {
    fn name(&self) -> &'static str {
        "block-proxy"
    }

    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(align));
        }
        let pool_index = self
            .table
            .pool_for(size, align.max(self.table.min_alignment()))
            .ok_or_else(|| AllocError::exhausted(size, align))?;
        let pool = &self.pools[pool_index];
        loop {
            let taken = lock(pool).take();
            // Spent nodes and replaced maps are dropped here, after unlocking.
            match taken {
                Taken::Block(ptr, _node) => return Ok(ptr),
                Taken::Exhausted => return Err(AllocError::exhausted(size, align)),
                Taken::GrowMap(bits) => {
                    let map = FixedBitSet::with_capacity(bits);
                    let _old = lock(pool).install_map(map);
                }
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let addr = ptr.as_ptr() as usize;
        let pool_index = self.lookup.pool_index(addr).ok_or(AllocError::UnknownPointer(addr))?;
        let node = Box::new(FreeBlockProxy { block: ptr, next: None });
        let result = lock(&self.pools[pool_index]).put(node);
        // A rejected node is dropped after unlocking.
        result.map_err(|_node| AllocError::UnknownPointer(addr))
    }

    unsafe fn realloc(
        &self,
        _ptr: Option<NonNull<u8>>,
        _new_size: usize,
        _align: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        Err(AllocError::ReallocUnsupported("BlockProxyAllocator"))
    }

    fn get_allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.lookup
            .pool_index(ptr.as_ptr() as usize)
            .map(|idx| self.table.block_size(idx))
    }

    fn quantize_size(&self, count: usize, align: usize) -> usize {
        let Some(align) = align.max(self.table.min_alignment()).checked_next_power_of_two() else {
            return count;
        };
        self.table.quantize(count, align).unwrap_or(count)
    }

    fn validate_heap(&self) -> bool {
        let mut ok = true;
        for (idx, pool) in self.pools.iter().enumerate() {
            let result = lock(pool).check(idx);
            if let Err(msg) = result {
                tracing::error!(%msg, "heap validation failed");
                ok = false;
            }
        }
        ok
    }

    fn dump_allocator_stats(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "BlockProxyAllocator: {} size classes", self.table.len())?;
        writeln!(out, "{:>8} {:>10} {:>10}", "block", "live", "free")?;
        for pool in &self.pools {
            let (block, live, free) = {
                let p = lock(pool);
                (p.block_size, p.live, p.free_count)
            };
            if live + free > 0 {
                writeln!(out, "{block:>8} {live:>10} {free:>10}")?;
            }
        }
        Ok(())
    }
}

impl Drop for BlockProxyAllocator {
    fn drop(&mut self) {
        if let Some(res) = self.reservation.take() {
            let size = res.reserved_size();
            // Safety: the allocator is going away with its address range.
            match unsafe { self.vm.free(res) } {
                Ok(()) => stats::on_release(size),
                Err(e) => tracing::warn!(error = %e, "failed to release proxy reservation"),
            }
        }
    }
}
