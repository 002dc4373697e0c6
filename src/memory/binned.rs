use super::config::ArenaParams;
use super::error::AllocError;
use super::os_alloc::{self, OsAllocator, OsMapping};
use super::pool::Pool;
use super::pool_map::{PoolLookup, PoolRegion, select_lookup};
use super::recycler::GlobalRecycler;
use super::size_class::SizeClassTable;
use super::stats::{self, AllocatorStats};
use super::thread_cache::{self, FreeBlock, PerThreadFreeLists};
use super::vm::{PlatformVm, VirtualMemory, VirtualMemoryBlock, VmError};
use crate::sync::rc::{Arc, Weak};
use crate::sync::{Mutex, lock};
use std::fmt;
use std::ptr::NonNull;

/// State shared by a [`BinnedAllocator`] and every thread cache attached to
/// it. Thread caches hold a strong reference, so blocks parked in them stay
/// valid until the owning thread lets go.
pub(crate) struct AllocatorCore {
    vm: Arc<dyn VirtualMemory>,
    params: ArenaParams,
    table: SizeClassTable,
    /// One shared reservation, or one per pool.
    reservations: Box<[VirtualMemoryBlock]>,
    pools: Box<[Mutex<Pool>]>,
    lookup: Box<dyn PoolLookup>,
    recycler: GlobalRecycler,
    os: Mutex<OsAllocator>,
    /// Lists of every attached thread. The vector never reallocates while
    /// the lock is held.
    registry: Mutex<Vec<Weak<PerThreadFreeLists>>>,
}

impl AllocatorCore {
    fn new(vm: Arc<dyn VirtualMemory>, mut params: ArenaParams) -> Result<Self, AllocError> {
        params.resolve(&*vm);
        params.validate()?;
        let table = SizeClassTable::new(&params)?;
        let count = table.len();
        let stride = params.pool_reserved_size;

        let reservations = Self::reserve_pools(&*vm, &params, count)?;
        let mut regions = Vec::with_capacity(count);
        let mut pools = Vec::with_capacity(count);
        for idx in 0..count {
            let (res, offset) = if reservations.len() == 1 {
                (&reservations[0], idx * stride)
            } else {
                (&reservations[idx], 0)
            };
            // Safety: `offset` lies inside the reservation (stride * count bytes).
            let base = unsafe { NonNull::new_unchecked(res.base().as_ptr().add(offset)) };
            regions.push(PoolRegion {
                base: base.as_ptr() as usize,
                size: stride,
            });
            #[allow(clippy::cast_possible_truncation)]
            let pool = Pool::new(idx as u16, table.block_size(idx), base, offset, &params);
            match pool {
                Ok(pool) => pools.push(Mutex::new(pool)),
                Err(e) => {
                    Self::release_reservations(&*vm, reservations);
                    return Err(e.into());
                }
            }
        }
        let lookup = select_lookup(&regions);

        tracing::debug!(
            pools = count,
            max_small = table.max_size(),
            slab_size = params.slab_size,
            lookup = lookup.strategy(),
            thread_caches = params.per_thread_caches,
            "binned allocator ready"
        );

        Ok(Self {
            recycler: GlobalRecycler::new(count, params.max_global_bundles),
            vm,
            table,
            reservations,
            pools: pools.into_boxed_slice(),
            lookup,
            os: Mutex::new(OsAllocator::new()),
            registry: Mutex::new(Vec::new()),
            params,
        })
    }

    fn reserve_pools(
        vm: &dyn VirtualMemory,
        params: &ArenaParams,
        count: usize,
    ) -> Result<Box<[VirtualMemoryBlock]>, AllocError> {
        let stride = params.pool_reserved_size;
        let (n, size) = if params.use_separate_vm_per_pool {
            (count, stride)
        } else {
            (1, stride.checked_mul(count).ok_or_else(|| AllocError::exhausted(stride, 0))?)
        };

        let mut out: Vec<VirtualMemoryBlock> = Vec::with_capacity(n);
        for _ in 0..n {
            let res = match vm.reserve(size, 0) {
                Ok(res) => res,
                Err(e) => {
                    Self::release_reservations(vm, out.into_boxed_slice());
                    return Err(AllocError::oom(size, 0, e));
                }
            };
            stats::on_reserve(res.reserved_size());
            let past_limit = res
                .base_addr()
                .checked_add(res.reserved_size())
                .is_none_or(|end| end > params.address_limit);
            out.push(res);
            if past_limit {
                Self::release_reservations(vm, out.into_boxed_slice());
                return Err(VmError::InitializationFailed(format!(
                    "pool reservation ends above address_limit {:#x}",
                    params.address_limit
                ))
                .into());
            }
        }
        Ok(out.into_boxed_slice())
    }

    fn release_reservations(vm: &dyn VirtualMemory, reservations: Box<[VirtualMemoryBlock]>) {
        for res in reservations {
            let size = res.reserved_size();
            // Safety: the allocator is going away; nothing points into its pools.
            match unsafe { vm.free(res) } {
                Ok(()) => stats::on_release(size),
                Err(e) => tracing::warn!(error = %e, "failed to release pool reservation"),
            }
        }
    }

    #[inline]
    fn reservation(&self, pool_index: usize) -> &VirtualMemoryBlock {
        if self.reservations.len() == 1 {
            &self.reservations[0]
        } else {
            &self.reservations[pool_index]
        }
    }

    #[inline]
    pub(crate) fn params(&self) -> &ArenaParams {
        &self.params
    }

    #[inline]
    pub(crate) fn per_thread_caches(&self) -> bool {
        self.params.per_thread_caches
    }

    #[inline]
    pub(crate) fn block_sizes(&self) -> &[usize] {
        self.table.block_sizes()
    }

    #[inline]
    fn pool_of(&self, addr: usize) -> Option<usize> {
        if addr >= self.params.address_limit {
            return None;
        }
        self.lookup.pool_index(addr)
    }

    // ------------------------------------------------------------------
    // Slab layer
    // ------------------------------------------------------------------

    fn alloc_from_slab(&self, pool_index: usize) -> Result<NonNull<u8>, AllocError> {
        let block_size = self.table.block_size(pool_index);
        lock(&self.pools[pool_index])
            .alloc(&*self.vm, self.reservation(pool_index))
            .map_err(|e| AllocError::oom(block_size, self.table.min_alignment(), e))
    }

    fn free_to_slab(&self, pool_index: usize, ptr: NonNull<u8>) {
        lock(&self.pools[pool_index]).free(ptr);
    }

    /// Return every block of a sealed bundle to its slabs.
    fn free_bundle_to_slabs(&self, pool_index: usize, head: NonNull<FreeBlock>) {
        let mut pool = lock(&self.pools[pool_index]);
        #[allow(clippy::cast_possible_truncation)]
        // Safety: the caller owns the bundle.
        unsafe {
            thread_cache::for_each_block(head, pool_index as u16, |block| pool.free(block));
        }
    }

    fn recycle_or_free(&self, pool_index: usize, head: NonNull<FreeBlock>) {
        if !self.recycler.push_bundle(pool_index, head) {
            self.free_bundle_to_slabs(pool_index, head);
        }
    }

    // ------------------------------------------------------------------
    // Thread cache layer
    // ------------------------------------------------------------------

    /// Cache hit, then a recycled bundle, then a batch carved from the slab.
    fn alloc_cached(&self, lists: &PerThreadFreeLists, pool_index: usize) -> Result<NonNull<u8>, AllocError> {
        // Safety (all blocks below): `lists` belongs to the calling thread.
        if let Some(ptr) = unsafe { lists.malloc(pool_index) } {
            return Ok(ptr);
        }
        if let Some(head) = self.recycler.pop_bundle(pool_index) {
            match unsafe { lists.obtain_recycled_partial(pool_index, head) } {
                Ok(()) => {
                    if let Some(ptr) = unsafe { lists.malloc(pool_index) } {
                        return Ok(ptr);
                    }
                }
                Err(head) => self.free_bundle_to_slabs(pool_index, head),
            }
        }

        let block_size = self.table.block_size(pool_index);
        let refill = lists.caps().refill_count(block_size);
        let mut pool = lock(&self.pools[pool_index]);
        let res = self.reservation(pool_index);
        let first = pool
            .alloc(&*self.vm, res)
            .map_err(|e| AllocError::oom(block_size, self.table.min_alignment(), e))?;
        for _ in 1..refill {
            let Ok(extra) = pool.alloc(&*self.vm, res) else { break };
            if !unsafe { lists.free(pool_index, extra) } {
                pool.free(extra);
                break;
            }
        }
        Ok(first)
    }

    fn free_cached(&self, lists: &PerThreadFreeLists, pool_index: usize, ptr: NonNull<u8>) {
        // Safety (all blocks below): `lists` belongs to the calling thread and
        // the caller gives up `ptr`.
        if unsafe { lists.free(pool_index, ptr) } {
            return;
        }
        if let Some(head) = unsafe { lists.recycle_full(pool_index) } {
            self.recycle_or_free(pool_index, head);
        }
        if !unsafe { lists.free(pool_index, ptr) } {
            self.free_to_slab(pool_index, ptr);
        }
    }

    /// Hand everything `lists` caches to the recycler, or to the slabs when
    /// the recycler is full.
    pub(crate) fn flush_thread_lists(&self, lists: &PerThreadFreeLists) {
        // Safety: called by the owning thread (through its slot) or while
        // the slot detaches.
        unsafe { lists.drain(|pool_index, head| self.recycle_or_free(pool_index, head)) };
    }

    pub(crate) fn register_lists(&self, lists: &Arc<PerThreadFreeLists>) {
        let mut entry = Some(Arc::downgrade(lists));
        let mut spare: Option<Vec<Weak<PerThreadFreeLists>>> = None;
        let mut retired = None;
        while let Some(weak) = entry.take() {
            let mut registry = lock(&self.registry);
            if registry.len() < registry.capacity() {
                registry.push(weak);
            } else if let Some(mut bigger) = spare.take().filter(|v| v.capacity() > registry.len()) {
                bigger.append(&mut registry);
                bigger.push(weak);
                retired = Some(std::mem::replace(&mut *registry, bigger));
            } else {
                let want = (registry.capacity() * 2).max(8);
                drop(registry);
                spare = Some(Vec::with_capacity(want));
                entry = Some(weak);
            }
        }
        drop(retired);
        drop(spare);
    }

    /// Flush `lists` and drop it from the registry.
    pub(crate) fn detach_lists(&self, lists: &Arc<PerThreadFreeLists>) {
        self.flush_thread_lists(lists);
        let removed = {
            let mut registry = lock(&self.registry);
            let pos = registry.iter().position(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(lists)));
            pos.map(|i| registry.swap_remove(i))
        };
        drop(removed);
    }

    // ------------------------------------------------------------------
    // OS path
    // ------------------------------------------------------------------

    fn alloc_os(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let mapping = OsMapping::map(&*self.vm, size, align, self.params.address_limit)?;
        let registered = lock(&self.os).register(&*self.vm, mapping);
        match registered {
            Ok(ptr) => Ok(ptr),
            Err((mapping, e)) => {
                // Safety: the mapping was never published.
                let _ = unsafe { mapping.unmap(&*self.vm) };
                Err(AllocError::oom(size, align, e))
            }
        }
    }

    fn free_os(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let mapping = lock(&self.os).unregister(ptr)?;
        // Safety: the caller gives up `ptr`.
        unsafe { mapping.unmap(&*self.vm) }.map_err(AllocError::from)
    }
}

impl Drop for AllocatorCore {
    fn drop(&mut self) {
        for pool in &self.pools {
            lock(pool).release_accounting();
        }
        // Safety: the last handle is gone; no OS allocation is reachable.
        unsafe { lock(&self.os).release(&*self.vm) };
        let reservations = std::mem::take(&mut self.reservations);
        Self::release_reservations(&*self.vm, reservations);
    }
}

/// Size-class binned allocator.
///
/// Requests up to [`max_small_size`](Self::max_small_size) are served from
/// per-size-class slabs through per-thread caches and a lock-free global
/// recycler; larger (or over-aligned) requests are mapped straight from the
/// VM provider.
pub struct BinnedAllocator {
    core: Arc<AllocatorCore>,
}

impl BinnedAllocator {
    /// Create an allocator over the operating system's virtual memory with
    /// default parameters.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` if reservation fails or the configuration is invalid.
    pub fn new() -> Result<Self, AllocError> {
        Self::with_vm(Arc::new(PlatformVm), ArenaParams::default())
    }

    /// Create an allocator over `vm`. Zero page, granularity and slab sizes
    /// in `params` are detected from `vm`.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` for invalid parameters and an
    /// out-of-memory error if the pool reservation fails.
    pub fn with_vm(vm: Arc<dyn VirtualMemory>, params: ArenaParams) -> Result<Self, AllocError> {
        Ok(Self {
            core: Arc::new(AllocatorCore::new(vm, params)?),
        })
    }

    /// Resolved parameters.
    pub fn params(&self) -> &ArenaParams {
        &self.core.params
    }

    pub fn size_classes(&self) -> &SizeClassTable {
        &self.core.table
    }

    /// Small/large threshold.
    pub fn max_small_size(&self) -> usize {
        self.core.table.max_size()
    }

    /// Name of the address-to-pool strategy in use.
    pub fn lookup_strategy(&self) -> &'static str {
        self.core.lookup.strategy()
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// `InvalidAlignment` if `align` is not a power of two; an out-of-memory
    /// error if neither the pools nor the OS can provide memory.
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(align));
        }
        let core = &self.core;
        let align = align.max(core.table.min_alignment());
        let Some(pool_index) = core.table.pool_for(size, align) else {
            return core.alloc_os(size, align);
        };
        if let Some(result) = thread_cache::with_current(core, |lists| core.alloc_cached(lists, pool_index)) {
            return result;
        }
        core.alloc_from_slab(pool_index)
    }

    /// Release `ptr`.
    ///
    /// # Errors
    ///
    /// `UnknownPointer` if `ptr` was not handed out by this allocator,
    /// `CorruptDescriptor` if a large allocation's trailer was overwritten.
    ///
    /// # Panics
    ///
    /// Panics on detected heap corruption inside the pools.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used afterwards, and must not be freed twice.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let core = &self.core;
        match core.pool_of(ptr.as_ptr() as usize) {
            Some(pool_index) => {
                if thread_cache::with_current(core, |lists| core.free_cached(lists, pool_index, ptr)).is_none() {
                    core.free_to_slab(pool_index, ptr);
                }
                Ok(())
            }
            None => core.free_os(ptr),
        }
    }

    /// Resize `ptr` to `new_size` bytes.
    ///
    /// `None` allocates; a zero `new_size` frees and returns `None`. The
    /// pointer is kept when the new size falls in the same size class, or
    /// fits the existing mapping of a large allocation.
    ///
    /// # Errors
    ///
    /// As [`allocate`](Self::allocate) and [`free`](Self::free).
    ///
    /// # Safety
    ///
    /// `ptr` must be live and owned by this allocator. On success the old
    /// pointer must not be used unless it is returned.
    pub unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(old) = ptr else {
            return self.allocate(new_size, align).map(Some);
        };
        if new_size == 0 {
            // Safety: forwarded contract.
            unsafe { self.free(old)? };
            return Ok(None);
        }
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(align));
        }

        let core = &self.core;
        let effective = align.max(core.table.min_alignment());
        let addr = old.as_ptr() as usize;
        let new_class = core.table.pool_for(new_size, effective);
        let old_size = match core.pool_of(addr) {
            Some(pool_index) => {
                if new_class == Some(pool_index) {
                    return Ok(Some(old));
                }
                core.table.block_size(pool_index)
            }
            None => {
                if new_class.is_none() && addr.is_multiple_of(effective) && lock(&core.os).resize_in_place(old, new_size)? {
                    return Ok(Some(old));
                }
                lock(&core.os).allocation_size(old).ok_or(AllocError::UnknownPointer(addr))?
            }
        };

        let new = self.allocate(new_size, align)?;
        // Safety: both blocks are live and distinct; the copy stays inside both.
        unsafe { std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size)) };
        // Safety: forwarded contract.
        unsafe { self.free(old)? };
        Ok(Some(new))
    }

    /// Usable bytes behind `ptr`, or `None` if it is not a live allocation of
    /// this allocator. Exact for large allocations; the size class for small
    /// ones.
    pub fn get_allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        match self.core.pool_of(ptr.as_ptr() as usize) {
            Some(pool_index) => Some(self.core.table.block_size(pool_index)),
            None => lock(&self.core.os).allocation_size(ptr),
        }
    }

    /// Bytes a request for `count` bytes aligned to `align` would receive.
    /// Lock-free, and idempotent: `quantize_size(quantize_size(n)) ==
    /// quantize_size(n)`.
    pub fn quantize_size(&self, count: usize, align: usize) -> usize {
        let table = &self.core.table;
        let Some(align) = align.max(table.min_alignment()).checked_next_power_of_two() else {
            return count;
        };
        table
            .quantize(count, align)
            .or_else(|| os_alloc::quantize(count, self.core.vm.allocation_granularity()))
            .unwrap_or(count)
    }

    /// `true` if `ptr` is a live large allocation served by the OS path.
    pub fn is_os_allocation(&self, ptr: NonNull<u8>) -> bool {
        self.core.pool_of(ptr.as_ptr() as usize).is_none() && lock(&self.core.os).contains(ptr)
    }

    /// `true` if `ptr` lies in this allocator's pools or is one of its live
    /// large allocations.
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.core.pool_of(ptr.as_ptr() as usize).is_some() || lock(&self.core.os).contains(ptr)
    }

    /// Return cached blocks to the slabs and decommit every empty slab.
    /// With `trim_thread_caches`, every attached thread is asked to flush
    /// (the calling thread at once, others on their next call). Returns the
    /// number of bytes decommitted.
    pub fn trim(&self, trim_thread_caches: bool) -> usize {
        let core = &self.core;
        if trim_thread_caches {
            {
                let registry = lock(&core.registry);
                for lists in registry.iter().filter_map(Weak::upgrade) {
                    lists.request_flush();
                }
            }
            thread_cache::flush_current(core);
        }

        for pool_index in 0..core.pools.len() {
            while let Some(head) = core.recycler.pop_bundle(pool_index) {
                core.free_bundle_to_slabs(pool_index, head);
            }
        }
        let mut released = 0;
        for (pool_index, pool) in core.pools.iter().enumerate() {
            released += lock(pool).trim(&*core.vm, core.reservation(pool_index));
        }
        tracing::debug!(released, trim_thread_caches, "binned allocator trimmed");
        released
    }

    /// Attach the calling thread's cache to this allocator now, flushing any
    /// other attachment and lifting an earlier
    /// [`clear_and_disable_tls_caches_on_current_thread`](Self::clear_and_disable_tls_caches_on_current_thread).
    pub fn setup_tls_caches_on_current_thread(&self) {
        thread_cache::setup_current(&self.core);
    }

    /// Flush the calling thread's cache and bypass caching on this thread
    /// until [`setup_tls_caches_on_current_thread`](Self::setup_tls_caches_on_current_thread).
    pub fn clear_and_disable_tls_caches_on_current_thread(&self) {
        thread_cache::clear_and_disable_current();
    }

    /// Walk pools, large allocations and the calling thread's cache checking
    /// canaries and counts. Diagnostic only.
    pub fn validate_heap(&self) -> bool {
        let core = &self.core;
        let mut ok = true;
        for pool in &core.pools {
            let result = lock(pool).validate();
            if let Err(fault) = result {
                tracing::error!(%fault, "heap validation failed");
                ok = false;
            }
        }
        let result = lock(&core.os).validate();
        if let Err(e) = result {
            tracing::error!(error = %e, "heap validation failed");
            ok = false;
        }
        // Safety: the closure runs on the owning thread.
        if let Some(Err(msg)) = thread_cache::with_current_if_attached(core, |lists| unsafe { lists.validate() }) {
            tracing::error!(%msg, "heap validation failed");
            ok = false;
        }
        ok
    }

    /// Snapshot of this instance.
    pub fn stats(&self) -> AllocatorStats {
        let core = &self.core;
        let mut pools = Vec::with_capacity(core.pools.len());
        for (pool_index, pool) in core.pools.iter().enumerate() {
            let mut s = lock(pool).stats();
            s.recycled_bundles = core.recycler.bundle_count(pool_index);
            pools.push(s);
        }
        let (os_allocations, os_allocated_bytes, os_mapped_bytes) = {
            let os = lock(&core.os);
            (os.count(), os.allocated_bytes(), os.mapped_bytes())
        };
        let (registered_thread_caches, thread_cached_bytes) = {
            let registry = lock(&core.registry);
            let cached = registry.iter().filter_map(Weak::upgrade).map(|l| l.cached_bytes()).sum();
            (registry.len(), cached)
        };
        AllocatorStats {
            pools,
            os_allocations,
            os_allocated_bytes,
            os_mapped_bytes,
            registered_thread_caches,
            thread_cached_bytes,
        }
    }

    /// Write a human-readable statistics table.
    ///
    /// # Errors
    ///
    /// Propagates errors from `out`.
    pub fn dump_allocator_stats(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "BinnedAllocator: {} size classes up to {} bytes, {} lookup",
            self.core.table.len(),
            self.max_small_size(),
            self.lookup_strategy()
        )?;
        writeln!(out, "{}", self.stats())
    }

    #[cfg(test)]
    pub(crate) fn pool_slab_range(&self, pool_index: usize, slab: usize) -> Option<std::ops::Range<usize>> {
        let pool = lock(&self.core.pools[pool_index]);
        pool.is_slab_committed(slab).then(|| pool.slab_range(slab))
    }

    #[cfg(test)]
    pub(crate) fn pool_index_of(&self, addr: usize) -> Option<usize> {
        self.core.pool_of(addr)
    }
}

impl Drop for BinnedAllocator {
    fn drop(&mut self) {
        thread_cache::detach_current(&self.core);
    }
}

impl fmt::Debug for BinnedAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinnedAllocator")
            .field("size_classes", &self.core.table.len())
            .field("max_small_size", &self.max_small_size())
            .field("lookup", &self.lookup_strategy())
            .field("vm", &self.core.vm)
            .finish_non_exhaustive()
    }
}
