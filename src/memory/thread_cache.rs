use super::binned::AllocatorCore;
use super::config::ArenaParams;
use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::sync::rc::Arc;
use std::cell::{Cell, UnsafeCell};
use std::ptr::{self, NonNull};

const FREE_BLOCK_CANARY: u16 = 0xE3A7;

/// Node written into the first 16 bytes of a block parked in a thread cache
/// or in the global recycler.
///
/// The allocator owns a block's bytes between `free` and the `allocate` that
/// hands it out again, so the link lives inside the block itself.
#[repr(C)]
pub(crate) struct FreeBlock {
    next: *mut FreeBlock,
    /// Number of blocks in the bundle this node heads. Written when the
    /// bundle leaves its thread; meaningless on other nodes.
    bundle_count: u32,
    pool_index: u16,
    canary: u16,
}

const _: () = assert!(std::mem::size_of::<FreeBlock>() == 16);

impl FreeBlock {
    /// # Safety
    /// `ptr` must be an exclusively owned block of at least 16 bytes,
    /// aligned to 8.
    #[inline]
    unsafe fn write(ptr: NonNull<u8>, next: *mut FreeBlock, pool_index: u16) -> *mut FreeBlock {
        let node = ptr.as_ptr().cast::<FreeBlock>();
        // Safety: guaranteed by the caller.
        unsafe {
            node.write(FreeBlock {
                next,
                bundle_count: 0,
                pool_index,
                canary: FREE_BLOCK_CANARY,
            });
        }
        node
    }

    /// Verify the node. Panics on corruption.
    #[inline]
    fn check(&self, pool_index: u16) {
        assert!(
            self.canary == FREE_BLOCK_CANARY && self.pool_index == pool_index,
            "BinnedAllocator corruption: cached block {:p} has canary 0x{:04x} / pool {}, expected 0x{FREE_BLOCK_CANARY:04x} / pool {pool_index}",
            self,
            self.canary,
            self.pool_index,
        );
    }
}

/// Walk the chain starting at `head`, handing every block to `f`.
/// The link is read before `f` runs, so `f` may overwrite the block.
///
/// # Safety
/// The chain must be exclusively owned and built by this module.
pub(crate) unsafe fn for_each_block(head: NonNull<FreeBlock>, pool_index: u16, mut f: impl FnMut(NonNull<u8>)) {
    let mut node = head.as_ptr();
    while let Some(cur) = NonNull::new(node) {
        // Safety: chain nodes are owned blocks.
        let block = unsafe { cur.as_ref() };
        block.check(pool_index);
        node = block.next;
        f(cur.cast());
    }
}

/// A singly linked run of free blocks moved as one unit.
#[derive(Clone, Copy)]
pub(crate) struct Bundle {
    head: *mut FreeBlock,
    count: u32,
}

impl Bundle {
    const EMPTY: Self = Self {
        head: ptr::null_mut(),
        count: 0,
    };

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// # Safety
    /// See [`FreeBlock::write`].
    #[inline]
    unsafe fn push(&mut self, ptr: NonNull<u8>, pool_index: u16) {
        // Safety: forwarded contract.
        self.head = unsafe { FreeBlock::write(ptr, self.head, pool_index) };
        self.count += 1;
    }

    /// # Safety
    /// The bundle must be built by this module and exclusively owned.
    #[inline]
    unsafe fn pop(&mut self, pool_index: u16) -> Option<NonNull<u8>> {
        let head = NonNull::new(self.head)?;
        // Safety: the head is an owned node.
        let node = unsafe { head.as_ref() };
        node.check(pool_index);
        self.head = node.next;
        self.count -= 1;
        Some(head.cast())
    }

    #[inline]
    fn take(&mut self) -> Self {
        std::mem::replace(self, Self::EMPTY)
    }

    /// Record the count in the head and hand the chain out.
    ///
    /// # Safety
    /// The bundle must be built by this module and exclusively owned.
    unsafe fn seal(self) -> Option<NonNull<FreeBlock>> {
        let head = NonNull::new(self.head)?;
        // Safety: the head is an owned node.
        unsafe { (*head.as_ptr()).bundle_count = self.count };
        Some(head)
    }

    /// Adopt a sealed chain.
    ///
    /// # Safety
    /// `head` must come from [`seal`](Self::seal) and be exclusively owned.
    unsafe fn unseal(head: NonNull<FreeBlock>, pool_index: u16) -> Self {
        // Safety: forwarded contract.
        let node = unsafe { head.as_ref() };
        node.check(pool_index);
        Self {
            head: head.as_ptr(),
            count: node.bundle_count,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct BundleCaps {
    pub max_blocks: u32,
    pub max_bytes: usize,
}

impl BundleCaps {
    pub fn from_params(params: &ArenaParams) -> Self {
        Self {
            max_blocks: u32::try_from(params.max_blocks_per_bundle).unwrap_or(u32::MAX),
            max_bytes: params.max_size_per_bundle,
        }
    }

    #[inline]
    fn is_full(&self, bundle: &Bundle, block_size: usize) -> bool {
        bundle.count > 0
            && (bundle.count >= self.max_blocks || (bundle.count as usize + 1) * block_size > self.max_bytes)
    }

    /// Blocks handed to a thread per slab refill.
    pub fn refill_count(&self, block_size: usize) -> usize {
        let by_bytes = self.max_bytes / block_size / 4;
        let by_count = self.max_blocks as usize / 4;
        by_bytes.min(by_count).clamp(1, 16)
    }
}

/// Partial + full bundle of one size class.
pub(crate) struct FreeBlockList {
    partial: Bundle,
    full: Bundle,
}

impl FreeBlockList {
    const EMPTY: Self = Self {
        partial: Bundle::EMPTY,
        full: Bundle::EMPTY,
    };

    /// Pop from the partial bundle, promoting the full one when partial is
    /// empty. `None` is a miss.
    ///
    /// # Safety
    /// Owner thread only.
    pub unsafe fn malloc(&mut self, pool_index: u16) -> Option<NonNull<u8>> {
        if self.partial.is_empty() {
            if self.full.is_empty() {
                return None;
            }
            self.partial = self.full.take();
        }
        // Safety: forwarded contract.
        unsafe { self.partial.pop(pool_index) }
    }

    /// Push onto the partial bundle. A capped partial bundle becomes the
    /// full one; `false` means a full bundle is already parked and must be
    /// recycled first.
    ///
    /// # Safety
    /// Owner thread only; `ptr` must be an exclusively owned block of the pool.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, pool_index: u16, block_size: usize, caps: BundleCaps) -> bool {
        if caps.is_full(&self.partial, block_size) {
            if !self.full.is_empty() {
                return false;
            }
            self.full = self.partial.take();
        }
        // Safety: forwarded contract.
        unsafe { self.partial.push(ptr, pool_index) };
        true
    }

    pub fn recycle_full(&mut self) -> Bundle {
        self.full.take()
    }

    /// Adopt a recycled bundle as the partial one. Hands it back if the
    /// partial bundle is in use.
    pub fn obtain_recycled_partial(&mut self, bundle: Bundle) -> Result<(), Bundle> {
        if !self.partial.is_empty() {
            return Err(bundle);
        }
        self.partial = bundle;
        Ok(())
    }

    pub fn take_all(&mut self) -> [Bundle; 2] {
        [self.partial.take(), self.full.take()]
    }

    pub fn cached_blocks(&self) -> u32 {
        self.partial.count + self.full.count
    }
}

/// Free lists of one thread, one per size class.
///
/// The lists are touched only by the owning thread (through the
/// thread-local slot below); other threads read `cached_bytes` and raise
/// `flush_requested`.
pub(crate) struct PerThreadFreeLists {
    lists: UnsafeCell<Box<[FreeBlockList]>>,
    block_sizes: Box<[usize]>,
    caps: BundleCaps,
    flush_requested: AtomicBool,
    cached_bytes: AtomicUsize,
}

// Safety: cross-thread access is limited to the atomics; the lists are only
// reached through `&mut`-style methods whose contract is owner-thread-only.
unsafe impl Send for PerThreadFreeLists {}
// Safety: see above.
unsafe impl Sync for PerThreadFreeLists {}

impl PerThreadFreeLists {
    pub fn new(block_sizes: &[usize], params: &ArenaParams) -> Self {
        Self {
            lists: UnsafeCell::new((0..block_sizes.len()).map(|_| FreeBlockList::EMPTY).collect()),
            block_sizes: block_sizes.into(),
            caps: BundleCaps::from_params(params),
            flush_requested: AtomicBool::new(false),
            cached_bytes: AtomicUsize::new(0),
        }
    }

    /// # Safety
    /// Owner thread only, and no other reference from this method may be live.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    unsafe fn list(&self, pool_index: usize) -> &mut FreeBlockList {
        // Safety: guaranteed by the caller.
        unsafe { &mut (*self.lists.get())[pool_index] }
    }

    #[inline]
    fn add_cached(&self, bytes: usize) {
        let cur = self.cached_bytes.load(Ordering::Relaxed);
        self.cached_bytes.store(cur + bytes, Ordering::Relaxed);
    }

    #[inline]
    fn sub_cached(&self, bytes: usize) {
        let cur = self.cached_bytes.load(Ordering::Relaxed);
        self.cached_bytes.store(cur.saturating_sub(bytes), Ordering::Relaxed);
    }

    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes.load(Ordering::Relaxed)
    }

    pub fn caps(&self) -> BundleCaps {
        self.caps
    }

    /// # Safety
    /// Owner thread only.
    pub unsafe fn malloc(&self, pool_index: usize) -> Option<NonNull<u8>> {
        #[allow(clippy::cast_possible_truncation)]
        // Safety: forwarded contract.
        let ptr = unsafe { self.list(pool_index).malloc(pool_index as u16)? };
        self.sub_cached(self.block_sizes[pool_index]);
        Some(ptr)
    }

    /// # Safety
    /// Owner thread only; `ptr` must be a block of `pool_index` the caller
    /// gives up.
    pub unsafe fn free(&self, pool_index: usize, ptr: NonNull<u8>) -> bool {
        let block_size = self.block_sizes[pool_index];
        #[allow(clippy::cast_possible_truncation)]
        // Safety: forwarded contract.
        let pushed = unsafe { self.list(pool_index).free(ptr, pool_index as u16, block_size, self.caps) };
        if pushed {
            self.add_cached(block_size);
        }
        pushed
    }

    /// Detach the full bundle of `pool_index`, sealed for the recycler.
    ///
    /// # Safety
    /// Owner thread only.
    pub unsafe fn recycle_full(&self, pool_index: usize) -> Option<NonNull<FreeBlock>> {
        // Safety: forwarded contract.
        let bundle = unsafe { self.list(pool_index).recycle_full() };
        self.sub_cached(bundle.count() as usize * self.block_sizes[pool_index]);
        // Safety: the bundle was detached from our own list.
        unsafe { bundle.seal() }
    }

    /// Adopt a bundle popped from the recycler. Hands it back if the
    /// partial bundle is still in use.
    ///
    /// # Safety
    /// Owner thread only; `head` must be a sealed bundle of `pool_index`
    /// now owned by the caller.
    pub unsafe fn obtain_recycled_partial(
        &self,
        pool_index: usize,
        head: NonNull<FreeBlock>,
    ) -> Result<(), NonNull<FreeBlock>> {
        #[allow(clippy::cast_possible_truncation)]
        // Safety: forwarded contract.
        let bundle = unsafe { Bundle::unseal(head, pool_index as u16) };
        // Safety: forwarded contract.
        match unsafe { self.list(pool_index).obtain_recycled_partial(bundle) } {
            Ok(()) => {
                self.add_cached(bundle.count() as usize * self.block_sizes[pool_index]);
                Ok(())
            }
            Err(_) => Err(head),
        }
    }

    /// Detach every cached bundle, sealed, as `(pool_index, head)`.
    ///
    /// # Safety
    /// Owner thread only.
    pub unsafe fn drain(&self, mut f: impl FnMut(usize, NonNull<FreeBlock>)) {
        for pool_index in 0..self.block_sizes.len() {
            // Safety: forwarded contract; the borrow ends before `f` runs.
            let bundles = unsafe { self.list(pool_index).take_all() };
            for bundle in bundles {
                self.sub_cached(bundle.count() as usize * self.block_sizes[pool_index]);
                // Safety: detached from our own list.
                if let Some(head) = unsafe { bundle.seal() } {
                    f(pool_index, head);
                }
            }
        }
    }

    /// Check every cached node of this thread.
    ///
    /// # Safety
    /// Owner thread only.
    pub unsafe fn validate(&self) -> Result<(), String> {
        for pool_index in 0..self.block_sizes.len() {
            // Safety: forwarded contract.
            let list = unsafe { self.list(pool_index) };
            for bundle in [list.partial, list.full] {
                let mut walked = 0u32;
                let mut node = bundle.head;
                while let Some(cur) = NonNull::new(node) {
                    // Safety: cached nodes are owned blocks.
                    let block = unsafe { cur.as_ref() };
                    #[allow(clippy::cast_possible_truncation)]
                    if block.canary != FREE_BLOCK_CANARY || usize::from(block.pool_index) != pool_index {
                        return Err(format!("thread cache pool {pool_index}: corrupt node {cur:p}"));
                    }
                    walked += 1;
                    if walked > bundle.count {
                        return Err(format!("thread cache pool {pool_index}: bundle longer than {}", bundle.count));
                    }
                    node = block.next;
                }
                if walked != bundle.count {
                    return Err(format!(
                        "thread cache pool {pool_index}: {walked} nodes, {} recorded",
                        bundle.count
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn request_flush(&self) {
        self.flush_requested.store(true, Ordering::Release);
    }

    fn take_flush_request(&self) -> bool {
        self.flush_requested.load(Ordering::Relaxed) && self.flush_requested.swap(false, Ordering::Acquire)
    }
}

// ----------------------------------------------------------------------------
// Thread-local attachment
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CacheState {
    Detached,
    /// Building the lists; allocations made meanwhile bypass the cache.
    Attaching,
    Attached,
    /// Lists borrowed by an outer frame; nested calls bypass the cache.
    Busy,
    Disabled,
}

struct Attachment {
    core: Arc<AllocatorCore>,
    lists: Arc<PerThreadFreeLists>,
}

/// Per-thread slot owning the attachment to one allocator.
///
/// # Safety
///
/// `attachment` is only touched by the owning thread, and only while `state`
/// is `Attaching` or `Busy`, which turns every nested entry away.
struct ThreadCacheSlot {
    state: Cell<CacheState>,
    attachment: UnsafeCell<Option<Attachment>>,
}

impl ThreadCacheSlot {
    fn enter<R>(&self, core: &Arc<AllocatorCore>, f: impl FnOnce(&PerThreadFreeLists) -> R) -> Option<R> {
        match self.state.get() {
            CacheState::Attached => {}
            CacheState::Detached if core.per_thread_caches() => self.attach(core),
            _ => return None,
        }

        self.state.set(CacheState::Busy);
        // Safety: state is Busy; see the struct-level comment.
        let result = match unsafe { &*self.attachment.get() } {
            Some(att) if Arc::ptr_eq(&att.core, core) => {
                if att.lists.take_flush_request() {
                    core.flush_thread_lists(&att.lists);
                }
                Some(f(&att.lists))
            }
            _ => None,
        };
        self.state.set(CacheState::Attached);
        result
    }

    fn attach(&self, core: &Arc<AllocatorCore>) {
        self.state.set(CacheState::Attaching);
        let lists = Arc::new(PerThreadFreeLists::new(core.block_sizes(), core.params()));
        core.register_lists(&lists);
        let att = Attachment {
            core: Arc::clone(core),
            lists,
        };
        // Safety: state is Attaching.
        unsafe { *self.attachment.get() = Some(att) };
        self.state.set(CacheState::Attached);
    }

    /// Return everything cached to the attached allocator and forget it.
    fn detach(&self, next_state: CacheState) {
        self.state.set(CacheState::Busy);
        // Safety: state is Busy.
        let att = unsafe { (*self.attachment.get()).take() };
        if let Some(att) = att {
            att.core.detach_lists(&att.lists);
            // Dropping may free the lists (and the allocator); nested frees
            // bypass the cache while the state is still Busy.
            drop(att);
        }
        self.state.set(next_state);
    }

    fn is_attached_to(&self, core: &Arc<AllocatorCore>) -> bool {
        if self.state.get() != CacheState::Attached {
            return false;
        }
        // Safety: state is Attached and we are on the owning thread.
        matches!(unsafe { &*self.attachment.get() }, Some(att) if Arc::ptr_eq(&att.core, core))
    }
}

impl Drop for ThreadCacheSlot {
    fn drop(&mut self) {
        // Return cached blocks on thread exit so they are not stranded.
        self.detach(CacheState::Disabled);
    }
}

#[cfg(not(loom))]
thread_local! {
    static THREAD_CACHE: ThreadCacheSlot = const {
        ThreadCacheSlot {
            state: Cell::new(CacheState::Detached),
            attachment: UnsafeCell::new(None),
        }
    };
}

/// Run `f` on this thread's lists for `core`, attaching on first use.
/// `None` when caching is unavailable: disabled, attached to another
/// allocator, re-entered, or during thread teardown.
#[inline]
pub(crate) fn with_current<R>(core: &Arc<AllocatorCore>, f: impl FnOnce(&PerThreadFreeLists) -> R) -> Option<R> {
    #[cfg(not(loom))]
    {
        THREAD_CACHE.try_with(|slot| slot.enter(core, f)).ok().flatten()
    }
    // loom threads share one OS thread; its TLS cannot model them.
    #[cfg(loom)]
    {
        let _ = (core, f);
        None
    }
}

/// Attach this thread to `core`, flushing any other attachment first and
/// lifting a previous disable.
pub(crate) fn setup_current(core: &Arc<AllocatorCore>) {
    #[cfg(not(loom))]
    let _ = THREAD_CACHE.try_with(|slot| match slot.state.get() {
        CacheState::Busy | CacheState::Attaching => {}
        _ if slot.is_attached_to(core) => {}
        _ => {
            slot.detach(CacheState::Detached);
            if core.per_thread_caches() {
                slot.attach(core);
            }
        }
    });
    #[cfg(loom)]
    let _ = core;
}

/// Flush and detach this thread, and keep caching off until
/// [`setup_current`] runs again.
pub(crate) fn clear_and_disable_current() {
    #[cfg(not(loom))]
    let _ = THREAD_CACHE.try_with(|slot| match slot.state.get() {
        CacheState::Busy | CacheState::Attaching => {}
        _ => slot.detach(CacheState::Disabled),
    });
}

/// Flush and detach this thread if it is attached to `core`. The next
/// allocation attaches again.
pub(crate) fn detach_current(core: &Arc<AllocatorCore>) {
    #[cfg(not(loom))]
    let _ = THREAD_CACHE.try_with(|slot| {
        if slot.is_attached_to(core) {
            slot.detach(CacheState::Detached);
        }
    });
    #[cfg(loom)]
    let _ = core;
}

/// Flush this thread's lists for `core` now, if attached.
pub(crate) fn flush_current(core: &Arc<AllocatorCore>) {
    let _ = with_current_if_attached(core, |lists| core.flush_thread_lists(lists));
}

/// Like [`with_current`] but never attaches.
pub(crate) fn with_current_if_attached<R>(
    core: &Arc<AllocatorCore>,
    f: impl FnOnce(&PerThreadFreeLists) -> R,
) -> Option<R> {
    #[cfg(not(loom))]
    {
        THREAD_CACHE
            .try_with(|slot| {
                if slot.is_attached_to(core) {
                    slot.enter(core, f)
                } else {
                    None
                }
            })
            .ok()
            .flatten()
    }
    #[cfg(loom)]
    {
        let _ = (core, f);
        None
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    /// 16-byte aligned scratch blocks standing in for pool memory.
    #[repr(C, align(16))]
    struct Block([u8; 64]);

    fn blocks(n: usize) -> Vec<Block> {
        (0..n).map(|_| Block([0; 64])).collect()
    }

    fn ptr_of(b: &mut Block) -> NonNull<u8> {
        NonNull::from(&mut b.0).cast()
    }

    const CAPS: BundleCaps = BundleCaps {
        max_blocks: 4,
        max_bytes: 1 << 20,
    };

    #[test]
    fn test_free_block_list_lifo() {
        let mut storage = blocks(3);
        let ptrs: Vec<_> = storage.iter_mut().map(ptr_of).collect();
        let mut list = FreeBlockList::EMPTY;
        // Safety: Test code.
        unsafe {
            assert!(list.malloc(0).is_none());
            for p in &ptrs {
                assert!(list.free(*p, 0, 64, CAPS));
            }
            assert_eq!(list.malloc(0), Some(ptrs[2]));
            assert_eq!(list.malloc(0), Some(ptrs[1]));
            assert_eq!(list.malloc(0), Some(ptrs[0]));
            assert!(list.malloc(0).is_none());
        }
    }

    #[test]
    fn test_partial_rolls_into_full_then_declines() {
        let mut storage = blocks(9);
        let ptrs: Vec<_> = storage.iter_mut().map(ptr_of).collect();
        let mut list = FreeBlockList::EMPTY;
        // Safety: Test code.
        unsafe {
            for p in &ptrs[..8] {
                assert!(list.free(*p, 3, 64, CAPS));
            }
            assert_eq!(list.full.count(), 4);
            assert_eq!(list.partial.count(), 4);
            assert!(!list.free(ptrs[8], 3, 64, CAPS), "both bundles capped");

            let full = list.recycle_full();
            assert_eq!(full.count(), 4);
            assert!(list.free(ptrs[8], 3, 64, CAPS));
            assert_eq!((list.full.count(), list.partial.count()), (4, 1));
        }
    }

    #[test]
    fn test_byte_cap_limits_bundle() {
        let caps = BundleCaps {
            max_blocks: 64,
            max_bytes: 128,
        };
        let mut storage = blocks(3);
        let ptrs: Vec<_> = storage.iter_mut().map(ptr_of).collect();
        let mut list = FreeBlockList::EMPTY;
        // Safety: Test code.
        unsafe {
            assert!(list.free(ptrs[0], 0, 64, caps));
            assert!(list.free(ptrs[1], 0, 64, caps));
            assert!(list.free(ptrs[2], 0, 64, caps));
        }
        assert_eq!(list.full.count(), 2);
        assert_eq!(list.partial.count(), 1);
    }

    #[test]
    fn test_oversized_block_still_caches_one() {
        let caps = BundleCaps {
            max_blocks: 64,
            max_bytes: 32,
        };
        let mut storage = blocks(1);
        let p = ptr_of(&mut storage[0]);
        let mut list = FreeBlockList::EMPTY;
        // Safety: Test code.
        unsafe {
            assert!(list.free(p, 0, 64, caps));
            assert_eq!(list.malloc(0), Some(p));
        }
    }

    #[test]
    fn test_malloc_promotes_full() {
        let mut storage = blocks(5);
        let ptrs: Vec<_> = storage.iter_mut().map(ptr_of).collect();
        let mut list = FreeBlockList::EMPTY;
        // Safety: Test code.
        unsafe {
            for p in &ptrs {
                list.free(*p, 0, 64, CAPS);
            }
            // partial holds ptrs[4]; full holds ptrs[0..4].
            assert_eq!(list.malloc(0), Some(ptrs[4]));
            assert_eq!(list.malloc(0), Some(ptrs[3]));
            assert_eq!(list.cached_blocks(), 3);
        }
    }

    #[test]
    fn test_seal_unseal_keeps_count() {
        let mut storage = blocks(3);
        let ptrs: Vec<_> = storage.iter_mut().map(ptr_of).collect();
        let mut bundle = Bundle::EMPTY;
        // Safety: Test code.
        unsafe {
            for p in &ptrs {
                bundle.push(*p, 7);
            }
            let head = bundle.seal().unwrap();
            let back = Bundle::unseal(head, 7);
            assert_eq!(back.count(), 3);
            let mut seen = Vec::new();
            for_each_block(head, 7, |b| seen.push(b));
            assert_eq!(seen, vec![ptrs[2], ptrs[1], ptrs[0]]);
        }
    }

    #[test]
    #[should_panic(expected = "corruption")]
    fn test_pop_detects_scribbled_node() {
        let mut storage = blocks(1);
        let p = ptr_of(&mut storage[0]);
        let mut bundle = Bundle::EMPTY;
        // Safety: Test code.
        unsafe {
            bundle.push(p, 1);
            p.as_ptr().add(14).write(0);
            let _ = bundle.pop(1);
        }
    }

    #[test]
    #[should_panic(expected = "corruption")]
    fn test_pop_detects_wrong_pool() {
        let mut storage = blocks(1);
        let p = ptr_of(&mut storage[0]);
        let mut bundle = Bundle::EMPTY;
        // Safety: Test code.
        unsafe {
            bundle.push(p, 1);
            let _ = bundle.pop(2);
        }
    }

    #[test]
    fn test_per_thread_lists_accounting() {
        let params = ArenaParams {
            max_blocks_per_bundle: 2,
            ..ArenaParams::default()
        };
        let lists = PerThreadFreeLists::new(&[16, 64], &params);
        let mut storage = blocks(5);
        let ptrs: Vec<_> = storage.iter_mut().map(ptr_of).collect();
        // Safety: Test code.
        unsafe {
            for p in &ptrs[..4] {
                assert!(lists.free(1, *p));
            }
            assert_eq!(lists.cached_bytes(), 4 * 64);
            assert!(!lists.free(1, ptrs[4]));

            let full = lists.recycle_full(1).unwrap();
            assert_eq!(lists.cached_bytes(), 2 * 64);
            assert!(lists.free(1, ptrs[4]));

            // Partial is busy, so a recycled bundle is handed back.
            assert_eq!(lists.obtain_recycled_partial(1, full), Err(full));
            lists.validate().unwrap();

            let mut drained = 0;
            lists.drain(|pool, head| {
                assert_eq!(pool, 1);
                for_each_block(head, 1, |_| drained += 1);
            });
            assert_eq!(drained, 3);
            assert_eq!(lists.cached_bytes(), 0);

            assert!(lists.obtain_recycled_partial(1, full).is_ok());
            assert_eq!(lists.cached_bytes(), 2 * 64);
            assert!(lists.malloc(1).is_some());
            assert!(lists.malloc(1).is_some());
            assert!(lists.malloc(1).is_none());
            assert!(lists.malloc(0).is_none());
        }
    }

    #[test]
    fn test_flush_request_is_one_shot() {
        let lists = PerThreadFreeLists::new(&[16], &ArenaParams::default());
        assert!(!lists.take_flush_request());
        lists.request_flush();
        assert!(lists.take_flush_request());
        assert!(!lists.take_flush_request());
    }

    #[test]
    fn test_refill_count_bounds() {
        let caps = BundleCaps {
            max_blocks: 64,
            max_bytes: 8192,
        };
        assert_eq!(caps.refill_count(16), 16);
        assert_eq!(caps.refill_count(512), 4);
        assert_eq!(caps.refill_count(65536), 1);
    }
}
