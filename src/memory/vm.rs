use crate::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::GlobalAlloc as _;
use std::fmt;
use std::io;
use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] io::Error),
    #[error("VM decommit failed: {0}")]
    DecommitFailed(#[source] io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] io::Error),
    #[error("VM initialization failed: {0}")]
    InitializationFailed(String),
    #[error(
        "range {offset:#x}+{size:#x} is not a {align:#x}-aligned sub-range of a {reserved:#x}-byte reservation"
    )]
    InvalidRange {
        offset: usize,
        size: usize,
        align: usize,
        reserved: usize,
    },
}

/// One OS-level address space reservation.
///
/// The base is aligned to at least the provider's virtual-size alignment and
/// the size is a multiple of it. A block is consumed by
/// [`VirtualMemory::free`], so it can be released at most once.
pub struct VirtualMemoryBlock {
    base: NonNull<u8>,
    reserved: usize,
    alignment: usize,
}

// Safety: the block is a plain address range; access to the memory behind it
// is synchronized by whoever owns the block.
unsafe impl Send for VirtualMemoryBlock {}
// Safety: see above, `&VirtualMemoryBlock` only exposes addresses.
unsafe impl Sync for VirtualMemoryBlock {}

impl VirtualMemoryBlock {
    /// Wrap a reservation produced by a [`VirtualMemory`] implementation.
    ///
    /// # Safety
    /// `base..base+reserved` must be a live reservation obtained with the
    /// given `alignment`, owned by nobody else.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, reserved: usize, alignment: usize) -> Self {
        Self {
            base,
            reserved,
            alignment,
        }
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn reserved_size(&self) -> usize {
        self.reserved
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_addr() && addr - self.base_addr() < self.reserved
    }

    /// Resolve `offset..offset+size` to a pointer, checking the commit
    /// contract: both ends aligned to `align` and inside the reservation.
    pub fn sub_range(&self, offset: usize, size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        let in_bounds = offset
            .checked_add(size)
            .is_some_and(|end| end <= self.reserved);
        if !in_bounds || !offset.is_multiple_of(align) || !size.is_multiple_of(align) {
            return Err(VmError::InvalidRange {
                offset,
                size,
                align,
                reserved: self.reserved,
            });
        }
        // Safety: offset is within the reservation (checked above).
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }
}

impl fmt::Debug for VirtualMemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualMemoryBlock({:p}, {:#x})", self.base, self.reserved)
    }
}

/// Abstract interface for virtual memory operations.
///
/// Reservation failures, and commit/decommit failures, are out-of-memory
/// conditions for the allocator. `protect` is a capability probe and only
/// reports success.
pub trait VirtualMemory: Send + Sync + fmt::Debug {
    /// OS page size (default/minimum).
    fn page_size(&self) -> usize;

    /// Granularity of commit/decommit calls.
    fn allocation_granularity(&self) -> usize {
        self.page_size()
    }

    /// Reservation sizes are rounded up to this.
    fn virtual_size_alignment(&self) -> usize {
        self.allocation_granularity()
    }

    /// Reserve address space without committing physical pages.
    /// `size` is rounded up to [`virtual_size_alignment`](Self::virtual_size_alignment)
    /// and the base is aligned to `max(alignment, virtual_size_alignment)`.
    fn reserve(&self, size: usize, alignment: usize) -> Result<VirtualMemoryBlock, VmError>;

    /// Back `offset..offset+size` of `block` with physical pages.
    ///
    /// # Safety
    /// `block` must be a live reservation of this provider.
    unsafe fn commit(&self, block: &VirtualMemoryBlock, offset: usize, size: usize) -> Result<(), VmError>;

    /// Return physical pages of `offset..offset+size`, keeping the range reserved.
    ///
    /// # Safety
    /// Nothing may access the range until it is committed again.
    unsafe fn decommit(&self, block: &VirtualMemoryBlock, offset: usize, size: usize) -> Result<(), VmError>;

    /// Release the whole reservation.
    ///
    /// # Safety
    /// No pointer into `block` may be used afterwards.
    unsafe fn free(&self, block: VirtualMemoryBlock) -> Result<(), VmError>;

    /// Change page protection. Returns `false` if unsupported or refused.
    ///
    /// # Safety
    /// The range must be part of a reservation of this provider; revoking
    /// access to memory still in use is undefined behavior for its users.
    unsafe fn protect(&self, ptr: NonNull<u8>, size: usize, can_read: bool, can_write: bool) -> bool;
}

/// Round `size` up to the provider's reservation alignment.
#[inline]
pub(crate) fn round_reservation(vm: &dyn VirtualMemory, size: usize) -> Option<usize> {
    let align = vm.virtual_size_alignment();
    size.checked_next_multiple_of(align)
}

/// Virtual memory straight from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformVm;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVm, VirtualMemory, VirtualMemoryBlock, VmError, round_reservation};
    use std::io;

    impl PlatformVm {
        unsafe fn map_none(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }
            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned null")))
        }
    }

    impl VirtualMemory for PlatformVm {
        fn page_size(&self) -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }

        fn reserve(&self, size: usize, alignment: usize) -> Result<VirtualMemoryBlock, VmError> {
            let page = self.page_size();
            let size = round_reservation(self, size).ok_or_else(|| {
                VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "reservation size overflows",
                ))
            })?;
            if size == 0 {
                return Err(VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size reservation",
                )));
            }
            let alignment = alignment.max(self.virtual_size_alignment());
            if !alignment.is_power_of_two() {
                return Err(VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("reservation alignment {alignment:#x} is not a power of two"),
                )));
            }

            if alignment <= page {
                // Safety: size is non-zero and page-rounded.
                let ptr = unsafe { Self::map_none(size)? };
                // Safety: fresh mapping owned by the new block.
                return Ok(unsafe { VirtualMemoryBlock::from_raw_parts(ptr, size, alignment) });
            }

            // Over-reserve, then unmap the misaligned head and the unused tail.
            let padded = size.checked_add(alignment - page).ok_or_else(|| {
                VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "aligned reservation size overflows",
                ))
            })?;
            // Safety: padded is non-zero and page-rounded.
            let raw = unsafe { Self::map_none(padded)? };
            let raw_addr = raw.as_ptr() as usize;
            let aligned_addr = raw_addr.next_multiple_of(alignment);
            let head = aligned_addr - raw_addr;
            let tail = padded - head - size;
            // Safety: head and tail lie inside the mapping we just created.
            unsafe {
                if head > 0 {
                    libc::munmap(raw.as_ptr().cast::<libc::c_void>(), head);
                }
                if tail > 0 {
                    libc::munmap((aligned_addr + size) as *mut libc::c_void, tail);
                }
            }
            // Safety: aligned_addr is inside the mapping, hence non-null.
            let ptr = unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) };
            // Safety: the remaining mapping is exactly aligned_addr..+size.
            Ok(unsafe { VirtualMemoryBlock::from_raw_parts(ptr, size, alignment) })
        }

        unsafe fn commit(&self, block: &VirtualMemoryBlock, offset: usize, size: usize) -> Result<(), VmError> {
            let ptr = block.sub_range(offset, size, self.allocation_granularity())?;
            // Safety: FFI call to mprotect on a range of our reservation.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            // Safety: FFI call to madvise.
            unsafe {
                // Slabs are committed when they are about to be carved up,
                // so ask for immediate physical backing.
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED);
            }

            // NOTE: no zero-fill here. Callers that need deterministic
            // contents zero at the allocator level, under their own lock.
            Ok(())
        }

        unsafe fn decommit(&self, block: &VirtualMemoryBlock, offset: usize, size: usize) -> Result<(), VmError> {
            let ptr = block.sub_range(offset, size, self.allocation_granularity())?;
            // MADV_FREE marks pages for lazy reclamation; mprotect(PROT_NONE)
            // removes access until the next commit.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) } != 0 {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) } != 0 {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn free(&self, block: VirtualMemoryBlock) -> Result<(), VmError> {
            // Safety: FFI call to munmap on the whole reservation.
            if unsafe { libc::munmap(block.base().as_ptr().cast::<libc::c_void>(), block.reserved_size()) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn protect(&self, ptr: NonNull<u8>, size: usize, can_read: bool, can_write: bool) -> bool {
            let mut prot = libc::PROT_NONE;
            if can_read {
                prot |= libc::PROT_READ;
            }
            if can_write {
                prot |= libc::PROT_WRITE;
            }
            // Safety: FFI call to mprotect; the caller vouches for the range.
            unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, prot) == 0 }
        }
    }
}

#[cfg(all(windows, not(any(loom, miri))))]
mod windows {
    use super::{NonNull, PlatformVm, VirtualMemory, VirtualMemoryBlock, VmError, round_reservation};
    use std::ffi::c_void;
    use std::io;

    const MEM_COMMIT: u32 = 0x1000;
    const MEM_RESERVE: u32 = 0x2000;
    const MEM_DECOMMIT: u32 = 0x4000;
    const MEM_RELEASE: u32 = 0x8000;
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READONLY: u32 = 0x02;
    const PAGE_READWRITE: u32 = 0x04;

    /// Attempts at an aligned reservation before giving up; another thread
    /// may take the freed range between the probe and the retry.
    const ALIGNED_RESERVE_ATTEMPTS: usize = 8;

    #[repr(C)]
    struct SystemInfo {
        processor_architecture: u16,
        reserved: u16,
        page_size: u32,
        minimum_application_address: *mut c_void,
        maximum_application_address: *mut c_void,
        active_processor_mask: usize,
        number_of_processors: u32,
        processor_type: u32,
        allocation_granularity: u32,
        processor_level: u16,
        processor_revision: u16,
    }

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn VirtualAlloc(address: *mut c_void, size: usize, allocation_type: u32, protect: u32) -> *mut c_void;
        fn VirtualFree(address: *mut c_void, size: usize, free_type: u32) -> i32;
        fn VirtualProtect(address: *mut c_void, size: usize, new_protect: u32, old_protect: *mut u32) -> i32;
        fn GetSystemInfo(info: *mut SystemInfo);
    }

    /// `(page size, allocation granularity)`, queried once.
    fn system_sizes() -> (usize, usize) {
        use crate::sync::OnceLock;
        static CACHED: OnceLock<(usize, usize)> = OnceLock::new();
        *CACHED.get_or_init(|| {
            // Safety: SYSTEM_INFO is plain data; GetSystemInfo fills it in.
            let info = unsafe {
                let mut info = std::mem::zeroed::<SystemInfo>();
                GetSystemInfo(&raw mut info);
                info
            };
            (info.page_size as usize, info.allocation_granularity as usize)
        })
    }

    impl PlatformVm {
        /// # Safety
        /// `address` must be null or a range no live reservation covers.
        unsafe fn reserve_at(address: usize, size: usize) -> Option<NonNull<u8>> {
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe { VirtualAlloc(address as *mut c_void, size, MEM_RESERVE, PAGE_NOACCESS) };
            NonNull::new(ptr.cast::<u8>())
        }

        /// # Safety
        /// `ptr` must be the base of a reservation made by `reserve_at`.
        unsafe fn release(ptr: NonNull<u8>) -> Result<(), VmError> {
            // MEM_RELEASE takes the reservation base and a size of zero.
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), 0, MEM_RELEASE) } == 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }
    }

    impl VirtualMemory for PlatformVm {
        fn page_size(&self) -> usize {
            system_sizes().0
        }

        fn virtual_size_alignment(&self) -> usize {
            system_sizes().1
        }

        fn reserve(&self, size: usize, alignment: usize) -> Result<VirtualMemoryBlock, VmError> {
            let size = round_reservation(self, size).ok_or_else(|| {
                VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "reservation size overflows",
                ))
            })?;
            if size == 0 {
                return Err(VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size reservation",
                )));
            }
            let granularity = self.virtual_size_alignment();
            let alignment = alignment.max(granularity);
            if !alignment.is_power_of_two() {
                return Err(VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("reservation alignment {alignment:#x} is not a power of two"),
                )));
            }

            if alignment == granularity {
                // Safety: a fresh reservation anywhere.
                let ptr = unsafe { Self::reserve_at(0, size) }
                    .ok_or_else(|| VmError::ReservationFailed(io::Error::last_os_error()))?;
                // Safety: fresh reservation owned by the new block.
                return Ok(unsafe { VirtualMemoryBlock::from_raw_parts(ptr, size, alignment) });
            }

            // A reservation cannot be partially released, so find an aligned
            // hole with an oversized probe, drop it and reserve inside it.
            let padded = size.checked_add(alignment - granularity).ok_or_else(|| {
                VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "aligned reservation size overflows",
                ))
            })?;
            for _ in 0..ALIGNED_RESERVE_ATTEMPTS {
                // Safety: a fresh reservation anywhere.
                let probe = unsafe { Self::reserve_at(0, padded) }
                    .ok_or_else(|| VmError::ReservationFailed(io::Error::last_os_error()))?;
                let aligned_addr = (probe.as_ptr() as usize).next_multiple_of(alignment);
                // Safety: the probe is ours and unused.
                unsafe { Self::release(probe)? };
                // Safety: the range was free a moment ago; a lost race shows
                // up as a null result.
                if let Some(ptr) = unsafe { Self::reserve_at(aligned_addr, size) } {
                    // Safety: fresh reservation owned by the new block.
                    return Ok(unsafe { VirtualMemoryBlock::from_raw_parts(ptr, size, alignment) });
                }
            }
            Err(VmError::ReservationFailed(io::Error::other(format!(
                "no {alignment:#x}-aligned hole of {size:#x} bytes after {ALIGNED_RESERVE_ATTEMPTS} attempts"
            ))))
        }

        unsafe fn commit(&self, block: &VirtualMemoryBlock, offset: usize, size: usize) -> Result<(), VmError> {
            let ptr = block.sub_range(offset, size, self.allocation_granularity())?;
            // Safety: FFI call to VirtualAlloc on a range of our reservation.
            let result = unsafe { VirtualAlloc(ptr.as_ptr().cast::<c_void>(), size, MEM_COMMIT, PAGE_READWRITE) };
            if result.is_null() {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(&self, block: &VirtualMemoryBlock, offset: usize, size: usize) -> Result<(), VmError> {
            let ptr = block.sub_range(offset, size, self.allocation_granularity())?;
            // Safety: FFI call to VirtualFree on a range of our reservation.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), size, MEM_DECOMMIT) } == 0 {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn free(&self, block: VirtualMemoryBlock) -> Result<(), VmError> {
            // Safety: the block is a whole reservation of this provider.
            unsafe { Self::release(block.base()) }
        }

        unsafe fn protect(&self, ptr: NonNull<u8>, size: usize, can_read: bool, can_write: bool) -> bool {
            let prot = match (can_read, can_write) {
                (_, true) => PAGE_READWRITE,
                (true, false) => PAGE_READONLY,
                (false, false) => PAGE_NOACCESS,
            };
            let mut old = 0u32;
            // Safety: FFI call to VirtualProtect; the caller vouches for the
            // range. Reserved-only pages are refused, which reports `false`.
            unsafe { VirtualProtect(ptr.as_ptr().cast::<c_void>(), size, prot, &raw mut old) != 0 }
        }
    }
}

#[cfg(any(loom, miri, not(any(unix, windows))))]
impl VirtualMemory for PlatformVm {
    fn page_size(&self) -> usize {
        HeapVm::PAGE_SIZE
    }

    fn reserve(&self, size: usize, alignment: usize) -> Result<VirtualMemoryBlock, VmError> {
        heap_reserve(self, size, alignment)
    }

    unsafe fn commit(&self, block: &VirtualMemoryBlock, offset: usize, size: usize) -> Result<(), VmError> {
        block.sub_range(offset, size, self.allocation_granularity()).map(drop)
    }

    unsafe fn decommit(&self, block: &VirtualMemoryBlock, offset: usize, size: usize) -> Result<(), VmError> {
        block.sub_range(offset, size, self.allocation_granularity()).map(drop)
    }

    unsafe fn free(&self, block: VirtualMemoryBlock) -> Result<(), VmError> {
        // Safety: forwarded contract.
        unsafe { heap_free(block) }
    }

    unsafe fn protect(&self, _ptr: NonNull<u8>, _size: usize, _can_read: bool, _can_write: bool) -> bool {
        false
    }
}

fn heap_reserve(vm: &dyn VirtualMemory, size: usize, alignment: usize) -> Result<VirtualMemoryBlock, VmError> {
    let size = round_reservation(vm, size).unwrap_or(0);
    if size == 0 {
        return Err(VmError::ReservationFailed(io::Error::new(
            io::ErrorKind::InvalidInput,
            "zero-size reservation",
        )));
    }
    let alignment = alignment.max(vm.virtual_size_alignment());
    let layout = std::alloc::Layout::from_size_align(size, alignment)
        .map_err(|e| VmError::ReservationFailed(io::Error::other(e)))?;
    // Safety: layout has non-zero size.
    let ptr = unsafe { std::alloc::System.alloc_zeroed(layout) };
    let base = NonNull::new(ptr).ok_or_else(|| {
        VmError::ReservationFailed(io::Error::new(io::ErrorKind::OutOfMemory, "alloc returned null"))
    })?;
    // Safety: fresh heap block owned by the new reservation.
    Ok(unsafe { VirtualMemoryBlock::from_raw_parts(base, size, alignment) })
}

/// # Safety
/// `block` must come from [`heap_reserve`].
unsafe fn heap_free(block: VirtualMemoryBlock) -> Result<(), VmError> {
    let layout = std::alloc::Layout::from_size_align(block.reserved_size(), block.alignment())
        .map_err(|e| VmError::ReleaseFailed(io::Error::other(e)))?;
    // Safety: the block was allocated with the same layout in `heap_reserve`.
    unsafe { std::alloc::System.dealloc(block.base().as_ptr(), layout) };
    Ok(())
}

// ---------------------------------------------------------------------------
// Heap-backed VirtualMemory (no real mmap)
//
// Backs every "reservation" with a zeroed heap allocation from the system
// allocator. `commit` / `decommit` only account bytes: the memory is always
// accessible once reserved. Used under loom and Miri, where real VM syscalls
// are unavailable, and by tests that need a deterministic commit budget.
// ---------------------------------------------------------------------------

/// Heap-backed provider with an optional commit budget.
pub struct HeapVm {
    commit_limit: usize,
    committed: AtomicUsize,
}

impl HeapVm {
    pub const PAGE_SIZE: usize = 4096;

    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self::with_commit_limit(usize::MAX)
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self::with_commit_limit(usize::MAX)
    }

    /// Commits beyond `limit` bytes fail with an out-of-memory error.
    #[cfg(not(loom))]
    pub const fn with_commit_limit(limit: usize) -> Self {
        Self {
            commit_limit: limit,
            committed: AtomicUsize::new(0),
        }
    }

    #[cfg(loom)]
    pub fn with_commit_limit(limit: usize) -> Self {
        Self {
            commit_limit: limit,
            committed: AtomicUsize::new(0),
        }
    }

    /// Bytes currently committed through this provider.
    pub fn committed_bytes(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }
}

impl Default for HeapVm {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeapVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapVm")
            .field("commit_limit", &self.commit_limit)
            .field("committed", &self.committed_bytes())
            .finish()
    }
}

impl VirtualMemory for HeapVm {
    fn page_size(&self) -> usize {
        Self::PAGE_SIZE
    }

    fn reserve(&self, size: usize, alignment: usize) -> Result<VirtualMemoryBlock, VmError> {
        heap_reserve(self, size, alignment)
    }

    unsafe fn commit(&self, block: &VirtualMemoryBlock, offset: usize, size: usize) -> Result<(), VmError> {
        block.sub_range(offset, size, self.allocation_granularity())?;
        let prev = self.committed.fetch_add(size, Ordering::Relaxed);
        if prev.saturating_add(size) > self.commit_limit {
            self.committed.fetch_sub(size, Ordering::Relaxed);
            return Err(VmError::CommitFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "commit budget exhausted",
            )));
        }
        Ok(())
    }

    unsafe fn decommit(&self, block: &VirtualMemoryBlock, offset: usize, size: usize) -> Result<(), VmError> {
        block.sub_range(offset, size, self.allocation_granularity())?;
        let _ = self
            .committed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_sub(size)));
        Ok(())
    }

    unsafe fn free(&self, block: VirtualMemoryBlock) -> Result<(), VmError> {
        // Safety: every HeapVm block comes from `heap_reserve`.
        unsafe { heap_free(block) }
    }

    unsafe fn protect(&self, _ptr: NonNull<u8>, _size: usize, _can_read: bool, _can_write: bool) -> bool {
        false
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let vm = PlatformVm;
        let size = vm.page_size();
        let block = vm.reserve(size, 0).expect("Reserve failed");
        // Safety: Test code.
        unsafe {
            vm.commit(&block, 0, size).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(block.base().as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            vm.decommit(&block, 0, size).expect("Decommit failed");
            vm.free(block).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        assert!(PlatformVm.reserve(0, 0).is_err(), "Reserving 0 bytes should fail");
    }

    #[test]
    fn test_reserve_rounds_to_virtual_size_alignment() {
        let vm = PlatformVm;
        let block = vm.reserve(1, 0).unwrap();
        assert_eq!(block.reserved_size(), vm.virtual_size_alignment());
        assert!(block.base_addr().is_multiple_of(vm.virtual_size_alignment()));
        // Safety: Test code.
        unsafe { vm.free(block).unwrap() };
    }

    #[test]
    fn test_reserve_aligned_beyond_page() {
        let vm = PlatformVm;
        let align = 1 << 21;
        for _ in 0..4 {
            let block = vm.reserve(vm.page_size() * 3, align).unwrap();
            assert!(
                block.base_addr().is_multiple_of(align),
                "{block:?} not aligned to {align:#x}"
            );
            // Safety: Test code.
            unsafe {
                vm.commit(&block, 0, block.reserved_size()).unwrap();
                *block.base().as_ptr() = 7;
                vm.free(block).unwrap();
            }
        }
    }

    #[test]
    fn test_commit_idempotent() {
        let vm = PlatformVm;
        let size = vm.page_size();
        let block = vm.reserve(size, 0).unwrap();
        // Safety: Test code.
        unsafe {
            vm.commit(&block, 0, size).expect("First commit failed");
            vm.commit(&block, 0, size).expect("Second commit failed (idempotency check)");
            *block.base().as_ptr() = 123;
            vm.free(block).expect("Release failed");
        }
    }

    #[test]
    fn test_decommit_then_recommit() {
        let vm = PlatformVm;
        let size = vm.page_size();
        let block = vm.reserve(size, 0).unwrap();
        // Safety: Test code.
        unsafe {
            vm.commit(&block, 0, size).unwrap();
            *block.base().as_ptr() = 42;
            vm.decommit(&block, 0, size).unwrap();
            vm.commit(&block, 0, size).unwrap();
            // Contents are undefined after decommit; only writability matters.
            *block.base().as_ptr() = 84;
            assert_eq!(*block.base().as_ptr(), 84);
            vm.free(block).unwrap();
        }
    }

    #[test]
    fn test_partial_commit() {
        let vm = PlatformVm;
        let page = vm.page_size();
        let block = vm.reserve(page * 4, 0).unwrap();
        // Safety: Test code.
        unsafe {
            vm.commit(&block, page, page * 2).expect("Partial commit failed");
            let ptr = block.base().as_ptr().add(page);
            let slice = std::slice::from_raw_parts_mut(ptr, page * 2);
            slice[0] = 10;
            slice[page * 2 - 1] = 20;
            assert_eq!(slice[0], 10);
            assert_eq!(slice[page * 2 - 1], 20);
            vm.free(block).unwrap();
        }
    }

    #[test]
    fn test_commit_rejects_misaligned_or_out_of_range() {
        let vm = PlatformVm;
        let page = vm.page_size();
        let block = vm.reserve(page * 2, 0).unwrap();
        // Safety: Test code.
        unsafe {
            assert!(matches!(
                vm.commit(&block, 1, page),
                Err(VmError::InvalidRange { .. })
            ));
            assert!(matches!(
                vm.commit(&block, 0, page + 1),
                Err(VmError::InvalidRange { .. })
            ));
            assert!(matches!(
                vm.commit(&block, page, page * 2),
                Err(VmError::InvalidRange { .. })
            ));
            assert!(matches!(
                vm.decommit(&block, usize::MAX - page + 1, page),
                Err(VmError::InvalidRange { .. })
            ));
            vm.free(block).unwrap();
        }
    }

    #[test]
    fn test_protect_toggles_access() {
        let vm = PlatformVm;
        let page = vm.page_size();
        let block = vm.reserve(page, 0).unwrap();
        // Safety: Test code.
        unsafe {
            vm.commit(&block, 0, page).unwrap();
            assert!(vm.protect(block.base(), page, true, false));
            assert_eq!(*block.base().as_ptr(), 0);
            assert!(vm.protect(block.base(), page, true, true));
            *block.base().as_ptr() = 9;
            vm.free(block).unwrap();
        }
    }

    #[cfg(windows)]
    #[test]
    fn test_windows_reserves_address_space_only() {
        let vm = PlatformVm;
        assert!(vm.virtual_size_alignment() >= vm.page_size());
        let small = vm.reserve(1, 1 << 20).unwrap();
        assert_eq!(small.reserved_size(), vm.virtual_size_alignment());
        assert!(small.base_addr().is_multiple_of(1 << 20));
        // Far more than the test machine could back with heap memory.
        let big = vm.reserve(64 << 30, 0).unwrap();
        // Safety: Test code.
        unsafe {
            vm.commit(&big, 0, vm.page_size()).unwrap();
            *big.base().as_ptr() = 3;
            vm.decommit(&big, 0, vm.page_size()).unwrap();
            vm.free(big).unwrap();
            vm.free(small).unwrap();
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVm.page_size();
        assert!(size.is_power_of_two(), "Page size {size} is not power of two");
    }

    #[test]
    fn test_reserve_very_large() {
        let vm = PlatformVm;
        let block = vm.reserve(1 << 30, 0).expect("Failed to reserve 1GB");
        // Safety: Test code.
        unsafe { vm.free(block).unwrap() };
    }

    #[test]
    fn test_multiple_reservations() {
        let vm = PlatformVm;
        let page = vm.page_size();
        let b1 = vm.reserve(page, 0).unwrap();
        let b2 = vm.reserve(page, 0).unwrap();
        assert_ne!(b1.base(), b2.base());
        // Safety: Test code.
        unsafe {
            vm.commit(&b1, 0, page).unwrap();
            vm.commit(&b2, 0, page).unwrap();
            *b1.base().as_ptr() = 1;
            *b2.base().as_ptr() = 2;
            let p2 = b2.base();
            vm.free(b1).unwrap();
            assert_eq!(*p2.as_ptr(), 2);
            vm.free(b2).unwrap();
        }
    }

    #[test]
    fn test_heap_vm_commit_budget() {
        let vm = HeapVm::with_commit_limit(2 * HeapVm::PAGE_SIZE);
        let block = vm.reserve(4 * HeapVm::PAGE_SIZE, 0).unwrap();
        // Safety: Test code.
        unsafe {
            vm.commit(&block, 0, 2 * HeapVm::PAGE_SIZE).unwrap();
            assert!(matches!(
                vm.commit(&block, 2 * HeapVm::PAGE_SIZE, HeapVm::PAGE_SIZE),
                Err(VmError::CommitFailed(_))
            ));
            assert_eq!(vm.committed_bytes(), 2 * HeapVm::PAGE_SIZE);
            vm.decommit(&block, 0, HeapVm::PAGE_SIZE).unwrap();
            vm.commit(&block, 2 * HeapVm::PAGE_SIZE, HeapVm::PAGE_SIZE).unwrap();
            assert!(!vm.protect(block.base(), HeapVm::PAGE_SIZE, false, false));
            vm.free(block).unwrap();
        }
    }

    #[test]
    fn test_heap_vm_honors_alignment() {
        let vm = HeapVm::new();
        let block = vm.reserve(HeapVm::PAGE_SIZE, 1 << 16).unwrap();
        assert!(block.base_addr().is_multiple_of(1 << 16));
        // Safety: Test code.
        unsafe { vm.free(block).unwrap() };
    }
}
