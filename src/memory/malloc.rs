use super::binned::BinnedAllocator;
use super::error::AllocError;
use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;
use std::ptr::NonNull;

/// Pointer-only allocator interface shared by every implementation variant.
///
/// Unlike [`GlobalAlloc`], `free` and `get_allocation_size` take no layout:
/// each implementation recovers the size itself.
pub trait Malloc: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// An out-of-memory error, or `InvalidAlignment`.
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError>;

    /// # Errors
    ///
    /// `UnknownPointer` or `CorruptDescriptor` for pointers this allocator
    /// does not recognize.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator and not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError>;

    /// # Errors
    ///
    /// As `allocate` and `free`; `ReallocUnsupported` for variants that
    /// cannot move their memory.
    ///
    /// # Safety
    ///
    /// As [`free`](Self::free).
    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError>;

    fn get_allocation_size(&self, ptr: NonNull<u8>) -> Option<usize>;

    fn quantize_size(&self, count: usize, align: usize) -> usize;

    fn trim(&self, _trim_thread_caches: bool) {}

    fn setup_tls_caches_on_current_thread(&self) {}

    fn clear_and_disable_tls_caches_on_current_thread(&self) {}

    fn validate_heap(&self) -> bool {
        true
    }

    /// # Errors
    ///
    /// Propagates errors from `out`.
    fn dump_allocator_stats(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "{}: no statistics", self.name())
    }
}

impl Malloc for BinnedAllocator {
    fn name(&self) -> &'static str {
        "binned"
    }

    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        BinnedAllocator::allocate(self, size, align)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        // Safety: forwarded contract.
        unsafe { BinnedAllocator::free(self, ptr) }
    }

    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        // Safety: forwarded contract.
        unsafe { BinnedAllocator::realloc(self, ptr, new_size, align) }
    }

    fn get_allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        BinnedAllocator::get_allocation_size(self, ptr)
    }

    fn quantize_size(&self, count: usize, align: usize) -> usize {
        BinnedAllocator::quantize_size(self, count, align)
    }

    fn trim(&self, trim_thread_caches: bool) {
        BinnedAllocator::trim(self, trim_thread_caches);
    }

    fn setup_tls_caches_on_current_thread(&self) {
        BinnedAllocator::setup_tls_caches_on_current_thread(self);
    }

    fn clear_and_disable_tls_caches_on_current_thread(&self) {
        BinnedAllocator::clear_and_disable_tls_caches_on_current_thread(self);
    }

    fn validate_heap(&self) -> bool {
        BinnedAllocator::validate_heap(self)
    }

    fn dump_allocator_stats(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        BinnedAllocator::dump_allocator_stats(self, out)
    }
}

/// Header stored just below every `SystemMalloc` pointer.
#[repr(C)]
struct SystemHeader {
    size: usize,
    /// Offset from the underlying allocation to the user pointer.
    offset: u32,
    align: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<SystemHeader>();
const SYSTEM_MIN_ALIGN: usize = 16;

/// The simplest variant: every call goes to the platform allocator, with a
/// small header recording the layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMalloc;

impl SystemMalloc {
    fn layout_for(size: usize, align: usize) -> Option<(Layout, usize)> {
        let align = align.max(SYSTEM_MIN_ALIGN);
        let offset = HEADER_SIZE.next_multiple_of(align);
        let layout = Layout::from_size_align(offset.checked_add(size.max(1))?, align).ok()?;
        Some((layout, offset))
    }

    /// # Safety
    /// `ptr` must come from `SystemMalloc::allocate`.
    unsafe fn header(ptr: NonNull<u8>) -> *mut SystemHeader {
        // Safety: the header sits right below the user pointer.
        unsafe { ptr.as_ptr().sub(HEADER_SIZE).cast::<SystemHeader>() }
    }
}

impl Malloc for SystemMalloc {
    fn name(&self) -> &'static str {
        "system"
    }

    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(align));
        }
        let (layout, offset) = Self::layout_for(size, align).ok_or_else(|| AllocError::exhausted(size, align))?;
        let (Ok(offset32), Ok(align32)) = (u32::try_from(offset), u32::try_from(layout.align())) else {
            return Err(AllocError::exhausted(size, align));
        };
        // Safety: non-zero layout.
        let base = NonNull::new(unsafe { System.alloc(layout) }).ok_or_else(|| AllocError::exhausted(size, align))?;
        // Safety: `offset` is inside the allocation and leaves room for the header.
        unsafe {
            let ptr = base.add(offset);
            Self::header(ptr).write(SystemHeader {
                size,
                offset: offset32,
                align: align32,
            });
            Ok(ptr)
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        // Safety: forwarded contract.
        let header = unsafe { Self::header(ptr).read() };
        let (layout, _) = Self::layout_for(header.size, header.align as usize)
            .ok_or(AllocError::UnknownPointer(ptr.as_ptr() as usize))?;
        // Safety: same layout and base as in `allocate`.
        unsafe { System.dealloc(ptr.as_ptr().sub(header.offset as usize), layout) };
        Ok(())
    }

    unsafe fn realloc(
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
        // Safety: forwarded contract.
        let old_size = unsafe { Self::header(old).read().size };
        let new = self.allocate(new_size, align)?;
        // Safety: both live, distinct, and at least this long.
        unsafe {
            std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
            self.free(old)?;
        }
        Ok(Some(new))
    }

    fn get_allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        // Safety: callers only pass pointers from this allocator.
        Some(unsafe { Self::header(ptr).read().size })
    }

    fn quantize_size(&self, count: usize, _align: usize) -> usize {
        count
    }
}
