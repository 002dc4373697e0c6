// ----------------------------------------------------------------------------
// Large allocations served straight from the VM provider
// ----------------------------------------------------------------------------

use super::error::AllocError;
use super::stats;
use super::vm::{VirtualMemory, VirtualMemoryBlock, VmError};
use std::ptr::NonNull;

const DESCRIPTOR_MAGIC: u64 = 0x0B16_A11C_8ED0_DE55;

/// Trailer written at the end of every OS mapping, just past the usable
/// bytes. Checked and cleared on free.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OsAllocationDescriptor {
    magic: u64,
    mapped_base: usize,
    mapped_size: usize,
    /// Size passed to the allocate (or in-place realloc) call.
    size: usize,
}

pub(crate) const DESCRIPTOR_SIZE: usize = std::mem::size_of::<OsAllocationDescriptor>();

/// Usable bytes of a mapping whose committed size is `committed`.
#[inline]
fn usable(committed: usize) -> usize {
    committed - DESCRIPTOR_SIZE
}

/// Usable size the OS path hands out for `size` bytes.
#[inline]
pub(crate) fn quantize(size: usize, granularity: usize) -> Option<usize> {
    let committed = size.checked_add(DESCRIPTOR_SIZE)?.checked_next_multiple_of(granularity)?;
    Some(usable(committed))
}

/// One mapping owned by the OS path, not yet (or no longer) published in the
/// table. Created and destroyed outside the table lock.
pub(crate) struct OsMapping {
    block: VirtualMemoryBlock,
    committed: usize,
    size: usize,
}

impl OsMapping {
    /// Reserve and commit a mapping for `size` bytes aligned to `align`.
    /// Alignments above the page size get an aligned reservation.
    pub fn map(vm: &dyn VirtualMemory, size: usize, align: usize, address_limit: usize) -> Result<Self, AllocError> {
        let committed = size
            .checked_add(DESCRIPTOR_SIZE)
            .and_then(|n| n.checked_next_multiple_of(vm.allocation_granularity()))
            .ok_or_else(|| AllocError::exhausted(size, align))?;
        let reserve_align = if align > vm.page_size() { align } else { 0 };
        let block = vm.reserve(committed, reserve_align).map_err(|e| AllocError::oom(size, align, e))?;
        let reserved = block.reserved_size();
        stats::on_reserve(reserved);

        let fail = |block: VirtualMemoryBlock, err: AllocError| {
            // Safety: nothing has seen the block yet.
            let _ = unsafe { vm.free(block) };
            stats::on_release(reserved);
            Err(err)
        };
        if block
            .base_addr()
            .checked_add(reserved)
            .is_none_or(|end| end > address_limit)
        {
            return fail(block, AllocError::exhausted(size, align));
        }
        // Safety: fresh reservation of this provider.
        if let Err(e) = unsafe { vm.commit(&block, 0, committed) } {
            return fail(block, AllocError::oom(size, align, e));
        }
        stats::on_commit(&stats::OS_ALLOCATION_COMMITTED, committed);

        let mapping = Self { block, committed, size };
        mapping.write_descriptor(DESCRIPTOR_MAGIC);
        tracing::trace!(ptr = ?mapping.ptr(), size, committed, "os mapping");
        Ok(mapping)
    }

    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.block.base()
    }

    #[inline]
    pub fn usable_size(&self) -> usize {
        usable(self.committed)
    }

    #[inline]
    fn descriptor_ptr(&self) -> *mut OsAllocationDescriptor {
        // Safety: the descriptor sits inside the committed range.
        unsafe {
            self.block
                .base()
                .as_ptr()
                .add(usable(self.committed))
                .cast::<OsAllocationDescriptor>()
        }
    }

    fn write_descriptor(&self, magic: u64) {
        // Safety: committed, 8-aligned (base is page aligned and the
        // committed size a multiple of the granularity).
        unsafe {
            self.descriptor_ptr().write(OsAllocationDescriptor {
                magic,
                mapped_base: self.block.base_addr(),
                mapped_size: self.committed,
                size: self.size,
            });
        }
    }

    fn read_descriptor(&self) -> OsAllocationDescriptor {
        // Safety: see `write_descriptor`.
        unsafe { self.descriptor_ptr().read() }
    }

    fn check_descriptor(&self) -> Result<(), AllocError> {
        let desc = self.read_descriptor();
        let expected = OsAllocationDescriptor {
            magic: DESCRIPTOR_MAGIC,
            mapped_base: self.block.base_addr(),
            mapped_size: self.committed,
            size: self.size,
        };
        if desc == expected {
            Ok(())
        } else {
            Err(AllocError::CorruptDescriptor(self.block.base_addr()))
        }
    }

    /// Decommit and release the mapping.
    ///
    /// # Safety
    /// No pointer into the mapping may be used afterwards.
    pub unsafe fn unmap(self, vm: &dyn VirtualMemory) -> Result<(), VmError> {
        let reserved = self.block.reserved_size();
        let committed = self.committed;
        // Safety: forwarded contract.
        unsafe { vm.free(self.block)? };
        stats::on_decommit(&stats::OS_ALLOCATION_COMMITTED, committed);
        stats::on_release(reserved);
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct Entry {
    /// Mapping base; 0 marks an empty slot.
    key: usize,
    reserved: usize,
    alignment: usize,
    committed: usize,
    size: usize,
}

impl Entry {
    const EMPTY: Self = Self {
        key: 0,
        reserved: 0,
        alignment: 0,
        committed: 0,
        size: 0,
    };

    fn from_mapping(m: OsMapping) -> Self {
        Self {
            key: m.block.base_addr(),
            reserved: m.block.reserved_size(),
            alignment: m.block.alignment(),
            committed: m.committed,
            size: m.size,
        }
    }

    /// # Safety
    /// The entry must describe a live mapping being handed back to its owner.
    unsafe fn into_mapping(self) -> OsMapping {
        // Safety: keys are mapping bases, never zero once stored.
        let base = unsafe { NonNull::new_unchecked(self.key as *mut u8) };
        OsMapping {
            // Safety: forwarded contract.
            block: unsafe { VirtualMemoryBlock::from_raw_parts(base, self.reserved, self.alignment) },
            committed: self.committed,
            size: self.size,
        }
    }
}

/// Open-addressing map from mapping base to its bookkeeping.
///
/// Storage comes from the VM provider, never from the heap, so the table can
/// grow while its lock is held. Linear probing; deletion shifts the cluster
/// back instead of leaving tombstones.
pub(crate) struct OsAllocationTable {
    storage: Option<VirtualMemoryBlock>,
    capacity: usize,
    len: usize,
}

// Safety: the table owns its storage; access is serialized by the owner.
unsafe impl Send for OsAllocationTable {}

impl OsAllocationTable {
    const INITIAL_CAPACITY: usize = 256;

    pub const fn new() -> Self {
        Self {
            storage: None,
            capacity: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn slots(&self) -> &[Entry] {
        match &self.storage {
            // Safety: the storage is committed for `capacity` entries.
            Some(block) => unsafe { std::slice::from_raw_parts(block.base().as_ptr().cast::<Entry>(), self.capacity) },
            None => &[],
        }
    }

    #[inline]
    fn slots_mut(&mut self) -> &mut [Entry] {
        match &self.storage {
            // Safety: as above, and `&mut self` is exclusive.
            Some(block) => unsafe {
                std::slice::from_raw_parts_mut(block.base().as_ptr().cast::<Entry>(), self.capacity)
            },
            None => &mut [],
        }
    }

    #[inline]
    fn home(&self, key: usize) -> usize {
        // Mapping bases are page aligned; drop the zero bits before hashing.
        let h = (key >> 12).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        h >> (usize::BITS - self.capacity.trailing_zeros())
    }

    fn find(&self, key: usize) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let slots = self.slots();
        let mask = self.capacity - 1;
        let mut i = self.home(key);
        loop {
            match slots[i].key {
                0 => return None,
                k if k == key => return Some(i),
                _ => i = (i + 1) & mask,
            }
        }
    }

    fn get(&self, key: usize) -> Option<Entry> {
        self.find(key).map(|i| self.slots()[i])
    }

    fn get_mut(&mut self, key: usize) -> Option<&mut Entry> {
        let i = self.find(key)?;
        Some(&mut self.slots_mut()[i])
    }

    fn insert_unchecked(&mut self, entry: Entry) {
        let mask = self.capacity - 1;
        let mut i = self.home(entry.key);
        let slots = self.slots_mut();
        while slots[i].key != 0 {
            i = (i + 1) & mask;
        }
        slots[i] = entry;
        self.len += 1;
    }

    fn insert(&mut self, vm: &dyn VirtualMemory, entry: Entry) -> Result<(), VmError> {
        if (self.len + 1) * 2 > self.capacity {
            self.grow(vm)?;
        }
        self.insert_unchecked(entry);
        Ok(())
    }

    fn remove(&mut self, key: usize) -> Option<Entry> {
        let mut hole = self.find(key)?;
        let mask = self.capacity - 1;
        let removed = self.slots()[hole];
        let mut i = hole;
        loop {
            i = (i + 1) & mask;
            let entry = self.slots()[i];
            if entry.key == 0 {
                break;
            }
            // Move the entry back if its home is not in (hole, i].
            let home = self.home(entry.key);
            let stays = if hole <= i {
                hole < home && home <= i
            } else {
                hole < home || home <= i
            };
            if !stays {
                self.slots_mut()[hole] = entry;
                hole = i;
            }
        }
        self.slots_mut()[hole] = Entry::EMPTY;
        self.len -= 1;
        Some(removed)
    }

    fn grow(&mut self, vm: &dyn VirtualMemory) -> Result<(), VmError> {
        let capacity = (self.capacity * 2).max(Self::INITIAL_CAPACITY);
        let bytes = (capacity * std::mem::size_of::<Entry>()).next_multiple_of(vm.allocation_granularity());
        let block = vm.reserve(bytes, 0)?;
        // Safety: fresh reservation.
        if let Err(e) = unsafe { vm.commit(&block, 0, bytes) } {
            // Safety: nothing references the block.
            let _ = unsafe { vm.free(block) };
            return Err(e);
        }
        stats::on_reserve(block.reserved_size());
        stats::on_commit(&stats::OS_ALLOCATION_COMMITTED, bytes);
        // Safety: committed for `capacity` entries.
        unsafe { std::ptr::write_bytes(block.base().as_ptr().cast::<Entry>(), 0, capacity) };

        let old = std::mem::replace(
            self,
            Self {
                storage: Some(block),
                capacity,
                len: 0,
            },
        );
        for entry in old.slots().iter().filter(|e| e.key != 0) {
            self.insert_unchecked(*entry);
        }
        // Safety: the old table is no longer referenced.
        unsafe { old.release(vm) };
        Ok(())
    }

    /// Release the table storage. Entries are forgotten.
    ///
    /// # Safety
    /// No slot may be used afterwards.
    unsafe fn release(mut self, vm: &dyn VirtualMemory) {
        if let Some(block) = self.storage.take() {
            let bytes = (self.capacity * std::mem::size_of::<Entry>()).next_multiple_of(vm.allocation_granularity());
            let reserved = block.reserved_size();
            // Safety: forwarded contract.
            if unsafe { vm.free(block) }.is_ok() {
                stats::on_decommit(&stats::OS_ALLOCATION_COMMITTED, bytes);
                stats::on_release(reserved);
            }
        }
    }
}

/// Bookkeeping of the OS path. Lives behind the allocator's OS mutex;
/// mapping and unmapping happen outside it.
pub(crate) struct OsAllocator {
    table: OsAllocationTable,
    allocated_bytes: usize,
    mapped_bytes: usize,
}

impl OsAllocator {
    pub const fn new() -> Self {
        Self {
            table: OsAllocationTable::new(),
            allocated_bytes: 0,
            mapped_bytes: 0,
        }
    }

    /// Publish `mapping`. On failure the mapping is handed back for the
    /// caller to unmap after unlocking.
    pub fn register(
        &mut self,
        vm: &dyn VirtualMemory,
        mapping: OsMapping,
    ) -> Result<NonNull<u8>, (OsMapping, VmError)> {
        let entry = Entry::from_mapping(mapping);
        if let Err(e) = self.table.insert(vm, entry) {
            // Safety: the entry came from a live mapping and was not stored.
            return Err((unsafe { entry.into_mapping() }, e));
        }
        self.allocated_bytes += entry.size;
        self.mapped_bytes += entry.committed;
        // Safety: keys are non-zero mapping bases.
        Ok(unsafe { NonNull::new_unchecked(entry.key as *mut u8) })
    }

    /// Take `ptr` out of the table for unmapping.
    ///
    /// # Errors
    ///
    /// `UnknownPointer` if `ptr` is not a live OS allocation,
    /// `CorruptDescriptor` if its trailer was overwritten; the mapping then
    /// stays registered.
    pub fn unregister(&mut self, ptr: NonNull<u8>) -> Result<OsMapping, AllocError> {
        let addr = ptr.as_ptr() as usize;
        let entry = self.table.get(addr).ok_or(AllocError::UnknownPointer(addr))?;
        // Safety: the entry describes a live mapping; this copy only reads it.
        let view = unsafe { entry.into_mapping() };
        view.check_descriptor()?;
        self.table.remove(addr);
        view.write_descriptor(0);
        self.allocated_bytes -= entry.size;
        self.mapped_bytes -= entry.committed;
        Ok(view)
    }

    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.table.find(ptr.as_ptr() as usize).is_some()
    }

    /// Usable bytes behind `ptr`.
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.table.get(ptr.as_ptr() as usize).map(|e| usable(e.committed))
    }

    /// Grow or shrink `ptr` without moving it. `Ok(false)` if it does not fit.
    pub fn resize_in_place(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<bool, AllocError> {
        let addr = ptr.as_ptr() as usize;
        let entry = self.table.get(addr).ok_or(AllocError::UnknownPointer(addr))?;
        if new_size > usable(entry.committed) {
            return Ok(false);
        }
        // Safety: read-only view of a live mapping.
        let mut view = unsafe { entry.into_mapping() };
        view.check_descriptor()?;
        view.size = new_size;
        view.write_descriptor(DESCRIPTOR_MAGIC);
        self.allocated_bytes = self.allocated_bytes - entry.size + new_size;
        if let Some(e) = self.table.get_mut(addr) {
            e.size = new_size;
        }
        Ok(true)
    }

    pub fn count(&self) -> usize {
        self.table.len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    /// Check every live descriptor. Returns the first corrupt base.
    pub fn validate(&self) -> Result<(), AllocError> {
        for entry in self.table.slots().iter().filter(|e| e.key != 0) {
            // Safety: read-only view of a live mapping.
            unsafe { entry.into_mapping() }.check_descriptor()?;
        }
        Ok(())
    }

    /// Unmap every live allocation and the table itself.
    ///
    /// # Safety
    /// No OS allocation of this allocator may be used afterwards.
    pub unsafe fn release(&mut self, vm: &dyn VirtualMemory) {
        let table = std::mem::replace(&mut self.table, OsAllocationTable::new());
        for entry in table.slots().iter().filter(|e| e.key != 0) {
            // Safety: forwarded contract; each entry is unmapped once.
            let _ = unsafe { entry.into_mapping().unmap(vm) };
        }
        // Safety: forwarded contract.
        unsafe { table.release(vm) };
        self.allocated_bytes = 0;
        self.mapped_bytes = 0;
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::vm::HeapVm;

    const LIMIT: usize = 1 << 47;

    fn map(vm: &dyn VirtualMemory, size: usize, align: usize) -> OsMapping {
        OsMapping::map(vm, size, align, LIMIT).unwrap()
    }

    #[test]
    fn test_map_layout_and_descriptor() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let vm = HeapVm::new();
        let m = map(&vm, 100_000, 16);
        assert_eq!(m.usable_size(), quantize(100_000, 4096).unwrap());
        assert!(m.usable_size() >= 100_000);
        assert_eq!(m.read_descriptor().size, 100_000);
        m.check_descriptor().unwrap();
        // Safety: Test code.
        unsafe { m.unmap(&vm).unwrap() };
        assert_eq!(vm.committed_bytes(), 0);
    }

    #[test]
    fn test_over_aligned_mapping() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let vm = HeapVm::new();
        let m = map(&vm, 70_000, 1 << 16);
        assert!((m.ptr().as_ptr() as usize).is_multiple_of(1 << 16));
        // Safety: Test code.
        unsafe { m.unmap(&vm).unwrap() };
    }

    #[test]
    fn test_address_limit_rejects_mapping() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let vm = HeapVm::new();
        let err = OsMapping::map(&vm, 100_000, 16, 4096).err().unwrap();
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn test_commit_failure_is_oom() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let vm = HeapVm::with_commit_limit(8192);
        let err = OsMapping::map(&vm, 100_000, 16, LIMIT).err().unwrap();
        assert!(matches!(err, AllocError::OutOfMemory { source: Some(_), .. }));
    }

    #[test]
    fn test_register_unregister() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let vm = HeapVm::new();
        let mut os = OsAllocator::new();
        let ptr = os.register(&vm, map(&vm, 200_000, 16)).ok().unwrap();
        assert!(os.contains(ptr));
        assert_eq!(os.count(), 1);
        assert_eq!(os.allocated_bytes(), 200_000);
        assert!(os.allocation_size(ptr).unwrap() >= 200_000);

        let m = os.unregister(ptr).unwrap();
        assert!(!os.contains(ptr));
        assert_eq!(os.count(), 0);
        assert_eq!(m.read_descriptor().magic, 0, "descriptor cleared");
        // Safety: Test code.
        unsafe { m.unmap(&vm).unwrap() };
        // Safety: Test code.
        unsafe { os.release(&vm) };
    }

    #[test]
    fn test_unknown_pointer() {
        let vm = HeapVm::new();
        let mut os = OsAllocator::new();
        let bogus = NonNull::new(0x7000_0000_0000 as *mut u8).unwrap();
        assert!(matches!(os.unregister(bogus), Err(AllocError::UnknownPointer(_))));
        assert!(os.allocation_size(bogus).is_none());
        // Safety: Test code.
        unsafe { os.release(&vm) };
    }

    #[test]
    fn test_corrupt_descriptor_keeps_mapping() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let vm = HeapVm::new();
        let mut os = OsAllocator::new();
        let ptr = os.register(&vm, map(&vm, 5000, 16)).ok().unwrap();
        let usable = os.allocation_size(ptr).unwrap();
        // Overrun into the trailer.
        // Safety: Test code.
        unsafe { ptr.as_ptr().add(usable).write_bytes(0xEE, 8) };
        assert!(matches!(os.unregister(ptr), Err(AllocError::CorruptDescriptor(_))));
        assert!(os.validate().is_err());
        assert!(os.contains(ptr));
        // Safety: Test code.
        unsafe { os.release(&vm) };
    }

    #[test]
    fn test_resize_in_place() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let vm = HeapVm::new();
        let mut os = OsAllocator::new();
        let ptr = os.register(&vm, map(&vm, 100_000, 16)).ok().unwrap();
        let usable = os.allocation_size(ptr).unwrap();
        assert!(os.resize_in_place(ptr, usable).unwrap());
        assert_eq!(os.allocated_bytes(), usable);
        assert!(!os.resize_in_place(ptr, usable + 1).unwrap());
        os.validate().unwrap();
        let m = os.unregister(ptr).unwrap();
        // Safety: Test code.
        unsafe { m.unmap(&vm).unwrap() };
        // Safety: Test code.
        unsafe { os.release(&vm) };
    }

    #[test]
    fn test_table_grows_and_removes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let vm = HeapVm::new();
        let mut os = OsAllocator::new();
        let ptrs: Vec<_> = (0..300).map(|_| os.register(&vm, map(&vm, 1, 16)).ok().unwrap()).collect();
        assert_eq!(os.count(), 300);
        assert!(os.table.capacity >= 600);
        // Remove every other entry; the rest must still be found.
        for p in ptrs.iter().step_by(2) {
            let m = os.unregister(*p).unwrap();
            // Safety: Test code.
            unsafe { m.unmap(&vm).unwrap() };
        }
        for (i, p) in ptrs.iter().enumerate() {
            assert_eq!(os.contains(*p), i % 2 == 1, "entry {i}");
        }
        // Safety: Test code.
        unsafe { os.release(&vm) };
        assert_eq!(vm.committed_bytes(), 0);
    }

    #[test]
    fn test_quantize_is_idempotent() {
        for n in [0, 1, 4064, 4065, 100_000, 1 << 20] {
            let q = quantize(n, 4096).unwrap();
            assert!(q >= n);
            assert_eq!(quantize(q, 4096), Some(q));
        }
        assert!(quantize(usize::MAX, 4096).is_none());
    }
}
