#[cfg(not(target_pointer_width = "64"))]
compile_error!("binalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocators
pub use memory::binned::BinnedAllocator;
pub use memory::malloc::{Malloc, SystemMalloc};
pub use memory::proxy::{BlockProxyAllocator, FreeBlockProxy};

// bring-up
#[cfg(not(loom))]
pub use memory::platform::GlobalMalloc;
pub use memory::platform::{AllocatorKind, MallocContext, PlatformMemory, PlatformMemoryStats, select_allocator};

// configuration
pub use memory::config::{
    ArenaParams, ENV_ALLOCATOR, ENV_MAX_GLOBAL_BUNDLES, ENV_THREAD_CACHES, EnvOverrides,
};
pub use memory::size_class::SizeClassTable;

// address mapping
pub use memory::pool_map::{PoolLookup, PoolRegion, SearchLookup, ShiftLookup, select_lookup};

// virtual memory
pub use memory::vm::{HeapVm, PlatformVm, VirtualMemory, VirtualMemoryBlock};

// stats
pub use memory::stats::{AllocatorStats, GlobalCounters, PoolStats};

// errors
pub use memory::error::{AllocError, OutOfMemoryHandler, on_out_of_memory, set_out_of_memory_handler};
pub use memory::pool::PoolFault;
pub use memory::vm::VmError;
