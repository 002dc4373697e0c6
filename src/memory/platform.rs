use super::binned::BinnedAllocator;
use super::config::{ArenaParams, EnvOverrides};
use super::error::AllocError;
use super::malloc::{Malloc, SystemMalloc};
use super::size_class::SizeClassTable;
use super::stats;
use super::vm::{PlatformVm, VirtualMemory};
use crate::sync::OnceLock;
use crate::sync::rc::Arc;

/// Process-wide allocator implementation variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorKind {
    /// Everything goes to the platform allocator.
    System,
    /// Size-class pools with per-thread caches.
    Binned,
}

/// Memory totals and current usage of this process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlatformMemoryStats {
    pub total_physical: u64,
    pub available_physical: u64,
    /// Address space the process may map (`RLIMIT_AS`, or the user half of
    /// a 47-bit address space when unlimited).
    pub total_virtual: u64,
    pub used_physical: u64,
    pub used_virtual: u64,
    pub peak_used_physical: u64,
    pub page_size: usize,
    pub allocation_granularity: usize,
}

#[derive(Clone, Copy, Debug)]
struct Constants {
    total_physical: u64,
    total_virtual: u64,
    page_size: usize,
    allocation_granularity: usize,
}

static CONSTANTS: OnceLock<Constants> = OnceLock::new();

/// Process memory queries. Totals are gathered once; usage is sampled on
/// every call to [`stats`](Self::stats).
pub struct PlatformMemory;

impl PlatformMemory {
    /// Gather the memory totals. First call wins; later calls are no-ops.
    /// Never allocates, so it is safe to call during allocator bring-up.
    pub fn init() {
        Self::constants();
    }

    fn constants() -> Constants {
        *CONSTANTS.get_or_init(|| {
            let vm = PlatformVm;
            let c = Constants {
                total_physical: os::total_physical(),
                total_virtual: os::total_virtual(),
                page_size: vm.page_size(),
                allocation_granularity: vm.allocation_granularity(),
            };
            tracing::debug!(
                total_physical = c.total_physical,
                total_virtual = c.total_virtual,
                page_size = c.page_size,
                "platform memory"
            );
            c
        })
    }

    pub fn stats() -> PlatformMemoryStats {
        let c = Self::constants();
        let usage = os::usage(c.page_size);
        PlatformMemoryStats {
            total_physical: c.total_physical,
            available_physical: os::available_physical().unwrap_or(c.total_physical),
            total_virtual: c.total_virtual,
            used_physical: usage.resident,
            used_virtual: usage.virtual_size,
            peak_used_physical: usage.peak_resident.max(usage.resident),
            page_size: c.page_size,
            allocation_granularity: c.allocation_granularity,
        }
    }
}

#[derive(Default)]
struct Usage {
    resident: u64,
    virtual_size: u64,
    peak_resident: u64,
}

#[cfg(all(unix, not(any(loom, miri))))]
mod os {
    use super::Usage;

    const UNLIMITED_VIRTUAL: u64 = 1 << 47;

    fn sysconf(name: libc::c_int) -> Option<u64> {
        // Safety: FFI call to sysconf.
        let v = unsafe { libc::sysconf(name) };
        u64::try_from(v).ok()
    }

    fn page_size() -> u64 {
        sysconf(libc::_SC_PAGESIZE).unwrap_or(4096)
    }

    pub(super) fn total_physical() -> u64 {
        sysconf(libc::_SC_PHYS_PAGES).map_or(0, |pages| pages * page_size())
    }

    #[cfg(target_os = "linux")]
    pub(super) fn available_physical() -> Option<u64> {
        sysconf(libc::_SC_AVPHYS_PAGES).map(|pages| pages * page_size())
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn available_physical() -> Option<u64> {
        None
    }

    pub(super) fn total_virtual() -> u64 {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // Safety: FFI call to getrlimit with a valid out pointer.
        if unsafe { libc::getrlimit(libc::RLIMIT_AS, &raw mut limit) } != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
            return UNLIMITED_VIRTUAL;
        }
        u64::try_from(limit.rlim_cur).unwrap_or(UNLIMITED_VIRTUAL)
    }

    fn peak_resident() -> u64 {
        // Safety: all-zero is a valid `rusage`.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        // Safety: FFI call to getrusage with a valid out pointer.
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, &raw mut usage) } != 0 {
            return 0;
        }
        let maxrss = u64::try_from(usage.ru_maxrss).unwrap_or(0);
        // Linux reports kilobytes, Darwin bytes.
        if cfg!(target_os = "macos") { maxrss } else { maxrss * 1024 }
    }

    #[cfg(target_os = "linux")]
    pub(super) fn usage(page_size: usize) -> Usage {
        use std::io::Read;

        // Stack buffer only: usage may be sampled from inside allocator hooks.
        let mut buf = [0u8; 128];
        let len = std::fs::File::open("/proc/self/statm")
            .and_then(|mut f| f.read(&mut buf))
            .unwrap_or(0);
        let mut fields = buf[..len]
            .split(u8::is_ascii_whitespace)
            .filter_map(|f| std::str::from_utf8(f).ok()?.parse::<u64>().ok());
        let pages = page_size as u64;
        let virtual_size = fields.next().unwrap_or(0) * pages;
        let resident = fields.next().unwrap_or(0) * pages;
        Usage {
            resident,
            virtual_size,
            peak_resident: peak_resident(),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn usage(_page_size: usize) -> Usage {
        let peak = peak_resident();
        Usage {
            resident: peak,
            virtual_size: 0,
            peak_resident: peak,
        }
    }
}

#[cfg(any(loom, miri, not(unix)))]
mod os {
    use super::Usage;

    pub(super) fn total_physical() -> u64 {
        0
    }

    pub(super) fn available_physical() -> Option<u64> {
        None
    }

    pub(super) fn total_virtual() -> u64 {
        1 << 47
    }

    pub(super) fn usage(_page_size: usize) -> Usage {
        Usage::default()
    }
}

/// Pick the implementation variant for this process.
///
/// An explicit override wins. Otherwise the binned allocator is chosen if
/// the process can reserve the address space its pools need; when it
/// cannot, the system allocator is the conservative fallback.
pub fn select_allocator(env: &EnvOverrides, vm: &dyn VirtualMemory, params: &ArenaParams) -> AllocatorKind {
    if let Some(kind) = env.allocator {
        tracing::debug!(?kind, "allocator forced by environment");
        return kind;
    }
    match probe_reservation(vm, params) {
        Ok(bytes) => {
            tracing::debug!(bytes, "address space probe passed, using binned allocator");
            AllocatorKind::Binned
        }
        Err(error) => {
            tracing::warn!(%error, "cannot reserve pool address space, falling back to system allocator");
            AllocatorKind::System
        }
    }
}

fn probe_reservation(vm: &dyn VirtualMemory, params: &ArenaParams) -> Result<usize, AllocError> {
    let mut params = params.clone();
    params.resolve(vm);
    params.validate()?;
    let classes = SizeClassTable::new(&params)?.len();
    let bytes = if params.use_separate_vm_per_pool {
        params.pool_reserved_size
    } else {
        params
            .pool_reserved_size
            .checked_mul(classes)
            .ok_or_else(|| AllocError::exhausted(params.pool_reserved_size, 0))?
    };
    let block = vm.reserve(bytes, 0).map_err(|e| AllocError::oom(bytes, 0, e))?;
    // Safety: the block was reserved above and never committed.
    unsafe { vm.free(block)? };
    Ok(bytes)
}

/// The process allocator as an explicit object: selected and constructed
/// once by [`init`](Self::init), torn down by [`teardown`](Self::teardown).
pub struct MallocContext {
    kind: AllocatorKind,
    malloc: Box<dyn Malloc>,
}

impl MallocContext {
    /// Bring up with the environment overrides, the operating system's
    /// virtual memory and default parameters.
    pub fn init() -> Self {
        Self::with_env(&EnvOverrides::from_env(), Arc::new(PlatformVm), ArenaParams::default())
    }

    /// Bring up from explicit inputs. Never fails: a binned allocator that
    /// cannot be built degrades to the system variant.
    pub fn with_env(env: &EnvOverrides, vm: Arc<dyn VirtualMemory>, mut params: ArenaParams) -> Self {
        PlatformMemory::init();
        params.apply_env(env);
        let kind = select_allocator(env, &*vm, &params);
        let (kind, malloc): (AllocatorKind, Box<dyn Malloc>) = match kind {
            AllocatorKind::System => (kind, Box::new(SystemMalloc)),
            AllocatorKind::Binned => match BinnedAllocator::with_vm(vm, params) {
                Ok(binned) => (kind, Box::new(binned)),
                Err(error) => {
                    tracing::warn!(%error, "binned allocator construction failed, using system allocator");
                    (AllocatorKind::System, Box::new(SystemMalloc))
                }
            },
        };
        tracing::debug!(?kind, "allocator ready");
        Self { kind, malloc }
    }

    pub fn kind(&self) -> AllocatorKind {
        self.kind
    }

    pub fn malloc(&self) -> &dyn Malloc {
        &*self.malloc
    }

    /// Trim every cache and release the allocator. Outstanding allocations
    /// must already be freed.
    pub fn teardown(self) {
        self.malloc.trim(true);
        let reserved_before = stats::TOTAL_RESERVED.get();
        drop(self.malloc);
        tracing::debug!(
            released = reserved_before.saturating_sub(stats::TOTAL_RESERVED.get()),
            "allocator torn down"
        );
    }
}

#[cfg(not(loom))]
pub use global::GlobalMalloc;

#[cfg(not(loom))]
mod global {
    use super::{AllocatorKind, PlatformMemory, select_allocator};
    use crate::memory::binned::BinnedAllocator;
    use crate::memory::config::{ArenaParams, EnvOverrides};
    use crate::memory::error::{AllocError, on_out_of_memory};
    use crate::memory::vm::PlatformVm;
    use crate::sync::OnceLock;
    use crate::sync::atomic::{AtomicU8, Ordering};
    use crate::sync::rc::Arc;
    use std::alloc::{GlobalAlloc, Layout, System};
    use std::ptr::NonNull;

    const UNINIT: u8 = 0;
    const INITIALIZING: u8 = 1;
    const READY: u8 = 2;
    const DISABLED: u8 = 3;

    /// `#[global_allocator]` adapter.
    ///
    /// The binned allocator is brought up on the first allocation. Requests
    /// made while that is in progress (by this or any other thread), and all
    /// requests once the system variant has been selected, go to
    /// [`System`]; frees are routed by ownership, so such blocks may be
    /// released at any time.
    ///
    /// ```ignore
    /// #[global_allocator]
    /// static ALLOC: binalloc::GlobalMalloc = binalloc::GlobalMalloc::new();
    /// ```
    pub struct GlobalMalloc {
        state: AtomicU8,
        binned: OnceLock<BinnedAllocator>,
    }

    impl Default for GlobalMalloc {
        fn default() -> Self {
            Self::new()
        }
    }

    impl GlobalMalloc {
        pub const fn new() -> Self {
            Self {
                state: AtomicU8::new(UNINIT),
                binned: OnceLock::new(),
            }
        }

        /// The selected variant, once bring-up has finished.
        pub fn kind(&self) -> Option<AllocatorKind> {
            match self.state.load(Ordering::Acquire) {
                READY => Some(AllocatorKind::Binned),
                DISABLED => Some(AllocatorKind::System),
                _ => None,
            }
        }

        /// The binned allocator, if it is serving requests.
        pub fn binned(&self) -> Option<&BinnedAllocator> {
            match self.state.load(Ordering::Acquire) {
                READY => self.binned.get(),
                UNINIT => self.bring_up(),
                _ => None,
            }
        }

        #[cold]
        fn bring_up(&self) -> Option<&BinnedAllocator> {
            if self
                .state
                .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return if self.state.load(Ordering::Acquire) == READY {
                    self.binned.get()
                } else {
                    None
                };
            }

            PlatformMemory::init();
            let env = EnvOverrides::from_env();
            let mut params = ArenaParams::default();
            params.apply_env(&env);
            let vm = Arc::new(PlatformVm);
            let next = match select_allocator(&env, &*vm, &params) {
                AllocatorKind::System => DISABLED,
                AllocatorKind::Binned => match BinnedAllocator::with_vm(vm, params) {
                    Ok(binned) => {
                        // Only the thread that won the CAS reaches this.
                        let _ = self.binned.set(binned);
                        READY
                    }
                    Err(error) => {
                        tracing::warn!(%error, "binned allocator construction failed, using system allocator");
                        DISABLED
                    }
                },
            };
            self.state.store(next, Ordering::Release);
            if next == READY { self.binned.get() } else { None }
        }

        /// Forward to [`BinnedAllocator::trim`]. Returns bytes decommitted.
        pub fn trim(&self, trim_thread_caches: bool) -> usize {
            self.binned().map_or(0, |b| b.trim(trim_thread_caches))
        }

        #[cold]
        fn fail(error: &AllocError, layout: Layout) -> ! {
            if error.is_out_of_memory() {
                on_out_of_memory(layout.size(), layout.align())
            }
            tracing::error!(%error, size = layout.size(), "global allocator contract violation");
            std::process::abort()
        }
    }

    // Safety: blocks come either from `System` with the caller's layout, or
    // from the binned allocator honoring size and alignment; frees go back to
    // whichever owns the pointer.
    unsafe impl GlobalAlloc for GlobalMalloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            match self.binned() {
                Some(binned) => match binned.allocate(layout.size(), layout.align()) {
                    Ok(ptr) => ptr.as_ptr(),
                    Err(error) => Self::fail(&error, layout),
                },
                // Safety: forwarded contract.
                None => unsafe { System.alloc(layout) },
            }
        }

        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            if self.binned().is_none() {
                // Safety: forwarded contract.
                return unsafe { System.alloc_zeroed(layout) };
            }
            // Safety: forwarded contract.
            let ptr = unsafe { self.alloc(layout) };
            // Safety: `alloc` never returns null on this path.
            unsafe { ptr.write_bytes(0, layout.size()) };
            ptr
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            let Some(nn) = NonNull::new(ptr) else { return };
            match self.binned() {
                Some(binned) if binned.owns(nn) => {
                    // Safety: forwarded contract.
                    if let Err(error) = unsafe { binned.free(nn) } {
                        Self::fail(&error, layout);
                    }
                }
                // Safety: not ours, so it came from `System` with this layout.
                _ => unsafe { System.dealloc(ptr, layout) },
            }
        }

        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            let Some(nn) = NonNull::new(ptr) else {
                return std::ptr::null_mut();
            };
            match self.binned() {
                Some(binned) if binned.owns(nn) => {
                    // Safety: forwarded contract; `new_size` is non-zero.
                    match unsafe { binned.realloc(Some(nn), new_size, layout.align()) } {
                        Ok(Some(new)) => new.as_ptr(),
                        Ok(None) => std::ptr::null_mut(),
                        Err(error) => Self::fail(&error, layout),
                    }
                }
                // Safety: forwarded contract.
                _ => unsafe { System.realloc(ptr, layout, new_size) },
            }
        }
    }
}
