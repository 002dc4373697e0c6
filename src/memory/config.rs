use super::error::AllocError;
use super::platform::AllocatorKind;
use super::vm::VirtualMemory;

/// Default VA reserved per size class.
pub(crate) const POOL_RESERVED_SIZE: usize = 256 * 1024 * 1024;

/// Default small/large threshold.
pub(crate) const MAX_STANDARD_POOL_SIZE: usize = 64 * 1024;

/// Smallest block the free-list node fits in.
pub(crate) const MIN_BLOCK_SIZE: usize = 16;

/// Configuration for `BinnedAllocator`. All fields have sensible defaults.
///
/// Page size, allocation granularity and slab size may be left at `0`, in
/// which case [`resolve`](Self::resolve) fills them from the VM provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaParams {
    /// Addresses at or above this are never produced and never recognized.
    /// Default: `1 << 47`.
    pub address_limit: usize,

    /// Platform page granularity. `0` = detect.
    pub base_page_size: usize,

    /// VM commit/decommit granularity. `0` = detect.
    pub allocation_granularity: usize,

    /// A bundle is full once its blocks add up to this many bytes.
    /// Default: 8 KB.
    pub max_size_per_bundle: usize,

    /// A bundle is full once it holds this many blocks. Default: 64.
    pub max_blocks_per_bundle: usize,

    /// Largest request served by the size-class pools. Default: 64 KB.
    pub max_standard_pool_size: usize,

    /// Recycler slots per size class. `0` disables the recycler.
    /// Default: 32.
    pub max_global_bundles: usize,

    /// log2 of the minimum alignment (and of the smallest size class).
    /// Default: 4.
    pub minimum_alignment_shift: u32,

    /// One reservation per size class instead of one shared reservation.
    /// Default: false.
    pub use_separate_vm_per_pool: bool,

    /// Enable the per-thread free lists. Default: true.
    pub per_thread_caches: bool,

    /// Built-in size progression; when false only `additional_block_sizes`
    /// (plus the maximum) are used. Default: true.
    pub use_standard_small_pool_sizes: bool,

    /// Extra size classes spliced into the table.
    pub additional_block_sizes: Vec<usize>,

    /// VA reserved per size class. Power of two. Default: 256 MB.
    pub pool_reserved_size: usize,

    /// Bytes per block-of-blocks. `0` = `max(64KB, granularity)`.
    pub slab_size: usize,
}

impl Default for ArenaParams {
    fn default() -> Self {
        Self {
            address_limit: 1 << 47,
            base_page_size: 0,
            allocation_granularity: 0,
            max_size_per_bundle: 8192,
            max_blocks_per_bundle: 64,
            max_standard_pool_size: MAX_STANDARD_POOL_SIZE,
            max_global_bundles: 32,
            minimum_alignment_shift: 4,
            use_separate_vm_per_pool: false,
            per_thread_caches: true,
            use_standard_small_pool_sizes: true,
            additional_block_sizes: Vec::new(),
            pool_reserved_size: POOL_RESERVED_SIZE,
            slab_size: 0,
        }
    }
}

impl ArenaParams {
    #[inline]
    pub fn minimum_alignment(&self) -> usize {
        1 << self.minimum_alignment_shift
    }

    /// Fill auto-detected fields from `vm`.
    pub fn resolve(&mut self, vm: &dyn VirtualMemory) {
        if self.base_page_size == 0 {
            self.base_page_size = vm.page_size();
        }
        if self.allocation_granularity == 0 {
            self.allocation_granularity = vm.allocation_granularity().max(self.base_page_size);
        }
        if self.slab_size == 0 {
            self.slab_size = (64 * 1024).max(self.allocation_granularity);
        }
    }

    /// Reject combinations the allocator cannot honor.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<(), AllocError> {
        let bad = |msg: String| Err(AllocError::InvalidConfig(msg));

        let min_align = self.minimum_alignment();
        if !(4..=12).contains(&self.minimum_alignment_shift) {
            return bad(format!(
                "minimum_alignment_shift {} outside 4..=12",
                self.minimum_alignment_shift
            ));
        }
        if !self.base_page_size.is_power_of_two() {
            return bad(format!("base_page_size {} is not a power of two", self.base_page_size));
        }
        if !self.allocation_granularity.is_power_of_two()
            || !self.allocation_granularity.is_multiple_of(self.base_page_size)
        {
            return bad(format!(
                "allocation_granularity {} must be a power-of-two multiple of the page size {}",
                self.allocation_granularity, self.base_page_size
            ));
        }
        if self.slab_size == 0 || !self.slab_size.is_multiple_of(self.allocation_granularity) {
            return bad(format!(
                "slab_size {} is not a multiple of the allocation granularity {}",
                self.slab_size, self.allocation_granularity
            ));
        }
        // Block indices inside a slab are u16 with 0xFFFF as sentinel.
        if self.slab_size / min_align >= usize::from(u16::MAX) {
            return bad(format!(
                "slab_size {} holds too many {min_align}-byte blocks",
                self.slab_size
            ));
        }
        if self.max_standard_pool_size < min_align
            || !self.max_standard_pool_size.is_multiple_of(min_align)
            || self.max_standard_pool_size > self.slab_size
        {
            return bad(format!(
                "max_standard_pool_size {} must be a multiple of {min_align} no larger than slab_size {}",
                self.max_standard_pool_size, self.slab_size
            ));
        }
        if !self.pool_reserved_size.is_power_of_two() || self.pool_reserved_size < self.slab_size {
            return bad(format!(
                "pool_reserved_size {} must be a power of two of at least one slab",
                self.pool_reserved_size
            ));
        }
        if self.max_blocks_per_bundle == 0 || self.max_blocks_per_bundle > u32::MAX as usize {
            return bad(format!("max_blocks_per_bundle {} out of range", self.max_blocks_per_bundle));
        }
        if self.max_size_per_bundle == 0 {
            return bad("max_size_per_bundle must be non-zero".to_string());
        }
        if let Some(&size) = self
            .additional_block_sizes
            .iter()
            .find(|&&s| s == 0 || s > self.max_standard_pool_size)
        {
            return bad(format!(
                "additional block size {size} outside 1..={}",
                self.max_standard_pool_size
            ));
        }
        if self.address_limit == 0 || !self.address_limit.is_power_of_two() {
            return bad(format!("address_limit {:#x} is not a power of two", self.address_limit));
        }
        Ok(())
    }

    /// Apply bring-up environment overrides.
    pub fn apply_env(&mut self, env: &EnvOverrides) {
        if let Some(enabled) = env.thread_caches {
            self.per_thread_caches = enabled;
        }
        if let Some(n) = env.max_global_bundles {
            self.max_global_bundles = n;
        }
    }
}

pub const ENV_ALLOCATOR: &str = "BINALLOC_ALLOCATOR";
pub const ENV_THREAD_CACHES: &str = "BINALLOC_THREAD_CACHES";
pub const ENV_MAX_GLOBAL_BUNDLES: &str = "BINALLOC_MAX_GLOBAL_BUNDLES";

/// Overrides read once at bring-up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub allocator: Option<AllocatorKind>,
    pub thread_caches: Option<bool>,
    pub max_global_bundles: Option<usize>,
}

impl EnvOverrides {
    /// Read overrides from the process environment.
    ///
    /// Runs before the process allocator is ready, so values are read with
    /// `getenv` and parsed without allocating.
    pub fn from_env() -> Self {
        Self::parse(|key| {
            let mut buf = [0u8; 64];
            let bytes = key.as_bytes();
            if bytes.len() >= buf.len() {
                return None;
            }
            buf[..bytes.len()].copy_from_slice(bytes);
            // Safety: `buf` is NUL-terminated. getenv is not synchronized with
            // setenv; bring-up runs before user code mutates the environment.
            let raw = unsafe { libc::getenv(buf.as_ptr().cast::<libc::c_char>()) };
            if raw.is_null() {
                return None;
            }
            // Safety: getenv returned a NUL-terminated string that lives as
            // long as the environment entry.
            let value = unsafe { std::ffi::CStr::from_ptr(raw) };
            Some(value.to_bytes())
        })
    }

    /// Parse overrides from an arbitrary lookup. Unparseable values are
    /// ignored.
    pub fn parse<'a>(lookup: impl Fn(&str) -> Option<&'a [u8]>) -> Self {
        let mut out = Self::default();

        if let Some(v) = lookup(ENV_ALLOCATOR) {
            if v.eq_ignore_ascii_case(b"system") {
                out.allocator = Some(AllocatorKind::System);
            } else if v.eq_ignore_ascii_case(b"binned") {
                out.allocator = Some(AllocatorKind::Binned);
            } else {
                tracing::warn!(value = %String::from_utf8_lossy(v), "ignoring {ENV_ALLOCATOR}");
            }
        }
        if let Some(v) = lookup(ENV_THREAD_CACHES) {
            match v {
                b"0" => out.thread_caches = Some(false),
                b"1" => out.thread_caches = Some(true),
                _ => tracing::warn!(value = %String::from_utf8_lossy(v), "ignoring {ENV_THREAD_CACHES}"),
            }
        }
        if let Some(v) = lookup(ENV_MAX_GLOBAL_BUNDLES) {
            match parse_usize(v) {
                Some(n) => out.max_global_bundles = Some(n),
                None => {
                    tracing::warn!(value = %String::from_utf8_lossy(v), "ignoring {ENV_MAX_GLOBAL_BUNDLES}");
                }
            }
        }
        out
    }
}

fn parse_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }
    bytes.iter().try_fold(0usize, |acc, &b| {
        if !b.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add(usize::from(b - b'0'))
    })
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::vm::HeapVm;

    fn resolved() -> ArenaParams {
        let mut params = ArenaParams::default();
        params.resolve(&HeapVm::new());
        params
    }

    #[test]
    fn test_default_resolves_and_validates() {
        let params = resolved();
        assert_eq!(params.base_page_size, HeapVm::PAGE_SIZE);
        assert_eq!(params.allocation_granularity, HeapVm::PAGE_SIZE);
        assert_eq!(params.slab_size, 64 * 1024);
        params.validate().unwrap();
    }

    #[test]
    fn test_unresolved_defaults_are_rejected() {
        assert!(matches!(
            ArenaParams::default().validate(),
            Err(AllocError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let cases: Vec<Box<dyn Fn(&mut ArenaParams)>> = vec![
            Box::new(|p| p.minimum_alignment_shift = 3),
            Box::new(|p| p.max_standard_pool_size = 100),
            Box::new(|p| p.max_standard_pool_size = p.slab_size * 2),
            Box::new(|p| p.pool_reserved_size = 3 << 20),
            Box::new(|p| p.slab_size = 5000),
            Box::new(|p| p.max_blocks_per_bundle = 0),
            Box::new(|p| p.additional_block_sizes = vec![1 << 20]),
            Box::new(|p| p.address_limit = 12345),
            Box::new(|p| p.allocation_granularity = 2048),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut p = resolved();
            mutate(&mut p);
            assert!(p.validate().is_err(), "case {i} should be rejected: {p:?}");
        }
    }

    #[test]
    fn test_slab_index_limit() {
        let mut p = resolved();
        p.slab_size = 1 << 20;
        assert!(p.validate().is_err(), "65536 blocks of 16 bytes overflow u16 indices");
        p.minimum_alignment_shift = 5;
        p.max_standard_pool_size = 64 * 1024;
        p.validate().unwrap();
    }

    #[test]
    fn test_env_parse() {
        let env = EnvOverrides::parse(|key| match key {
            ENV_ALLOCATOR => Some(b"System".as_slice()),
            ENV_THREAD_CACHES => Some(b"0".as_slice()),
            ENV_MAX_GLOBAL_BUNDLES => Some(b"7".as_slice()),
            _ => None,
        });
        assert_eq!(env.allocator, Some(AllocatorKind::System));
        assert_eq!(env.thread_caches, Some(false));
        assert_eq!(env.max_global_bundles, Some(7));

        let mut params = resolved();
        params.apply_env(&env);
        assert!(!params.per_thread_caches);
        assert_eq!(params.max_global_bundles, 7);
    }

    #[test]
    fn test_env_parse_ignores_garbage() {
        let env = EnvOverrides::parse(|key| match key {
            ENV_ALLOCATOR => Some(b"jemalloc".as_slice()),
            ENV_THREAD_CACHES => Some(b"yes".as_slice()),
            ENV_MAX_GLOBAL_BUNDLES => Some(b"-3".as_slice()),
            _ => None,
        });
        assert_eq!(env, EnvOverrides::default());
    }

    #[test]
    fn test_parse_usize_overflow() {
        assert_eq!(parse_usize(b"18446744073709551616"), None);
        assert_eq!(parse_usize(b""), None);
        assert_eq!(parse_usize(b"0042"), Some(42));
    }
}
