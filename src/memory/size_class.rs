use super::config::{ArenaParams, MIN_BLOCK_SIZE};
use super::error::AllocError;

/// Immutable size-class table built once per allocator.
///
/// Standard progression with a 16-byte minimum alignment:
/// `16..=128` in steps of 16, then four steps per doubling
/// (`160, 192, 224, 256, 320, ...`) up to the maximum pool size.
///
/// Lookup is a direct index on `ceil(size / min_align)` into a table of
/// `u16` pool indices.
#[derive(Debug)]
pub struct SizeClassTable {
    sizes: Box<[usize]>,
    lut: Box<[u16]>,
    min_align_shift: u32,
    max_size: usize,
    max_small_alignment: usize,
}

impl SizeClassTable {
    /// Build the table for resolved `params`.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if the configuration produces no
    /// usable classes or more than a `u16` pool index can encode.
    pub fn new(params: &ArenaParams) -> Result<Self, AllocError> {
        let min_align = params.minimum_alignment();
        let max_size = params.max_standard_pool_size;

        let mut sizes: Vec<usize> = Vec::new();
        if params.use_standard_small_pool_sizes {
            let mut size = min_align;
            while size <= max_size && size <= 8 * min_align {
                sizes.push(size);
                size += min_align;
            }
            let mut base = 8 * min_align;
            while base < max_size {
                let step = base / 4;
                for k in 1..=4 {
                    let s = base + k * step;
                    if s > max_size {
                        break;
                    }
                    sizes.push(s);
                }
                base *= 2;
            }
        }
        sizes.extend(
            params
                .additional_block_sizes
                .iter()
                .map(|&s| s.max(MIN_BLOCK_SIZE).next_multiple_of(min_align)),
        );
        // The largest class is the small/large threshold.
        sizes.push(max_size);
        sizes.sort_unstable();
        sizes.dedup();
        sizes.retain(|&s| s <= max_size && s >= MIN_BLOCK_SIZE);

        if sizes.is_empty() || sizes.len() > usize::from(u16::MAX) {
            return Err(AllocError::InvalidConfig(format!(
                "size-class table would have {} classes",
                sizes.len()
            )));
        }

        let shift = params.minimum_alignment_shift;
        let lut_len = (max_size >> shift) + 1;
        let mut lut = Vec::with_capacity(lut_len);
        let mut idx = 0usize;
        for slot in 0..lut_len {
            let bytes = slot << shift;
            while sizes[idx] < bytes {
                idx += 1;
            }
            #[allow(clippy::cast_possible_truncation)]
            lut.push(idx as u16);
        }

        Ok(Self {
            sizes: sizes.into_boxed_slice(),
            lut: lut.into_boxed_slice(),
            min_align_shift: shift,
            max_size,
            max_small_alignment: params.base_page_size,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Largest size served by the pools.
    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[inline]
    pub fn min_alignment(&self) -> usize {
        1 << self.min_align_shift
    }

    /// Alignments above this always take the OS path.
    #[inline]
    pub fn max_alignment_for_small_block(&self) -> usize {
        self.max_small_alignment
    }

    #[inline]
    pub fn block_size(&self, pool_index: usize) -> usize {
        self.sizes[pool_index]
    }

    pub fn block_sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Smallest class holding `size` bytes, or `None` above the threshold.
    #[inline]
    pub fn pool_index(&self, size: usize) -> Option<usize> {
        if size > self.max_size {
            return None;
        }
        let slot = (size + (1 << self.min_align_shift) - 1) >> self.min_align_shift;
        Some(usize::from(self.lut[slot]))
    }

    /// Class for `size` whose block size is a multiple of `align`.
    /// `None` means the request belongs on the OS path.
    #[inline]
    pub fn pool_for(&self, size: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        if align > self.max_small_alignment {
            return None;
        }
        let mut idx = self.pool_index(size.max(1))?;
        // Classes are dense; alignment above the minimum walks at most a few steps.
        while idx < self.sizes.len() {
            if self.sizes[idx].is_multiple_of(align) {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }

    /// Block size a small request would receive.
    #[inline]
    pub fn quantize(&self, size: usize, align: usize) -> Option<usize> {
        self.pool_for(size, align).map(|idx| self.sizes[idx])
    }
}
