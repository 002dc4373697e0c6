use std::fmt;

/// Address range owned by one size-class pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolRegion {
    pub base: usize,
    pub size: usize,
}

impl PoolRegion {
    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

/// Maps an address to the pool whose region holds it.
pub trait PoolLookup: Send + Sync + fmt::Debug {
    fn pool_index(&self, addr: usize) -> Option<usize>;

    fn strategy(&self) -> &'static str;
}

/// All pools share one contiguous reservation with a power-of-two stride:
/// `pool = (addr - base) >> shift`.
#[derive(Debug)]
pub struct ShiftLookup {
    base: usize,
    shift: u32,
    pool_count: usize,
}

impl ShiftLookup {
    pub fn new(base: usize, stride: usize, pool_count: usize) -> Self {
        debug_assert!(stride.is_power_of_two());
        Self {
            base,
            shift: stride.trailing_zeros(),
            pool_count,
        }
    }
}

impl PoolLookup for ShiftLookup {
    #[inline]
    fn pool_index(&self, addr: usize) -> Option<usize> {
        let idx = addr.checked_sub(self.base)? >> self.shift;
        (idx < self.pool_count).then_some(idx)
    }

    fn strategy(&self) -> &'static str {
        "shift"
    }
}

/// Pools live in unrelated reservations. Regions are kept sorted by base;
/// a guess from the average stride (`pool_search_div`) is refined by
/// stepping to the neighbor.
#[derive(Debug)]
pub struct SearchLookup {
    /// `(region, pool index)` sorted by base.
    regions: Box<[(PoolRegion, usize)]>,
    lowest: usize,
    pool_search_div: usize,
}

impl SearchLookup {
    pub fn new(regions: &[PoolRegion]) -> Self {
        let mut sorted: Vec<(PoolRegion, usize)> = regions.iter().copied().zip(0..).collect();
        sorted.sort_unstable_by_key(|(r, _)| r.base);
        let lowest = sorted.first().map_or(0, |(r, _)| r.base);
        let highest = sorted.last().map_or(0, |(r, _)| r.end());
        let pool_search_div = ((highest - lowest) / sorted.len().max(1)).max(1);
        Self {
            regions: sorted.into_boxed_slice(),
            lowest,
            pool_search_div,
        }
    }
}

impl PoolLookup for SearchLookup {
    fn pool_index(&self, addr: usize) -> Option<usize> {
        let last = self.regions.len().checked_sub(1)?;
        let mut guess = (addr.checked_sub(self.lowest)? / self.pool_search_div).min(last);
        while addr < self.regions[guess].0.base {
            guess = guess.checked_sub(1)?;
        }
        while addr >= self.regions[guess].0.end() {
            if guess == last {
                return None;
            }
            guess += 1;
        }
        let (region, pool) = self.regions[guess];
        region.contains(addr).then_some(pool)
    }

    fn strategy(&self) -> &'static str {
        "search"
    }
}

/// Pick the shift strategy when `regions` are laid out back to back with
/// one power-of-two stride, otherwise the search strategy.
pub fn select_lookup(regions: &[PoolRegion]) -> Box<dyn PoolLookup> {
    if let Some(first) = regions.first()
        && first.size.is_power_of_two()
        && regions
            .iter()
            .enumerate()
            .all(|(i, r)| r.size == first.size && r.base == first.base + i * first.size)
    {
        return Box::new(ShiftLookup::new(first.base, first.size, regions.len()));
    }
    Box::new(SearchLookup::new(regions))
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const MB: usize = 1 << 20;

    fn contiguous(count: usize) -> Vec<PoolRegion> {
        (0..count)
            .map(|i| PoolRegion {
                base: 0x7000_0000_0000 + i * 256 * MB,
                size: 256 * MB,
            })
            .collect()
    }

    #[test]
    fn test_contiguous_regions_pick_shift() {
        let regions = contiguous(44);
        let lookup = select_lookup(&regions);
        assert_eq!(lookup.strategy(), "shift");
        for (i, r) in regions.iter().enumerate() {
            assert_eq!(lookup.pool_index(r.base), Some(i));
            assert_eq!(lookup.pool_index(r.end() - 1), Some(i));
            assert_eq!(lookup.pool_index(r.base + r.size / 2), Some(i));
        }
        assert_eq!(lookup.pool_index(regions[0].base - 1), None);
        assert_eq!(lookup.pool_index(regions[43].end()), None);
        assert_eq!(lookup.pool_index(0), None);
    }

    #[test]
    fn test_scattered_regions_pick_search() {
        let mut regions = contiguous(8);
        // Separate reservations land wherever the OS puts them.
        regions.swap(2, 6);
        regions[3].base += 17 * 256 * MB;
        let lookup = select_lookup(&regions);
        assert_eq!(lookup.strategy(), "search");
        for (i, r) in regions.iter().enumerate() {
            assert_eq!(lookup.pool_index(r.base), Some(i), "pool {i} base");
            assert_eq!(lookup.pool_index(r.end() - 1), Some(i), "pool {i} end");
        }
        // The hole left by moving pool 3.
        assert_eq!(lookup.pool_index(0x7000_0000_0000 + 3 * 256 * MB), None);
        assert_eq!(lookup.pool_index(usize::MAX), None);
        assert_eq!(lookup.pool_index(1), None);
    }

    #[test]
    fn test_search_and_shift_agree() {
        let regions = contiguous(16);
        let shift = ShiftLookup::new(regions[0].base, 256 * MB, regions.len());
        let search = SearchLookup::new(&regions);
        let span = regions[15].end() - regions[0].base;
        for k in 0..4096 {
            let addr = regions[0].base - MB + k * (span / 4000);
            assert_eq!(shift.pool_index(addr), search.pool_index(addr), "{addr:#x}");
        }
    }

    #[test]
    fn test_uneven_sizes_use_search() {
        let regions = vec![
            PoolRegion { base: 0x1000_0000, size: 3 * MB },
            PoolRegion { base: 0x1030_0000, size: 3 * MB },
        ];
        let lookup = select_lookup(&regions);
        assert_eq!(lookup.strategy(), "search");
        assert_eq!(lookup.pool_index(0x1030_0000), Some(1));
        assert_eq!(lookup.pool_index(0x102F_FFFF), Some(0));
    }

    #[test]
    fn test_empty_regions() {
        let lookup = select_lookup(&[]);
        assert_eq!(lookup.pool_index(0x1234), None);
    }
}
