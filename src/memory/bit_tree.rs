/// Number of slabs tracked by a single [`BitTree`] segment.
pub(crate) const BITTREE_CAPACITY: usize = 16384;

/// Three-level bitset segment answering "lowest set index" in O(1).
///
/// Each `l1` bit summarizes one `l2` word; each `l0` bit summarizes one `l1`
/// word. A summary bit is set iff some bit below it is set.
pub(crate) struct BitTree {
    l0: u64,        // Covers 4 L1 words.
    l1: [u64; 4],   // 256 bits. Each bit covers 64 slabs.
    l2: [u64; 256], // 16384 bits. Each bit covers 1 slab.
}

impl BitTree {
    pub fn new() -> Self {
        Self {
            l0: 0,
            l1: [0; 4],
            l2: [0; 256],
        }
    }

    pub fn set(&mut self, index: usize) {
        let l2_word = index / 64;
        let l1_word = l2_word / 64;

        let mask2 = 1u64 << (index % 64);
        if (self.l2[l2_word] & mask2) == 0 {
            self.l2[l2_word] |= mask2;
            self.l1[l1_word] |= 1u64 << (l2_word % 64);
            self.l0 |= 1u64 << l1_word;
        }
    }

    pub fn clear(&mut self, index: usize) {
        let l2_word = index / 64;

        self.l2[l2_word] &= !(1u64 << (index % 64));
        if self.l2[l2_word] == 0 {
            let l1_word = l2_word / 64;
            self.l1[l1_word] &= !(1u64 << (l2_word % 64));
            if self.l1[l1_word] == 0 {
                self.l0 &= !(1u64 << l1_word);
            }
        }
    }

    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        self.l2[index / 64] & (1u64 << (index % 64)) != 0
    }

    pub fn find_first(&self) -> Option<usize> {
        if self.l0 == 0 {
            return None;
        }

        let l1_word = self.l0.trailing_zeros() as usize;
        let l1_bit = self.l1[l1_word].trailing_zeros() as usize;
        let l2_word = (l1_word * 64) + l1_bit;
        let l2_bit = self.l2[l2_word].trailing_zeros() as usize;

        Some((l2_word * 64) + l2_bit)
    }

    pub fn count(&self) -> usize {
        self.l2.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Fixed-length chain of [`BitTree`] segments.
///
/// Segment `i` covers indices `[i*16384 .. (i+1)*16384)`. The chain is sized
/// when the pool is built so nothing is allocated while a pool lock is held.
/// [`find_first`](BitTreeChain::find_first) prefers low indices, which keeps
/// live blocks packed toward the start of the reservation.
pub(crate) struct BitTreeChain {
    trees: Box<[BitTree]>,
    capacity: usize,
    search_cursor: usize,
}

impl BitTreeChain {
    pub fn with_capacity(capacity: usize) -> Self {
        let segments = capacity.div_ceil(BITTREE_CAPACITY).max(1);
        Self {
            trees: (0..segments).map(|_| BitTree::new()).collect(),
            capacity,
            search_cursor: segments,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.capacity, "bit {index} beyond capacity {}", self.capacity);
        let tree_idx = index / BITTREE_CAPACITY;
        self.trees[tree_idx].set(index % BITTREE_CAPACITY);
        if tree_idx < self.search_cursor {
            self.search_cursor = tree_idx;
        }
    }

    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.capacity, "bit {index} beyond capacity {}", self.capacity);
        self.trees[index / BITTREE_CAPACITY].clear(index % BITTREE_CAPACITY);
    }

    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        index < self.capacity && self.trees[index / BITTREE_CAPACITY].contains(index % BITTREE_CAPACITY)
    }

    /// Lowest set index. Segments below the cursor are known to be empty.
    pub fn find_first(&mut self) -> Option<usize> {
        for i in self.search_cursor..self.trees.len() {
            if let Some(local_idx) = self.trees[i].find_first() {
                self.search_cursor = i;
                return Some(i * BITTREE_CAPACITY + local_idx);
            }
            self.search_cursor = i + 1;
        }
        None
    }

    pub fn count(&self) -> usize {
        self.trees.iter().map(BitTree::count).sum()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_bit_tree() {
        let mut tree = BitTree::new();
        assert_eq!(tree.find_first(), None);

        tree.set(10);
        assert_eq!(tree.find_first(), Some(10));

        tree.set(5);
        assert_eq!(tree.find_first(), Some(5));

        tree.clear(5);
        assert_eq!(tree.find_first(), Some(10));

        tree.clear(10);
        assert_eq!(tree.find_first(), None);
    }

    #[test]
    fn test_bit_tree_high_indices() {
        let mut tree = BitTree::new();
        tree.set(BITTREE_CAPACITY - 1);
        assert_eq!(tree.find_first(), Some(BITTREE_CAPACITY - 1));
        tree.set(4096);
        assert_eq!(tree.find_first(), Some(4096));
        tree.clear(4096);
        tree.clear(BITTREE_CAPACITY - 1);
        assert_eq!(tree.find_first(), None);
    }

    #[test]
    fn test_bit_tree_boundary_64() {
        let mut tree = BitTree::new();
        tree.set(63);
        tree.set(64);
        assert_eq!(tree.find_first(), Some(63));
        tree.clear(63);
        assert_eq!(tree.find_first(), Some(64));
        assert!(!tree.contains(63));
        assert!(tree.contains(64));
    }

    #[test]
    fn test_bit_tree_double_set_and_clear() {
        let mut tree = BitTree::new();
        tree.set(7);
        tree.set(7);
        assert_eq!(tree.count(), 1);
        tree.clear(7);
        tree.clear(7);
        assert_eq!(tree.find_first(), None);
        assert_eq!(tree.count(), 0);
    }

    #[test]
    fn test_bit_tree_all_set() {
        let mut tree = BitTree::new();
        for i in 0..BITTREE_CAPACITY {
            tree.set(i);
        }
        for i in 0..BITTREE_CAPACITY {
            assert_eq!(tree.find_first(), Some(i));
            tree.clear(i);
        }
        assert_eq!(tree.find_first(), None);
    }

    #[test]
    fn test_chain_across_segments() {
        let mut chain = BitTreeChain::with_capacity(BITTREE_CAPACITY * 3);
        assert_eq!(chain.find_first(), None);

        chain.set(BITTREE_CAPACITY * 2 + 5);
        assert_eq!(chain.find_first(), Some(BITTREE_CAPACITY * 2 + 5));

        chain.set(BITTREE_CAPACITY + 1);
        assert_eq!(chain.find_first(), Some(BITTREE_CAPACITY + 1), "cursor moves back on set");

        chain.clear(BITTREE_CAPACITY + 1);
        assert_eq!(chain.find_first(), Some(BITTREE_CAPACITY * 2 + 5));

        chain.set(0);
        assert_eq!(chain.find_first(), Some(0));
        assert_eq!(chain.count(), 2);
    }

    #[test]
    fn test_chain_small_capacity() {
        let mut chain = BitTreeChain::with_capacity(4);
        assert_eq!(chain.capacity(), 4);
        chain.set(3);
        assert!(chain.contains(3));
        assert!(!chain.contains(4));
        assert_eq!(chain.find_first(), Some(3));
    }
}
