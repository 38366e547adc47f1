//! Two-level bitmap index over segregated free lists.
//!
//! A bucket `(fli, sli)` holds the head of one size-class free list. The
//! first-level bitmap marks which first-level classes have any non-empty
//! bucket; each first-level class has a second-level bitmap marking its
//! non-empty buckets. "Is there a block at least this big" is therefore
//! always answerable with at most two 64-bit scans.
//!
//! The index is pure bookkeeping: it never touches block metadata and has
//! no knowledge of the physical layout of the managed range.

use crate::addr::Address;

/// Subdivisions of the first level.
pub const FIRST_LEVEL_INDEX_COUNT: usize = 64;

/// Subdivisions of the second level.
pub const SECOND_LEVEL_INDEX_COUNT: usize = 64;

/// `log2(SECOND_LEVEL_INDEX_COUNT)`.
pub const SECOND_LEVEL_INDEX_COUNT_LOG2: u32 = SECOND_LEVEL_INDEX_COUNT.trailing_zeros();

/// Index of the highest set bit, `floor(log2(value))`.
///
/// # Panics
///
/// Panics on zero; callers scan only maps they know to be non-empty.
#[must_use]
pub fn highest_one_bit(value: u64) -> u32 {
    assert!(value != 0, "bit scan over an empty map");
    63 - value.leading_zeros()
}

/// Index of the lowest set bit.
///
/// # Panics
///
/// Panics on zero; callers scan only maps they know to be non-empty.
#[must_use]
pub fn lowest_one_bit(value: u64) -> u32 {
    assert!(value != 0, "bit scan over an empty map");
    value.trailing_zeros()
}

/// First-level bitmap, second-level bitmaps and the table of free-list
/// heads.
///
/// Bitmap bits are derived, never independently settable: installing a head
/// marks the bucket non-empty, replacing the head with `None` marks it
/// empty (second level first, then the first level once its second-level
/// map drains).
pub struct BucketIndex {
    first_level: u64,
    second_level: [u64; FIRST_LEVEL_INDEX_COUNT],
    heads: Box<[[Option<Address>; SECOND_LEVEL_INDEX_COUNT]]>,
}

impl BucketIndex {
    /// Creates an index with every bucket empty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            first_level: 0,
            second_level: [0; FIRST_LEVEL_INDEX_COUNT],
            heads: vec![[None; SECOND_LEVEL_INDEX_COUNT]; FIRST_LEVEL_INDEX_COUNT]
                .into_boxed_slice(),
        }
    }

    /// Head of bucket `(fli, sli)`, if any.
    #[must_use]
    pub fn head(&self, fli: usize, sli: usize) -> Option<Address> {
        self.heads[fli][sli]
    }

    /// Pure overwrite of a bucket head; bitmap bits are untouched.
    pub fn set_head(&mut self, fli: usize, sli: usize, head: Option<Address>) {
        self.heads[fli][sli] = head;
    }

    /// Makes `addr` the bucket head and marks the bucket non-empty on both
    /// bitmap levels.
    pub fn install_head(&mut self, fli: usize, sli: usize, addr: Address) {
        self.heads[fli][sli] = Some(addr);
        self.second_level[fli] |= 1 << sli;
        self.first_level |= 1 << fli;
    }

    /// Replaces the bucket head after its previous head was unlinked; when
    /// the bucket becomes empty, clears the second-level bit and, if that
    /// drained the second-level map, the first-level bit.
    pub fn replace_head(&mut self, fli: usize, sli: usize, next: Option<Address>) {
        self.heads[fli][sli] = next;
        if next.is_none() {
            self.second_level[fli] &= !(1 << sli);
            if self.second_level[fli] == 0 {
                self.first_level &= !(1 << fli);
            }
        }
    }

    /// Smallest non-empty bucket at or above `(fli, sli)`.
    ///
    /// Masks the second-level map to bits `>= sli`; if empty, masks the
    /// first-level map to bits `> fli` and descends into the lowest set
    /// class. This two-step scan is the TLSF good-fit guarantee.
    #[must_use]
    pub fn search_at_or_above(&self, fli: usize, sli: usize) -> Option<(usize, usize)> {
        let mut fli = fli;
        let mut second = self.second_level[fli] & (!0u64 << sli);
        if second == 0 {
            let first = self.first_level & (!0u64).checked_shl(fli as u32 + 1).unwrap_or(0);
            if first == 0 {
                return None;
            }
            fli = lowest_one_bit(first) as usize;
            second = self.second_level[fli];
        }
        Some((fli, lowest_one_bit(second) as usize))
    }

    /// Bucket holding the biggest free blocks: the highest set first-level
    /// bit, then the lowest set bit of that second-level map.
    #[must_use]
    pub fn biggest(&self) -> Option<(usize, usize)> {
        if self.first_level == 0 {
            return None;
        }
        let fli = highest_one_bit(self.first_level) as usize;
        let sli = lowest_one_bit(self.second_level[fli]) as usize;
        Some((fli, sli))
    }
}

impl Default for BucketIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_scans() {
        assert_eq!(highest_one_bit(1), 0);
        assert_eq!(highest_one_bit(3), 1);
        assert_eq!(highest_one_bit(1 << 63), 63);
        assert_eq!(lowest_one_bit(1), 0);
        assert_eq!(lowest_one_bit(0b1100), 2);
    }

    #[test]
    fn test_install_sets_both_levels() {
        let mut index = BucketIndex::new();
        assert_eq!(index.head(3, 7), None);

        index.install_head(3, 7, Address::new(100));
        assert_eq!(index.head(3, 7), Some(Address::new(100)));
        assert_eq!(index.search_at_or_above(3, 7), Some((3, 7)));
        assert_eq!(index.search_at_or_above(0, 0), Some((3, 7)));
    }

    #[test]
    fn test_replace_with_some_keeps_bits() {
        let mut index = BucketIndex::new();
        index.install_head(2, 5, Address::new(10));
        index.replace_head(2, 5, Some(Address::new(20)));
        assert_eq!(index.head(2, 5), Some(Address::new(20)));
        assert_eq!(index.search_at_or_above(2, 5), Some((2, 5)));
    }

    #[test]
    fn test_replace_with_none_clears_bits() {
        let mut index = BucketIndex::new();
        index.install_head(2, 5, Address::new(10));
        index.install_head(2, 9, Address::new(11));

        index.replace_head(2, 5, None);
        // Second-level bit gone, first-level bit survives via (2, 9).
        assert_eq!(index.search_at_or_above(2, 0), Some((2, 9)));

        index.replace_head(2, 9, None);
        assert_eq!(index.search_at_or_above(0, 0), None);
        assert_eq!(index.biggest(), None);
    }

    #[test]
    fn test_set_head_does_not_touch_bits() {
        let mut index = BucketIndex::new();
        index.set_head(1, 1, Some(Address::new(5)));
        // The head is visible but the bucket is still "empty" to searches.
        assert_eq!(index.head(1, 1), Some(Address::new(5)));
        assert_eq!(index.search_at_or_above(0, 0), None);
    }

    #[test]
    fn test_search_skips_smaller_buckets() {
        let mut index = BucketIndex::new();
        index.install_head(1, 3, Address::new(1));
        index.install_head(4, 60, Address::new(2));

        // Same first level, higher second level required.
        assert_eq!(index.search_at_or_above(1, 4), Some((4, 60)));
        // Above everything.
        assert_eq!(index.search_at_or_above(4, 61), None);
        // Exact hit.
        assert_eq!(index.search_at_or_above(1, 3), Some((1, 3)));
    }

    #[test]
    fn test_search_at_top_edge() {
        let mut index = BucketIndex::new();
        index.install_head(63, 63, Address::new(9));
        assert_eq!(index.search_at_or_above(63, 63), Some((63, 63)));
        index.replace_head(63, 63, None);
        assert_eq!(index.search_at_or_above(63, 63), None);
    }

    #[test]
    fn test_biggest_prefers_highest_first_level() {
        let mut index = BucketIndex::new();
        index.install_head(2, 40, Address::new(1));
        index.install_head(5, 3, Address::new(2));
        index.install_head(5, 30, Address::new(3));
        assert_eq!(index.biggest(), Some((5, 3)));
    }
}
