//! Heap-wide constants and page size classes.

// ============================================================================
// Constants
// ============================================================================

/// One mebibyte.
pub const M: usize = 1024 * 1024;

/// Default granule shift (2MB granules).
pub const DEFAULT_GRANULE_SIZE_SHIFT: u32 = 21;

/// Default granule size: the minimum unit of virtual and physical memory
/// the allocator manages.
pub const DEFAULT_GRANULE_SIZE: usize = 1 << DEFAULT_GRANULE_SIZE_SHIFT;

/// Upper bound for the medium page size.
pub const MAX_MEDIUM_PAGE_SIZE: usize = 32 * M;

/// Objects up to `page size / OBJECT_SIZE_LIMIT_DIVISOR` fit a page class.
const OBJECT_SIZE_LIMIT_DIVISOR: usize = 8;

/// Rounds `value` up to a multiple of `alignment` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to a multiple of `alignment` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Returns `true` if `value` is a multiple of `alignment` (a power of two).
#[inline]
#[must_use]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// Largest power of two `<= value`. `value` must be non-zero.
#[inline]
const fn round_down_power_of_2(value: usize) -> usize {
    1 << (usize::BITS - 1 - value.leading_zeros())
}

// ============================================================================
// PageType
// ============================================================================

/// Size class of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    /// One granule, holding small objects.
    Small,
    /// Several granules, holding medium objects.
    Medium,
    /// A dedicated page for one large object.
    Large,
}

impl PageType {
    /// Pages of this type are placed at low virtual addresses.
    #[must_use]
    pub const fn prefers_low_address(self) -> bool {
        !matches!(self, Self::Large)
    }
}

// ============================================================================
// PageSizes
// ============================================================================

/// Page and object size limits derived from the granule and max capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSizes {
    /// Granule size in bytes.
    pub granule: usize,
    /// Size of a small page.
    pub small: usize,
    /// Size of a medium page.
    pub medium: usize,
    /// Largest object placed in a small page.
    pub object_size_limit_small: usize,
    /// Largest object placed in a medium page.
    pub object_size_limit_medium: usize,
}

impl PageSizes {
    /// Computes page sizes for a heap of `max_capacity` bytes.
    ///
    /// The medium page is about 3% of the max capacity, rounded down to a
    /// power of two and clamped to `[granule, MAX_MEDIUM_PAGE_SIZE]`. When it
    /// collapses to the small page size, medium pages are disabled.
    #[must_use]
    pub const fn new(granule: usize, max_capacity: usize) -> Self {
        let target = max_capacity / 32;
        let mut medium = if target == 0 {
            granule
        } else {
            round_down_power_of_2(target)
        };
        if medium > MAX_MEDIUM_PAGE_SIZE {
            medium = MAX_MEDIUM_PAGE_SIZE;
        }
        if medium < granule {
            medium = granule;
        }

        Self {
            granule,
            small: granule,
            medium,
            object_size_limit_small: granule / OBJECT_SIZE_LIMIT_DIVISOR,
            object_size_limit_medium: medium / OBJECT_SIZE_LIMIT_DIVISOR,
        }
    }

    /// Returns `true` if medium pages are distinct from small pages.
    #[must_use]
    pub const fn medium_enabled(&self) -> bool {
        self.medium > self.small
    }

    /// Returns the page size used for a page of `page_type` holding an
    /// object of `object_size` bytes.
    #[must_use]
    pub const fn page_size_for(&self, page_type: PageType, object_size: usize) -> usize {
        match page_type {
            PageType::Small => self.small,
            PageType::Medium => self.medium,
            PageType::Large => align_up(object_size, self.granule),
        }
    }

    /// Returns the page type that holds an object of `object_size` bytes.
    #[must_use]
    pub const fn page_type_for(&self, object_size: usize) -> PageType {
        if object_size <= self.object_size_limit_small {
            PageType::Small
        } else if self.medium_enabled() && object_size <= self.object_size_limit_medium {
            PageType::Medium
        } else {
            PageType::Large
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(8191, 4096), 4096);
        assert!(is_aligned(2 * M, DEFAULT_GRANULE_SIZE));
        assert!(!is_aligned(3 * M, DEFAULT_GRANULE_SIZE));
    }

    #[test]
    fn test_page_sizes_one_gigabyte() {
        let sizes = PageSizes::new(DEFAULT_GRANULE_SIZE, 1024 * M);
        assert_eq!(sizes.small, 2 * M);
        assert_eq!(sizes.medium, 32 * M);
        assert!(sizes.medium_enabled());
        assert_eq!(sizes.object_size_limit_small, 256 * 1024);
        assert_eq!(sizes.object_size_limit_medium, 4 * M);
    }

    #[test]
    fn test_medium_disabled_for_tiny_heap() {
        let sizes = PageSizes::new(DEFAULT_GRANULE_SIZE, 32 * M);
        assert_eq!(sizes.medium, sizes.small);
        assert!(!sizes.medium_enabled());
        assert_eq!(sizes.page_type_for(512 * 1024), PageType::Large);
    }

    #[test]
    fn test_page_type_routing() {
        let sizes = PageSizes::new(DEFAULT_GRANULE_SIZE, 4096 * M);
        assert_eq!(sizes.page_type_for(64), PageType::Small);
        assert_eq!(sizes.page_type_for(M), PageType::Medium);
        assert_eq!(sizes.page_type_for(16 * M), PageType::Large);
        assert_eq!(sizes.page_size_for(PageType::Large, 5 * M), 6 * M);
    }
}
