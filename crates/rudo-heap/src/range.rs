//! Half-open ranges over the virtual offset space.

use std::fmt;

/// A half-open range `[start, start + size)` of virtual offsets.
///
/// Offsets are relative to the heap base. The distinguished null range has
/// `start == usize::MAX` and size zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualRange {
    start: usize,
    size: usize,
}

impl VirtualRange {
    const INVALID: usize = usize::MAX;

    /// Creates a range starting at `start` covering `size` bytes.
    #[must_use]
    pub const fn new(start: usize, size: usize) -> Self {
        debug_assert!(start != Self::INVALID);
        Self { start, size }
    }

    /// The null range.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            start: Self::INVALID,
            size: 0,
        }
    }

    /// Returns `true` for the null range.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.start == Self::INVALID
    }

    /// First offset of the range.
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// One past the last offset of the range.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.size
    }

    /// Returns `true` if `other` lies entirely inside the range.
    #[must_use]
    pub const fn contains(&self, other: &Self) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    /// The leading `size` bytes.
    #[must_use]
    pub const fn first_part(&self, size: usize) -> Self {
        debug_assert!(size <= self.size);
        Self::new(self.start, size)
    }

    /// Everything from `offset` bytes in to the end.
    #[must_use]
    pub const fn last_part(&self, offset: usize) -> Self {
        debug_assert!(offset <= self.size);
        Self::new(self.start + offset, self.size - offset)
    }

    /// Removes and returns the leading `size` bytes.
    pub const fn shrink_from_front(&mut self, size: usize) -> Self {
        debug_assert!(size <= self.size);
        let front = Self::new(self.start, size);
        self.start += size;
        self.size -= size;
        front
    }

    /// Removes and returns the trailing `size` bytes.
    pub const fn shrink_from_back(&mut self, size: usize) -> Self {
        debug_assert!(size <= self.size);
        self.size -= size;
        Self::new(self.start + self.size, size)
    }

    /// Number of `granule`-sized units in the range.
    #[must_use]
    pub const fn granule_count(&self, granule: usize) -> usize {
        self.size / granule
    }
}

impl Default for VirtualRange {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "VirtualRange(null)")
        } else {
            write!(f, "VirtualRange({:#x}..{:#x})", self.start, self.end())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_range() {
        let range = VirtualRange::null();
        assert!(range.is_null());
        assert_eq!(range.size(), 0);
        assert_eq!(VirtualRange::default(), range);
    }

    #[test]
    fn test_shrink_from_both_ends() {
        let mut range = VirtualRange::new(100, 300);
        let front = range.shrink_from_front(100);
        assert_eq!(front, VirtualRange::new(100, 100));
        let back = range.shrink_from_back(50);
        assert_eq!(back, VirtualRange::new(350, 50));
        assert_eq!(range, VirtualRange::new(200, 150));
    }

    #[test]
    fn test_parts_and_containment() {
        let range = VirtualRange::new(0, 400);
        assert_eq!(range.first_part(100), VirtualRange::new(0, 100));
        assert_eq!(range.last_part(100), VirtualRange::new(100, 300));
        assert!(range.contains(&VirtualRange::new(399, 1)));
        assert!(!range.contains(&VirtualRange::new(399, 2)));
        assert_eq!(range.granule_count(100), 4);
    }
}
