//! Pages handed out by the page allocator.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::globals::{align_up, PageType};
use crate::range::VirtualRange;

// ============================================================================
// Generations and ages
// ============================================================================

/// Generation a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationId {
    /// Eden and survivor pages.
    Young,
    /// Tenured pages.
    Old,
}

impl GenerationId {
    /// Both generations, young first.
    pub const ALL: [Self; 2] = [Self::Young, Self::Old];

    /// Index for per-generation arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Young => 0,
            Self::Old => 1,
        }
    }
}

/// Number of collections a page's objects have survived.
///
/// Age 0 is eden, ages 1 through 14 are survivor ages and age 15 is old.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PageAge(u8);

impl PageAge {
    /// Freshly allocated young pages.
    pub const EDEN: Self = Self(0);
    /// Tenured pages.
    pub const OLD: Self = Self(15);
    /// Number of distinct ages.
    pub const COUNT: usize = 16;

    /// Survivor age `n`, `1 <= n <= 14`.
    #[must_use]
    pub const fn survivor(n: u8) -> Self {
        assert!(n >= 1 && n < Self::OLD.0, "Survivor age out of range");
        Self(n)
    }

    /// The age as an array index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Generation that owns pages of this age.
    #[must_use]
    pub const fn generation(self) -> GenerationId {
        if self.0 == Self::OLD.0 {
            GenerationId::Old
        } else {
            GenerationId::Young
        }
    }

    /// The age after surviving one more young collection.
    #[must_use]
    pub const fn next(self) -> Self {
        if self.0 >= Self::OLD.0 {
            Self::OLD
        } else {
            Self(self.0 + 1)
        }
    }
}

// ============================================================================
// Page
// ============================================================================

const OBJECT_ALIGNMENT: usize = 8;

/// A contiguous, committed and mapped heap region.
///
/// Pages are created by [`PageAllocator::alloc_page`] and returned with
/// [`PageAllocator::free_page`]. Object allocation bumps `top`; liveness is
/// recorded by the marker and read by the relocation set selector.
///
/// [`PageAllocator::alloc_page`]: crate::PageAllocator::alloc_page
/// [`PageAllocator::free_page`]: crate::PageAllocator::free_page
pub struct Page {
    page_type: PageType,
    vmem: VirtualRange,
    address: usize,
    age: PageAge,
    seqnum: u32,
    numa_id: usize,
    top: AtomicUsize,
    live_objects: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl Page {
    /// Creates page metadata for `vmem`, mapped at `address`.
    #[must_use]
    pub const fn new(
        page_type: PageType,
        vmem: VirtualRange,
        address: usize,
        age: PageAge,
        seqnum: u32,
        numa_id: usize,
    ) -> Self {
        Self {
            page_type,
            vmem,
            address,
            age,
            seqnum,
            numa_id,
            top: AtomicUsize::new(address),
            live_objects: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// Size class.
    #[must_use]
    pub const fn page_type(&self) -> PageType {
        self.page_type
    }

    /// Heap offsets covered by the page.
    #[must_use]
    pub const fn virtual_memory(&self) -> VirtualRange {
        self.vmem
    }

    /// First heap offset of the page.
    #[must_use]
    pub const fn start(&self) -> usize {
        self.vmem.start()
    }

    /// Size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.vmem.size()
    }

    /// Address of the first byte.
    #[must_use]
    pub const fn address(&self) -> usize {
        self.address
    }

    /// One past the last byte.
    #[must_use]
    pub const fn end_address(&self) -> usize {
        self.address + self.vmem.size()
    }

    /// Age of the objects on the page.
    #[must_use]
    pub const fn age(&self) -> PageAge {
        self.age
    }

    /// Owning generation.
    #[must_use]
    pub const fn generation(&self) -> GenerationId {
        self.age.generation()
    }

    /// Returns `true` for young pages.
    #[must_use]
    pub const fn is_young(&self) -> bool {
        matches!(self.generation(), GenerationId::Young)
    }

    /// Generation sequence number at allocation time.
    #[must_use]
    pub const fn seqnum(&self) -> u32 {
        self.seqnum
    }

    /// Partition the page was allocated from.
    #[must_use]
    pub const fn numa_id(&self) -> usize {
        self.numa_id
    }

    /// Moves the page to the old generation after in-place promotion.
    ///
    /// Pair with [`PageAllocator::promote_used`](crate::PageAllocator::promote_used).
    pub const fn promote(&mut self) {
        self.age = PageAge::OLD;
    }

    /// Returns `true` if `address` lies inside the page.
    #[must_use]
    pub const fn contains(&self, address: usize) -> bool {
        address >= self.address && address < self.end_address()
    }

    // ---- object allocation ----------------------------------------------

    /// Current allocation top.
    #[must_use]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Bytes allocated so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.top() - self.address
    }

    /// Bump-allocates `size` bytes, returning the object address.
    ///
    /// Safe to call concurrently.
    pub fn alloc_object(&self, size: usize) -> Option<usize> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        let end = self.end_address();
        self.top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| {
                top.checked_add(size).filter(|&new_top| new_top <= end)
            })
            .ok()
    }

    /// Gives back the most recent allocation if nothing was allocated since.
    pub fn undo_alloc_object(&self, address: usize, size: usize) -> bool {
        let size = align_up(size, OBJECT_ALIGNMENT);
        self.top
            .compare_exchange(address + size, address, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ---- liveness -------------------------------------------------------

    /// Records `objects` live objects totalling `bytes`.
    pub fn inc_live(&self, objects: usize, bytes: usize) {
        self.live_objects.fetch_add(objects, Ordering::Relaxed);
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Clears liveness before marking.
    pub fn reset_live(&self) {
        self.live_objects.store(0, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
    }

    /// Number of live objects found by the last mark.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.live_objects.load(Ordering::Relaxed)
    }

    /// Live bytes found by the last mark.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Reclaimable bytes according to the last mark.
    #[must_use]
    pub fn garbage_bytes(&self) -> usize {
        self.size().saturating_sub(self.live_bytes())
    }

    /// Large pages hold a single object and are never relocated.
    #[must_use]
    pub const fn is_relocatable(&self) -> bool {
        !matches!(self.page_type, PageType::Large)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("type", &self.page_type)
            .field("vmem", &self.vmem)
            .field("address", &format_args!("{:#x}", self.address))
            .field("age", &self.age)
            .field("numa_id", &self.numa_id)
            .field("used", &self.used())
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::M;

    fn page() -> Page {
        Page::new(
            PageType::Small,
            VirtualRange::new(4 * M, 2 * M),
            0x1000_0000,
            PageAge::EDEN,
            1,
            0,
        )
    }

    #[test]
    fn test_bump_allocation_stops_at_end() {
        let page = page();
        let first = page.alloc_object(10).unwrap();
        assert_eq!(first, page.address());
        assert_eq!(page.used(), 16);

        assert!(page.alloc_object(2 * M).is_none());
        assert!(page.alloc_object(2 * M - 16).is_some());
        assert!(page.alloc_object(1).is_none());
    }

    #[test]
    fn test_undo_only_last_allocation() {
        let page = page();
        let a = page.alloc_object(32).unwrap();
        let b = page.alloc_object(32).unwrap();
        assert!(!page.undo_alloc_object(a, 32));
        assert!(page.undo_alloc_object(b, 32));
        assert_eq!(page.top(), b);
    }

    #[test]
    fn test_liveness() {
        let page = page();
        page.inc_live(3, 300);
        page.inc_live(1, 100);
        assert_eq!(page.live_objects(), 4);
        assert_eq!(page.live_bytes(), 400);
        assert_eq!(page.garbage_bytes(), 2 * M - 400);
        page.reset_live();
        assert_eq!(page.live_bytes(), 0);
    }

    #[test]
    fn test_ages_and_generations() {
        assert_eq!(PageAge::EDEN.generation(), GenerationId::Young);
        assert_eq!(PageAge::survivor(14).next(), PageAge::OLD);
        assert_eq!(PageAge::OLD.next(), PageAge::OLD);
        assert_eq!(PageAge::OLD.generation(), GenerationId::Old);
        assert_eq!(PageAge::OLD.index(), PageAge::COUNT - 1);
    }

    #[test]
    fn test_promote_moves_to_old() {
        let mut page = page();
        assert!(page.is_young());
        page.promote();
        assert_eq!(page.generation(), GenerationId::Old);
    }
}
