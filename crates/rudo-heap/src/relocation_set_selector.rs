//! Choosing which pages to compact.
//!
//! After marking, every page is registered with the selector either as an
//! empty page (no live bytes, freed in bulk) or as a live page. Live small
//! and medium pages with enough garbage become candidates. Each group
//! semi-sorts its candidates by live bytes, sparsest first, and selects the
//! longest prefix whose evacuation still frees a worthwhile share of pages.
//! Large pages hold a single object and are never selected.

use crate::globals::{PageSizes, PageType};
use crate::page::{Page, PageAge};

/// Buckets used by the semi-sort.
const NPARTITIONS_SHIFT: u32 = 11;
const NPARTITIONS: usize = 1 << NPARTITIONS_SHIFT;

/// Forwarding table entries needed to relocate `page`.
#[must_use]
pub fn forwarding_entries(page: &Page) -> usize {
    (page.live_objects() * 2).next_power_of_two()
}

fn percent_of(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let percent = part as f64 / total as f64 * 100.0;
    percent
}

// ============================================================================
// Statistics
// ============================================================================

/// Byte and page counts for one group and one page age.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectorGroupStats {
    /// Pages registered, empty or not.
    pub npages_candidates: usize,
    /// Total size of the registered pages.
    pub total: usize,
    /// Live bytes in the registered pages.
    pub live: usize,
    /// Size of the registered empty pages.
    pub empty: usize,
    /// Pages in the relocation set.
    pub npages_selected: usize,
    /// Live bytes to relocate.
    pub relocate: usize,
}

/// Selector statistics, per page type and age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationSetSelectorStats {
    small: [SelectorGroupStats; PageAge::COUNT],
    medium: [SelectorGroupStats; PageAge::COUNT],
    large: [SelectorGroupStats; PageAge::COUNT],
    has_relocatable_pages: bool,
}

impl RelocationSetSelectorStats {
    /// Statistics of `page_type` pages of `age`.
    #[must_use]
    pub const fn group(&self, page_type: PageType, age: PageAge) -> &SelectorGroupStats {
        match page_type {
            PageType::Small => &self.small[age.index()],
            PageType::Medium => &self.medium[age.index()],
            PageType::Large => &self.large[age.index()],
        }
    }

    /// Sums a page type's statistics over every age.
    #[must_use]
    pub fn total(&self, page_type: PageType) -> SelectorGroupStats {
        let stats = match page_type {
            PageType::Small => &self.small,
            PageType::Medium => &self.medium,
            PageType::Large => &self.large,
        };
        stats.iter().fold(SelectorGroupStats::default(), |acc, s| SelectorGroupStats {
            npages_candidates: acc.npages_candidates + s.npages_candidates,
            total: acc.total + s.total,
            live: acc.live + s.live,
            empty: acc.empty + s.empty,
            npages_selected: acc.npages_selected + s.npages_selected,
            relocate: acc.relocate + s.relocate,
        })
    }

    /// Returns `true` if any group had pages with enough garbage.
    #[must_use]
    pub const fn has_relocatable_pages(&self) -> bool {
        self.has_relocatable_pages
    }
}

// ============================================================================
// Group
// ============================================================================

#[derive(Debug)]
struct SelectorGroup<'a> {
    page_type: PageType,
    page_size: usize,
    object_size_limit: usize,
    fragmentation_limit_percent: f64,
    fragmentation_limit: usize,
    enabled: bool,
    live_pages: Vec<&'a Page>,
    not_selected: Vec<&'a Page>,
    nselected: usize,
    forwarding_entries: usize,
    stats: [SelectorGroupStats; PageAge::COUNT],
}

impl<'a> SelectorGroup<'a> {
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn new(
        page_type: PageType,
        page_size: usize,
        object_size_limit: usize,
        fragmentation_limit_percent: f64,
        enabled: bool,
    ) -> Self {
        Self {
            page_type,
            page_size,
            object_size_limit,
            fragmentation_limit_percent,
            fragmentation_limit: (page_size as f64 * fragmentation_limit_percent / 100.0) as usize,
            enabled,
            live_pages: Vec::new(),
            not_selected: Vec::new(),
            nselected: 0,
            forwarding_entries: 0,
            stats: [SelectorGroupStats::default(); PageAge::COUNT],
        }
    }

    fn is_selectable(&self) -> bool {
        self.enabled && self.page_type != PageType::Large
    }

    fn register_live_page(&mut self, page: &'a Page) {
        let stats = &mut self.stats[page.age().index()];
        stats.npages_candidates += 1;
        stats.total += page.size();
        stats.live += page.live_bytes();

        if self.is_selectable() && page.garbage_bytes() > self.fragmentation_limit {
            self.live_pages.push(page);
        } else {
            self.not_selected.push(page);
        }
    }

    fn register_empty_page(&mut self, page: &Page) {
        let stats = &mut self.stats[page.age().index()];
        stats.npages_candidates += 1;
        stats.total += page.size();
        stats.empty += page.size();
    }

    /// Stable bucket sort on live bytes with `NPARTITIONS` buckets.
    fn semi_sort(&mut self) {
        let partition_size = (self.page_size >> NPARTITIONS_SHIFT).max(1);
        let bucket = |page: &Page| (page.live_bytes() / partition_size).min(NPARTITIONS - 1);

        let mut starts = vec![0usize; NPARTITIONS];
        for page in &self.live_pages {
            starts[bucket(page)] += 1;
        }
        let mut next = 0;
        for start in &mut starts {
            let count = *start;
            *start = next;
            next += count;
        }

        let mut sorted: Vec<Option<&'a Page>> = vec![None; self.live_pages.len()];
        for &page in &self.live_pages {
            let slot = &mut starts[bucket(page)];
            sorted[*slot] = Some(page);
            *slot += 1;
        }
        self.live_pages = sorted.into_iter().flatten().collect();
    }

    /// Picks the longest prefix of the sorted candidates whose last addition
    /// still frees more than the fragmentation limit of the pages it adds.
    fn select_inner(&mut self) {
        let usable = self.page_size - self.object_size_limit;

        let mut selected_from = 0;
        let mut selected_to = 0;
        let mut selected_forwarding_entries = 0;

        let mut from_live_bytes = 0;
        let mut from_forwarding_entries = 0;

        for (index, page) in self.live_pages.iter().enumerate() {
            from_live_bytes += page.live_bytes();
            from_forwarding_entries += forwarding_entries(page);

            let from = index + 1;
            let to = from_live_bytes.div_ceil(usable);

            let diff_from = from - selected_from;
            let diff_to = to - selected_to;
            let diff_reclaimable = 100.0 - percent_of(diff_to, diff_from);
            if diff_reclaimable > self.fragmentation_limit_percent {
                selected_from = from;
                selected_to = to;
                selected_forwarding_entries = from_forwarding_entries;
            }
        }

        self.nselected = selected_from;
        self.forwarding_entries = selected_forwarding_entries;

        for page in &self.live_pages[..selected_from] {
            let stats = &mut self.stats[page.age().index()];
            stats.npages_selected += 1;
            stats.relocate += page.live_bytes();
        }
        self.not_selected.extend_from_slice(&self.live_pages[selected_from..]);
        self.live_pages.truncate(selected_from);
    }

    fn select(&mut self) {
        if !self.is_selectable() {
            return;
        }

        let candidates = self.live_pages.len();
        self.semi_sort();
        self.select_inner();

        crate::tracing::internal::log_relocation_set_selected(
            self.page_type,
            candidates,
            self.nselected,
            self.forwarding_entries,
        );
    }

    fn selected(&self) -> &[&'a Page] {
        &self.live_pages[..self.nselected.min(self.live_pages.len())]
    }
}

// ============================================================================
// RelocationSetSelector
// ============================================================================

/// Collects the pages of one collection and picks the relocation set.
///
/// # Example
///
/// ```
/// use rudo_heap::{Page, PageAge, PageSizes, PageType, RelocationSetSelector};
/// use rudo_heap::range::VirtualRange;
///
/// let granule = 2 << 20;
/// let sizes = PageSizes::new(granule, 64 << 20);
/// let pages: Vec<Page> = (0..4)
///     .map(|i| {
///         let vmem = VirtualRange::new(i * granule, granule);
///         Page::new(PageType::Small, vmem, vmem.start(), PageAge::EDEN, 1, 0)
///     })
///     .collect();
/// for page in &pages[..3] {
///     page.inc_live(10, granule / 8);
/// }
///
/// let mut selector = RelocationSetSelector::new(sizes, 25.0);
/// for page in &pages {
///     if page.live_bytes() == 0 {
///         selector.register_empty_page(page);
///     } else {
///         selector.register_live_page(page);
///     }
/// }
/// selector.select();
///
/// assert_eq!(selector.relocation_set().len(), 3);
/// assert_eq!(selector.empty_pages().len(), 1);
/// ```
#[derive(Debug)]
pub struct RelocationSetSelector<'a> {
    small: SelectorGroup<'a>,
    medium: SelectorGroup<'a>,
    large: SelectorGroup<'a>,
    empty_pages: Vec<&'a Page>,
}

impl<'a> RelocationSetSelector<'a> {
    /// Creates a selector for heaps with the given page sizes.
    ///
    /// A page is a candidate when more than `fragmentation_limit_percent`
    /// of it is garbage.
    #[must_use]
    pub fn new(sizes: PageSizes, fragmentation_limit_percent: f64) -> Self {
        Self {
            small: SelectorGroup::new(
                PageType::Small,
                sizes.small,
                sizes.object_size_limit_small,
                fragmentation_limit_percent,
                true,
            ),
            medium: SelectorGroup::new(
                PageType::Medium,
                sizes.medium,
                sizes.object_size_limit_medium,
                fragmentation_limit_percent,
                sizes.medium_enabled(),
            ),
            large: SelectorGroup::new(PageType::Large, 0, 0, fragmentation_limit_percent, false),
            empty_pages: Vec::new(),
        }
    }

    fn group_mut(&mut self, page_type: PageType) -> &mut SelectorGroup<'a> {
        match page_type {
            PageType::Small => &mut self.small,
            PageType::Medium => &mut self.medium,
            PageType::Large => &mut self.large,
        }
    }

    /// Registers a page that has live objects.
    pub fn register_live_page(&mut self, page: &'a Page) {
        self.group_mut(page.page_type()).register_live_page(page);
    }

    /// Registers a page without live objects.
    pub fn register_empty_page(&mut self, page: &'a Page) {
        self.group_mut(page.page_type()).register_empty_page(page);
        self.empty_pages.push(page);
    }

    /// Returns `true` once at least `bulk` empty pages are waiting.
    #[must_use]
    pub fn should_free_empty_pages(&self, bulk: usize) -> bool {
        !self.empty_pages.is_empty() && self.empty_pages.len() >= bulk
    }

    /// Empty pages registered since the last [`clear_empty_pages`].
    ///
    /// [`clear_empty_pages`]: Self::clear_empty_pages
    #[must_use]
    pub fn empty_pages(&self) -> &[&'a Page] {
        &self.empty_pages
    }

    /// Forgets the registered empty pages after the caller freed them.
    pub fn clear_empty_pages(&mut self) {
        self.empty_pages.clear();
    }

    /// Selects the relocation set of every group.
    pub fn select(&mut self) {
        self.medium.select();
        self.small.select();
        self.large.select();
    }

    /// Selected pages, medium pages first, each group sparsest first.
    #[must_use]
    pub fn relocation_set(&self) -> Vec<&'a Page> {
        self.medium
            .selected()
            .iter()
            .chain(self.small.selected())
            .copied()
            .collect()
    }

    /// Live pages of `page_type` that stay in place.
    #[must_use]
    pub fn not_selected(&self, page_type: PageType) -> &[&'a Page] {
        match page_type {
            PageType::Small => &self.small.not_selected,
            PageType::Medium => &self.medium.not_selected,
            PageType::Large => &self.large.not_selected,
        }
    }

    /// Forwarding table entries needed by the relocation set.
    #[must_use]
    pub const fn forwarding_entries(&self) -> usize {
        self.small.forwarding_entries + self.medium.forwarding_entries
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> RelocationSetSelectorStats {
        RelocationSetSelectorStats {
            small: self.small.stats,
            medium: self.medium.stats,
            large: self.large.stats,
            has_relocatable_pages: self.small.nselected + self.medium.nselected > 0
                || !self.small.live_pages.is_empty()
                || !self.medium.live_pages.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::M;
    use crate::range::VirtualRange;

    const G: usize = 2 * M;

    fn page(page_type: PageType, index: usize, size: usize, age: PageAge) -> Page {
        let vmem = VirtualRange::new(index * 64 * M, size);
        Page::new(page_type, vmem, vmem.start(), age, 1, 0)
    }

    fn small(index: usize, live: usize) -> Page {
        let page = page(PageType::Small, index, G, PageAge::EDEN);
        page.inc_live(live / 1024, live);
        page
    }

    fn addresses(pages: &[&Page]) -> Vec<usize> {
        pages.iter().map(|p| p.address()).collect()
    }

    #[test]
    fn test_dense_pages_are_not_candidates() {
        let sizes = PageSizes::new(G, 64 * M);
        let sparse = [small(0, G / 8), small(1, G / 4), small(2, 3 * G / 8)];
        let dense = small(3, G - G / 10);

        let mut selector = RelocationSetSelector::new(sizes, 25.0);
        for page in sparse.iter().chain([&dense]) {
            selector.register_live_page(page);
        }
        selector.select();

        assert_eq!(
            addresses(&selector.relocation_set()),
            addresses(&sparse.iter().collect::<Vec<_>>())
        );
        assert_eq!(addresses(selector.not_selected(PageType::Small)), vec![dense.address()]);
    }

    #[test]
    fn test_nothing_selected_without_gain() {
        // Each page is 62.5% live; five of them fill four target pages
        let sizes = PageSizes::new(G, 64 * M);
        let pages: Vec<Page> = (0..5).map(|i| small(i, 5 * G / 8)).collect();

        let mut selector = RelocationSetSelector::new(sizes, 25.0);
        for page in &pages {
            selector.register_live_page(page);
        }
        selector.select();

        assert!(selector.relocation_set().is_empty());
        assert_eq!(selector.not_selected(PageType::Small).len(), 5);
        assert_eq!(selector.forwarding_entries(), 0);
        assert_eq!(selector.stats().total(PageType::Small).npages_selected, 0);
    }

    #[test]
    fn test_candidates_are_semi_sorted() {
        let sizes = PageSizes::new(G, 64 * M);
        let pages = [small(0, G / 2), small(1, G / 16), small(2, G / 4)];

        let mut selector = RelocationSetSelector::new(sizes, 25.0);
        for page in &pages {
            selector.register_live_page(page);
        }
        selector.select();

        assert_eq!(
            addresses(&selector.relocation_set()),
            vec![pages[1].address(), pages[2].address(), pages[0].address()]
        );
    }

    #[test]
    fn test_medium_pages_come_first() {
        let sizes = PageSizes::new(G, 1024 * M);
        assert!(sizes.medium_enabled());

        let medium: Vec<Page> = (0..2)
            .map(|i| {
                let page = page(PageType::Medium, 10 + i, sizes.medium, PageAge::OLD);
                page.inc_live(100, M);
                page
            })
            .collect();
        let smalls = [small(0, G / 8), small(1, G / 8)];

        let mut selector = RelocationSetSelector::new(sizes, 25.0);
        for page in smalls.iter().chain(&medium) {
            selector.register_live_page(page);
        }
        selector.select();

        let set = selector.relocation_set();
        assert_eq!(set.len(), 4);
        assert!(set[..2].iter().all(|p| p.page_type() == PageType::Medium));
        assert!(set[2..].iter().all(|p| p.page_type() == PageType::Small));

        let stats = selector.stats();
        assert_eq!(stats.group(PageType::Medium, PageAge::OLD).npages_selected, 2);
        assert_eq!(stats.group(PageType::Medium, PageAge::OLD).relocate, 2 * M);
        assert!(stats.has_relocatable_pages());
    }

    #[test]
    fn test_large_pages_are_never_selected() {
        let sizes = PageSizes::new(G, 64 * M);
        let large = [
            page(PageType::Large, 0, 4 * G, PageAge::OLD),
            page(PageType::Large, 1, 4 * G, PageAge::OLD),
        ];
        for page in &large {
            page.inc_live(1, 64);
        }

        let mut selector = RelocationSetSelector::new(sizes, 25.0);
        for page in &large {
            selector.register_live_page(page);
        }
        selector.select();

        assert!(selector.relocation_set().is_empty());
        assert_eq!(selector.not_selected(PageType::Large).len(), 2);
        let stats = selector.stats();
        assert_eq!(stats.group(PageType::Large, PageAge::OLD).npages_candidates, 2);
        assert!(!stats.has_relocatable_pages());
    }

    #[test]
    fn test_forwarding_entries() {
        let sizes = PageSizes::new(G, 64 * M);
        let pages = [small(0, 0), small(1, 0)];
        pages[0].inc_live(10, 1024);
        pages[1].inc_live(100, 4096);

        assert_eq!(forwarding_entries(&pages[0]), 32);
        assert_eq!(forwarding_entries(&pages[1]), 256);

        let mut selector = RelocationSetSelector::new(sizes, 25.0);
        for page in &pages {
            selector.register_live_page(page);
        }
        selector.select();
        assert_eq!(selector.forwarding_entries(), 32 + 256);
    }

    #[test]
    fn test_empty_pages_bulk_threshold() {
        let sizes = PageSizes::new(G, 64 * M);
        let pages: Vec<Page> = (0..3)
            .map(|i| page(PageType::Small, i, G, PageAge::survivor(1)))
            .collect();

        let mut selector = RelocationSetSelector::new(sizes, 25.0);
        assert!(!selector.should_free_empty_pages(0));

        selector.register_empty_page(&pages[0]);
        selector.register_empty_page(&pages[1]);
        assert!(!selector.should_free_empty_pages(3));
        selector.register_empty_page(&pages[2]);
        assert!(selector.should_free_empty_pages(3));

        let stats = selector.stats();
        let age = stats.group(PageType::Small, PageAge::survivor(1));
        assert_eq!(age.empty, 3 * G);
        assert_eq!(age.npages_candidates, 3);

        selector.clear_empty_pages();
        assert!(selector.empty_pages().is_empty());
        assert!(!selector.should_free_empty_pages(1));
    }
}
