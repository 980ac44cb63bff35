//! Relocation set selection over pages from a live allocator.

use std::collections::HashSet;
use std::sync::Arc;

use rudo_heap::backend::SimulatedBackend;
use rudo_heap::{AllocationFlags, Collaborators, HeapConfig, PageAge, PageAllocator, PageType};

const M: usize = 1024 * 1024;
const G: usize = 2 * M;

fn allocator() -> PageAllocator {
    let backend = Arc::new(SimulatedBackend::new(256 * M, G));
    let config = HeapConfig::default()
        .with_capacities(64 * M, 64 * M, 256 * M)
        .with_heap_base_shift(36)
        .with_uncommit(false);
    PageAllocator::with_backend(&config, backend, Collaborators::default()).unwrap()
}

#[test]
fn test_select_and_free_empty_pages() {
    let allocator = allocator();
    let sizes = allocator.sizes();

    let mut pages: Vec<_> = (0..8)
        .map(|_| {
            allocator
                .alloc_page(PageType::Small, G, PageAge::EDEN, AllocationFlags::new())
                .unwrap()
        })
        .chain((0..2).map(|_| {
            allocator
                .alloc_page(PageType::Medium, sizes.medium, PageAge::OLD, AllocationFlags::new())
                .unwrap()
        }))
        .collect();

    // Pages 0..3 are empty, 3..6 sparse, 6..8 dense, medium pages sparse
    for page in &pages[3..6] {
        page.inc_live(16, G / 8);
    }
    for page in &pages[6..8] {
        page.inc_live(1000, G - G / 16);
    }
    for page in &pages[8..] {
        page.inc_live(64, M);
    }

    let empty: HashSet<usize> = {
        let mut selector = allocator.relocation_set_selector();
        for page in &pages {
            if page.live_bytes() == 0 {
                selector.register_empty_page(page);
            } else {
                selector.register_live_page(page);
            }
        }
        assert!(selector.should_free_empty_pages(3));
        let empty = selector.empty_pages().iter().map(|p| p.address()).collect();
        selector.clear_empty_pages();

        selector.select();
        let set = selector.relocation_set();
        assert_eq!(set.len(), 5);
        assert!(set[..2].iter().all(|p| p.page_type() == PageType::Medium));
        assert!(set[2..].iter().all(|p| p.live_bytes() == G / 8));
        assert_eq!(selector.not_selected(PageType::Small).len(), 2);

        let stats = selector.stats();
        assert_eq!(stats.group(PageType::Small, PageAge::EDEN).empty, 3 * G);
        assert_eq!(stats.group(PageType::Small, PageAge::EDEN).relocate, 3 * G / 8);
        assert_eq!(stats.total(PageType::Medium).npages_selected, 2);
        empty
    };

    let (freed, kept): (Vec<_>, Vec<_>) = pages
        .drain(..)
        .partition(|page| empty.contains(&page.address()));
    assert_eq!(freed.len(), 3);
    allocator.free_pages(freed);
    assert_eq!(allocator.used(), 5 * G + 2 * sizes.medium);

    allocator.free_pages(kept);
    assert_eq!(allocator.used(), 0);
}
