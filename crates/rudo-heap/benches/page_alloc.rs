//! Benchmark: page allocation paths on the simulated backend.
//!
//! Measures the cached fast path, large page harvesting and relocation set
//! selection.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rudo_heap::backend::SimulatedBackend;
use rudo_heap::{
    AllocationFlags, Collaborators, HeapConfig, PageAge, PageAllocator, PageType,
    RelocationSetSelector,
};

const M: usize = 1024 * 1024;
const G: usize = 2 * M;

fn allocator(capacity: usize) -> PageAllocator {
    let config = HeapConfig::default()
        .with_capacities(capacity, capacity, capacity)
        .with_heap_base_shift(36)
        .with_uncommit(false);
    let backend = Arc::new(SimulatedBackend::new(capacity, G));
    PageAllocator::with_backend(&config, backend, Collaborators::default())
        .unwrap_or_else(|err| panic!("allocator setup failed: {err}"))
}

fn bench_small_alloc_free(c: &mut Criterion) {
    let allocator = allocator(64 * M);
    c.bench_function("small_page_alloc_free", |b| {
        b.iter(|| {
            let page = allocator
                .alloc_page(PageType::Small, G, PageAge::EDEN, AllocationFlags::new())
                .unwrap();
            black_box(page.address());
            allocator.free_page(page);
        });
    });
}

fn bench_small_batch(c: &mut Criterion) {
    let allocator = allocator(64 * M);
    c.bench_function("small_page_batch_32", |b| {
        b.iter(|| {
            let pages: Vec<_> = (0..32)
                .map(|_| {
                    allocator
                        .alloc_page(PageType::Small, G, PageAge::EDEN, AllocationFlags::new())
                        .unwrap()
                })
                .collect();
            black_box(pages.len());
            allocator.free_pages(pages);
        });
    });
}

fn bench_large_harvest(c: &mut Criterion) {
    let allocator = allocator(64 * M);
    c.bench_function("large_page_from_fragmented_cache", |b| {
        b.iter_batched(
            || {
                // Free every other small page so the cache is fragmented
                let pages: Vec<_> = (0..32)
                    .map(|_| {
                        allocator
                            .alloc_page(PageType::Small, G, PageAge::EDEN, AllocationFlags::new())
                            .unwrap()
                    })
                    .collect();
                let (held, freed): (Vec<_>, Vec<_>) =
                    pages.into_iter().enumerate().partition(|(i, _)| i % 2 == 0);
                allocator.free_pages(freed.into_iter().map(|(_, page)| page).collect());
                held.into_iter().map(|(_, page)| page).collect::<Vec<_>>()
            },
            |held| {
                let large = allocator
                    .alloc_page(PageType::Large, 16 * M, PageAge::OLD, AllocationFlags::new())
                    .unwrap();
                allocator.free_page(large);
                allocator.free_pages(held);
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_selector(c: &mut Criterion) {
    let allocator = allocator(256 * M);
    let sizes = allocator.sizes();
    let pages: Vec<_> = (0..100)
        .map(|i| {
            let page = allocator
                .alloc_page(PageType::Small, G, PageAge::EDEN, AllocationFlags::new())
                .unwrap();
            page.inc_live(i + 1, (i + 1) * G / 128);
            page
        })
        .collect();

    c.bench_function("relocation_set_select_100", |b| {
        b.iter(|| {
            let mut selector = RelocationSetSelector::new(sizes, 25.0);
            for page in &pages {
                selector.register_live_page(page);
            }
            selector.select();
            black_box(selector.relocation_set().len())
        });
    });

    allocator.free_pages(pages);
}

criterion_group!(
    benches,
    bench_small_alloc_free,
    bench_small_batch,
    bench_large_harvest,
    bench_selector
);
criterion_main!(benches);
