//! Integration tests for the heap tracing feature.
//!
//! A recording layer captures span names and event messages emitted on the
//! test thread. Background threads are not covered by the scoped subscriber.

#![cfg(feature = "tracing")]

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use rudo_heap::backend::SimulatedBackend;
use rudo_heap::{
    AllocError, AllocationFlags, Collaborators, HeapConfig, PageAge, PageAllocator, PageType,
};

const M: usize = 1024 * 1024;
const G: usize = 2 * M;

#[derive(Clone, Default)]
struct Recorder {
    spans: Arc<Mutex<Vec<String>>>,
    messages: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn has_span(&self, name: &str) -> bool {
        self.spans.lock().iter().any(|span| span == name)
    }

    fn count(&self, message: &str) -> usize {
        self.messages.lock().iter().filter(|m| *m == message).count()
    }
}

struct MessageVisitor(Option<String>);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for Recorder {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        self.spans.lock().push(attrs.metadata().name().to_string());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(None);
        event.record(&mut visitor);
        if let Some(message) = visitor.0 {
            self.messages.lock().push(message);
        }
    }
}

fn with_recorder<T>(f: impl FnOnce() -> T) -> (Recorder, T) {
    let recorder = Recorder::default();
    let subscriber = tracing_subscriber::registry().with(recorder.clone());
    let result = tracing::subscriber::with_default(subscriber, f);
    (recorder, result)
}

fn config(min: usize, initial: usize, max: usize) -> HeapConfig {
    HeapConfig::default()
        .with_capacities(min, initial, max)
        .with_heap_base_shift(36)
        .with_uncommit(false)
}

#[test]
fn test_initialization_is_traced() {
    let backend = Arc::new(SimulatedBackend::new(16 * M, G));
    let (recorder, allocator) = with_recorder(|| {
        PageAllocator::with_backend(&config(8 * M, 8 * M, 16 * M), backend, Collaborators::default())
    });

    assert!(allocator.is_ok());
    assert!(recorder.has_span("heap_initialize"));
    assert_eq!(recorder.count("address_space_reserved"), 1);
    assert_eq!(recorder.count("address_space_degraded"), 0);
    assert!(recorder.count("capacity_increase") >= 1);
}

#[test]
fn test_page_alloc_and_free_events() {
    let backend = Arc::new(SimulatedBackend::new(16 * M, G));
    let allocator =
        PageAllocator::with_backend(&config(8 * M, 8 * M, 16 * M), backend, Collaborators::default())
            .unwrap();

    let (recorder, ()) = with_recorder(|| {
        let pages: Vec<_> = (0..3)
            .map(|_| {
                allocator
                    .alloc_page(PageType::Small, G, PageAge::EDEN, AllocationFlags::new())
                    .unwrap()
            })
            .collect();
        allocator.free_pages(pages);
    });

    assert_eq!(recorder.count("page_alloc"), 3);
    assert_eq!(recorder.count("page_free"), 3);
    assert_eq!(recorder.count("allocation_stall_start"), 0);
}

#[test]
fn test_commit_failure_lowers_max_capacity() {
    let backend = Arc::new(SimulatedBackend::new(16 * M, G));
    let allocator = PageAllocator::with_backend(
        &config(2 * M, 2 * M, 16 * M),
        backend.clone(),
        Collaborators::default(),
    )
    .unwrap();
    backend.set_commit_limit(Some(4 * M));

    let (recorder, result) = with_recorder(|| {
        let flags = AllocationFlags::new().non_blocking();
        let first = allocator.alloc_page(PageType::Small, G, PageAge::EDEN, flags)?;
        let second = allocator.alloc_page(PageType::Small, G, PageAge::EDEN, flags)?;
        let third = allocator.alloc_page(PageType::Small, G, PageAge::EDEN, flags);
        allocator.free_pages(vec![first, second]);
        third.map(|page| allocator.free_page(page))
    });

    assert!(matches!(result, Err(AllocError::WouldStall)));
    assert_eq!(recorder.count("max_capacity_lowered"), 1);
    assert_eq!(allocator.current_max_capacity(), 4 * M);
    assert_eq!(allocator.capacity(), 4 * M);
    assert!(allocator.check_capacity_invariants());
}
