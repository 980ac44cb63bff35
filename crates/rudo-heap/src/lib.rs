//! A concurrent, region-based page allocator for a generational,
//! colored-pointer garbage collector.
//!
//! `rudo-heap` manages a large reserved range of virtual address space and a
//! pool of physical backing memory, and hands out fixed-size *pages*
//! (small, medium and large) to a collector and its mutators.
//!
//! # Features
//!
//! - **Colored pointers**: metadata bits above a configurable heap base, with
//!   good/bad masks flipped once per collection phase ([`address`]).
//! - **NUMA partitions**: capacity, address space and a cache of mapped,
//!   unused memory per node ([`partition`], [`mapped_cache`]).
//! - **Harvesting**: large pages can be assembled from the backing of
//!   several fragmented cache entries without committing new memory.
//! - **Stalls**: allocations that cannot be served block until a page is
//!   freed or the collector declares out of memory.
//! - **Background work**: deferred unmapping ([`unmapper`]) and paced
//!   uncommit of memory that stayed unused for a configurable delay.
//! - **Relocation set selection** from per-page liveness
//!   ([`relocation_set_selector`]).
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use rudo_heap::backend::SimulatedBackend;
//! use rudo_heap::{AllocationFlags, Collaborators, HeapConfig, PageAge, PageAllocator, PageType};
//!
//! const M: usize = 1024 * 1024;
//!
//! let config = HeapConfig::default()
//!     .with_capacities(8 * M, 8 * M, 32 * M)
//!     .with_heap_base_shift(36);
//! let backend = Arc::new(SimulatedBackend::new(32 * M, 2 * M));
//! let allocator = PageAllocator::with_backend(&config, backend, Collaborators::default())?;
//!
//! let page = allocator
//!     .alloc_page(PageType::Small, 2 * M, PageAge::EDEN, AllocationFlags::new())
//!     .unwrap();
//! let object = page.alloc_object(64).unwrap();
//! assert!(page.contains(object));
//!
//! allocator.free_page(page);
//! # Ok::<(), rudo_heap::HeapError>(())
//! ```
//!
//! Use [`PageAllocator::new`] to run on the operating system backend.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("rudo-heap requires a 64-bit target");

pub mod address;
pub mod backend;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod globals;
pub mod mapped_cache;
pub mod numa;
pub mod page;
mod page_allocator;
pub mod partition;
pub mod physical_memory;
pub mod range;
pub mod range_map;
pub mod relocation_set_selector;
pub mod safe_delete;
mod tracing;
pub mod unmapper;
pub mod virtual_memory;

// Re-export public API
pub use address::{ColoredPointer, PointerColors};
pub use collaborators::{
    CollectionDriver, Collaborators, GcCause, GcRequest, MemoryTracker, SuspendibleThreadSet,
};
pub use config::HeapConfig;
pub use error::{AllocError, HeapError};
pub use globals::{PageSizes, PageType};
pub use page::{GenerationId, Page, PageAge};
pub use page_allocator::{AllocationFlags, PageAllocator, PageAllocatorStats};
pub use relocation_set_selector::{
    RelocationSetSelector, RelocationSetSelectorStats, SelectorGroupStats,
};
