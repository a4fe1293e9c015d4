//! tagalloc: a size-class slab allocator whose pages describe themselves.
//!
//! Small requests are carved out of single-page slabs, one chain of slabs
//! per size class. Requests above the top class get a dedicated mapping
//! with a 16-byte header. The first word of every page is a tag naming what
//! kind of page it is, so releasing a pointer needs only the pointer.
//!
//! Two surfaces:
//! - [`ThreadHeap`]: an explicit per-thread context over any
//!   [`PageProvider`].
//! - [`allocate`] / [`release`] / [`usable_size`]: the same operations on
//!   a lazily created heap bound to the calling thread.

mod directory;
pub mod global;
pub mod heap;
mod large;
pub mod page;
mod slab;
pub mod tag;

pub use global::{allocate, config, configure, release, thread_heap_id, thread_stats, usable_size};
pub use heap::ThreadHeap;
pub use large::LargeLedger;
pub use page::{CountingProvider, MmapProvider, PageProvider, os_page_size, page_base};
pub use tag::{PageKind, PageTag};

pub use tagalloc_core::{
    AllocError, AllocatorConfig, ClassStats, ConfigError, HeapStats, Occupancy, PageError,
    ReleaseError, SizeClassTable,
};
