//! tagalloc core crate.
//!
//! Safe policy layer shared by the page engine and the ABI crate: the
//! size-class table, allocator configuration, the error taxonomy and
//! occupancy snapshots. Nothing in here touches raw memory.

pub mod config;
pub mod error;
pub mod size_class;
pub mod stats;

pub use config::{AllocatorConfig, LARGE_HEADER_BYTES, SLAB_HEADER_BYTES};
pub use error::{AllocError, ConfigError, PageError, ReleaseError};
pub use size_class::{DEFAULT_SIZE_CLASSES, SizeClassTable};
pub use stats::{ClassStats, HeapStats, Occupancy};
