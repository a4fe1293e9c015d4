//! Error taxonomy.
//!
//! Allocation failures and rejected releases are ordinary values returned to
//! the immediate caller. A release whose page tag matches no known kind is
//! not represented here: the dispatcher treats it as fatal and aborts.

use thiserror::Error;

fn errno_suffix(errno: &Option<i32>) -> String {
    match errno {
        Some(code) => format!(" (errno {code})"),
        None => String::new(),
    }
}

/// Failure to serve an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The page provider could not supply the region, or the request size
    /// cannot be represented once header and page rounding are added.
    #[error("out of memory serving {requested} bytes{}", errno_suffix(.errno))]
    Exhausted {
        requested: usize,
        /// OS error code when the provider reported one; `None` for a size
        /// overflow.
        errno: Option<i32>,
    },
}

impl AllocError {
    /// Exhaustion caused by the page provider.
    #[must_use]
    pub fn from_page(requested: usize, err: PageError) -> Self {
        Self::Exhausted {
            requested,
            errno: err.errno,
        }
    }

    /// Exhaustion caused by arithmetic overflow of the request size.
    #[must_use]
    pub const fn overflow(requested: usize) -> Self {
        Self::Exhausted {
            requested,
            errno: None,
        }
    }

    /// Every allocation failure is a form of resource exhaustion.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// A release the allocator refused without touching any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReleaseError {
    /// The slab behind `addr` belongs to another thread heap.
    #[error("{addr:#x} belongs to heap {owner}, released from heap {caller}")]
    ForeignThread { addr: usize, owner: u64, caller: u64 },
    /// The slot behind `addr` is already on its slab's free list.
    #[error("{addr:#x} released twice")]
    DoubleRelease { addr: usize },
    /// `addr` is inside a known page but is not an address this allocator
    /// handed out (header bytes, mid-slot, or past the payload).
    #[error("{addr:#x} is not an allocation start")]
    Misaligned { addr: usize },
}

impl ReleaseError {
    /// The rejected address.
    #[must_use]
    pub const fn addr(&self) -> usize {
        match *self {
            Self::ForeignThread { addr, .. }
            | Self::DoubleRelease { addr }
            | Self::Misaligned { addr } => addr,
        }
    }
}

/// Failure reported by a page provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("page provider failed for {len} bytes{}", errno_suffix(.errno))]
pub struct PageError {
    /// Length of the region that was requested or returned.
    pub len: usize,
    /// OS error code, when there is one.
    pub errno: Option<i32>,
}

/// Invalid allocator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("size-class table is empty")]
    EmptyClasses,
    #[error("size class {bound} is below the minimum slot of {min} bytes")]
    ClassTooSmall { bound: usize, min: usize },
    #[error("size classes must be strictly ascending ({previous} then {next})")]
    UnsortedClasses { previous: usize, next: usize },
    #[error("too many size classes ({count})")]
    TooManyClasses { count: usize },
    #[error("page size {page_size} is not a power of two")]
    PageSizeNotPowerOfTwo { page_size: usize },
    #[error("page size {page_size} is below the OS page size {os}")]
    PageSizeBelowOs { page_size: usize, os: usize },
    #[error("page size {page_size} exceeds the maximum of {max}")]
    PageSizeTooLarge { page_size: usize, max: usize },
    #[error("page size {page_size} cannot hold a slab header plus one {bound}-byte slot")]
    PageTooSmallForClass { page_size: usize, bound: usize },
    #[error("cannot parse {var}={value:?}")]
    Parse { var: &'static str, value: String },
    #[error("allocator configuration is already in use")]
    AlreadyInitialized,
}
