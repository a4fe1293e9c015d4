//! Large-object regions.
//!
//! Requests above the top size class get a dedicated mapping rounded up to
//! whole pages. A 16-byte header in front of the payload carries the page
//! tag and the mapped length, so release needs no side table and works from
//! any thread.
//!
//! Since a region can be released through any heap, large-object counters
//! live in a [`LargeLedger`] shared by heaps rather than in a single heap.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use tagalloc_core::{AllocError, AllocatorConfig, LARGE_HEADER_BYTES, ReleaseError};

use crate::page::PageProvider;
use crate::tag::{self, PageKind};

#[repr(C)]
struct LargeHeader {
    tag: u64,
    mapped_len: u64,
}

const _: () = assert!(size_of::<LargeHeader>() == LARGE_HEADER_BYTES);

static PROCESS_LEDGER: LazyLock<Arc<LargeLedger>> = LazyLock::new(Arc::default);

/// Large-region counters shared by every heap holding the same ledger.
///
/// A map is recorded by the heap that mapped the region and the matching
/// unmap by whichever heap released it, so the counts balance per ledger.
#[derive(Debug, Default)]
pub struct LargeLedger {
    maps: AtomicU64,
    unmaps: AtomicU64,
    live_bytes: AtomicUsize,
}

impl LargeLedger {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            maps: AtomicU64::new(0),
            unmaps: AtomicU64::new(0),
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// The ledger heaps use unless they are given one.
    #[must_use]
    pub fn process() -> Arc<Self> {
        Arc::clone(&PROCESS_LEDGER)
    }

    pub(crate) fn record_map(&self, len: usize) {
        self.maps.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(len, Ordering::Relaxed);
    }

    pub(crate) fn record_unmap(&self, len: usize) {
        self.unmaps.fetch_add(1, Ordering::Relaxed);
        // A region mapped under another ledger must not wrap the count.
        let _ = self
            .live_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
                Some(live.saturating_sub(len))
            });
    }

    /// Regions mapped.
    #[must_use]
    pub fn maps(&self) -> u64 {
        self.maps.load(Ordering::Relaxed)
    }

    /// Regions unmapped.
    #[must_use]
    pub fn unmaps(&self) -> u64 {
        self.unmaps.load(Ordering::Relaxed)
    }

    /// Bytes mapped minus bytes unmapped.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }
}

/// A freshly mapped large region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LargeRegion {
    pub(crate) payload: NonNull<u8>,
    pub(crate) mapped_len: usize,
}

/// Maps a region for `size` payload bytes.
pub(crate) fn allocate<P: PageProvider>(
    provider: &P,
    config: &AllocatorConfig,
    size: usize,
) -> Result<LargeRegion, AllocError> {
    let mapped_len = config
        .large_mapping_len(size)
        .ok_or(AllocError::overflow(size))?;
    let base = provider
        .map(mapped_len, config.page_size())
        .map_err(|err| {
            tracing::warn!(size, mapped_len, error = %err, "large region unavailable");
            AllocError::from_page(size, err)
        })?;

    let header = base.cast::<LargeHeader>().as_ptr();
    // SAFETY: `base` is a fresh writable mapping of at least one page; the
    // header fits in its first LARGE_HEADER_BYTES.
    let payload = unsafe {
        tag::write(base.as_ptr(), PageKind::Large);
        (&raw mut (*header).mapped_len).write(mapped_len as u64);
        base.add(LARGE_HEADER_BYTES)
    };
    tracing::debug!(addr = base.as_ptr() as usize, size, mapped_len, "large region mapped");
    Ok(LargeRegion {
        payload,
        mapped_len,
    })
}

/// Bytes mapped for the region at `base`.
///
/// # Safety
///
/// `base` must be the base of a live large region.
unsafe fn mapped_len(base: usize) -> usize {
    // SAFETY: caller guarantees a live header at base.
    unsafe { (*(base as *const LargeHeader)).mapped_len as usize }
}

/// Usable bytes behind a large payload at `base + LARGE_HEADER_BYTES`.
///
/// # Safety
///
/// `base` must be the base of a live large region.
pub(crate) unsafe fn usable_size(base: usize) -> usize {
    // SAFETY: forwarded caller contract.
    unsafe { mapped_len(base) - LARGE_HEADER_BYTES }
}

/// Unmaps the region whose page base is `base`, given the released
/// address `addr`. Returns the mapped length handed back to the provider.
///
/// An unmap failure is logged and otherwise treated as done: the tag is
/// already retired and the region is unreachable either way.
///
/// # Safety
///
/// `base` must be the base of a live large region and nothing may use the
/// region after a successful return.
pub(crate) unsafe fn release<P: PageProvider>(
    provider: &P,
    base: usize,
    addr: usize,
) -> Result<usize, ReleaseError> {
    if addr != base + LARGE_HEADER_BYTES {
        return Err(ReleaseError::Misaligned { addr });
    }
    // SAFETY: caller guarantees a live region at base.
    let len = unsafe { mapped_len(base) };
    let base_ptr = base as *mut u8;
    // SAFETY: the region is live; the tag is retired before the unmap so a
    // stale pointer into it never decodes as Large again while it is mapped.
    let unmapped = unsafe {
        tag::retire(base_ptr);
        provider.unmap(NonNull::new_unchecked(base_ptr), len)
    };
    match unmapped {
        Ok(()) => tracing::debug!(addr = base, mapped_len = len, "large region unmapped"),
        Err(err) => tracing::warn!(addr = base, error = %err, "large region unmap failed"),
    }
    Ok(len)
}
