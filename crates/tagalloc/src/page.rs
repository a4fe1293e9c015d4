//! Page provider: the OS virtual-memory manager behind the allocator.
//!
//! Every slab and every large object lives in its own mapping. Mappings are
//! aligned to the configured page size so that any address inside a region
//! can be rounded down to the region's base, where the page tag lives.

use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tagalloc_core::PageError;
use tagalloc_core::config::FALLBACK_PAGE_SIZE;

/// Source of page-aligned memory regions.
pub trait PageProvider {
    /// Maps `len` bytes aligned to `align`.
    ///
    /// `align` is a power of two and `len` a multiple of `align`.
    fn map(&self, len: usize, align: usize) -> Result<NonNull<u8>, PageError>;

    /// Returns a region to the OS.
    ///
    /// # Safety
    ///
    /// `base` and `len` must describe exactly one region previously returned
    /// by [`map`](Self::map) on this provider, and nothing may touch the
    /// region afterwards.
    unsafe fn unmap(&self, base: NonNull<u8>, len: usize) -> Result<(), PageError>;
}

impl<P: PageProvider + ?Sized> PageProvider for Arc<P> {
    fn map(&self, len: usize, align: usize) -> Result<NonNull<u8>, PageError> {
        (**self).map(len, align)
    }

    unsafe fn unmap(&self, base: NonNull<u8>, len: usize) -> Result<(), PageError> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).unmap(base, len) }
    }
}

// 0 = not yet queried.
static OS_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// The OS page size, queried once with `sysconf(_SC_PAGESIZE)`.
///
/// Falls back to 4096 when the OS reports something that is not a power of
/// two of at least 4096.
#[must_use]
pub fn os_page_size() -> usize {
    let cached = OS_PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = usize::try_from(raw)
        .ok()
        .filter(|size| size.is_power_of_two() && *size >= FALLBACK_PAGE_SIZE)
        .unwrap_or(FALLBACK_PAGE_SIZE);
    OS_PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Rounds `addr` down to the base of its `page_size`-aligned page.
#[inline]
#[must_use]
pub const fn page_base(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

fn last_errno() -> Option<i32> {
    std::io::Error::last_os_error().raw_os_error()
}

/// Cuts an over-mapped `span` at `raw` down to the `len` bytes starting at
/// the first `align` boundary and returns that boundary.
///
/// When a trim fails, the part of the span still mapped is released before
/// the error is returned.
fn trim_to_alignment(
    raw: usize,
    span: usize,
    len: usize,
    align: usize,
    mut unmap: impl FnMut(usize, usize) -> Result<(), PageError>,
) -> Result<usize, PageError> {
    let aligned = (raw + align - 1) & !(align - 1);
    let head = aligned - raw;
    let tail = span - head - len;

    let mut trim = |addr: usize, cut: usize, (rest, rest_len): (usize, usize)| {
        let Err(err) = unmap(addr, cut) else {
            return Ok(());
        };
        tracing::warn!(addr, len = cut, error = %err, "alignment trim failed");
        if let Err(cleanup) = unmap(rest, rest_len) {
            tracing::warn!(addr = rest, len = rest_len, error = %cleanup, "over-mapped span leaked");
        }
        Err(err)
    };
    if head > 0 {
        trim(raw, head, (raw, span))?;
    }
    if tail > 0 {
        trim(aligned + len, tail, (aligned, len + tail))?;
    }
    Ok(aligned)
}

/// Anonymous private mappings through `mmap(2)` / `munmap(2)`.
#[derive(Debug, Clone, Copy)]
pub struct MmapProvider {
    os_page: usize,
}

impl MmapProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            os_page: os_page_size(),
        }
    }

    fn map_raw(&self, len: usize) -> Result<NonNull<u8>, PageError> {
        // SAFETY: a fresh anonymous mapping with no address hint cannot alias
        // any existing memory.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(PageError {
                len,
                errno: last_errno(),
            });
        }
        NonNull::new(addr.cast::<u8>()).ok_or(PageError { len, errno: None })
    }

    /// # Safety
    ///
    /// `[addr, addr + len)` must be mapped, OS-page aligned, and unused.
    unsafe fn unmap_raw(&self, addr: usize, len: usize) -> Result<(), PageError> {
        // SAFETY: caller guarantees the range is an unused mapping.
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        if rc == 0 {
            Ok(())
        } else {
            Err(PageError {
                len,
                errno: last_errno(),
            })
        }
    }
}

impl Default for MmapProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PageProvider for MmapProvider {
    fn map(&self, len: usize, align: usize) -> Result<NonNull<u8>, PageError> {
        if len == 0 {
            return Err(PageError {
                len,
                errno: Some(libc::EINVAL),
            });
        }
        if align <= self.os_page {
            return self.map_raw(len);
        }

        // mmap only guarantees OS-page alignment: over-map and trim both ends.
        let span = len.checked_add(align - self.os_page).ok_or(PageError {
            len,
            errno: Some(libc::ENOMEM),
        })?;
        let raw = self.map_raw(span)?.as_ptr() as usize;
        let aligned = trim_to_alignment(raw, span, len, align, |addr, len| {
            // SAFETY: every range trimmed is an OS-page-aligned slice of the
            // span just mapped, which nobody else has seen.
            unsafe { self.unmap_raw(addr, len) }
        })?;
        NonNull::new(aligned as *mut u8).ok_or(PageError { len, errno: None })
    }

    unsafe fn unmap(&self, base: NonNull<u8>, len: usize) -> Result<(), PageError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.unmap_raw(base.as_ptr() as usize, len) }
    }
}

/// Wraps a provider and counts what passes through it.
///
/// Live regions and bytes let callers check that every mapping was
/// returned. A failure budget makes `map` fail after a given number of
/// successful calls, which is how exhaustion paths are exercised.
#[derive(Debug)]
pub struct CountingProvider<P = MmapProvider> {
    inner: P,
    maps: AtomicU64,
    unmaps: AtomicU64,
    live_regions: AtomicUsize,
    live_bytes: AtomicUsize,
    // Successful maps still allowed; u64::MAX means unlimited.
    budget: AtomicU64,
}

impl<P: PageProvider> CountingProvider<P> {
    #[must_use]
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            maps: AtomicU64::new(0),
            unmaps: AtomicU64::new(0),
            live_regions: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            budget: AtomicU64::new(u64::MAX),
        }
    }

    /// Allows `remaining` more successful maps, then fails with `ENOMEM`.
    pub fn fail_after(&self, remaining: u64) {
        self.budget.store(remaining, Ordering::Relaxed);
    }

    /// Removes any failure budget.
    pub fn never_fail(&self) {
        self.budget.store(u64::MAX, Ordering::Relaxed);
    }

    #[must_use]
    pub fn maps(&self) -> u64 {
        self.maps.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn unmaps(&self) -> u64 {
        self.unmaps.load(Ordering::Relaxed)
    }

    /// Regions mapped and not yet returned.
    #[must_use]
    pub fn live_regions(&self) -> usize {
        self.live_regions.load(Ordering::Relaxed)
    }

    /// Bytes mapped and not yet returned.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    fn take_budget(&self) -> bool {
        self.budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| match left {
                0 => None,
                u64::MAX => Some(u64::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

impl Default for CountingProvider<MmapProvider> {
    fn default() -> Self {
        Self::new(MmapProvider::new())
    }
}

impl<P: PageProvider> PageProvider for CountingProvider<P> {
    fn map(&self, len: usize, align: usize) -> Result<NonNull<u8>, PageError> {
        if !self.take_budget() {
            return Err(PageError {
                len,
                errno: Some(libc::ENOMEM),
            });
        }
        let base = self.inner.map(len, align)?;
        self.maps.fetch_add(1, Ordering::Relaxed);
        self.live_regions.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(len, Ordering::Relaxed);
        Ok(base)
    }

    unsafe fn unmap(&self, base: NonNull<u8>, len: usize) -> Result<(), PageError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.unmap(base, len)? };
        self.unmaps.fetch_add(1, Ordering::Relaxed);
        self.live_regions.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(len, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_page_size_is_sane() {
        let size = os_page_size();
        assert!(size.is_power_of_two());
        assert!(size >= 4096);
        assert_eq!(os_page_size(), size, "cached value must be stable");
    }

    #[test]
    fn page_base_masks_low_bits() {
        assert_eq!(page_base(0x1234_5678, 4096), 0x1234_5000);
        assert_eq!(page_base(0x1234_5000, 4096), 0x1234_5000);
        assert_eq!(page_base(0x1234_5678, 0x1_0000), 0x1234_0000);
    }

    #[test]
    fn map_write_unmap() {
        let provider = MmapProvider::new();
        let page = os_page_size();
        let base = provider.map(page, page).expect("map one page");
        assert_eq!(base.as_ptr() as usize % page, 0);
        // SAFETY: the page is mapped read/write and owned by this test.
        unsafe {
            ptr::write_bytes(base.as_ptr(), 0xAB, page);
            assert_eq!(*base.as_ptr().add(page - 1), 0xAB);
            provider.unmap(base, page).expect("unmap");
        }
    }

    #[test]
    fn over_aligned_map_is_aligned() {
        let provider = MmapProvider::new();
        let align = os_page_size() * 16;
        let base = provider.map(align, align).expect("aligned map");
        assert_eq!(base.as_ptr() as usize % align, 0);
        // SAFETY: the region is mapped read/write and owned by this test.
        unsafe {
            ptr::write_bytes(base.as_ptr(), 0x5A, align);
            provider.unmap(base, align).expect("unmap");
        }
    }

    // Span of 0x1F000 at 0x1_8000 for a 64 KiB-aligned 64 KiB region:
    // head [0x1_8000, 0x2_0000), region [0x2_0000, 0x3_0000), tail up to 0x3_7000.
    fn trim_failing_on(call: Option<usize>) -> (Result<usize, PageError>, Vec<(usize, usize)>) {
        let mut calls = Vec::new();
        let result = trim_to_alignment(0x1_8000, 0x1_F000, 0x1_0000, 0x1_0000, |addr, len| {
            calls.push((addr, len));
            if Some(calls.len() - 1) == call {
                Err(PageError {
                    len,
                    errno: Some(libc::EINVAL),
                })
            } else {
                Ok(())
            }
        });
        (result, calls)
    }

    #[test]
    fn trim_cuts_head_and_tail() {
        let (result, calls) = trim_failing_on(None);
        assert_eq!(result, Ok(0x2_0000));
        assert_eq!(calls, [(0x1_8000, 0x8000), (0x3_0000, 0x7000)]);
    }

    #[test]
    fn failed_head_trim_releases_the_whole_span() {
        let (result, calls) = trim_failing_on(Some(0));
        assert!(result.is_err());
        assert_eq!(calls, [(0x1_8000, 0x8000), (0x1_8000, 0x1_F000)]);
    }

    #[test]
    fn failed_tail_trim_releases_region_and_tail() {
        let (result, calls) = trim_failing_on(Some(1));
        assert!(result.is_err());
        assert_eq!(
            calls,
            [(0x1_8000, 0x8000), (0x3_0000, 0x7000), (0x2_0000, 0x1_7000)]
        );
    }

    #[test]
    fn zero_length_map_is_rejected() {
        let err = MmapProvider::new().map(0, 4096).expect_err("zero length");
        assert_eq!(err.errno, Some(libc::EINVAL));
    }

    #[test]
    fn counting_provider_tracks_live_regions() {
        let provider = CountingProvider::default();
        let page = os_page_size();
        let a = provider.map(page, page).expect("map a");
        let b = provider.map(2 * page, page).expect("map b");
        assert_eq!(provider.maps(), 2);
        assert_eq!(provider.live_regions(), 2);
        assert_eq!(provider.live_bytes(), 3 * page);

        // SAFETY: both regions came from this provider and are unused.
        unsafe {
            provider.unmap(a, page).expect("unmap a");
            provider.unmap(b, 2 * page).expect("unmap b");
        }
        assert_eq!(provider.unmaps(), 2);
        assert_eq!(provider.live_regions(), 0);
        assert_eq!(provider.live_bytes(), 0);
    }

    #[test]
    fn counting_provider_failure_budget() {
        let provider = CountingProvider::default();
        let page = os_page_size();
        provider.fail_after(1);
        let first = provider.map(page, page).expect("one map allowed");
        let err = provider.map(page, page).expect_err("budget exhausted");
        assert_eq!(err.errno, Some(libc::ENOMEM));
        assert_eq!(provider.maps(), 1);

        provider.never_fail();
        let second = provider.map(page, page).expect("budget lifted");
        // SAFETY: both regions came from this provider and are unused.
        unsafe {
            provider.unmap(first, page).expect("unmap first");
            provider.unmap(second, page).expect("unmap second");
        }
    }
}
