//! Thread heap: the per-thread allocation context.
//!
//! A [`ThreadHeap`] owns one slab directory and one page provider, and
//! reports large regions to a [`LargeLedger`] it may share with other heaps. Requests are routed by size: anything the class
//! table covers goes to a slab, the rest gets its own mapping. Releases are
//! routed by the tag at the base of the page the pointer falls in.
//!
//! The heap holds raw page pointers and is therefore neither `Send` nor
//! `Sync`. Slabs record the id of the heap that created them and refuse
//! releases from any other heap.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tagalloc_core::{AllocError, AllocatorConfig, HeapStats, ReleaseError};

use crate::directory::SlabDirectory;
use crate::large::{self, LargeLedger};
use crate::page::{MmapProvider, PageProvider, page_base};
use crate::slab::Slab;
use crate::tag::{self, PageTag};

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

fn next_heap_id() -> u64 {
    NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Logs and terminates the process. A pointer whose page carries no valid
/// tag means the heap can no longer be trusted.
#[cold]
fn fatal_release(addr: usize, found: PageTag) -> ! {
    tracing::error!(addr, tag = ?found, "release of a pointer with no live page tag; aborting");
    std::process::abort()
}

/// Per-thread allocation context.
pub struct ThreadHeap<P: PageProvider = MmapProvider> {
    id: u64,
    config: Arc<AllocatorConfig>,
    provider: P,
    slabs: SlabDirectory,
    ledger: Arc<LargeLedger>,
}

impl ThreadHeap<MmapProvider> {
    /// Heap over anonymous `mmap` pages.
    #[must_use]
    pub fn new(config: Arc<AllocatorConfig>) -> Self {
        Self::with_provider(config, MmapProvider::new())
    }
}

impl<P: PageProvider> ThreadHeap<P> {
    /// Heap over an explicit page provider, counting large regions in the
    /// process ledger.
    #[must_use]
    pub fn with_provider(config: Arc<AllocatorConfig>, provider: P) -> Self {
        Self::with_ledger(config, provider, LargeLedger::process())
    }

    /// Heap over an explicit page provider and large-region ledger.
    ///
    /// Heaps that may release each other's large regions should share a
    /// ledger, or the counts of each will drift.
    #[must_use]
    pub fn with_ledger(
        config: Arc<AllocatorConfig>,
        provider: P,
        ledger: Arc<LargeLedger>,
    ) -> Self {
        Self::with_id(next_heap_id(), config, provider, ledger)
    }

    /// Heap that takes over the identity `id` of an earlier heap, so it may
    /// release slots in that heap's slabs.
    pub(crate) fn with_id(
        id: u64,
        config: Arc<AllocatorConfig>,
        provider: P,
        ledger: Arc<LargeLedger>,
    ) -> Self {
        let slabs = SlabDirectory::new(id, config.classes().len());
        Self {
            id,
            config,
            provider,
            slabs,
            ledger,
        }
    }

    /// Process-unique, non-zero id recorded as the owner of this heap's slabs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<LargeLedger> {
        &self.ledger
    }

    /// Serves `size` bytes.
    ///
    /// Sizes up to the top class bound (including 0) come from a slab of the
    /// smallest fitting class; larger sizes get a dedicated region. The
    /// returned block is at least `size` bytes and stays valid until it is
    /// released.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let classes = self.config.classes();
        if let Some(class) = classes.class_of(size) {
            let bound = classes.bound(class).ok_or(AllocError::overflow(size))?;
            return self
                .slabs
                .allocate(&self.provider, self.config.page_size(), class, bound);
        }

        let region = large::allocate(&self.provider, &self.config, size)?;
        self.ledger.record_map(region.mapped_len);
        Ok(region.payload)
    }

    /// Returns a block to the allocator. A null pointer is a no-op.
    ///
    /// Rejected releases leave every structure as it was. A pointer whose
    /// page carries no live tag aborts the process.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must lie in a page that is still mapped: in practice,
    /// a pointer returned by `allocate` on a heap sharing this heap's page
    /// size, not yet successfully released.
    pub unsafe fn release(&mut self, ptr: *mut u8) -> Result<(), ReleaseError> {
        if ptr.is_null() {
            return Ok(());
        }
        let addr = ptr as usize;
        let page_size = self.config.page_size();
        let base = page_base(addr, page_size);

        // SAFETY: caller guarantees the page is mapped.
        let result = match unsafe { tag::read(ptr, page_size) } {
            PageTag::Slab => {
                // SAFETY: the tag identifies a live slab page at base.
                let slab = unsafe { Slab::from_base(base) };
                self.slabs
                    .release(&self.provider, page_size, slab, addr)
                    .map(drop)
            }
            PageTag::Large => {
                // SAFETY: the tag identifies a live large region at base.
                unsafe { large::release(&self.provider, base, addr) }
                    .map(|len| self.ledger.record_unmap(len))
            }
            found @ (PageTag::Retired | PageTag::Unknown(_)) => fatal_release(addr, found),
        };
        if let Err(err) = &result {
            tracing::warn!(addr, heap = self.id, error = %err, "release rejected");
        }
        result
    }

    /// Usable bytes of the block at `ptr`: the slot size for slab blocks,
    /// the mapped length minus the header for large ones. Null gives 0.
    ///
    /// # Safety
    ///
    /// Same contract as [`release`](Self::release). Aborts on a page with no
    /// live tag.
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let addr = ptr as usize;
        let page_size = self.config.page_size();
        let base = page_base(addr, page_size);
        // SAFETY: caller guarantees the page is mapped; the tag says what
        // header sits at base.
        unsafe {
            match tag::read(ptr, page_size) {
                PageTag::Slab => Slab::from_base(base).object_size(),
                PageTag::Large => large::usable_size(base),
                found @ (PageTag::Retired | PageTag::Unknown(_)) => fatal_release(addr, found),
            }
        }
    }

    /// Decodes the tag of the page containing `ptr`.
    ///
    /// # Safety
    ///
    /// The page containing `ptr` must be mapped.
    #[must_use]
    pub unsafe fn page_tag(&self, ptr: *const u8) -> PageTag {
        // SAFETY: forwarded caller contract.
        unsafe { tag::read(ptr, self.config.page_size()) }
    }

    /// Occupancy snapshot: this heap's slabs and its ledger's large regions.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            heap_id: self.id,
            classes: self
                .config
                .classes()
                .iter()
                .map(|(index, bound)| self.slabs.class_stats(index, bound))
                .collect(),
            slab_maps: self.slabs.slab_maps(),
            slab_unmaps: self.slabs.slab_unmaps(),
            large_maps: self.ledger.maps(),
            large_unmaps: self.ledger.unmaps(),
            large_live_bytes: self.ledger.live_bytes(),
        }
    }
}

impl<P: PageProvider> std::fmt::Debug for ThreadHeap<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHeap")
            .field("id", &self.id)
            .field("page_size", &self.config.page_size())
            .field("owner", &self.slabs.owner())
            .field("large_maps", &self.ledger.maps())
            .field("large_unmaps", &self.ledger.unmaps())
            .finish_non_exhaustive()
    }
}
