//! Process-wide surface: one [`ThreadHeap`] per OS thread.
//!
//! The configuration is fixed the first time any thread needs it, either by
//! an explicit [`configure`] call or from the environment. Each thread's heap
//! is created lazily on first use and never migrates. Heaps are not torn
//! down when their thread exits; slabs still holding live slots stay mapped.
//!
//! Thread-local destructors that run after the heap's own may still
//! allocate and release. They get a transient heap carrying the destroyed
//! heap's id, so slots handed out before or during teardown release cleanly.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::RwLock;
use tagalloc_core::{AllocError, AllocatorConfig, ConfigError, HeapStats, ReleaseError};

use crate::heap::ThreadHeap;
use crate::large::LargeLedger;
use crate::page::{MmapProvider, os_page_size};

static CONFIG: RwLock<Option<Arc<AllocatorConfig>>> = parking_lot::const_rwlock(None);

thread_local! {
    static HEAP: RefCell<Option<ThreadHeap>> = const { RefCell::new(None) };
    // No destructor, so it stays readable after HEAP is gone. 0 = no heap yet.
    static HEAP_ID: Cell<u64> = const { Cell::new(0) };
}

/// Installs the process-wide configuration.
///
/// Fails with [`ConfigError::AlreadyInitialized`] once a configuration is in
/// place, whether set here or loaded by the first allocation.
pub fn configure(config: AllocatorConfig) -> Result<(), ConfigError> {
    let mut slot = CONFIG.write();
    if slot.is_some() {
        return Err(ConfigError::AlreadyInitialized);
    }
    tracing::debug!(
        page_size = config.page_size(),
        classes = config.classes().len(),
        "allocator configured"
    );
    *slot = Some(Arc::new(config));
    Ok(())
}

/// The process-wide configuration, loading it from the environment on first
/// call.
#[must_use]
pub fn config() -> Arc<AllocatorConfig> {
    if let Some(config) = CONFIG.read().as_ref() {
        return Arc::clone(config);
    }
    let mut slot = CONFIG.write();
    let config = slot.get_or_insert_with(|| {
        let os_page = os_page_size();
        let config = AllocatorConfig::from_env(os_page).unwrap_or_else(|err| {
            tracing::warn!(error = %err, os_page, "using fallback allocator configuration");
            AllocatorConfig::fallback()
        });
        Arc::new(config)
    });
    Arc::clone(config)
}

fn new_thread_heap() -> ThreadHeap {
    let heap = ThreadHeap::new(config());
    HEAP_ID.set(heap.id());
    heap
}

/// Stand-in for a destroyed thread heap, owning whatever slabs it owned.
fn teardown_heap() -> ThreadHeap {
    match HEAP_ID.get() {
        0 => new_thread_heap(),
        id => ThreadHeap::with_id(id, config(), MmapProvider::new(), LargeLedger::process()),
    }
}

/// Runs `f` on this thread's heap.
///
/// Once the thread-local is destroyed the call runs on [`teardown_heap`].
/// Slab pages a transient heap maps and does not empty are left behind
/// like those of any exited thread.
fn with_heap<R>(f: impl Fn(&mut ThreadHeap) -> R) -> R {
    let served = HEAP.try_with(|cell| {
        cell.try_borrow_mut()
            .ok()
            .map(|mut slot| f(slot.get_or_insert_with(new_thread_heap)))
    });
    match served {
        Ok(Some(result)) => result,
        // Re-entered while borrowed. A fresh id keeps the transient heap
        // from unmapping slabs still linked in the borrowed heap's chains.
        Ok(None) => {
            tracing::debug!("thread heap busy; using a transient heap");
            f(&mut ThreadHeap::new(config()))
        }
        Err(_) => {
            tracing::debug!(heap = HEAP_ID.get(), "thread heap destroyed; using a transient heap");
            f(&mut teardown_heap())
        }
    }
}

/// Allocates `size` bytes from the calling thread's heap.
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    with_heap(|heap| heap.allocate(size))
}

/// Releases `ptr` through the calling thread's heap. Null is a no-op.
///
/// # Safety
///
/// See [`ThreadHeap::release`].
pub unsafe fn release(ptr: *mut u8) -> Result<(), ReleaseError> {
    // SAFETY: forwarded caller contract.
    with_heap(|heap| unsafe { heap.release(ptr) })
}

/// Usable bytes of the block at `ptr`.
///
/// # Safety
///
/// See [`ThreadHeap::usable_size`].
#[must_use]
pub unsafe fn usable_size(ptr: *const u8) -> usize {
    // SAFETY: forwarded caller contract.
    with_heap(|heap| unsafe { heap.usable_size(ptr) })
}

/// Snapshot of the calling thread's heap.
#[must_use]
pub fn thread_stats() -> HeapStats {
    with_heap(|heap| heap.stats())
}

/// Id of the calling thread's heap.
#[must_use]
pub fn thread_heap_id() -> u64 {
    with_heap(|heap| heap.id())
}
