//! C entry points for tagalloc.
//!
//! Every call goes through the calling thread's heap. Failures follow the
//! libc convention: a sentinel return value plus `errno`.
//!
//! | function                | failure return | errno    |
//! |-------------------------|----------------|----------|
//! | `tagalloc_allocate`     | `NULL`         | `ENOMEM` |
//! | `tagalloc_release`      | `-1`           | `EINVAL` |
//! | `tagalloc_usable_size`  | never fails    | -        |
//!
//! A pointer whose page carries no live tag aborts the process in both
//! `tagalloc_release` and `tagalloc_usable_size`.

use std::ffi::{c_int, c_void};

#[inline]
fn set_abi_errno(val: c_int) {
    // SAFETY: __errno_location returns the calling thread's errno slot.
    unsafe { *libc::__errno_location() = val };
}

/// Allocates `size` bytes. Returns null and sets `ENOMEM` on failure.
///
/// # Safety
///
/// Always safe to call; `unsafe` only because it is a C entry point.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tagalloc_allocate(size: usize) -> *mut c_void {
    match tagalloc::allocate(size) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(err) => {
            tracing::warn!(size, error = %err, "tagalloc_allocate failed");
            set_abi_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

/// Releases `ptr`. Null is accepted. Returns 0 on success; -1 with `EINVAL`
/// when the release is rejected (foreign thread, double release, or not an
/// allocation start).
///
/// # Safety
///
/// `ptr` must be null or point into a page that is still mapped, normally a
/// pointer returned by [`tagalloc_allocate`] and not yet released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tagalloc_release(ptr: *mut c_void) -> c_int {
    // SAFETY: forwarded caller contract.
    match unsafe { tagalloc::release(ptr.cast()) } {
        Ok(()) => 0,
        Err(_) => {
            set_abi_errno(libc::EINVAL);
            -1
        }
    }
}

/// Usable bytes behind `ptr`; 0 for null.
///
/// # Safety
///
/// Same as [`tagalloc_release`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tagalloc_usable_size(ptr: *const c_void) -> usize {
    // SAFETY: forwarded caller contract.
    unsafe { tagalloc::usable_size(ptr.cast()) }
}
