//! Slab pages.
//!
//! A slab is one page holding `capacity` fixed-size slots of a single size
//! class. The header occupies the first `SLAB_HEADER_BYTES`; slot 0 starts
//! right after it.
//!
//! ```text
//!   page base                                                  page end
//!   ┌──────────────┬────────┬────────┬────────┬─────┬────────┬───────┐
//!   │ SlabHeader   │ slot 0 │ slot 1 │ slot 2 │ ... │ slot n │ slack │
//!   │ tag first    │        │        │        │     │        │       │
//!   └──────────────┴────────┴────────┴────────┴─────┴────────┴───────┘
//! ```
//!
//! Free slots form a LIFO list threaded through the slots themselves. The
//! link is a slot index, not an address: the lead word of a free slot holds
//! `FREE_SLOT_MARK << 32 | next_index`. Popping a slot clears its lead word,
//! so a slot whose lead word carries the mark is almost certainly free and a
//! walk of the list settles it.

use std::ptr::NonNull;

use tagalloc_core::{PageError, ReleaseError, SLAB_HEADER_BYTES};

use crate::page::PageProvider;
use crate::tag::{self, PageKind};

/// Terminates the free list.
const NIL: u32 = u32::MAX;

/// High half of a free slot's lead word.
const FREE_SLOT_MARK: u32 = 0xF5EE_51A7;

#[repr(C)]
pub(crate) struct SlabHeader {
    tag: u64,
    next: Option<NonNull<SlabHeader>>,
    owner: u64,
    class_index: u32,
    object_size: u32,
    capacity: u32,
    in_use: u32,
    free_head: u32,
    _reserved: u32,
}

const _: () = assert!(size_of::<SlabHeader>() <= SLAB_HEADER_BYTES);

#[inline]
const fn encode_link(next: u32) -> u64 {
    ((FREE_SLOT_MARK as u64) << 32) | next as u64
}

#[inline]
const fn decode_link(word: u64) -> Option<u32> {
    if (word >> 32) as u32 == FREE_SLOT_MARK {
        Some(word as u32)
    } else {
        None
    }
}

// Header fields are accessed one at a time through raw field pointers. No
// reference to the whole header is formed, since a foreign heap may read
// `owner` while the owning heap updates the free list.
macro_rules! get {
    ($slab:expr, $field:ident) => {
        // SAFETY: a handle always points at an initialized, mapped header.
        unsafe { (&raw const (*$slab.0.as_ptr()).$field).read() }
    };
}

macro_rules! set {
    ($slab:expr, $field:ident, $value:expr) => {{
        let value = $value;
        // SAFETY: as in `get!`; only the owning heap writes header fields.
        unsafe { (&raw mut (*$slab.0.as_ptr()).$field).write(value) }
    }};
}

/// Handle to a mapped slab page.
///
/// A handle is only ever built over a page whose header was initialized by
/// [`Slab::create`], and is dropped from every chain before
/// [`Slab::destroy`] returns the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slab(NonNull<SlabHeader>);

impl Slab {
    /// Maps one page and lays out an empty slab on it.
    ///
    /// The tag is written before any other header field. Every slot is
    /// threaded onto the free list in address order.
    pub(crate) fn create<P: PageProvider>(
        provider: &P,
        page_size: usize,
        class_index: usize,
        object_size: usize,
        owner: u64,
    ) -> Result<Self, PageError> {
        let base = provider.map(page_size, page_size)?;
        // Page size is capped at 1 GiB, so capacity and sizes fit u32.
        let capacity = ((page_size - SLAB_HEADER_BYTES) / object_size) as u32;
        let header = base.cast::<SlabHeader>().as_ptr();

        // SAFETY: `base` is a fresh, writable, page-aligned mapping of
        // `page_size` bytes; the header fits in SLAB_HEADER_BYTES and every
        // slot lies inside the page.
        unsafe {
            tag::write(base.as_ptr(), PageKind::Slab);
            (&raw mut (*header).next).write(None);
            (&raw mut (*header).owner).write(owner);
            (&raw mut (*header).class_index).write(class_index as u32);
            (&raw mut (*header).object_size).write(object_size as u32);
            (&raw mut (*header).capacity).write(capacity);
            (&raw mut (*header).in_use).write(0);
            (&raw mut (*header).free_head).write(if capacity == 0 { NIL } else { 0 });
            (&raw mut (*header)._reserved).write(0);

            let slab = Self(NonNull::new_unchecked(header));
            for index in 0..capacity {
                let next = if index + 1 < capacity { index + 1 } else { NIL };
                slab.write_lead(index, encode_link(next));
            }
            Ok(slab)
        }
    }

    /// Handle over a page whose tag already decoded as `Slab`.
    ///
    /// # Safety
    ///
    /// `base` must be the base of a live slab page created by
    /// [`Slab::create`].
    pub(crate) unsafe fn from_base(base: usize) -> Self {
        // SAFETY: caller guarantees base is a live slab page, hence non-null.
        Self(unsafe { NonNull::new_unchecked(base as *mut SlabHeader) })
    }

    pub(crate) fn base(&self) -> usize {
        self.0.as_ptr() as usize
    }

    fn payload_start(&self) -> usize {
        self.base() + SLAB_HEADER_BYTES
    }

    /// The creating heap's id. Never changes after `create`, so a foreign
    /// heap may read it while the owner updates the other fields.
    pub(crate) fn owner(&self) -> u64 {
        get!(self, owner)
    }

    pub(crate) fn class_index(&self) -> usize {
        get!(self, class_index) as usize
    }

    pub(crate) fn object_size(&self) -> usize {
        get!(self, object_size) as usize
    }

    pub(crate) fn capacity(&self) -> usize {
        get!(self, capacity) as usize
    }

    pub(crate) fn in_use(&self) -> usize {
        get!(self, in_use) as usize
    }

    pub(crate) fn has_free(&self) -> bool {
        get!(self, free_head) != NIL
    }

    pub(crate) fn next(&self) -> Option<Slab> {
        get!(self, next).map(Slab)
    }

    pub(crate) fn set_next(&mut self, next: Option<Slab>) {
        set!(self, next, next.map(|slab| slab.0));
    }

    fn slot_ptr(&self, index: u32) -> *mut u8 {
        (self.payload_start() + index as usize * self.object_size()) as *mut u8
    }

    fn read_lead(&self, index: u32) -> u64 {
        // SAFETY: index < capacity, so the slot lies inside the page. Slots
        // need not be 8-byte aligned for every class, hence unaligned access.
        unsafe { self.slot_ptr(index).cast::<u64>().read_unaligned() }
    }

    fn write_lead(&self, index: u32, word: u64) {
        // SAFETY: as in `read_lead`; the slot is free or being handed out.
        unsafe { self.slot_ptr(index).cast::<u64>().write_unaligned(word) }
    }

    /// Takes the most recently freed slot.
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let index = get!(self, free_head);
        if index == NIL {
            return None;
        }
        let word = self.read_lead(index);
        debug_assert!(decode_link(word).is_some(), "free slot lost its mark");
        let next = decode_link(word).unwrap_or(NIL);
        self.write_lead(index, 0);

        set!(self, free_head, next);
        set!(self, in_use, get!(self, in_use) + 1);
        NonNull::new(self.slot_ptr(index))
    }

    /// Maps an address to its slot index.
    ///
    /// Only exact slot starts inside the payload span are accepted.
    pub(crate) fn slot_index(&self, addr: usize) -> Result<u32, ReleaseError> {
        let start = self.payload_start();
        let size = self.object_size();
        if addr < start || (addr - start) % size != 0 {
            return Err(ReleaseError::Misaligned { addr });
        }
        let index = (addr - start) / size;
        if index >= self.capacity() {
            return Err(ReleaseError::Misaligned { addr });
        }
        Ok(index as u32)
    }

    /// Whether slot `index` is currently on the free list.
    pub(crate) fn is_free(&self, index: u32) -> bool {
        if decode_link(self.read_lead(index)).is_none() {
            return false;
        }
        // The mark can also be live user data: confirm by walking the list.
        let mut cursor = get!(self, free_head);
        let mut steps = 0;
        while cursor != NIL && steps <= self.capacity() {
            if cursor == index {
                return true;
            }
            cursor = decode_link(self.read_lead(cursor)).unwrap_or(NIL);
            steps += 1;
        }
        false
    }

    /// Puts slot `index` back on the free list and returns the remaining
    /// in-use count.
    pub(crate) fn push(&mut self, index: u32) -> usize {
        self.write_lead(index, encode_link(get!(self, free_head)));
        let in_use = get!(self, in_use) - 1;
        set!(self, free_head, index);
        set!(self, in_use, in_use);
        in_use as usize
    }

    /// Retires the tag and returns the page to `provider`.
    ///
    /// # Safety
    ///
    /// The slab must be unlinked from every chain and no copy of this handle
    /// may be used afterwards.
    pub(crate) unsafe fn destroy<P: PageProvider>(
        self,
        provider: &P,
        page_size: usize,
    ) -> Result<(), PageError> {
        let base = self.0.cast::<u8>();
        // SAFETY: the page is still mapped; after unmap nothing refers to it.
        unsafe {
            tag::retire(base.as_ptr());
            provider.unmap(base, page_size)
        }
    }
}
