//! Page tags.
//!
//! The first word of every page the allocator owns says what the page is.
//! Release reads this word before trusting anything else in the page. Tags
//! are a magic constant XORed with the page base, so the same bytes copied
//! to a different page do not validate.

/// Marks a slab page.
const SLAB_MAGIC: u64 = 0x51AB_C1A5_5E5B_0A7D;
/// Marks a large-object page.
const LARGE_MAGIC: u64 = 0x1A26_E0B1_EC7D_A7A5;
/// Written over the tag just before a page goes back to the provider.
const RETIRED_MAGIC: u64 = 0xDEAD_9A6E_0000_0001;

/// Kinds of live page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Slab,
    Large,
}

impl PageKind {
    const fn magic(self) -> u64 {
        match self {
            Self::Slab => SLAB_MAGIC,
            Self::Large => LARGE_MAGIC,
        }
    }

    /// The tag word for a page of this kind at `base`.
    #[must_use]
    pub const fn stamp(self, base: usize) -> u64 {
        self.magic() ^ base as u64
    }
}

/// What the first word of a page decodes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTag {
    Slab,
    Large,
    /// A page this allocator already handed back.
    Retired,
    /// Anything else, with the raw word.
    Unknown(u64),
}

impl PageTag {
    /// Decodes the tag word read at `base`.
    #[must_use]
    pub const fn decode(word: u64, base: usize) -> Self {
        match word ^ base as u64 {
            SLAB_MAGIC => Self::Slab,
            LARGE_MAGIC => Self::Large,
            RETIRED_MAGIC => Self::Retired,
            _ => Self::Unknown(word),
        }
    }
}

/// Stamps `base` as a page of `kind`.
///
/// # Safety
///
/// `base` must be the writable, 8-byte-aligned start of a page.
pub(crate) unsafe fn write(base: *mut u8, kind: PageKind) {
    // SAFETY: caller guarantees a writable aligned word at base.
    unsafe { base.cast::<u64>().write(kind.stamp(base as usize)) };
}

/// Overwrites the tag at `base` with the retired marker.
///
/// # Safety
///
/// Same as [`write`].
pub(crate) unsafe fn retire(base: *mut u8) {
    // SAFETY: caller guarantees a writable aligned word at base.
    unsafe { base.cast::<u64>().write(RETIRED_MAGIC ^ base as u64) };
}

/// Reads and decodes the tag of the `page_size` page containing `ptr`.
///
/// # Safety
///
/// The page containing `ptr` must be mapped and readable.
#[must_use]
pub unsafe fn read(ptr: *const u8, page_size: usize) -> PageTag {
    let base = crate::page::page_base(ptr as usize, page_size);
    // SAFETY: caller guarantees the page is readable; base is page aligned.
    let word = unsafe { (base as *const u64).read() };
    PageTag::decode(word, base)
}
