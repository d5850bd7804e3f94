//! The page provider contract, and a concrete in-process implementation.
//!
//! The allocator core never assumes a page's bytes are addressable except
//! through a short-lived [`MappedPage`] — the same discipline a caller
//! backed by highmem or a remote page server would need. [`SystemPageSource`]
//! is the default, boring implementation: it hands out anonymous
//! page-aligned memory via this workspace's own [`sys_alloc`] crate (the
//! same primitive the teacher GC crate vendors for its page-aligned segment
//! allocations) and "maps" a page by simply returning the pointer it
//! already owns, since in-process pages never leave CPU-addressable memory.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use sys_alloc::{Mmap, MmapOptions};

use crate::handle::PageHandle;

/// Whether page growth may block the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrowthPolicy {
    /// `allocate` may call into the page source's (possibly blocking)
    /// growth path when no existing page satisfies the request.
    #[default]
    Blocking,
    /// A cache miss that would require growth fails fast with
    /// [`crate::PoolError::OutOfMemory`] instead.
    NonBlocking,
}

/// Which of the (at most two) concurrent transient mappings an operation is
/// using. The allocator never holds more than a primary block's page and
/// one neighbor's page mapped at once (§5); using distinct slots for the
/// two keeps their transient addresses from aliasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingSlot {
    /// The page of the block an operation is primarily operating on.
    Primary = 0,
    /// The page of a neighboring block being patched during a link update
    /// or coalesce.
    Neighbor = 1,
}

/// Supplies and reclaims fixed-size backing pages.
///
/// Implementations never need to keep a page's bytes addressable outside of
/// a [`MappedPage`]; the pool never caches raw pointers across operations.
pub trait PageSource: Send + Sync {
    /// Size of every page this source hands out, in bytes.
    fn page_size(&self) -> u32;

    /// Acquires one fresh page. Returns `None` on failure — including, for
    /// [`GrowthPolicy::NonBlocking`] sources, a refusal to block.
    fn alloc_page(&self, policy: GrowthPolicy) -> Option<PageHandle>;

    /// Returns a page to the source. The pool only calls this once a page's
    /// last block has merged into a single whole-page free block.
    fn free_page(&self, page: PageHandle);

    /// Yields a short-lived addressable view of `page` under `slot`.
    ///
    /// # Panics
    /// Implementations should panic (or otherwise fail loudly) if `slot` is
    /// already mapped — that indicates the allocator violated its own
    /// two-mapping discipline.
    fn map(&self, page: PageHandle, slot: MappingSlot) -> MappedPage<'_>;
}

/// An RAII view of one page's bytes, released on drop.
///
/// This folds the C-API shape of `map_transient`/`unmap_transient` into a
/// single guard, the idiomatic Rust translation of a paired acquire/release.
pub struct MappedPage<'a> {
    ptr: NonNull<u8>,
    len: usize,
    on_drop: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> MappedPage<'a> {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize, on_drop: impl FnOnce() + 'a) -> Self {
        Self { ptr, len, on_drop: Some(Box::new(on_drop)) }
    }

    /// Raw pointer to the start of the mapped page.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapped region in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapped region is empty (never true for a real page).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for MappedPage<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` bytes for the lifetime of this
        // guard, per the `PageSource::map` contract.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for MappedPage<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `Deref`; this guard has exclusive Rust-side access
        // because the pool never maps the same slot twice concurrently.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedPage<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.on_drop.take() {
            release();
        }
    }
}

/// Default [`PageSource`]: pages are anonymous memory mappings owned by this
/// process, tracked in a slot table keyed by page handle.
pub struct SystemPageSource {
    page_size: u32,
    pages: RwLock<Vec<Option<Mmap>>>,
    slot_busy: [AtomicBool; 2],
}

impl SystemPageSource {
    /// Creates a source handing out standard 4096-byte pages.
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(4096)
    }

    /// Creates a source handing out `page_size`-byte pages.
    #[must_use]
    pub fn with_page_size(page_size: u32) -> Self {
        Self {
            page_size,
            pages: RwLock::new(Vec::new()),
            slot_busy: [AtomicBool::new(false), AtomicBool::new(false)],
        }
    }

    /// Number of pages currently held live by this source.
    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.pages.read().iter().filter(|p| p.is_some()).count()
    }
}

impl Default for SystemPageSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for SystemPageSource {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn alloc_page(&self, _policy: GrowthPolicy) -> Option<PageHandle> {
        // SAFETY: length is non-zero (checked by MmapOptions) and we only
        // ever read/write within the mapping's own bounds.
        let mmap = unsafe { MmapOptions::new().len(self.page_size as usize).map_anon().ok()? };

        let mut pages = self.pages.write();
        if let Some(slot) = pages.iter().position(Option::is_none) {
            pages[slot] = Some(mmap);
            #[allow(clippy::cast_possible_truncation)]
            return Some(PageHandle::new(slot as u32 + 1));
        }
        pages.push(Some(mmap));
        #[allow(clippy::cast_possible_truncation)]
        Some(PageHandle::new(pages.len() as u32))
    }

    fn free_page(&self, page: PageHandle) {
        let idx = (page.get() - 1) as usize;
        let mut pages = self.pages.write();
        assert!(pages.get(idx).is_some_and(Option::is_some), "free_page called on an unknown page");
        pages[idx] = None; // drops the Mmap, which unmaps the memory.
    }

    fn map(&self, page: PageHandle, slot: MappingSlot) -> MappedPage<'_> {
        let idx = (page.get() - 1) as usize;
        let (ptr, len) = {
            let pages = self.pages.read();
            let mmap = pages
                .get(idx)
                .and_then(Option::as_ref)
                .expect("map() called on a freed or unallocated page");
            (mmap.ptr(), mmap.len())
        };

        let busy = &self.slot_busy[slot as usize];
        assert!(
            !busy.swap(true, Ordering::AcqRel),
            "mapping slot {slot:?} already in use: violates the at-most-two-concurrent-mappings contract"
        );

        MappedPage::new(NonNull::new(ptr).expect("mmap never returns null on success"), len, move || {
            busy.store(false, Ordering::Release);
        })
    }
}
