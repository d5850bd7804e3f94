//! The allocator surface: `allocate`, `free`, and the split/coalesce logic
//! that keeps the segregated free lists and boundary tags consistent.
//!
//! Every public operation takes the pool's single [`parking_lot::Mutex`] for
//! its bookkeeping (the free-list heads, the bitmap, the page count) and
//! maps at most one page at a time while holding it — never two concurrently
//! — so a provider backed by real transient mappings never sees aliasing
//! across a `Primary`/`Neighbor` pair. See [`crate::page`] for why that
//! distinction still exists even though this implementation never needs
//! true concurrency between the two.

use parking_lot::Mutex;

use crate::block;
use crate::config::{PoolConfig, HEADER_SIZE};
use crate::error::PoolError;
use crate::freelist::FreeListTable;
use crate::handle::{BlockHandle, HeaderRef, PageHandle};
use crate::metrics::{Metrics, PoolStats};
use crate::page::{GrowthPolicy, MappingSlot, PageSource};

struct PoolState {
    freelist: FreeListTable,
    total_pages: u64,
}

/// A segregated-fit pool allocator packing many small objects into pages
/// drawn from a [`PageSource`].
pub struct Pool<S: PageSource> {
    source: S,
    config: PoolConfig,
    state: Mutex<PoolState>,
    metrics: Metrics,
}

const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

impl<S: PageSource> Pool<S> {
    /// Creates a pool with the default geometry (see [`PoolConfig::default`]).
    pub fn new(source: S) -> Self {
        Self::with_config(source, PoolConfig::default()).expect("PoolConfig::default is always valid")
    }

    /// Creates a pool with a custom geometry.
    ///
    /// # Errors
    /// Returns [`PoolError::InvalidConfig`] if `config` violates one of the
    /// allocator's geometric invariants.
    pub fn with_config(source: S, config: PoolConfig) -> Result<Self, PoolError> {
        let num_classes = config.validate()?;
        Ok(Self {
            source,
            config,
            state: Mutex::new(PoolState { freelist: FreeListTable::new(&config, num_classes), total_pages: 0 }),
            metrics: Metrics::default(),
        })
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// # Errors
    /// [`PoolError::InvalidSize`] if `size` is zero or exceeds the pool's
    /// `max_alloc`. [`PoolError::OutOfMemory`] if no existing page can
    /// satisfy the request and either the page source is exhausted or
    /// `policy` is [`GrowthPolicy::NonBlocking`].
    pub fn allocate(&self, size: u32, policy: GrowthPolicy) -> Result<BlockHandle, PoolError> {
        if size == 0 || size > self.config.max_alloc {
            return Err(PoolError::InvalidSize);
        }
        let aligned = align_up(size, HEADER_SIZE);

        let mut state = self.state.lock();
        let mut found = state.freelist.find(aligned);
        if found.is_none() {
            drop(state);
            if policy == GrowthPolicy::NonBlocking {
                return Err(PoolError::OutOfMemory);
            }
            self.grow(policy)?;
            state = self.state.lock();
            found = state.freelist.find(aligned);
        }
        let (class, head) = found.ok_or(PoolError::OutOfMemory)?;
        self.remove_block_head(&mut state.freelist, class);

        let free_size = self.read_size(head);
        let remainder = free_size - aligned;
        let remainder_header = HeaderRef::new(head.page, head.header_offset + aligned + HEADER_SIZE);

        if remainder > 0 {
            let remainder_payload_size = remainder - HEADER_SIZE;
            self.init_block(remainder_header, remainder_payload_size, head.header_offset);
            if remainder_payload_size >= self.config.min_alloc {
                self.insert_free_block(&mut state.freelist, remainder_header, remainder_payload_size);
            }
            let after_offset = remainder_header.header_offset + HEADER_SIZE + remainder_payload_size;
            if after_offset != self.config.page_size {
                self.set_prev_offset(HeaderRef::new(remainder_header.page, after_offset), remainder_header.header_offset);
            }
        } else if remainder_header.header_offset != self.config.page_size {
            self.set_prev_free(remainder_header, false);
        }

        self.write_size(head, size);
        self.set_free(head, false);
        self.metrics.record_alloc();

        #[cfg(feature = "tracing")]
        tracing::trace!(size, aligned, class, page = head.page.get(), offset = head.header_offset, "allocated block");

        Ok(BlockHandle::new(head.page, head.header_offset + HEADER_SIZE))
    }

    /// Returns a block to the pool, coalescing with free neighbors and
    /// releasing the backing page if it becomes entirely free.
    ///
    /// # Panics
    /// Panics on a double free: freeing a handle whose block is already
    /// marked free indicates a bug in the caller, not a recoverable error.
    pub fn free(&self, handle: BlockHandle) {
        let header = HeaderRef::new(handle.page(), handle.offset() - HEADER_SIZE);
        let mut state = self.state.lock();

        let stored_size = self.read_size(header);
        if self.read_is_free(header) {
            #[cfg(feature = "tracing")]
            tracing::error!(page = header.page.get(), header_offset = header.header_offset, "double free detected");
            panic!("double free of block {header:?}");
        }

        let mut merged_size = align_up(stored_size, HEADER_SIZE);
        let mut merge_header = header;

        let next_offset = header.header_offset + merged_size + HEADER_SIZE;
        if next_offset != self.config.page_size {
            let next = HeaderRef::new(header.page, next_offset);
            if self.read_is_free(next) {
                let next_size = self.read_size(next);
                if next_size >= self.config.min_alloc {
                    self.remove_block(&mut state.freelist, next, next_size);
                }
                merged_size += next_size + HEADER_SIZE;
            }
        }

        if self.read_is_prev_free(header) {
            let prev = HeaderRef::new(header.page, self.read_prev_offset(header));
            let prev_size = self.read_size(prev);
            if prev_size >= self.config.min_alloc {
                self.remove_block(&mut state.freelist, prev, prev_size);
            }
            merged_size += prev_size + HEADER_SIZE;
            merge_header = prev;
        }

        if merged_size == self.config.page_size - HEADER_SIZE {
            self.source.free_page(merge_header.page);
            state.total_pages -= 1;
            self.metrics.record_free(true);
            return;
        }

        self.write_size(merge_header, merged_size);
        self.set_free(merge_header, true);
        if merged_size >= self.config.min_alloc {
            self.insert_free_block(&mut state.freelist, merge_header, merged_size);
        }

        let after_offset = merge_header.header_offset + HEADER_SIZE + merged_size;
        if after_offset != self.config.page_size {
            let after = HeaderRef::new(merge_header.page, after_offset);
            self.set_prev_free(after, true);
            self.set_prev_offset(after, merge_header.header_offset);
        }

        self.metrics.record_free(false);

        #[cfg(feature = "tracing")]
        tracing::trace!(page = header.page.get(), header_offset = header.header_offset, "freed block");
    }

    /// The size originally requested for the block at `handle`.
    #[must_use]
    pub fn object_size(&self, handle: BlockHandle) -> u32 {
        let header = HeaderRef::new(handle.page(), handle.offset() - HEADER_SIZE);
        self.read_size(header)
    }

    /// Total bytes currently held by the pool (pages acquired from the
    /// source, whether or not every byte is in use).
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        let state = self.state.lock();
        u64::from(state.total_pages) * u64::from(self.config.page_size)
    }

    /// A snapshot of this pool's lifetime activity counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.metrics.snapshot()
    }

    /// Walks every page in `live_pages` and the free-list table, checking the
    /// structural invariants the allocator depends on: bitmap/head-table
    /// agreement, exact page tiling, no two adjacent free blocks, and
    /// `PREV_FREE`/`prev_offset` agreement with the actual predecessor.
    ///
    /// `live_pages` must be exactly the set of pages the caller currently
    /// holds at least one live allocation on — every page the pool holds
    /// always has at least one live block, since a page with none is
    /// reclaimed immediately in [`Self::free`], so a caller that tracks its
    /// own live handles can derive this set without reaching into the pool.
    ///
    /// Not part of the public API: reachable only through
    /// [`crate::test_util`], for the randomized stress test.
    pub(crate) fn debug_check_invariants(&self, live_pages: &[PageHandle]) -> Result<(), String> {
        {
            let state = self.state.lock();
            for class in 0..state.freelist.num_classes() {
                let has_head = state.freelist.head(class).is_some();
                if state.freelist.is_class_set(class) != has_head {
                    return Err(format!("class {class}: bitmap bit disagrees with head-table occupancy"));
                }
            }
        }

        for &page in live_pages {
            let mut offset = 0u32;
            let mut prev: Option<(bool, u32)> = None;

            while offset < self.config.page_size {
                let h = HeaderRef::new(page, offset);
                let is_free = self.read_is_free(h);
                let claims_prev_free = self.read_is_prev_free(h);

                match prev {
                    None if claims_prev_free => {
                        return Err(format!("page {page:?}: first block claims a predecessor"));
                    }
                    Some((was_free, was_offset)) => {
                        if was_free && is_free {
                            return Err(format!(
                                "page {page:?}: adjacent free blocks at {was_offset} and {offset}"
                            ));
                        }
                        if claims_prev_free != was_free {
                            return Err(format!(
                                "page {page:?} offset {offset}: PREV_FREE={claims_prev_free} but predecessor free={was_free}"
                            ));
                        }
                        if claims_prev_free && self.read_prev_offset(h) != was_offset {
                            return Err(format!(
                                "page {page:?} offset {offset}: prev_offset does not name its immediate predecessor"
                            ));
                        }
                    }
                    None => {}
                }

                let stored = self.read_size(h);
                let payload = if is_free { stored } else { align_up(stored, HEADER_SIZE) };
                prev = Some((is_free, offset));
                offset += HEADER_SIZE + payload;
            }

            if offset != self.config.page_size {
                return Err(format!("page {page:?}: block chain does not tile exactly (ended at {offset})"));
            }
        }

        Ok(())
    }

    fn grow(&self, policy: GrowthPolicy) -> Result<(), PoolError> {
        let page = self.source.alloc_page(policy).ok_or(PoolError::OutOfMemory)?;
        let header = HeaderRef::new(page, 0);
        let payload_size = self.config.page_size - HEADER_SIZE;

        let mut state = self.state.lock();
        self.init_block(header, payload_size, 0);
        self.insert_free_block(&mut state.freelist, header, payload_size);
        state.total_pages += 1;
        let total = state.total_pages;
        drop(state);

        self.metrics.record_grow(total);
        #[cfg(feature = "tracing")]
        tracing::debug!(page = page.get(), total_pages = total, "grew pool by one page");
        Ok(())
    }

    // -- segregated free-list maintenance (§4.2-§4.3) ----------------------

    fn insert_free_block(&self, freelist: &mut FreeListTable, h: HeaderRef, size: u32) {
        let class = freelist.class_for_insert(size);
        let old_head = freelist.head(class);
        self.set_prev_link(h, None);
        self.set_next_link(h, old_head.map(as_link));
        if let Some(old) = old_head {
            self.set_prev_link(old, Some(as_link(h)));
        }
        freelist.set_head(class, Some(h));
    }

    fn remove_block_head(&self, freelist: &mut FreeListTable, class: u32) -> HeaderRef {
        let head = freelist.head(class).expect("bitmap/head table inconsistency");
        let next = self.get_next_link(head).map(from_link);
        freelist.set_head(class, next);
        if let Some(next) = next {
            self.set_prev_link(next, None);
        }
        head
    }

    fn remove_block(&self, freelist: &mut FreeListTable, h: HeaderRef, size: u32) {
        let class = freelist.class_for_insert(size);
        if freelist.head(class) == Some(h) {
            let removed = self.remove_block_head(freelist, class);
            debug_assert_eq!(removed, h);
            return;
        }

        let prev = self.get_prev_link(h);
        let next = self.get_next_link(h);
        if let Some(p) = prev.map(from_link) {
            self.set_next_link(p, next);
        }
        if let Some(n) = next.map(from_link) {
            self.set_prev_link(n, prev);
        }
    }

    // -- single-page header accessors ---------------------------------
    //
    // Each of these maps exactly one page, performs its reads/writes, and
    // drops the mapping before returning. None of them are ever nested, so
    // only one `MappedPage` is ever alive at a time regardless of the slot
    // passed to `PageSource::map`.

    fn read_size(&self, h: HeaderRef) -> u32 {
        let mapped = self.source.map(h.page, MappingSlot::Primary);
        unsafe { block::size(mapped.as_ptr(), h.header_offset) }
    }

    fn read_is_free(&self, h: HeaderRef) -> bool {
        let mapped = self.source.map(h.page, MappingSlot::Primary);
        unsafe { block::is_free(mapped.as_ptr(), h.header_offset) }
    }

    fn read_is_prev_free(&self, h: HeaderRef) -> bool {
        let mapped = self.source.map(h.page, MappingSlot::Primary);
        unsafe { block::is_prev_free(mapped.as_ptr(), h.header_offset) }
    }

    fn read_prev_offset(&self, h: HeaderRef) -> u32 {
        let mapped = self.source.map(h.page, MappingSlot::Primary);
        unsafe { block::prev_offset(mapped.as_ptr(), h.header_offset) }
    }

    fn write_size(&self, h: HeaderRef, size: u32) {
        let mapped = self.source.map(h.page, MappingSlot::Primary);
        unsafe { block::set_size(mapped.as_ptr(), h.header_offset, size) }
    }

    fn set_free(&self, h: HeaderRef, free: bool) {
        let mapped = self.source.map(h.page, MappingSlot::Primary);
        unsafe { block::set_free(mapped.as_ptr(), h.header_offset, free) }
    }

    fn set_prev_free(&self, h: HeaderRef, prev_free: bool) {
        let mapped = self.source.map(h.page, MappingSlot::Neighbor);
        unsafe { block::set_prev_free(mapped.as_ptr(), h.header_offset, prev_free) }
    }

    fn set_prev_offset(&self, h: HeaderRef, prev: u32) {
        let mapped = self.source.map(h.page, MappingSlot::Neighbor);
        unsafe { block::set_prev_offset(mapped.as_ptr(), h.header_offset, prev) }
    }

    fn init_block(&self, h: HeaderRef, size: u32, prev: u32) {
        let mapped = self.source.map(h.page, MappingSlot::Primary);
        unsafe { block::init(mapped.as_ptr(), h.header_offset, size, prev) }
    }

    fn get_prev_link(&self, h: HeaderRef) -> block::Link {
        let mapped = self.source.map(h.page, MappingSlot::Neighbor);
        unsafe { block::read_prev_link(mapped.as_ptr(), h.header_offset, HEADER_SIZE) }
    }

    fn get_next_link(&self, h: HeaderRef) -> block::Link {
        let mapped = self.source.map(h.page, MappingSlot::Neighbor);
        unsafe { block::read_next_link(mapped.as_ptr(), h.header_offset, HEADER_SIZE) }
    }

    fn set_prev_link(&self, h: HeaderRef, link: block::Link) {
        let mapped = self.source.map(h.page, MappingSlot::Neighbor);
        unsafe { block::write_prev_link(mapped.as_ptr(), h.header_offset, HEADER_SIZE, link) }
    }

    fn set_next_link(&self, h: HeaderRef, link: block::Link) {
        let mapped = self.source.map(h.page, MappingSlot::Neighbor);
        unsafe { block::write_next_link(mapped.as_ptr(), h.header_offset, HEADER_SIZE, link) }
    }
}

impl<S: PageSource> Drop for Pool<S> {
    fn drop(&mut self) {
        let total_pages = self.state.lock().total_pages;
        debug_assert_eq!(total_pages, 0, "pool dropped with {total_pages} page(s) still live: free every allocation first");
    }
}

fn as_link(h: HeaderRef) -> (PageHandle, u32) {
    (h.page, h.header_offset)
}

fn from_link((page, header_offset): (PageHandle, u32)) -> HeaderRef {
    HeaderRef::new(page, header_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::SystemPageSource;

    fn small_pool() -> Pool<SystemPageSource> {
        Pool::new(SystemPageSource::new())
    }

    const fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn pool_is_send_and_sync() {
        assert_send_sync::<Pool<SystemPageSource>>();
    }

    #[test]
    fn allocate_then_free_round_trips() {
        let pool = small_pool();
        let h = pool.allocate(100, GrowthPolicy::Blocking).unwrap();
        assert_eq!(pool.object_size(h), 100);
        assert_eq!(pool.total_bytes(), 4096);
        pool.free(h);
        assert_eq!(pool.total_bytes(), 0, "last block freed should reclaim the page");
    }

    #[test]
    fn zero_size_is_rejected() {
        let pool = small_pool();
        assert_eq!(pool.allocate(0, GrowthPolicy::Blocking), Err(PoolError::InvalidSize));
    }

    #[test]
    fn oversized_request_is_rejected() {
        let pool = small_pool();
        let too_big = PoolConfig::default().max_alloc + 1;
        assert_eq!(pool.allocate(too_big, GrowthPolicy::Blocking), Err(PoolError::InvalidSize));
    }

    #[test]
    fn non_blocking_growth_fails_fast_on_empty_pool() {
        let pool = small_pool();
        assert_eq!(pool.allocate(100, GrowthPolicy::NonBlocking), Err(PoolError::OutOfMemory));
    }

    #[test]
    fn distinct_allocations_do_not_overlap() {
        let pool = small_pool();
        let a = pool.allocate(100, GrowthPolicy::Blocking).unwrap();
        let b = pool.allocate(200, GrowthPolicy::Blocking).unwrap();
        assert!(a.page() != b.page() || a.offset() + 100 <= b.offset() || b.offset() + 200 <= a.offset());
        pool.free(a);
        pool.free(b);
    }

    #[test]
    fn freeing_middle_block_coalesces_with_both_neighbors() {
        let pool = small_pool();
        let a = pool.allocate(100, GrowthPolicy::Blocking).unwrap();
        let b = pool.allocate(100, GrowthPolicy::Blocking).unwrap();
        let c = pool.allocate(100, GrowthPolicy::Blocking).unwrap();
        pool.free(a);
        pool.free(c);
        pool.free(b); // merges a-gap, b, and c-gap into one page-sized free block
        assert_eq!(pool.total_bytes(), 0);
    }

    #[test]
    fn growing_across_multiple_pages() {
        let pool = small_pool();
        let max = PoolConfig::default().max_alloc;
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(pool.allocate(max, GrowthPolicy::Blocking).unwrap());
        }
        assert!(pool.total_bytes() >= 4096 * 2, "four near-page-sized allocations need more than one page");
        for h in handles {
            pool.free(h);
        }
        assert_eq!(pool.total_bytes(), 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let pool = small_pool();
        let h = pool.allocate(64, GrowthPolicy::Blocking).unwrap();
        pool.free(h);
        pool.free(h);
    }

    #[test]
    fn stats_track_allocations_and_growth() {
        let pool = small_pool();
        let h = pool.allocate(64, GrowthPolicy::Blocking).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.pages_grown, 1);
        assert_eq!(stats.peak_pages, 1);
        pool.free(h);
        assert_eq!(pool.stats().frees, 1);
        assert_eq!(pool.stats().pages_reclaimed, 1);
    }
}
