//! Segregated free-list head table.
//!
//! This module owns the pure bookkeeping: which size class a block belongs
//! to, and the `freelist[i]` head array plus its bitmap. It has no idea how
//! to reach into a page and patch a neighbor's link fields — that's
//! [`crate::pool`]'s job, since it requires a mapped page. Keeping the two
//! separate mirrors the split between the teacher crate's pure
//! [`crate::bitmap`]-style bit math and its page-mapping-heavy segment code.

use crate::bitmap::FreeListBitmap;
use crate::config::PoolConfig;
use crate::handle::HeaderRef;

pub(crate) struct FreeListTable {
    heads: Vec<Option<HeaderRef>>,
    bitmap: FreeListBitmap,
    min_alloc: u32,
    max_alloc: u32,
    fl_delta: u32,
    fl_delta_shift: u32,
}

impl FreeListTable {
    pub(crate) fn new(config: &PoolConfig, num_classes: u32) -> Self {
        Self {
            heads: vec![None; num_classes as usize],
            bitmap: FreeListBitmap::new(num_classes),
            min_alloc: config.min_alloc,
            max_alloc: config.max_alloc,
            fl_delta: config.fl_delta,
            fl_delta_shift: config.fl_delta_shift(),
        }
    }

    /// `get_index` (§4.1): the smallest class guaranteed to satisfy a
    /// request of `size` bytes — rounds UP.
    pub(crate) fn class_for_search(&self, size: u32) -> u32 {
        let size = size.max(self.min_alloc);
        let aligned = size.div_ceil(self.fl_delta) * self.fl_delta;
        (aligned - self.min_alloc) >> self.fl_delta_shift
    }

    /// `get_index_for_insert` (§4.1): the largest class a free block of
    /// `size` bytes certainly satisfies — clamps and rounds DOWN.
    pub(crate) fn class_for_insert(&self, size: u32) -> u32 {
        let size = size.min(self.max_alloc);
        let rounded = (size / self.fl_delta) * self.fl_delta;
        (rounded - self.min_alloc) >> self.fl_delta_shift
    }

    /// `find_block` (§4.2): smallest non-empty class `>= class_for_search(size)`.
    pub(crate) fn find(&self, size: u32) -> Option<(u32, HeaderRef)> {
        let class = self.class_for_search(size);
        let found = self.bitmap.find_at_or_above(class)?;
        let head = self.heads[found as usize].expect("bitmap says class is non-empty");
        Some((found, head))
    }

    pub(crate) fn head(&self, class: u32) -> Option<HeaderRef> {
        self.heads[class as usize]
    }

    pub(crate) fn set_head(&mut self, class: u32, handle: Option<HeaderRef>) {
        self.heads[class as usize] = handle;
        match handle {
            Some(_) => self.bitmap.set(class),
            None => self.bitmap.clear(class),
        }
    }

    pub(crate) fn num_classes(&self) -> u32 {
        self.heads.len() as u32
    }

    pub(crate) fn is_class_set(&self, class: u32) -> bool {
        self.bitmap.is_set(class)
    }

    #[cfg(test)]
    pub(crate) fn is_empty_class(&self, class: u32) -> bool {
        !self.is_class_set(class)
    }
}
