//! End-to-end allocator behavior: round-tripping, boundary sizes, and a
//! randomized churn test checked against a shadow model.

use poolalloc::{test_util, BlockHandle, GrowthPolicy, PageHandle, Pool, PoolConfig, SystemPageSource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

fn pool() -> Pool<SystemPageSource> {
    Pool::new(SystemPageSource::new())
}

#[test]
fn round_trip_preserves_requested_size() {
    let p = pool();
    for size in [1u32, 2, 15, 16, 17, 100, 4076] {
        let h = p.allocate(size, GrowthPolicy::Blocking).unwrap();
        assert_eq!(p.object_size(h), size, "size {size} did not round-trip");
        p.free(h);
    }
}

#[test]
fn min_and_max_alloc_boundaries() {
    let cfg = PoolConfig::default();
    let p = pool();
    let min = p.allocate(cfg.min_alloc, GrowthPolicy::Blocking).unwrap();
    let max = p.allocate(1, GrowthPolicy::Blocking).unwrap();
    assert_eq!(p.object_size(min), cfg.min_alloc);
    p.free(min);
    p.free(max);

    assert!(p.allocate(cfg.max_alloc + 1, GrowthPolicy::Blocking).is_err());
    let at_max = p.allocate(cfg.max_alloc, GrowthPolicy::Blocking).unwrap();
    assert_eq!(p.object_size(at_max), cfg.max_alloc);
    p.free(at_max);
}

#[test]
fn many_allocations_do_not_overlap() {
    let p = pool();
    let sizes: Vec<u32> = (1..=50).map(|i| i * 40).collect();
    let handles: Vec<_> = sizes.iter().map(|&s| p.allocate(s, GrowthPolicy::Blocking).unwrap()).collect();

    let mut spans: Vec<(u32, u32, u32)> = Vec::new(); // (page, start, end)
    for (&size, &h) in sizes.iter().zip(&handles) {
        spans.push((h.page().get(), h.offset(), h.offset() + size));
    }
    for i in 0..spans.len() {
        for j in (i + 1)..spans.len() {
            if spans[i].0 == spans[j].0 {
                let (_, a_start, a_end) = spans[i];
                let (_, b_start, b_end) = spans[j];
                assert!(a_end <= b_start || b_end <= a_start, "blocks {i} and {j} overlap");
            }
        }
    }

    for h in handles {
        p.free(h);
    }
    assert_eq!(p.total_bytes(), 0);
}

#[test]
fn full_page_worth_of_exact_fits_is_reclaimed() {
    let cfg = PoolConfig::default();
    let p = pool();
    let per_block = cfg.min_alloc;
    let usable = cfg.page_size - poolalloc::HEADER_SIZE;
    let count = usable / (per_block + poolalloc::HEADER_SIZE);

    let mut handles = Vec::new();
    for _ in 0..count {
        handles.push(p.allocate(per_block, GrowthPolicy::Blocking).unwrap());
    }
    for h in handles {
        p.free(h);
    }
    assert_eq!(p.total_bytes(), 0, "every block on the page was freed, page should be reclaimed");
}

/// The set of distinct pages a shadow model's live handles sit on. Every
/// page the pool holds always carries at least one live block (a page with
/// none is reclaimed immediately on free), so this is exactly the set of
/// pages [`test_util::check_invariants`] needs to walk.
fn live_pages(live: &HashMap<u64, (BlockHandle, u32)>) -> Vec<PageHandle> {
    let mut pages: Vec<PageHandle> = live.values().map(|(h, _)| h.page()).collect();
    pages.sort_by_key(|p| p.get());
    pages.dedup();
    pages
}

/// Randomized allocate/free churn checked against a shadow `(handle -> size)`
/// model with a fixed seed for reproducibility: every live handle's
/// `object_size` must always match what was requested, the pool's byte
/// accounting must never leak after everything drains, and the allocator's
/// internal invariants (bitmap/free-list agreement, page tiling, no
/// adjacent free blocks, `PREV_FREE`/`prev_offset` correctness) must hold
/// after every single operation, not just at the end — a boundary-tag or
/// bitmap corruption that happens to leave `object_size`/`total_bytes`
/// looking right would otherwise go undetected.
#[test]
fn randomized_churn_matches_shadow_model() {
    let cfg = PoolConfig::default();
    let p = pool();
    let mut live: HashMap<u64, (BlockHandle, u32)> = HashMap::new();
    let mut next_id = 0u64;
    let mut rng = StdRng::seed_from_u64(0xA110_C8ED);

    for _ in 0..2_000 {
        let do_alloc = live.is_empty() || rng.gen_bool(0.6);
        if do_alloc {
            let size = rng.gen_range(1..=cfg.max_alloc);
            if let Ok(h) = p.allocate(size, GrowthPolicy::Blocking) {
                assert_eq!(p.object_size(h), size);
                live.insert(next_id, (h, size));
                next_id += 1;
            }
        } else {
            let victim = *live.keys().next().unwrap();
            let (h, size) = live.remove(&victim).unwrap();
            assert_eq!(p.object_size(h), size, "size must still match right before free");
            p.free(h);
        }

        test_util::check_invariants(&p, &live_pages(&live)).expect("invariants must hold after every operation");
    }

    let drained: Vec<(BlockHandle, u32)> = live.drain().map(|(_, v)| v).collect();
    for (h, size) in drained {
        assert_eq!(p.object_size(h), size);
        p.free(h);
        test_util::check_invariants(&p, &live_pages(&live)).expect("invariants must hold while draining");
    }

    assert_eq!(p.total_bytes(), 0, "draining every live allocation must reclaim every page");
    let stats = p.stats();
    assert_eq!(stats.pages_grown, stats.pages_reclaimed, "every grown page was eventually reclaimed");
}
