// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Framebuffer pool recycling, eviction, and teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use sluice_core::{
    DumbAllocator, Error, Fourcc, Framebuffer, FramebufferAllocator, Modifier, Pool, PoolConfig,
    Result,
};
use sluice_harness::{AllocCounter, CountingAllocator, FakeDevice, fake_card, init_test_tracing};

const FMT: Fourcc = Fourcc::XRGB8888;
const LIN: Modifier = Modifier::LINEAR;

fn pool(max_count: usize) -> (Arc<FakeDevice>, Pool, AllocCounter) {
    let (dev, card) = fake_card();
    let alloc = CountingAllocator::new(DumbAllocator::new(card));
    let counter = alloc.counter();
    let pool = Pool::new(alloc, PoolConfig::default().with_max_count(max_count));
    (dev, pool, counter)
}

#[test]
fn released_framebuffer_is_reused() {
    init_test_tracing();
    let (_dev, pool, counter) = pool(2);

    let a = pool.acquire(100, 100, FMT, LIN).unwrap();
    let _b = pool.acquire(100, 100, FMT, LIN).unwrap();
    let a_id = a.id();
    drop(a);
    let c = pool.acquire(100, 100, FMT, LIN).unwrap();

    assert_eq!(c.id(), a_id, "C reuses A's allocation");
    assert_eq!(counter.calls(), 2, "no third allocator call");
    let stats = pool.stats();
    assert_eq!(stats.reuses, 1);
    assert_eq!(stats.in_use_or_free, 2);
}

#[test]
fn reuse_requires_matching_geometry() {
    let (_dev, pool, counter) = pool(4);
    drop(pool.acquire(64, 64, FMT, LIN).unwrap());
    let other = pool.acquire(64, 32, FMT, LIN).unwrap();
    assert_eq!((other.width(), other.height()), (64, 32));
    assert_eq!(counter.calls(), 2);
    let other_fmt = pool.acquire(64, 64, Fourcc::ARGB8888, LIN).unwrap();
    assert_eq!(other_fmt.format(), Fourcc::ARGB8888);
    assert_eq!(counter.calls(), 3);
}

#[test]
fn full_pool_evicts_least_recently_freed() {
    let (dev, pool, counter) = pool(2);
    let a = pool.acquire(10, 10, FMT, LIN).unwrap();
    let b = pool.acquire(20, 20, FMT, LIN).unwrap();
    let (a_id, b_id) = (a.id(), b.id());
    drop(a);
    drop(b);

    let c = pool.acquire(30, 30, FMT, LIN).unwrap();
    assert_eq!(counter.calls(), 3);
    assert!(dev.framebuffer(a_id).is_none(), "A was freed first and evicted");
    assert!(dev.framebuffer(b_id).is_some(), "B stays on the free list");
    let stats = pool.stats();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.free, 1);
    assert!(stats.in_use_or_free <= stats.max_count, "{stats:?}");
    drop(c);
}

#[test]
fn full_pool_without_free_entries_is_exhausted() {
    let (_dev, pool, _counter) = pool(1);
    let _held = pool.acquire(8, 8, FMT, LIN).unwrap();
    assert!(matches!(
        pool.acquire(8, 8, FMT, LIN),
        Err(Error::ResourceExhausted(_))
    ));
}

#[test]
fn allocator_failure_rolls_back_the_reservation() {
    let (_dev, pool, counter) = pool(1);
    counter.fail_next();
    assert!(pool.acquire(8, 8, FMT, LIN).is_err(), "injected failure");
    assert_eq!(pool.stats().in_use_or_free, 0);
    pool.acquire(8, 8, FMT, LIN).unwrap();
}

#[test]
fn zero_capacity_is_promoted_to_one() {
    let (_dev, pool, _counter) = pool(0);
    assert_eq!(pool.stats().max_count, 1);
    pool.acquire(8, 8, FMT, LIN).unwrap();
}

#[test]
fn kill_destroys_free_entries_and_outstanding_ones_later() {
    let (dev, pool, _counter) = pool(3);
    let kept = pool.acquire(16, 16, FMT, LIN).unwrap();
    drop(pool.acquire(16, 16, FMT, LIN).unwrap());
    drop(pool.acquire(32, 32, FMT, LIN).unwrap());
    assert_eq!(pool.stats().free, 2);

    pool.kill();
    assert_eq!(dev.counters().framebuffers_removed, 2, "free entries destroyed");

    let kept_id = kept.id();
    assert!(dev.framebuffer(kept_id).is_some(), "in-use framebuffer survives kill");
    drop(kept);
    assert!(dev.framebuffer(kept_id).is_none(), "destroyed, not recycled");
    assert_eq!(dev.counters().live_handles, 0);
}

#[test]
fn concurrent_acquire_and_release_respects_capacity() {
    let (_dev, pool, _counter) = pool(4);
    let pool = Arc::new(pool);
    let peak = Arc::new(AtomicUsize::new(0));

    thread::scope(|s| {
        for t in 0..4_u32 {
            let pool = Arc::clone(&pool);
            let peak = Arc::clone(&peak);
            s.spawn(move || {
                for i in 0..50_u32 {
                    let size = 8 + (t + i) % 3;
                    if let Ok(fb) = pool.acquire(size, size, FMT, LIN) {
                        let stats = pool.stats();
                        peak.fetch_max(stats.in_use_or_free, Ordering::SeqCst);
                        drop(fb);
                    }
                }
            });
        }
    });

    assert!(peak.load(Ordering::SeqCst) <= 4, "capacity exceeded");
    assert_eq!(pool.stats().free, pool.stats().in_use_or_free, "all released");
}

/// Ignores the requested width.
#[derive(Debug)]
struct WrongWidth(DumbAllocator);

impl FramebufferAllocator for WrongWidth {
    fn allocate(
        &self,
        _width: u32,
        height: u32,
        format: Fourcc,
        modifier: Modifier,
    ) -> Result<Framebuffer> {
        self.0.allocate(32, height, format, modifier)
    }
}

#[test]
fn mismatched_allocation_is_refused() {
    let (dev, card) = fake_card();
    let pool = Pool::new(WrongWidth(DumbAllocator::new(card)), PoolConfig::default());

    let err = pool.acquire(64, 64, FMT, LIN).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err:?}");
    assert_eq!(pool.stats().in_use_or_free, 0, "reservation rolled back");
    assert_eq!(
        dev.counters().framebuffers_removed,
        1,
        "wrong framebuffer destroyed"
    );
}
