// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Allocator wrapper that counts calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use sluice_core::alloc::FramebufferAllocator;
use sluice_core::{Error, Fourcc, Framebuffer, FramebufferAllocation, Modifier, Result};

/// Shared view of a [`CountingAllocator`]'s counters.
///
/// The pool takes the allocator by value; keep one of these to observe it.
#[derive(Clone, Debug, Default)]
pub struct AllocCounter {
    calls: Arc<AtomicUsize>,
    fail_next: Arc<AtomicBool>,
}

impl AllocCounter {
    /// Number of `allocate` calls so far, failed ones included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes the next `allocate` call fail with
    /// [`Error::ResourceExhausted`].
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

/// Wraps another allocator and counts its `allocate` calls.
#[derive(Debug)]
pub struct CountingAllocator<A> {
    inner: A,
    counter: AllocCounter,
}

impl<A: FramebufferAllocator> CountingAllocator<A> {
    /// Wraps `inner`.
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            counter: AllocCounter::default(),
        }
    }

    /// Handle to the counters.
    #[must_use]
    pub fn counter(&self) -> AllocCounter {
        self.counter.clone()
    }
}

impl<A: FramebufferAllocator> FramebufferAllocator for CountingAllocator<A> {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        modifier: Modifier,
    ) -> Result<Framebuffer> {
        self.counter.calls.fetch_add(1, Ordering::SeqCst);
        if self.counter.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::exhausted("injected allocation failure"));
        }
        self.inner.allocate(width, height, format, modifier)
    }

    fn reusable(
        &self,
        alloc: &FramebufferAllocation,
        width: u32,
        height: u32,
        format: Fourcc,
        modifier: Modifier,
    ) -> bool {
        self.inner.reusable(alloc, width, height, format, modifier)
    }
}
