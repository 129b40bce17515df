// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bounded, recycling framebuffer pool.
//!
//! Every framebuffer handed out by [`Pool::acquire`] carries a
//! [`PreRelease`] hook pointing back at the pool. When the last reference to
//! it drops, the hook puts the allocation on the free list instead of
//! destroying it. Free entries are keyed by a release sequence number, so the
//! first entry of the map is always the least recently freed one and is the
//! one evicted when the pool is full.
//!
//! The pool's shared state lives as long as any hook references it. Killing
//! the pool (or dropping the [`Pool`] handle) destroys the free entries
//! immediately; framebuffers still in use are destroyed, not recycled, when
//! their last reference drops.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::alloc::FramebufferAllocator;
use crate::error::{Error, Result};
use crate::format::{Fourcc, Modifier};
use crate::framebuffer::{Framebuffer, FramebufferAllocation, PreRelease};

/// Pool sizing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolConfig {
    /// Upper bound on framebuffers in use plus framebuffers on the free
    /// list. Zero is treated as one.
    pub max_count: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_count: 3 }
    }
}

impl PoolConfig {
    /// Sets [`max_count`](Self::max_count).
    #[must_use]
    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }
}

/// Snapshot of pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Framebuffers in use plus free entries.
    pub in_use_or_free: usize,
    /// Free entries.
    pub free: usize,
    /// Capacity.
    pub max_count: usize,
    /// Allocator calls that succeeded.
    pub allocations: u64,
    /// Acquisitions served from the free list.
    pub reuses: u64,
    /// Free entries destroyed to make room.
    pub evictions: u64,
    /// Whether the pool has been killed.
    pub dead: bool,
}

#[derive(Default)]
struct PoolState {
    free: BTreeMap<u64, FramebufferAllocation>,
    next_seq: u64,
    in_use_or_free: usize,
    dead: bool,
    allocations: u64,
    reuses: u64,
    evictions: u64,
}

struct PoolShared {
    state: Mutex<PoolState>,
    allocator: Box<dyn FramebufferAllocator>,
    max_count: usize,
}

impl PoolShared {
    /// Marks the pool dead and hands back the free entries for destruction.
    fn kill(&self) -> BTreeMap<u64, FramebufferAllocation> {
        let mut state = self.state.lock();
        if state.dead {
            return BTreeMap::new();
        }
        state.dead = true;
        let free = std::mem::take(&mut state.free);
        state.in_use_or_free -= free.len();
        tracing::debug!(destroyed = free.len(), in_use = state.in_use_or_free, "pool killed");
        free
    }
}

/// Returns released allocations to the free list of a live pool.
struct Recycle(Arc<PoolShared>);

impl PreRelease for Recycle {
    fn pre_release(&self, alloc: FramebufferAllocation) -> Option<FramebufferAllocation> {
        let mut state = self.0.state.lock();
        if state.dead {
            state.in_use_or_free -= 1;
            return Some(alloc);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        tracing::trace!(fb = alloc.id().0, seq, "recycled framebuffer");
        state.free.insert(seq, alloc);
        None
    }
}

/// Owner handle of a framebuffer pool.
///
/// Dropping the handle kills the pool.
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("allocator", &self.shared.allocator)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Creates a pool drawing from `allocator`.
    pub fn new(allocator: impl FramebufferAllocator + 'static, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                allocator: Box::new(allocator),
                max_count: config.max_count.max(1),
            }),
        }
    }

    /// Returns a framebuffer matching the request.
    ///
    /// A free entry the allocator considers reusable is preferred. Otherwise
    /// a new framebuffer is allocated, evicting the least recently freed
    /// entry first when the pool is full. Fails with
    /// [`Error::ResourceExhausted`] when the pool is full and nothing is
    /// free, and with [`Error::Shutdown`] once the pool has been killed.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn acquire(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        modifier: Modifier,
    ) -> Result<Arc<Framebuffer>> {
        let shared = &self.shared;
        let evicted = {
            let mut state = shared.state.lock();
            if state.dead {
                return Err(Error::Shutdown("pool"));
            }
            let hit = state
                .free
                .iter()
                .find(|(_, alloc)| {
                    shared
                        .allocator
                        .reusable(alloc, width, height, format, modifier)
                })
                .map(|(&seq, _)| seq);
            if let Some(alloc) = hit.and_then(|seq| state.free.remove(&seq)) {
                state.reuses += 1;
                drop(state);
                tracing::debug!(fb = alloc.id().0, "reusing pooled framebuffer");
                return Ok(self.hand_out(Framebuffer::from_allocation(alloc)));
            }

            // Reserve the slot before allocating so concurrent acquires
            // cannot overshoot the capacity.
            if state.in_use_or_free < shared.max_count {
                state.in_use_or_free += 1;
                None
            } else if let Some((_, oldest)) = state.free.pop_first() {
                state.evictions += 1;
                Some(oldest)
            } else {
                return Err(Error::exhausted(format!(
                    "pool holds {} framebuffers in use",
                    shared.max_count
                )));
            }
        };
        if let Some(oldest) = evicted {
            tracing::debug!(fb = oldest.id().0, "evicting least recently freed framebuffer");
            drop(oldest);
        }

        let fb = match shared.allocator.allocate(width, height, format, modifier) {
            Ok(fb) => fb,
            Err(err) => {
                shared.state.lock().in_use_or_free -= 1;
                return Err(err);
            }
        };

        let alloc = fb.allocation();
        if (alloc.width(), alloc.height(), alloc.format(), alloc.modifier())
            != (width, height, format, modifier)
        {
            shared.state.lock().in_use_or_free -= 1;
            return Err(Error::invalid(format!(
                "allocator returned {}x{} {:?} {:?} for {width}x{height} {format:?} {modifier:?}",
                alloc.width(),
                alloc.height(),
                alloc.format(),
                alloc.modifier()
            )));
        }

        let mut state = shared.state.lock();
        if state.dead {
            state.in_use_or_free -= 1;
            drop(state);
            return Err(Error::Shutdown("pool"));
        }
        state.allocations += 1;
        debug_assert!(
            state.in_use_or_free <= shared.max_count,
            "pool exceeded its capacity"
        );
        drop(state);
        Ok(self.hand_out(fb))
    }

    fn hand_out(&self, mut fb: Framebuffer) -> Arc<Framebuffer> {
        fb.set_pre_release(Box::new(Recycle(Arc::clone(&self.shared))));
        Arc::new(fb)
    }

    /// Kills the pool.
    ///
    /// Free entries are destroyed now. Framebuffers still in use stay valid
    /// and are destroyed when their last reference drops.
    pub fn kill(self) {
        drop(self);
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            in_use_or_free: state.in_use_or_free,
            free: state.free.len(),
            max_count: self.shared.max_count,
            allocations: state.allocations,
            reuses: state.reuses,
            evictions: state.evictions,
            dead: state.dead,
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Destroy outside the lock; destruction talks to the device.
        drop(self.shared.kill());
    }
}

#[cfg(test)]
mod tests {
    use super::PoolConfig;

    #[test]
    fn config_builder() {
        let config = PoolConfig::default().with_max_count(7);
        assert_eq!(config.max_count, 7);
        assert_eq!(PoolConfig::default().max_count, 3);
    }
}
