// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-slot state.
//!
//! ```text
//!            enqueue                 submit
//!   IDLE ─────────────► PENDING ─────────────► IN_FLIGHT
//!    ▲                                            │  ▲
//!    │ completion (next empty)          enqueue   │  │ completion
//!    └────────────────────────────────────────────┘  │ (resubmit next)
//!                                                 ▼  │
//!                                        PENDING + IN_FLIGHT
//! ```
//!
//! A slot holds at most one submitted commit (`in_flight`) and at most one
//! accumulated successor (`next`); later enqueues merge into `next`. The
//! commit that was on screen before the current one stays in `previous`
//! until the next completion, since scan-out may still read from it.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use sluice_core::{CommitOutcome, CompletionFn, PropertyOwner, Transaction};

/// Snapshot of a slot's counters and state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotStats {
    /// Commits the kernel accepted.
    pub submissions: u64,
    /// Completion events processed.
    pub completions: u64,
    /// Busy retries scheduled.
    pub retries: u64,
    /// Work dropped after a hard failure or exhausted retries.
    pub failures: u64,
    /// Work is waiting for submission.
    pub pending: bool,
    /// A commit is waiting for its completion event.
    pub in_flight: bool,
}

pub(crate) struct InFlight {
    pub(crate) txn: Transaction,
    pub(crate) generation: u32,
}

#[derive(Default)]
pub(crate) struct SlotState {
    pub(crate) next: Option<Transaction>,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) previous: Option<Transaction>,
    /// Busy retries spent on the current `next`.
    pub(crate) attempts: u32,
    /// A retry timer is armed; submission waits for it.
    pub(crate) retry_armed: bool,
    /// Bumped whenever armed timers become stale.
    pub(crate) retry_epoch: u64,
    pub(crate) generation: u32,
    pub(crate) closed: bool,
    pub(crate) stats: SlotStats,
}

impl SlotState {
    pub(crate) fn stats(&self) -> SlotStats {
        SlotStats {
            pending: self.next.is_some(),
            in_flight: self.in_flight.is_some(),
            ..self.stats
        }
    }

    /// Whether `next` may be submitted right now.
    pub(crate) fn can_submit(&self) -> bool {
        !self.closed && self.in_flight.is_none() && !self.retry_armed && self.next.is_some()
    }
}

pub(crate) struct Slot {
    pub(crate) index: u32,
    pub(crate) state: Mutex<SlotState>,
    /// Signalled whenever `next` or `in_flight` is cleared.
    pub(crate) changed: Condvar,
}

impl Slot {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            state: Mutex::new(SlotState::default()),
            changed: Condvar::new(),
        }
    }
}

/// Work collected under a slot lock and carried out after it is released.
///
/// Completion callbacks may call back into the queue, and dropping a
/// transaction or a displaced owner may destroy framebuffers; neither
/// happens under the lock.
#[derive(Default)]
pub(crate) struct Deferred {
    callbacks: Vec<(CompletionFn, CommitOutcome)>,
    released: Vec<Transaction>,
    /// Owners displaced by merging or pruning.
    pub(crate) owners: Vec<Arc<dyn PropertyOwner>>,
}

impl Deferred {
    /// Schedules `txn`'s callbacks with `outcome` and releases it.
    pub(crate) fn finish(&mut self, mut txn: Transaction, outcome: CommitOutcome) {
        self.notify(&mut txn, outcome);
        self.released.push(txn);
    }

    /// Schedules `txn`'s callbacks with `outcome`, leaving it otherwise
    /// intact.
    pub(crate) fn notify(&mut self, txn: &mut Transaction, outcome: CommitOutcome) {
        self.callbacks
            .extend(txn.take_callbacks().into_iter().map(|cb| (cb, outcome)));
    }

    /// Releases `txn` without running callbacks.
    pub(crate) fn release(&mut self, txn: Transaction) {
        self.released.push(txn);
    }

    pub(crate) fn run(self) {
        drop(self.owners);
        drop(self.released);
        for (callback, outcome) in self.callbacks {
            callback(outcome);
        }
    }
}
