// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The commit queue.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use sluice_core::{
    Card, CommitFlags, CommitOutcome, CompletionEvent, Error, Result, Transaction,
};

use crate::config::QueueConfig;
use crate::event::{self, Task, Timer};
use crate::slot::{Deferred, InFlight, Slot, SlotState, SlotStats};

fn encode_tag(slot: u32, generation: u32) -> u64 {
    (u64::from(slot) << 32) | u64::from(generation)
}

#[allow(
    clippy::cast_possible_truncation,
    reason = "the low half of a tag is the generation by construction"
)]
fn decode_tag(tag: u64) -> (usize, u32) {
    let slot = usize::try_from(tag >> 32).unwrap_or(usize::MAX);
    (slot, tag as u32)
}

pub(crate) struct Shared {
    pub(crate) card: Card,
    pub(crate) config: QueueConfig,
    slots: Vec<Slot>,
    tasks: Sender<Task>,
}

impl Shared {
    fn slot(&self, index: usize) -> Result<&Slot> {
        self.slots.get(index).ok_or_else(|| {
            Error::invalid(format!(
                "slot {index} out of range, queue has {}",
                self.slots.len()
            ))
        })
    }

    fn commit_flags(&self) -> CommitFlags {
        let mut flags = CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT;
        if self.config.allow_modeset {
            flags |= CommitFlags::ALLOW_MODESET;
        }
        flags
    }

    /// Submits `next` if the slot allows it.
    ///
    /// Runs with the slot lock held; anything that must not run under it is
    /// pushed onto `deferred`.
    fn submit(&self, slot: &Slot, state: &mut SlotState, deferred: &mut Deferred) {
        let mut pruned = false;
        while state.can_submit() {
            let Some(mut txn) = state.next.take() else {
                return;
            };
            state.generation = state.generation.wrapping_add(1);
            let generation = state.generation;
            let flags = self.commit_flags();

            let err = match txn.commit(&self.card, flags, encode_tag(slot.index, generation)) {
                Ok(()) => {
                    tracing::debug!(
                        slot = slot.index,
                        generation,
                        properties = txn.len(),
                        "submitted commit"
                    );
                    state.attempts = 0;
                    state.stats.submissions += 1;
                    state.in_flight = Some(InFlight { txn, generation });
                    return;
                }
                Err(err) => err,
            };

            match err {
                Error::Busy if state.attempts < self.config.retry_limit => {
                    state.attempts += 1;
                    state.stats.retries += 1;
                    state.next = Some(txn);
                    self.arm_retry(slot, state);
                }
                Error::Busy => {
                    tracing::warn!(
                        slot = slot.index,
                        attempts = state.attempts,
                        "device stayed busy; dropping commit"
                    );
                    self.fail(state, txn, deferred);
                }
                Error::Rejected if !pruned => {
                    pruned = true;
                    match txn.prune_rejected_into(&self.card, flags, &mut deferred.owners) {
                        Ok(failures) if !failures.is_empty() => {
                            for (obj, prop, value) in failures.iter() {
                                tracing::warn!(
                                    slot = slot.index,
                                    object = obj.0,
                                    property = prop.0,
                                    value,
                                    "kernel rejected property"
                                );
                            }
                            if txn.is_empty() {
                                self.fail(state, txn, deferred);
                            } else {
                                state.next = Some(txn);
                            }
                        }
                        Ok(_) => {
                            tracing::error!(
                                slot = slot.index,
                                "commit rejected but every property validates"
                            );
                            self.fail(state, txn, deferred);
                        }
                        Err(err) => {
                            tracing::error!(
                                slot = slot.index,
                                %err,
                                "isolating rejected properties failed"
                            );
                            self.fail(state, txn, deferred);
                        }
                    }
                }
                err => {
                    tracing::error!(slot = slot.index, %err, "commit failed");
                    self.fail(state, txn, deferred);
                }
            }
        }
    }

    fn fail(&self, state: &mut SlotState, txn: Transaction, deferred: &mut Deferred) {
        state.attempts = 0;
        state.stats.failures += 1;
        deferred.finish(txn, CommitOutcome::Failed);
    }

    fn arm_retry(&self, slot: &Slot, state: &mut SlotState) {
        state.retry_armed = true;
        state.retry_epoch += 1;
        let timer = Timer {
            due: Instant::now() + self.config.retry_interval,
            slot: slot.index as usize,
            epoch: state.retry_epoch,
        };
        tracing::debug!(
            slot = slot.index,
            attempt = state.attempts,
            "device busy; retry scheduled"
        );
        if self.tasks.send(Task::Retry(timer)).is_err() {
            tracing::warn!(slot = slot.index, "event thread gone; retry dropped");
            state.retry_armed = false;
            return;
        }
        self.card.device().wake();
    }

    /// Fires an armed retry timer.
    pub(crate) fn retry(&self, timer: Timer) {
        let Some(slot) = self.slots.get(timer.slot) else {
            return;
        };
        let mut deferred = Deferred::default();
        {
            let mut state = slot.state.lock();
            if !state.retry_armed || state.retry_epoch != timer.epoch {
                return;
            }
            state.retry_armed = false;
            self.submit(slot, &mut state, &mut deferred);
            slot.changed.notify_all();
        }
        deferred.run();
    }

    /// Handles a completion event from the device.
    pub(crate) fn on_completion(&self, event: CompletionEvent) {
        let (index, generation) = decode_tag(event.tag);
        let Some(slot) = self.slots.get(index) else {
            tracing::warn!(tag = event.tag, "completion for unknown slot");
            return;
        };
        let mut deferred = Deferred::default();
        {
            let mut state = slot.state.lock();
            let Some(done) = state
                .in_flight
                .take_if(|in_flight| in_flight.generation == generation)
            else {
                tracing::warn!(
                    slot = slot.index,
                    generation,
                    "completion does not match the commit in flight"
                );
                return;
            };
            let mut txn = done.txn;
            tracing::debug!(
                slot = slot.index,
                generation,
                sequence = event.sequence,
                "commit completed"
            );
            state.stats.completions += 1;
            deferred.notify(
                &mut txn,
                CommitOutcome::Presented {
                    sequence: event.sequence,
                    timestamp: event.timestamp,
                },
            );
            if let Some(stale) = state.previous.replace(txn) {
                deferred.release(stale);
            }
            self.submit(slot, &mut state, &mut deferred);
            slot.changed.notify_all();
        }
        deferred.run();
    }
}

/// Per-slot, single-in-flight submission of transactions.
///
/// Each slot accumulates enqueued transactions into one pending successor
/// while a commit is in flight, and submits it as soon as the kernel reports
/// the previous one complete. Busy failures are retried on a timer; rejected
/// properties are isolated and dropped so the rest of the work still lands.
///
/// A dedicated thread reads completion events. Dropping the queue shuts it
/// down.
pub struct CommitQueue {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for CommitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitQueue")
            .field("card", &self.shared.card)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl CommitQueue {
    /// Creates the queue and starts its event thread.
    pub fn new(card: Card, config: QueueConfig) -> Result<Self> {
        let count = u32::try_from(config.slots)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| Error::invalid(format!("unusable slot count {}", config.slots)))?;
        let (tasks, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            card,
            config,
            slots: (0..count).map(Slot::new).collect(),
            tasks,
        });
        let thread = thread::Builder::new()
            .name("sluice-events".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || event::run(&shared, &receiver)
            })?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.shared.slots.len()
    }

    /// Merges `txn` into the slot's pending work and submits it when nothing
    /// is in flight.
    ///
    /// Returns [`Error::Shutdown`] after [`shutdown`](Self::shutdown); the
    /// transaction's callbacks then run with [`CommitOutcome::Abandoned`].
    #[tracing::instrument(level = "trace", skip(self, txn), fields(properties = txn.len()))]
    pub fn enqueue(&self, slot: usize, mut txn: Transaction) -> Result<()> {
        let shared = &self.shared;
        let target = shared.slot(slot)?;
        txn.bind_slot(slot)?;

        let mut deferred = Deferred::default();
        let result = {
            let mut state = target.state.lock();
            if state.closed {
                deferred.finish(txn, CommitOutcome::Abandoned);
                Err(Error::Shutdown("commit queue"))
            } else {
                match &mut state.next {
                    Some(next) => next.merge_from_into(txn, &mut deferred.owners),
                    None => state.next = Some(txn),
                }
                shared.submit(target, &mut state, &mut deferred);
                target.changed.notify_all();
                Ok(())
            }
        };
        deferred.run();
        result
    }

    /// Waits up to the configured drain timeout for the slot's pending work
    /// to be submitted. See [`wait_drained_timeout`](Self::wait_drained_timeout).
    pub fn wait_drained(&self, slot: usize) -> Result<bool> {
        self.wait_drained_timeout(slot, self.shared.config.drain_timeout)
    }

    /// Waits up to `timeout` until the slot has no pending work.
    ///
    /// Returns `false` (and logs) when the timeout elapsed first.
    pub fn wait_drained_timeout(&self, slot: usize, timeout: Duration) -> Result<bool> {
        let target = self.shared.slot(slot)?;
        let deadline = Instant::now() + timeout;
        let mut state = target.state.lock();
        while state.next.is_some() {
            if target.changed.wait_until(&mut state, deadline).timed_out()
                && state.next.is_some()
            {
                tracing::warn!(slot, ?timeout, "slot did not drain in time");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Snapshot of a slot's counters.
    pub fn stats(&self, slot: usize) -> Result<SlotStats> {
        Ok(self.shared.slot(slot)?.state.lock().stats())
    }

    /// Stops the queue.
    ///
    /// Pending work is discarded (its callbacks run with
    /// [`CommitOutcome::Abandoned`]) and armed retries are cancelled. Commits
    /// already in flight get up to the configured shutdown timeout to
    /// complete; then every slot is cleared and the event thread exits.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let shared = &self.shared;

        let mut deferred = Deferred::default();
        for slot in &shared.slots {
            let mut state = slot.state.lock();
            state.closed = true;
            state.retry_armed = false;
            state.retry_epoch += 1;
            if let Some(next) = state.next.take() {
                deferred.finish(next, CommitOutcome::Abandoned);
            }
            slot.changed.notify_all();
        }
        deferred.run();

        let deadline = Instant::now() + shared.config.shutdown_timeout;
        for slot in &shared.slots {
            let mut state = slot.state.lock();
            while state.in_flight.is_some() {
                if slot.changed.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }

        let mut deferred = Deferred::default();
        for slot in &shared.slots {
            let mut state = slot.state.lock();
            if let Some(in_flight) = state.in_flight.take() {
                tracing::warn!(
                    slot = slot.index,
                    "in-flight commit did not complete before shutdown"
                );
                deferred.finish(in_flight.txn, CommitOutcome::Abandoned);
            }
            if let Some(previous) = state.previous.take() {
                deferred.release(previous);
            }
        }
        deferred.run();

        _ = shared.tasks.send(Task::Shutdown);
        shared.card.device().wake();
        if thread.join().is_err() {
            tracing::error!("event thread panicked");
        }
        tracing::debug!("commit queue shut down");
    }
}

impl Drop for CommitQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_tag, encode_tag};

    #[test]
    fn tags_round_trip_slot_and_generation() {
        let tag = encode_tag(3, u32::MAX);
        assert_eq!(decode_tag(tag), (3, u32::MAX));
        assert_eq!(decode_tag(encode_tag(0, 1)), (0, 1));
    }
}
