// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The event-processing thread.
//!
//! One thread per queue reads completion events from the device and runs
//! retry timers. Callers talk to it through a task channel; after sending a
//! task they wake the device so a blocking read returns early.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, TryRecvError};

use crate::queue::Shared;

/// Requests sent to the event thread.
#[derive(Debug)]
pub(crate) enum Task {
    /// Retry submission on a slot once `due` has passed.
    Retry(Timer),
    /// Exit the loop.
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Timer {
    pub(crate) due: Instant,
    pub(crate) slot: usize,
    pub(crate) epoch: u64,
}

pub(crate) fn run(shared: &Arc<Shared>, tasks: &Receiver<Task>) {
    let idle_poll = shared.config.idle_poll;
    let mut timers = BinaryHeap::new();
    tracing::debug!("event thread started");
    loop {
        loop {
            match tasks.try_recv() {
                Ok(Task::Retry(timer)) => timers.push(Reverse(timer)),
                Ok(Task::Shutdown) | Err(TryRecvError::Disconnected) => {
                    tracing::debug!(pending_timers = timers.len(), "event thread stopping");
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        let now = Instant::now();
        while let Some(&Reverse(timer)) = timers.peek()
            && timer.due <= now
        {
            timers.pop();
            shared.retry(timer);
        }

        let timeout = timers.peek().map_or(idle_poll, |Reverse(timer)| {
            timer.due.saturating_duration_since(now).min(idle_poll)
        });
        match shared.card.device().read_events(timeout) {
            Ok(events) => {
                for event in events {
                    shared.on_completion(event);
                }
            }
            Err(err) => {
                tracing::error!(%err, "reading completion events failed");
                std::thread::sleep(idle_poll);
            }
        }
    }
}
