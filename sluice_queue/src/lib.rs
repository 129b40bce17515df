// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Commit queue for atomic KMS transactions.
//!
//! A [`CommitQueue`] owns a small fixed number of independent slots, one per
//! output pipeline. Each slot keeps at most one commit in flight; work
//! enqueued meanwhile is merged into a single successor (last write wins per
//! property) that goes out as soon as the kernel signals completion.
//!
//! ```text
//!   caller threads                       event thread
//!   ──────────────                       ────────────
//!   enqueue(slot, txn) ─► slot lock ◄─── on_completion(tag)
//!          │                 │                 ▲
//!          ▼                 ▼                 │
//!      submit ──► KmsDevice::atomic_commit     │
//!          │ busy                              │
//!          └──► Task::Retry ──► timer heap ────┘ read_events / wake
//! ```
//!
//! Failures follow the [`Error`](sluice_core::Error) taxonomy:
//!
//! - **Busy**: retried on a timer up to
//!   [`QueueConfig::retry_limit`] times, then dropped with a warning.
//! - **Rejected**: offending properties are isolated by bisection, logged,
//!   and removed; the remainder is resubmitted.
//! - **Anything else**: the work is dropped and its callbacks run with
//!   [`CommitOutcome::Failed`](sluice_core::CommitOutcome::Failed).
//!
//! Slots never share a lock, so pipelines do not block each other.
//!
//! # Crate features
//!
//! - `serde` (disabled by default): `Serialize`/`Deserialize` for
//!   [`QueueConfig`].

mod config;
mod event;
mod queue;
mod slot;

pub use config::QueueConfig;
pub use queue::CommitQueue;
pub use slot::SlotStats;
