// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Queue configuration.

use std::time::Duration;

/// Tuning knobs for a [`CommitQueue`](crate::CommitQueue).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct QueueConfig {
    /// Number of independent slots (output pipelines).
    pub slots: usize,
    /// Retries after a busy failure before the work is dropped.
    pub retry_limit: u32,
    /// Delay between busy retries.
    pub retry_interval: Duration,
    /// Default bound for [`CommitQueue::wait_drained`](crate::CommitQueue::wait_drained).
    pub drain_timeout: Duration,
    /// How long shutdown waits for in-flight commits to complete.
    pub shutdown_timeout: Duration,
    /// Longest single wait of the event thread for kernel events.
    pub idle_poll: Duration,
    /// Submit with permission to perform full mode sets.
    pub allow_modeset: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            retry_limit: 16,
            retry_interval: Duration::from_millis(20),
            drain_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
            idle_poll: Duration::from_millis(100),
            allow_modeset: false,
        }
    }
}

impl QueueConfig {
    /// Sets [`slots`](Self::slots).
    #[must_use]
    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    /// Sets [`retry_limit`](Self::retry_limit).
    #[must_use]
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Sets [`retry_interval`](Self::retry_interval).
    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Sets [`drain_timeout`](Self::drain_timeout).
    #[must_use]
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Sets [`shutdown_timeout`](Self::shutdown_timeout).
    #[must_use]
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Sets [`idle_poll`](Self::idle_poll).
    #[must_use]
    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Sets [`allow_modeset`](Self::allow_modeset).
    #[must_use]
    pub fn with_allow_modeset(mut self, allow_modeset: bool) -> Self {
        self.allow_modeset = allow_modeset;
        self
    }
}
