// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Mapping page-flip events back to commit tags.
//!
//! The kernel reports one flip event per CRTC touched by a commit. A commit
//! counts as complete once every CRTC it touched has flipped. Commits on the
//! same CRTC complete in submission order, so each event is credited to the
//! oldest pending commit still waiting on that CRTC.

use std::collections::VecDeque;
use std::time::Duration;

use sluice_core::CompletionEvent;

#[derive(Debug)]
struct PendingFlip {
    tag: u64,
    crtcs: Vec<u32>,
}

#[derive(Debug, Default)]
pub(crate) struct FlipTracker {
    pending: VecDeque<PendingFlip>,
    /// Completions that need no kernel event.
    ready: Vec<CompletionEvent>,
}

impl FlipTracker {
    /// Records a submitted commit waiting on `crtcs`.
    ///
    /// A commit that touches no CRTC never produces a kernel event; it is
    /// completed immediately with sequence 0.
    pub(crate) fn expect(&mut self, tag: u64, mut crtcs: Vec<u32>) {
        crtcs.sort_unstable();
        crtcs.dedup();
        if crtcs.is_empty() {
            self.ready.push(CompletionEvent {
                tag,
                sequence: 0,
                timestamp: Duration::ZERO,
            });
        } else {
            self.pending.push_back(PendingFlip { tag, crtcs });
        }
    }

    /// Credits a flip on `crtc`, returning the completion it finishes.
    pub(crate) fn flipped(
        &mut self,
        crtc: u32,
        sequence: u32,
        timestamp: Duration,
    ) -> Option<CompletionEvent> {
        let Some(index) = self.pending.iter().position(|p| p.crtcs.contains(&crtc)) else {
            tracing::trace!(crtc, "flip event for no pending commit");
            return None;
        };
        let flip = &mut self.pending[index];
        flip.crtcs.retain(|&c| c != crtc);
        if !flip.crtcs.is_empty() {
            return None;
        }
        let flip = self.pending.remove(index)?;
        Some(CompletionEvent {
            tag: flip.tag,
            sequence,
            timestamp,
        })
    }

    pub(crate) fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub(crate) fn take_ready(&mut self) -> Vec<CompletionEvent> {
        core::mem::take(&mut self.ready)
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::FlipTracker;

    const T: Duration = Duration::from_millis(16);

    #[test]
    fn single_crtc_completes_on_its_flip() {
        let mut flips = FlipTracker::default();
        flips.expect(7, vec![40]);
        let event = flips.flipped(40, 12, T).unwrap();
        assert_eq!((event.tag, event.sequence, event.timestamp), (7, 12, T));
        assert_eq!(flips.pending_len(), 0, "entry retired");
    }

    #[test]
    fn multi_crtc_commit_waits_for_every_flip() {
        let mut flips = FlipTracker::default();
        flips.expect(1, vec![41, 40, 41]);
        assert!(flips.flipped(40, 1, T).is_none(), "41 still outstanding");
        assert_eq!(flips.flipped(41, 2, T).map(|e| e.tag), Some(1));
    }

    #[test]
    fn flips_credit_the_oldest_commit_on_that_crtc() {
        let mut flips = FlipTracker::default();
        flips.expect(1, vec![40]);
        flips.expect(2, vec![40]);
        flips.expect(3, vec![50]);
        assert_eq!(flips.flipped(50, 1, T).map(|e| e.tag), Some(3));
        assert_eq!(flips.flipped(40, 1, T).map(|e| e.tag), Some(1));
        assert_eq!(flips.flipped(40, 2, T).map(|e| e.tag), Some(2));
    }

    #[test]
    fn commit_without_crtc_is_ready_at_once() {
        let mut flips = FlipTracker::default();
        flips.expect(9, Vec::new());
        assert!(flips.has_ready(), "synthetic completion queued");
        let ready = flips.take_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!((ready[0].tag, ready[0].sequence), (9, 0));
        assert!(!flips.has_ready(), "drained");
    }

    #[test]
    fn stray_flip_is_ignored() {
        let mut flips = FlipTracker::default();
        assert!(flips.flipped(40, 1, T).is_none(), "nothing pending");
    }
}
