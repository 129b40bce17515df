// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Isolation of properties the kernel refuses.
//!
//! The kernel reports a refused atomic commit as a whole, without naming the
//! offending property. Test-only commits of ever shorter prefixes of the
//! flattened property list find the first bad entry by bisection; that entry
//! is set aside and the search resumes from the prefix already known to be
//! good. With `k` bad entries among `n` this costs `O(k log n)` test commits.

use std::sync::Arc;

use super::{PropertyOwner, Transaction};
use crate::device::{Card, CommitFlags, CommitRequest};
use crate::error::{Error, Result};
use crate::id::{ObjectId, PropertyId};

type Entry = (ObjectId, PropertyId, u64);

impl Transaction {
    /// Test-commits the transaction and, if the kernel rejects it, isolates
    /// the offending properties into `failures`.
    ///
    /// `flags` are the flags the real commit would use; they are reduced to a
    /// blocking test-only commit. Values copied into `failures` carry no
    /// owner. Without a `failures` transaction no isolation is attempted.
    ///
    /// Returns `Ok(())` when the whole transaction validates. When isolation
    /// ran, returns [`Error::Rejected`] and `failures` holds every property
    /// that had to be removed for the remainder to validate. Errors other
    /// than a rejection abort the search and are returned as is.
    pub fn commit_test_with_isolation(
        &self,
        card: &Card,
        flags: CommitFlags,
        failures: Option<&mut Self>,
    ) -> Result<()> {
        let flags = (flags - CommitFlags::NONBLOCK - CommitFlags::PAGE_FLIP_EVENT)
            | CommitFlags::TEST_ONLY;
        let mut candidates = self.sorted_entries();
        match test_prefix(card, &candidates, flags) {
            Ok(()) => return Ok(()),
            Err(Error::Rejected) => {}
            Err(err) => return Err(err),
        }
        let Some(failures) = failures else {
            return Err(Error::Rejected);
        };

        // Invariant: `candidates[..good]` validates, the full list does not.
        let mut good = 0;
        let mut tests = 1_usize;
        loop {
            let mut bad = candidates.len();
            while bad - good > 1 {
                let mid = good + (bad - good) / 2;
                tests += 1;
                match test_prefix(card, &candidates[..mid], flags) {
                    Ok(()) => good = mid,
                    Err(Error::Rejected) => bad = mid,
                    Err(err) => return Err(err),
                }
                tracing::trace!(good, bad, "bisecting rejected commit");
            }

            let (obj, prop, value) = candidates.remove(good);
            tracing::debug!(
                object = obj.0,
                property = prop.0,
                value,
                "isolated rejected property"
            );
            failures.add_property(obj, prop, value)?;

            if candidates.len() == good {
                break;
            }
            tests += 1;
            match test_prefix(card, &candidates, flags) {
                Ok(()) => break,
                Err(Error::Rejected) => {}
                Err(err) => return Err(err),
            }
        }
        tracing::debug!(
            rejected = failures.len(),
            remaining = candidates.len(),
            tests,
            "fault isolation finished"
        );
        Err(Error::Rejected)
    }

    /// Isolates rejected properties and removes them from `self`.
    ///
    /// Returns the removed properties (values only). An empty result means
    /// the transaction validated as it was.
    pub fn prune_rejected(&mut self, card: &Card, flags: CommitFlags) -> Result<Self> {
        let mut released = Vec::new();
        self.prune_rejected_into(card, flags, &mut released)
    }

    /// Like [`prune_rejected`](Self::prune_rejected), but owners of the
    /// removed entries are pushed onto `released` instead of being dropped.
    pub fn prune_rejected_into(
        &mut self,
        card: &Card,
        flags: CommitFlags,
        released: &mut Vec<Arc<dyn PropertyOwner>>,
    ) -> Result<Self> {
        let mut failures = Self::new();
        match self.commit_test_with_isolation(card, flags, Some(&mut failures)) {
            Ok(()) => {}
            Err(Error::Rejected) => {
                self.subtract_into(&failures, released);
            }
            Err(err) => return Err(err),
        }
        Ok(failures)
    }
}

fn test_prefix(card: &Card, entries: &[Entry], flags: CommitFlags) -> Result<()> {
    let req = CommitRequest::from_grouped(entries.iter().copied());
    card.device().atomic_commit(&req, flags, 0)
}
