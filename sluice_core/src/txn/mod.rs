// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Atomic property transactions.
//!
//! A [`Transaction`] maps `(object, property)` pairs to 64-bit values. Each
//! object's properties live in a small array that is scanned linearly; the
//! arrays are expected to hold tens of entries at most.
//!
//! Values may carry an owner: an `Arc<dyn PropertyOwner>` that keeps the
//! referenced kernel resource (framebuffer, blob) alive while the
//! transaction, or the commit it was merged into, still needs it. Cloning
//! the `Arc` is the reference, dropping it the release.
//!
//! The heavier algorithms live in submodules:
//!
//! - `merge`: ordered-union merge and subtraction.
//! - `isolate`: bisection that isolates properties the kernel rejects.

mod isolate;
mod merge;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::blob::Blob;
use crate::device::{Card, CommitFlags, CommitRequest};
use crate::error::{Error, Result};
use crate::framebuffer::{Framebuffer, Metadata};
use crate::id::{ObjectId, PropertyId};

/// A value whose lifetime a transaction manages.
///
/// Referencing and releasing are `Arc` clone and drop. `on_commit` runs after
/// a commit referencing the value has been applied (never for test-only
/// commits).
pub trait PropertyOwner: Send + Sync + fmt::Debug {
    /// Raw property value that refers to this owner.
    fn value(&self) -> u64;

    /// Called once per applied commit that carried this owner.
    fn on_commit(&self, value: u64) {
        _ = value;
    }
}

/// How a queued transaction ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The kernel reported that the commit took effect.
    Presented {
        /// Vertical-blank sequence number.
        sequence: u32,
        /// Kernel timestamp of the flip.
        timestamp: Duration,
    },
    /// Submission failed and the work was dropped.
    Failed,
    /// The work was discarded before submission (queue shutdown).
    Abandoned,
}

/// Callback run when a queued transaction completes.
pub type CompletionFn = Arc<dyn Fn(CommitOutcome) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Property {
    pub(crate) id: PropertyId,
    pub(crate) value: u64,
    pub(crate) owner: Option<Arc<dyn PropertyOwner>>,
}

#[derive(Clone)]
pub(crate) struct ObjectProps {
    pub(crate) id: ObjectId,
    pub(crate) props: Vec<Property>,
}

/// A set of property writes applied atomically.
///
/// Cloning duplicates every entry and takes an additional reference on every
/// owned value.
#[derive(Clone, Default)]
pub struct Transaction {
    objects: Vec<ObjectProps>,
    callbacks: Vec<CompletionFn>,
    slot: Option<usize>,
    sorted: bool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("objects", &self.objects.len())
            .field("properties", &self.len())
            .field("callbacks", &self.callbacks.len())
            .field("slot", &self.slot)
            .finish()
    }
}

impl Transaction {
    /// Creates an empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sorted: true,
            ..Self::default()
        }
    }

    /// Total number of property writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.iter().map(|o| o.props.len()).sum()
    }

    /// Returns `true` when no property is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of distinct objects touched.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Value stored for `(obj, prop)`.
    #[must_use]
    pub fn get(&self, obj: ObjectId, prop: PropertyId) -> Option<u64> {
        self.find(obj, prop).map(|p| p.value)
    }

    /// Owner stored for `(obj, prop)`.
    #[must_use]
    pub fn owner(&self, obj: ObjectId, prop: PropertyId) -> Option<&Arc<dyn PropertyOwner>> {
        self.find(obj, prop).and_then(|p| p.owner.as_ref())
    }

    fn find(&self, obj: ObjectId, prop: PropertyId) -> Option<&Property> {
        self.objects
            .iter()
            .find(|o| o.id == obj)
            .and_then(|o| o.props.iter().find(|p| p.id == prop))
    }

    /// Iterates `(object, property, value)` in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, PropertyId, u64)> + '_ {
        self.objects
            .iter()
            .flat_map(|o| o.props.iter().map(move |p| (o.id, p.id, p.value)))
    }

    /// Sets a plain value.
    pub fn add_property(&mut self, obj: ObjectId, prop: PropertyId, value: u64) -> Result<()> {
        self.add_property_with_owner(obj, prop, value, None)
    }

    /// Sets a value owned by `owner`, using the owner's own value.
    pub fn add_owned(
        &mut self,
        obj: ObjectId,
        prop: PropertyId,
        owner: Arc<dyn PropertyOwner>,
    ) -> Result<()> {
        let value = owner.value();
        self.add_property_with_owner(obj, prop, value, Some(owner))
    }

    /// Points `prop` at a framebuffer and keeps it alive.
    pub fn add_framebuffer(
        &mut self,
        obj: ObjectId,
        prop: PropertyId,
        fb: &Arc<Framebuffer>,
    ) -> Result<()> {
        self.add_owned(obj, prop, Arc::clone(fb) as Arc<dyn PropertyOwner>)
    }

    /// Points `prop` at a property blob and keeps it alive.
    pub fn add_blob(&mut self, obj: ObjectId, prop: PropertyId, blob: &Arc<Blob>) -> Result<()> {
        self.add_owned(obj, prop, Arc::clone(blob) as Arc<dyn PropertyOwner>)
    }

    /// Translates framebuffer metadata into a property write.
    ///
    /// [`Metadata::Unset`] leaves the transaction untouched,
    /// [`Metadata::Cleared`] writes 0, and [`Metadata::Present`] uploads a
    /// blob owned by the transaction.
    pub fn add_metadata_property(
        &mut self,
        card: &Card,
        obj: ObjectId,
        prop: PropertyId,
        metadata: &Metadata,
    ) -> Result<()> {
        match metadata {
            Metadata::Unset => {
                check_ids(obj, prop)?;
                Ok(())
            }
            Metadata::Cleared => self.add_property(obj, prop, 0),
            Metadata::Present(bytes) => {
                let blob = Blob::create(card, bytes)?;
                self.add_blob(obj, prop, &blob)
            }
        }
    }

    /// Sets `(obj, prop)` to `value`, replacing any earlier write.
    ///
    /// An owner displaced by the overwrite is released after the new one is
    /// stored.
    pub fn add_property_with_owner(
        &mut self,
        obj: ObjectId,
        prop: PropertyId,
        value: u64,
        owner: Option<Arc<dyn PropertyOwner>>,
    ) -> Result<()> {
        check_ids(obj, prop)?;

        let idx = match self.objects.iter().position(|o| o.id == obj) {
            Some(idx) => idx,
            None => {
                if self.objects.last().is_some_and(|o| o.id > obj) {
                    self.sorted = false;
                }
                if self.objects.len() == self.objects.capacity() {
                    self.objects.reserve(self.objects.len().max(4));
                }
                self.objects.push(ObjectProps {
                    id: obj,
                    props: Vec::new(),
                });
                self.objects.len() - 1
            }
        };

        let props = &mut self.objects[idx].props;
        if let Some(existing) = props.iter_mut().find(|p| p.id == prop) {
            existing.value = value;
            let _released = core::mem::replace(&mut existing.owner, owner);
            return Ok(());
        }
        if props.last().is_some_and(|p| p.id > prop) {
            self.sorted = false;
        }
        if props.len() == props.capacity() {
            props.reserve(props.len().max(8));
        }
        props.push(Property {
            id: prop,
            value,
            owner,
        });
        Ok(())
    }

    /// Registers a callback run when the transaction completes in a queue.
    pub fn on_complete(&mut self, callback: impl Fn(CommitOutcome) + Send + Sync + 'static) {
        self.callbacks.push(Arc::new(callback));
    }

    /// Number of registered completion callbacks.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Runs every completion callback with `outcome` and clears the list.
    pub fn complete(&mut self, outcome: CommitOutcome) {
        for callback in core::mem::take(&mut self.callbacks) {
            callback(outcome);
        }
    }

    /// Removes and returns the completion callbacks without running them.
    pub fn take_callbacks(&mut self) -> Vec<CompletionFn> {
        core::mem::take(&mut self.callbacks)
    }

    /// Queue slot this transaction is associated with.
    #[must_use]
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    /// Associates the transaction with a queue slot.
    ///
    /// A transaction belongs to at most one slot; rebinding to a different
    /// slot is an error.
    pub fn bind_slot(&mut self, slot: usize) -> Result<()> {
        match self.slot {
            Some(bound) if bound != slot => Err(Error::invalid(format!(
                "transaction is bound to slot {bound}, not {slot}"
            ))),
            _ => {
                self.slot = Some(slot);
                Ok(())
            }
        }
    }

    /// Sorts objects and properties by id. Merge and subtract rely on it.
    pub(crate) fn sort(&mut self) {
        if self.sorted {
            return;
        }
        self.objects.sort_unstable_by_key(|o| o.id);
        for obj in &mut self.objects {
            obj.props.sort_unstable_by_key(|p| p.id);
        }
        self.sorted = true;
    }

    /// Entries in wire order (ascending object, then property id).
    pub(crate) fn sorted_entries(&self) -> Vec<(ObjectId, PropertyId, u64)> {
        let mut entries: Vec<_> = self.iter().collect();
        if !self.sorted {
            entries.sort_unstable_by_key(|&(obj, prop, _)| (obj, prop));
        }
        entries
    }

    /// Flattens the transaction into its wire form.
    #[must_use]
    pub fn to_request(&self) -> CommitRequest {
        CommitRequest::from_grouped(self.sorted_entries())
    }

    /// Issues the transaction as one atomic commit.
    ///
    /// After an applied (non test-only) commit, every owned value receives
    /// [`PropertyOwner::on_commit`].
    pub fn commit(&self, card: &Card, flags: CommitFlags, tag: u64) -> Result<()> {
        let req = self.to_request();
        card.device().atomic_commit(&req, flags, tag)?;
        tracing::trace!(properties = req.len(), ?flags, "atomic commit accepted");
        if !flags.contains(CommitFlags::TEST_ONLY) {
            for prop in self.objects.iter().flat_map(|o| &o.props) {
                if let Some(owner) = &prop.owner {
                    owner.on_commit(prop.value);
                }
            }
        }
        Ok(())
    }

    /// Validates the transaction without applying it.
    pub fn test(&self, card: &Card) -> Result<()> {
        self.commit(card, CommitFlags::TEST_ONLY, 0)
    }
}

fn check_ids(obj: ObjectId, prop: PropertyId) -> Result<()> {
    if !obj.is_valid() {
        return Err(Error::invalid("object id is zero"));
    }
    if !prop.is_valid() {
        return Err(Error::invalid("property id is zero"));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{CommitOutcome, PropertyOwner, Transaction};
    use crate::error::Error;
    use crate::id::{ObjectId, PropertyId};

    /// Owner that counts how many live references exist.
    #[derive(Debug)]
    pub(crate) struct Tracked {
        pub(crate) value: u64,
        pub(crate) live: Arc<AtomicUsize>,
    }

    impl Tracked {
        pub(crate) fn new(value: u64, live: &Arc<AtomicUsize>) -> Arc<Self> {
            live.fetch_add(1, Ordering::SeqCst);
            Arc::new(Self {
                value,
                live: Arc::clone(live),
            })
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl PropertyOwner for Tracked {
        fn value(&self) -> u64 {
            self.value
        }
    }

    #[test]
    fn zero_ids_are_rejected() {
        let mut txn = Transaction::new();
        assert!(matches!(
            txn.add_property(ObjectId(0), PropertyId(1), 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            txn.add_property(ObjectId(1), PropertyId(0), 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(txn.is_empty(), "failed adds leave no trace");
    }

    #[test]
    fn last_write_wins() {
        let mut txn = Transaction::new();
        txn.add_property(ObjectId(4), PropertyId(2), 10).unwrap();
        txn.add_property(ObjectId(4), PropertyId(2), 11).unwrap();
        assert_eq!(txn.get(ObjectId(4), PropertyId(2)), Some(11));
        assert_eq!(txn.len(), 1);
    }

    #[test]
    fn overwrite_releases_previous_owner() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut txn = Transaction::new();
        txn.add_owned(ObjectId(1), PropertyId(1), Tracked::new(5, &live))
            .unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);

        txn.add_owned(ObjectId(1), PropertyId(1), Tracked::new(6, &live))
            .unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1, "displaced owner released");
        assert_eq!(txn.get(ObjectId(1), PropertyId(1)), Some(6));

        drop(txn);
        assert_eq!(live.load(Ordering::SeqCst), 0, "drop releases all owners");
    }

    #[test]
    fn clone_takes_extra_references() {
        let live = Arc::new(AtomicUsize::new(0));
        let owner = Tracked::new(9, &live);
        let mut txn = Transaction::new();
        txn.add_owned(ObjectId(1), PropertyId(1), owner.clone()).unwrap();
        let copy = txn.clone();
        assert_eq!(Arc::strong_count(&owner), 3);
        drop(txn);
        assert_eq!(Arc::strong_count(&owner), 2);
        drop(copy);
        assert_eq!(Arc::strong_count(&owner), 1);
    }

    #[test]
    fn complete_runs_callbacks_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut txn = Transaction::new();
        let counter = Arc::clone(&hits);
        txn.on_complete(move |outcome| {
            assert_eq!(outcome, CommitOutcome::Abandoned);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        txn.complete(CommitOutcome::Abandoned);
        txn.complete(CommitOutcome::Abandoned);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn slot_binding_is_exclusive() {
        let mut txn = Transaction::new();
        txn.bind_slot(2).unwrap();
        txn.bind_slot(2).unwrap();
        assert!(txn.bind_slot(3).is_err(), "rebinding must fail");
        assert_eq!(txn.slot(), Some(2));
    }

    #[test]
    fn request_is_sorted_regardless_of_insertion_order() {
        let mut txn = Transaction::new();
        txn.add_property(ObjectId(9), PropertyId(3), 1).unwrap();
        txn.add_property(ObjectId(2), PropertyId(8), 2).unwrap();
        txn.add_property(ObjectId(9), PropertyId(1), 3).unwrap();

        let req = txn.to_request();
        assert_eq!(req.objects, [ObjectId(2), ObjectId(9)]);
        assert_eq!(req.props, [PropertyId(8), PropertyId(1), PropertyId(3)]);
        assert_eq!(req.values, [2, 3, 1]);
    }
}
