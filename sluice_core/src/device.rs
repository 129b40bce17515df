// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Kernel device contract.
//!
//! Sluice never issues ioctls itself. Everything that touches the kernel goes
//! through [`KmsDevice`], which a backend crate implements on top of a real
//! device file and which tests implement with an in-memory fake.
//!
//! The contract mirrors the kernel interfaces the core depends on:
//!
//! - **Atomic commit** in flat-array form ([`CommitRequest`]) with
//!   [`CommitFlags`] selecting test-only validation, non-blocking submission,
//!   mode-change permission, and a completion event.
//! - **Memory objects**: dumb-buffer creation, GEM handle close, PRIME
//!   import/export.
//! - **Framebuffers and blobs**: registration and removal.
//! - **Completion events**: a blocking read with timeout plus a wakeup used
//!   by the event-processing thread.
//!
//! [`Card`] is the handle the rest of the crate holds. It pairs the device
//! with the table that de-duplicates imported buffer objects.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::bo::{BufferKind, BufferObject};
use crate::error::Result;
use crate::format::{Fourcc, Modifier};
use crate::id::{BlobId, FbId, GemHandle, ObjectId, PropertyId};

bitflags::bitflags! {
    /// Flags for [`KmsDevice::atomic_commit`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CommitFlags: u32 {
        /// Validate only; nothing is applied.
        const TEST_ONLY = 1 << 0;
        /// Return as soon as the kernel accepted the request.
        const NONBLOCK = 1 << 1;
        /// Permit full mode sets.
        const ALLOW_MODESET = 1 << 2;
        /// Deliver a [`CompletionEvent`] once the commit has taken effect.
        const PAGE_FLIP_EVENT = 1 << 3;
    }
}

/// Flattened atomic-commit payload.
///
/// `objects[i]` owns `counts[i]` consecutive entries of `props`/`values`.
/// Objects appear in ascending id order, and so do the properties of each
/// object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitRequest {
    /// Object ids, one per object touched.
    pub objects: Vec<ObjectId>,
    /// Number of properties set on each object.
    pub counts: Vec<u32>,
    /// Property ids for all objects, concatenated.
    pub props: Vec<PropertyId>,
    /// Values parallel to `props`.
    pub values: Vec<u64>,
}

impl CommitRequest {
    /// Builds a request from `(object, property, value)` triples that are
    /// already grouped by object.
    pub fn from_grouped(entries: impl IntoIterator<Item = (ObjectId, PropertyId, u64)>) -> Self {
        let mut req = Self::default();
        for (obj, prop, value) in entries {
            if req.objects.last() == Some(&obj) {
                if let Some(count) = req.counts.last_mut() {
                    *count += 1;
                }
            } else {
                req.objects.push(obj);
                req.counts.push(1);
            }
            req.props.push(prop);
            req.values.push(value);
        }
        req
    }

    /// Total number of property writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Returns `true` when no property is written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Iterates `(object, property, value)` triples in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, PropertyId, u64)> + '_ {
        self.objects
            .iter()
            .zip(&self.counts)
            .flat_map(|(&obj, &count)| core::iter::repeat_n(obj, count as usize))
            .zip(self.props.iter().zip(&self.values))
            .map(|(obj, (&prop, &value))| (obj, prop, value))
    }
}

/// Notification that a non-blocking commit has taken effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompletionEvent {
    /// Tag passed to [`KmsDevice::atomic_commit`].
    pub tag: u64,
    /// Vertical-blank sequence number reported by the kernel.
    pub sequence: u32,
    /// Kernel timestamp of the flip.
    pub timestamp: Duration,
}

/// Result of creating a locally-allocated (dumb) buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DumbAllocation {
    /// GEM handle of the new buffer.
    pub handle: GemHandle,
    /// Row pitch in bytes chosen by the kernel.
    pub pitch: u32,
    /// Total allocation size in bytes.
    pub size: u64,
}

/// Layout of a framebuffer as registered with the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramebufferLayout {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: Fourcc,
    /// Layout modifier of each layer.
    pub modifiers: [Modifier; 4],
    /// Number of layers in use (1–4).
    pub layers: usize,
    /// GEM handle backing each layer.
    pub handles: [GemHandle; 4],
    /// Row pitch of each layer.
    pub pitches: [u32; 4],
    /// Byte offset of each layer within its buffer.
    pub offsets: [u32; 4],
}

/// Kernel operations sluice depends on.
///
/// Implementations must be callable from any thread. `read_events` is only
/// ever called by one thread at a time.
pub trait KmsDevice: Send + Sync {
    /// Issues an atomic commit.
    ///
    /// With [`CommitFlags::PAGE_FLIP_EVENT`], a [`CompletionEvent`] carrying
    /// `tag` is later returned from [`read_events`](Self::read_events).
    ///
    /// Errors follow [`Error::from_commit_io`](crate::Error::from_commit_io).
    fn atomic_commit(&self, req: &CommitRequest, flags: CommitFlags, tag: u64) -> Result<()>;

    /// Allocates a dumb buffer of `width`×`height` at `bpp` bits per pixel.
    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbAllocation>;

    /// Releases a GEM handle obtained from `create_dumb` or `import_fd`.
    fn close_handle(&self, handle: GemHandle) -> Result<()>;

    /// Imports a PRIME descriptor. Importing the same underlying object
    /// twice yields the same handle.
    fn import_fd(&self, fd: BorrowedFd<'_>) -> Result<GemHandle>;

    /// Exports a GEM handle as a PRIME descriptor.
    fn export_fd(&self, handle: GemHandle) -> Result<OwnedFd>;

    /// Registers a framebuffer.
    fn add_framebuffer(&self, layout: &FramebufferLayout) -> Result<FbId>;

    /// Unregisters a framebuffer.
    fn remove_framebuffer(&self, fb: FbId) -> Result<()>;

    /// Stores `data` as a property blob.
    fn create_blob(&self, data: &[u8]) -> Result<BlobId>;

    /// Destroys a property blob.
    fn destroy_blob(&self, blob: BlobId) -> Result<()>;

    /// Waits up to `timeout` for completion events and returns those that
    /// arrived. An empty vector means the wait timed out or was woken.
    fn read_events(&self, timeout: Duration) -> Result<Vec<CompletionEvent>>;

    /// Interrupts a concurrent [`read_events`](Self::read_events).
    fn wake(&self);
}

pub(crate) struct CardInner {
    pub(crate) device: Arc<dyn KmsDevice>,
    /// Imported buffer objects by handle.
    pub(crate) imports: Mutex<HashMap<GemHandle, Weak<BufferObject>>>,
}

/// Shared handle to a [`KmsDevice`] plus per-device bookkeeping.
///
/// Cloning is cheap (an `Arc` bump).
#[derive(Clone)]
pub struct Card {
    pub(crate) inner: Arc<CardInner>,
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Card")
            .field("imports", &self.inner.imports.lock().len())
            .finish_non_exhaustive()
    }
}

impl Card {
    /// Wraps a device implementation.
    pub fn new<D: KmsDevice + 'static>(device: D) -> Self {
        Self::from_arc(Arc::new(device))
    }

    /// Wraps an already shared device implementation.
    pub fn from_arc(device: Arc<dyn KmsDevice>) -> Self {
        Self {
            inner: Arc::new(CardInner {
                device,
                imports: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the underlying device.
    #[must_use]
    pub fn device(&self) -> &dyn KmsDevice {
        &*self.inner.device
    }

    /// Returns a shared reference to the underlying device.
    #[must_use]
    pub fn device_arc(&self) -> Arc<dyn KmsDevice> {
        Arc::clone(&self.inner.device)
    }

    /// Number of live buffer objects imported from PRIME descriptors.
    ///
    /// Dumb buffers share the de-dup table (so their exports re-import as
    /// the same object) but are not counted.
    #[must_use]
    pub fn imported_count(&self) -> usize {
        // Handles are dropped after unlocking; a last drop re-locks the table.
        let live: Vec<Arc<BufferObject>> = self
            .inner
            .imports
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        live.iter()
            .filter(|bo| bo.kind() == BufferKind::Imported)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::CommitRequest;
    use crate::id::{ObjectId, PropertyId};

    #[test]
    fn grouped_entries_flatten_per_object() {
        let req = CommitRequest::from_grouped([
            (ObjectId(3), PropertyId(1), 10),
            (ObjectId(3), PropertyId(2), 20),
            (ObjectId(9), PropertyId(1), 30),
        ]);

        assert_eq!(req.objects, [ObjectId(3), ObjectId(9)]);
        assert_eq!(req.counts, [2, 1]);
        assert_eq!(req.props, [PropertyId(1), PropertyId(2), PropertyId(1)]);
        assert_eq!(req.values, [10, 20, 30]);
        assert_eq!(req.len(), 3);
    }

    #[test]
    fn iter_restores_triples() {
        let triples = [
            (ObjectId(1), PropertyId(5), 7),
            (ObjectId(2), PropertyId(5), 8),
            (ObjectId(2), PropertyId(6), 9),
        ];
        let req = CommitRequest::from_grouped(triples);
        assert_eq!(req.iter().collect::<Vec<_>>(), triples);
    }

    #[test]
    fn empty_request_reports_empty() {
        let req = CommitRequest::from_grouped([]);
        assert!(req.is_empty(), "no entries means an empty request");
        assert!(req.objects.is_empty(), "no objects either");
    }
}
