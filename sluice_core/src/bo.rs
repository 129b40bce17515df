// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reference-counted kernel memory objects.
//!
//! A [`BufferObject`] owns one GEM handle. It is always handed out as
//! `Arc<BufferObject>`; the handle is closed when the last `Arc` drops.
//!
//! Every live buffer object is registered in its [`Card`]'s handle table.
//! The kernel returns the same GEM handle each time the same memory is
//! imported, so [`BufferObject::import`] consults the table and hands back
//! the existing wrapper instead of creating a second owner for the handle.
//! Import and final close both run under the table lock, which closes the
//! window where a re-import could observe a handle that is about to be
//! closed.

use std::collections::hash_map::Entry;
use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;

use crate::device::Card;
use crate::error::{Error, Result};
use crate::id::GemHandle;

/// How the memory behind a [`BufferObject`] came to exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    /// Allocated by this process through the dumb-buffer interface.
    Dumb {
        /// Row pitch in bytes.
        pitch: u32,
        /// Allocation size in bytes.
        size: u64,
    },
    /// Imported from a PRIME descriptor.
    Imported,
}

/// One kernel memory allocation.
pub struct BufferObject {
    card: Card,
    handle: GemHandle,
    kind: BufferKind,
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl BufferObject {
    /// Allocates a dumb buffer.
    pub fn create_dumb(card: &Card, width: u32, height: u32, bpp: u32) -> Result<Arc<Self>> {
        if width == 0 || height == 0 || bpp == 0 {
            return Err(Error::invalid(format!(
                "dumb buffer {width}x{height}@{bpp}bpp has a zero dimension"
            )));
        }
        let device = card.device();
        let mut imports = card.inner.imports.lock();
        let alloc = device.create_dumb(width, height, bpp)?;
        let bo = Arc::new(Self {
            card: card.clone(),
            handle: alloc.handle,
            kind: BufferKind::Dumb {
                pitch: alloc.pitch,
                size: alloc.size,
            },
        });
        imports.insert(alloc.handle, Arc::downgrade(&bo));
        tracing::debug!(handle = alloc.handle.0, width, height, bpp, "created dumb buffer");
        Ok(bo)
    }

    /// Imports a PRIME descriptor, reusing the existing wrapper when the
    /// same memory is already known.
    pub fn import(card: &Card, fd: BorrowedFd<'_>) -> Result<Arc<Self>> {
        let device = card.device();
        let mut imports = card.inner.imports.lock();
        let handle = device.import_fd(fd)?;
        match imports.entry(handle) {
            Entry::Occupied(mut slot) => {
                if let Some(existing) = slot.get().upgrade() {
                    tracing::trace!(handle = handle.0, "import hit existing buffer object");
                    return Ok(existing);
                }
                let bo = Arc::new(Self {
                    card: card.clone(),
                    handle,
                    kind: BufferKind::Imported,
                });
                slot.insert(Arc::downgrade(&bo));
                Ok(bo)
            }
            Entry::Vacant(slot) => {
                let bo = Arc::new(Self {
                    card: card.clone(),
                    handle,
                    kind: BufferKind::Imported,
                });
                slot.insert(Arc::downgrade(&bo));
                tracing::debug!(handle = handle.0, "imported buffer object");
                Ok(bo)
            }
        }
    }

    /// The GEM handle.
    #[must_use]
    pub fn handle(&self) -> GemHandle {
        self.handle
    }

    /// How the memory was obtained.
    #[must_use]
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Row pitch chosen by the kernel, for dumb buffers.
    #[must_use]
    pub fn pitch(&self) -> Option<u32> {
        match self.kind {
            BufferKind::Dumb { pitch, .. } => Some(pitch),
            BufferKind::Imported => None,
        }
    }

    /// The card this object belongs to.
    #[must_use]
    pub fn card(&self) -> &Card {
        &self.card
    }

    /// Exports the memory as a PRIME descriptor.
    pub fn export_fd(&self) -> Result<OwnedFd> {
        self.card.device().export_fd(self.handle)
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        let mut imports = self.card.inner.imports.lock();
        if let Entry::Occupied(slot) = imports.entry(self.handle) {
            if slot.get().strong_count() > 0 {
                // A newer wrapper re-imported the handle after our count hit
                // zero; it owns the handle now.
                return;
            }
            slot.remove();
        }
        if let Err(err) = self.card.device().close_handle(self.handle) {
            tracing::warn!(handle = self.handle.0, %err, "failed to close GEM handle");
        }
    }
}
