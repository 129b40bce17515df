// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Kernel property blobs.

use std::fmt;
use std::sync::Arc;

use crate::device::Card;
use crate::error::{Error, Result};
use crate::id::BlobId;
use crate::txn::PropertyOwner;

/// An opaque byte payload stored by the kernel and referenced from a
/// property value by id.
///
/// The blob is destroyed when the last `Arc<Blob>` drops. Adding a blob to a
/// [`Transaction`](crate::Transaction) keeps it alive for as long as the
/// transaction (or the commit it turned into) may still reference it.
pub struct Blob {
    card: Card,
    id: BlobId,
    len: usize,
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Blob {
    /// Uploads `data` as a new blob.
    pub fn create(card: &Card, data: &[u8]) -> Result<Arc<Self>> {
        if data.is_empty() {
            return Err(Error::invalid("property blob payload is empty"));
        }
        let id = card.device().create_blob(data)?;
        Ok(Arc::new(Self {
            card: card.clone(),
            id,
            len: data.len(),
        }))
    }

    /// Kernel id of the blob.
    #[must_use]
    pub fn id(&self) -> BlobId {
        self.id
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; empty payloads are refused at creation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PropertyOwner for Blob {
    fn value(&self) -> u64 {
        u64::from(self.id.0)
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        if let Err(err) = self.card.device().destroy_blob(self.id) {
            tracing::warn!(blob = self.id.0, %err, "failed to destroy property blob");
        }
    }
}
