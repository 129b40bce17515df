// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Atomic display-state transactions for KMS.
//!
//! `sluice_core` holds the data model and algorithms that sit between a
//! producer of frames and the kernel's atomic modesetting interface:
//!
//! ```text
//!   Pool::acquire ──► Arc<Framebuffer> ──► Transaction::add_framebuffer
//!        ▲                                        │
//!        │                                        ▼
//!   PreRelease (recycle)              merge / commit / isolate
//!        ▲                                        │
//!        └──────── last Arc dropped ◄─────────────┘
//! ```
//!
//! **[`device`]** — The [`KmsDevice`] contract every kernel interaction goes
//! through, and [`Card`], the shared handle to it.
//!
//! **[`bo`]** — Reference-counted GEM buffer objects with import
//! de-duplication.
//!
//! **[`framebuffer`]** — Framebuffers over 1–4 buffer objects, with crop,
//! active area, metadata, and pre-release/on-destroy hooks.
//!
//! **[`txn`]** — [`Transaction`]: the `(object, property) → value` store with
//! ownership of referenced resources, merge, subtraction, atomic commit, and
//! isolation of rejected properties.
//!
//! **[`pool`]** — Bounded recycling [`Pool`] of framebuffers.
//!
//! **[`alloc`]** — The [`FramebufferAllocator`] seam and the dumb-buffer
//! allocator.
//!
//! Submission with completion tracking and retry lives in `sluice_queue`.
//!
//! # Crate features
//!
//! - `serde` (disabled by default): `Serialize`/`Deserialize` for
//!   configuration and format types.

pub mod alloc;
pub mod blob;
pub mod bo;
pub mod device;
pub mod error;
pub mod format;
pub mod framebuffer;
pub mod id;
pub mod pool;
pub mod txn;

pub use alloc::{DumbAllocator, FramebufferAllocator};
pub use blob::Blob;
pub use bo::{BufferKind, BufferObject};
pub use device::{
    Card, CommitFlags, CommitRequest, CompletionEvent, DumbAllocation, FramebufferLayout, KmsDevice,
};
pub use error::{Error, Result};
pub use format::{Fourcc, Modifier};
pub use framebuffer::{Framebuffer, FramebufferAllocation, FramebufferDesc, Metadata};
pub use id::{BlobId, FbId, GemHandle, ObjectId, PropertyId};
pub use pool::{Pool, PoolConfig, PoolStats};
pub use txn::{CommitOutcome, CompletionFn, PropertyOwner, Transaction};
