// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Linux DRM/KMS backend for sluice.
//!
//! [`DrmDevice`] implements [`KmsDevice`](sluice_core::KmsDevice) on an open
//! `/dev/dri/card*` node using the atomic API:
//!
//! ```no_run
//! use sluice_backend_drm::DrmDevice;
//! use sluice_core::Card;
//!
//! let card = Card::new(DrmDevice::open("/dev/dri/card0")?);
//! # Ok::<(), sluice_core::Error>(())
//! ```
//!
//! The kernel reports completion per CRTC rather than per commit. The
//! device remembers which CRTCs every event-requesting commit touched and
//! emits one [`CompletionEvent`](sluice_core::CompletionEvent) per commit
//! once all of them have flipped. Commits that touch no CRTC complete
//! immediately with sequence 0.
//!
//! [`read_events`](sluice_core::KmsDevice::read_events) polls the device
//! together with an eventfd that [`wake`](sluice_core::KmsDevice::wake)
//! writes to.

mod device;
mod flips;

pub use device::DrmDevice;
