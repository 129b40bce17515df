// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test support for sluice.
//!
//! - [`FakeDevice`]: an in-memory [`KmsDevice`](sluice_core::KmsDevice) with
//!   scriptable rejections, busy and I/O failures, and manually or
//!   automatically delivered completion events.
//! - [`CountingAllocator`]: counts allocator calls so tests can tell reuse
//!   from fresh allocation.
//! - [`init_test_tracing`]: routes `tracing` output to the test harness.

mod alloc;
mod device;

use std::sync::Arc;

use sluice_core::Card;

pub use alloc::{AllocCounter, CountingAllocator};
pub use device::{FakeCounters, FakeDevice, RecordedCommit};

/// Installs a `tracing` subscriber that writes through the test harness's
/// captured output. Safe to call from every test.
pub fn init_test_tracing() {
    _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Creates a fake device and a [`Card`] wrapping it.
#[must_use]
pub fn fake_card() -> (Arc<FakeDevice>, Card) {
    let device = Arc::new(FakeDevice::new());
    let card = Card::from_arc(Arc::clone(&device) as Arc<dyn sluice_core::KmsDevice>);
    (device, card)
}
