// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Isolation of kernel-rejected properties.

use sluice_core::{CommitFlags, Error, ObjectId, PropertyId, Transaction};
use sluice_harness::{fake_card, init_test_tracing};

fn wide_transaction(n: u32) -> Transaction {
    let mut txn = Transaction::new();
    for i in 0..n {
        // Spread entries over several objects.
        txn.add_property(ObjectId(100 + i % 7), PropertyId(1 + i), u64::from(i))
            .unwrap();
    }
    txn
}

#[test]
fn single_bad_property_is_isolated_in_logarithmic_tests() {
    init_test_tracing();
    let (dev, card) = fake_card();
    let n = 64;
    let txn = wide_transaction(n);
    let bad = (ObjectId(100 + 37 % 7), PropertyId(1 + 37));
    dev.reject(bad.0, bad.1);

    let mut failures = Transaction::new();
    let result = txn.commit_test_with_isolation(
        &card,
        CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT,
        Some(&mut failures),
    );
    assert!(matches!(result, Err(Error::Rejected)));
    assert_eq!(failures.len(), 1);
    assert_eq!(failures.get(bad.0, bad.1), Some(37));

    // One full test, log2(64) bisection steps, one re-test of the rest.
    let tests = dev.test_commit_count();
    assert!(tests <= 2 + 6, "took {tests} test commits for n = {n}");
    assert!(
        dev.commits()
            .iter()
            .all(|c| c.flags == CommitFlags::TEST_ONLY),
        "isolation only issues blocking test-only commits"
    );

    let mut pruned = txn.clone();
    assert_eq!(pruned.subtract(&failures), 1);
    pruned.commit(&card, CommitFlags::empty(), 0).unwrap();
    assert_eq!(dev.value(ObjectId(100 + 3 % 7), PropertyId(4)), Some(3));
    assert_eq!(dev.value(bad.0, bad.1), None);
}

#[test]
fn several_bad_properties_are_all_isolated() {
    let (dev, card) = fake_card();
    let txn = wide_transaction(40);
    let bad = [0_u32, 17, 39];
    for i in bad {
        dev.reject(ObjectId(100 + i % 7), PropertyId(1 + i));
    }

    let mut pruned = txn.clone();
    let failures = pruned
        .prune_rejected(&card, CommitFlags::empty())
        .unwrap();
    assert_eq!(failures.len(), bad.len());
    for i in bad {
        assert_eq!(failures.get(ObjectId(100 + i % 7), PropertyId(1 + i)), Some(u64::from(i)));
    }
    assert_eq!(pruned.len(), 40 - bad.len());
    pruned.test(&card).unwrap();
}

#[test]
fn valid_transaction_needs_one_test() {
    let (dev, card) = fake_card();
    let txn = wide_transaction(10);
    let mut failures = Transaction::new();
    txn.commit_test_with_isolation(&card, CommitFlags::empty(), Some(&mut failures))
        .unwrap();
    assert!(failures.is_empty(), "nothing to isolate");
    assert_eq!(dev.test_commit_count(), 1);
}

#[test]
fn without_failures_sink_the_rejection_is_reported_directly() {
    let (dev, card) = fake_card();
    let txn = wide_transaction(10);
    dev.reject(ObjectId(100), PropertyId(1));
    assert!(matches!(
        txn.commit_test_with_isolation(&card, CommitFlags::empty(), None),
        Err(Error::Rejected)
    ));
    assert_eq!(dev.test_commit_count(), 1, "no bisection without a sink");
}

#[test]
fn failures_carry_values_not_owners() {
    let (dev, card) = fake_card();
    let blob = sluice_core::Blob::create(&card, b"payload").unwrap();
    let mut txn = Transaction::new();
    txn.add_blob(ObjectId(5), PropertyId(5), &blob).unwrap();
    txn.add_property(ObjectId(5), PropertyId(6), 1).unwrap();
    dev.reject(ObjectId(5), PropertyId(5));

    let failures = txn.prune_rejected(&card, CommitFlags::empty()).unwrap();
    assert_eq!(failures.get(ObjectId(5), PropertyId(5)), Some(u64::from(blob.id().0)));
    assert!(
        failures.owner(ObjectId(5), PropertyId(5)).is_none(),
        "failures hold plain values"
    );
    assert_eq!(std::sync::Arc::strong_count(&blob), 1, "pruned owner released");
}

#[test]
fn pruned_owners_can_be_released_by_the_caller() {
    let (dev, card) = fake_card();
    let blob = sluice_core::Blob::create(&card, b"payload").unwrap();
    let mut txn = Transaction::new();
    txn.add_blob(ObjectId(5), PropertyId(5), &blob).unwrap();
    txn.add_property(ObjectId(5), PropertyId(6), 1).unwrap();
    dev.reject(ObjectId(5), PropertyId(5));

    let mut released = Vec::new();
    let failures = txn
        .prune_rejected_into(&card, CommitFlags::empty(), &mut released)
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(txn.len(), 1, "valid remainder kept");
    assert_eq!(released.len(), 1, "pruned owner handed back");
    assert_eq!(std::sync::Arc::strong_count(&blob), 2, "alive until the sink drops");

    drop(released);
    assert_eq!(std::sync::Arc::strong_count(&blob), 1);
}
