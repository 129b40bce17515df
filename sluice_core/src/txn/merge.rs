// Copyright 2026 the Sluice Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Merge and subtraction of transactions.
//!
//! Both sides are sorted by object id and, within each object, by property
//! id. Merging is then an ordered-set union walk at both levels, subtraction
//! an ordered-set difference.

use std::cmp::Ordering;
use std::iter::Peekable;
use std::mem;
use std::sync::Arc;

use super::{ObjectProps, Property, PropertyOwner, Transaction};
use crate::id::{ObjectId, PropertyId};

impl Transaction {
    /// Moves the content of `src` into `self`.
    ///
    /// When `src` has no other owner its arrays are moved; otherwise they are
    /// duplicated (taking extra references on owned values) and the shared
    /// original is left intact.
    ///
    /// On collisions the value from `src` wins: its write is considered to
    /// happen after every write already in `self`. The displaced owner from
    /// `self` is released. Completion callbacks are concatenated.
    pub fn merge(&mut self, src: Arc<Self>) {
        match Arc::try_unwrap(src) {
            Ok(owned) => self.merge_from(owned),
            Err(shared) => self.merge_from(Self::clone(&shared)),
        }
    }

    /// Moves the content of an exclusively owned `src` into `self`.
    ///
    /// See [`merge`](Self::merge).
    pub fn merge_from(&mut self, src: Self) {
        let mut displaced = Vec::new();
        self.merge_from_into(src, &mut displaced);
    }

    /// Like [`merge_from`](Self::merge_from), but owners displaced by
    /// collisions are pushed onto `released` instead of being dropped.
    ///
    /// Lets a caller holding a lock release them after unlocking.
    pub fn merge_from_into(&mut self, mut src: Self, released: &mut Vec<Arc<dyn PropertyOwner>>) {
        src.sort();
        if self.objects.is_empty() {
            self.objects = mem::take(&mut src.objects);
            self.sorted = true;
        } else {
            self.sort();
            let dst = mem::take(&mut self.objects);
            self.objects = union_objects(dst, mem::take(&mut src.objects), released);
        }
        self.callbacks.append(&mut src.callbacks);
        if self.slot.is_none() {
            self.slot = src.slot;
        }
    }

    /// Removes every `(object, property)` pair present in `victims`.
    ///
    /// Values in `victims` are ignored; only the keys matter. Owned values
    /// that are removed are released. Returns the number of entries removed.
    pub fn subtract(&mut self, victims: &Self) -> usize {
        let mut removed = Vec::new();
        self.subtract_into(victims, &mut removed)
    }

    /// Like [`subtract`](Self::subtract), but owners of removed entries are
    /// pushed onto `released` instead of being dropped.
    pub fn subtract_into(
        &mut self,
        victims: &Self,
        released: &mut Vec<Arc<dyn PropertyOwner>>,
    ) -> usize {
        let keys: Vec<(ObjectId, PropertyId)> = victims
            .sorted_entries()
            .into_iter()
            .map(|(obj, prop, _)| (obj, prop))
            .collect();
        if keys.is_empty() {
            return 0;
        }

        self.sort();
        let mut removed = 0;
        let mut cursor = keys.iter().copied().peekable();
        for obj in &mut self.objects {
            while cursor.next_if(|&(o, _)| o < obj.id).is_some() {}
            if cursor.peek().is_none_or(|&(o, _)| o != obj.id) {
                continue;
            }
            let id = obj.id;
            let mut kept = Vec::with_capacity(obj.props.len());
            for p in mem::take(&mut obj.props) {
                while cursor.next_if(|&(o, q)| o == id && q < p.id).is_some() {}
                if cursor.next_if_eq(&(id, p.id)).is_some() {
                    removed += 1;
                    released.extend(p.owner);
                } else {
                    kept.push(p);
                }
            }
            obj.props = kept;
        }
        self.objects.retain(|o| !o.props.is_empty());
        removed
    }
}

fn union_objects(
    dst: Vec<ObjectProps>,
    src: Vec<ObjectProps>,
    released: &mut Vec<Arc<dyn PropertyOwner>>,
) -> Vec<ObjectProps> {
    let mut out = Vec::with_capacity(dst.len() + src.len());
    let mut dst = dst.into_iter().peekable();
    let mut src = src.into_iter().peekable();
    while let Some(order) = peek_order(&mut dst, &mut src, |o| o.id) {
        match order {
            Ordering::Less => out.extend(dst.next()),
            Ordering::Greater => out.extend(src.next()),
            Ordering::Equal => {
                if let (Some(d), Some(s)) = (dst.next(), src.next()) {
                    out.push(ObjectProps {
                        id: d.id,
                        props: union_props(d.props, s.props, released),
                    });
                }
            }
        }
    }
    out
}

fn union_props(
    dst: Vec<Property>,
    src: Vec<Property>,
    released: &mut Vec<Arc<dyn PropertyOwner>>,
) -> Vec<Property> {
    let mut out = Vec::with_capacity(dst.len() + src.len());
    let mut dst = dst.into_iter().peekable();
    let mut src = src.into_iter().peekable();
    while let Some(order) = peek_order(&mut dst, &mut src, |p| p.id) {
        match order {
            Ordering::Less => out.extend(dst.next()),
            Ordering::Greater => out.extend(src.next()),
            Ordering::Equal => {
                // src happens after dst.
                if let Some(displaced) = dst.next() {
                    released.extend(displaced.owner);
                }
                out.extend(src.next());
            }
        }
    }
    out
}

fn peek_order<T, K: Ord>(
    a: &mut Peekable<impl Iterator<Item = T>>,
    b: &mut Peekable<impl Iterator<Item = T>>,
    key: impl Fn(&T) -> K,
) -> Option<Ordering> {
    match (a.peek(), b.peek()) {
        (None, None) => None,
        (Some(_), None) => Some(Ordering::Less),
        (None, Some(_)) => Some(Ordering::Greater),
        (Some(x), Some(y)) => Some(key(x).cmp(&key(y))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::id::{ObjectId, PropertyId};
    use crate::txn::{PropertyOwner, Transaction};
    use crate::txn::tests::Tracked;

    fn txn(entries: &[(u32, u32, u64)]) -> Transaction {
        let mut t = Transaction::new();
        for &(o, p, v) in entries {
            t.add_property(ObjectId(o), PropertyId(p), v).unwrap();
        }
        t
    }

    fn entries(t: &Transaction) -> Vec<(u32, u32, u64)> {
        let mut out: Vec<_> = t.iter().map(|(o, p, v)| (o.0, p.0, v)).collect();
        out.sort_unstable();
        out
    }

    #[test]
    fn merge_is_ordered_union_with_src_winning() {
        let mut dst = txn(&[(5, 1, 10), (2, 1, 20), (5, 3, 30)]);
        let src = txn(&[(5, 3, 31), (7, 1, 40), (5, 2, 50)]);
        dst.merge_from(src);

        assert_eq!(
            entries(&dst),
            [(2, 1, 20), (5, 1, 10), (5, 2, 50), (5, 3, 31), (7, 1, 40)]
        );
        let ids: Vec<_> = dst.to_request().objects.iter().map(|o| o.0).collect();
        assert_eq!(ids, [2, 5, 7]);
    }

    #[test]
    fn merge_into_empty_moves_arrays() {
        let mut dst = Transaction::new();
        dst.merge_from(txn(&[(3, 3, 3), (1, 1, 1)]));
        assert_eq!(entries(&dst), [(1, 1, 1), (3, 3, 3)]);
    }

    #[test]
    fn shared_src_is_left_intact() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut shared = Transaction::new();
        shared
            .add_owned(ObjectId(1), PropertyId(1), Tracked::new(7, &live))
            .unwrap();
        let shared = Arc::new(shared);

        let mut dst = Transaction::new();
        dst.merge(Arc::clone(&shared));

        assert_eq!(shared.get(ObjectId(1), PropertyId(1)), Some(7));
        assert_eq!(dst.get(ObjectId(1), PropertyId(1)), Some(7));
        let owner = dst.owner(ObjectId(1), PropertyId(1)).unwrap();
        assert_eq!(Arc::strong_count(owner), 2, "owner referenced by both");
    }

    #[test]
    fn collision_releases_displaced_dst_owner() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut dst = Transaction::new();
        dst.add_owned(ObjectId(1), PropertyId(1), Tracked::new(1, &live))
            .unwrap();
        let mut src = Transaction::new();
        src.add_owned(ObjectId(1), PropertyId(1), Tracked::new(2, &live))
            .unwrap();

        dst.merge_from(src);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(dst.get(ObjectId(1), PropertyId(1)), Some(2));
    }

    #[test]
    fn merge_concatenates_callbacks_and_keeps_slot() {
        let mut dst = Transaction::new();
        dst.on_complete(|_| {});
        let mut src = Transaction::new();
        src.on_complete(|_| {});
        src.bind_slot(1).unwrap();

        dst.merge_from(src);
        assert_eq!(dst.callback_count(), 2);
        assert_eq!(dst.slot(), Some(1));
    }

    /// Every way of splitting a write sequence between two transactions and
    /// merging them yields the value of the causally last write.
    #[test]
    fn last_write_wins_independent_of_distribution() {
        let writes: [(u32, u32, u64); 6] =
            [(1, 1, 1), (1, 2, 2), (1, 1, 3), (2, 1, 4), (1, 2, 5), (2, 1, 6)];
        let expected = [(1, 1, 3), (1, 2, 5), (2, 1, 6)];

        // src writes happen after every dst write, so a split is a prefix.
        for split in 0..=writes.len() {
            let mut dst = txn(&writes[..split]);
            let src = txn(&writes[split..]);
            dst.merge_from(src);
            assert_eq!(entries(&dst), expected, "split at {split}");
        }

        // Chained merges of single-write transactions behave the same.
        let mut acc = Transaction::new();
        for w in writes {
            acc.merge(Arc::new(txn(&[w])));
        }
        assert_eq!(entries(&acc), expected);
    }

    #[test]
    fn subtract_removes_exactly_the_victim_keys() {
        let all = [(1, 1, 1), (1, 2, 2), (1, 3, 3), (4, 1, 4), (4, 2, 5), (9, 9, 6)];

        // Every subset of keys, expressed as a bit mask.
        for mask in 0_u32..(1 << all.len()) {
            let mut a = txn(&all);
            let victims: Vec<_> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, &(o, p, _))| (o, p, 0))
                .collect();
            let removed = a.subtract(&txn(&victims));

            let expected: Vec<_> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) == 0)
                .map(|(_, &e)| e)
                .collect();
            assert_eq!(removed, victims.len(), "mask {mask:#b}");
            assert_eq!(entries(&a), expected, "mask {mask:#b}");
        }
    }

    #[test]
    fn subtract_ignores_unknown_keys_and_drops_empty_objects() {
        let mut a = txn(&[(1, 1, 1), (2, 1, 2)]);
        let removed = a.subtract(&txn(&[(1, 1, 0), (3, 3, 0)]));
        assert_eq!(removed, 1);
        assert_eq!(a.object_count(), 1);
        assert_eq!(entries(&a), [(2, 1, 2)]);
    }

    #[test]
    fn subtract_releases_removed_owners() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut a = Transaction::new();
        a.add_owned(ObjectId(1), PropertyId(1), Tracked::new(1, &live))
            .unwrap();
        a.add_property(ObjectId(1), PropertyId(2), 2).unwrap();
        a.subtract(&txn(&[(1, 1, 0)]));
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn merge_into_sink_defers_displaced_owner() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut dst = Transaction::new();
        dst.add_owned(ObjectId(1), PropertyId(1), Tracked::new(1, &live))
            .unwrap();
        let mut src = Transaction::new();
        src.add_owned(ObjectId(1), PropertyId(1), Tracked::new(2, &live))
            .unwrap();

        let mut released = Vec::new();
        dst.merge_from_into(src, &mut released);
        assert_eq!(released.len(), 1, "displaced owner handed to the caller");
        assert_eq!(released[0].value(), 1);
        assert_eq!(live.load(Ordering::SeqCst), 2, "still alive until the sink drops");

        drop(released);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(dst.get(ObjectId(1), PropertyId(1)), Some(2));
    }

    #[test]
    fn subtract_into_sink_defers_removed_owners() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut a = Transaction::new();
        a.add_owned(ObjectId(1), PropertyId(1), Tracked::new(1, &live))
            .unwrap();
        a.add_property(ObjectId(1), PropertyId(2), 2).unwrap();

        let mut released = Vec::new();
        let removed = a.subtract_into(&txn(&[(1, 1, 0), (1, 2, 0)]), &mut released);
        assert_eq!(removed, 2);
        assert_eq!(released.len(), 1, "only owned entries land in the sink");
        assert_eq!(live.load(Ordering::SeqCst), 1, "sink keeps the owner alive");
        assert!(a.is_empty(), "both entries removed");

        drop(released);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
