//! Mutable view: an MVCC overlay atop a read-only snapshot that records
//! reads (for conflict detection) and buffers writes (spec.md §4.5).

use std::ops::Bound;
use std::sync::Arc;

use crate::mutation::{Key, Mutation};
use crate::store::Snapshot;

pub type KeyRange = (Bound<Key>, Bound<Key>);

/// A set of key ranges read by a transaction, point reads included as a
/// single-key range.
#[derive(Debug, Default, Clone)]
pub struct ReadSet {
    ranges: Vec<KeyRange>,
}

impl ReadSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_point(&mut self, key: &[u8]) {
        self.ranges.push((Bound::Included(key.to_vec()), Bound::Included(key.to_vec())));
    }

    pub fn record_range(&mut self, start: Bound<Key>, end: Bound<Key>) {
        self.ranges.push((start, end));
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[KeyRange] {
        &self.ranges
    }

    /// Returns every read range that overlaps any of `writes`, or `None` if
    /// there is no conflict (spec.md §4.5 `reads.findConflict(writes)`).
    /// A counter adjust shares a put's conflict rule.
    pub fn find_conflict(&self, writes: &[Mutation]) -> Option<Vec<KeyRange>> {
        let mut hits = Vec::new();
        for read in &self.ranges {
            for write in writes {
                let touches = match write {
                    Mutation::Put { key, .. } | Mutation::Remove { key } | Mutation::AdjustCounter { key, .. } => {
                        range_contains(read, key)
                    }
                    Mutation::RemoveRange { start, end } => ranges_overlap(read, &(start.clone(), end.clone())),
                };
                if touches {
                    hits.push(read.clone());
                    break;
                }
            }
        }
        if hits.is_empty() {
            None
        } else {
            Some(hits)
        }
    }
}

/// Buffered writes not yet applied to the store.
#[derive(Debug, Default, Clone)]
pub struct WriteSet {
    mutations: Vec<Mutation>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }

    /// The value a buffered write would leave for `key`, if any, applied in
    /// order (last write wins; a matching `RemoveRange` masks the key).
    fn pending_value(&self, key: &[u8]) -> Option<Pending> {
        let mut result = None;
        for m in &self.mutations {
            match m {
                Mutation::Put { key: k, value } if k == key => result = Some(Pending::Value(value.clone())),
                Mutation::Remove { key: k } if k == key => result = Some(Pending::Removed),
                Mutation::RemoveRange { start, end } if range_contains(&(start.clone(), end.clone()), key) => {
                    result = Some(Pending::Removed)
                }
                Mutation::AdjustCounter { key: k, delta } if k == key => {
                    let base = match &result {
                        Some(Pending::Value(v)) => crate::store::decode_counter(v),
                        _ => 0,
                    };
                    result = Some(Pending::Value(crate::store::encode_counter(base + delta)));
                }
                _ => {}
            }
        }
        result
    }
}

enum Pending {
    Value(Vec<u8>),
    Removed,
}

/// The mutable view a transaction reads and writes through: a snapshot
/// overlaid with this transaction's own not-yet-committed writes.
pub struct View {
    snapshot: Arc<dyn Snapshot>,
    pub reads: ReadSet,
    pub writes: WriteSet,
}

impl View {
    pub fn new(snapshot: Arc<dyn Snapshot>) -> Self {
        View { snapshot, reads: ReadSet::new(), writes: WriteSet::new() }
    }

    /// The point-in-time snapshot this view reads through, unaffected by
    /// this transaction's own buffered writes (spec.md §6 `readOnlySnapshot`).
    pub fn snapshot(&self) -> Arc<dyn Snapshot> {
        self.snapshot.clone()
    }

    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.reads.record_point(key);
        match self.writes.pending_value(key) {
            Some(Pending::Value(v)) => Some(v),
            Some(Pending::Removed) => None,
            None => self.snapshot.get(key),
        }
    }

    pub fn get_range(&mut self, start: Bound<Key>, end: Bound<Key>) -> Vec<(Key, Vec<u8>)> {
        self.reads.record_range(start.clone(), end.clone());
        let mut merged: Vec<(Key, Vec<u8>)> = self.snapshot.get_range(start.clone(), end.clone());
        merged.retain(|(k, _)| !matches!(self.writes.pending_value(k), Some(Pending::Removed)));
        for m in self.writes.mutations() {
            if let Mutation::Put { key, value } = m {
                if range_contains(&(start.clone(), end.clone()), key) {
                    merged.retain(|(k, _)| k != key);
                    merged.push((key.clone(), value.clone()));
                }
            }
        }
        merged.sort_by(|a, b| a.0.cmp(&b.0));
        merged
    }

    pub fn put(&mut self, key: Key, value: Vec<u8>) {
        self.writes.push(Mutation::Put { key, value });
    }

    pub fn remove(&mut self, key: Key) {
        self.writes.push(Mutation::Remove { key });
    }

    pub fn remove_range(&mut self, start: Bound<Key>, end: Bound<Key>) {
        self.writes.push(Mutation::RemoveRange { start, end });
    }

    pub fn adjust_counter(&mut self, key: Key, delta: i64) {
        self.writes.push(Mutation::AdjustCounter { key, delta });
    }
}

fn range_contains(range: &KeyRange, key: &[u8]) -> bool {
    let lower_ok = match &range.0 {
        Bound::Unbounded => true,
        Bound::Included(k) => key >= k.as_slice(),
        Bound::Excluded(k) => key > k.as_slice(),
    };
    let upper_ok = match &range.1 {
        Bound::Unbounded => true,
        Bound::Included(k) => key <= k.as_slice(),
        Bound::Excluded(k) => key < k.as_slice(),
    };
    lower_ok && upper_ok
}

/// Whether two key ranges overlap, treating each bound independently.
fn ranges_overlap(a: &KeyRange, b: &KeyRange) -> bool {
    let a_before_b = match (&a.1, &b.0) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
        (Bound::Included(a_end), Bound::Included(b_start)) => a_end < b_start,
        (Bound::Included(a_end), Bound::Excluded(b_start)) => a_end <= b_start,
        (Bound::Excluded(a_end), Bound::Included(b_start)) => a_end <= b_start,
        (Bound::Excluded(a_end), Bound::Excluded(b_start)) => a_end <= b_start,
    };
    let b_before_a = match (&b.1, &a.0) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
        (Bound::Included(b_end), Bound::Included(a_start)) => b_end < a_start,
        (Bound::Included(b_end), Bound::Excluded(a_start)) => b_end <= a_start,
        (Bound::Excluded(b_end), Bound::Included(a_start)) => b_end <= a_start,
        (Bound::Excluded(b_end), Bound::Excluded(a_start)) => b_end <= a_start,
    };
    !a_before_b && !b_before_a
}
