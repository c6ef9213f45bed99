//! The pluggable atomic key/value store this engine replicates on top of
//! (spec.md §6 "Atomic KV store (consumed)"). Deliberately out of scope for
//! this crate: only the trait boundary lives here, plus an in-memory double
//! used by the dispatcher/integration tests.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::mutation::{Key, Mutation};

/// A read-only, point-in-time view of the store. Reads made through a
/// snapshot never observe writes applied after it was taken.
pub trait Snapshot: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Inclusive/exclusive range scan in key order.
    fn get_range(&self, start: Bound<Key>, end: Bound<Key>) -> Vec<(Key, Vec<u8>)>;
}

/// The local atomic key/value engine. All mutation application is a single
/// atomic batch; `sync` requests it be made durable before returning.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn get_range(&self, start: Bound<Key>, end: Bound<Key>) -> Vec<(Key, Vec<u8>)>;

    fn apply(&self, mutations: &[Mutation], sync: bool) -> Result<()>;

    fn snapshot(&self) -> Arc<dyn Snapshot>;

    /// Installs one chunk of a snapshot stream (spec.md §4.7): `pair_index
    /// == 0` starts writing into the inactive "flip-flop" prefix,
    /// subsequent chunks append, and `last_chunk` triggers the atomic swap
    /// that makes the new generation live.
    fn apply_snapshot_chunk(&self, pair_index: u64, data: &[(Key, Vec<u8>)], last_chunk: bool) -> Result<()>;

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory double of [`KvStore`], sufficient for unit and integration
/// tests; never used in a production binary.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<BTreeMap<Key, Vec<u8>>>,
    /// The inactive generation being written to during a snapshot install.
    staging: Mutex<BTreeMap<Key, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

struct MemorySnapshot {
    data: BTreeMap<Key, Vec<u8>>,
}

impl Snapshot for MemorySnapshot {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    fn get_range(&self, start: Bound<Key>, end: Bound<Key>) -> Vec<(Key, Vec<u8>)> {
        self.data.range((start, end)).map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    fn get_range(&self, start: Bound<Key>, end: Bound<Key>) -> Vec<(Key, Vec<u8>)> {
        self.inner.lock().unwrap().range((start, end)).map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn apply(&self, mutations: &[Mutation], _sync: bool) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        for m in mutations {
            apply_one(&mut guard, m);
        }
        Ok(())
    }

    fn snapshot(&self) -> Arc<dyn Snapshot> {
        Arc::new(MemorySnapshot { data: self.inner.lock().unwrap().clone() })
    }

    fn apply_snapshot_chunk(&self, pair_index: u64, data: &[(Key, Vec<u8>)], last_chunk: bool) -> Result<()> {
        let mut staging = self.staging.lock().unwrap();
        if pair_index == 0 {
            staging.clear();
        }
        for (k, v) in data {
            staging.insert(k.clone(), v.clone());
        }
        if last_chunk {
            let mut live = self.inner.lock().unwrap();
            *live = staging.clone();
            staging.clear();
        }
        Ok(())
    }
}

fn apply_one(data: &mut BTreeMap<Key, Vec<u8>>, mutation: &Mutation) {
    match mutation {
        Mutation::Put { key, value } => {
            data.insert(key.clone(), value.clone());
        }
        Mutation::Remove { key } => {
            data.remove(key);
        }
        Mutation::RemoveRange { start, end } => {
            let keys: Vec<Key> = data.range((start.clone(), end.clone())).map(|(k, _)| k.clone()).collect();
            for k in keys {
                data.remove(&k);
            }
        }
        Mutation::AdjustCounter { key, delta } => {
            let current = data.get(key).map(|v| decode_counter(v)).unwrap_or(0);
            data.insert(key.clone(), encode_counter(current + delta));
        }
    }
}

/// Counters are stored as an 8-byte big-endian two's complement encoding,
/// per the client-visible `encode`/`decodeCounter` helpers (spec.md §6).
pub fn encode_counter(v: i64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

pub fn decode_counter(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    i64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove_round_trip() {
        let store = MemoryStore::new();
        store.apply(&[Mutation::Put { key: b"a".to_vec(), value: b"1".to_vec() }], false).unwrap();
        assert_eq!(store.get(b"a"), Some(b"1".to_vec()));
        store.apply(&[Mutation::Remove { key: b"a".to_vec() }], false).unwrap();
        assert_eq!(store.get(b"a"), None);
    }

    #[test]
    fn snapshot_chunks_apply_atomically_on_last_chunk() {
        let store = MemoryStore::new();
        store.apply(&[Mutation::Put { key: b"old".to_vec(), value: b"x".to_vec() }], false).unwrap();
        store.apply_snapshot_chunk(0, &[(b"a".to_vec(), b"1".to_vec())], false).unwrap();
        // Old data is still live until the last chunk flips.
        assert_eq!(store.get(b"old"), Some(b"x".to_vec()));
        assert_eq!(store.get(b"a"), None);
        store.apply_snapshot_chunk(1, &[(b"b".to_vec(), b"2".to_vec())], true).unwrap();
        assert_eq!(store.get(b"old"), None);
        assert_eq!(store.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn counter_adjust_accumulates() {
        let store = MemoryStore::new();
        store.apply(&[Mutation::AdjustCounter { key: b"c".to_vec(), delta: 5 }], false).unwrap();
        store.apply(&[Mutation::AdjustCounter { key: b"c".to_vec(), delta: -2 }], false).unwrap();
        assert_eq!(decode_counter(&store.get(b"c").unwrap()), 3);
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let store = MemoryStore::new();
        store.apply(&[Mutation::Put { key: b"a".to_vec(), value: b"1".to_vec() }], false).unwrap();
        let snap = store.snapshot();
        store.apply(&[Mutation::Put { key: b"a".to_vec(), value: b"2".to_vec() }], false).unwrap();
        assert_eq!(snap.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(store.get(b"a"), Some(b"2".to_vec()));
    }

    #[test]
    fn remove_range_deletes_covered_keys() {
        let store = MemoryStore::new();
        store
            .apply(
                &[
                    Mutation::Put { key: b"a".to_vec(), value: vec![] },
                    Mutation::Put { key: b"b".to_vec(), value: vec![] },
                    Mutation::Put { key: b"c".to_vec(), value: vec![] },
                ],
                false,
            )
            .unwrap();
        store
            .apply(
                &[Mutation::RemoveRange { start: Bound::Included(b"a".to_vec()), end: Bound::Excluded(b"c".to_vec()) }],
                false,
            )
            .unwrap();
        assert_eq!(store.get(b"a"), None);
        assert_eq!(store.get(b"b"), None);
        assert!(store.get(b"c").is_some());
    }
}
