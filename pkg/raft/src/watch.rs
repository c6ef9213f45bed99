//! Key watch tracker: one-shot futures keyed by byte string, fired when a
//! committed log entry touches the key (spec.md §2.11).

use std::collections::HashMap;
use std::ops::Bound;

use tokio::sync::oneshot;

use crate::mutation::{Key, Mutation};

#[derive(Default)]
pub struct WatchTracker {
    watchers: HashMap<Key, Vec<oneshot::Sender<()>>>,
}

impl WatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, key: Key) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.watchers.entry(key).or_default().push(tx);
        rx
    }

    pub fn pending_count(&self) -> usize {
        self.watchers.values().map(|v| v.len()).sum()
    }

    /// Fires and removes every watcher whose key is touched by `mutations`
    /// (a point put/remove/adjust touches its key; a range remove touches
    /// every watched key inside the range).
    pub fn notify_committed(&mut self, mutations: &[Mutation]) {
        if self.watchers.is_empty() {
            return;
        }
        let mut touched: Vec<Key> = Vec::new();
        for m in mutations {
            match m {
                Mutation::Put { key, .. } | Mutation::Remove { key } | Mutation::AdjustCounter { key, .. } => {
                    if self.watchers.contains_key(key) {
                        touched.push(key.clone());
                    }
                }
                Mutation::RemoveRange { start, end } => {
                    for key in self.watchers.keys() {
                        if range_contains(start, end, key) {
                            touched.push(key.clone());
                        }
                    }
                }
            }
        }
        touched.sort();
        touched.dedup();
        for key in touched {
            if let Some(senders) = self.watchers.remove(&key) {
                for tx in senders {
                    let _ = tx.send(());
                }
            }
        }
    }
}

fn range_contains(start: &Bound<Key>, end: &Bound<Key>, key: &[u8]) -> bool {
    let lower_ok = match start {
        Bound::Unbounded => true,
        Bound::Included(k) => key >= k.as_slice(),
        Bound::Excluded(k) => key > k.as_slice(),
    };
    let upper_ok = match end {
        Bound::Unbounded => true,
        Bound::Included(k) => key <= k.as_slice(),
        Bound::Excluded(k) => key < k.as_slice(),
    };
    lower_ok && upper_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn point_write_fires_matching_watcher() {
        let mut tracker = WatchTracker::new();
        let rx = tracker.watch(b"a".to_vec());
        tracker.notify_committed(&[Mutation::Put { key: b"a".to_vec(), value: vec![] }]);
        assert!(rx.await.is_ok());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn unrelated_write_does_not_fire() {
        let mut tracker = WatchTracker::new();
        let rx = tracker.watch(b"a".to_vec());
        tracker.notify_committed(&[Mutation::Put { key: b"z".to_vec(), value: vec![] }]);
        assert_eq!(tracker.pending_count(), 1);
        drop(rx);
    }

    #[tokio::test]
    async fn range_remove_fires_watchers_inside_range() {
        let mut tracker = WatchTracker::new();
        let rx = tracker.watch(b"m".to_vec());
        tracker.notify_committed(&[Mutation::RemoveRange { start: Bound::Included(b"a".to_vec()), end: Bound::Excluded(b"z".to_vec()) }]);
        assert!(rx.await.is_ok());
    }
}
