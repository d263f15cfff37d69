//! Pending-request table shared by the worker pool and the RPC client.
//!
//! Callers register an id before sending the request, then await the
//! returned receiver without holding any lock. Whichever terminal event
//! arrives first (a reply, a failure sweep, or the caller giving up) removes
//! the entry; later events for the same id find nothing and are dropped.
//!
//! Each entry carries a `tag` so that a failure sweep can target only the
//! requests bound to one worker generation or one connection epoch.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::LockResultExt;

struct PendingEntry<T, E> {
    tag: u64,
    tx: oneshot::Sender<Result<T, E>>,
}

pub(crate) struct PendingMap<T, E> {
    entries: Mutex<HashMap<u64, PendingEntry<T, E>>>,
}

impl<T, E> PendingMap<T, E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending request and return a receiver for its outcome.
    ///
    /// Returns `None` if the id is already pending.
    pub(crate) fn register(&self, id: u64, tag: u64) -> Option<oneshot::Receiver<Result<T, E>>> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().recover_poison("PendingMap::register");
        if entries.contains_key(&id) {
            return None;
        }
        entries.insert(id, PendingEntry { tag, tx });
        Some(rx)
    }

    /// Move an entry to another tag (e.g. a queued request flushed onto a
    /// fresh connection).
    pub(crate) fn retag(&self, id: u64, tag: u64) -> bool {
        let mut entries = self.entries.lock().recover_poison("PendingMap::retag");
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.tag = tag;
                true
            }
            None => false,
        }
    }

    /// Deliver an outcome and remove the entry.
    ///
    /// Returns `true` if a waiter received it.
    pub(crate) fn complete(&self, id: u64, outcome: Result<T, E>) -> bool {
        let entry = self
            .entries
            .lock()
            .recover_poison("PendingMap::complete")
            .remove(&id);
        match entry {
            Some(entry) => entry.tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Remove an entry without delivering anything.
    pub(crate) fn remove(&self, id: u64) -> bool {
        self.entries
            .lock()
            .recover_poison("PendingMap::remove")
            .remove(&id)
            .is_some()
    }

    /// Fail every entry carrying `tag`. Returns how many were failed.
    pub(crate) fn fail_tagged(&self, tag: u64, make_error: impl Fn() -> E) -> usize {
        let drained: Vec<PendingEntry<T, E>> = {
            let mut entries = self.entries.lock().recover_poison("PendingMap::fail_tagged");
            let ids: Vec<u64> = entries
                .iter()
                .filter(|(_, entry)| entry.tag == tag)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id))
                .collect()
        };
        Self::fail_entries(drained, make_error)
    }

    /// Fail every entry. Returns how many were failed.
    pub(crate) fn fail_all(&self, make_error: impl Fn() -> E) -> usize {
        let drained: Vec<PendingEntry<T, E>> = self
            .entries
            .lock()
            .recover_poison("PendingMap::fail_all")
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        Self::fail_entries(drained, make_error)
    }

    // Channel sends happen after the lock is released.
    fn fail_entries(entries: Vec<PendingEntry<T, E>>, make_error: impl Fn() -> E) -> usize {
        let count = entries.len();
        for entry in entries {
            let _ = entry.tx.send(Err(make_error()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().recover_poison("PendingMap::len").len()
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries
            .lock()
            .recover_poison("PendingMap::contains")
            .contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Map = PendingMap<&'static str, String>;

    #[test]
    fn register_rejects_duplicate_id() {
        let map = Map::new();
        assert!(map.register(1, 0).is_some());
        assert!(map.register(1, 0).is_none());
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn complete_delivers_once() {
        let map = Map::new();
        let rx = map.register(7, 0).unwrap();

        assert!(map.complete(7, Ok("done")));
        assert!(!map.complete(7, Ok("again")));
        assert_eq!(rx.await.unwrap(), Ok("done"));
        assert_eq!(map.len(), 0);
    }

    #[tokio::test]
    async fn fail_tagged_only_touches_matching_entries() {
        let map = Map::new();
        let old = map.register(1, 10).unwrap();
        let fresh = map.register(2, 11).unwrap();

        assert_eq!(map.fail_tagged(10, || "worker died".to_string()), 1);
        assert_eq!(old.await.unwrap(), Err("worker died".to_string()));
        assert!(map.contains(2));

        map.complete(2, Ok("ok"));
        assert_eq!(fresh.await.unwrap(), Ok("ok"));
    }

    #[tokio::test]
    async fn retag_moves_entry_between_sweeps() {
        let map = Map::new();
        let rx = map.register(1, 0).unwrap();
        assert!(map.retag(1, 5));

        assert_eq!(map.fail_tagged(0, || "stale".to_string()), 0);
        assert_eq!(map.fail_tagged(5, || "dropped".to_string()), 1);
        assert_eq!(rx.await.unwrap(), Err("dropped".to_string()));
    }

    #[tokio::test]
    async fn fail_all_clears_everything() {
        let map = Map::new();
        let a = map.register(1, 0).unwrap();
        let b = map.register(2, 3).unwrap();

        assert_eq!(map.fail_all(|| "gone".to_string()), 2);
        assert_eq!(map.len(), 0);
        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());
    }

    #[test]
    fn complete_after_receiver_dropped_still_removes() {
        let map = Map::new();
        drop(map.register(1, 0).unwrap());
        assert!(!map.complete(1, Ok("late")));
        assert_eq!(map.len(), 0);
        assert!(!map.remove(1));
    }
}
