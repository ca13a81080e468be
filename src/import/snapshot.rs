use serde::Serialize;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};
use tracing::trace;

type SubscriptionId = u64;
type Listener = Arc<dyn Fn(&Arc<ProgressSnapshot>) + Send + Sync>;

/// Live progress of the import currently being observed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub total: u64,
    pub current: u64,
    pub percentage: u8,
    pub current_action: String,
    pub session_id: String,
    pub is_active: bool,
}

/// Fields to merge into the current snapshot; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotPatch {
    pub total: Option<u64>,
    pub current: Option<u64>,
    pub percentage: Option<u8>,
    pub current_action: Option<String>,
    pub session_id: Option<String>,
    pub is_active: Option<bool>,
}

impl SnapshotPatch {
    pub fn inactive() -> Self {
        SnapshotPatch {
            is_active: Some(false),
            ..Default::default()
        }
    }

    fn merged_into(self, base: &ProgressSnapshot) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.unwrap_or(base.total),
            current: self.current.unwrap_or(base.current),
            percentage: self.percentage.unwrap_or(base.percentage),
            current_action: self
                .current_action
                .unwrap_or_else(|| base.current_action.clone()),
            session_id: self.session_id.unwrap_or_else(|| base.session_id.clone()),
            is_active: self.is_active.unwrap_or(base.is_active),
        }
    }
}

struct StoreInner {
    current: Arc<ProgressSnapshot>,
    listeners: HashMap<SubscriptionId, Listener>,
}

/// Observable holder for the single "currently observed" import progress.
///
/// Construct one per process and share it by cloning (clones share state).
/// Readers get an `Arc` that stays pointer-identical until a mutation
/// actually changes the value, so consumers comparing by reference never
/// see spurious changes. Listeners run synchronously after each commit,
/// outside the internal lock.
#[derive(Clone)]
pub struct ProgressStore {
    inner: Arc<Mutex<StoreInner>>,
    next_id: Arc<AtomicU64>,
}

impl ProgressStore {
    pub fn new() -> Self {
        ProgressStore {
            inner: Arc::new(Mutex::new(StoreInner {
                current: Arc::new(ProgressSnapshot::default()),
                listeners: HashMap::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a listener invoked with the new snapshot after every commit.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or explicitly unsubscribed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<ProgressSnapshot>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .unwrap()
            .listeners
            .insert(id, Arc::new(listener));

        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn get_snapshot(&self) -> Arc<ProgressSnapshot> {
        self.inner.lock().unwrap().current.clone()
    }

    /// Merge `patch` into the current state. Returns whether anything changed.
    pub fn update_progress(&self, patch: SnapshotPatch) -> bool {
        self.commit(|current| patch.merged_into(current))
    }

    /// Reset to the empty, inactive snapshot. Returns whether anything changed.
    pub fn clear_progress(&self) -> bool {
        self.commit(|_| ProgressSnapshot::default())
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().unwrap().listeners.len()
    }

    fn commit<F>(&self, next: F) -> bool
    where
        F: FnOnce(&ProgressSnapshot) -> ProgressSnapshot,
    {
        let (snapshot, listeners) = {
            let mut inner = self.inner.lock().unwrap();
            let next = next(&inner.current);
            if *inner.current == next {
                return false;
            }
            inner.current = Arc::new(next);
            let listeners: Vec<Listener> = inner.listeners.values().cloned().collect();
            (inner.current.clone(), listeners)
        };

        trace!(
            "Progress snapshot {}/{} ({}%) active={} '{}'",
            snapshot.current,
            snapshot.total,
            snapshot.percentage,
            snapshot.is_active,
            snapshot.current_action
        );

        for listener in listeners {
            listener(&snapshot);
        }
        true
    }
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener registration returned by [`ProgressStore::subscribe`]
pub struct Subscription {
    id: SubscriptionId,
    inner: Weak<Mutex<StoreInner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().unwrap().listeners.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_listener(store: &ProgressStore) -> (Subscription, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let sub = store.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        (sub, count)
    }

    #[test]
    fn test_unchanged_update_keeps_reference_and_skips_listeners() {
        let store = ProgressStore::new();
        let (_sub, count) = counting_listener(&store);

        let patch = SnapshotPatch {
            total: Some(100),
            current: Some(10),
            percentage: Some(10),
            current_action: Some("Fetching".to_string()),
            session_id: Some("s1".to_string()),
            is_active: Some(true),
        };
        assert!(store.update_progress(patch.clone()));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let before = store.get_snapshot();
        for _ in 0..5 {
            assert!(!store.update_progress(patch.clone()));
            assert!(!store.update_progress(SnapshotPatch::default()));
        }
        let after = store.get_snapshot();

        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_snapshot_is_stable_without_mutation() {
        let store = ProgressStore::new();
        let a = store.get_snapshot();
        let b = store.get_snapshot();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a, ProgressSnapshot::default());
    }

    #[test]
    fn test_partial_update_merges_fields() {
        let store = ProgressStore::new();
        store.update_progress(SnapshotPatch {
            total: Some(10),
            session_id: Some("s1".to_string()),
            ..Default::default()
        });
        store.update_progress(SnapshotPatch {
            current: Some(4),
            ..Default::default()
        });

        let snapshot = store.get_snapshot();
        assert_eq!(snapshot.total, 10);
        assert_eq!(snapshot.current, 4);
        assert_eq!(snapshot.session_id, "s1");
        assert!(!snapshot.is_active);
    }

    #[test]
    fn test_clear_is_noop_when_already_empty() {
        let store = ProgressStore::new();
        let (_sub, count) = counting_listener(&store);

        assert!(!store.clear_progress());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        store.update_progress(SnapshotPatch {
            is_active: Some(true),
            ..Default::default()
        });
        assert!(store.clear_progress());
        assert!(!store.clear_progress());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_multiple_subscribers_and_unsubscribe() {
        let store = ProgressStore::new();
        let (sub_a, count_a) = counting_listener(&store);
        let (_sub_b, count_b) = counting_listener(&store);
        assert_eq!(store.listener_count(), 2);

        store.update_progress(SnapshotPatch {
            current: Some(1),
            ..Default::default()
        });
        sub_a.unsubscribe();
        assert_eq!(store.listener_count(), 1);

        store.update_progress(SnapshotPatch {
            current: Some(2),
            ..Default::default()
        });

        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_receives_committed_snapshot() {
        let store = ProgressStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let reader = store.clone();
        let _sub = store.subscribe(move |snapshot| {
            // Reading the store from inside a listener must not deadlock
            assert!(Arc::ptr_eq(snapshot, &reader.get_snapshot()));
            seen_clone.lock().unwrap().push(snapshot.current);
        });

        store.update_progress(SnapshotPatch {
            current: Some(3),
            ..Default::default()
        });
        store.update_progress(SnapshotPatch {
            current: Some(7),
            ..Default::default()
        });

        assert_eq!(*seen.lock().unwrap(), vec![3, 7]);
    }
}
