//! Keyed callback registry with index-based disposal.
//!
//! Callbacks live in a slot map per key. Registering returns a
//! [`ListenerHandle`] that remembers only its key and slot id, so disposing
//! one callback never disturbs the others. Emission clones the bucket
//! before invoking anything, so a callback may freely register or dispose
//! listeners (including itself) while it runs.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// A registered callback.
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Slots<K, E: ?Sized> {
    next_id: u64,
    buckets: HashMap<K, BTreeMap<u64, Callback<E>>>,
}

/// Registry of callbacks grouped by key.
///
/// Cheaply cloneable; clones share the same slots.
pub struct ListenerRegistry<K, E: ?Sized> {
    slots: Arc<Mutex<Slots<K, E>>>,
}

impl<K, E: ?Sized> Clone for ListenerRegistry<K, E> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K: Eq + Hash + Clone, E: ?Sized> Default for ListenerRegistry<K, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, E: ?Sized> ListenerRegistry<K, E> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                buckets: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<K, E>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback` under `key`.
    pub fn register<F>(&self, key: K, callback: F) -> ListenerHandle<K, E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut slots = self.lock();
        let id = slots.next_id;
        slots.next_id += 1;
        slots
            .buckets
            .entry(key.clone())
            .or_default()
            .insert(id, Arc::new(callback));

        ListenerHandle {
            key,
            id,
            slots: Arc::downgrade(&self.slots),
        }
    }

    /// Invoke every callback registered under `key`, in registration order.
    /// Returns how many were called.
    pub fn emit(&self, key: &K, event: &E) -> usize {
        let callbacks: Vec<Callback<E>> = self
            .lock()
            .buckets
            .get(key)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default();

        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    /// Number of callbacks registered under `key`.
    pub fn count(&self, key: &K) -> usize {
        self.lock().buckets.get(key).map_or(0, BTreeMap::len)
    }

    /// Whether `key` currently has a bucket at all.
    pub fn has_key(&self, key: &K) -> bool {
        self.lock().buckets.contains_key(key)
    }

    /// Total callbacks across all keys.
    pub fn len(&self) -> usize {
        self.lock().buckets.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration. Outstanding handles become no-ops.
    pub fn clear(&self) {
        self.lock().buckets.clear();
    }
}

/// Disposer for a single registration.
///
/// Dropping the handle does NOT unregister; call [`dispose`](Self::dispose).
/// Handles hold only a weak reference, so they never keep a registry alive.
pub struct ListenerHandle<K, E: ?Sized> {
    key: K,
    id: u64,
    slots: Weak<Mutex<Slots<K, E>>>,
}

impl<K: Eq + Hash, E: ?Sized> ListenerHandle<K, E> {
    /// Remove exactly this callback. An emptied bucket is freed.
    /// Returns `false` if it was already gone.
    pub fn dispose(self) -> bool {
        let Some(slots) = self.slots.upgrade() else {
            return false;
        };
        let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(bucket) = slots.buckets.get_mut(&self.key) else {
            return false;
        };
        let removed = bucket.remove(&self.id).is_some();
        if bucket.is_empty() {
            slots.buckets.remove(&self.key);
        }
        removed
    }

    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: std::fmt::Debug, E: ?Sized> std::fmt::Debug for ListenerHandle<K, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&u32) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&hits);
        (hits, move |_: &u32| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn dispose_removes_only_its_own_callback() {
        let registry: ListenerRegistry<&'static str, u32> = ListenerRegistry::new();
        let (first_hits, first) = counter();
        let (second_hits, second) = counter();

        let first_handle = registry.register("zone", first);
        let _second_handle = registry.register("zone", second);
        assert_eq!(registry.emit(&"zone", &1), 2);

        assert!(first_handle.dispose());
        assert_eq!(registry.emit(&"zone", &2), 1);

        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn last_dispose_frees_the_bucket() {
        let registry: ListenerRegistry<&'static str, u32> = ListenerRegistry::new();
        let (_, cb) = counter();
        let handle = registry.register("admin", cb);
        assert!(registry.has_key(&"admin"));

        assert!(handle.dispose());
        assert!(!registry.has_key(&"admin"));
        assert!(registry.is_empty());
    }

    #[test]
    fn handle_after_clear_is_noop() {
        let registry: ListenerRegistry<&'static str, u32> = ListenerRegistry::new();
        let (_, cb) = counter();
        let handle = registry.register("zone", cb);
        registry.clear();
        assert!(!handle.dispose());
    }

    #[test]
    fn emit_unknown_key_calls_nothing() {
        let registry: ListenerRegistry<&'static str, u32> = ListenerRegistry::new();
        assert_eq!(registry.emit(&"nobody", &0), 0);
    }

    #[test]
    fn callback_may_register_while_emitting() {
        let registry: ListenerRegistry<&'static str, u32> = ListenerRegistry::new();
        let inner = registry.clone();
        let _handle = registry.register("zone", move |_| {
            let _nested = inner.register("zone", |_| {});
        });

        assert_eq!(registry.emit(&"zone", &0), 1);
        assert_eq!(registry.count(&"zone"), 2);
    }

    #[test]
    fn unsized_events_are_supported() {
        let registry: ListenerRegistry<(), [u32]> = ListenerRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&seen);
        let _handle = registry.register((), move |items: &[u32]| {
            inner.store(items.len(), Ordering::SeqCst);
        });

        registry.emit(&(), &[1, 2, 3]);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
