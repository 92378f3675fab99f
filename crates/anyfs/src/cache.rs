//! Identity-keyed weak caches and observable listings.
//!
//! The cache is advisory, not authoritative: a miss falls through to the
//! provider, and values are retained only weakly. Once no caller holds the
//! `Arc` for a cached value, the slot is dropped on the next housekeeping
//! pass rather than kept alive, which bounds memory without an explicit
//! eviction policy at the cost of possible premature misses.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Dead slots are pruned whenever the map outgrows this many entries.
const HOUSEKEEPING_THRESHOLD: usize = 64;

/// A map from normalized identifier to a weakly-held value.
pub struct WeakCache<T> {
    inner: Mutex<HashMap<String, Weak<T>>>,
}

impl<T> Default for WeakCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WeakCache<T> {
    pub fn new() -> Self {
        WeakCache {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up a live value. A dead slot is removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let mut map = self.inner.lock().expect("cache lock poisoned");
        match map.get(key).and_then(Weak::upgrade) {
            Some(value) => Some(value),
            None => {
                map.remove(key);
                None
            }
        }
    }

    pub fn insert(&self, key: &str, value: &Arc<T>) {
        let mut map = self.inner.lock().expect("cache lock poisoned");
        if map.len() > HOUSEKEEPING_THRESHOLD {
            map.retain(|_, slot| slot.strong_count() > 0);
        }
        map.insert(key.to_string(), Arc::downgrade(value));
    }

    pub fn remove(&self, key: &str) {
        let mut map = self.inner.lock().expect("cache lock poisoned");
        map.remove(key);
    }

    pub fn clear(&self) {
        self.inner.lock().expect("cache lock poisoned").clear();
    }

    /// Snapshot of the live entries, for scoped eviction passes.
    pub fn live_entries(&self) -> Vec<(String, Arc<T>)> {
        let map = self.inner.lock().expect("cache lock poisoned");
        map.iter()
            .filter_map(|(key, slot)| slot.upgrade().map(|value| (key.clone(), value)))
            .collect()
    }

    /// Number of live entries.
    pub fn live_len(&self) -> usize {
        let map = self.inner.lock().expect("cache lock poisoned");
        map.values().filter(|slot| slot.strong_count() > 0).count()
    }
}

/// A structural edit applied to a [`Listing`].
pub enum ListEdit<T> {
    Inserted(Arc<T>),
    Removed(Arc<T>),
    Replaced { old: Arc<T>, new: Arc<T> },
    Reset(Vec<Arc<T>>),
}

type Observer<T> = Box<dyn Fn(&ListEdit<T>) + Send + Sync>;

/// An observable collection of shared items.
///
/// The facade caches listings weakly and subscribes to their edits so the
/// single-item caches stay mirrored even when a listing is mutated after it
/// was handed out (e.g. a paged collection loading more items).
pub struct Listing<T> {
    items: RwLock<Vec<Arc<T>>>,
    observers: Mutex<Vec<Observer<T>>>,
}

// Manual impl: the items need not be Debug themselves.
impl<T> fmt::Debug for Listing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listing").field("len", &self.len()).finish()
    }
}

impl<T> Listing<T> {
    pub fn new(items: Vec<Arc<T>>) -> Arc<Self> {
        Arc::new(Listing {
            items: RwLock::new(items),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn items(&self) -> Vec<Arc<T>> {
        self.items.read().expect("listing lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.items.read().expect("listing lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<Arc<T>> {
        self.items
            .read()
            .expect("listing lock poisoned")
            .iter()
            .find(|item| predicate(item))
            .cloned()
    }

    /// Registers an edit observer. Observers are invoked after the edit has
    /// been applied and may read the listing.
    pub fn observe(&self, observer: impl Fn(&ListEdit<T>) + Send + Sync + 'static) {
        self.observers
            .lock()
            .expect("listing lock poisoned")
            .push(Box::new(observer));
    }

    pub fn insert(&self, item: Arc<T>) {
        self.items
            .write()
            .expect("listing lock poisoned")
            .push(item.clone());
        self.notify(&ListEdit::Inserted(item));
    }

    /// Removes the first item matching the predicate and returns it.
    pub fn remove_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<Arc<T>> {
        let removed = {
            let mut items = self.items.write().expect("listing lock poisoned");
            let index = items.iter().position(|item| predicate(item))?;
            Some(items.remove(index))
        };
        if let Some(removed) = &removed {
            self.notify(&ListEdit::Removed(removed.clone()));
        }
        removed
    }

    /// Replaces the first item matching the predicate and returns the old
    /// item.
    pub fn replace_where(
        &self,
        mut predicate: impl FnMut(&T) -> bool,
        new: Arc<T>,
    ) -> Option<Arc<T>> {
        let old = {
            let mut items = self.items.write().expect("listing lock poisoned");
            let index = items.iter().position(|item| predicate(item))?;
            let old = items[index].clone();
            items[index] = new.clone();
            Some(old)
        };
        if let Some(old) = &old {
            self.notify(&ListEdit::Replaced {
                old: old.clone(),
                new,
            });
        }
        old
    }

    /// Replaces the whole collection.
    pub fn reset(&self, new_items: Vec<Arc<T>>) {
        {
            let mut items = self.items.write().expect("listing lock poisoned");
            *items = new_items.clone();
        }
        self.notify(&ListEdit::Reset(new_items));
    }

    fn notify(&self, edit: &ListEdit<T>) {
        let observers = self.observers.lock().expect("listing lock poisoned");
        for observer in observers.iter() {
            observer(edit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_cache_drops_unreferenced_values() {
        let cache = WeakCache::new();
        let value = Arc::new("hello".to_string());
        cache.insert("k", &value);
        assert!(cache.get("k").is_some());

        drop(value);
        assert!(cache.get("k").is_none());
        // The dead slot was removed by the failed lookup.
        assert_eq!(cache.live_len(), 0);
    }

    #[test]
    fn test_weak_cache_housekeeping_prunes_dead_slots() {
        let cache = WeakCache::new();
        for i in 0..HOUSEKEEPING_THRESHOLD + 1 {
            let value = Arc::new(i);
            cache.insert(&format!("dead-{i}"), &value);
        }
        let live = Arc::new(999);
        cache.insert("live", &live);
        assert_eq!(cache.live_entries().len(), 1);
    }

    #[test]
    fn test_listing_edits_notify_observers() {
        let listing = Listing::new(vec![Arc::new(1), Arc::new(2)]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_observer = seen.clone();
        listing.observe(move |edit| {
            let tag = match edit {
                ListEdit::Inserted(_) => "ins",
                ListEdit::Removed(_) => "rem",
                ListEdit::Replaced { .. } => "rep",
                ListEdit::Reset(_) => "rst",
            };
            seen_by_observer.lock().unwrap().push(tag);
        });

        listing.insert(Arc::new(3));
        listing.replace_where(|i| *i == 1, Arc::new(10));
        listing.remove_where(|i| *i == 2);
        listing.reset(vec![Arc::new(7)]);

        assert_eq!(*seen.lock().unwrap(), vec!["ins", "rep", "rem", "rst"]);
        assert_eq!(listing.len(), 1);
    }

    #[test]
    fn test_listing_debug_without_debug_items() {
        // Needed so Result<Arc<Listing<_>>, _> works with assert/unwrap.
        struct Opaque;
        let listing = Listing::new(vec![Arc::new(Opaque), Arc::new(Opaque)]);
        assert_eq!(format!("{listing:?}"), "Listing { len: 2 }");
    }

    #[test]
    fn test_listing_remove_missing_is_noop() {
        let listing: Arc<Listing<i32>> = Listing::new(vec![]);
        assert!(listing.remove_where(|_| true).is_none());
        assert!(listing.replace_where(|_| true, Arc::new(1)).is_none());
    }
}
