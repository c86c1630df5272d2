use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::engine::{ProducerRef, ResolveTask, TaskKey};

/// A per-key slot. Flushing an empty slot invalidates it, so a writer that
/// fetched the slot before the flush retries with a fresh one.
pub(crate) enum Bucket<V> {
    Live(V),
    Invalidated,
}

pub(crate) type BucketRef<V> = Arc<Mutex<Bucket<V>>>;

pub(crate) trait BucketValue: Default {
    fn is_vacant(&self) -> bool;
}

/// Tasks resolving one requirement, one per ancestor set and exclusion set.
pub(crate) type RequirementEntry = HashMap<TaskKey, Arc<ResolveTask>>;

/// The task working on one specification and the producer it registered.
pub(crate) struct SpecificationEntry {
    pub task: Arc<ResolveTask>,
    pub producer: ProducerRef,
}

impl BucketValue for RequirementEntry {
    fn is_vacant(&self) -> bool {
        self.is_empty()
    }
}

impl BucketValue for Option<SpecificationEntry> {
    fn is_vacant(&self) -> bool {
        self.is_none()
    }
}

/// Two-level concurrent map: the outer lock only guards slot lookup, every slot
/// has its own lock. The only place both are held at once is `flush`, always
/// outer first.
pub(crate) struct Cache<K, V> {
    map: Mutex<HashMap<K, BucketRef<V>>>,
}

impl<K: Hash + Eq + Clone, V: BucketValue> Default for Cache<K, V> {
    fn default() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Hash + Eq + Clone, V: BucketValue> Cache<K, V> {
    fn bucket(&self, key: &K) -> BucketRef<V> {
        self.map
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::Live(V::default()))))
            .clone()
    }

    /// Runs `f` on the live slot for `key`, creating it when needed.
    pub(crate) fn with<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> R {
        loop {
            let bucket = self.bucket(key);
            let mut guard = bucket.lock().unwrap();
            if let Bucket::Live(value) = &mut *guard {
                return f(value);
            }
        }
    }

    /// Runs `f` on the slot for `key` if one is live.
    pub(crate) fn with_existing<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let bucket = self.map.lock().unwrap().get(key).cloned()?;
        let mut guard = bucket.lock().unwrap();
        match &mut *guard {
            Bucket::Live(value) => Some(f(value)),
            Bucket::Invalidated => None,
        }
    }

    /// Visits every live slot, one slot lock at a time.
    pub(crate) fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        let buckets: Vec<(K, BucketRef<V>)> = self
            .map
            .lock()
            .unwrap()
            .iter()
            .map(|(key, bucket)| (key.clone(), bucket.clone()))
            .collect();
        for (key, bucket) in buckets {
            if let Bucket::Live(value) = &*bucket.lock().unwrap() {
                f(&key, value);
            }
        }
    }

    /// Lets `evict` prune every slot, dropping slots left vacant. Returns what
    /// was evicted so it can be released once no lock is held.
    pub(crate) fn flush(&self, mut evict: impl FnMut(&mut V) -> Vec<ProducerRef>) -> Vec<ProducerRef> {
        let mut evicted = Vec::new();
        let mut map = self.map.lock().unwrap();
        map.retain(|_, bucket| {
            let mut guard = bucket.lock().unwrap();
            let Bucket::Live(value) = &mut *guard else {
                return false;
            };
            evicted.extend(evict(value));
            if value.is_vacant() {
                *guard = Bucket::Invalidated;
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Empties the cache, invalidating every slot.
    pub(crate) fn drain(&self) -> Vec<V> {
        let map = std::mem::take(&mut *self.map.lock().unwrap());
        map.into_values()
            .filter_map(|bucket| {
                match std::mem::replace(&mut *bucket.lock().unwrap(), Bucket::Invalidated) {
                    Bucket::Live(value) => Some(value),
                    Bucket::Invalidated => None,
                }
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}
