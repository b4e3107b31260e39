//! Cache entries and pluggable cache storage.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use indexmap::{IndexMap, IndexSet};
use papaya::HashMap;
use parking_lot::Mutex;

use crate::deferred::Deferred;
use crate::query::{QueryKey, QueryOutput};

/// Memoized state of one query.
///
/// Created when the loader first misses on the query, before its resolution
/// function runs, and shared by every caller that loads it afterwards.
pub struct CacheEntry<Q, T> {
    query: Q,
    dependencies: Mutex<IndexSet<Q, ahash::RandomState>>,
    result: Deferred<T>,
    no_cache: AtomicBool,
    /// Thread currently inside this query's resolution function.
    resolving_on: Mutex<Option<ThreadId>>,
}

impl<Q: QueryKey, T: QueryOutput> CacheEntry<Q, T> {
    pub(crate) fn new(query: Q) -> Self {
        Self {
            query,
            dependencies: Mutex::new(IndexSet::default()),
            result: Deferred::new_pending(),
            no_cache: AtomicBool::new(false),
            resolving_on: Mutex::new(None),
        }
    }

    /// The query this entry memoizes.
    pub fn query(&self) -> &Q {
        &self.query
    }

    /// Direct dependencies recorded so far, in first-loaded order.
    ///
    /// Only complete once [`result`](Self::result) has settled.
    pub fn dependencies(&self) -> Vec<Q> {
        self.dependencies.lock().iter().cloned().collect()
    }

    /// The memoized result. Pending while the resolution is in flight.
    pub fn result(&self) -> &Deferred<T> {
        &self.result
    }

    /// Whether the resolution opted out of caching.
    pub fn is_no_cache(&self) -> bool {
        self.no_cache.load(Ordering::Acquire)
    }

    /// Returns `true` if `query` was not recorded before.
    pub(crate) fn record_dependency(&self, query: Q) -> bool {
        self.dependencies.lock().insert(query)
    }

    pub(crate) fn mark_no_cache(&self) {
        self.no_cache.store(true, Ordering::Release);
    }

    pub(crate) fn begin_resolving(&self) -> ResolvingGuard<'_, Q, T> {
        *self.resolving_on.lock() = Some(thread::current().id());
        ResolvingGuard { entry: self }
    }

    /// Whether the current thread is inside this entry's resolution function.
    pub(crate) fn is_resolving_here(&self) -> bool {
        *self.resolving_on.lock() == Some(thread::current().id())
    }
}

impl<Q: fmt::Debug, T> fmt::Debug for CacheEntry<Q, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("query", &self.query)
            .field("dependencies", &*self.dependencies.lock())
            .field("result", &self.result)
            .finish()
    }
}

/// Clears the resolving marker, also when the resolution function panics.
pub(crate) struct ResolvingGuard<'a, Q, T> {
    entry: &'a CacheEntry<Q, T>,
}

impl<Q, T> Drop for ResolvingGuard<'_, Q, T> {
    fn drop(&mut self) {
        *self.entry.resolving_on.lock() = None;
    }
}

/// Storage for cache entries.
///
/// Any mapping can be plugged in through
/// [`LoaderBuilder::cache`](crate::LoaderBuilder::cache). Implementations
/// shared between threads should override
/// [`get_or_insert`](Cache::get_or_insert) with an atomic version.
pub trait Cache<Q, T>: Send + Sync + 'static {
    /// Look up the entry for `query`.
    fn get(&self, query: &Q) -> Option<Arc<CacheEntry<Q, T>>>;

    /// Store `entry` under `query`, replacing any previous entry.
    fn set(&self, query: Q, entry: Arc<CacheEntry<Q, T>>);

    /// Remove the entry for `query`. Returns `true` if one was present.
    fn delete(&self, query: &Q) -> bool;

    /// Remove every entry.
    fn clear(&self);

    /// Return the entry for `query`, storing `entry` first if there is none.
    fn get_or_insert(&self, query: Q, entry: Arc<CacheEntry<Q, T>>) -> Arc<CacheEntry<Q, T>> {
        match self.get(&query) {
            Some(existing) => existing,
            None => {
                self.set(query, entry.clone());
                entry
            }
        }
    }
}

/// Unbounded cache backed by papaya's lock-free `HashMap`.
///
/// This is the default cache of a [`Loader`](crate::Loader).
pub struct MemoryCache<Q, T> {
    entries: HashMap<Q, Arc<CacheEntry<Q, T>>, ahash::RandomState>,
}

impl<Q: QueryKey, T: QueryOutput> Default for MemoryCache<Q, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Q: QueryKey, T: QueryOutput> MemoryCache<Q, T> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the cached queries.
    pub fn keys(&self) -> Vec<Q> {
        self.entries.pin().keys().cloned().collect()
    }
}

impl<Q: QueryKey, T: QueryOutput> Cache<Q, T> for MemoryCache<Q, T> {
    fn get(&self, query: &Q) -> Option<Arc<CacheEntry<Q, T>>> {
        self.entries.pin().get(query).cloned()
    }

    fn set(&self, query: Q, entry: Arc<CacheEntry<Q, T>>) {
        self.entries.pin().insert(query, entry);
    }

    fn delete(&self, query: &Q) -> bool {
        self.entries.pin().remove(query).is_some()
    }

    fn clear(&self) {
        self.entries.pin().clear();
    }

    fn get_or_insert(&self, query: Q, entry: Arc<CacheEntry<Q, T>>) -> Arc<CacheEntry<Q, T>> {
        self.entries.pin().get_or_insert(query, entry).clone()
    }
}

/// Capacity-bounded cache that evicts the least recently used entry.
///
/// Eviction only forgets the memoized entry; deferred results already handed
/// out stay valid, and the next load of an evicted query resolves it again.
pub struct LruCache<Q, T> {
    capacity: NonZeroUsize,
    /// Recency order: least recently used first.
    entries: Mutex<IndexMap<Q, Arc<CacheEntry<Q, T>>, ahash::RandomState>>,
}

impl<Q: QueryKey, T: QueryOutput> LruCache<Q, T> {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(IndexMap::default()),
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cached queries, least recently used first.
    pub fn keys(&self) -> Vec<Q> {
        self.entries.lock().keys().cloned().collect()
    }

    fn evict_overflow(&self, entries: &mut IndexMap<Q, Arc<CacheEntry<Q, T>>, ahash::RandomState>) {
        while entries.len() > self.capacity.get() {
            if let Some((_evicted, _)) = entries.shift_remove_index(0) {
                #[cfg(feature = "tracing")]
                tracing::trace!(query = ?_evicted, "lru cache evicted entry");
            }
        }
    }
}

impl<Q: QueryKey, T: QueryOutput> Cache<Q, T> for LruCache<Q, T> {
    fn get(&self, query: &Q) -> Option<Arc<CacheEntry<Q, T>>> {
        let mut entries = self.entries.lock();
        let index = entries.get_index_of(query)?;
        let last = entries.len() - 1;
        entries.move_index(index, last);
        entries.get_index(last).map(|(_, entry)| entry.clone())
    }

    fn set(&self, query: Q, entry: Arc<CacheEntry<Q, T>>) {
        let mut entries = self.entries.lock();
        entries.shift_remove(&query);
        entries.insert(query, entry);
        self.evict_overflow(&mut entries);
    }

    fn delete(&self, query: &Q) -> bool {
        self.entries.lock().shift_remove(query).is_some()
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn get_or_insert(&self, query: Q, entry: Arc<CacheEntry<Q, T>>) -> Arc<CacheEntry<Q, T>> {
        let mut entries = self.entries.lock();
        if let Some(index) = entries.get_index_of(&query) {
            let last = entries.len() - 1;
            entries.move_index(index, last);
            if let Some((_, existing)) = entries.get_index(last) {
                return existing.clone();
            }
        }
        entries.insert(query, entry.clone());
        self.evict_overflow(&mut entries);
        entry
    }
}
