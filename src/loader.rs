//! The memoizing loader and the context handed to resolution functions.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use indexmap::IndexSet;

use crate::cache::{Cache, CacheEntry, MemoryCache};
use crate::deferred::{Deferred, Resolution};
use crate::error::LoadError;
use crate::query::{QueryKey, QueryOutput};
use crate::tracer::{EvictionReason, LoadOutcome, NoopTracer, SpanId, Tracer};

/// Queries currently being resolved along one load chain, outermost first.
type Stack<Q> = IndexSet<Q, ahash::RandomState>;

/// Resolution function of a [`Loader`].
///
/// Maps a query to a [`Resolution`]: a plain value or error, another query's
/// deferred result (an alias), or a future. Dependencies are loaded through
/// `ctx`, which records them and detects cycles.
///
/// Implemented for every `Fn(&Q, &LoadContext<Q, T>) -> Resolution<T>`.
pub trait Source<Q, T>: Send + Sync + 'static {
    /// Resolve `query`.
    fn resolve(&self, query: &Q, ctx: &LoadContext<Q, T>) -> Resolution<T>;
}

impl<Q, T, F> Source<Q, T> for F
where
    F: Fn(&Q, &LoadContext<Q, T>) -> Resolution<T> + Send + Sync + 'static,
{
    fn resolve(&self, query: &Q, ctx: &LoadContext<Q, T>) -> Resolution<T> {
        self(query, ctx)
    }
}

struct LoaderInner<Q, T> {
    source: Box<dyn Source<Q, T>>,
    cache: Arc<dyn Cache<Q, T>>,
    tracer: Arc<dyn Tracer>,
}

/// Memoizing dependency resolver.
///
/// Works with synchronous and asynchronous resolution functions alike and
/// reports circular dependencies as [`LoadError::Cycle`] instead of recursing
/// forever. Cheap to clone; clones share the cache.
///
/// # Example in sync
///
/// ```ignore
/// let loader = Loader::<&'static str, String>::from_fn(|query, ctx| match *query {
///     "father" => Resolution::value("John".into()),
///     "mother" => Resolution::value("Mary".into()),
///     // alias: forward the other query's deferred result
///     "mom" => ctx.load("mother").into(),
///     "parents" => Resolution::compute(|| {
///         Ok(format!("{} and {}", ctx.load("father").value()?, ctx.load("mother").value()?))
///     }),
///     _ => Resolution::value("bad query".into()),
/// });
///
/// assert_eq!(loader.load("parents").value().unwrap(), "John and Mary");
/// ```
///
/// # Example in async
///
/// ```ignore
/// let loader = Loader::<&'static str, String>::from_fn(|query, ctx| {
///     let ctx = ctx.clone();
///     match *query {
///         "father" => Resolution::value("John".into()),
///         "mother" => Resolution::value("Mary".into()),
///         "parents" => Resolution::future(async move {
///             Ok(format!("{} and {}", ctx.load("father").await?, ctx.load("mother").await?))
///         }),
///         _ => Resolution::value("bad query".into()),
///     }
/// });
///
/// assert_eq!(loader.load("parents").await.unwrap(), "John and Mary");
/// ```
pub struct Loader<Q, T> {
    inner: Arc<LoaderInner<Q, T>>,
}

impl<Q, T> Clone for Loader<Q, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Q, T> fmt::Debug for Loader<Q, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader").finish_non_exhaustive()
    }
}

enum Lookup<Q, T> {
    Entry(Arc<CacheEntry<Q, T>>),
    Rejected(Deferred<T>),
}

impl<Q: QueryKey, T: QueryOutput> Loader<Q, T> {
    /// Create a loader with the default [`MemoryCache`] and no tracing.
    pub fn new(source: impl Source<Q, T>) -> Self {
        Self::builder(source).build()
    }

    /// Create a loader from a resolution closure.
    pub fn from_fn<F>(resolve: F) -> Self
    where
        F: Fn(&Q, &LoadContext<Q, T>) -> Resolution<T> + Send + Sync + 'static,
    {
        Self::new(resolve)
    }

    /// Create a builder for customizing the cache and tracer.
    ///
    /// ```ignore
    /// let loader = Loader::builder(source)
    ///     .cache(LruCache::new(NonZeroUsize::new(256).unwrap()))
    ///     .tracer(LogTracer)
    ///     .build();
    /// ```
    pub fn builder(source: impl Source<Q, T>) -> LoaderBuilder<Q, T> {
        LoaderBuilder::new(source)
    }

    /// Load `query`, resolving it on first use.
    ///
    /// Returns the memoized deferred result on later calls without running
    /// the resolution function again.
    pub fn load(&self, query: Q) -> Deferred<T> {
        self.load_in(query, &Stack::default())
    }

    /// Direct dependencies of `query`, or all transitive ones when `deep`.
    ///
    /// Loads `query` completely first, so the recorded set is final. Only
    /// dependencies recorded by the resolution that created the cache entry
    /// are reported; an alias that returned early records just its target.
    /// Deep results are unique, in breadth-first discovery order.
    pub fn get_dependencies(&self, query: Q, deep: bool) -> Deferred<Vec<Q>> {
        let direct = self.direct_dependencies(query.clone());
        if !deep {
            return direct;
        }

        let loader = self.clone();
        Deferred::from_future(async move {
            let mut seen = Stack::default();
            let mut queue: VecDeque<Q> = direct.await?.into();
            while let Some(dependency) = queue.pop_front() {
                if dependency == query || !seen.insert(dependency.clone()) {
                    continue;
                }
                queue.extend(loader.direct_dependencies(dependency).await?);
            }
            Ok(seen.into_iter().collect())
        })
    }

    /// The cache backing this loader.
    pub fn cache(&self) -> &dyn Cache<Q, T> {
        self.inner.cache.as_ref()
    }

    /// The cache entry for `query`, if any.
    pub fn entry(&self, query: &Q) -> Option<Arc<CacheEntry<Q, T>>> {
        self.inner.cache.get(query)
    }

    /// Forget the memoized result of `query`.
    ///
    /// In-flight resolutions are not cancelled; deferred results already
    /// handed out keep their outcome.
    pub fn invalidate(&self, query: &Q) -> bool {
        let removed = self.inner.cache.delete(query);
        if removed {
            self.inner
                .tracer
                .on_evicted(query, EvictionReason::Invalidated);
        }
        removed
    }

    /// Forget every memoized result. In-flight resolutions keep running.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        self.inner.tracer.on_cache_cleared();
    }

    fn load_in(&self, query: Q, stack: &Stack<Q>) -> Deferred<T> {
        match self.lookup(query, stack) {
            Lookup::Entry(entry) => entry.result().clone(),
            Lookup::Rejected(deferred) => deferred,
        }
    }

    fn direct_dependencies(&self, query: Q) -> Deferred<Vec<Q>> {
        match self.lookup(query, &Stack::default()) {
            Lookup::Entry(entry) => {
                let recorded = entry.clone();
                entry
                    .result()
                    .map(move |_| recorded.dependencies())
            }
            Lookup::Rejected(deferred) => deferred.map(|_| Vec::new()),
        }
    }

    fn lookup(&self, query: Q, stack: &Stack<Q>) -> Lookup<Q, T> {
        let tracer = &self.inner.tracer;
        let span_id = tracer.new_span_id();
        tracer.on_load_start(span_id, &query);

        if let Some(first) = stack.get_index_of(&query) {
            let path = stack.iter().skip(first).collect::<Vec<_>>();
            return Lookup::Rejected(self.reject_cycle(span_id, &query, &path));
        }

        if let Some(entry) = self.inner.cache.get(&query) {
            if entry.is_resolving_here() {
                // Reached from inside its own resolution function without going
                // through the context.
                return Lookup::Rejected(self.reject_cycle(span_id, &query, &[&query]));
            }
            tracer.on_cache_check(span_id, &query, true);
            tracer.on_load_end(span_id, &query, LoadOutcome::CacheHit);
            return Lookup::Entry(entry);
        }

        let fresh = Arc::new(CacheEntry::new(query.clone()));
        let entry = self.inner.cache.get_or_insert(query.clone(), fresh.clone());
        if !Arc::ptr_eq(&entry, &fresh) {
            // another thread got there first
            tracer.on_cache_check(span_id, &query, true);
            tracer.on_load_end(span_id, &query, LoadOutcome::CacheHit);
            return Lookup::Entry(entry);
        }
        tracer.on_cache_check(span_id, &query, false);
        self.watch_settlement(span_id, &entry);

        let mut stack = stack.clone();
        stack.insert(query.clone());
        let ctx = LoadContext {
            loader: self.clone(),
            entry: entry.clone(),
            stack: Arc::new(stack),
            span_id,
        };

        {
            let _resolving = entry.begin_resolving();
            let resolution = panic::catch_unwind(AssertUnwindSafe(|| {
                self.inner.source.resolve(&query, &ctx)
            }))
            .unwrap_or_else(|payload| Resolution::Ready(Err(LoadError::from_panic(payload))));
            entry.result().fulfill(resolution);
        }

        let outcome = match entry.result().outcome() {
            None => LoadOutcome::Pending,
            Some(Ok(_)) => LoadOutcome::Completed,
            Some(Err(e)) => LoadOutcome::Failed {
                message: e.to_string(),
            },
        };
        tracer.on_load_end(span_id, &query, outcome);

        Lookup::Entry(entry)
    }

    /// Report settlement and carry out a requested `no_cache` eviction.
    ///
    /// The eviction runs only once the result settles, never while the
    /// resolution is still on the stack.
    fn watch_settlement(&self, span_id: SpanId, entry: &Arc<CacheEntry<Q, T>>) {
        let loader: Weak<LoaderInner<Q, T>> = Arc::downgrade(&self.inner);
        let watched = Arc::downgrade(entry);
        entry.result().on_settle(move |_| {
            let (Some(inner), Some(entry)) = (loader.upgrade(), watched.upgrade()) else {
                return;
            };
            inner
                .tracer
                .on_settled(span_id, entry.query(), entry.result().status());

            if !entry.is_no_cache() {
                return;
            }
            let query = entry.query();
            let current = inner.cache.get(query);
            if current.is_some_and(|current| Arc::ptr_eq(&current, &entry)) {
                inner.cache.delete(query);
                inner.tracer.on_evicted(query, EvictionReason::NoCache);
                #[cfg(feature = "tracing")]
                tracing::debug!(?query, "no_cache entry evicted");
            }
        });
    }

    fn reject_cycle(&self, span_id: SpanId, query: &Q, path: &[&Q]) -> Deferred<T> {
        let path: Vec<String> = path.iter().map(|q| format!("{:?}", q)).collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(?query, path = %path.join(" -> "), "circular dependency detected");

        self.inner.tracer.on_cycle_detected(&path);
        self.inner
            .tracer
            .on_load_end(span_id, query, LoadOutcome::CycleDetected);

        Deferred::failed(LoadError::Cycle {
            query: format!("{:?}", query),
            path,
        })
    }
}

/// Context handed to a resolution function.
///
/// Cheap to clone and `'static`, so asynchronous resolutions can move a clone
/// into their future and keep loading dependencies after awaiting.
pub struct LoadContext<Q, T> {
    loader: Loader<Q, T>,
    entry: Arc<CacheEntry<Q, T>>,
    stack: Arc<Stack<Q>>,
    span_id: SpanId,
}

impl<Q, T> Clone for LoadContext<Q, T> {
    fn clone(&self) -> Self {
        Self {
            loader: self.loader.clone(),
            entry: self.entry.clone(),
            stack: self.stack.clone(),
            span_id: self.span_id,
        }
    }
}

impl<Q: QueryKey, T: QueryOutput> LoadContext<Q, T> {
    /// The query being resolved.
    pub fn query(&self) -> &Q {
        self.entry.query()
    }

    /// Load a dependency of the query being resolved.
    ///
    /// The dependency is recorded on the cache entry (first-loaded order, no
    /// duplicates). Loading a query that is already being resolved further up
    /// this chain, including the current query itself, fails with
    /// [`LoadError::Cycle`].
    pub fn load(&self, query: Q) -> Deferred<T> {
        if query != *self.entry.query() {
            self.loader.inner.tracer.on_dependency_registered(
                self.span_id,
                self.entry.query(),
                &query,
            );
            self.entry.record_dependency(query.clone());
        }
        self.loader.load_in(query, &self.stack)
    }

    /// Keep the result of this resolution out of the cache.
    ///
    /// The entry is dropped once the result settles; callers that already
    /// hold the deferred result still see the outcome. Returns `value`
    /// unchanged so it can wrap the return value.
    pub fn no_cache<V>(&self, value: V) -> V {
        self.entry.mark_no_cache();
        value
    }

    /// Queries being resolved along this chain, outermost first, ending with
    /// the current query.
    pub fn stack(&self) -> impl Iterator<Item = &Q> {
        self.stack.iter()
    }

    /// The loader running this resolution.
    pub fn loader(&self) -> &Loader<Q, T> {
        &self.loader
    }
}

impl<Q: fmt::Debug, T> fmt::Debug for LoadContext<Q, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadContext")
            .field("stack", &*self.stack)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Loader`].
pub struct LoaderBuilder<Q, T> {
    source: Box<dyn Source<Q, T>>,
    cache: Option<Arc<dyn Cache<Q, T>>>,
    tracer: Arc<dyn Tracer>,
}

impl<Q: QueryKey, T: QueryOutput> LoaderBuilder<Q, T> {
    /// Create a builder with default settings.
    pub fn new(source: impl Source<Q, T>) -> Self {
        Self {
            source: Box::new(source),
            cache: None,
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Use `cache` instead of a fresh [`MemoryCache`].
    pub fn cache(mut self, cache: impl Cache<Q, T>) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// Use a cache that is also reachable from elsewhere.
    pub fn shared_cache(mut self, cache: Arc<dyn Cache<Q, T>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Report loader events to `tracer`.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Build the loader.
    pub fn build(self) -> Loader<Q, T> {
        let cache: Arc<dyn Cache<Q, T>> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(MemoryCache::<Q, T>::new()),
        };
        Loader {
            inner: Arc::new(LoaderInner {
                source: self.source,
                cache,
                tracer: self.tracer,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Status;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_loader(calls: Arc<AtomicUsize>) -> Loader<&'static str, u32> {
        Loader::<&'static str, u32>::from_fn(move |query, ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            match *query {
                "one" => Resolution::value(1),
                "two" => Resolution::compute(|| Ok(ctx.load("one").value()? * 2)),
                "self" => ctx.load("self").into(),
                "escape" => ctx.loader().load("escape").into(),
                _ => Resolution::error(anyhow::anyhow!("unknown query {}", query)),
            }
        })
    }

    #[test]
    fn test_cache_hit_skips_resolution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone());

        let first = loader.load("two");
        let second = loader.load("two");
        assert_eq!(first.value().unwrap(), 2);
        assert!(first.ptr_eq(&second));
        assert_eq!(calls.load(Ordering::SeqCst), 2); // "two" and "one"
    }

    #[test]
    fn test_self_load_is_cycle() {
        let loader = counting_loader(Arc::new(AtomicUsize::new(0)));
        let result = loader.load("self");
        assert_eq!(result.status(), Status::Failed);
        match result.value() {
            Err(LoadError::Cycle { query, path }) => {
                assert_eq!(query, "\"self\"");
                assert_eq!(path, vec!["\"self\"".to_string()]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
        // a self-load is not a dependency
        assert!(loader.entry(&"self").unwrap().dependencies().is_empty());
    }

    #[test]
    fn test_reentry_outside_context_is_cycle() {
        let loader = counting_loader(Arc::new(AtomicUsize::new(0)));
        assert!(loader.load("escape").value().unwrap_err().is_cycle());
    }

    #[test]
    fn test_context_stack() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = seen.clone();
        let loader = Loader::<&'static str, u32>::from_fn(move |query, ctx| {
            record
                .lock()
                .push(ctx.stack().copied().collect::<Vec<_>>());
            match *query {
                "outer" => ctx.load("inner").into(),
                _ => Resolution::value(0),
            }
        });

        loader.load("outer").value().unwrap();
        assert_eq!(
            *seen.lock(),
            vec![vec!["outer"], vec!["outer", "inner"]]
        );
    }

    #[test]
    fn test_panicking_resolution_fails() {
        let loader = Loader::<&'static str, u32>::from_fn(|_, _| panic!("resolver exploded"));
        let result = loader.load("any");
        assert!(matches!(
            result.value(),
            Err(LoadError::Panicked { ref message }) if message == "resolver exploded"
        ));
        assert!(!loader.entry(&"any").unwrap().result().is_loading());
    }

    #[test]
    fn test_invalidate_forces_new_resolution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(calls.clone());

        loader.load("one").value().unwrap();
        assert!(loader.invalidate(&"one"));
        assert!(!loader.invalidate(&"one"));
        loader.load("one").value().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_loader_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Loader<String, String>>();
        assert_send_sync::<LoadContext<String, String>>();
    }
}
