//! Tracer trait for observing loader execution.
//!
//! The default [`NoopTracer`] discards everything. With the `tracing` feature,
//! [`LogTracer`] forwards every event to the `tracing` crate.
//!
//! # Example
//!
//! ```ignore
//! use query_loader::{Loader, LoadOutcome, SpanId, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn new_span_id(&self) -> SpanId {
//!         SpanId(0)
//!     }
//!
//!     fn on_load_end(&self, _span_id: SpanId, query: &dyn std::fmt::Debug, outcome: LoadOutcome) {
//!         println!("{:?}: {:?}", query, outcome);
//!     }
//! }
//!
//! let loader = Loader::builder(source).tracer(PrintTracer).build();
//! ```

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::deferred::Status;

/// Unique identifier for one `load` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(pub u64);

/// How a `load` call was answered, as seen when it returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Returned the memoized result without resolving.
    CacheHit,
    /// Resolved and completed synchronously.
    Completed,
    /// Resolved and failed synchronously.
    Failed { message: String },
    /// Resolution is still in flight.
    Pending,
    /// Rejected because the query is already being resolved up the chain.
    CycleDetected,
}

/// Why a cache entry was dropped by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// The resolution called `no_cache`.
    NoCache,
    /// [`Loader::invalidate`](crate::Loader::invalidate) was called.
    Invalidated,
}

/// Tracer trait for observing loader execution.
///
/// All methods except [`new_span_id`](Tracer::new_span_id) have empty default
/// implementations. Implementations must be `Send + Sync`: deferred results
/// may settle on any thread.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new unique span ID. Called at the start of each `load`.
    fn new_span_id(&self) -> SpanId;

    /// Called when a `load` call starts.
    #[inline]
    fn on_load_start(&self, _span_id: SpanId, _query: &dyn Debug) {}

    /// Called after the cache lookup of a `load` call.
    #[inline]
    fn on_cache_check(&self, _span_id: SpanId, _query: &dyn Debug, _hit: bool) {}

    /// Called when a `load` call returns.
    #[inline]
    fn on_load_end(&self, _span_id: SpanId, _query: &dyn Debug, _outcome: LoadOutcome) {}

    /// Called when a resolved query settles, possibly long after `on_load_end`.
    #[inline]
    fn on_settled(&self, _span_id: SpanId, _query: &dyn Debug, _status: Status) {}

    /// Called when a resolution loads another query.
    #[inline]
    fn on_dependency_registered(
        &self,
        _span_id: SpanId,
        _parent: &dyn Debug,
        _dependency: &dyn Debug,
    ) {
    }

    /// Called when a circular dependency is detected.
    ///
    /// `path` runs from the first occurrence of the query to the repeat.
    #[inline]
    fn on_cycle_detected(&self, _path: &[String]) {}

    /// Called when the loader drops a cache entry.
    #[inline]
    fn on_evicted(&self, _query: &dyn Debug, _reason: EvictionReason) {}

    /// Called when the whole cache is cleared through the loader.
    #[inline]
    fn on_cache_cleared(&self) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`Loader`](crate::Loader).
pub struct NoopTracer;

/// Global span counter shared by the built-in tracers.
static SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_span_id() -> SpanId {
    SpanId(SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
}

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        next_span_id()
    }
}

/// Tracer that logs every event through the `tracing` crate.
#[cfg(feature = "tracing")]
pub struct LogTracer;

#[cfg(feature = "tracing")]
impl Tracer for LogTracer {
    fn new_span_id(&self) -> SpanId {
        next_span_id()
    }

    fn on_load_start(&self, span_id: SpanId, query: &dyn Debug) {
        tracing::trace!(span = span_id.0, ?query, "load start");
    }

    fn on_cache_check(&self, span_id: SpanId, query: &dyn Debug, hit: bool) {
        tracing::trace!(span = span_id.0, ?query, hit, "cache check");
    }

    fn on_load_end(&self, span_id: SpanId, query: &dyn Debug, outcome: LoadOutcome) {
        tracing::debug!(span = span_id.0, ?query, ?outcome, "load end");
    }

    fn on_settled(&self, span_id: SpanId, query: &dyn Debug, status: Status) {
        tracing::debug!(span = span_id.0, ?query, ?status, "settled");
    }

    fn on_dependency_registered(&self, span_id: SpanId, parent: &dyn Debug, dependency: &dyn Debug) {
        tracing::trace!(span = span_id.0, ?parent, ?dependency, "dependency registered");
    }

    fn on_cycle_detected(&self, path: &[String]) {
        tracing::warn!(path = %path.join(" -> "), "circular dependency");
    }

    fn on_evicted(&self, query: &dyn Debug, reason: EvictionReason) {
        tracing::debug!(?query, ?reason, "cache entry evicted");
    }

    fn on_cache_cleared(&self) {
        tracing::debug!("cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingTracer {
        start_count: AtomicUsize,
        end_count: AtomicUsize,
    }

    impl Tracer for CountingTracer {
        fn new_span_id(&self) -> SpanId {
            SpanId(1)
        }

        fn on_load_start(&self, _span_id: SpanId, _query: &dyn Debug) {
            self.start_count.fetch_add(1, Ordering::Relaxed);
        }

        fn on_load_end(&self, _span_id: SpanId, _query: &dyn Debug, _outcome: LoadOutcome) {
            self.end_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_noop_tracer_span_id() {
        let tracer = NoopTracer;
        let id1 = tracer.new_span_id();
        let id2 = tracer.new_span_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_counting_tracer() {
        let tracer = CountingTracer {
            start_count: AtomicUsize::new(0),
            end_count: AtomicUsize::new(0),
        };

        tracer.on_load_start(SpanId(1), &"a");
        tracer.on_load_start(SpanId(2), &"a");
        tracer.on_load_end(SpanId(1), &"a", LoadOutcome::CacheHit);

        assert_eq!(tracer.start_count.load(Ordering::Relaxed), 2);
        assert_eq!(tracer.end_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_tracer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopTracer>();
        assert_send_sync::<Arc<CountingTracer>>();
    }
}
