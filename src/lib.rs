//! Query-Loader: a memoizing dependency resolver with a sync-or-async result type.
//!
//! A [`Loader`] maps queries to values through a user supplied resolution
//! function, memoizes every result, records which queries each resolution
//! loaded, and reports circular dependencies as errors instead of recursing
//! forever. Results are [`Deferred`] handles that settle synchronously when the
//! resolution is synchronous and can be awaited otherwise, so the same loader
//! serves both worlds.
//!
//! # Key Features
//!
//! - **Sync or async**: Resolution functions return a value, an error, another
//!   query's result (an alias) or a future
//! - **Memoization**: Each query resolves at most once while cached
//! - **Cycle detection**: Circular loads fail with [`LoadError::Cycle`], also across await points
//! - **Dependency tracking**: [`Loader::get_dependencies`] reports direct or transitive dependencies
//! - **Pluggable cache**: [`MemoryCache`] by default, [`LruCache`] or any [`Cache`] implementation
//! - **Observability**: Loader events go to a [`Tracer`]
//!
//! # Example
//!
//! ```ignore
//! use query_loader::{Loader, Resolution};
//!
//! let loader = Loader::<&'static str, String>::from_fn(|query, ctx| match *query {
//!     "child" => Resolution::value("Peter".into()),
//!     "father" => Resolution::value("John".into()),
//!     "mother" => Resolution::value("Mary".into()),
//!     "parents" => Resolution::compute(|| {
//!         Ok(format!("{} and {}", ctx.load("father").value()?, ctx.load("mother").value()?))
//!     }),
//!     "family" => Resolution::compute(|| {
//!         Ok(format!("{}, child of {}", ctx.load("child").value()?, ctx.load("parents").value()?))
//!     }),
//!     _ => Resolution::value("bad query".into()),
//! });
//!
//! assert_eq!(loader.load("family").value().unwrap(), "Peter, child of John and Mary");
//! assert_eq!(loader.get_dependencies("family", false).value().unwrap(), ["child", "parents"]);
//! ```
//!
//! A synchronous caller reading a result that is still in flight gets
//! [`LoadError::NotReady`], which carries the pending handle to await.

mod cache;
mod deferred;
mod error;
mod loader;
mod query;
pub mod tracer;

pub use cache::{Cache, CacheEntry, LruCache, MemoryCache};
pub use deferred::{Deferred, Outcome, Resolution, Settler, Status, Wait};
pub use error::{LoadError, PendingHandle};
pub use loader::{LoadContext, Loader, LoaderBuilder, Source};
pub use query::{QueryKey, QueryOutput};
pub use tracer::{EvictionReason, LoadOutcome, NoopTracer, SpanId, Tracer};

#[cfg(feature = "tracing")]
pub use tracer::LogTracer;
