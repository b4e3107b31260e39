//! Bound aliases for queries and their values.

use std::fmt::Debug;
use std::hash::Hash;

/// A query identifier.
///
/// Queries are opaque to the loader: they are only hashed, compared, cloned
/// into dependency sets and formatted for cycle reports. Implemented for every
/// type with the right bounds, such as `&'static str`, `String` or a custom enum.
pub trait QueryKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> QueryKey for T {}

/// A value produced by a [`Deferred`](crate::Deferred) result.
///
/// Values are cloned out to every consumer, so wrap large values in `Arc`.
pub trait QueryOutput: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> QueryOutput for T {}
