//! Error types for loading and deferred results.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::deferred::Deferred;

/// Errors produced by [`Deferred`] handles and the [`Loader`](crate::Loader).
///
/// Resolution functions can propagate any error with the `?` operator: every
/// `Into<anyhow::Error>` type converts into [`LoadError::UserError`].
#[derive(Debug, Clone)]
pub enum LoadError {
    /// The value was read before the deferred result settled.
    ///
    /// Returned by [`Deferred::value`] while pending, and by
    /// [`Deferred::wait_timeout`] when the timer fires first. The `pending`
    /// handle leads back to the deferred result so the caller can await it.
    NotReady {
        /// The deferred result that was still pending.
        pending: PendingHandle,
    },

    /// A query re-entered its own in-flight resolution chain.
    Cycle {
        /// Debug representation of the query that was requested again.
        query: String,
        /// Debug representations from the first occurrence of `query` to the repeat.
        path: Vec<String>,
    },

    /// The producer panicked while running or being polled.
    Panicked {
        /// Panic payload, if it was a string.
        message: String,
    },

    /// Error raised by user code.
    ///
    /// This is the original error, shared with every consumer of the failed
    /// result. Use [`LoadError::downcast_ref`] to get the concrete type back.
    UserError(Arc<anyhow::Error>),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::NotReady { pending } => {
                write!(f, "deferred result is pending: {}", pending.type_name())
            }
            LoadError::Cycle { query, path } => {
                write!(f, "circular dependency: {} ?> {}", path.join(" -> "), query)
            }
            LoadError::Panicked { message } => write!(f, "producer panicked: {}", message),
            LoadError::UserError(e) => write!(f, "{}", e),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for LoadError {
    fn from(err: T) -> Self {
        LoadError::UserError(Arc::new(err.into()))
    }
}

impl LoadError {
    /// Returns `true` for [`LoadError::NotReady`].
    pub fn is_not_ready(&self) -> bool {
        matches!(self, LoadError::NotReady { .. })
    }

    /// Returns `true` for [`LoadError::Cycle`].
    pub fn is_cycle(&self) -> bool {
        matches!(self, LoadError::Cycle { .. })
    }

    /// The pending handle carried by a [`LoadError::NotReady`].
    pub fn pending(&self) -> Option<&PendingHandle> {
        match self {
            LoadError::NotReady { pending } => Some(pending),
            _ => None,
        }
    }

    /// Returns a reference to the inner user error if this is a `UserError` variant.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            LoadError::UserError(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a `UserError` containing an error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        LoadError::Panicked { message }
    }
}

/// Type-erased back-reference to a pending [`Deferred`].
///
/// Carried by [`LoadError::NotReady`]. Downcast with [`PendingHandle::deferred`].
#[derive(Clone)]
pub struct PendingHandle {
    deferred: Arc<dyn Any + Send + Sync>,
    value_type: TypeId,
    type_name: &'static str,
}

impl PendingHandle {
    pub(crate) fn new<T: Clone + Send + Sync + 'static>(deferred: &Deferred<T>) -> Self {
        Self {
            deferred: Arc::new(deferred.clone()),
            value_type: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Recover the deferred result, if it produces values of type `T`.
    pub fn deferred<T: Clone + Send + Sync + 'static>(&self) -> Option<Deferred<T>> {
        if self.value_type == TypeId::of::<T>() {
            self.deferred.downcast_ref::<Deferred<T>>().cloned()
        } else {
            None
        }
    }

    /// Name of the value type of the pending deferred result.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for PendingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PendingHandle(Deferred<{}>)", self.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Missing;

    impl fmt::Display for Missing {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "missing")
        }
    }

    impl std::error::Error for Missing {}

    #[test]
    fn test_user_error_keeps_original() {
        let err: LoadError = Missing.into();
        assert!(err.is::<Missing>());
        assert_eq!(err.to_string(), "missing");
        assert!(!err.is::<std::io::Error>());
    }

    #[test]
    fn test_cycle_display() {
        let err = LoadError::Cycle {
            query: "\"a\"".to_string(),
            path: vec!["\"a\"".to_string(), "\"b\"".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "circular dependency: \"a\" -> \"b\" ?> \"a\""
        );
        assert!(err.is_cycle());
    }

    #[test]
    fn test_panic_payloads() {
        let err = LoadError::from_panic(Box::new("boom"));
        assert!(matches!(err, LoadError::Panicked { ref message } if message == "boom"));

        let err = LoadError::from_panic(Box::new(String::from("owned")));
        assert!(matches!(err, LoadError::Panicked { ref message } if message == "owned"));

        let err = LoadError::from_panic(Box::new(7u8));
        assert!(matches!(err, LoadError::Panicked { .. }));
    }

    #[test]
    fn test_pending_handle_downcast() {
        let (deferred, _settler) = Deferred::<u32>::pending();
        let handle = PendingHandle::new(&deferred);
        assert!(handle.deferred::<String>().is_none());
        let back = handle.deferred::<u32>().unwrap();
        assert!(back.ptr_eq(&deferred));
        assert!(handle.type_name().contains("u32"));
    }
}
