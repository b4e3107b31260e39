//! Deferred results that may settle synchronously or asynchronously.
//!
//! A [`Deferred`] is a shared handle whose state can be inspected at any time
//! without awaiting: [`Status::Pending`], [`Status::Completed`] or
//! [`Status::Failed`]. Synchronous producers settle the handle before the
//! constructor returns. Asynchronous producers are polled once eagerly, so a
//! future that never actually suspends settles immediately as well. Otherwise
//! the future is parked inside the handle: inside a Tokio runtime a background
//! task drives it to completion, and anyone awaiting a clone drives it too.
//!
//! # Example
//!
//! ```ignore
//! use query_loader::{Deferred, Status};
//!
//! let ready = Deferred::completed(42);
//! assert_eq!(ready.status(), Status::Completed);
//! assert_eq!(ready.value().unwrap(), 42);
//!
//! let later = Deferred::from_future(async {
//!     tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//!     Ok(7)
//! });
//! assert!(later.value().unwrap_err().is_not_ready());
//! assert_eq!(later.await.unwrap(), 7);
//! ```

use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::task::noop_waker_ref;
use parking_lot::Mutex;

use crate::error::{LoadError, PendingHandle};
use crate::query::QueryOutput;

/// Settled outcome of a deferred result.
pub type Outcome<T> = Result<T, LoadError>;

type Driver<T> = Shared<BoxFuture<'static, Outcome<T>>>;
type SettleCallback<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

/// Observable state of a [`Deferred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Completed,
    /// Settled with an error.
    Failed,
}

/// What a producer hands back: a settled outcome, another deferred result to
/// forward, or a future.
pub enum Resolution<T> {
    /// Already known outcome.
    Ready(Outcome<T>),
    /// Forward another deferred result as-is.
    Alias(Deferred<T>),
    /// Outcome of a future.
    Async(BoxFuture<'static, Outcome<T>>),
}

impl<T: QueryOutput> Resolution<T> {
    /// A plain value.
    pub fn value(value: T) -> Self {
        Resolution::Ready(Ok(value))
    }

    /// A synchronous failure.
    pub fn error(error: impl Into<LoadError>) -> Self {
        Resolution::Ready(Err(error.into()))
    }

    /// Run `f` now and use its result.
    ///
    /// Handy for synchronous resolution code that wants to use `?`.
    pub fn compute<F>(f: F) -> Self
    where
        F: FnOnce() -> Outcome<T>,
    {
        Resolution::Ready(f())
    }

    /// The outcome of a future.
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        Resolution::Async(future.boxed())
    }
}

impl<T> From<Outcome<T>> for Resolution<T> {
    fn from(outcome: Outcome<T>) -> Self {
        Resolution::Ready(outcome)
    }
}

impl<T> From<Deferred<T>> for Resolution<T> {
    fn from(deferred: Deferred<T>) -> Self {
        Resolution::Alias(deferred)
    }
}

impl<T> fmt::Debug for Resolution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Ready(Ok(_)) => write!(f, "Resolution::Ready(Ok(..))"),
            Resolution::Ready(Err(e)) => write!(f, "Resolution::Ready(Err({:?}))", e),
            Resolution::Alias(d) => write!(f, "Resolution::Alias({:?})", d),
            Resolution::Async(_) => write!(f, "Resolution::Async(..)"),
        }
    }
}

struct PendingState<T> {
    /// Parked future, if the producer was asynchronous.
    driver: Option<Driver<T>>,
    /// Waiters on a deferred result without a driver.
    wakers: Vec<Waker>,
    callbacks: Vec<SettleCallback<T>>,
}

enum State<T> {
    Pending(PendingState<T>),
    Settled(Outcome<T>),
}

enum Registration<T> {
    Settled(Outcome<T>),
    Driver(Driver<T>),
    Waiting,
}

/// A result that may or may not be known yet.
///
/// Cheap to clone: clones share the same state. Settlement happens exactly
/// once; later attempts are ignored.
pub struct Deferred<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("status", &self.status())
            .finish()
    }
}

impl<T> Deferred<T> {
    /// Current state.
    pub fn status(&self) -> Status {
        match &*self.state.lock() {
            State::Pending(_) => Status::Pending,
            State::Settled(Ok(_)) => Status::Completed,
            State::Settled(Err(_)) => Status::Failed,
        }
    }

    /// Equivalent to `status() == Status::Pending`.
    pub fn is_loading(&self) -> bool {
        self.status() == Status::Pending
    }

    /// Returns `true` if both handles share the same state.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub(crate) fn new_pending() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending(PendingState {
                driver: None,
                wakers: Vec::new(),
                callbacks: Vec::new(),
            }))),
        }
    }
}

impl<T: QueryOutput> Deferred<T> {
    /// Create a deferred result from a producer's resolution.
    ///
    /// Ready outcomes and already-settled aliases settle the handle before
    /// this returns. Futures are polled once right away.
    pub fn of(resolution: impl Into<Resolution<T>>) -> Self {
        let deferred = Self::new_pending();
        deferred.fulfill(resolution.into());
        deferred
    }

    /// Run `producer` now and wrap what it returns.
    ///
    /// A panic inside `producer` does not escape: it becomes a
    /// [`LoadError::Panicked`] failure.
    pub fn from_fn<F, R>(producer: F) -> Self
    where
        F: FnOnce() -> R,
        R: Into<Resolution<T>>,
    {
        match panic::catch_unwind(AssertUnwindSafe(producer)) {
            Ok(resolution) => Self::of(resolution),
            Err(payload) => Self::failed(LoadError::from_panic(payload)),
        }
    }

    /// Wrap a future.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        Self::of(Resolution::future(future))
    }

    /// An already completed result.
    pub fn completed(value: T) -> Self {
        Self::of(Resolution::value(value))
    }

    /// An already failed result.
    pub fn failed(error: impl Into<LoadError>) -> Self {
        Self::of(Resolution::error(error))
    }

    /// A pending result settled through the returned [`Settler`].
    ///
    /// ```ignore
    /// let (deferred, settler) = Deferred::pending();
    /// assert!(deferred.is_loading());
    /// settler.resolve(100);
    /// assert_eq!(deferred.value().unwrap(), 100);
    /// ```
    pub fn pending() -> (Self, Settler<T>) {
        let deferred = Self::new_pending();
        let settler = Settler {
            deferred: deferred.clone(),
        };
        (deferred, settler)
    }

    /// The outcome, if settled.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.state.lock() {
            State::Pending(_) => None,
            State::Settled(outcome) => Some(outcome.clone()),
        }
    }

    /// The value, if completed.
    pub fn result(&self) -> Option<T> {
        self.outcome().and_then(Result::ok)
    }

    /// The error, if failed.
    pub fn reason(&self) -> Option<LoadError> {
        self.outcome().and_then(Result::err)
    }

    /// Returns `true` if this failed with a user error of type `E`.
    pub fn failed_with<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.reason().is_some_and(|e| e.is::<E>())
    }

    /// Run `f` on the user error of type `E`, if this failed with one.
    ///
    /// ```ignore
    /// let kind = loader.load("config").with_reason(|e: &std::io::Error| e.kind());
    /// ```
    pub fn with_reason<E, R, F>(&self, f: F) -> Option<R>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce(&E) -> R,
    {
        let reason = self.reason()?;
        reason.downcast_ref::<E>().map(f)
    }

    /// Fail-fast access to the value.
    ///
    /// - completed: the value
    /// - failed: the original error
    /// - pending: [`LoadError::NotReady`] pointing back at this handle
    pub fn value(&self) -> Outcome<T> {
        match self.outcome() {
            Some(outcome) => outcome,
            None => Err(LoadError::NotReady {
                pending: PendingHandle::new(self),
            }),
        }
    }

    /// Wait for settlement.
    pub fn wait(&self) -> Wait<T> {
        Wait {
            deferred: self.clone(),
            driver: None,
        }
    }

    /// Wait for settlement, giving up after `timeout`.
    ///
    /// On expiry this fails with [`LoadError::NotReady`] rather than a timeout
    /// error; the underlying work is not cancelled and can be awaited again.
    /// A zero duration waits without limit.
    ///
    /// # Panics
    ///
    /// Panics if the result is still pending, `timeout` is not zero and the
    /// call is not running inside a Tokio runtime with the time driver enabled.
    pub async fn wait_timeout(&self, timeout: Duration) -> Outcome<T> {
        if let Some(outcome) = self.outcome() {
            return outcome;
        }
        if timeout.is_zero() {
            return self.wait().await;
        }
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(LoadError::NotReady {
                pending: PendingHandle::new(self),
            }),
        }
    }

    /// Chain a continuation on the outcome.
    ///
    /// Runs synchronously when this handle is already settled, so the returned
    /// handle is settled too whenever `f` resolves synchronously.
    pub fn then<U, F>(&self, f: F) -> Deferred<U>
    where
        U: QueryOutput,
        F: FnOnce(Outcome<T>) -> Resolution<U> + Send + 'static,
    {
        let this = self.clone();
        Deferred::from_future(async move {
            let outcome = this.await;
            Deferred::of(f(outcome)).await
        })
    }

    /// Transform the value, keeping failures.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: QueryOutput,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then(|outcome| Resolution::Ready(outcome.map(f)))
    }

    /// Run `callback` once this handle settles.
    ///
    /// Runs immediately if already settled.
    pub fn on_settle<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(pending) => {
                    pending.callbacks.push(Box::new(callback));
                    return;
                }
                State::Settled(outcome) => outcome.clone(),
            }
        };
        callback(&outcome);
    }

    pub(crate) fn fulfill(&self, resolution: Resolution<T>) {
        match resolution {
            Resolution::Ready(outcome) => {
                self.settle(outcome);
            }
            Resolution::Alias(other) => match other.outcome() {
                Some(outcome) => {
                    self.settle(outcome);
                }
                None => {
                    // settle with the target whoever drives it; awaiting the
                    // alias still drives the target through `wait`
                    let alias = self.clone();
                    other.on_settle(move |outcome| {
                        alias.settle(outcome.clone());
                    });
                    self.drive(other.wait().boxed());
                }
            },
            Resolution::Async(future) => self.drive(future),
        }
    }

    fn drive(&self, future: BoxFuture<'static, Outcome<T>>) {
        let mut future = AssertUnwindSafe(future)
            .catch_unwind()
            .map(|caught| caught.unwrap_or_else(|payload| Err(LoadError::from_panic(payload))))
            .boxed();

        let mut cx = Context::from_waker(noop_waker_ref());
        if let Poll::Ready(outcome) = future.poll_unpin(&mut cx) {
            self.settle(outcome);
            return;
        }

        let driver = future.shared();
        let wakers = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(pending) => {
                    pending.driver = Some(driver.clone());
                    std::mem::take(&mut pending.wakers)
                }
                State::Settled(_) => return,
            }
        };
        for waker in wakers {
            waker.wake();
        }

        // Outside a runtime the driver only runs when awaited.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let this = self.clone();
            runtime.spawn(async move {
                let outcome = driver.await;
                this.settle(outcome);
            });
        }
    }

    /// Settle with `outcome` unless already settled. Returns the winning outcome.
    pub(crate) fn settle(&self, outcome: Outcome<T>) -> Outcome<T> {
        let pending = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Settled(outcome.clone())) {
                State::Pending(pending) => pending,
                State::Settled(existing) => {
                    *state = State::Settled(existing.clone());
                    return existing;
                }
            }
        };

        for waker in pending.wakers {
            waker.wake();
        }
        for callback in pending.callbacks {
            callback(&outcome);
        }
        outcome
    }

    fn register(&self, waker: &Waker) -> Registration<T> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Settled(outcome) => Registration::Settled(outcome.clone()),
            State::Pending(pending) => match &pending.driver {
                Some(driver) => Registration::Driver(driver.clone()),
                None => {
                    if !pending.wakers.iter().any(|w| w.will_wake(waker)) {
                        pending.wakers.push(waker.clone());
                    }
                    Registration::Waiting
                }
            },
        }
    }
}

/// Future returned by [`Deferred::wait`] and by awaiting a [`Deferred`].
///
/// Polling drives the parked producer future, if any.
#[must_use = "futures do nothing unless polled"]
pub struct Wait<T> {
    deferred: Deferred<T>,
    driver: Option<Driver<T>>,
}

impl<T: QueryOutput> Future for Wait<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.driver.is_none() {
            match this.deferred.register(cx.waker()) {
                Registration::Settled(outcome) => return Poll::Ready(outcome),
                Registration::Waiting => return Poll::Pending,
                Registration::Driver(driver) => this.driver = Some(driver),
            }
        }

        match this.driver.as_mut().map(|driver| driver.poll_unpin(cx)) {
            Some(Poll::Ready(outcome)) => {
                this.driver = None;
                Poll::Ready(this.deferred.settle(outcome))
            }
            _ => Poll::Pending,
        }
    }
}

impl<T: QueryOutput> IntoFuture for Deferred<T> {
    type Output = Outcome<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Self::IntoFuture {
        Wait {
            deferred: self,
            driver: None,
        }
    }
}

impl<T: QueryOutput> IntoFuture for &Deferred<T> {
    type Output = Outcome<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait()
    }
}

/// One-shot handle that settles a [`Deferred`] created by [`Deferred::pending`].
pub struct Settler<T> {
    deferred: Deferred<T>,
}

impl<T: QueryOutput> Settler<T> {
    /// The deferred result this settler controls.
    pub fn deferred(&self) -> &Deferred<T> {
        &self.deferred
    }

    /// Complete with `value`.
    pub fn resolve(self, value: T) {
        self.deferred.settle(Ok(value));
    }

    /// Fail with `error`.
    pub fn reject(self, error: impl Into<LoadError>) {
        self.deferred.settle(Err(error.into()));
    }

    /// Settle from any resolution, including another deferred result or a future.
    pub fn settle(self, resolution: impl Into<Resolution<T>>) {
        self.deferred.fulfill(resolution.into());
    }
}

impl<T> fmt::Debug for Settler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settler")
            .field("deferred", &self.deferred)
            .finish()
    }
}
