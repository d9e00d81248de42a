//! The deferred value itself.
//!
//! A [`Deferred`] is a shared handle; clones observe the same container. It
//! can be chained with [`then`](Deferred::then) and friends, or awaited, since
//! it also implements [`Future`].
use crate::resolve::{unwrap_into, Outcome, Rejecter, Resolution, Resolver};
use crate::scheduler::SchedulerRef;
use crate::{panic_reason, Error};
use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Fulfilled,
    Rejected,
}

enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

/// A continuation waiting on a pending deferred value.
trait Reaction<T, E> {
    /// Schedules the continuation with the settled payload.
    fn react(self: Box<Self>, settled: Result<T, E>, scheduler: &SchedulerRef);

    /// Gives up the continuation, handing back the deferred value it would
    /// have settled.
    fn abandon(self: Box<Self>) -> Box<dyn Teardown>;
}

/// A type-erased deferred value being dropped with its chain.
trait Teardown {
    /// Takes the reactions out of the container if this is the last handle
    /// to it, so dropping the handle does not recurse into them.
    fn detach(&mut self) -> Vec<Box<dyn Teardown>>;
}

/// The handler pair of one `then` call and the deferred value that receives
/// its result.
struct Then<U, E, F, G> {
    on_fulfilled: F,
    on_rejected: G,
    downstream: Deferred<U, E>,
}

impl<T, U, E, F, G> Reaction<T, E> for Then<U, E, F, G>
where
    T: 'static,
    U: Clone + 'static,
    E: Clone + From<Error> + 'static,
    F: FnOnce(T) -> Outcome<U, E> + 'static,
    G: FnOnce(E) -> Outcome<U, E> + 'static,
{
    fn react(self: Box<Self>, settled: Result<T, E>, scheduler: &SchedulerRef) {
        let Then {
            on_fulfilled,
            on_rejected,
            downstream,
        } = *self;
        scheduler.schedule(Box::new(move || {
            let produced = catch_unwind(AssertUnwindSafe(move || match settled {
                Ok(value) => on_fulfilled(value),
                Err(reason) => on_rejected(reason),
            }))
            .unwrap_or_else(|payload| Err(E::from(panic_reason(payload))));
            match produced {
                Ok(resolution) => unwrap_into(&downstream, resolution),
                Err(reason) => downstream.settle_rejected(reason),
            }
        }));
    }

    fn abandon(self: Box<Self>) -> Box<dyn Teardown> {
        Box::new(self.downstream)
    }
}

struct Inner<T, E> {
    state: State<T, E>,
    /// Drained once, in registration order, on settlement.
    reactions: Vec<Box<dyn Reaction<T, E>>>,
    wakers: Vec<Waker>,
}

impl<T, E> Drop for Inner<T, E> {
    /// An abandoned pending chain owns its downstream values through
    /// `reactions`; take it apart with a worklist instead of recursing.
    fn drop(&mut self) {
        let mut pending: Vec<Box<dyn Teardown>> =
            self.reactions.drain(..).map(|reaction| reaction.abandon()).collect();
        while let Some(mut next) = pending.pop() {
            pending.extend(next.detach());
        }
    }
}

impl<T, E> Teardown for Deferred<T, E> {
    fn detach(&mut self) -> Vec<Box<dyn Teardown>> {
        if Rc::strong_count(&self.inner) != 1 {
            return vec![];
        }
        let reactions = match self.inner.try_borrow_mut() {
            Ok(mut inner) => std::mem::take(&mut inner.reactions),
            Err(_) => vec![],
        };
        reactions.into_iter().map(|reaction| reaction.abandon()).collect()
    }
}

/// A single-assignment container that settles once, either fulfilled with a
/// `T` or rejected with an `E`.
///
/// # Examples
///
/// ```
/// use deferred_value::{Deferred, Error, MicrotaskQueue};
///
/// let queue = MicrotaskQueue::new();
/// let d = Deferred::<&str, Error>::new(&queue.handle(), |resolve, _reject| {
///     resolve.resolve("🍓");
///     Ok(())
/// });
/// let seen = d.map(|v| v.len());
/// queue.run_until_stalled();
/// assert_eq!(seen.peek(), Some(Ok(4)));
/// ```
pub struct Deferred<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
    scheduler: SchedulerRef,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T: Debug, E: Debug> Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        let mut s = f.debug_struct("Deferred");
        match &inner.state {
            State::Pending => s.field("status", &Status::Pending),
            State::Fulfilled(v) => s.field("value", v),
            State::Rejected(e) => s.field("reason", e),
        };
        s.finish()
    }
}

/// A deferred value together with its settlement capabilities, for producers
/// that settle outside a setup routine.
#[derive(Debug)]
pub struct Defer<T, E> {
    pub promise: Deferred<T, E>,
    pub resolver: Resolver<T, E>,
    pub rejecter: Rejecter<T, E>,
}

impl<T, E> Deferred<T, E> {
    pub fn status(&self) -> Status {
        match self.inner.borrow().state {
            State::Pending => Status::Pending,
            State::Fulfilled(_) => Status::Fulfilled,
            State::Rejected(_) => Status::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    pub fn is_fulfilled(&self) -> bool {
        self.status() == Status::Fulfilled
    }

    pub fn is_rejected(&self) -> bool {
        self.status() == Status::Rejected
    }

    /// Whether both handles point at the same container.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// The scheduler continuations of this value are dispatched on.
    pub fn scheduler(&self) -> &SchedulerRef {
        &self.scheduler
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub(crate) fn pending(scheduler: &SchedulerRef) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                reactions: vec![],
                wakers: vec![],
            })),
            scheduler: scheduler.clone(),
        }
    }

    /// Creates a pending deferred value and runs `setup` right away with its
    /// settlement capabilities.
    ///
    /// If `setup` returns `Err` or panics, the value is rejected with that
    /// reason, unless `setup` settled it first.
    pub fn new<S>(scheduler: &SchedulerRef, setup: S) -> Self
    where
        S: FnOnce(Resolver<T, E>, Rejecter<T, E>) -> Result<(), E>,
    {
        let deferred = Self::pending(scheduler);
        let resolver = Resolver::direct(deferred.clone());
        let rejecter = Rejecter::direct(deferred.clone());
        let fallback = rejecter.clone();
        let result = catch_unwind(AssertUnwindSafe(move || setup(resolver, rejecter)))
            .unwrap_or_else(|payload| Err(E::from(panic_reason(payload))));
        if let Err(reason) = result {
            fallback.reject(reason);
        }
        deferred
    }

    /// A deferred value fulfilled with `value`.
    pub fn resolve(scheduler: &SchedulerRef, value: T) -> Self {
        Self::resolve_with(scheduler, Resolution::Value(value))
    }

    /// A deferred value resolved with `resolution`, adopting the state of a
    /// deferred value or thenable.
    pub fn resolve_with(scheduler: &SchedulerRef, resolution: impl Into<Resolution<T, E>>) -> Self {
        Self::new(scheduler, move |resolve, _| {
            resolve.resolve_with(resolution);
            Ok(())
        })
    }

    /// A deferred value rejected with `reason`.
    pub fn reject(scheduler: &SchedulerRef, reason: E) -> Self {
        Self::new(scheduler, move |_, reject| {
            reject.reject(reason);
            Ok(())
        })
    }

    /// A pending deferred value and the capabilities that settle it.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred_value::{Deferred, Error, MicrotaskQueue};
    ///
    /// let queue = MicrotaskQueue::new();
    /// let defer = Deferred::<String, Error>::defer(&queue.handle());
    /// assert!(defer.promise.is_pending());
    /// defer.resolver.resolve("Hi".into());
    /// assert_eq!(defer.promise.peek(), Some(Ok("Hi".to_string())));
    /// ```
    pub fn defer(scheduler: &SchedulerRef) -> Defer<T, E> {
        let promise = Self::pending(scheduler);
        Defer {
            resolver: Resolver::direct(promise.clone()),
            rejecter: Rejecter::direct(promise.clone()),
            promise,
        }
    }

    /// The settled payload, if any.
    pub fn peek(&self) -> Option<Result<T, E>> {
        match &self.inner.borrow().state {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    pub(crate) fn settle_fulfilled(&self, value: T) {
        let (reactions, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                return;
            }
            inner.state = State::Fulfilled(value.clone());
            (
                std::mem::take(&mut inner.reactions),
                std::mem::take(&mut inner.wakers),
            )
        };
        log::trace!("deferred value fulfilled, {} waiters", reactions.len());
        for reaction in reactions {
            reaction.react(Ok(value.clone()), &self.scheduler);
        }
        for waker in wakers {
            waker.wake()
        }
    }

    pub(crate) fn settle_rejected(&self, reason: E) {
        let (reactions, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                return;
            }
            inner.state = State::Rejected(reason.clone());
            (
                std::mem::take(&mut inner.reactions),
                std::mem::take(&mut inner.wakers),
            )
        };
        log::trace!("deferred value rejected, {} waiters", reactions.len());
        for reaction in reactions {
            reaction.react(Err(reason.clone()), &self.scheduler);
        }
        for waker in wakers {
            waker.wake()
        }
    }

    /// Registers a pair of handlers and returns the deferred value that
    /// receives whichever one runs.
    ///
    /// Exactly one handler runs, once, after the current turn, even if this
    /// value is already settled. Its `Ok` result is unwrapped into the
    /// returned value, its `Err` rejects it directly.
    pub fn then<U, F, G>(&self, on_fulfilled: F, on_rejected: G) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Outcome<U, E> + 'static,
        G: FnOnce(E) -> Outcome<U, E> + 'static,
    {
        let downstream = Deferred::pending(&self.scheduler);
        let reaction: Box<dyn Reaction<T, E>> = Box::new(Then {
            on_fulfilled,
            on_rejected,
            downstream: downstream.clone(),
        });
        match self.peek() {
            Some(settled) => reaction.react(settled, &self.scheduler),
            None => self.inner.borrow_mut().reactions.push(reaction),
        }
        downstream
    }

    /// `then` with the failure passed through.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Outcome<U, E> + 'static,
    {
        self.then(on_fulfilled, Err)
    }

    /// `then` with a plain success mapping.
    pub fn map<U, F>(&self, f: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.then(move |value| Ok(Resolution::Value(f(value))), Err)
    }

    /// `then` with the value passed through, handling failures only.
    pub fn catch<G>(&self, on_rejected: G) -> Deferred<T, E>
    where
        G: FnOnce(E) -> Outcome<T, E> + 'static,
    {
        self.then(|value| Ok(Resolution::Value(value)), on_rejected)
    }

    /// `then` with both handlers defaulted.
    pub fn forward(&self) -> Deferred<T, E> {
        self.then(|value| Ok(Resolution::Value(value)), Err)
    }

    /// Runs `on_finally` on settlement, waits for what it returns, then
    /// settles the result exactly like this value.
    ///
    /// A failure from `on_finally` (or from what it returns) replaces the
    /// original outcome.
    pub fn finally<F>(&self, on_finally: F) -> Deferred<T, E>
    where
        F: FnOnce() -> Outcome<(), E> + 'static,
    {
        let callback = Rc::new(Cell::new(Some(on_finally)));
        let (on_ok, on_err) = (callback.clone(), callback);
        let (scheduler_ok, scheduler_err) = (self.scheduler.clone(), self.scheduler.clone());
        self.then(
            move |value| {
                let waited = run_finally(&scheduler_ok, &on_ok)?;
                Ok(Resolution::Deferred(
                    waited.then(move |_| Ok(Resolution::Value(value)), Err),
                ))
            },
            move |reason| {
                let waited = run_finally(&scheduler_err, &on_err)?;
                Ok(Resolution::Deferred(waited.then(move |_| Err(reason), Err)))
            },
        )
    }
}

fn run_finally<E, F>(
    scheduler: &SchedulerRef,
    callback: &Cell<Option<F>>,
) -> Result<Deferred<(), E>, E>
where
    E: Clone + From<Error> + 'static,
    F: FnOnce() -> Outcome<(), E>,
{
    let resolution = match callback.take() {
        Some(f) => f()?,
        None => Resolution::Value(()),
    };
    Ok(Deferred::resolve_with(scheduler, resolution))
}

impl<T, E> Future for Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(settled) = self.peek() {
            return Poll::Ready(settled);
        }
        let mut inner = self.inner.borrow_mut();
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
