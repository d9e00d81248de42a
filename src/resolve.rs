//! Settlement capabilities and the unwrapping procedure.
//!
//! Whatever a continuation produces is fed through [`unwrap_into`]: plain
//! values settle the target, deferred values and foreign [`Thenable`]s are
//! followed until a plain value or a rejection comes out. Following a chain of
//! thenables that settle synchronously does not grow the stack, each hop is a
//! turn of one loop.
use crate::{deferred::Deferred, panic_reason, Error};
use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

/// What a continuation hands back: something to settle with, or a reason to
/// reject with directly.
pub type Outcome<T, E> = Result<Resolution<T, E>, E>;

/// A value a deferred value can be resolved with.
pub enum Resolution<T, E> {
    /// Fulfills the target as is.
    Value(T),
    /// Adopts the eventual state of another deferred value.
    Deferred(Deferred<T, E>),
    /// Adopts the eventual state of a foreign deferred-like object.
    Thenable(Box<dyn Thenable<T, E>>),
}

impl<T, E> From<Deferred<T, E>> for Resolution<T, E> {
    fn from(deferred: Deferred<T, E>) -> Self {
        Resolution::Deferred(deferred)
    }
}

impl<T: Debug, E> Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Resolution::Deferred(d) => f.debug_tuple("Deferred").field(&d.status()).finish(),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

/// Anything exposing a chaining member.
///
/// `then` receives one-shot capabilities: whichever of `resolve` or `reject`
/// is called first wins, later calls are dropped. Returning `Err` (or
/// panicking) rejects the target, unless one of the capabilities already ran.
pub trait Thenable<T, E> {
    fn then(self: Box<Self>, resolve: Resolver<T, E>, reject: Rejecter<T, E>) -> Result<(), E>;
}

enum Capability<T, E> {
    /// Bound to a deferred value by its constructor.
    Direct(Deferred<T, E>),
    /// Handed to a thenable while unwrapping.
    Once(Rc<Unwrap<T, E>>),
}

impl<T, E> Clone for Capability<T, E> {
    fn clone(&self) -> Self {
        match self {
            Capability::Direct(target) => Capability::Direct(target.clone()),
            Capability::Once(unwrap) => Capability::Once(unwrap.clone()),
        }
    }
}

/// The fulfilling half of a pair of settlement capabilities.
pub struct Resolver<T, E>(Capability<T, E>);

/// The rejecting half of a pair of settlement capabilities.
pub struct Rejecter<T, E>(Capability<T, E>);

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Resolver(self.0.clone())
    }
}

impl<T, E> Clone for Rejecter<T, E> {
    fn clone(&self) -> Self {
        Rejecter(self.0.clone())
    }
}

impl<T, E> Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Resolver")
    }
}

impl<T, E> Debug for Rejecter<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rejecter")
    }
}

/// One hop of the unwrapping procedure.
struct Unwrap<T, E> {
    target: Deferred<T, E>,
    called: Cell<bool>,
    /// Set while the thenable's `then` is on the stack.
    in_call: Cell<bool>,
    /// A resolution handed back synchronously, picked up by the loop in
    /// [`unwrap_into`] instead of recursing.
    bounced: RefCell<Option<Resolution<T, E>>>,
}

impl<T, E> Resolver<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub(crate) fn direct(target: Deferred<T, E>) -> Self {
        Resolver(Capability::Direct(target))
    }

    /// Fulfills with a plain value.
    pub fn resolve(&self, value: T) {
        self.resolve_with(Resolution::Value(value))
    }

    /// Resolves with anything, following deferred values and thenables.
    pub fn resolve_with(&self, resolution: impl Into<Resolution<T, E>>) {
        match &self.0 {
            Capability::Direct(target) => {
                if target.is_pending() {
                    unwrap_into(target, resolution.into());
                }
            }
            Capability::Once(unwrap) => {
                if unwrap.called.replace(true) {
                    log::debug!("ignoring repeated settlement from a thenable");
                    return;
                }
                if unwrap.in_call.get() {
                    *unwrap.bounced.borrow_mut() = Some(resolution.into());
                } else {
                    unwrap_into(&unwrap.target, resolution.into());
                }
            }
        }
    }
}

impl<T, E> Rejecter<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub(crate) fn direct(target: Deferred<T, E>) -> Self {
        Rejecter(Capability::Direct(target))
    }

    /// Rejects with `reason`. Reasons are never unwrapped.
    pub fn reject(&self, reason: E) {
        match &self.0 {
            Capability::Direct(target) => target.settle_rejected(reason),
            Capability::Once(unwrap) => {
                if unwrap.called.replace(true) {
                    log::debug!("ignoring repeated settlement from a thenable");
                    return;
                }
                unwrap.target.settle_rejected(reason);
            }
        }
    }
}

/// Settles `target` with `resolution`, following deferred values and
/// thenables until a plain value or a rejection is reached.
pub(crate) fn unwrap_into<T, E>(target: &Deferred<T, E>, resolution: Resolution<T, E>)
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    let mut next = resolution;
    loop {
        let thenable: Box<dyn Thenable<T, E>> = match next {
            Resolution::Value(value) => {
                target.settle_fulfilled(value);
                return;
            }
            Resolution::Deferred(deferred) => {
                if deferred.ptr_eq(target) {
                    log::debug!("deferred value resolved with itself");
                    target.settle_rejected(E::from(Error::ChainingCycle));
                    return;
                }
                Box::new(deferred)
            }
            Resolution::Thenable(thenable) => thenable,
        };

        let unwrap = Rc::new(Unwrap {
            target: target.clone(),
            called: Cell::new(false),
            in_call: Cell::new(true),
            bounced: RefCell::new(None),
        });
        let resolve = Resolver(Capability::Once(unwrap.clone()));
        let reject = Rejecter(Capability::Once(unwrap.clone()));
        let result = catch_unwind(AssertUnwindSafe(move || thenable.then(resolve, reject)))
            .unwrap_or_else(|payload| Err(E::from(panic_reason(payload))));
        unwrap.in_call.set(false);

        if let Err(reason) = result {
            if !unwrap.called.replace(true) {
                target.settle_rejected(reason);
                return;
            }
            log::debug!("ignoring thenable failure after it already settled");
        }
        let bounced = unwrap.bounced.borrow_mut().take();
        match bounced {
            Some(bounced) => next = bounced,
            None => return,
        }
    }
}

impl<T, E> Thenable<T, E> for Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    fn then(self: Box<Self>, resolve: Resolver<T, E>, reject: Rejecter<T, E>) -> Result<(), E> {
        Deferred::then(
            &*self,
            move |value| {
                resolve.resolve(value);
                Ok(Resolution::Value(()))
            },
            move |reason| {
                reject.reject(reason);
                Ok(Resolution::Value(()))
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Deferred, Error, MicrotaskQueue};

    /// Settles synchronously, over and over, then fails.
    struct Misbehaving;

    impl Thenable<i32, Error> for Misbehaving {
        fn then(
            self: Box<Self>,
            resolve: Resolver<i32, Error>,
            reject: Rejecter<i32, Error>,
        ) -> Result<(), Error> {
            resolve.resolve(1);
            resolve.resolve(2);
            reject.reject(Error::rejected("late"));
            Err(Error::rejected("thrown"))
        }
    }

    /// Resolves with another `Nested` until the depth runs out.
    struct Nested(u32);

    impl Thenable<u32, Error> for Nested {
        fn then(
            self: Box<Self>,
            resolve: Resolver<u32, Error>,
            _reject: Rejecter<u32, Error>,
        ) -> Result<(), Error> {
            match self.0 {
                0 => resolve.resolve(0),
                n => resolve.resolve_with(Resolution::Thenable(Box::new(Nested(n - 1)))),
            }
            Ok(())
        }
    }

    struct Throws;

    impl Thenable<i32, Error> for Throws {
        fn then(
            self: Box<Self>,
            _: Resolver<i32, Error>,
            _: Rejecter<i32, Error>,
        ) -> Result<(), Error> {
            Err(Error::rejected("boom"))
        }
    }

    struct Panics;

    impl Thenable<i32, Error> for Panics {
        fn then(
            self: Box<Self>,
            _: Resolver<i32, Error>,
            _: Rejecter<i32, Error>,
        ) -> Result<(), Error> {
            panic!("thenable exploded")
        }
    }

    /// Keeps its capabilities for later.
    type Capabilities = (Resolver<i32, Error>, Rejecter<i32, Error>);
    struct Stash(Rc<RefCell<Option<Capabilities>>>);

    impl Thenable<i32, Error> for Stash {
        fn then(
            self: Box<Self>,
            resolve: Resolver<i32, Error>,
            reject: Rejecter<i32, Error>,
        ) -> Result<(), Error> {
            *self.0.borrow_mut() = Some((resolve, reject));
            Ok(())
        }
    }

    #[test]
    fn test_first_settlement_wins() {
        let queue = MicrotaskQueue::new();
        let d = Deferred::<i32, Error>::resolve_with(
            &queue.handle(),
            Resolution::Thenable(Box::new(Misbehaving)),
        );
        assert_eq!(d.peek(), Some(Ok(1)));
    }

    #[test]
    fn test_deep_synchronous_thenables_do_not_recurse() {
        let queue = MicrotaskQueue::new();
        let d = Deferred::<u32, Error>::resolve_with(
            &queue.handle(),
            Resolution::Thenable(Box::new(Nested(200_000))),
        );
        assert_eq!(d.peek(), Some(Ok(0)));
    }

    #[test]
    fn test_thenable_error_rejects() {
        let queue = MicrotaskQueue::new();
        let d = Deferred::<i32, Error>::resolve_with(
            &queue.handle(),
            Resolution::Thenable(Box::new(Throws)),
        );
        assert_eq!(d.peek(), Some(Err(Error::rejected("boom"))));
    }

    #[test]
    fn test_thenable_panic_rejects() {
        let queue = MicrotaskQueue::new();
        let d = Deferred::<i32, Error>::resolve_with(
            &queue.handle(),
            Resolution::Thenable(Box::new(Panics)),
        );
        assert_eq!(d.peek(), Some(Err(Error::Panicked("thenable exploded".into()))));
    }

    #[test]
    fn test_thenable_settling_later() {
        let queue = MicrotaskQueue::new();
        let slot = Rc::new(RefCell::new(None));
        let d = Deferred::<i32, Error>::resolve_with(
            &queue.handle(),
            Resolution::Thenable(Box::new(Stash(slot.clone()))),
        );
        assert!(d.is_pending());

        let (resolve, reject) = slot.borrow_mut().take().unwrap();
        reject.reject(Error::rejected("first"));
        resolve.resolve(7);
        assert_eq!(d.peek(), Some(Err(Error::rejected("first"))));
    }

    #[test]
    fn test_resolving_with_itself_is_a_cycle() {
        let queue = MicrotaskQueue::new();
        let defer = Deferred::<i32, Error>::defer(&queue.handle());
        defer.resolver.resolve_with(defer.promise.clone());
        assert_eq!(defer.promise.peek(), Some(Err(Error::ChainingCycle)));
    }

    #[test]
    fn test_resolving_with_pending_deferred_waits() {
        let queue = MicrotaskQueue::new();
        let scheduler = queue.handle();
        let inner = Deferred::<i32, Error>::defer(&scheduler);
        let outer = Deferred::<i32, Error>::resolve_with(&scheduler, inner.promise.clone());
        queue.run_until_stalled();
        assert!(outer.is_pending());

        inner.resolver.resolve(5);
        queue.run_until_stalled();
        assert_eq!(outer.peek(), Some(Ok(5)));
    }
}
