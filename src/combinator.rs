//! Combining many deferred values into one.
//!
//! Both combinators only use the public chaining API of [`Deferred`].
use crate::deferred::{Defer, Deferred};
use crate::resolve::{Resolution, Resolver};
use crate::scheduler::SchedulerRef;
use crate::Error;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Result slots of an `all` call.
struct Join<T, E> {
    slots: RefCell<Vec<Option<T>>>,
    filled: Cell<usize>,
    resolver: Resolver<Vec<T>, E>,
}

impl<T, E> Join<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    fn fill(&self, index: usize, value: T) {
        let values = {
            let mut slots = self.slots.borrow_mut();
            slots[index] = Some(value);
            self.filled.set(self.filled.get() + 1);
            if self.filled.get() < slots.len() {
                return;
            }
            slots.drain(..).flatten().collect::<Vec<T>>()
        };
        self.resolver.resolve(values);
    }
}

/// Turns an input item into something that can be chained.
fn chainable<T, E>(scheduler: &SchedulerRef, item: Resolution<T, E>) -> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    match item {
        Resolution::Deferred(deferred) => deferred,
        other => Deferred::resolve_with(scheduler, other),
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Fulfills with every item's value, in input order, once all of them
    /// fulfilled. Rejects with the first rejection.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred_value::{Deferred, Error, MicrotaskQueue, Resolution};
    ///
    /// let queue = MicrotaskQueue::new();
    /// let scheduler = queue.handle();
    /// let joined = Deferred::<i32, Error>::all(&scheduler, vec![
    ///     Resolution::Value(1),
    ///     Resolution::Deferred(Deferred::resolve(&scheduler, 2)),
    ///     Resolution::Value(3),
    /// ]);
    /// queue.run_until_stalled();
    /// assert_eq!(joined.peek(), Some(Ok(vec![1, 2, 3])));
    /// ```
    pub fn all<I>(scheduler: &SchedulerRef, items: I) -> Deferred<Vec<T>, E>
    where
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        let items: Vec<_> = items.into_iter().collect();
        let Defer {
            promise,
            resolver,
            rejecter,
        } = Deferred::defer(scheduler);
        if items.is_empty() {
            resolver.resolve(vec![]);
            return promise;
        }

        let join = Rc::new(Join {
            slots: RefCell::new(vec![None; items.len()]),
            filled: Cell::new(0),
            resolver,
        });
        for (index, item) in items.into_iter().enumerate() {
            match item {
                Resolution::Value(value) => join.fill(index, value),
                other => {
                    let join = join.clone();
                    let rejecter = rejecter.clone();
                    chainable(scheduler, other).then(
                        move |value| {
                            join.fill(index, value);
                            Ok(Resolution::Value(()))
                        },
                        move |reason| {
                            rejecter.reject(reason);
                            Ok(Resolution::Value(()))
                        },
                    );
                }
            }
        }
        promise
    }

    /// Settles like whichever item settles first. A plain value settles it on
    /// the spot; an empty input never settles.
    pub fn race<I>(scheduler: &SchedulerRef, items: I) -> Deferred<T, E>
    where
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        let Defer {
            promise,
            resolver,
            rejecter,
        } = Deferred::defer(scheduler);
        for item in items {
            match item {
                Resolution::Value(value) => resolver.resolve(value),
                other => {
                    let resolver = resolver.clone();
                    let rejecter = rejecter.clone();
                    chainable(scheduler, other).then(
                        move |value| {
                            resolver.resolve(value);
                            Ok(Resolution::Value(()))
                        },
                        move |reason| {
                            rejecter.reject(reason);
                            Ok(Resolution::Value(()))
                        },
                    );
                }
            }
        }
        promise
    }
}
