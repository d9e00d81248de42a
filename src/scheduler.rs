//! Where continuations run.
//!
//! A [`Deferred`](crate::Deferred) never invokes a handler from inside the
//! call that registered or settled it. It hands a [`Task`] to the scheduler it
//! was built on instead, and the scheduler runs it after the current turn.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::rc::Rc;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Shared handle to a scheduler, cloned into every deferred value built on it.
pub type SchedulerRef = Rc<dyn Scheduler>;

/// Runs tasks after the current synchronous turn, in the order they were
/// scheduled.
pub trait Scheduler {
    fn schedule(&self, task: Task);
}

/// A manually stepped FIFO task queue.
///
/// Nothing runs until the owner calls [`run_once`](Self::run_once) or
/// [`run_until_stalled`](Self::run_until_stalled), which makes it the
/// scheduler of choice for deterministic tests.
///
/// # Examples
///
/// ```
/// use deferred_value::{MicrotaskQueue, Scheduler};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let queue = MicrotaskQueue::new();
/// let hits = Rc::new(Cell::new(0));
/// let h = hits.clone();
/// queue.schedule(Box::new(move || h.set(h.get() + 1)));
/// assert_eq!(hits.get(), 0);
/// assert_eq!(queue.run_until_stalled(), 1);
/// assert_eq!(hits.get(), 1);
/// ```
#[derive(Clone, Default)]
pub struct MicrotaskQueue {
    tasks: Rc<RefCell<VecDeque<Task>>>,
}

impl Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("queued", &self.len())
            .finish()
    }
}

impl MicrotaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A type-erased handle to this queue, suitable for the deferred value
    /// constructors.
    pub fn handle(&self) -> SchedulerRef {
        Rc::new(self.clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Runs the oldest queued task. Returns `false` if there was none.
    pub fn run_once(&self) -> bool {
        // The borrow must end before the task runs, the task may schedule more.
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until the queue is empty, including tasks scheduled by the
    /// tasks being run. Returns how many ran.
    pub fn run_until_stalled(&self) -> usize {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        log::trace!("microtask queue stalled after {} tasks", ran);
        ran
    }
}

impl Scheduler for MicrotaskQueue {
    fn schedule(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }
}

/// Dispatches onto a `futures` [`LocalPool`](futures::executor::LocalPool).
#[cfg(feature = "local-pool")]
impl Scheduler for futures::executor::LocalSpawner {
    fn schedule(&self, task: Task) {
        use futures::task::LocalSpawnExt;
        if let Err(err) = self.spawn_local(async move { task() }) {
            log::warn!("local pool refused a deferred task: {}", err);
        }
    }
}
