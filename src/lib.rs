//! Single-assignment deferred values.
//!
//! A [`Deferred`] starts out pending and settles exactly once, either
//! fulfilled with a value or rejected with a reason. Continuations registered
//! through [`Deferred::then`] never run inline: they are handed to the
//! [`Scheduler`] the deferred value was created on and run once the current
//! turn unwinds.
//!
//! # Examples
//!
//! ```
//! use deferred_value::{Deferred, Error, MicrotaskQueue, Resolution};
//!
//! let queue = MicrotaskQueue::new();
//! let scheduler = queue.handle();
//!
//! let doubled = Deferred::<i32, Error>::resolve(&scheduler, 21)
//!     .then(|v| Ok(Resolution::Value(v * 2)), Err);
//! assert!(doubled.is_pending());
//!
//! queue.run_until_stalled();
//! assert_eq!(doubled.peek(), Some(Ok(42)));
//! ```
pub mod combinator;
pub mod deferred;
pub mod resolve;
pub mod scheduler;

pub use deferred::{Defer, Deferred, Status};
pub use resolve::{Outcome, Rejecter, Resolution, Resolver, Thenable};
pub use scheduler::{MicrotaskQueue, Scheduler, SchedulerRef, Task};

use thiserror::Error;

/// Reasons produced by the engine itself.
///
/// Callers pick their own rejection type `E`; it only has to be able to carry
/// these via `From<Error>`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Chaining cycle detected for deferred value")]
    ChainingCycle,
    #[error("callback panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Rejected(String),
}

impl Error {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Error::Rejected(reason.into())
    }
}

/// Turns a caught panic payload into an [`Error::Panicked`].
pub(crate) fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> Error {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    log::warn!("captured panic in deferred callback: {}", message);
    Error::Panicked(message)
}
